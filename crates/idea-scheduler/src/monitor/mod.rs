//! Keeps the job cache in sync with the batch scheduler and feeds provisioning queues.
//!
//! Notifications about jobs (`job_queued`, `job_modified`, `job_running`) only record a pending
//! update. The scheduler is queried later from the submission loop, so a slow scheduler never
//! blocks whoever reports the update. A second loop consumes job lifecycle events sent by
//! compute nodes.
pub mod updates;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cache::JobFilter;
use crate::common::{Map, Set};
use crate::context::SchedulerContext;
use crate::events::{JobEventSource, JobLifecycleEvent};
use crate::get_or_continue;
use crate::job::{Job, JobId, JobState};
use crate::monitor::updates::PendingUpdates;
use crate::profiles::QueueProfileRegistry;
use crate::queue_profile::QueueProfile;
use crate::scheduler::{JOB_GROUP_RESOURCE, ListJobsRequest};

const RECONCILED_STATES: [JobState; 3] = [JobState::Queued, JobState::Held, JobState::Running];

pub struct JobMonitor {
    inner: Arc<MonitorInner>,
    tasks: Option<(CancellationToken, Vec<JoinHandle<()>>)>,
}

impl JobMonitor {
    pub fn new(
        ctx: SchedulerContext,
        registry: Arc<QueueProfileRegistry>,
        events: Arc<dyn JobEventSource>,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                ctx,
                registry,
                events,
                queued: Default::default(),
                modified: Default::default(),
                running: Default::default(),
                wakeup: Notify::new(),
            }),
            tasks: None,
        }
    }

    pub fn job_queued(&self, job: Job) {
        self.inner.queued.add(job);
        self.inner.wakeup.notify_one();
    }

    pub fn job_modified(&self, job: Job) {
        self.inner.modified.add(job);
    }

    pub fn job_running(&self, job: Job) {
        self.inner.job_running(job);
    }

    pub fn job_status_update(&self, job: &Job) {
        self.inner.job_status_update(job);
    }

    pub fn job_finished(&self, job: Job) {
        self.inner.job_finished(job);
    }

    pub fn is_running(&self) -> bool {
        self.tasks.is_some()
    }

    /// Synchronizes the job cache with the scheduler, marks the cache ready and spawns the
    /// submission and execution loops.
    pub async fn start(&mut self) -> crate::Result<()> {
        if self.tasks.is_some() {
            return Ok(());
        }
        let synced = self.inner.reconcile().await?;
        self.inner.ctx.job_cache.set_ready(true);
        log::info!("Job cache synchronized ({synced} job(s)), job monitor starting");

        let token = CancellationToken::new();
        let handles = vec![
            tokio::spawn(submission_loop(self.inner.clone(), token.clone())),
            tokio::spawn(execution_loop(self.inner.clone(), token.clone())),
        ];
        self.tasks = Some((token, handles));
        Ok(())
    }

    pub async fn stop(&mut self) {
        let Some((token, handles)) = self.tasks.take() else {
            return;
        };
        token.cancel();
        for handle in handles {
            if let Err(error) = handle.await {
                log::error!("Job monitor task failed: {error:?}");
            }
        }
        log::info!("Job monitor stopped");
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &MonitorInner {
        &self.inner
    }
}

pub(crate) struct MonitorInner {
    ctx: SchedulerContext,
    registry: Arc<QueueProfileRegistry>,
    events: Arc<dyn JobEventSource>,
    queued: PendingUpdates,
    modified: PendingUpdates,
    running: PendingUpdates,
    wakeup: Notify,
}

impl MonitorInner {
    fn job_running(&self, mut job: Job) {
        let cached = self
            .ctx
            .job_cache
            .update_job_state(&job.job_id, JobState::Running);
        let job = match cached {
            Some(cached) => cached,
            None => {
                job.state = JobState::Running;
                if job.start_time.is_none() {
                    job.start_time = Some(chrono::Utc::now());
                }
                self.ctx.job_cache.sync([job.clone()]);
                job
            }
        };
        self.ctx.metrics.job_started();
        self.ctx.notifier.job_started(&job);
        self.running.add(job);
    }

    fn job_status_update(&self, job: &Job) {
        let Some(host) = job.first_execution_host() else {
            log::debug!("Status update of job {} without execution host", job.log_tag());
            return;
        };
        if !self.ctx.job_cache.add_execution_host(&job.job_id, host.clone()) {
            log::warn!(
                "Status update of job {} that is not in the cache",
                job.log_tag()
            );
        }
    }

    fn job_finished(&self, job: Job) {
        if let Some(queue) = self.registry.provisioning_queue_for(&job.queue) {
            queue.delete(&job.job_id);
        }
        log::debug!("Job {} finished", job.log_tag());
        self.ctx.job_cache.add_finished_job(job);
    }

    /// Fills profile specific values of a job and makes sure the scheduler knows its job group.
    async fn prepare_job(&self, profile: &QueueProfile, job: &mut Job) -> anyhow::Result<()> {
        job.queue_type = Some(profile.name.clone());
        if job.scaling_mode.is_none() {
            job.scaling_mode = profile.scaling_mode;
        }
        job.params.apply_defaults(&profile.default_job_params);

        let prefix = format!("{}-", profile.name);
        let tagged = job
            .job_group
            .as_deref()
            .is_some_and(|group| group.starts_with(&prefix));
        if !tagged {
            let job_group = profile.job_group_for(job);
            self.ctx
                .scheduler
                .modify_job_resources(
                    &job.job_id,
                    vec![(JOB_GROUP_RESOURCE.to_string(), job_group.clone())],
                )
                .await?;
            log::debug!("Job {} assigned to job group {job_group}", job.log_tag());
            job.job_group = Some(job_group);
        }
        Ok(())
    }

    /// Prepares a job, stores it in the cache and offers it to the queue of its profile.
    async fn submit_job(&self, profile: &QueueProfile, mut job: Job, modified: bool) -> bool {
        if job.state.is_finished() {
            self.job_finished(job);
            return false;
        }
        if let Err(error) = self.prepare_job(profile, &mut job).await {
            log::warn!(
                "Cannot prepare job {} for provisioning: {error:?}",
                job.log_tag()
            );
            return false;
        }
        self.ctx.job_cache.sync([job.clone()]);
        // The cache knows about provisioning the scheduler may not report yet
        let job = self.ctx.job_cache.get_active_job(&job.job_id).unwrap_or(job);
        let Some(queue) = self.registry.get_provisioning_queue(&profile.name) else {
            return false;
        };
        if job.is_queued() && !job.provisioned {
            queue.put(&job, modified)
        } else {
            queue.delete(&job.job_id);
            false
        }
    }

    /// Processes the pending updates that are old enough.
    pub(crate) async fn process_pending_updates(&self) {
        let delay = self.ctx.config.monitor.update_delay;

        for job in self.running.take_ready(delay) {
            if let Some(queue) = self.registry.provisioning_queue_for(&job.queue) {
                queue.delete(&job.job_id);
            }
        }

        let mut by_queue: Map<String, Vec<Job>> = Map::new();
        for job in self.queued.take_ready(Duration::ZERO) {
            by_queue.entry(job.queue.clone()).or_default().push(job);
        }
        for (queue, jobs) in by_queue {
            if let Err(error) = self.process_queued(&queue, jobs).await {
                log::error!("Cannot process queued jobs of queue {queue}: {error:?}");
            }
        }

        for job in self.modified.take_ready(delay) {
            if let Err(error) = self.process_modified(job).await {
                log::error!("Cannot process modified job: {error:?}");
            }
        }
    }

    async fn process_queued(&self, queue: &str, updates: Vec<Job>) -> crate::Result<()> {
        let Some(profile) = self.registry.get_by_queue_name(queue).await? else {
            log::debug!("Queue {queue} does not belong to any queue profile");
            self.ctx.job_cache.sync(updates);
            return Ok(());
        };

        let mut resolved: Map<JobId, Job> = updates
            .into_iter()
            .map(|job| (job.job_id.clone(), job))
            .collect();
        let queued_ids = self.resolve_queued_jobs(queue, &mut resolved).await?;

        let mut submitted = 0;
        for job_id in queued_ids {
            let job = get_or_continue!(resolved.remove(&job_id));
            if self.submit_job(&profile, job, false).await {
                submitted += 1;
            }
        }
        for job_id in resolved.keys() {
            log::debug!("Job {job_id} is no longer queued in queue {queue}");
        }
        log::debug!("{submitted} job(s) of queue {queue} submitted for provisioning");
        Ok(())
    }

    /// Lists queued and held jobs of `queue` and resolves the ones missing in `resolved`, first
    /// from the job cache and then from the scheduler, a page at a time. Jobs submitted while
    /// resolving are picked up by listing the queue again. Returns the listed job ids.
    async fn resolve_queued_jobs(
        &self,
        queue: &str,
        resolved: &mut Map<JobId, Job>,
    ) -> crate::Result<Vec<JobId>> {
        let page_size = self.ctx.config.monitor.page_size.max(1);
        let states = [JobState::Queued, JobState::Held];
        let mut vanished: Set<JobId> = Set::new();
        loop {
            let job_ids = self.ctx.scheduler.list_job_ids(queue, &states).await?;
            let mut missing = vec![];
            for job_id in &job_ids {
                if resolved.contains_key(job_id) || vanished.contains(job_id) {
                    continue;
                }
                match self.ctx.job_cache.get_active_job(job_id) {
                    Some(job) => {
                        resolved.insert(job_id.clone(), job);
                    }
                    None => missing.push(job_id.clone()),
                }
            }
            if missing.is_empty() {
                return Ok(job_ids);
            }
            for page in missing.chunks(page_size) {
                let jobs = self
                    .ctx
                    .scheduler
                    .list_jobs(ListJobsRequest {
                        job_ids: page.to_vec(),
                        ..Default::default()
                    })
                    .await?;
                for job in jobs {
                    resolved.insert(job.job_id.clone(), job);
                }
                vanished.extend(page.iter().filter(|id| !resolved.contains_key(*id)).cloned());
            }
        }
    }

    async fn process_modified(&self, mut job: Job) -> crate::Result<()> {
        let current = self.ctx.scheduler.get_job(&job.job_id).await?;
        let Some(job) = current else {
            log::debug!("Modified job {} no longer exists", job.log_tag());
            job.state = JobState::Finished;
            self.job_finished(job);
            return Ok(());
        };
        match self.registry.get_by_queue_name(&job.queue).await? {
            Some(profile) => {
                self.submit_job(&profile, job, true).await;
            }
            None => {
                // The job may have been moved out of a provisioned queue
                for queue in self.registry.provisioning_queues() {
                    queue.delete(&job.job_id);
                }
                self.ctx.job_cache.sync([job]);
            }
        }
        Ok(())
    }

    /// Queries the scheduler for the jobs of every enabled queue profile, updates the job
    /// cache and submits queued jobs. Returns the number of synchronized jobs.
    ///
    /// A queue that cannot be listed is skipped until the next pass.
    pub(crate) async fn reconcile(&self) -> crate::Result<usize> {
        let mut synced = 0;
        for profile in self.registry.list_enabled().await? {
            for queue in &profile.queues {
                let jobs = match self
                    .ctx
                    .scheduler
                    .list_jobs(ListJobsRequest::queue(queue, &RECONCILED_STATES))
                    .await
                {
                    Ok(jobs) => jobs,
                    Err(error) => {
                        log::warn!("Cannot reconcile jobs of queue {queue}: {error:?}");
                        continue;
                    }
                };
                let seen: Set<JobId> = jobs.iter().map(|job| job.job_id.clone()).collect();
                synced += jobs.len();
                for job in jobs {
                    self.submit_job(&profile, job, false).await;
                }
                if let Err(error) = self.finish_vanished_jobs(queue, &seen).await {
                    log::warn!("Cannot reconcile finished jobs of queue {queue}: {error:?}");
                }
            }
        }
        Ok(synced)
    }

    /// Moves cached jobs of `queue` that the scheduler no longer lists into the finished set.
    async fn finish_vanished_jobs(&self, queue: &str, seen: &Set<JobId>) -> crate::Result<()> {
        let cached = self.ctx.job_cache.list_jobs(&JobFilter {
            queue: Some(queue.to_string()),
            ..Default::default()
        });
        for job in cached.into_iter().filter(|job| !seen.contains(&job.job_id)) {
            match self.ctx.scheduler.get_job(&job.job_id).await? {
                Some(current) if !current.state.is_finished() => {
                    self.ctx.job_cache.sync([current]);
                }
                Some(current) => self.job_finished(current),
                None => {
                    let mut job = job;
                    job.state = JobState::Finished;
                    self.job_finished(job);
                }
            }
        }
        Ok(())
    }

    /// Receives one batch of lifecycle events. Every received message is acknowledged, also
    /// when it cannot be processed.
    pub(crate) async fn receive_events(&self) -> anyhow::Result<usize> {
        let config = &self.ctx.config.monitor;
        let messages = self
            .events
            .receive(config.event_batch_size, config.event_wait_time)
            .await?;
        if messages.is_empty() {
            return Ok(0);
        }
        let mut receipts = Vec::with_capacity(messages.len());
        for message in messages {
            if let Err(error) = self.handle_event(&message.body).await {
                log::error!("Cannot process job event {}: {error:?}", message.receipt);
            }
            receipts.push(message.receipt);
        }
        let count = receipts.len();
        self.events.delete(receipts).await?;
        Ok(count)
    }

    async fn handle_event(&self, body: &str) -> crate::Result<()> {
        let event = JobLifecycleEvent::decode(body)?;
        let mut job = event.job().clone();
        if let Some(profile) = self.registry.get_by_queue_name(&job.queue).await? {
            job.queue_type = Some(profile.name);
        }
        match event {
            JobLifecycleEvent::JobStarted { .. } => {
                self.job_running(job.clone());
                self.job_status_update(&job);
            }
            JobLifecycleEvent::JobStatusUpdate { .. } => self.job_status_update(&job),
            JobLifecycleEvent::JobFinished { .. } => {
                job.state = JobState::Finished;
                self.job_finished(job);
            }
        }
        Ok(())
    }
}

async fn submission_loop(inner: Arc<MonitorInner>, token: CancellationToken) {
    let config = &inner.ctx.config.monitor;
    let mut reconcile = tokio::time::interval(config.reconcile_interval);
    reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The initial synchronization was done by `start`
    reconcile.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = inner.wakeup.notified() => {}
            _ = tokio::time::sleep(config.submission_interval) => {}
            _ = reconcile.tick() => {
                match inner.reconcile().await {
                    Ok(count) => log::debug!("Reconciliation synchronized {count} job(s)"),
                    Err(error) => log::error!("Job reconciliation failed: {error:?}"),
                }
            }
        }
        inner.process_pending_updates().await;
    }
    log::debug!("Job submission loop ended");
}

async fn execution_loop(inner: Arc<MonitorInner>, token: CancellationToken) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            result = inner.receive_events() => {
                if let Err(error) = result {
                    log::error!("Cannot receive job events: {error:?}");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(inner.ctx.config.monitor.submission_interval) => {}
                    }
                }
            }
        }
    }
    log::debug!("Job execution loop ended");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::JobMonitor;
    use crate::config::SchedulerConfig;
    use crate::events::{ChannelEventSource, EventSender, JobLifecycleEvent};
    use crate::job::{JobExecutionHost, JobState};
    use crate::profiles::{InMemoryQueueProfileStore, ProfileKey, QueueProfileRegistry};
    use crate::queue_profile::QueueProfile;
    use crate::tests::mocks::TestEnv;
    use crate::tests::utils::{JobBuilder, batch_profile, single_job_profile};

    struct MonitorEnv {
        env: TestEnv,
        registry: Arc<QueueProfileRegistry>,
        monitor: JobMonitor,
        events: Arc<ChannelEventSource>,
        sender: EventSender,
    }

    async fn monitor_env(profiles: Vec<QueueProfile>) -> MonitorEnv {
        monitor_env_with_config(SchedulerConfig::default(), profiles).await
    }

    async fn monitor_env_with_config(
        config: SchedulerConfig,
        profiles: Vec<QueueProfile>,
    ) -> MonitorEnv {
        let env = TestEnv::with_config(config);
        env.ctx.job_cache.set_ready(false);
        let registry = Arc::new(QueueProfileRegistry::new(
            env.ctx.clone(),
            Arc::new(InMemoryQueueProfileStore::default()),
        ));
        for profile in profiles {
            let created = registry.create(profile).await.unwrap();
            registry
                .enable(&ProfileKey::id(&created.queue_profile_id))
                .await
                .unwrap();
        }
        let (events, sender) = ChannelEventSource::new();
        let events = Arc::new(events);
        let monitor = JobMonitor::new(env.ctx.clone(), registry.clone(), events.clone());
        MonitorEnv {
            env,
            registry,
            monitor,
            events,
            sender,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queued_job_is_tagged_and_queued() {
        let menv = monitor_env(vec![single_job_profile("compute", &["normal"])]).await;
        let job = JobBuilder::default().id("1").uid("u1").build();
        menv.env.scheduler.add_job(job.clone());

        menv.monitor.job_queued(job);
        menv.monitor.inner().process_pending_updates().await;

        let queue = menv.registry.get_provisioning_queue("compute").unwrap();
        assert!(queue.contains("1"));
        let cached = menv.env.ctx.job_cache.get_job("1").unwrap();
        assert_eq!(cached.queue_type.as_deref(), Some("compute"));
        assert_eq!(cached.job_group.as_deref(), Some("compute-u1"));
        assert_eq!(
            menv.env.scheduler.job("1").unwrap().job_group.as_deref(),
            Some("compute-u1")
        );
        menv.registry.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn queued_update_resolves_other_queued_jobs() {
        let mut config = SchedulerConfig::default();
        config.monitor.page_size = 2;
        let menv =
            monitor_env_with_config(config, vec![single_job_profile("compute", &["normal"])])
                .await;
        for id in ["1", "2", "3", "4"] {
            menv.env
                .scheduler
                .add_job(JobBuilder::default().id(id).build());
        }
        menv.env
            .scheduler
            .add_job(JobBuilder::default().id("5").queue("other").build());

        menv.monitor
            .job_queued(JobBuilder::default().id("1").build());
        menv.monitor.inner().process_pending_updates().await;

        let queue = menv.registry.get_provisioning_queue("compute").unwrap();
        assert_eq!(queue.get_queue_size(None), 4);
        assert!(!queue.contains("5"));
        assert_eq!(menv.env.ctx.job_cache.active_job_count(), 4);
        menv.registry.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_job_is_not_queued() {
        let menv = monitor_env(vec![single_job_profile("compute", &["normal"])]).await;
        menv.monitor
            .job_queued(JobBuilder::default().id("1").build());
        menv.monitor.inner().process_pending_updates().await;

        let queue = menv.registry.get_provisioning_queue("compute").unwrap();
        assert!(!queue.contains("1"));
        menv.registry.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn running_job_leaves_queue_after_delay() {
        let menv = monitor_env(vec![single_job_profile("compute", &["normal"])]).await;
        let job = JobBuilder::default().id("1").build();
        menv.env.scheduler.add_job(job.clone());
        menv.monitor.job_queued(job.clone());
        menv.monitor.inner().process_pending_updates().await;
        let queue = menv.registry.get_provisioning_queue("compute").unwrap();
        assert!(queue.contains("1"));

        menv.monitor.job_running(job);
        assert_eq!(
            menv.env.ctx.job_cache.get_job("1").unwrap().state,
            JobState::Running
        );
        assert_eq!(menv.env.ctx.metrics.snapshot().jobs_started, 1);

        menv.monitor.inner().process_pending_updates().await;
        assert_eq!(queue.status().size, 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        menv.monitor.inner().process_pending_updates().await;
        assert_eq!(queue.status().size, 0);
        menv.registry.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn held_job_leaves_queue() {
        let menv = monitor_env(vec![single_job_profile("compute", &["normal"])]).await;
        let job = JobBuilder::default().id("1").build();
        menv.env.scheduler.add_job(job.clone());
        menv.monitor.job_queued(job.clone());
        menv.monitor.inner().process_pending_updates().await;

        menv.env.scheduler.set_job_state("1", JobState::Held);
        menv.monitor.job_modified(job);
        tokio::time::sleep(Duration::from_secs(1)).await;
        menv.monitor.inner().process_pending_updates().await;

        let queue = menv.registry.get_provisioning_queue("compute").unwrap();
        assert!(!queue.contains("1"));
        assert_eq!(
            menv.env.ctx.job_cache.get_job("1").unwrap().state,
            JobState::Held
        );
        menv.registry.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_syncs_enabled_profiles() {
        let menv = monitor_env(vec![
            single_job_profile("compute", &["normal"]),
            batch_profile("batch", &["low"], 5),
        ])
        .await;
        menv.env.scheduler.add_job(JobBuilder::default().id("1").build());
        menv.env.scheduler.add_job(
            JobBuilder::default()
                .id("2")
                .queue("low")
                .state(JobState::Running)
                .build(),
        );
        menv.env
            .scheduler
            .add_job(JobBuilder::default().id("3").queue("unmanaged").build());
        menv.env.ctx.job_cache.sync([JobBuilder::default()
            .id("4")
            .queue("low")
            .state(JobState::Running)
            .build()]);

        let synced = menv.monitor.inner().reconcile().await.unwrap();
        assert_eq!(synced, 2);
        let cache = &menv.env.ctx.job_cache;
        assert!(cache.get_active_job("1").is_some());
        assert_eq!(cache.get_active_job("2").unwrap().state, JobState::Running);
        assert!(cache.get_job("3").is_none());
        assert_eq!(cache.get_job("4").unwrap().state, JobState::Finished);
        assert!(cache.get_active_job("4").is_none());
        assert!(
            menv.registry
                .get_provisioning_queue("compute")
                .unwrap()
                .contains("1")
        );
        menv.registry.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_skips_failing_queue() {
        let mut menv = monitor_env(vec![
            batch_profile("batch", &["low"], 5),
            single_job_profile("compute", &["normal"]),
        ])
        .await;
        menv.env
            .scheduler
            .add_job(JobBuilder::default().id("1").queue("low").build());
        menv.env.scheduler.add_job(JobBuilder::default().id("2").build());
        menv.env.ctx.job_cache.sync([JobBuilder::default()
            .id("3")
            .queue("low")
            .state(JobState::Running)
            .build()]);
        menv.env.scheduler.fail_listing("low");

        menv.monitor.start().await.unwrap();
        let cache = &menv.env.ctx.job_cache;
        assert!(cache.is_ready());
        assert!(cache.get_active_job("1").is_none());
        assert!(cache.get_active_job("2").is_some());
        // Jobs of an unlisted queue are not finished
        assert_eq!(cache.get_active_job("3").unwrap().state, JobState::Running);

        menv.env.scheduler.restore_listing("low");
        assert_eq!(menv.monitor.inner().reconcile().await.unwrap(), 2);
        assert!(cache.get_active_job("1").is_some());
        assert!(cache.get_active_job("3").is_none());

        menv.monitor.stop().await;
        menv.registry.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn running_notification_carries_cached_job() {
        let menv = monitor_env(vec![single_job_profile("compute", &["normal"])]).await;
        let mut cached = JobBuilder::default().id("1").job_group("compute-g").build();
        cached.provisioned = true;
        cached.stack_id = Some("stack-1".to_string());
        menv.env.add_jobs([cached]);

        menv.monitor
            .job_running(JobBuilder::default().id("1").build());
        let started = menv.env.notifier.started();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].state, JobState::Running);
        assert!(started[0].provisioned);
        assert_eq!(started[0].stack_id.as_deref(), Some("stack-1"));
        assert_eq!(started[0].job_group.as_deref(), Some("compute-g"));

        // Unknown jobs are taken from the event
        menv.monitor
            .job_running(JobBuilder::default().id("2").build());
        let started = menv.env.notifier.started();
        assert_eq!(started[1].job_id, "2");
        assert!(!started[1].provisioned);
        assert_eq!(
            menv.env.ctx.job_cache.get_job("2").unwrap().state,
            JobState::Running
        );
        menv.registry.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_marks_cache_ready() {
        let mut menv = monitor_env(vec![single_job_profile("compute", &["normal"])]).await;
        menv.env.scheduler.add_job(JobBuilder::default().id("1").build());
        assert!(!menv.env.ctx.job_cache.is_ready());

        menv.monitor.start().await.unwrap();
        assert!(menv.monitor.is_running());
        assert!(menv.env.ctx.job_cache.is_ready());
        assert!(menv.env.ctx.job_cache.get_active_job("1").is_some());

        menv.monitor.stop().await;
        assert!(!menv.monitor.is_running());
        menv.registry.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_events_update_cache() {
        let menv = monitor_env(vec![single_job_profile("compute", &["normal"])]).await;
        let mut job = JobBuilder::default().id("1").build();
        menv.env.add_jobs([job.clone()]);

        job.state = JobState::Running;
        job.execution_hosts.push(JobExecutionHost {
            host: "ip-10-0-0-1".to_string(),
            instance_id: Some("i-123".to_string()),
            instance_type: Some("c5.large".to_string()),
            execution_time: None,
        });
        menv.sender
            .send(&JobLifecycleEvent::JobStarted { job: job.clone() })
            .unwrap();
        menv.sender.send_raw("not an event".to_string());

        let count = menv.monitor.inner().receive_events().await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(menv.events.acknowledged().len(), 2);
        let cached = menv.env.ctx.job_cache.get_job("1").unwrap();
        assert_eq!(cached.state, JobState::Running);
        assert_eq!(cached.execution_hosts.len(), 1);

        menv.sender
            .send(&JobLifecycleEvent::JobFinished { job })
            .unwrap();
        menv.monitor.inner().receive_events().await.unwrap();
        assert!(menv.env.ctx.job_cache.get_active_job("1").is_none());
        assert_eq!(
            menv.env.ctx.job_cache.get_job("1").unwrap().state,
            JobState::Finished
        );
        menv.registry.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn loops_process_updates() {
        let mut menv = monitor_env(vec![single_job_profile("compute", &["normal"])]).await;
        menv.monitor.start().await.unwrap();

        let job = JobBuilder::default().id("1").build();
        menv.env.scheduler.add_job(job.clone());
        menv.monitor.job_queued(job);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(menv.env.ctx.job_cache.get_active_job("1").is_some());

        menv.monitor.stop().await;
        menv.registry.stop().await;
    }
}
