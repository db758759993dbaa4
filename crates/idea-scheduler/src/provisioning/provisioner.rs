//! Consumer of a provisioning queue, turns queued jobs into provisioned capacity.
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::common::timeutils::now_monotonic;
use crate::common::utils::Backoff;
use crate::context::SchedulerContext;
use crate::job::JobId;
use crate::provisioning::error::{ErrorCode, ProvisioningError};
use crate::provisioning::queue::{ProvisioningQueue, QueueError, QueueItem};
use crate::provisioning::util::ProvisioningUtil;

/// Runs the polling task of one provisioning queue.
pub struct JobProvisioner {
    ctx: SchedulerContext,
    queue: Arc<ProvisioningQueue>,
    task: Option<(CancellationToken, JoinHandle<()>)>,
}

impl JobProvisioner {
    pub fn new(ctx: SchedulerContext, queue: Arc<ProvisioningQueue>) -> Self {
        Self {
            ctx,
            queue,
            task: None,
        }
    }

    pub fn queue(&self) -> &Arc<ProvisioningQueue> {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        self.task
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Spawns the polling task. Does nothing if it is already running.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        let token = CancellationToken::new();
        let task = ProvisionerTask {
            ctx: self.ctx.clone(),
            queue: self.queue.clone(),
            token: token.clone(),
        };
        log::info!(
            "Starting job provisioner of queue profile {}",
            self.queue.profile().name
        );
        self.task = Some((token, tokio::spawn(task.run())));
    }

    /// Stops the polling task and waits until it finishes. An in-flight provisioning call is
    /// allowed to complete.
    pub async fn stop(&mut self) {
        let Some((token, handle)) = self.task.take() else {
            return;
        };
        token.cancel();
        if let Err(error) = handle.await {
            log::error!("Job provisioner task failed: {error:?}");
        }
        log::info!(
            "Job provisioner of queue profile {} stopped",
            self.queue.profile().name
        );
    }
}

pub(crate) struct ProvisionerTask {
    pub(crate) ctx: SchedulerContext,
    pub(crate) queue: Arc<ProvisioningQueue>,
    pub(crate) token: CancellationToken,
}

impl ProvisionerTask {
    async fn run(self) {
        let config = &self.ctx.config.provisioning;
        let mut last_purge = now_monotonic();
        while !self.token.is_cancelled() {
            if self.queue.profile().is_batch() {
                for batch in self.drain_batch_queue().await {
                    self.handle_batch(batch).await;
                }
            } else {
                match self.queue.get(config.queue_get_timeout).await {
                    Ok(item) => self.handle_batch(vec![item]).await,
                    Err(QueueError::Empty) => {}
                    Err(QueueError::BlockedByLimits(limit)) => {
                        log::trace!("Queue is blocked by {limit}");
                    }
                }
            }

            if now_monotonic().duration_since(last_purge) >= config.purge_interval {
                let purged = self.queue.purge_deleted();
                if purged > 0 {
                    log::debug!("Purged {purged} deleted job(s) from the queue");
                }
                last_purge = now_monotonic();
            }

            // Throttles the requests sent to the provisioning backend
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(config.provisioning_delay) => {}
            }
        }
        log::debug!(
            "Provisioner of queue profile {} ended",
            self.queue.profile().name
        );
    }

    /// Collects jobs from the queue into per job group batches.
    ///
    /// A batch is complete when the scheduler reports as many queued jobs of the group as were
    /// collected. When the scheduler reports fewer jobs, the batch of that group is returned into
    /// the queue and collected again. Batches that are still incomplete when the batch window
    /// elapses are returned as they are.
    pub(crate) async fn drain_batch_queue(&self) -> Vec<Vec<QueueItem>> {
        let config = &self.ctx.config.provisioning;
        let profile = self.queue.profile();
        let deadline = now_monotonic() + config.batch_window;
        let mut batches: Vec<(String, Vec<QueueItem>)> = vec![];

        loop {
            if self.token.is_cancelled() {
                for (_, items) in batches {
                    self.requeue(items);
                }
                return vec![];
            }
            let now = now_monotonic();
            if now >= deadline {
                if !batches.is_empty() {
                    log::debug!(
                        "Batch window of queue profile {} elapsed, provisioning {} batch(es)",
                        profile.name,
                        batches.len()
                    );
                }
                break;
            }
            let received = match self
                .queue
                .get(config.queue_get_timeout.min(deadline - now))
                .await
            {
                Ok(item) => {
                    let group = item.entry.job_group.clone();
                    match batches.iter_mut().find(|(g, _)| *g == group) {
                        Some((_, items)) => items.push(item),
                        None => batches.push((group, vec![item])),
                    }
                    true
                }
                Err(QueueError::Empty) => false,
                Err(QueueError::BlockedByLimits(_)) => {
                    // Avoid spinning on a blocked queue until the window elapses
                    tokio::time::sleep(config.queue_get_timeout.min(deadline - now)).await;
                    false
                }
            };
            if batches.is_empty() {
                if received {
                    continue;
                }
                return vec![];
            }

            let mut complete = true;
            let mut restarted = false;
            let mut index = 0;
            while index < batches.len() {
                let (group, items) = &batches[index];
                let expected = match self
                    .ctx
                    .scheduler
                    .count_queued_jobs(&profile.queues, group)
                    .await
                {
                    Ok(expected) => expected as usize,
                    Err(error) => {
                        // Keep collecting, the batch window bounds the wait
                        log::warn!("Cannot count queued jobs of job group {group}: {error:?}");
                        complete = false;
                        index += 1;
                        continue;
                    }
                };
                let collected = items.len();
                if expected < collected {
                    log::info!(
                        "Job group {group} changed while collecting its batch (expected: {expected}, collected: {collected}), restarting the batch"
                    );
                    let (_, items) = batches.remove(index);
                    self.requeue(items);
                    complete = false;
                    restarted = true;
                    continue;
                }
                if expected > collected {
                    complete = false;
                }
                index += 1;
            }
            if complete && !batches.is_empty() {
                break;
            }
            if restarted {
                let remaining = deadline.saturating_duration_since(now_monotonic());
                tokio::time::sleep(config.queue_get_timeout.min(remaining)).await;
            }
        }
        batches.into_iter().map(|(_, items)| items).collect()
    }

    fn requeue(&self, items: Vec<QueueItem>) {
        for item in items {
            self.queue.requeue(item.entry);
        }
    }

    async fn handle_batch(&self, mut items: Vec<QueueItem>) {
        if items.is_empty() {
            return;
        }
        if !self.provision_with_retry_backoff(&mut items).await {
            self.requeue(items);
        }
    }

    fn record_failure(&self, job_ids: impl IntoIterator<Item = JobId>, error: &ProvisioningError) {
        let code = error.code();
        for job_id in job_ids {
            self.ctx
                .job_cache
                .set_job_provisioning_error(&job_id, code.as_str(), error.reason());
            self.ctx.metrics.provisioning_failure(code.as_str());
        }
    }

    /// Provisions a batch of jobs of one job group, retrying transient failures.
    ///
    /// Returns false when the jobs should be returned into the queue.
    pub(crate) async fn provision_with_retry_backoff(&self, items: &mut Vec<QueueItem>) -> bool {
        let Some(first) = items.first() else {
            return true;
        };
        let first_id = first.job.job_id.clone();
        let job_group = first.entry.job_group.clone();
        let config = &self.ctx.config.provisioning;
        let backoff = Backoff::new(
            config.retry_backoff_base,
            config
                .retry_backoff_base
                .saturating_mul(2u32.saturating_pow(config.max_retries)),
        );
        let util = ProvisioningUtil::new(self.ctx.clone(), self.queue.profile());
        let mut attempt = 0;

        loop {
            match self.ctx.scheduler.is_job_queued_or_running(&first_id).await {
                Ok(true) => {}
                Ok(false) => {
                    log::info!(
                        "Job {first_id} is no longer queued, skipping the batch of job group {job_group}"
                    );
                    return true;
                }
                Err(error) => log::warn!("Cannot check state of job {first_id}: {error:?}"),
            }

            let error = match util.provision(items).await {
                Ok(provisioned) => {
                    log::debug!(
                        "Provisioned {} job(s) of job group {job_group}",
                        provisioned.len()
                    );
                    return true;
                }
                Err(error) => error,
            };

            if let ProvisioningError::PartialBatchFailure {
                provisioned,
                unprovisioned,
                code,
                ..
            } = &error
            {
                log::warn!(
                    "Job group {job_group} was provisioned partially ({} provisioned): {error}",
                    provisioned.len()
                );
                self.record_failure(unprovisioned.iter().cloned(), &error);
                // Capacity of jobs refused by the scheduler was already added to the stack
                let capacity_added = matches!(
                    code,
                    ErrorCode::InsufficientCapacity | ErrorCode::SchedulerError
                );
                for item in items.drain(..) {
                    if unprovisioned.contains(&item.job.job_id) {
                        let mut entry = item.entry;
                        entry.capacity_added = capacity_added;
                        self.queue.requeue(entry);
                    }
                }
                return true;
            }

            if error.stops_retry() {
                log::warn!(
                    "Provisioning of job group {job_group} failed, leaving it to reconciliation: {error}"
                );
                let job_ids: Vec<JobId> = items.iter().map(|item| item.job.job_id.clone()).collect();
                self.record_failure(job_ids.iter().cloned(), &error);
                if matches!(error.code(), ErrorCode::StackFailed | ErrorCode::StackTimeout) {
                    util.cleanup_ephemeral_stack(&job_group, &job_ids).await;
                }
                return true;
            }

            if attempt >= config.max_retries {
                log::error!(
                    "Provisioning of job group {job_group} failed after {attempt} retries: {error}"
                );
                self.record_failure(items.iter().map(|item| item.job.job_id.clone()), &error);
                return false;
            }
            let delay = backoff.delay(attempt);
            attempt += 1;
            log::info!(
                "Provisioning of job group {job_group} failed, retrying in {} (attempt {attempt}/{}): {error}",
                humantime::format_duration(delay),
                config.max_retries
            );
            tokio::select! {
                _ = self.token.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::{JobProvisioner, ProvisionerTask};
    use crate::job::{Job, LicenseRequest};
    use crate::provisioning::queue::ProvisioningQueue;
    use crate::queue_profile::QueueProfile;
    use crate::tests::mocks::TestEnv;
    use crate::tests::utils::{JobBuilder, batch_profile, single_job_profile};

    fn task(env: &TestEnv, profile: QueueProfile) -> ProvisionerTask {
        ProvisionerTask {
            ctx: env.ctx.clone(),
            queue: Arc::new(ProvisioningQueue::new(env.ctx.clone(), profile)),
            token: CancellationToken::new(),
        }
    }

    fn submit(env: &TestEnv, task: &ProvisionerTask, jobs: Vec<Job>) {
        env.add_jobs(jobs.clone());
        for job in jobs {
            assert!(task.queue.put(&job, false));
        }
    }

    fn batch_job(id: &str, group: &str) -> Job {
        JobBuilder::default()
            .id(id)
            .queue_type("batch")
            .job_group(group)
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn drain_returns_complete_batch() {
        let env = TestEnv::new();
        let task = task(&env, batch_profile("batch", &["normal"], 3));
        submit(
            &env,
            &task,
            vec![batch_job("1", "g"), batch_job("2", "g"), batch_job("3", "g")],
        );
        let batches = task.drain_batch_queue().await;
        assert_eq!(batches.len(), 1);
        let mut ids: Vec<_> = batches[0].iter().map(|i| i.job.job_id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(task.queue.get_queue_size(None), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_late_jobs() {
        let env = TestEnv::new();
        let task = Arc::new(task(&env, batch_profile("batch", &["normal"], 3)));
        submit(&env, &task, vec![batch_job("1", "g")]);
        // The scheduler already knows about the second job
        env.scheduler.add_job(batch_job("2", "g"));

        let late = {
            let env_ctx = env.ctx.clone();
            let task = task.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1500)).await;
                let job = batch_job("2", "g");
                env_ctx.job_cache.sync([job.clone()]);
                task.queue.put(&job, false);
            })
        };
        let batches = task.drain_batch_queue().await;
        late.await.unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_restarts_group_when_jobs_disappear() {
        let env = TestEnv::new();
        let task = task(&env, batch_profile("batch", &["normal"], 3));
        submit(&env, &task, vec![batch_job("1", "g"), batch_job("2", "g")]);
        // Jobs were altered in the scheduler after they were queued
        env.scheduler.remove_job("1");
        env.scheduler.remove_job("2");

        let batches = task.drain_batch_queue().await;
        assert!(batches.is_empty());
        assert!(env.scheduler.count_calls() >= 2);
        assert_eq!(task.queue.get_queue_size(None), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_window_when_count_fails() {
        let env = TestEnv::new();
        let task = task(&env, batch_profile("batch", &["normal"], 3));
        submit(&env, &task, vec![batch_job("1", "g"), batch_job("2", "g")]);
        env.scheduler.fail_counts(u32::MAX);

        let start = tokio::time::Instant::now();
        let batches = task.drain_batch_queue().await;
        assert!(start.elapsed() >= env.ctx.config.provisioning.batch_window);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_recovers_from_count_failure() {
        let env = TestEnv::new();
        let task = task(&env, batch_profile("batch", &["normal"], 3));
        submit(&env, &task, vec![batch_job("1", "g"), batch_job("2", "g")]);
        env.scheduler.fail_counts(1);

        let start = tokio::time::Instant::now();
        let batches = task.drain_batch_queue().await;
        assert!(start.elapsed() < env.ctx.config.provisioning.batch_window);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(env.scheduler.count_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_job_is_requeued_onto_existing_capacity() {
        let env = TestEnv::new();
        let task = task(&env, batch_profile("batch", &["normal"], 3));
        submit(&env, &task, vec![batch_job("1", "g"), batch_job("2", "g")]);
        env.scheduler.refuse_job_once("2");
        let mut batches = task.drain_batch_queue().await;
        assert_eq!(batches.len(), 1);

        assert!(task.provision_with_retry_backoff(&mut batches[0]).await);
        assert!(!task.queue.contains("1"));
        assert!(task.queue.contains("2"));
        let error = env.ctx.job_cache.get_job_provisioning_error("2").unwrap();
        assert_eq!(error.code, "SCHEDULER_ERROR");

        let mut items = vec![task.queue.get(Duration::from_secs(1)).await.unwrap()];
        assert!(items[0].entry.capacity_added);
        assert!(task.provision_with_retry_backoff(&mut items).await);
        assert_eq!(env.scheduler.provisioned_jobs(), vec!["1", "2"]);
        assert_eq!(env.backend.builds()[0].target_capacity, 2);
        assert!(env.backend.capacity_updates().is_empty());
        assert!(env.ctx.job_cache.get_job_provisioning_error("2").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_separates_groups() {
        let env = TestEnv::new();
        let task = task(&env, batch_profile("batch", &["normal"], 3));
        submit(
            &env,
            &task,
            vec![batch_job("1", "a"), batch_job("2", "b"), batch_job("3", "a")],
        );
        let mut sizes: Vec<usize> = task
            .drain_batch_queue()
            .await
            .iter()
            .map(|b| b.len())
            .collect();
        sizes.sort();
        assert_eq!(sizes, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn license_shortfall_does_not_block_queue() {
        let env = TestEnv::new();
        env.checks.set_licenses("ansys", 1);
        let task = task(&env, single_job_profile("compute", &["normal"]));
        let job = JobBuilder::default()
            .id("1")
            .licenses(vec![LicenseRequest {
                name: "ansys".to_string(),
                count: 2,
            }])
            .build();
        submit(&env, &task, vec![job]);
        let mut items = vec![task.queue.get(Duration::from_secs(1)).await.unwrap()];

        assert!(task.provision_with_retry_backoff(&mut items).await);
        let error = env.ctx.job_cache.get_job_provisioning_error("1").unwrap();
        assert_eq!(error.code, "LICENSE_NOT_AVAILABLE");
        assert!(env.backend.builds().is_empty());
        assert!(!env.ctx.job_cache.get_job("1").unwrap().provisioned);
        assert_eq!(
            env.ctx.metrics.snapshot().provisioning_failures["LICENSE_NOT_AVAILABLE"],
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried() {
        let env = TestEnv::new();
        env.backend.fail_builds(2);
        let task = task(&env, single_job_profile("compute", &["normal"]));
        submit(&env, &task, vec![JobBuilder::default().id("1").build()]);
        let mut items = vec![task.queue.get(Duration::from_secs(1)).await.unwrap()];

        assert!(task.provision_with_retry_backoff(&mut items).await);
        assert_eq!(env.backend.builds().len(), 1);
        assert!(env.ctx.job_cache.get_job("1").unwrap().provisioned);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_requeue_jobs() {
        let env = TestEnv::new();
        env.backend.fail_builds(100);
        let task = task(&env, single_job_profile("compute", &["normal"]));
        submit(&env, &task, vec![JobBuilder::default().id("1").build()]);
        let item = task.queue.get(Duration::from_secs(1)).await.unwrap();

        task.handle_batch(vec![item]).await;
        assert!(task.queue.contains("1"));
        let error = env.ctx.job_cache.get_job_provisioning_error("1").unwrap();
        assert_eq!(error.code, "BACKEND_ERROR");
        // Initial attempt and five retries
        assert_eq!(env.backend.build_attempts(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_job_skips_batch() {
        let env = TestEnv::new();
        let task = task(&env, single_job_profile("compute", &["normal"]));
        submit(&env, &task, vec![JobBuilder::default().id("1").build()]);
        let mut items = vec![task.queue.get(Duration::from_secs(1)).await.unwrap()];
        env.scheduler.remove_job("1");

        assert!(task.provision_with_retry_backoff(&mut items).await);
        assert!(env.backend.builds().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn provisioner_runs_until_stopped() {
        let env = TestEnv::new();
        let queue = Arc::new(ProvisioningQueue::new(
            env.ctx.clone(),
            single_job_profile("compute", &["normal"]),
        ));
        let job = JobBuilder::default().id("1").build();
        env.add_jobs([job.clone()]);
        queue.put(&job, false);

        let mut provisioner = JobProvisioner::new(env.ctx.clone(), queue.clone());
        provisioner.start();
        provisioner.start();
        assert!(provisioner.is_running());
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(env.ctx.job_cache.get_job("1").unwrap().provisioned);
        assert_eq!(env.backend.builds().len(), 1);

        provisioner.stop().await;
        assert!(!provisioner.is_running());
        provisioner.stop().await;
    }
}
