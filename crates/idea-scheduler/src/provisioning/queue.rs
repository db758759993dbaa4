//! Admission queue of jobs waiting for capacity, one per queue profile.
//!
//! Jobs are kept in one priority queue per job group. Groups are served round-robin so that
//! a large group cannot starve the others, jobs inside a group are served by priority.
use std::cmp::{Ordering, Reverse};
use std::time::Duration;

use chrono::Utc;
use priority_queue::PriorityQueue;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::cache::JobFilter;
use crate::common::timeutils::now_monotonic;
use crate::common::utils::Backoff;
use crate::common::{Map, WrappedArcMutex};
use crate::context::SchedulerContext;
use crate::job::{Job, JobId, JobState};
use crate::provisioning::fairshare::fair_share_score;
use crate::queue_profile::{LimitCheckResult, LimitType, QueueMode, QueueProfile};

/// Initial delay when waiting for the job cache to become ready.
const READINESS_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Priority of a queued job. Lower values are served first.
#[derive(Debug, Clone, Copy)]
pub struct QueuePriority {
    pub key: f64,
    /// Numeric part of the scheduler job id.
    pub sequence: u64,
    /// Order of arrival into the queue.
    pub arrival: u64,
}

impl PartialEq for QueuePriority {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuePriority {}

impl PartialOrd for QueuePriority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuePriority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .total_cmp(&other.key)
            .then(self.sequence.cmp(&other.sequence))
            .then(self.arrival.cmp(&other.arrival))
    }
}

#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub priority: QueuePriority,
    pub job_id: JobId,
    pub job_group: String,
    pub deleted: bool,
    /// Capacity for this job was already requested from the backend.
    pub capacity_added: bool,
}

/// A job taken out of the queue together with its queue entry.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub job: Job,
    pub entry: QueuedJob,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueueError {
    #[error("Queue is empty")]
    Empty,
    /// Behaves like an empty queue, the caller should back off.
    #[error("Queue is blocked by limit {0}")]
    BlockedByLimits(LimitCheckResult),
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueStatus {
    pub size: usize,
    pub blocked: bool,
    pub limit: Option<LimitCheckResult>,
}

struct GroupQueue {
    job_group: String,
    jobs: PriorityQueue<JobId, Reverse<QueuePriority>>,
}

#[derive(Default)]
struct QueueState {
    groups: Vec<GroupQueue>,
    /// Position of the group that is served next.
    index: usize,
    entries: Map<JobId, QueuedJob>,
    blocked: Option<LimitCheckResult>,
    last_blocked_report: Option<Instant>,
    arrival_counter: u64,
}

impl QueueState {
    fn group_mut(&mut self, job_group: &str) -> &mut GroupQueue {
        let position = match self.groups.iter().position(|g| g.job_group == job_group) {
            Some(position) => position,
            None => {
                self.groups.push(GroupQueue {
                    job_group: job_group.to_string(),
                    jobs: PriorityQueue::new(),
                });
                self.groups.len() - 1
            }
        };
        &mut self.groups[position]
    }

    fn remove_group(&mut self, position: usize) {
        self.groups.remove(position);
        if position < self.index {
            self.index -= 1;
        }
        if self.index >= self.groups.len() {
            self.index = 0;
        }
    }

    fn insert(&mut self, entry: QueuedJob) {
        self.group_mut(&entry.job_group)
            .jobs
            .push(entry.job_id.clone(), Reverse(entry.priority));
        self.entries.insert(entry.job_id.clone(), entry);
    }

    /// Pops the best job of the current group and moves to the next group.
    fn pop_next(&mut self) -> Option<QueuedJob> {
        while !self.groups.is_empty() {
            if self.index >= self.groups.len() {
                self.index = 0;
            }
            let position = self.index;
            let popped = self.groups[position].jobs.pop().map(|(job_id, _)| job_id);
            if self.groups[position].jobs.is_empty() {
                // The next group moves into the current position
                self.remove_group(position);
            } else {
                self.index = (position + 1) % self.groups.len();
            }
            let Some(job_id) = popped else {
                continue;
            };
            match self.entries.remove(&job_id) {
                Some(entry) if !entry.deleted => return Some(entry),
                _ => continue,
            }
        }
        None
    }

    fn size(&self, job_group: Option<&str>) -> usize {
        self.entries
            .values()
            .filter(|e| !e.deleted && job_group.is_none_or(|g| g == e.job_group))
            .count()
    }
}

pub struct ProvisioningQueue {
    ctx: SchedulerContext,
    profile: WrappedArcMutex<QueueProfile>,
    state: WrappedArcMutex<QueueState>,
    available: Notify,
}

impl ProvisioningQueue {
    pub fn new(ctx: SchedulerContext, profile: QueueProfile) -> Self {
        Self {
            ctx,
            profile: WrappedArcMutex::wrap(profile),
            state: Default::default(),
            available: Notify::new(),
        }
    }

    pub fn profile(&self) -> QueueProfile {
        self.profile.get_mut().clone()
    }

    pub fn update_profile(&self, profile: QueueProfile) {
        *self.profile.get_mut() = profile;
    }

    fn priority_key(&self, profile: &QueueProfile, job: &Job) -> f64 {
        let queue_count = profile.queues.len().max(1);
        let order = profile.queue_order(&job.queue).unwrap_or(queue_count);
        match profile.queue_mode() {
            QueueMode::Fifo | QueueMode::LicenseOptimized => job.queue_timestamp() * order as f64,
            QueueMode::Fairshare => {
                let owner_jobs = self.ctx.job_cache.list_jobs(&JobFilter {
                    queue_type: Some(profile.name.clone()),
                    owner: Some(job.owner.clone()),
                    ..Default::default()
                });
                let score =
                    fair_share_score(&self.ctx.config.provisioning.fair_share, &owner_jobs, Utc::now());
                // The first queue of the profile weighs the most
                let weight = (queue_count + 1 - order) as f64;
                -(score * weight)
            }
        }
    }

    /// Adds a job into the queue, or updates its priority if it is already queued.
    ///
    /// Jobs from queues not owned by the profile, jobs that are not queued and jobs that were
    /// already provisioned are ignored. Returns true if the job is in the queue afterwards.
    pub fn put(&self, job: &Job, modified: bool) -> bool {
        let profile = self.profile();
        if !profile.owns_queue(&job.queue) {
            log::debug!(
                "Job {} from queue {} does not belong to queue profile {}",
                job.log_tag(),
                job.queue,
                profile.name
            );
            return false;
        }
        if job.state != JobState::Queued || job.provisioned {
            log::debug!(
                "Job {} is not a provisioning candidate (state: {}, provisioned: {})",
                job.log_tag(),
                job.state,
                job.provisioned
            );
            return false;
        }

        // Computed before locking, fair share reads the job cache
        let key = self.priority_key(&profile, job);
        let job_group = job
            .job_group
            .clone()
            .unwrap_or_else(|| profile.job_group_for(job));

        let mut state = self.state.get_mut();
        if let Some(mut entry) = state.entries.remove(&job.job_id) {
            let priority = QueuePriority { key, ..entry.priority };
            let old_position = state
                .groups
                .iter()
                .position(|g| g.job_group == entry.job_group);
            if let Some(position) = old_position {
                state.groups[position].jobs.remove(&job.job_id);
                if state.groups[position].jobs.is_empty() && entry.job_group != job_group {
                    state.remove_group(position);
                }
            }
            log::debug!(
                "Job {} updated in queue of {} (modified: {modified})",
                job.log_tag(),
                profile.name
            );
            entry.priority = priority;
            entry.job_group = job_group;
            entry.deleted = false;
            state.insert(entry);
        } else {
            state.arrival_counter += 1;
            let entry = QueuedJob {
                priority: QueuePriority {
                    key,
                    sequence: job.id_sequence(),
                    arrival: state.arrival_counter,
                },
                job_id: job.job_id.clone(),
                job_group,
                deleted: false,
                capacity_added: false,
            };
            log::debug!(
                "Job {} added to queue of {} (group: {})",
                job.log_tag(),
                profile.name,
                entry.job_group
            );
            state.insert(entry);
            drop(state);
            self.ctx.metrics.job_queued();
        }
        self.available.notify_one();
        true
    }

    /// Returns a job taken by [`ProvisioningQueue::get`] back into the queue.
    pub fn requeue(&self, entry: QueuedJob) {
        let mut state = self.state.get_mut();
        if state.entries.contains_key(&entry.job_id) {
            return;
        }
        state.insert(entry);
        drop(state);
        self.available.notify_one();
    }

    /// Marks a queued job as deleted, the consumer will skip it.
    pub fn delete(&self, job_id: &str) -> bool {
        match self.state.get_mut().entries.get_mut(job_id) {
            Some(entry) => {
                entry.deleted = true;
                true
            }
            None => false,
        }
    }

    /// Removes the entries of deleted jobs. Returns the number of removed entries.
    pub fn purge_deleted(&self) -> usize {
        let mut state = self.state.get_mut();
        let deleted: Vec<(JobId, String)> = state
            .entries
            .values()
            .filter(|e| e.deleted)
            .map(|e| (e.job_id.clone(), e.job_group.clone()))
            .collect();
        for (job_id, job_group) in &deleted {
            state.entries.remove(job_id);
            if let Some(position) = state.groups.iter().position(|g| g.job_group == *job_group) {
                state.groups[position].jobs.remove(job_id);
                if state.groups[position].jobs.is_empty() {
                    state.remove_group(position);
                }
            }
        }
        deleted.len()
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.state
            .get_mut()
            .entries
            .get(job_id)
            .is_some_and(|e| !e.deleted)
    }

    pub fn get_queue_size(&self, job_group: Option<&str>) -> usize {
        self.state.get_mut().size(job_group)
    }

    pub fn is_blocked(&self) -> bool {
        self.state.get_mut().blocked.is_some()
    }

    pub fn limit_info(&self) -> Option<LimitCheckResult> {
        self.state.get_mut().blocked.clone()
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.state.get_mut();
        QueueStatus {
            size: state.size(None),
            blocked: state.blocked.is_some(),
            limit: state.blocked.clone(),
        }
    }

    async fn wait_until_ready(&self, deadline: Instant) -> bool {
        let backoff = Backoff::new(
            READINESS_INITIAL_BACKOFF,
            self.ctx.config.provisioning.readiness_max_backoff,
        );
        let mut attempt = 0;
        while !self.ctx.job_cache.is_ready() {
            let now = now_monotonic();
            if now >= deadline {
                return false;
            }
            let delay = backoff.delay(attempt).min(deadline - now);
            log::trace!("Job cache is not ready, waiting {delay:?}");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
        true
    }

    /// Checks the limits of the profile, returns the first violated one.
    fn check_limits(&self, profile: &QueueProfile, job: &Job, job_group: &str) -> Option<LimitCheckResult> {
        let cache = &self.ctx.job_cache;
        let limits = &profile.limits;
        if let Some(threshold) = limits.max_running_jobs {
            let result = LimitCheckResult::evaluate(
                LimitType::MaxRunningJobs,
                threshold,
                cache.get_active_jobs(&profile.name),
                1,
                true,
            );
            if !result.ok {
                return Some(result);
            }
        }
        if let Some(threshold) = limits.max_provisioned_instances {
            let result = LimitCheckResult::evaluate(
                LimitType::MaxProvisionedInstances,
                threshold,
                cache.get_provisioned_instance_count(&profile.name),
                job.desired_nodes(),
                true,
            );
            if !result.ok {
                return Some(result);
            }
        }
        if let Some(threshold) = limits.max_provisioned_capacity {
            let result = LimitCheckResult::evaluate(
                LimitType::MaxProvisionedCapacity,
                threshold,
                cache.get_provisioned_capacity(job_group),
                job.desired_capacity(),
                false,
            );
            if !result.ok {
                return Some(result);
            }
        }
        None
    }

    fn mark_blocked(&self, profile: &QueueProfile, limit: LimitCheckResult) {
        let interval = self.ctx.config.provisioning.blocked_log_interval;
        let now = now_monotonic();
        let report = {
            let mut state = self.state.get_mut();
            state.blocked = Some(limit.clone());
            let report = state
                .last_blocked_report
                .is_none_or(|last| now.duration_since(last) >= interval);
            if report {
                state.last_blocked_report = Some(now);
            }
            report
        };
        if report {
            log::warn!(
                "Queue profile {} is blocked by limit {limit}",
                profile.name
            );
            self.ctx.metrics.queue_blocked(&profile.name, limit.limit_type);
        }
    }

    fn clear_blocked(&self, profile: &QueueProfile) {
        let mut state = self.state.get_mut();
        if state.blocked.take().is_some() {
            state.last_blocked_report = None;
            log::info!("Queue profile {} is no longer blocked", profile.name);
        }
    }

    /// Takes the next job that can be provisioned.
    ///
    /// Waits up to `timeout` for the job cache to become ready and for a job to arrive.
    /// Jobs that violate a limit are returned into the queue, a violated queue level limit
    /// additionally marks the whole queue as blocked.
    pub async fn get(&self, timeout: Duration) -> Result<QueueItem, QueueError> {
        let deadline = now_monotonic() + timeout;
        if !self.wait_until_ready(deadline).await {
            return Err(QueueError::Empty);
        }
        loop {
            let notified = self.available.notified();
            let entry = self.state.get_mut().pop_next();
            let Some(entry) = entry else {
                let now = now_monotonic();
                if now >= deadline {
                    return Err(QueueError::Empty);
                }
                if tokio::time::timeout(deadline - now, notified).await.is_err() {
                    return Err(QueueError::Empty);
                }
                continue;
            };

            let job = match self.ctx.job_cache.get_active_job(&entry.job_id) {
                Some(job) if job.is_provisioning_candidate() => job,
                Some(job) => {
                    log::debug!(
                        "Discarding job {} from queue (state: {}, provisioned: {})",
                        job.log_tag(),
                        job.state,
                        job.provisioned
                    );
                    continue;
                }
                None => {
                    log::debug!("Discarding unknown job {} from queue", entry.job_id);
                    continue;
                }
            };

            let profile = self.profile();
            if let Some(limit) = self.check_limits(&profile, &job, &entry.job_group) {
                self.requeue(entry);
                if limit.queue_level {
                    self.mark_blocked(&profile, limit.clone());
                    return Err(QueueError::BlockedByLimits(limit));
                }
                log::debug!(
                    "Job {} deferred by group limit {limit}",
                    job.log_tag()
                );
                return Err(QueueError::Empty);
            }
            self.clear_blocked(&profile);
            return Ok(QueueItem { job, entry });
        }
    }
}
