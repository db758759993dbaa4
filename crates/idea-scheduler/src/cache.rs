//! Local mirror of the jobs known to the scheduler.
//!
//! The cache is the single source of truth for "is this job already provisioned". Every
//! method locks the cache for a short critical section and never calls into other components
//! while holding the lock.
use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{Map, WrappedArcMutex};
use crate::define_wrapped_type;
use crate::job::{Job, JobExecutionHost, JobId, JobState};

/// Maximum number of finished jobs remembered by the cache.
const MAX_FINISHED_JOBS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProvisioningError {
    pub code: String,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub queue_type: Option<String>,
    pub queue: Option<String>,
    pub owner: Option<String>,
    pub job_group: Option<String>,
    pub states: Vec<JobState>,
    pub provisioned: Option<bool>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        let matches_opt = |filter: &Option<String>, value: Option<&str>| match filter {
            Some(expected) => value == Some(expected.as_str()),
            None => true,
        };
        matches_opt(&self.queue_type, job.queue_type.as_deref())
            && matches_opt(&self.queue, Some(&job.queue))
            && matches_opt(&self.owner, Some(&job.owner))
            && matches_opt(&self.job_group, job.job_group.as_deref())
            && (self.states.is_empty() || self.states.contains(&job.state))
            && self.provisioned.is_none_or(|p| p == job.provisioned)
    }
}

/// A job consumes capacity once it was provisioned or started running.
fn consumes_capacity(job: &Job) -> bool {
    !job.state.is_finished() && (job.provisioned || job.state.is_running())
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct JobCacheState {
    active: Map<JobId, Job>,
    finished: Map<JobId, Job>,
    finished_order: VecDeque<JobId>,
    provisioning_errors: Map<JobId, JobProvisioningError>,
    #[serde(skip)]
    ready: bool,
}

impl JobCacheState {
    fn insert_finished(&mut self, mut job: Job) {
        self.active.remove(&job.job_id);
        self.provisioning_errors.remove(&job.job_id);
        if job.end_time.is_none() {
            job.end_time = Some(Utc::now());
        }
        if self.finished.insert(job.job_id.clone(), job.clone()).is_none() {
            self.finished_order.push_back(job.job_id);
        }
        while self.finished_order.len() > MAX_FINISHED_JOBS {
            if let Some(id) = self.finished_order.pop_front() {
                self.finished.remove(&id);
            }
        }
    }

    fn upsert(&mut self, mut job: Job) {
        if job.state.is_finished() {
            self.insert_finished(job);
            return;
        }
        if let Some(existing) = self.active.get(&job.job_id) {
            // Provisioning data is owned by the provisioner, the scheduler may not report it yet
            job.provisioned |= existing.provisioned;
            if job.stack_id.is_none() {
                job.stack_id.clone_from(&existing.stack_id);
            }
            if job.provisioning_time.is_none() {
                job.provisioning_time = existing.provisioning_time;
            }
            if job.provisioning_options.is_none() {
                job.provisioning_options.clone_from(&existing.provisioning_options);
            }
            if job.job_group.is_none() {
                job.job_group.clone_from(&existing.job_group);
            }
            if job.execution_hosts.is_empty() {
                job.execution_hosts.clone_from(&existing.execution_hosts);
            }
        }
        self.active.insert(job.job_id.clone(), job);
    }
}

define_wrapped_type!(JobCache, JobCacheState, pub);

impl Default for JobCache {
    fn default() -> Self {
        Self::new()
    }
}

impl JobCache {
    pub fn new() -> Self {
        Self(WrappedArcMutex::wrap(JobCacheState::default()))
    }

    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        let state = self.get_mut();
        state
            .active
            .get(job_id)
            .or_else(|| state.finished.get(job_id))
            .cloned()
    }

    pub fn get_active_job(&self, job_id: &str) -> Option<Job> {
        self.get_mut().active.get(job_id).cloned()
    }

    pub fn contains_active_job(&self, job_id: &str) -> bool {
        self.get_mut().active.contains_key(job_id)
    }

    /// Inserts or updates jobs. Finished jobs are moved to the finished set.
    pub fn sync(&self, jobs: impl IntoIterator<Item = Job>) {
        let mut state = self.get_mut();
        for job in jobs {
            state.upsert(job);
        }
    }

    pub fn add_finished_job(&self, job: Job) {
        self.get_mut().insert_finished(job);
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Vec<Job> {
        let state = self.get_mut();
        let mut jobs: Vec<Job> = state
            .active
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_unstable_by(|a, b| {
            a.id_sequence()
                .cmp(&b.id_sequence())
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        jobs
    }

    pub fn list_finished_jobs(&self) -> Vec<Job> {
        let state = self.get_mut();
        state
            .finished_order
            .iter()
            .filter_map(|id| state.finished.get(id))
            .cloned()
            .collect()
    }

    /// Number of jobs of the queue profile that consume capacity (provisioned or running).
    pub fn get_active_jobs(&self, queue_type: &str) -> u32 {
        self.get_mut()
            .active
            .values()
            .filter(|job| job.queue_type.as_deref() == Some(queue_type) && consumes_capacity(job))
            .count() as u32
    }

    pub fn get_provisioned_instance_count(&self, queue_type: &str) -> u32 {
        self.get_mut()
            .active
            .values()
            .filter(|job| job.queue_type.as_deref() == Some(queue_type) && consumes_capacity(job))
            .map(|job| job.desired_nodes())
            .sum()
    }

    pub fn get_provisioned_capacity(&self, job_group: &str) -> u32 {
        self.get_mut()
            .active
            .values()
            .filter(|job| job.job_group.as_deref() == Some(job_group) && consumes_capacity(job))
            .map(|job| job.desired_capacity())
            .sum()
    }

    pub fn get_active_license_count(&self, license: &str) -> u32 {
        self.get_mut()
            .active
            .values()
            .filter(|job| consumes_capacity(job))
            .map(|job| job.params.license_count(license))
            .sum()
    }

    pub fn set_job_provisioning_error(&self, job_id: &str, code: &str, message: &str) {
        self.get_mut().provisioning_errors.insert(
            job_id.to_string(),
            JobProvisioningError {
                code: code.to_string(),
                message: message.to_string(),
                recorded_at: Utc::now(),
            },
        );
    }

    pub fn clear_job_provisioning_error(&self, job_id: &str) {
        self.get_mut().provisioning_errors.remove(job_id);
    }

    pub fn get_job_provisioning_error(&self, job_id: &str) -> Option<JobProvisioningError> {
        self.get_mut().provisioning_errors.get(job_id).cloned()
    }

    /// Records the state reported by the scheduler, returns the updated job.
    pub fn update_job_state(&self, job_id: &str, state: JobState) -> Option<Job> {
        let mut cache = self.get_mut();
        let job = cache.active.get_mut(job_id)?;
        job.state = state;
        if state.is_running() && job.start_time.is_none() {
            job.start_time = Some(Utc::now());
        }
        let job = job.clone();
        if state.is_finished() {
            cache.insert_finished(job.clone());
        }
        Some(job)
    }

    /// Appends an execution host to the job's history, returns false for unknown jobs.
    pub fn add_execution_host(&self, job_id: &str, host: JobExecutionHost) -> bool {
        let mut state = self.get_mut();
        match state.active.get_mut(job_id) {
            Some(job) => {
                if !job.execution_hosts.contains(&host) {
                    job.execution_hosts.push(host);
                }
                true
            }
            None => false,
        }
    }

    pub fn get_execution_hosts(&self, job_id: &str) -> Vec<JobExecutionHost> {
        self.get_job(job_id)
            .map(|job| job.execution_hosts)
            .unwrap_or_default()
    }

    /// Forgets that a job was provisioned, so that it can be provisioned again.
    pub fn reset_provisioning(&self, job_id: &str) -> Option<Job> {
        let mut state = self.get_mut();
        let job = state.active.get_mut(job_id)?;
        job.provisioned = false;
        job.stack_id = None;
        job.provisioning_time = None;
        Some(job.clone())
    }

    pub fn set_ready(&self, ready: bool) {
        self.get_mut().ready = ready;
    }

    pub fn is_ready(&self) -> bool {
        self.get_mut().ready
    }

    pub fn active_job_count(&self) -> usize {
        self.get_mut().active.len()
    }

    pub fn finished_job_count(&self) -> usize {
        self.get_mut().finished.len()
    }

    /// Writes the cache content as JSON. The file is replaced atomically.
    pub fn save_snapshot(&self, path: &Path) -> crate::Result<()> {
        let data = {
            let state = self.get_mut();
            serde_json::to_vec(&*state)?
        };
        let directory = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let mut file = tempfile::NamedTempFile::new_in(directory)?;
        file.write_all(&data)?;
        file.flush()?;
        file.persist(path).map_err(|e| e.error)?;
        log::debug!("Job cache snapshot written to {}", path.display());
        Ok(())
    }

    /// Loads a snapshot written by [`JobCache::save_snapshot`]. The loaded cache is not ready.
    pub fn load_snapshot(path: &Path) -> crate::Result<JobCache> {
        let data = std::fs::read(path)?;
        let state: JobCacheState = serde_json::from_slice(&data).map_err(|e| {
            crate::Error::DeserializationError(format!(
                "Invalid job cache snapshot {}: {e}",
                path.display()
            ))
        })?;
        Ok(JobCache(WrappedArcMutex::wrap(state)))
    }
}
