//! Interface of the external batch scheduler.
pub mod pbs;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::job::{Job, JobId, JobState};

pub type SchedulerResult<T> = anyhow::Result<T>;

/// Scheduler resource that links a job to its job group.
pub const JOB_GROUP_RESOURCE: &str = "job_group";
/// Scheduler resource that links a provisioned job to its capacity stack.
pub const COMPUTE_STACK_RESOURCE: &str = "compute_stack";

#[derive(Debug, Clone, Default)]
pub struct ListJobsRequest {
    pub queue: Option<String>,
    pub job_ids: Vec<JobId>,
    pub owners: Vec<String>,
    pub states: Vec<JobState>,
    pub max_jobs: Option<usize>,
}

impl ListJobsRequest {
    pub fn queue(queue: &str, states: &[JobState]) -> Self {
        Self {
            queue: Some(queue.to_string()),
            states: states.to_vec(),
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.queue.as_ref().is_none_or(|q| *q == job.queue)
            && (self.job_ids.is_empty() || self.job_ids.contains(&job.job_id))
            && (self.owners.is_empty() || self.owners.contains(&job.owner))
            && (self.states.is_empty() || self.states.contains(&job.state))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCreation {
    Created,
    AlreadyExists,
}

/// Handle of an external batch scheduler (OpenPBS).
///
/// Calls may block on external processes, they must never be issued while holding a lock.
pub trait BatchScheduler: Send + Sync {
    fn list_jobs(&self, request: ListJobsRequest) -> BoxFuture<'_, SchedulerResult<Vec<Job>>>;

    /// Returns `None` when the scheduler does not know the job.
    fn get_job<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, SchedulerResult<Option<Job>>>;

    fn delete_job<'a>(&'a self, job_id: &'a str) -> BoxFuture<'a, SchedulerResult<()>>;

    fn create_queue<'a>(&'a self, queue: &'a str)
    -> BoxFuture<'a, SchedulerResult<QueueCreation>>;

    fn delete_queue<'a>(&'a self, queue: &'a str) -> BoxFuture<'a, SchedulerResult<()>>;

    /// Sets scheduler resources (`-l name=value`) of a job.
    fn modify_job_resources<'a>(
        &'a self,
        job_id: &'a str,
        resources: Vec<(String, String)>,
    ) -> BoxFuture<'a, SchedulerResult<()>>;

    /// Releases the job onto the capacity of `stack_id`, returns the provisioning time.
    fn provision_job<'a>(
        &'a self,
        job: &'a Job,
        stack_id: &'a str,
    ) -> BoxFuture<'a, SchedulerResult<DateTime<Utc>>>;

    /// Ids of jobs in `queue` with one of the given states.
    fn list_job_ids<'a>(
        &'a self,
        queue: &'a str,
        states: &'a [JobState],
    ) -> BoxFuture<'a, SchedulerResult<Vec<JobId>>> {
        Box::pin(async move {
            let jobs = self
                .list_jobs(ListJobsRequest::queue(queue, states))
                .await?;
            Ok(jobs.into_iter().map(|job| job.job_id).collect())
        })
    }

    fn is_job_queued_or_running<'a>(
        &'a self,
        job_id: &'a str,
    ) -> BoxFuture<'a, SchedulerResult<bool>> {
        Box::pin(async move {
            Ok(self
                .get_job(job_id)
                .await?
                .is_some_and(|job| job.state.is_queued_or_held() || job.state.is_running()))
        })
    }

    /// Number of queued or held jobs of `job_group` in the given queues.
    fn count_queued_jobs<'a>(
        &'a self,
        queues: &'a [String],
        job_group: &'a str,
    ) -> BoxFuture<'a, SchedulerResult<u32>> {
        Box::pin(async move {
            let mut count = 0;
            for queue in queues {
                let jobs = self
                    .list_jobs(ListJobsRequest::queue(
                        queue,
                        &[JobState::Queued, JobState::Held],
                    ))
                    .await?;
                count += jobs
                    .iter()
                    .filter(|job| job.job_group.as_deref() == Some(job_group))
                    .count() as u32;
            }
            Ok(count)
        })
    }
}
