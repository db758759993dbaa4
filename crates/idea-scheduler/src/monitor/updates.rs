//! Job updates recorded by the monitor and processed later by its submission loop.
use std::time::Duration;

use tokio::time::Instant;

use crate::common::timeutils::now_monotonic;
use crate::common::{Map, WrappedArcMutex};
use crate::job::{Job, JobId};

/// Set of pending job updates. A newer update of the same job replaces the older one.
#[derive(Default)]
pub struct PendingUpdates {
    jobs: WrappedArcMutex<Map<JobId, (Instant, Job)>>,
}

impl PendingUpdates {
    pub fn add(&self, job: Job) {
        self.jobs
            .get_mut()
            .insert(job.job_id.clone(), (now_monotonic(), job));
    }

    /// Removes and returns updates recorded at least `delay` ago, oldest first.
    pub fn take_ready(&self, delay: Duration) -> Vec<Job> {
        let now = now_monotonic();
        let mut jobs = self.jobs.get_mut();
        let ready: Vec<JobId> = jobs
            .iter()
            .filter(|(_, (recorded, _))| now.duration_since(*recorded) >= delay)
            .map(|(job_id, _)| job_id.clone())
            .collect();
        let mut ready: Vec<(Instant, Job)> = ready
            .into_iter()
            .filter_map(|job_id| jobs.remove(&job_id))
            .collect();
        ready.sort_by_key(|(recorded, job)| (*recorded, job.id_sequence()));
        ready.into_iter().map(|(_, job)| job).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.get_mut().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
