//! Fair share scoring of jobs in FAIRSHARE queues.
use chrono::{DateTime, Utc};

use crate::common::timeutils::elapsed_between;
use crate::config::FairShareConfig;
use crate::job::Job;

/// Score of an owner, computed from the owner's active jobs in the queue profile.
///
/// Running (or already provisioned) jobs lower the score, queued jobs raise it according to
/// their age. A higher score means a higher priority.
pub fn fair_share_score(config: &FairShareConfig, owner_jobs: &[Job], now: DateTime<Utc>) -> f64 {
    owner_jobs
        .iter()
        .fold(config.start_score, |score, job| {
            if job.state.is_running() || job.provisioned {
                score + config.running_job_penalty
            } else if job.state.is_queued_or_held() {
                let age = job
                    .queue_time
                    .map(|queued_at| elapsed_between(queued_at, now))
                    .unwrap_or_default();
                score + config.queued_job_bonus.bonus(age)
            } else {
                score
            }
        })
}
