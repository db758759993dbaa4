use crate::job::Job;

/// Side effects triggered by job lifecycle changes (e-mail, web hooks, ...).
pub trait JobNotifier: Send + Sync {
    fn job_started(&self, job: &Job);
}

/// Notifier that only writes the notification into the log.
#[derive(Default)]
pub struct LogNotifier;

impl JobNotifier for LogNotifier {
    fn job_started(&self, job: &Job) {
        log::info!(
            "Job {} of user {} started in queue {}",
            job.log_tag(),
            job.owner,
            job.queue
        );
    }
}
