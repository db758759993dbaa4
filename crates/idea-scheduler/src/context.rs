use std::sync::Arc;

use crate::backend::ProvisioningBackend;
use crate::cache::JobCache;
use crate::checks::AdmissionChecks;
use crate::config::SchedulerConfig;
use crate::metrics::Metrics;
use crate::notify::{JobNotifier, LogNotifier};
use crate::scheduler::BatchScheduler;

/// Configuration and collaborators shared by all components of the provisioning pipeline.
#[derive(Clone)]
pub struct SchedulerContext {
    pub config: Arc<SchedulerConfig>,
    pub scheduler: Arc<dyn BatchScheduler>,
    pub backend: Arc<dyn ProvisioningBackend>,
    pub job_cache: JobCache,
    pub checks: AdmissionChecks,
    pub metrics: Metrics,
    pub notifier: Arc<dyn JobNotifier>,
}

impl SchedulerContext {
    pub fn new(
        config: SchedulerConfig,
        scheduler: Arc<dyn BatchScheduler>,
        backend: Arc<dyn ProvisioningBackend>,
        checks: AdmissionChecks,
    ) -> Self {
        Self {
            config: Arc::new(config),
            scheduler,
            backend,
            job_cache: JobCache::new(),
            checks,
            metrics: Metrics::new(),
            notifier: Arc::new(LogNotifier),
        }
    }

    pub fn with_job_cache(mut self, job_cache: JobCache) -> Self {
        self.job_cache = job_cache;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn JobNotifier>) -> Self {
        self.notifier = notifier;
        self
    }
}
