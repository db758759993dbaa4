//! In-process metrics of the provisioning pipeline.
use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::common::WrappedArcMutex;
use crate::define_wrapped_type;
use crate::queue_profile::LimitType;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl LatencyStats {
    fn record(&mut self, latency: Duration) {
        self.count += 1;
        self.total += latency;
        self.max = self.max.max(latency);
    }

    pub fn average(&self) -> Option<Duration> {
        (self.count > 0).then(|| self.total / self.count as u32)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_queued: u64,
    pub jobs_started: u64,
    pub jobs_provisioned: u64,
    /// Time between the job entering the queue and being provisioned.
    pub provisioning_latency: LatencyStats,
    /// Keyed by `<queue profile>/<limit type>`.
    pub queue_blocked: BTreeMap<String, u64>,
    /// Keyed by error code.
    pub provisioning_failures: BTreeMap<String, u64>,
}

define_wrapped_type!(Metrics, MetricsSnapshot, pub);

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self(WrappedArcMutex::wrap(MetricsSnapshot::default()))
    }

    pub fn job_queued(&self) {
        self.get_mut().jobs_queued += 1;
    }

    pub fn job_started(&self) {
        self.get_mut().jobs_started += 1;
    }

    pub fn job_provisioned(&self, latency: Option<Duration>) {
        let mut metrics = self.get_mut();
        metrics.jobs_provisioned += 1;
        if let Some(latency) = latency {
            metrics.provisioning_latency.record(latency);
        }
    }

    pub fn queue_blocked(&self, queue_profile: &str, limit: LimitType) {
        *self
            .get_mut()
            .queue_blocked
            .entry(format!("{queue_profile}/{limit}"))
            .or_default() += 1;
    }

    pub fn provisioning_failure(&self, code: &str) {
        *self
            .get_mut()
            .provisioning_failures
            .entry(code.to_string())
            .or_default() += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.get_mut().clone()
    }
}
