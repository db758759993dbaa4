//! Configuration of the provisioning subsystem.
//!
//! Everything is optional, a missing section or key falls back to its default:
//!
//! ```toml
//! cluster_name = "research"
//! license_resources = ["ansys_lic"]
//!
//! [monitor]
//! reconcile_interval = "2m"
//!
//! [provisioning]
//! batch_window = "5s"
//!
//! [provisioning.fair_share.queued_job_bonus]
//! type = "power-law"
//! weight = 2.0
//! exponent = 1.5
//! time_unit = "1m"
//! ```
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::common::timeutils::human_duration;
use crate::queue_profile::QueueProfile;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub cluster_name: String,
    /// Scheduler resource names that represent licenses.
    pub license_resources: Vec<String>,
    pub monitor: MonitorConfig,
    pub provisioning: ProvisioningConfig,
    pub profile_cache: ProfileCacheConfig,
    pub queue_profiles: Vec<QueueProfile>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cluster_name: "idea".to_string(),
            license_resources: vec![],
            monitor: Default::default(),
            provisioning: Default::default(),
            profile_cache: Default::default(),
            queue_profiles: vec![],
        }
    }
}

impl SchedulerConfig {
    pub fn from_toml_str(input: &str) -> crate::Result<Self> {
        Ok(toml::from_str(input)?)
    }

    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn is_license_resource(&self, name: &str) -> bool {
        self.license_resources.iter().any(|r| r == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    #[serde(with = "human_duration")]
    pub submission_interval: Duration,
    /// Period of the direct scheduler re-query that catches missed notifications.
    #[serde(with = "human_duration")]
    pub reconcile_interval: Duration,
    /// Minimal age of a modified/running update before it is processed.
    #[serde(with = "human_duration")]
    pub update_delay: Duration,
    #[serde(with = "human_duration")]
    pub event_wait_time: Duration,
    pub event_batch_size: usize,
    pub page_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            submission_interval: Duration::from_secs(1),
            reconcile_interval: Duration::from_secs(60),
            update_delay: Duration::from_secs(1),
            event_wait_time: Duration::from_secs(5),
            event_batch_size: 10,
            page_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProvisioningConfig {
    #[serde(with = "human_duration")]
    pub queue_get_timeout: Duration,
    /// How long the batch drain waits for more jobs of a group to arrive.
    #[serde(with = "human_duration")]
    pub batch_window: Duration,
    /// Pause between two provisioner iterations.
    #[serde(with = "human_duration")]
    pub provisioning_delay: Duration,
    pub max_retries: u32,
    #[serde(with = "human_duration")]
    pub retry_backoff_base: Duration,
    #[serde(with = "human_duration")]
    pub stack_provisioning_timeout: Duration,
    #[serde(with = "human_duration")]
    pub blocked_log_interval: Duration,
    #[serde(with = "human_duration")]
    pub readiness_max_backoff: Duration,
    #[serde(with = "human_duration")]
    pub purge_interval: Duration,
    pub fair_share: FairShareConfig,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            queue_get_timeout: Duration::from_secs(1),
            batch_window: Duration::from_secs(3),
            provisioning_delay: Duration::from_secs(1),
            max_retries: 5,
            retry_backoff_base: Duration::from_secs(2),
            stack_provisioning_timeout: Duration::from_secs(1800),
            blocked_log_interval: Duration::from_secs(60),
            readiness_max_backoff: Duration::from_secs(10),
            purge_interval: Duration::from_secs(60),
            fair_share: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FairShareConfig {
    pub start_score: f64,
    /// Added to the score for every running job of the same owner (usually negative).
    pub running_job_penalty: f64,
    pub queued_job_bonus: QueuedJobBonus,
}

impl Default for FairShareConfig {
    fn default() -> Self {
        Self {
            start_score: 100.0,
            running_job_penalty: -10.0,
            queued_job_bonus: QueuedJobBonus::Constant { increment: 1.0 },
        }
    }
}

/// Bonus that a queued job of an owner adds to the owner's fair share score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum QueuedJobBonus {
    Constant {
        increment: f64,
    },
    /// `weight * (age / time_unit) ^ exponent`
    PowerLaw {
        weight: f64,
        exponent: f64,
        #[serde(with = "human_duration")]
        time_unit: Duration,
    },
}

impl QueuedJobBonus {
    pub fn bonus(&self, age: Duration) -> f64 {
        match self {
            QueuedJobBonus::Constant { increment } => *increment,
            QueuedJobBonus::PowerLaw {
                weight,
                exponent,
                time_unit,
            } => {
                let unit = time_unit.as_secs_f64();
                if unit <= 0.0 {
                    return 0.0;
                }
                weight * (age.as_secs_f64() / unit).powf(*exponent)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProfileCacheConfig {
    pub capacity: usize,
    #[serde(with = "human_duration")]
    pub ttl: Duration,
}

impl Default for ProfileCacheConfig {
    fn default() -> Self {
        Self {
            capacity: 128,
            ttl: Duration::from_secs(10),
        }
    }
}
