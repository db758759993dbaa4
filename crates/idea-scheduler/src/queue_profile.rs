use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::error::IdeaError;
use crate::job::{Job, JobParams, ScalingMode};

pub type QueueProfileId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueMode {
    Fifo,
    Fairshare,
    LicenseOptimized,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueLimits {
    pub max_running_jobs: Option<u32>,
    pub max_provisioned_instances: Option<u32>,
    /// Applied per job group.
    pub max_provisioned_capacity: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueProfile {
    #[serde(default)]
    pub queue_profile_id: QueueProfileId,
    pub name: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub projects: Vec<String>,
    #[serde(default)]
    pub queues: Vec<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub queue_mode: Option<QueueMode>,
    #[serde(default)]
    pub scaling_mode: Option<ScalingMode>,
    /// Minutes after which idle capacity is released, 0 disables it.
    #[serde(default)]
    pub terminate_when_idle: u32,
    #[serde(default)]
    pub keep_forever: bool,
    /// Stable identifier of the always-on stack of a keep_forever profile.
    #[serde(default)]
    pub stack_uuid: Option<String>,
    #[serde(default)]
    pub limits: QueueLimits,
    #[serde(default)]
    pub default_job_params: JobParams,
    #[serde(default)]
    pub created_on: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_on: Option<DateTime<Utc>>,
}

impl QueueProfile {
    pub fn new(name: &str, queues: &[&str]) -> Self {
        Self {
            queue_profile_id: String::new(),
            name: name.to_string(),
            title: None,
            description: None,
            projects: vec![],
            queues: queues.iter().map(|q| q.to_string()).collect(),
            enabled: false,
            queue_mode: None,
            scaling_mode: None,
            terminate_when_idle: 0,
            keep_forever: false,
            stack_uuid: None,
            limits: Default::default(),
            default_job_params: Default::default(),
            created_on: None,
            updated_on: None,
        }
    }

    pub fn validate(&self) -> crate::Result<()> {
        let invalid = |message: String| Err(IdeaError::InvalidQueueProfile(message));
        if self.name.trim().is_empty() {
            return invalid("name is required".to_string());
        }
        if self.queues.is_empty() {
            return invalid(format!("queue profile `{}` has no queues", self.name));
        }
        if let Some(queue) = self.queues.iter().find(|q| q.trim().is_empty()) {
            return invalid(format!(
                "queue profile `{}` contains an invalid queue name `{queue}`",
                self.name
            ));
        }
        if self.queue_mode.is_none() {
            return invalid(format!("queue profile `{}` has no queue_mode", self.name));
        }
        if self.scaling_mode.is_none() && !self.keep_forever {
            return invalid(format!(
                "queue profile `{}` requires scaling_mode unless keep_forever is set",
                self.name
            ));
        }
        if self.projects.is_empty() {
            return invalid(format!(
                "queue profile `{}` must be associated with at least one project",
                self.name
            ));
        }
        if self.scaling_mode == Some(ScalingMode::Batch)
            && !self.keep_forever
            && self.terminate_when_idle == 0
        {
            return invalid(format!(
                "queue profile `{}`: terminate_when_idle must be greater than 0 in batch scaling mode",
                self.name
            ));
        }
        Ok(())
    }

    pub fn owns_queue(&self, queue: &str) -> bool {
        self.queues.iter().any(|q| q == queue)
    }

    /// 1-based position of `queue` in the queue list of the profile.
    pub fn queue_order(&self, queue: &str) -> Option<usize> {
        self.queues.iter().position(|q| q == queue).map(|i| i + 1)
    }

    pub fn queue_mode(&self) -> QueueMode {
        self.queue_mode.unwrap_or(QueueMode::Fifo)
    }

    pub fn is_batch(&self) -> bool {
        self.scaling_mode == Some(ScalingMode::Batch)
    }

    /// Whether a stack built for this profile outlives the jobs it was built for.
    pub fn is_shared_capacity(&self) -> bool {
        self.keep_forever || self.terminate_when_idle > 0 || self.is_batch()
    }

    /// Derives the job group of a job. Jobs of the same group share one capacity stack.
    pub fn job_group_for(&self, job: &Job) -> String {
        if self.keep_forever {
            let stack = self.stack_uuid.as_deref().unwrap_or(&self.queue_profile_id);
            return format!("{}-{stack}", self.name);
        }
        // Ephemeral stacks are never shared, an explicit job group is ignored
        if !self.is_shared_capacity() {
            return format!("{}-{}", self.name, job.job_uid);
        }
        if let Some(group) = &job.params.job_group {
            return format!("{}-{group}", self.name);
        }
        format!(
            "{}-{:016x}",
            self.name,
            fxhash::hash64(job.params.shape_key().as_bytes())
        )
    }

    /// Name of the capacity stack backing `job_group`.
    pub fn stack_name(&self, cluster_name: &str, job_group: &str) -> String {
        format!("{cluster_name}-{job_group}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    MaxRunningJobs,
    MaxProvisionedInstances,
    MaxProvisionedCapacity,
}

impl Display for LimitType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LimitType::MaxRunningJobs => "max_running_jobs",
            LimitType::MaxProvisionedInstances => "max_provisioned_instances",
            LimitType::MaxProvisionedCapacity => "max_provisioned_capacity",
        })
    }
}

/// Outcome of a single limit check performed when a job is dequeued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitCheckResult {
    pub limit_type: LimitType,
    pub threshold: u32,
    pub current: u32,
    pub requested: u32,
    pub ok: bool,
    /// Queue level limits block the whole queue, group level ones only defer one job.
    pub queue_level: bool,
}

impl LimitCheckResult {
    pub fn evaluate(
        limit_type: LimitType,
        threshold: u32,
        current: u32,
        requested: u32,
        queue_level: bool,
    ) -> Self {
        Self {
            limit_type,
            threshold,
            current,
            requested,
            ok: current.saturating_add(requested) <= threshold,
            queue_level,
        }
    }
}

impl Display for LimitCheckResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (threshold: {}, current: {}, requested: {})",
            self.limit_type, self.threshold, self.current, self.requested
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{LimitCheckResult, LimitType, QueueMode, QueueProfile};
    use crate::common::error::IdeaError;
    use crate::job::ScalingMode;
    use crate::tests::utils::{JobBuilder, batch_profile, single_job_profile};

    fn check_invalid(profile: &QueueProfile, message: &str) {
        match profile.validate() {
            Err(IdeaError::InvalidQueueProfile(msg)) => {
                assert!(msg.contains(message), "`{msg}` does not contain `{message}`")
            }
            other => panic!("Unexpected validation result {other:?}"),
        }
    }

    #[test]
    fn valid_profiles() {
        single_job_profile("compute", &["normal"]).validate().unwrap();
        batch_profile("batch", &["low"], 3).validate().unwrap();
    }

    #[test]
    fn invalid_profiles() {
        let mut profile = single_job_profile("compute", &["normal"]);
        profile.queues.clear();
        check_invalid(&profile, "has no queues");

        let mut profile = single_job_profile("compute", &["normal"]);
        profile.scaling_mode = None;
        check_invalid(&profile, "requires scaling_mode");
        profile.keep_forever = true;
        profile.validate().unwrap();

        let mut profile = single_job_profile("compute", &["normal"]);
        profile.queue_mode = None;
        check_invalid(&profile, "queue_mode");

        let mut profile = single_job_profile("compute", &["normal"]);
        profile.projects.clear();
        check_invalid(&profile, "at least one project");

        let profile = batch_profile("batch", &["low"], 0);
        check_invalid(&profile, "terminate_when_idle");

        let mut profile = single_job_profile("", &["normal"]);
        profile.name = " ".to_string();
        check_invalid(&profile, "name is required");
    }

    #[test]
    fn queue_order_follows_position() {
        let profile = single_job_profile("compute", &["high", "normal", "low"]);
        assert_eq!(profile.queue_order("high"), Some(1));
        assert_eq!(profile.queue_order("normal"), Some(2));
        assert_eq!(profile.queue_order("low"), Some(3));
        assert_eq!(profile.queue_order("other"), None);
        assert_eq!(profile.queue_mode(), QueueMode::Fifo);
    }

    #[test]
    fn job_groups() {
        let ephemeral = single_job_profile("compute", &["normal"]);
        let job = JobBuilder::default().id("1.server").uid("uid1").build();
        assert_eq!(ephemeral.job_group_for(&job), "compute-uid1");

        let batch = batch_profile("batch", &["normal"], 5);
        let a = JobBuilder::default().id("1").nodes(2).build();
        let b = JobBuilder::default().id("2").nodes(4).build();
        let c = JobBuilder::default()
            .id("3")
            .instance_types(vec!["m5.large".to_string()])
            .build();
        assert_eq!(batch.job_group_for(&a), batch.job_group_for(&b));
        assert_ne!(batch.job_group_for(&a), batch.job_group_for(&c));
        assert!(batch.job_group_for(&a).starts_with("batch-"));

        let explicit = JobBuilder::default().id("4").job_group("g1").build();
        assert_eq!(batch.job_group_for(&explicit), "batch-g1");
        assert_eq!(ephemeral.job_group_for(&explicit), "compute-uid-4");

        let mut always_on = single_job_profile("always", &["normal"]);
        always_on.scaling_mode = Some(ScalingMode::SingleJob);
        always_on.keep_forever = true;
        always_on.stack_uuid = Some("abcd".to_string());
        assert_eq!(always_on.job_group_for(&explicit), "always-abcd");
        assert!(always_on.is_shared_capacity());
        assert!(!ephemeral.is_shared_capacity());
    }

    #[test]
    fn limit_check() {
        let result = LimitCheckResult::evaluate(LimitType::MaxRunningJobs, 1, 1, 1, true);
        assert!(!result.ok);
        assert_eq!(
            result.to_string(),
            "max_running_jobs (threshold: 1, current: 1, requested: 1)"
        );
        assert!(LimitCheckResult::evaluate(LimitType::MaxProvisionedInstances, 4, 2, 2, true).ok);
    }
}
