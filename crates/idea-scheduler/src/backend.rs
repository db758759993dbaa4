//! Interface of the capacity provisioning backend (stack templates, fleets and autoscaling
//! groups).
use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{CapacityType, InstanceTypeOption, JobId, JobParams};

#[derive(Debug, Error)]
pub enum BackendError {
    /// The stack or resource does not exist (anymore).
    #[error("Resource not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StackStatus {
    CreateInProgress,
    CreateComplete,
    CreateFailed,
    RollbackInProgress,
    RollbackComplete,
    RollbackFailed,
    UpdateInProgress,
    UpdateComplete,
    UpdateRollbackComplete,
    DeleteInProgress,
    DeleteComplete,
    DeleteFailed,
}

impl Display for StackStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StackStatus::CreateInProgress => "CREATE_IN_PROGRESS",
            StackStatus::CreateComplete => "CREATE_COMPLETE",
            StackStatus::CreateFailed => "CREATE_FAILED",
            StackStatus::RollbackInProgress => "ROLLBACK_IN_PROGRESS",
            StackStatus::RollbackComplete => "ROLLBACK_COMPLETE",
            StackStatus::RollbackFailed => "ROLLBACK_FAILED",
            StackStatus::UpdateInProgress => "UPDATE_IN_PROGRESS",
            StackStatus::UpdateComplete => "UPDATE_COMPLETE",
            StackStatus::UpdateRollbackComplete => "UPDATE_ROLLBACK_COMPLETE",
            StackStatus::DeleteInProgress => "DELETE_IN_PROGRESS",
            StackStatus::DeleteComplete => "DELETE_COMPLETE",
            StackStatus::DeleteFailed => "DELETE_FAILED",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackInfo {
    pub stack_name: String,
    pub stack_id: String,
    pub status: StackStatus,
    pub creation_time: DateTime<Utc>,
    /// The stack is kept for more jobs (keep_forever or terminate_when_idle).
    pub is_shared_resource: bool,
    pub job_group: Option<String>,
    pub queue_profile: Option<String>,
    pub queues: Vec<String>,
}

/// Resource that provides the capacity of a stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapacityResource {
    SpotFleet { fleet_id: String },
    AutoScalingGroup { name: String },
}

impl Display for CapacityResource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CapacityResource::SpotFleet { fleet_id } => write!(f, "spot fleet {fleet_id}"),
            CapacityResource::AutoScalingGroup { name } => write!(f, "autoscaling group {name}"),
        }
    }
}

/// Spot fleet request states in which the target capacity can be modified.
const MODIFIABLE_FLEET_ACTIVITY: &[&str] = &["fulfilled", "error"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetCapacity {
    pub target_capacity: u32,
    pub fulfilled_capacity: u32,
    /// Spot fleet request state (`active`, `modifying`, ...), not used by autoscaling groups.
    pub request_state: Option<String>,
    pub activity_status: Option<String>,
}

impl FleetCapacity {
    pub fn is_modifiable(&self, resource: &CapacityResource) -> bool {
        match resource {
            CapacityResource::AutoScalingGroup { .. } => true,
            CapacityResource::SpotFleet { .. } => {
                self.request_state.as_deref() == Some("active")
                    && self
                        .activity_status
                        .as_deref()
                        .is_some_and(|s| MODIFIABLE_FLEET_ACTIVITY.contains(&s))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackRequest {
    pub stack_name: String,
    pub cluster_name: String,
    pub queue_profile: String,
    pub queues: Vec<String>,
    pub job_group: String,
    pub job_ids: Vec<JobId>,
    /// Parameters of the first job of the batch, all jobs of a group share the shape.
    pub params: JobParams,
    pub capacity_type: CapacityType,
    pub target_capacity: u32,
    pub is_shared_resource: bool,
    pub keep_forever: bool,
    pub terminate_when_idle: u32,
}

pub trait ProvisioningBackend: Send + Sync {
    /// Builds a new stack, returns its id.
    fn build(&self, request: StackRequest) -> BoxFuture<'_, BackendResult<String>>;

    fn describe_stack<'a>(&'a self, stack_name: &'a str) -> BoxFuture<'a, BackendResult<StackInfo>>;

    fn describe_stack_resources<'a>(
        &'a self,
        stack_name: &'a str,
    ) -> BoxFuture<'a, BackendResult<CapacityResource>>;

    fn describe_capacity<'a>(
        &'a self,
        resource: &'a CapacityResource,
    ) -> BoxFuture<'a, BackendResult<FleetCapacity>>;

    fn modify_target_capacity<'a>(
        &'a self,
        resource: &'a CapacityResource,
        target_capacity: u32,
    ) -> BoxFuture<'a, BackendResult<()>>;

    fn delete_stack<'a>(&'a self, stack_name: &'a str) -> BoxFuture<'a, BackendResult<()>>;

    /// Validates that an instance of `instance_type` could be launched with `params`.
    fn dry_run<'a>(
        &'a self,
        instance_type: &'a str,
        params: &'a JobParams,
    ) -> BoxFuture<'a, BackendResult<()>>;

    fn describe_instance_types<'a>(
        &'a self,
        instance_types: &'a [String],
    ) -> BoxFuture<'a, BackendResult<Vec<InstanceTypeOption>>>;
}

#[cfg(test)]
mod tests {
    use super::{CapacityResource, FleetCapacity, StackStatus};

    fn capacity(request_state: Option<&str>, activity: Option<&str>) -> FleetCapacity {
        FleetCapacity {
            target_capacity: 1,
            fulfilled_capacity: 1,
            request_state: request_state.map(|s| s.to_string()),
            activity_status: activity.map(|s| s.to_string()),
        }
    }

    #[test]
    fn spot_fleet_modifiable_states() {
        let fleet = CapacityResource::SpotFleet {
            fleet_id: "sfr-1".to_string(),
        };
        assert!(capacity(Some("active"), Some("fulfilled")).is_modifiable(&fleet));
        assert!(capacity(Some("active"), Some("error")).is_modifiable(&fleet));
        assert!(!capacity(Some("modifying"), Some("fulfilled")).is_modifiable(&fleet));
        assert!(!capacity(Some("active"), Some("pending_fulfillment")).is_modifiable(&fleet));
        assert!(!capacity(None, None).is_modifiable(&fleet));

        let asg = CapacityResource::AutoScalingGroup {
            name: "asg".to_string(),
        };
        assert!(capacity(None, None).is_modifiable(&asg));
    }

    #[test]
    fn stack_status_display() {
        assert_eq!(StackStatus::CreateComplete.to_string(), "CREATE_COMPLETE");
        assert_eq!(StackStatus::DeleteInProgress.to_string(), "DELETE_IN_PROGRESS");
    }
}
