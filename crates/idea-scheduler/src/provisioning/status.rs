use std::fmt::{Display, Formatter};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::backend::{StackInfo, StackStatus};
use crate::common::timeutils::elapsed_between;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisioningStatus {
    NotProvisioned,
    InProgress,
    Completed,
    DeleteInProgress,
    Failed,
    Timeout,
}

impl Display for ProvisioningStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ProvisioningStatus::NotProvisioned => "NOT_PROVISIONED",
            ProvisioningStatus::InProgress => "IN_PROGRESS",
            ProvisioningStatus::Completed => "COMPLETED",
            ProvisioningStatus::DeleteInProgress => "DELETE_IN_PROGRESS",
            ProvisioningStatus::Failed => "FAILED",
            ProvisioningStatus::Timeout => "TIMEOUT",
        })
    }
}

/// Capacity providing stack of a job group and its evaluated status.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisioningCapacityInfo {
    pub stack_name: String,
    pub status: ProvisioningStatus,
    pub stack: Option<StackInfo>,
}

impl ProvisioningCapacityInfo {
    pub fn stack_id(&self) -> Option<&str> {
        self.stack.as_ref().map(|s| s.stack_id.as_str())
    }
}

/// Maps the backend status of a stack to its provisioning status.
///
/// A completed stack that is not shared times out when it is older than `timeout`, shared
/// stacks never time out.
pub fn evaluate_stack_status(
    stack: Option<&StackInfo>,
    timeout: Duration,
    now: DateTime<Utc>,
) -> ProvisioningStatus {
    let Some(stack) = stack else {
        return ProvisioningStatus::NotProvisioned;
    };
    match stack.status {
        StackStatus::CreateComplete
        | StackStatus::UpdateComplete
        | StackStatus::UpdateRollbackComplete => {
            if stack.is_shared_resource {
                ProvisioningStatus::Completed
            } else if elapsed_between(stack.creation_time, now) > timeout {
                ProvisioningStatus::Timeout
            } else {
                ProvisioningStatus::Completed
            }
        }
        StackStatus::CreateInProgress | StackStatus::UpdateInProgress => {
            ProvisioningStatus::InProgress
        }
        StackStatus::DeleteInProgress => ProvisioningStatus::DeleteInProgress,
        StackStatus::CreateFailed
        | StackStatus::RollbackInProgress
        | StackStatus::RollbackComplete
        | StackStatus::RollbackFailed
        | StackStatus::DeleteFailed => ProvisioningStatus::Failed,
        StackStatus::DeleteComplete => ProvisioningStatus::NotProvisioned,
    }
}
