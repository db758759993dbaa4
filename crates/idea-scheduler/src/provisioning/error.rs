use std::fmt::{Display, Formatter};

use thiserror::Error;

use crate::job::JobId;

/// Stable identifiers of provisioning failures, stored with the job and exposed to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    BudgetExceeded,
    ServiceQuotaNotAvailable,
    ReservedInstancesNotAvailable,
    LicenseNotAvailable,
    DryRunFailed,
    CapacityUpdateInProgress,
    StackInProgress,
    StackDeleteInProgress,
    StackFailed,
    StackTimeout,
    JobGroupMismatch,
    InsufficientCapacity,
    CapacityLimitReached,
    BackendError,
    SchedulerError,
    InvalidConfiguration,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BudgetExceeded => "BUDGET_EXCEEDED",
            ErrorCode::ServiceQuotaNotAvailable => "SERVICE_QUOTA_NOT_AVAILABLE",
            ErrorCode::ReservedInstancesNotAvailable => "RESERVED_INSTANCES_NOT_AVAILABLE",
            ErrorCode::LicenseNotAvailable => "LICENSE_NOT_AVAILABLE",
            ErrorCode::DryRunFailed => "DRY_RUN_FAILED",
            ErrorCode::CapacityUpdateInProgress => "CAPACITY_UPDATE_IN_PROGRESS",
            ErrorCode::StackInProgress => "STACK_IN_PROGRESS",
            ErrorCode::StackDeleteInProgress => "STACK_DELETE_IN_PROGRESS",
            ErrorCode::StackFailed => "STACK_FAILED",
            ErrorCode::StackTimeout => "STACK_TIMEOUT",
            ErrorCode::JobGroupMismatch => "JOB_GROUP_MISMATCH",
            ErrorCode::InsufficientCapacity => "INSUFFICIENT_CAPACITY",
            ErrorCode::CapacityLimitReached => "CAPACITY_LIMIT_REACHED",
            ErrorCode::BackendError => "BACKEND_ERROR",
            ErrorCode::SchedulerError => "SCHEDULER_ERROR",
            ErrorCode::InvalidConfiguration => "INVALID_CONFIGURATION",
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a provisioning attempt. The variant decides how the provisioner proceeds.
#[derive(Debug, Clone, Error)]
pub enum ProvisioningError {
    /// Transient condition, the jobs are retried later.
    #[error("{code}: {reason}")]
    Retryable { code: ErrorCode, reason: String },
    /// Some jobs of a batch were provisioned, the rest has to be queued again.
    #[error(
        "{code}: {reason} ({} jobs provisioned, {} not provisioned)",
        .provisioned.len(),
        .unprovisioned.len()
    )]
    PartialBatchFailure {
        provisioned: Vec<JobId>,
        unprovisioned: Vec<JobId>,
        code: ErrorCode,
        reason: String,
    },
    /// Retrying this attempt does not help, the jobs are left to reconciliation.
    #[error("{code}: {reason}")]
    Terminal { code: ErrorCode, reason: String },
    #[error("INVALID_CONFIGURATION: {reason}")]
    ConfigError { reason: String },
}

pub type ProvisioningResult<T> = Result<T, ProvisioningError>;

impl ProvisioningError {
    pub fn retryable(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self::Retryable {
            code,
            reason: reason.into(),
        }
    }

    pub fn terminal(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self::Terminal {
            code,
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::ConfigError {
            reason: reason.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ProvisioningError::Retryable { code, .. }
            | ProvisioningError::PartialBatchFailure { code, .. }
            | ProvisioningError::Terminal { code, .. } => *code,
            ProvisioningError::ConfigError { .. } => ErrorCode::InvalidConfiguration,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            ProvisioningError::Retryable { reason, .. }
            | ProvisioningError::PartialBatchFailure { reason, .. }
            | ProvisioningError::Terminal { reason, .. }
            | ProvisioningError::ConfigError { reason } => reason,
        }
    }

    /// Whether the provisioner should stop retrying the current batch and leave the jobs to
    /// reconciliation instead of blocking the queue.
    pub fn stops_retry(&self) -> bool {
        match self {
            ProvisioningError::Terminal { .. } | ProvisioningError::ConfigError { .. } => true,
            ProvisioningError::Retryable { code, .. } => *code == ErrorCode::LicenseNotAvailable,
            ProvisioningError::PartialBatchFailure { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorCode, ProvisioningError};

    #[test]
    fn classification() {
        assert!(ProvisioningError::retryable(ErrorCode::LicenseNotAvailable, "x").stops_retry());
        assert!(!ProvisioningError::retryable(ErrorCode::StackInProgress, "x").stops_retry());
        assert!(ProvisioningError::terminal(ErrorCode::StackFailed, "x").stops_retry());
        assert!(ProvisioningError::config("x").stops_retry());
        assert_eq!(
            ProvisioningError::config("x").code(),
            ErrorCode::InvalidConfiguration
        );
    }

    #[test]
    fn display() {
        let error = ProvisioningError::PartialBatchFailure {
            provisioned: vec!["1".to_string()],
            unprovisioned: vec!["2".to_string(), "3".to_string()],
            code: ErrorCode::CapacityLimitReached,
            reason: "limit".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "CAPACITY_LIMIT_REACHED: limit (1 jobs provisioned, 2 not provisioned)"
        );
        assert_eq!(
            ProvisioningError::retryable(ErrorCode::BudgetExceeded, "over").to_string(),
            "BUDGET_EXCEEDED: over"
        );
    }
}
