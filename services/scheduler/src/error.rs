//! Scheduler error types.

use drover_id::IdError;

use crate::builder::BuildError;
use crate::control::LoopError;
use crate::driver::DriverError;
use crate::store::StoreError;

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that can occur while scheduling.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("build error: {0}")]
    Build(#[from] BuildError),

    #[error("invalid id: {0}")]
    Id(#[from] IdError),

    #[error("control loop error: {0}")]
    Loop(#[from] LoopError),

    #[error("application {0} not found")]
    AppNotFound(String),

    #[error("task group {0} not found")]
    TaskGroupNotFound(String),

    #[error("version {0} not found")]
    VersionNotFound(String),

    #[error("deployment {0} not found")]
    DeploymentNotFound(String),

    #[error("{key} is {status}, cannot {action}")]
    InvalidState {
        key: String,
        status: String,
        action: &'static str,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl SchedulerError {
    pub fn invalid_state(key: impl Into<String>, status: impl ToString, action: &'static str) -> Self {
        SchedulerError::InvalidState {
            key: key.into(),
            status: status.to_string(),
            action,
        }
    }

    /// Whether the error describes a missing entity rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SchedulerError::AppNotFound(_)
                | SchedulerError::TaskGroupNotFound(_)
                | SchedulerError::VersionNotFound(_)
                | SchedulerError::DeploymentNotFound(_)
        ) || matches!(self, SchedulerError::Store(e) if e.is_not_found())
    }
}
