use std::time::Duration;

use chrono::{DateTime, Utc};
use drover_id::TransactionId;
use drover_reconcile::{RollingStep, RollingStrategy};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Running,
    /// Waiting for an operator to resume (manual rolling).
    Paused,
    /// A step blew its budget; operator intervention required.
    Suspended,
    Finished,
    Cancelled,
}

impl DeploymentStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, DeploymentStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStrategy {
    pub rolling: RollingStrategy,
    /// Pause after every completed step.
    pub manual: bool,
    /// Budget for one step, from issue to completion.
    pub step_period: Duration,
    /// Minimum time between two steps.
    pub step_interval: Duration,
}

impl Default for DeploymentStrategy {
    fn default() -> Self {
        Self {
            rolling: RollingStrategy::default(),
            manual: false,
            step_period: Duration::from_secs(300),
            step_interval: Duration::from_secs(5),
        }
    }
}

/// Which half of a step is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    /// Scaling the new application up.
    Grow,
    /// Scaling the old application down.
    Shrink,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub step: RollingStep,
    pub phase: StepPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn_id: Option<TransactionId>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RollingState {
    Idle,
    Rolling(StepState),
}

/// A managed transition from one application to another in the same namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub namespace: String,
    pub name: String,

    /// Application being scaled down. `None` once the rollout finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_app: Option<String>,
    /// Application being scaled up; the surviving one at the end.
    pub new_app: String,

    /// Replica count the new application converges to.
    pub instances: u32,
    pub strategy: DeploymentStrategy,
    pub status: DeploymentStatus,
    pub rolling: RollingState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_step_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub steps_completed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    pub fn key(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    pub fn is_rolling(&self) -> bool {
        matches!(self.rolling, RollingState::Rolling(_))
    }
}
