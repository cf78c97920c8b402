//! Notification payloads.

use std::collections::BTreeMap;

use drover_id::TaskGroupId;
use serde::{Deserialize, Serialize};

use crate::{AggregateType, EventError};

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Transactions
    pub const TRANSACTION_TIMEOUT: &str = "transaction.timeout";

    // Task groups
    pub const TASK_GROUP_LOST: &str = "task_group.lost";
    pub const TASK_GROUP_UNHEALTHY: &str = "task_group.unhealthy";
    pub const TASK_GROUP_RESCHEDULED: &str = "task_group.rescheduled";
    pub const TASK_GROUP_RESCHEDULE_EXHAUSTED: &str = "task_group.reschedule_exhausted";

    // Deployments
    pub const DEPLOYMENT_SUSPENDED: &str = "deployment.suspended";

    // Service endpoints
    pub const ENDPOINT_ADDED: &str = "endpoint.added";
    pub const ENDPOINT_UPDATED: &str = "endpoint.updated";
    pub const ENDPOINT_DELETED: &str = "endpoint.deleted";
}

// =============================================================================
// Alerts
// =============================================================================

/// Severity attached to an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

/// What an alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    TransactionTimeout,
    TaskGroupLost,
    TaskGroupUnhealthy,
    TaskGroupRescheduled,
    RescheduleExhausted,
    DeploymentSuspended,
}

impl AlertKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            AlertKind::TransactionTimeout => event_types::TRANSACTION_TIMEOUT,
            AlertKind::TaskGroupLost => event_types::TASK_GROUP_LOST,
            AlertKind::TaskGroupUnhealthy => event_types::TASK_GROUP_UNHEALTHY,
            AlertKind::TaskGroupRescheduled => event_types::TASK_GROUP_RESCHEDULED,
            AlertKind::RescheduleExhausted => event_types::TASK_GROUP_RESCHEDULE_EXHAUSTED,
            AlertKind::DeploymentSuspended => event_types::DEPLOYMENT_SUSPENDED,
        }
    }

    pub fn from_event_type(event_type: &str) -> Result<Self, EventError> {
        match event_type {
            event_types::TRANSACTION_TIMEOUT => Ok(AlertKind::TransactionTimeout),
            event_types::TASK_GROUP_LOST => Ok(AlertKind::TaskGroupLost),
            event_types::TASK_GROUP_UNHEALTHY => Ok(AlertKind::TaskGroupUnhealthy),
            event_types::TASK_GROUP_RESCHEDULED => Ok(AlertKind::TaskGroupRescheduled),
            event_types::TASK_GROUP_RESCHEDULE_EXHAUSTED => Ok(AlertKind::RescheduleExhausted),
            event_types::DEPLOYMENT_SUSPENDED => Ok(AlertKind::DeploymentSuspended),
            other => Err(EventError::UnknownEventType(other.to_string())),
        }
    }

    /// Default severity for this kind of alert.
    pub fn level(&self) -> AlertLevel {
        match self {
            AlertKind::TaskGroupRescheduled => AlertLevel::Info,
            AlertKind::TaskGroupUnhealthy | AlertKind::RescheduleExhausted => AlertLevel::Warning,
            AlertKind::TransactionTimeout
            | AlertKind::TaskGroupLost
            | AlertKind::DeploymentSuspended => AlertLevel::Critical,
        }
    }

    /// Aggregate the alert is keyed on.
    pub fn aggregate_type(&self) -> AggregateType {
        match self {
            AlertKind::TransactionTimeout => AggregateType::Transaction,
            AlertKind::TaskGroupLost
            | AlertKind::TaskGroupUnhealthy
            | AlertKind::TaskGroupRescheduled
            | AlertKind::RescheduleExhausted => AggregateType::TaskGroup,
            AlertKind::DeploymentSuspended => AggregateType::Deployment,
        }
    }
}

/// Payload of an alert notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub kind: AlertKind,
    pub level: AlertLevel,
    pub namespace: String,
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl AlertPayload {
    /// Alert with the default level for `kind`.
    pub fn new(
        kind: AlertKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            level: kind.level(),
            namespace: namespace.into(),
            name: name.into(),
            message: message.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// Service endpoints
// =============================================================================

/// Kind of endpoint change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointChange {
    Added,
    Updated,
    Deleted,
}

impl EndpointChange {
    pub fn event_type(&self) -> &'static str {
        match self {
            EndpointChange::Added => event_types::ENDPOINT_ADDED,
            EndpointChange::Updated => event_types::ENDPOINT_UPDATED,
            EndpointChange::Deleted => event_types::ENDPOINT_DELETED,
        }
    }
}

/// A port published by a pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub name: String,
    pub container_port: u32,
    pub host_port: u32,
    pub protocol: String,
}

/// Snapshot of one pod as seen by service discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPayload {
    pub change: EndpointChange,
    pub namespace: String,
    pub app: String,
    pub task_group_id: TaskGroupId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_ip: Option<String>,
    pub ports: Vec<PortBinding>,
    pub status: String,
    pub healthy: bool,
}
