use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use drover_id::{TaskGroupId, TransactionId};
use serde::{Deserialize, Serialize};

use super::WorkloadKind;

/// Externally visible application state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppStatus {
    /// A user transaction is in flight.
    Operating,
    /// Part of a deployment in progress.
    RollingUpdate,
    Deploying,
    Running,
    Abnormal,
    Finish,
    Error,
}

impl AppStatus {
    /// Statuses during which aggregation only adjusts counters.
    pub fn is_frozen(&self) -> bool {
        matches!(self, AppStatus::Operating | AppStatus::RollingUpdate)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AppStatus::Operating => "OPERATING",
            AppStatus::RollingUpdate => "ROLLING_UPDATE",
            AppStatus::Deploying => "DEPLOYING",
            AppStatus::Running => "RUNNING",
            AppStatus::Abnormal => "ABNORMAL",
            AppStatus::Finish => "FINISH",
            AppStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate root of one workload's replica set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub namespace: String,
    pub name: String,
    pub cluster: String,
    pub kind: WorkloadKind,

    /// Desired replica count.
    pub instances: u32,
    /// Pods currently RUNNING.
    pub running_instances: u32,

    pub current_version: String,

    pub status: AppStatus,
    /// Status before the most recent transition.
    pub last_status: Option<AppStatus>,

    /// Pods by replica index.
    #[serde(default)]
    pub task_groups: BTreeMap<u32, TaskGroupId>,

    /// User transaction currently owning the application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<TransactionId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Application {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        cluster: impl Into<String>,
        kind: WorkloadKind,
        instances: u32,
        version_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            cluster: cluster.into(),
            kind,
            instances,
            running_instances: 0,
            current_version: version_id.into(),
            status: AppStatus::Operating,
            last_status: None,
            task_groups: BTreeMap::new(),
            operation: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// `namespace.name`.
    pub fn key(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    /// Moves to `status`, remembering the previous one. Returns whether it changed.
    pub fn set_status(&mut self, status: AppStatus, now: DateTime<Utc>) -> bool {
        if self.status == status {
            return false;
        }
        self.last_status = Some(self.status);
        self.status = status;
        self.updated_at = now;
        true
    }

    pub fn attach(&mut self, id: &TaskGroupId) {
        self.task_groups.insert(id.index(), id.clone());
    }

    /// Drops the reference if it still points at `id`.
    pub fn detach(&mut self, id: &TaskGroupId) {
        if self.task_groups.get(&id.index()) == Some(id) {
            self.task_groups.remove(&id.index());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_status_records_last() {
        let now = Utc::now();
        let mut app = Application::new("prod", "web", "c1", WorkloadKind::Application, 3, "v1", now);
        assert!(app.set_status(AppStatus::Running, now));
        assert!(!app.set_status(AppStatus::Running, now));
        assert_eq!(app.last_status, Some(AppStatus::Operating));
        assert_eq!(app.key(), "prod.web");
    }

    #[test]
    fn test_detach_ignores_stale_reference() {
        let now = Utc::now();
        let mut app = Application::new("prod", "web", "c1", WorkloadKind::Application, 1, "v1", now);
        let old = TaskGroupId::new(0, "web", "prod", "c1", 1).unwrap();
        let new = TaskGroupId::new(0, "web", "prod", "c1", 2).unwrap();
        app.attach(&new);
        app.detach(&old);
        assert_eq!(app.task_groups.get(&0), Some(&new));
        app.detach(&new);
        assert!(app.task_groups.is_empty());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&AppStatus::RollingUpdate).unwrap(),
            "\"ROLLING_UPDATE\""
        );
        assert!(AppStatus::Operating.is_frozen());
        assert!(!AppStatus::Abnormal.is_frozen());
    }
}
