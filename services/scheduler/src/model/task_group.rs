use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use drover_id::{TaskGroupId, TaskId};
use drover_reconcile::SpecHash;
use serde::{Deserialize, Serialize};

use super::Resource;

/// Status of a single task as reported by the resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Staging,
    Starting,
    Running,
    Finish,
    Error,
    Fail,
    Killing,
    Killed,
    Lost,
    Restarting,
}

impl TaskStatus {
    /// Statuses that later reports cannot overwrite.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Finish | TaskStatus::Killed | TaskStatus::Fail | TaskStatus::Error
        )
    }

    /// Statuses in which the task may still be consuming its executor.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            TaskStatus::Staging
                | TaskStatus::Starting
                | TaskStatus::Running
                | TaskStatus::Killing
                | TaskStatus::Restarting
        )
    }
}

/// Aggregate status of a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskGroupStatus {
    Unknown,
    Staging,
    Starting,
    Running,
    Restarting,
    Killing,
    Killed,
    Finish,
    Fail,
    Error,
    Lost,
}

impl TaskGroupStatus {
    /// A pod in one of these statuses no longer runs anything we track.
    pub fn is_end(&self) -> bool {
        matches!(
            self,
            TaskGroupStatus::Finish
                | TaskGroupStatus::Killed
                | TaskGroupStatus::Fail
                | TaskGroupStatus::Error
                | TaskGroupStatus::Lost
        )
    }

    /// Transitions into these statuses are fed to the reschedule policy.
    pub fn triggers_reschedule(&self) -> bool {
        matches!(
            self,
            TaskGroupStatus::Fail | TaskGroupStatus::Lost | TaskGroupStatus::Finish
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskGroupStatus::Unknown => "UNKNOWN",
            TaskGroupStatus::Staging => "STAGING",
            TaskGroupStatus::Starting => "STARTING",
            TaskGroupStatus::Running => "RUNNING",
            TaskGroupStatus::Restarting => "RESTARTING",
            TaskGroupStatus::Killing => "KILLING",
            TaskGroupStatus::Killed => "KILLED",
            TaskGroupStatus::Finish => "FINISH",
            TaskGroupStatus::Fail => "FAIL",
            TaskGroupStatus::Error => "ERROR",
            TaskGroupStatus::Lost => "LOST",
        }
    }
}

impl fmt::Display for TaskGroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A host port bound for one container port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedPort {
    pub name: String,
    pub container_port: u32,
    pub host_port: u32,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Container name.
    pub name: String,
    pub status: TaskStatus,
    /// Whether the container declares a health check.
    pub has_health_check: bool,
    /// `None` until the first health report.
    pub healthy: Option<bool>,
    /// Timestamp of the last applied status report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Last status report as received.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_status: Option<serde_json::Value>,
}

impl Task {
    /// Checked and healthy, or no health check to satisfy.
    pub fn is_ready(&self) -> bool {
        !self.has_health_check || self.healthy == Some(true)
    }
}

/// One replica of an application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub id: TaskGroupId,
    pub version_id: String,
    pub version_hash: SpecHash,
    pub status: TaskGroupStatus,
    pub tasks: Vec<Task>,

    pub agent_id: String,
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_ip: Option<String>,
    /// Agent attributes at launch time, for placement of later pods.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub offer_id: String,
    #[serde(default)]
    pub ports: Vec<AllocatedPort>,

    /// Reservation at launch.
    pub resources: Resource,
    /// Reservation after in-place updates.
    pub current_resources: Resource,

    pub resched_times: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_resched_time: Option<DateTime<Utc>>,
    /// Start of the current continuous RUNNING period.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kill_requested_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskGroup {
    pub fn index(&self) -> u32 {
        self.id.index()
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| &t.id == id)
    }

    pub fn has_running_task(&self) -> bool {
        self.tasks.iter().any(|t| t.status == TaskStatus::Running)
    }

    /// Whether no task is left running. A LOST pod may still have RUNNING
    /// siblings of the lost task.
    pub fn is_drained(&self) -> bool {
        self.tasks.iter().all(|t| !t.status.is_live())
    }

    /// RUNNING with every health-checked task reporting healthy.
    pub fn is_ready(&self) -> bool {
        self.status == TaskGroupStatus::Running && self.tasks.iter().all(Task::is_ready)
    }

    /// Any task has been checked and found unhealthy.
    pub fn is_unhealthy(&self) -> bool {
        self.tasks.iter().any(|t| t.healthy == Some(false))
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        match name {
            "hostname" => Some(&self.hostname),
            "agentip" => self.agent_ip.as_deref(),
            _ => self.attributes.get(name).map(String::as_str),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses_are_sticky_set() {
        assert!(TaskStatus::Killed.is_terminal());
        assert!(!TaskStatus::Lost.is_terminal());
        assert!(TaskStatus::Killing.is_live());
        assert!(!TaskStatus::Lost.is_live());
    }

    #[test]
    fn test_task_ready_requires_check_only_when_declared() {
        let id = TaskGroupId::new(0, "web", "prod", "c1", 1).unwrap();
        let mut task = Task {
            id: id.task(0),
            name: "main".into(),
            status: TaskStatus::Running,
            has_health_check: false,
            healthy: None,
            updated_at: None,
            message: None,
            raw_status: None,
        };
        assert!(task.is_ready());
        task.has_health_check = true;
        assert!(!task.is_ready());
        task.healthy = Some(true);
        assert!(task.is_ready());
    }
}
