use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use drover_id::{TaskGroupId, TransactionId};
use serde::{Deserialize, Serialize};

use super::Resource;
use crate::clock::after;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Init,
    Finish,
    Fail,
    Timeout,
}

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Init)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionStatus::Init => "INIT",
            TransactionStatus::Finish => "FINISH",
            TransactionStatus::Fail => "FAIL",
            TransactionStatus::Timeout => "TIMEOUT",
        };
        f.write_str(s)
    }
}

/// Launch the full replica set of a new application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchOp {
    pub version_id: String,
    pub instances: u32,
    #[serde(default)]
    pub launched: u32,
}

/// Move the replica count to `target`, in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleOp {
    pub version_id: String,
    pub target: u32,
    #[serde(default)]
    pub launched: u32,
}

/// Whether a replace-style operation is waiting on the old pod or placing the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillPhase {
    #[default]
    Kill,
    Launch,
}

/// Replace every pod, index by index, with one built from `version_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateOp {
    pub version_id: String,
    pub indices: Vec<u32>,
    #[serde(default)]
    pub cursor: usize,
    #[serde(default)]
    pub phase: KillPhase,
}

/// Rebuild one pod under a fresh identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RescheduleOp {
    pub task_group_id: TaskGroupId,
    /// Replace the pod even if it is running again.
    pub force: bool,
    #[serde(default)]
    pub phase: KillPhase,
    /// Counter carried by the replacement pod.
    pub resched_times: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retain_host: Option<String>,
    #[serde(default)]
    pub retention_secs: u64,
    /// Set once the old pod is gone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retain_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOp {
    /// Remove pods without waiting for them to stop.
    pub enforce: bool,
}

/// Grow every pod's reservation in place by `delta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateResourceOp {
    pub delta: Resource,
    pub indices: Vec<u32>,
    #[serde(default)]
    pub cursor: usize,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Operation payload, one variant per transaction type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Launch(LaunchOp),
    Scale(ScaleOp),
    /// Scale issued by the deployment controller; leaves the application status alone.
    InnerScale(ScaleOp),
    Update(UpdateOp),
    Reschedule(RescheduleOp),
    Delete(DeleteOp),
    UpdateResource(UpdateResourceOp),
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Launch(_) => "launch",
            Operation::Scale(_) => "scale",
            Operation::InnerScale(_) => "inner_scale",
            Operation::Update(_) => "update",
            Operation::Reschedule(_) => "reschedule",
            Operation::Delete(_) => "delete",
            Operation::UpdateResource(_) => "update_resource",
        }
    }

    /// Whether this operation may need held offers to make progress.
    ///
    /// In-place resource updates measure agent headroom against held offers.
    pub fn consumes_offers(&self) -> bool {
        matches!(
            self,
            Operation::Launch(_)
                | Operation::Scale(_)
                | Operation::InnerScale(_)
                | Operation::Update(_)
                | Operation::Reschedule(_)
                | Operation::UpdateResource(_)
        )
    }
}

/// A timeout-bounded request to change an application's or pod's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub namespace: String,
    pub name: String,
    pub operation: Operation,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    /// Do not start before `created_at + delay`.
    pub delay: Duration,
    /// Hard deadline, counted from the start time.
    pub life_period: Duration,
    /// Issued by the scheduler itself rather than a user.
    pub is_inner: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Consecutive steps that found no usable offer.
    #[serde(default)]
    pub schedule_attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        operation: Operation,
        now: DateTime<Utc>,
        life_period: Duration,
    ) -> Self {
        Self {
            id: TransactionId::new(),
            namespace: namespace.into(),
            name: name.into(),
            operation,
            status: TransactionStatus::Init,
            created_at: now,
            delay: Duration::ZERO,
            life_period,
            is_inner: false,
            message: None,
            schedule_attempts: 0,
            updated_at: now,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn inner(mut self) -> Self {
        self.is_inner = true;
        self
    }

    pub fn app_key(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    pub fn start_at(&self) -> DateTime<Utc> {
        after(self.created_at, self.delay)
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        after(self.start_at(), self.life_period)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Live, started, and of a kind that places pods.
    pub fn wants_offers(&self, now: DateTime<Utc>) -> bool {
        !self.is_terminal() && now >= self.start_at() && self.operation.consumes_offers()
    }

    pub fn finish(&mut self, now: DateTime<Utc>) {
        self.status = TransactionStatus::Finish;
        self.updated_at = now;
    }

    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = TransactionStatus::Fail;
        self.message = Some(message.into());
        self.updated_at = now;
    }

    pub fn timeout(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = TransactionStatus::Timeout;
        self.message = Some(message.into());
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    #[test]
    fn test_deadline_includes_delay() {
        let clock = ManualClock::at_epoch();
        let now = clock.now();
        let txn = Transaction::new(
            "prod",
            "web",
            Operation::Delete(DeleteOp { enforce: false }),
            now,
            Duration::from_secs(60),
        )
        .with_delay(Duration::from_secs(30));

        assert_eq!(txn.start_at(), after(now, Duration::from_secs(30)));
        assert_eq!(txn.deadline(), after(now, Duration::from_secs(90)));
        assert!(!txn.wants_offers(now));
    }

    #[test]
    fn test_operation_tagged_serialization() {
        let op = Operation::InnerScale(ScaleOp {
            version_id: "v1".into(),
            target: 2,
            launched: 0,
        });
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "inner_scale");
        assert_eq!(json["target"], 2);
        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_terminal_transitions() {
        let now = Utc::now();
        let mut txn = Transaction::new(
            "prod",
            "web",
            Operation::Launch(LaunchOp {
                version_id: "v1".into(),
                instances: 1,
                launched: 0,
            }),
            now,
            Duration::from_secs(60),
        );
        assert!(txn.wants_offers(now));
        txn.timeout("resources insufficient", now);
        assert!(txn.is_terminal());
        assert!(!txn.wants_offers(now));
        assert_eq!(txn.status.to_string(), "TIMEOUT");
    }
}
