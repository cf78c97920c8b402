//! Resource-manager driver.
//!
//! The scheduler talks to the cluster resource manager through the
//! [`ClusterDriver`] trait:
//! - SUBSCRIBE opens the event stream ([`SchedulerEvent`])
//! - LAUNCH_GROUP accepts an offer with one pod
//! - DECLINE, SHUTDOWN, ACKNOWLEDGE, MESSAGE and RECONCILE are fire-and-confirm calls
//!
//! [`HttpDriver`] speaks the JSON scheduler API; [`MockDriver`] records calls
//! and lets tests inject events.

mod http;
mod mock;
mod recordio;
mod wire;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drover_id::CommandId;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::builder::LaunchGroup;
use crate::config::ClusterConfig;
use crate::model::{Offer, Resource, TaskStatus};

pub use http::HttpDriver;
pub use mock::{DriverCall, MockDriver};
pub use recordio::RecordIoDecoder;

/// Errors from the resource manager or the transport to it.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("resource manager returned {code}: {body}")]
    Status { code: u16, body: String },

    #[error("malformed event: {0}")]
    Decode(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not subscribed")]
    NotSubscribed,

    #[error("no resource manager reachable")]
    NoMaster,

    #[error("event stream closed")]
    StreamClosed,

    #[error("rejected: {0}")]
    Rejected(String),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Stream of events from one subscription.
pub type EventStream = BoxStream<'static, DriverResult<SchedulerEvent>>;

/// Framework registration details.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameworkInfo {
    /// Set when resubscribing with a previously assigned id.
    pub id: Option<String>,
    pub name: String,
    pub user: String,
    pub role: String,
    pub failover_timeout: Duration,
}

impl FrameworkInfo {
    pub fn from_config(config: &ClusterConfig, id: Option<String>) -> Self {
        Self {
            id,
            name: config.framework_name.clone(),
            user: config.framework_user.clone(),
            role: config.framework_role.clone(),
            failover_timeout: config.failover_timeout,
        }
    }
}

/// A task status report, already mapped onto [`TaskStatus`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub task_id: String,
    pub state: TaskStatus,
    pub agent_id: Option<String>,
    pub healthy: Option<bool>,
    pub message: Option<String>,
    pub reason: Option<String>,
    /// Present when the update must be acknowledged.
    pub uuid: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// The report as received.
    pub raw: serde_json::Value,
}

/// Payload sent to a pod executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorMessage {
    /// Grow the pod's reservation in place.
    UpdateResources {
        task_group_id: String,
        resources: Resource,
    },
    Exec {
        command_id: CommandId,
        task_id: String,
        command: String,
    },
    Signal {
        task_id: String,
        signal: i32,
    },
}

/// Payload received from a pod executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutorReport {
    Health {
        task_id: String,
        healthy: bool,
    },
    CommandResult {
        command_id: CommandId,
        task_id: String,
        exit_code: i32,
        #[serde(default)]
        output: Option<String>,
    },
    ResourcesUpdated {
        task_group_id: String,
        resources: Resource,
    },
}

/// Events delivered on the subscription stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    Subscribed {
        framework_id: String,
        heartbeat_interval: Option<Duration>,
    },
    Offers(Vec<Offer>),
    Rescind {
        offer_id: String,
    },
    Update(StatusUpdate),
    Message {
        agent_id: String,
        executor_id: String,
        report: ExecutorReport,
    },
    /// Agent failure when `executor_id` is `None`, executor exit otherwise.
    Failure {
        agent_id: String,
        executor_id: Option<String>,
        status: Option<i32>,
    },
    Error {
        message: String,
    },
    Heartbeat,
}

impl SchedulerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerEvent::Subscribed { .. } => "SUBSCRIBED",
            SchedulerEvent::Offers(_) => "OFFERS",
            SchedulerEvent::Rescind { .. } => "RESCIND",
            SchedulerEvent::Update(_) => "UPDATE",
            SchedulerEvent::Message { .. } => "MESSAGE",
            SchedulerEvent::Failure { .. } => "FAILURE",
            SchedulerEvent::Error { .. } => "ERROR",
            SchedulerEvent::Heartbeat => "HEARTBEAT",
        }
    }
}

/// Calls into the resource manager.
#[async_trait]
pub trait ClusterDriver: Send + Sync {
    /// Registers the framework and opens the event stream.
    async fn subscribe(&self, framework: &FrameworkInfo) -> DriverResult<EventStream>;

    /// Accepts the group's offer, launching one pod on it.
    async fn launch(&self, group: &LaunchGroup) -> DriverResult<()>;

    async fn decline(&self, offer_ids: &[String], refuse: Duration) -> DriverResult<()>;

    /// Stops a pod executor and every task in it.
    async fn shutdown(&self, agent_id: &str, executor_id: &str) -> DriverResult<()>;

    async fn acknowledge(&self, agent_id: &str, task_id: &str, uuid: &str) -> DriverResult<()>;

    async fn message(&self, agent_id: &str, executor_id: &str, message: &ExecutorMessage) -> DriverResult<()>;

    /// Asks for the latest status of the given `(task_id, agent_id)` pairs.
    async fn reconcile(&self, tasks: &[(String, String)]) -> DriverResult<()>;
}
