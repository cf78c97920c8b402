//! Persistent store contract.
//!
//! The scheduler only depends on CRUD and list operations over its model plus
//! advisory locks ([`LockManager`]); the storage engine behind [`Store`] is a
//! collaborator. [`MemoryStore`] is the in-process implementation.

mod lock;
mod memory;

use async_trait::async_trait;
use drover_id::{CommandId, TaskGroupId, TransactionId};
use thiserror::Error;

use crate::model::{AgentLedger, Application, Command, Deployment, TaskGroup, Transaction, Version};

pub use lock::{KeyedLocks, LockManager};
pub use memory::MemoryStore;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind,
            key: key.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// CRUD over the scheduler's persisted model.
///
/// Keys are `namespace` + `name` for applications, versions and deployments;
/// pods are keyed by their full id and listed per application in index order.
#[async_trait]
pub trait Store: Send + Sync {
    // Applications
    async fn create_application(&self, app: &Application) -> StoreResult<()>;
    async fn get_application(&self, namespace: &str, name: &str) -> StoreResult<Option<Application>>;
    /// Fails with `NotFound` if the application was deleted meanwhile.
    async fn update_application(&self, app: &Application) -> StoreResult<()>;
    async fn delete_application(&self, namespace: &str, name: &str) -> StoreResult<()>;
    async fn list_applications(&self) -> StoreResult<Vec<Application>>;

    // Versions
    async fn put_version(&self, version: &Version) -> StoreResult<()>;
    async fn get_version(&self, namespace: &str, name: &str, id: &str) -> StoreResult<Option<Version>>;
    async fn list_versions(&self, namespace: &str, name: &str) -> StoreResult<Vec<Version>>;
    async fn delete_versions(&self, namespace: &str, name: &str) -> StoreResult<()>;

    // Pods (tasks are stored inside their pod)
    async fn put_task_group(&self, group: &TaskGroup) -> StoreResult<()>;
    async fn get_task_group(&self, id: &TaskGroupId) -> StoreResult<Option<TaskGroup>>;
    async fn list_task_groups(&self, namespace: &str, name: &str) -> StoreResult<Vec<TaskGroup>>;
    async fn delete_task_group(&self, id: &TaskGroupId) -> StoreResult<()>;

    // Transactions
    async fn put_transaction(&self, txn: &Transaction) -> StoreResult<()>;
    async fn get_transaction(&self, id: &TransactionId) -> StoreResult<Option<Transaction>>;
    async fn list_transactions(&self) -> StoreResult<Vec<Transaction>>;
    async fn delete_transaction(&self, id: &TransactionId) -> StoreResult<()>;

    // Deployments
    async fn put_deployment(&self, deployment: &Deployment) -> StoreResult<()>;
    async fn get_deployment(&self, namespace: &str, name: &str) -> StoreResult<Option<Deployment>>;
    async fn list_deployments(&self) -> StoreResult<Vec<Deployment>>;
    async fn delete_deployment(&self, namespace: &str, name: &str) -> StoreResult<()>;

    // Commands
    async fn put_command(&self, command: &Command) -> StoreResult<()>;
    async fn get_command(&self, id: &CommandId) -> StoreResult<Option<Command>>;

    // Agent ledgers
    async fn get_ledger(&self, agent_id: &str) -> StoreResult<Option<AgentLedger>>;
    async fn put_ledger(&self, ledger: &AgentLedger) -> StoreResult<()>;
    async fn list_ledgers(&self) -> StoreResult<Vec<AgentLedger>>;

    // Framework identity, kept for resubscription across restarts
    async fn save_framework_id(&self, id: &str) -> StoreResult<()>;
    async fn framework_id(&self) -> StoreResult<Option<String>>;
}
