//! Persisted domain model.
//!
//! Every type here is plain data: serde-serializable, owned, and free of
//! behaviour that needs I/O. State machines live in the transaction,
//! status and deployment modules.

mod application;
mod command;
mod deployment;
mod ledger;
mod resource;
mod task_group;
mod transaction;
mod version;

pub use application::{AppStatus, Application};
pub use command::{Command, CommandKind, CommandResult, CommandState};
pub use deployment::{Deployment, DeploymentStatus, DeploymentStrategy, RollingState, StepPhase, StepState};
pub use ledger::AgentLedger;
pub use resource::{Offer, PortRange, Resource};
pub use task_group::{AllocatedPort, Task, TaskGroup, TaskGroupStatus, TaskStatus};
pub use transaction::{
    DeleteOp, KillPhase, LaunchOp, Operation, RescheduleOp, ScaleOp, Transaction, TransactionStatus,
    UpdateOp, UpdateResourceOp,
};
pub use version::{
    ConfigMapItem, Constraint, ConstraintOp, Container, HealthCheck, HealthProtocol, KillPolicy, PortMapping,
    RestartKind, RestartPolicy, SecretItem, Version, WorkloadKind,
};
