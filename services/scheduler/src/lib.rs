//! drover scheduling core.
//!
//! Accepts resource offers from the cluster resource manager, matches them
//! against pending workload requests, and drives every workload through its
//! lifecycle (launch, scale, update, reschedule, delete) to convergence.
//!
//! ## Architecture
//!
//! - **Offer Pool**: holds live offers; first-writer-wins consumption
//! - **Workload Builder**: turns a version plus an offer into a pod and its launch group
//! - **Transaction Engine**: one control loop per in-flight operation
//! - **Status Pipeline**: task updates to pod and application state, reschedule policy
//! - **Deployment Controller**: rolls replicas from one application to another
//!
//! Every component receives a [`Context`]; nothing is global.

pub mod builder;
pub mod clock;
pub mod command;
pub mod config;
pub mod connection;
pub mod context;
pub mod control;
pub mod deployment;
pub mod driver;
pub mod error;
pub mod model;
pub mod notify;
pub mod offer;
pub mod placement;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod transaction;

pub use context::Context;
pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::Scheduler;
