//! # drover-events
//!
//! Notifications the scheduler emits to its fire-and-forget collaborators:
//!
//! - **Alerts** (`AlertPayload`): transaction timeouts, lost or unhealthy pods,
//!   reschedules and exhausted reschedule budgets, suspended deployments.
//! - **Endpoint changes** (`EndpointPayload`): pod add/update/delete so that
//!   service-to-pod mappings stay current.
//!
//! Every notification is wrapped in an [`EventEnvelope`] that names the
//! aggregate it concerns (application, task group, transaction, deployment or
//! node) and carries a process-local, increasing [`drover_id::EventId`].
//!
//! Delivery is best effort: a failed notification is logged by the sender and
//! never retried.

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
