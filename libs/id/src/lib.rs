//! # drover-id
//!
//! Identifier types shared by the drover scheduler crates.
//!
//! Two families of IDs live here:
//!
//! - **Generated IDs** (`TransactionId`, `CommandId`, `RequestId`) use the
//!   prefixed ULID format `{prefix}_{ulid}`, e.g.
//!   `txn_01HV4Z2WQXKJNM8GPQY6VBKC3D`. They sort by creation time.
//! - **Workload IDs** (`TaskGroupId`, `TaskId`) are dotted, structured names
//!   that the cluster manager sees. A task id always embeds the id of the pod
//!   that owns it, so status reports can be routed back to their pod without
//!   a lookup table.
//!
//! ```text
//! task group: {index}.{app}.{namespace}.{cluster}.{stamp}
//! task:       {index}.{app}.{namespace}.{cluster}.{stamp}.{container}
//! ```

mod error;
mod macros;
mod types;
mod workload;

pub use error::IdError;
pub use types::*;
pub use workload::{TaskGroupId, TaskId};

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
