//! In-process coordination of concurrent access to named resources.
//!
//! - [`LockTable`]: per-key shared/exclusive locks with writer priority and deadlines.
//! - [`MutexArbiter`]: per-key critical sections served in priority and logical-timestamp order.
//! - [`partition`]: deterministic mapping from business identifiers to resource keys.
//!
//! Both coordinators are plain owned values. [`Coordinator`] bundles them with a partitioner
//! built from [`CoordinatorConfig`].

pub mod config;
pub mod coordinator;
pub mod error;
pub mod order;
pub mod partition;
pub mod sync;

pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use error::{ConfigError, LockError, Result};
pub use sync::arbiter::{MutexArbiter, MutexHandle, MutexRequest, MutexStatus, Priority, QueueStatus};
pub use sync::lock_table::{LockGrant, LockMode, LockStatus, LockTable};
