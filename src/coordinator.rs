use std::time::Duration;

use crate::config::CoordinatorConfig;
use crate::error::{ConfigError, Result};
use crate::partition::Partitioner;
use crate::sync::arbiter::{MutexArbiter, MutexHandle, Priority};
use crate::sync::lock_table::{LockGrant, LockTable};

/// One lock table and one arbiter, plus the partitioning that maps identifiers to their keys.
///
/// Owned and passed around explicitly; tests build as many as they like.
#[derive(Debug, Clone)]
pub struct Coordinator {
    locks: LockTable,
    arbiter: MutexArbiter,
    partitioner: Partitioner,
    default_timeout: Duration,
}

impl Coordinator {
    pub fn new(config: &CoordinatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            locks: LockTable::new(),
            arbiter: MutexArbiter::new(),
            partitioner: Partitioner::new(config.partitions, config.key_prefix.clone()),
            default_timeout: config.default_timeout(),
        })
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    pub fn arbiter(&self) -> &MutexArbiter {
        &self.arbiter
    }

    pub fn partitioner(&self) -> &Partitioner {
        &self.partitioner
    }

    /// Resource key protecting `id`.
    pub fn key_for(&self, id: &str) -> String {
        self.partitioner.resource_key(id)
    }

    /// Shared lock on the partition of `id`, with the configured timeout.
    pub async fn read(&self, holder: &str, id: &str) -> Result<LockGrant> {
        let key = self.key_for(id);
        self.locks.acquire_read(holder, &key, self.default_timeout).await
    }

    /// Exclusive lock on the partition of `id`, with the configured timeout.
    pub async fn write(&self, holder: &str, id: &str) -> Result<LockGrant> {
        let key = self.key_for(id);
        self.locks.acquire_write(holder, &key, self.default_timeout).await
    }

    /// Releases a grant obtained from [`read`](Self::read) or [`write`](Self::write).
    pub fn release(&self, grant: &LockGrant) {
        self.locks.release(&grant.holder, &grant.key);
    }

    /// Critical section on the partition of `id`.
    pub async fn exclusive(&self, holder: &str, id: &str, priority: Priority) -> MutexHandle {
        let key = self.key_for(id);
        self.arbiter.acquire(holder, &key, priority).await
    }
}
