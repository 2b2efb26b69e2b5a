//! # Lock Table
//!
//! Per-key shared/exclusive locks with writer priority.
//!
//! | Requested \ Held | none | Read | Write |
//! |------------------|------|------|-------|
//! |       Read       | Yes  | Yes* | No    |
//! |       Write      | Yes  | No   | No    |
//!
//! `*` only while no writer is queued. Once a write request arrives, later reads queue behind it
//! even though they are compatible with the readers currently holding the key. When the key
//! frees, the earliest queued writer goes first wherever it sits in the queue; otherwise every
//! queued reader is admitted together.
//!
//! Each queued request carries a deadline. A request that misses it leaves the queue and can
//! never be granted afterwards.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{Pending, RequestId, Withdraw};
use crate::error::{LockError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Read,
    Write,
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::Read => f.write_str("read"),
            LockMode::Write => f.write_str("write"),
        }
    }
}

/// Proof of a granted request. Release goes through [`LockTable::release`] by holder and key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGrant {
    pub request_id: RequestId,
    pub holder: String,
    pub key: String,
    pub mode: LockMode,
    /// Time spent queued before the grant.
    pub waited: Duration,
    // false when `holder` already held `key` through an earlier grant
    newly_held: bool,
}

/// Read-only view of one key, see [`LockTable::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    pub key: String,
    pub held: bool,
    pub mode: Option<LockMode>,
    pub holders: Vec<String>,
    pub queue_length: usize,
    pub writer_pending: bool,
}

struct LockRequest {
    id: RequestId,
    holder: String,
    mode: LockMode,
    enqueued_at: Instant,
    deadline: Option<Instant>,
    grant_tx: oneshot::Sender<LockGrant>,
}

/// Invariants: `mode == None` iff `holders` is empty; `Write` has exactly one holder;
/// `writer_pending` iff a writer holds or is queued.
#[derive(Default)]
struct LockState {
    mode: Option<LockMode>,
    holders: BTreeSet<String>,
    queue: VecDeque<LockRequest>,
    writer_pending: bool,
}

impl LockState {
    #[inline]
    fn is_idle(&self) -> bool {
        self.mode.is_none() && self.queue.is_empty()
    }

    #[inline]
    fn writer_queued(&self) -> bool {
        self.queue.iter().any(|r| r.mode == LockMode::Write)
    }

    fn sync_writer_pending(&mut self) {
        self.writer_pending = self.mode == Some(LockMode::Write) || self.writer_queued();
    }

    /// Drops queued requests whose deadline passed before `now`. Their requesters observe a
    /// closed channel and resolve as timed out.
    fn expire(&mut self, key: &str, now: Instant) {
        self.queue.retain(|r| {
            let live = r.deadline.map_or(true, |deadline| deadline >= now);
            if !live {
                trace!(key, holder = %r.holder, request_id = r.id, "dropping expired lock request");
            }
            live
        });
    }

    /// Grants as many queued requests as the current mode allows.
    fn grant_waiting(&mut self, key: &str, now: Instant) {
        self.expire(key, now);
        loop {
            let next = match self.mode {
                Some(LockMode::Write) => None,
                // only reads can join readers, and only with no writer waiting
                Some(LockMode::Read) if self.writer_queued() => None,
                Some(LockMode::Read) => self.queue.pop_front(),
                None => match self.queue.iter().position(|r| r.mode == LockMode::Write) {
                    Some(i) => self.queue.remove(i),
                    None => self.queue.pop_front(),
                },
            };
            let Some(request) = next else { break };
            self.grant(key, request, now);
        }
        self.sync_writer_pending();
    }

    fn grant(&mut self, key: &str, request: LockRequest, now: Instant) {
        let LockRequest {
            id,
            holder,
            mode,
            enqueued_at,
            grant_tx,
            ..
        } = request;
        let grant = LockGrant {
            request_id: id,
            newly_held: !self.holders.contains(&holder),
            holder: holder.clone(),
            key: key.to_owned(),
            mode,
            waited: now.saturating_duration_since(enqueued_at),
        };
        if grant_tx.send(grant).is_err() {
            trace!(key, %holder, request_id = id, "requester gone, skipping grant");
            return;
        }
        debug!(key, %holder, %mode, request_id = id, "lock granted");
        self.mode = Some(mode);
        self.holders.insert(holder);
        debug_assert!(self.mode == Some(LockMode::Read) || self.holders.len() == 1);
    }

    /// Removes `holder`. Returns `false` if it held nothing here.
    fn release(&mut self, holder: &str) -> bool {
        if !self.holders.remove(holder) {
            return false;
        }
        if self.holders.is_empty() {
            self.mode = None;
        }
        true
    }
}

#[derive(Default)]
struct TableState {
    next_request_id: RequestId,
    locks: HashMap<String, LockState>,
}

impl TableState {
    fn next_id(&mut self) -> RequestId {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    /// Forgets a key once nothing holds or waits on it.
    fn collect(&mut self, key: &str) {
        if self.locks.get(key).is_some_and(LockState::is_idle) {
            self.locks.remove(key);
        }
    }

    fn release(&mut self, holder: &str, key: &str, now: Instant) {
        let Some(state) = self.locks.get_mut(key) else {
            debug!(key, holder, "release of unlocked key ignored");
            return;
        };
        if !state.release(holder) {
            debug!(key, holder, "release by non-holder ignored");
            return;
        }
        debug!(key, holder, remaining = state.holders.len(), "lock released");
        state.grant_waiting(key, now);
        self.collect(key);
    }
}

/// Shared/exclusive locks over string resource keys.
///
/// Cheap to clone; clones share the same table. Keys are independent of each other, and a key's
/// state exists only while something holds or waits on it.
#[derive(Clone, Default)]
pub struct LockTable {
    inner: Arc<Mutex<TableState>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    // Every mutation completes before the guard drops, so a poisoned table is still consistent.
    fn state(&self) -> MutexGuard<'_, TableState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquires shared access to `key`, waiting at most `timeout`.
    pub async fn acquire_read(&self, holder: &str, key: &str, timeout: Duration) -> Result<LockGrant> {
        self.acquire(holder, key, LockMode::Read, timeout).await
    }

    /// Acquires exclusive access to `key`, waiting at most `timeout`.
    pub async fn acquire_write(&self, holder: &str, key: &str, timeout: Duration) -> Result<LockGrant> {
        self.acquire(holder, key, LockMode::Write, timeout).await
    }

    /// Queues a request and waits for its outcome.
    ///
    /// Dropping the returned future cancels the request. A zero `timeout` still succeeds when
    /// the request can be granted on arrival.
    pub async fn acquire(
        &self,
        holder: &str,
        key: &str,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<LockGrant> {
        let now = Instant::now();
        // a deadline past the end of time is no deadline
        let deadline = now.checked_add(timeout);
        let (id, rx) = {
            let mut table = self.state();
            let id = table.next_id();
            let (grant_tx, rx) = oneshot::channel();
            let state = table.locks.entry(key.to_owned()).or_default();
            if mode == LockMode::Write {
                state.writer_pending = true;
            }
            state.queue.push_back(LockRequest {
                id,
                holder: holder.to_owned(),
                mode,
                enqueued_at: now,
                deadline,
                grant_tx,
            });
            trace!(key, holder, %mode, request_id = id, queued = state.queue.len(), "lock requested");
            state.grant_waiting(key, now);
            (id, rx)
        };

        match Pending::new(self, key, id, rx).wait(deadline).await {
            Some(grant) => Ok(grant),
            None => {
                let waited = now.elapsed();
                debug!(key, holder, %mode, request_id = id, ?waited, "lock request timed out");
                Err(LockError::Timeout {
                    holder: holder.to_owned(),
                    key: key.to_owned(),
                    mode,
                    waited,
                })
            }
        }
    }

    /// Releases whatever `holder` holds on `key`. Releasing something not held is a no-op.
    pub fn release(&self, holder: &str, key: &str) {
        self.state().release(holder, key, Instant::now());
    }

    /// Snapshot of `key`. Unknown keys report as free.
    pub fn status(&self, key: &str) -> LockStatus {
        let table = self.state();
        let Some(state) = table.locks.get(key) else {
            return LockStatus {
                key: key.to_owned(),
                held: false,
                mode: None,
                holders: Vec::new(),
                queue_length: 0,
                writer_pending: false,
            };
        };
        LockStatus {
            key: key.to_owned(),
            held: state.mode.is_some(),
            mode: state.mode,
            holders: state.holders.iter().cloned().collect(),
            queue_length: state.queue.len(),
            writer_pending: state.writer_pending,
        }
    }

    /// Keys that currently have a holder or a waiter, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.state().locks.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl std::fmt::Debug for LockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockTable").finish_non_exhaustive()
    }
}

impl Withdraw for LockTable {
    type Grant = LockGrant;

    fn withdraw(&self, key: &str, id: RequestId) -> bool {
        let mut table = self.state();
        let Some(state) = table.locks.get_mut(key) else {
            return false;
        };
        let Some(at) = state.queue.iter().position(|r| r.id == id) else {
            return false;
        };
        if let Some(request) = state.queue.remove(at) {
            debug!(key, holder = %request.holder, mode = %request.mode, request_id = id, "lock request withdrawn");
        }
        // a departing writer may be all that kept readers waiting
        state.grant_waiting(key, Instant::now());
        table.collect(key);
        true
    }

    fn abandon(&self, grant: LockGrant) {
        // releasing by holder would also drop the grant it already had
        if !grant.newly_held {
            debug!(key = %grant.key, holder = %grant.holder, request_id = grant.request_id, "unobserved grant overlaps an earlier one, keeping it");
            return;
        }
        debug!(key = %grant.key, holder = %grant.holder, request_id = grant.request_id, "releasing unobserved grant");
        self.state().release(&grant.holder, &grant.key, Instant::now());
    }
}
