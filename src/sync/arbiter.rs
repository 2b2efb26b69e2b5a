//! # Mutex Arbiter
//!
//! Centralized critical-section arbiter: one holder per key, waiters served by priority and then
//! by logical timestamp. Every request, on any key, takes the next stamp of a single shared
//! [`LamportClock`], so arrival order is total across the whole arbiter.
//!
//! There is no deadline here. Critical sections are expected to be short; bounded waits belong
//! to the caller, or to the [`LockTable`](super::lock_table::LockTable).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::{Pending, RequestId, Withdraw};
use crate::order::LamportClock;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Lower is served first.
    #[inline]
    const fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutexStatus {
    Waiting,
    Granted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MutexRequest {
    pub request_id: RequestId,
    pub holder: String,
    pub key: String,
    pub timestamp: LamportClock,
    pub priority: Priority,
    pub status: MutexStatus,
}

impl MutexRequest {
    #[inline]
    fn service_order(&self) -> (u8, LamportClock) {
        (self.priority.rank(), self.timestamp)
    }
}

/// See [`MutexArbiter::queue_status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub key: String,
    pub queue_length: usize,
    pub current_holder: Option<MutexRequest>,
    /// In service order.
    pub waiting_requests: Vec<MutexRequest>,
}

struct Waiter {
    request: MutexRequest,
    grant_tx: oneshot::Sender<MutexRequest>,
}

#[derive(Default)]
struct Section {
    current: Option<MutexRequest>,
    // sorted by `MutexRequest::service_order`
    waiting: VecDeque<Waiter>,
}

impl Section {
    fn is_idle(&self) -> bool {
        self.current.is_none() && self.waiting.is_empty()
    }

    fn enqueue(&mut self, waiter: Waiter) {
        let order = waiter.request.service_order();
        let at = self
            .waiting
            .partition_point(|w| w.request.service_order() <= order);
        self.waiting.insert(at, waiter);
    }

    /// Hands a free section to the head of the queue.
    fn advance(&mut self) {
        while self.current.is_none() {
            let Some(Waiter {
                mut request,
                grant_tx,
            }) = self.waiting.pop_front()
            else {
                break;
            };
            request.status = MutexStatus::Granted;
            if grant_tx.send(request.clone()).is_err() {
                trace!(key = %request.key, holder = %request.holder, request_id = request.request_id, "requester gone, skipping grant");
                continue;
            }
            debug!(
                key = %request.key,
                holder = %request.holder,
                timestamp = %request.timestamp,
                priority = ?request.priority,
                "critical section granted"
            );
            self.current = Some(request);
        }
    }

    fn release(&mut self, request_id: RequestId) -> bool {
        if self.current.as_ref().map(|c| c.request_id) != Some(request_id) {
            return false;
        }
        self.current = None;
        self.advance();
        true
    }
}

#[derive(Default)]
struct ArbiterState {
    clock: LamportClock,
    next_request_id: RequestId,
    sections: HashMap<String, Section>,
}

impl ArbiterState {
    fn release(&mut self, key: &str, request_id: RequestId) {
        let released = self
            .sections
            .get_mut(key)
            .is_some_and(|section| section.release(request_id));
        if !released {
            debug!(key, request_id, "release of a section not held ignored");
            return;
        }
        debug!(key, request_id, "critical section released");
        if self.sections.get(key).is_some_and(Section::is_idle) {
            self.sections.remove(key);
        }
    }
}

/// Per-key critical sections with a total, priority-aware service order.
///
/// Cheap to clone; clones share the same queues.
#[derive(Clone, Default)]
pub struct MutexArbiter {
    inner: Arc<Mutex<ArbiterState>>,
}

impl MutexArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ArbiterState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for the critical section on `key`.
    ///
    /// Dropping the returned future gives up the place in the queue.
    pub async fn acquire(&self, holder: &str, key: &str, priority: Priority) -> MutexHandle {
        loop {
            let (id, rx) = self.enqueue(holder, key, priority);
            if let Some(request) = Pending::new(self, key, id, rx).wait(None).await {
                return MutexHandle {
                    arbiter: self.clone(),
                    request,
                    released: AtomicBool::new(false),
                };
            }
            // Only reachable if the waiter was dropped from the queue without a grant.
            warn!(key, holder, request_id = id, "critical section request lost, queueing again");
        }
    }

    fn enqueue(
        &self,
        holder: &str,
        key: &str,
        priority: Priority,
    ) -> (RequestId, oneshot::Receiver<MutexRequest>) {
        let mut state = self.state();
        let timestamp = state.clock.tick();
        let id = state.next_request_id;
        state.next_request_id += 1;
        let (grant_tx, rx) = oneshot::channel();
        let section = state.sections.entry(key.to_owned()).or_default();
        section.enqueue(Waiter {
            request: MutexRequest {
                request_id: id,
                holder: holder.to_owned(),
                key: key.to_owned(),
                timestamp,
                priority,
                status: MutexStatus::Waiting,
            },
            grant_tx,
        });
        trace!(key, holder, %timestamp, ?priority, queued = section.waiting.len(), "critical section requested");
        section.advance();
        (id, rx)
    }

    /// Ends the critical section held through `handle` and admits the next waiter.
    /// Releasing twice, or releasing a handle that no longer holds, does nothing.
    ///
    /// The handle always goes back to the arbiter that issued it.
    pub fn release(&self, handle: &MutexHandle) {
        if !handle.take() {
            debug!(key = %handle.request.key, request_id = handle.request.request_id, "duplicate release ignored");
            return;
        }
        handle.arbiter.release_request(&handle.request);
    }

    fn release_request(&self, request: &MutexRequest) {
        self.state().release(&request.key, request.request_id);
    }

    pub fn queue_status(&self, key: &str) -> QueueStatus {
        let state = self.state();
        let section = state.sections.get(key);
        QueueStatus {
            key: key.to_owned(),
            queue_length: section.map_or(0, |s| s.waiting.len()),
            current_holder: section.and_then(|s| s.current.clone()),
            waiting_requests: section
                .map(|s| s.waiting.iter().map(|w| w.request.clone()).collect())
                .unwrap_or_default(),
        }
    }

    /// The most recently issued logical timestamp.
    pub fn clock(&self) -> LamportClock {
        self.state().clock
    }
}

impl Withdraw for MutexArbiter {
    type Grant = MutexRequest;

    fn withdraw(&self, key: &str, id: RequestId) -> bool {
        let mut state = self.state();
        let Some(section) = state.sections.get_mut(key) else {
            return false;
        };
        let Some(at) = section.waiting.iter().position(|w| w.request.request_id == id) else {
            return false;
        };
        section.waiting.remove(at);
        debug!(key, request_id = id, "critical section request withdrawn");
        if section.is_idle() {
            state.sections.remove(key);
        }
        true
    }

    fn abandon(&self, grant: MutexRequest) {
        debug!(key = %grant.key, request_id = grant.request_id, "releasing unobserved critical section");
        self.release_request(&grant);
    }
}

/// A granted critical section. Released explicitly through [`MutexArbiter::release`] or
/// [`MutexHandle::release`], or implicitly on drop; only the first of these has any effect.
#[derive(Debug)]
pub struct MutexHandle {
    arbiter: MutexArbiter,
    request: MutexRequest,
    released: AtomicBool,
}

impl MutexHandle {
    pub fn request(&self) -> &MutexRequest {
        &self.request
    }

    pub fn timestamp(&self) -> LamportClock {
        self.request.timestamp
    }

    pub fn release(&self) {
        self.arbiter.release(self);
    }

    /// Claims the right to release. `true` exactly once.
    #[inline]
    fn take(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }
}

impl Drop for MutexHandle {
    fn drop(&mut self) {
        if self.take() {
            self.arbiter.release_request(&self.request);
        }
    }
}

impl std::fmt::Debug for MutexArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutexArbiter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use std::time::Duration;

    use rand::Rng;
    use tokio::task::JoinHandle;

    use crate::sync::arbiter::{MutexArbiter, MutexHandle, MutexStatus, Priority};

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    fn spawn_acquire(arbiter: &MutexArbiter, holder: &'static str, priority: Priority) -> JoinHandle<MutexHandle> {
        let arbiter = arbiter.clone();
        tokio::spawn(async move { arbiter.acquire(holder, "k", priority).await })
    }

    fn holders(arbiter: &MutexArbiter) -> Vec<String> {
        arbiter
            .queue_status("k")
            .waiting_requests
            .into_iter()
            .map(|r| r.holder)
            .collect()
    }

    #[tokio::test]
    async fn free_section_is_granted_immediately() {
        let arbiter = MutexArbiter::new();
        let a = arbiter.acquire("a", "k", Priority::Normal).await;
        assert_eq!(a.request().status, MutexStatus::Granted);

        let status = arbiter.queue_status("k");
        assert_eq!(status.queue_length, 0);
        let current = status.current_holder.unwrap();
        assert_eq!(current.holder, "a");
        assert_eq!(current.timestamp, a.timestamp());
    }

    #[tokio::test]
    async fn equal_priority_is_served_by_timestamp() {
        let arbiter = MutexArbiter::new();
        let a = arbiter.acquire("a", "k", Priority::Normal).await;
        let b = spawn_acquire(&arbiter, "b", Priority::Normal);
        settle().await;
        let c = spawn_acquire(&arbiter, "c", Priority::Normal);
        settle().await;

        let waiting = arbiter.queue_status("k").waiting_requests;
        assert_eq!(holders(&arbiter), ["b", "c"]);
        assert!(waiting[0].timestamp < waiting[1].timestamp);
        assert!(waiting.iter().all(|r| r.status == MutexStatus::Waiting));

        arbiter.release(&a);
        let b = b.await.unwrap();
        settle().await;
        assert!(!c.is_finished());
        assert_eq!(arbiter.queue_status("k").current_holder.unwrap().holder, "b");

        b.release();
        let c = c.await.unwrap();
        assert_eq!(c.request().holder, "c");
    }

    #[tokio::test]
    async fn high_priority_overtakes_earlier_normal() {
        let arbiter = MutexArbiter::new();
        let a = arbiter.acquire("a", "k", Priority::Normal).await;
        let b = spawn_acquire(&arbiter, "b", Priority::Normal);
        settle().await;
        let c = spawn_acquire(&arbiter, "c", Priority::High);
        settle().await;
        assert_eq!(holders(&arbiter), ["c", "b"]);

        drop(a);
        let c = c.await.unwrap();
        settle().await;
        assert!(!b.is_finished());
        // c arrived later but still holds first
        assert_eq!(c.request().priority, Priority::High);

        drop(c);
        b.await.unwrap();
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let arbiter = MutexArbiter::new();
        let a = arbiter.acquire("a", "k", Priority::Normal).await;
        let b = spawn_acquire(&arbiter, "b", Priority::Normal);
        settle().await;

        arbiter.release(&a);
        arbiter.release(&a);
        a.release();
        let b = b.await.unwrap();

        // a's stale handle must not free b's section
        drop(a);
        let current = arbiter.queue_status("k").current_holder.unwrap();
        assert_eq!(current.request_id, b.request().request_id);
    }

    #[tokio::test]
    async fn drop_releases() {
        let arbiter = MutexArbiter::new();
        {
            let _a = arbiter.acquire("a", "k", Priority::Normal).await;
            assert!(arbiter.queue_status("k").current_holder.is_some());
        }
        assert!(arbiter.queue_status("k").current_holder.is_none());
        let b = arbiter.acquire("b", "k", Priority::High).await;
        assert_eq!(b.request().holder, "b");
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_queue() {
        let arbiter = MutexArbiter::new();
        let a = arbiter.acquire("a", "k", Priority::Normal).await;
        let b = spawn_acquire(&arbiter, "b", Priority::Normal);
        settle().await;
        assert_eq!(arbiter.queue_status("k").queue_length, 1);

        b.abort();
        settle().await;
        assert_eq!(arbiter.queue_status("k").queue_length, 0);

        drop(a);
        assert!(arbiter.queue_status("k").current_holder.is_none());
    }

    #[tokio::test]
    async fn unobserved_grant_is_released() {
        let arbiter = MutexArbiter::new();
        let a = arbiter.acquire("a", "k", Priority::Normal).await;
        let b = spawn_acquire(&arbiter, "b", Priority::Normal);
        settle().await;

        drop(a);
        b.abort();
        settle().await;
        assert!(b.await.unwrap_err().is_cancelled());
        let status = arbiter.queue_status("k");
        assert!(status.current_holder.is_none());
        assert_eq!(status.queue_length, 0);
    }

    #[tokio::test]
    async fn lost_waiter_is_queued_again() {
        let arbiter = MutexArbiter::new();
        let a = arbiter.acquire("a", "k", Priority::Normal).await;
        let b = spawn_acquire(&arbiter, "b", Priority::Normal);
        settle().await;
        let first = arbiter.queue_status("k").waiting_requests[0].timestamp;

        // drop b's waiter without granting it
        arbiter.state().sections.get_mut("k").unwrap().waiting.clear();
        settle().await;
        assert!(!b.is_finished());
        let waiting = arbiter.queue_status("k").waiting_requests;
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].holder, "b");
        assert!(waiting[0].timestamp > first);

        drop(a);
        assert_eq!(b.await.unwrap().request().holder, "b");
    }

    #[tokio::test]
    async fn timestamps_are_shared_across_keys() {
        let arbiter = MutexArbiter::new();
        let a = arbiter.acquire("a", "k1", Priority::Normal).await;
        let b = arbiter.acquire("b", "k2", Priority::Normal).await;
        let c = arbiter.acquire("c", "k3", Priority::High).await;
        assert!(a.timestamp() < b.timestamp() && b.timestamp() < c.timestamp());
        assert_eq!(arbiter.clock().get(), 3);
        assert_eq!(arbiter.queue_status("k2").current_holder.unwrap().holder, "b");
    }

    #[tokio::test]
    async fn queue_status_serializes() {
        let arbiter = MutexArbiter::new();
        let _a = arbiter.acquire("a", "k", Priority::High).await;
        let json = serde_json::to_value(arbiter.queue_status("k")).unwrap();
        assert_eq!(json["current_holder"]["priority"], "high");
        assert_eq!(json["current_holder"]["status"], "granted");
        assert_eq!(json["current_holder"]["timestamp"], 1);
        assert_eq!(json["queue_length"], 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn mutual_exclusion() {
        let arbiter = MutexArbiter::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let entered = Arc::new(AtomicUsize::new(0));
        let plan: Vec<(bool, u64)> = {
            let mut rng = rand::thread_rng();
            (0..32)
                .map(|_| (rng.gen_bool(0.2), rng.gen_range(0..=2)))
                .collect()
        };

        let ths = plan
            .into_iter()
            .enumerate()
            .map(|(i, (high, hold_ms))| {
                let arbiter = arbiter.clone();
                let inside = inside.clone();
                let entered = entered.clone();
                tokio::spawn(async move {
                    let priority = if high { Priority::High } else { Priority::Normal };
                    let handle = arbiter.acquire(&format!("h{i}"), "k", priority).await;
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    entered.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(hold_ms)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    arbiter.release(&handle);
                })
            })
            .collect::<Vec<_>>();
        for th in ths {
            th.await.unwrap();
        }
        assert_eq!(entered.load(Ordering::SeqCst), 32);
        assert!(arbiter.queue_status("k").current_holder.is_none());
    }
}
