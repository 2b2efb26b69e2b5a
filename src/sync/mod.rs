pub mod arbiter;
pub mod lock_table;

use tokio::sync::oneshot;
use tokio::time::Instant;

/// Unique per component; never reused, so a stale id can never match a newer request.
pub type RequestId = u64;

/// A keyed queue whose requests are resolved exactly once: granted, or withdrawn before grant.
///
/// Grants must be sent while the queue's internal lock is held, and `withdraw` must take that
/// same lock. That makes "still queued?" the single point where a grant/cancel race is decided.
pub(crate) trait Withdraw {
    type Grant;

    /// Removes a still-queued request. Returns `false` if it already left the queue.
    fn withdraw(&self, key: &str, id: RequestId) -> bool;

    /// Gives back a grant the requester went away without observing.
    fn abandon(&self, grant: Self::Grant);
}

/// Requester side of a queued request.
///
/// Dropping it unresolved is a cancellation: the request leaves the queue, or if it was granted
/// in the meantime the grant is handed back, so nothing stays held on behalf of a caller that
/// gave up.
pub(crate) struct Pending<'a, Q: Withdraw> {
    queue: &'a Q,
    key: String,
    id: RequestId,
    rx: oneshot::Receiver<Q::Grant>,
    settled: bool,
}

impl<'a, Q: Withdraw> Pending<'a, Q> {
    pub(crate) fn new(queue: &'a Q, key: &str, id: RequestId, rx: oneshot::Receiver<Q::Grant>) -> Self {
        Self {
            queue,
            key: key.to_owned(),
            id,
            rx,
            settled: false,
        }
    }

    /// Waits for the grant, giving up at `deadline`. `None` waits indefinitely.
    ///
    /// Returns `None` only if the request was withdrawn without ever being granted.
    pub(crate) async fn wait(mut self, deadline: Option<Instant>) -> Option<Q::Grant> {
        let received = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, &mut self.rx).await.ok(),
            None => Some((&mut self.rx).await),
        };
        self.settled = true;
        if let Some(Ok(grant)) = received {
            return Some(grant);
        }
        // Deadline hit, or the queue dropped us. Decide under the queue's lock: if we are no
        // longer queued the grant won and is already in the channel.
        if self.queue.withdraw(&self.key, self.id) {
            None
        } else {
            self.rx.try_recv().ok()
        }
    }
}

impl<Q: Withdraw> Drop for Pending<'_, Q> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if !self.queue.withdraw(&self.key, self.id) {
            if let Ok(grant) = self.rx.try_recv() {
                self.queue.abandon(grant);
            }
        }
    }
}
