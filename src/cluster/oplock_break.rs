//! Oplock break coordinator: lives on the node holding the
//! local oplock, drives the session's break callback, and replays deferred
//! requests once the break completes or times out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Result, ServerError};

use super::per_node::DeferredRequest;
use super::pool::DeferredSlotPool;
use super::state::OplockKind;

/// Session-side hook invoked when a break starts: it may downgrade the
/// cached oplock or close the handle outright.
#[async_trait]
pub trait OplockBreakCallback: Send + Sync {
    async fn on_break(&self, path: &str, to_kind: Option<OplockKind>);
}

/// A deferred request replayed once a break completes, paired with the
/// pooled slot it should return on completion.
struct PendingBreak {
    deferred: Vec<DeferredRequest>,
    started: tokio::time::Instant,
}

/// Coordinates one oplock break per path at a time.
pub struct OplockBreakCoordinator {
    timeout: Duration,
    in_flight: Mutex<HashMap<String, PendingBreak>>,
    pool: Arc<DeferredSlotPool>,
}

/// Outcome handed back once a break finishes, telling the caller how to
/// dispose of the requests that had queued up behind it.
pub enum BreakOutcome {
    /// The break completed; deferred requests replay in FIFO order.
    Completed(Vec<DeferredRequest>),
    /// The break timed out; deferred requests fail with `AccessDenied`.
    TimedOut(Vec<DeferredRequest>),
}

impl OplockBreakCoordinator {
    pub fn new(timeout: Duration, pool: Arc<DeferredSlotPool>) -> Self {
        Self { timeout, in_flight: Mutex::new(HashMap::new()), pool }
    }

    /// Handles a `BreakOplock(path, toType)` message from the topic. If no
    /// local oplock is held for `path`, the caller should publish
    /// `BreakComplete` immediately; this method only tracks the
    /// deferred-request bookkeeping.
    pub async fn begin(&self, path: &str, to_kind: Option<OplockKind>, callback: &dyn OplockBreakCallback) {
        callback.on_break(path, to_kind).await;
        let mut in_flight = self.in_flight.lock().await;
        in_flight.insert(path.to_owned(), PendingBreak { deferred: Vec::new(), started: tokio::time::Instant::now() });
        debug!(path, "oplock break started");
    }

    /// Adds an incoming request that is blocked by the oplock currently
    /// being broken. Returns `DeferFailed` once the bound (default 3) is
    /// reached.
    pub async fn defer(&self, path: &str, sequence: u64, requester: String) -> Result<()> {
        let Some(slot) = self.pool.acquire() else {
            warn!(path, "deferred-request pool exhausted");
            return Err(ServerError::DeferFailed);
        };
        // The pool slot tracks capacity; the request record itself lives in
        // `in_flight` until replay or failure returns the slot.
        let request = DeferredRequest::new(sequence, requester);
        let mut in_flight = self.in_flight.lock().await;
        let Some(pending) = in_flight.get_mut(path) else {
            self.pool.release(slot);
            return Err(ServerError::StateNotFound);
        };
        pending.deferred.push(request);
        Ok(())
    }

    /// Completes the break for `path`, returning the deferred requests to
    /// replay (in FIFO order) and pushing their pool slots back.
    pub async fn complete(&self, path: &str) -> BreakOutcome {
        let pending = self.in_flight.lock().await.remove(path);
        let deferred = pending.map(|p| p.deferred).unwrap_or_default();
        for _ in &deferred {
            self.pool.release(DeferredRequest::new(0, String::new()));
        }
        debug!(path, count = deferred.len(), "oplock break complete, replaying deferred requests");
        BreakOutcome::Completed(deferred)
    }

    /// Waits for `complete` to be called for `path`, or times out
    /// (default 30s).
    pub async fn wait_for_completion(&self, path: &str, signal: impl std::future::Future<Output = ()>) -> BreakOutcome {
        if timeout(self.timeout, signal).await.is_ok() {
            self.complete(path).await
        } else {
            let pending = self.in_flight.lock().await.remove(path);
            let deferred = pending.map(|p| p.deferred).unwrap_or_default();
            for _ in &deferred {
                self.pool.release(DeferredRequest::new(0, String::new()));
            }
            warn!(path, "oplock break timed out");
            BreakOutcome::TimedOut(deferred)
        }
    }

    /// True while a break is outstanding for `path` (used by the tick loop
    /// to know which deferred requests need their packet lease refreshed).
    pub async fn is_break_in_flight(&self, path: &str) -> bool {
        self.in_flight.lock().await.contains_key(path)
    }

    /// How long the current break for `path` has been outstanding.
    pub async fn elapsed(&self, path: &str) -> Option<Duration> {
        self.in_flight.lock().await.get(path).map(|p| p.started.elapsed())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct NoopCallback;

    #[async_trait]
    impl OplockBreakCallback for NoopCallback {
        async fn on_break(&self, _path: &str, _to_kind: Option<OplockKind>) {}
    }

    #[tokio::test]
    async fn fourth_deferred_request_is_rejected() {
        let pool = Arc::new(DeferredSlotPool::new(3));
        let coordinator = OplockBreakCoordinator::new(Duration::from_secs(30), pool);
        coordinator.begin("/share/b.txt", Some(OplockKind::LevelII), &NoopCallback).await;
        coordinator.defer("/share/b.txt", 1, "a".into()).await.unwrap();
        coordinator.defer("/share/b.txt", 2, "b".into()).await.unwrap();
        coordinator.defer("/share/b.txt", 3, "c".into()).await.unwrap();
        assert!(matches!(coordinator.defer("/share/b.txt", 4, "d".into()).await, Err(ServerError::DeferFailed)));
    }

    #[tokio::test]
    async fn completion_replays_in_fifo_order() {
        let pool = Arc::new(DeferredSlotPool::new(3));
        let coordinator = OplockBreakCoordinator::new(Duration::from_secs(30), pool);
        coordinator.begin("/share/b.txt", None, &NoopCallback).await;
        coordinator.defer("/share/b.txt", 1, "a".into()).await.unwrap();
        coordinator.defer("/share/b.txt", 2, "b".into()).await.unwrap();
        let BreakOutcome::Completed(replayed) = coordinator.complete("/share/b.txt").await else {
            panic!("expected Completed")
        };
        assert_eq!(replayed.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn timeout_fires_when_completion_never_arrives() {
        let pool = Arc::new(DeferredSlotPool::new(3));
        let coordinator = OplockBreakCoordinator::new(Duration::from_millis(20), pool);
        coordinator.begin("/share/b.txt", None, &NoopCallback).await;
        let outcome = coordinator.wait_for_completion("/share/b.txt", std::future::pending()).await;
        assert!(matches!(outcome, BreakOutcome::TimedOut(_)));
    }
}
