//! Per-node, non-replicated file state.
//!
//! Lives only on the node that currently has the file open; never shipped
//! across the cluster.

use std::time::Instant;

use super::state::OpLock;

/// Integer handle identifying an open file on this node.
pub type FileId = u64;

/// Local data-availability state, distinct from the replicated
/// `ClusterFileState::status` (which tracks existence, not readiness).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStatus {
    Available,
    LoadWait,
    Updating,
}

/// A request held server-side while a conflicting oplock is broken. Plain
/// data, not a captured closure, so it can sit in
/// [`super::pool::DeferredSlotPool`] and be replayed later.
#[derive(Debug, Clone)]
pub struct DeferredRequest {
    pub sequence: u64,
    pub requester: String,
    pub queued_at: Instant,
}

impl DeferredRequest {
    pub fn new(sequence: u64, requester: String) -> Self {
        Self { sequence, requester, queued_at: Instant::now() }
    }
}

/// Non-replicated per-path state.
#[derive(Debug)]
pub struct PerNodeState {
    pub file_id: FileId,
    pub data_status: DataStatus,
    pub local_oplock: Option<OpLock>,
    pub deferred: Vec<DeferredRequest>,
    pub deferred_capacity: usize,
    pub break_started_at: Option<Instant>,
    pub pseudo_files: Vec<String>,
}

impl PerNodeState {
    pub fn new(file_id: FileId, deferred_capacity: usize) -> Self {
        Self {
            file_id,
            data_status: DataStatus::Available,
            local_oplock: None,
            deferred: Vec::new(),
            deferred_capacity,
            break_started_at: None,
            pseudo_files: Vec::new(),
        }
    }

    /// Pushes a deferred request, enforcing the bound.
    pub fn push_deferred(&mut self, request: DeferredRequest) -> bool {
        if self.deferred.len() >= self.deferred_capacity {
            return false;
        }
        self.deferred.push(request);
        true
    }

    /// Drains deferred requests in FIFO enqueue order.
    pub fn drain_deferred(&mut self) -> Vec<DeferredRequest> {
        self.deferred.drain(..).collect()
    }

    pub fn is_break_in_flight(&self) -> bool {
        !self.deferred.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deferred_queue_enforces_its_bound() {
        let mut state = PerNodeState::new(1, 3);
        assert!(state.push_deferred(DeferredRequest::new(1, "a".into())));
        assert!(state.push_deferred(DeferredRequest::new(2, "b".into())));
        assert!(state.push_deferred(DeferredRequest::new(3, "c".into())));
        assert!(!state.push_deferred(DeferredRequest::new(4, "d".into())));
    }

    #[test]
    fn drain_preserves_fifo_order() {
        let mut state = PerNodeState::new(1, 3);
        state.push_deferred(DeferredRequest::new(1, "a".into()));
        state.push_deferred(DeferredRequest::new(2, "b".into()));
        let drained: Vec<u64> = state.drain_deferred().iter().map(|d| d.sequence).collect();
        assert_eq!(drained, vec![1, 2]);
        assert!(state.deferred.is_empty());
    }
}
