//! Bounded pool of deferred-request slots, a fixed-size stand-in for the
//! kind of scatter-gather buffer allocator sized for network read buffers,
//! which doesn't fit fixed-size bookkeeping.

use crossbeam_queue::ArrayQueue;

use crate::cluster::per_node::DeferredRequest;

/// Fixed-capacity pool handing out [`DeferredRequest`] slots. Acquiring from
/// an empty pool is the caller's signal to return `DeferFailed`; slots
/// return to the pool on replay or failure, never dropped in place.
pub struct DeferredSlotPool {
    queue: ArrayQueue<DeferredRequest>,
}

impl DeferredSlotPool {
    /// Pre-fills the pool to `capacity` so `acquire()` has slots to hand
    /// out from the first call, rather than waiting for a `release()`.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let queue = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            let _ = queue.push(DeferredRequest::new(0, String::new()));
        }
        Self { queue }
    }

    /// Returns a slot to the pool, e.g. after a deferred request replays or
    /// is failed with `AccessDenied`. Drops the slot silently if the pool
    /// is already at capacity (can only happen if callers over-return).
    pub fn release(&self, request: DeferredRequest) {
        let _ = self.queue.push(request);
    }

    /// Takes a slot back out, e.g. to hand to the next caller that wants to
    /// defer. `None` means the pool's bound is reached.
    pub fn acquire(&self) -> Option<DeferredRequest> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cluster::per_node::DeferredRequest;

    fn sample(seq: u64) -> DeferredRequest {
        DeferredRequest::new(seq, "requester".to_owned())
    }

    #[test]
    fn pool_starts_pre_filled_to_capacity() {
        let pool = DeferredSlotPool::new(3);
        assert_eq!(pool.len(), 3);
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn released_slot_can_be_reacquired() {
        let pool = DeferredSlotPool::new(1);
        let slot = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        pool.release(slot);
        assert_eq!(pool.acquire().unwrap().sequence, 0);
    }

    #[test]
    fn pool_bounds_to_its_capacity() {
        let pool = DeferredSlotPool::new(3);
        while pool.acquire().is_some() {}
        pool.release(sample(1));
        pool.release(sample(2));
        pool.release(sample(3));
        // A 4th release beyond capacity is dropped; the DeferFailed error
        // at the call site in `cache.rs` is what the caller sees instead.
        pool.release(sample(4));
        assert_eq!(pool.len(), 3);
    }
}
