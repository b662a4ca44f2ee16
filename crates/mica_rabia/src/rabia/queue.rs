//! Priority queue of pending client batches.
//!
//! Batches wait here between arrival (pushed by the message handler on
//! `ClientRequest`, or put back by the executor after a null or unmatched
//! decision) and being picked as the executor's next proposal. Ordering is by
//! batch identity `(proposer_id, proposer_seq)` so every server drains
//! pending batches in the same relative order.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Mutex;

use super::types::Batch;

/// Heap entry ordered purely by batch identity.
struct ById(Batch);

impl PartialEq for ById {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for ById {}

impl Ord for ById {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.id.cmp(&other.0.id)
    }
}

impl PartialOrd for ById {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of pending batches behind one mutex. Contention is low: pushes
/// happen per client batch and pops per slot decision.
#[derive(Default)]
pub struct PendingQueue {
    heap: Mutex<BinaryHeap<Reverse<ById>>>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, batch: Batch) {
        self.heap.lock().unwrap().push(Reverse(ById(batch)));
    }

    pub fn pop(&self) -> Option<Batch> {
        self.heap.lock().unwrap().pop().map(|Reverse(ById(b))| b)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
