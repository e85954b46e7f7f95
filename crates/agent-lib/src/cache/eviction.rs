//! Delayed node eviction queue

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tokio::time::Instant;

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct PendingEviction {
    due: Instant,
    seq: u64,
    name: String,
}

/// Min-heap of evictions keyed by due time.
///
/// Cancelled or rescheduled entries stay in the heap and are skipped when
/// they surface; `pending` holds the live sequence number per name.
#[derive(Debug, Default)]
pub struct EvictionQueue {
    heap: BinaryHeap<Reverse<PendingEviction>>,
    pending: HashMap<String, u64>,
    next_seq: u64,
}

impl EvictionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `name` for eviction at `due`. An already pending eviction
    /// keeps its original deadline; returns false in that case.
    pub fn schedule(&mut self, name: &str, due: Instant) -> bool {
        if self.pending.contains_key(name) {
            return false;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(name.to_string(), seq);
        self.heap.push(Reverse(PendingEviction {
            due,
            seq,
            name: name.to_string(),
        }));
        true
    }

    /// Cancel a pending eviction; returns whether one existed
    pub fn cancel(&mut self, name: &str) -> bool {
        self.pending.remove(name).is_some()
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.pending.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Remove and return every live eviction due at or before `now`
    pub fn pop_expired(&mut self, now: Instant) -> Vec<String> {
        let mut expired = Vec::new();

        while let Some(Reverse(next)) = self.heap.peek() {
            if next.due > now {
                break;
            }
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            if self.pending.get(&entry.name) == Some(&entry.seq) {
                self.pending.remove(&entry.name);
                expired.push(entry.name);
            }
        }

        expired
    }
}
