//! Deduplicating FIFO of object keys with per-key in-flight tracking.

use std::collections::VecDeque;

use keel_core::ObjectKey;
use rustc_hash::FxHashSet;

/// A key is either waiting, running, or absent. Keys pushed while running are
/// parked and re-queued once when the running pass finishes.
pub struct WorkQueue {
    order: VecDeque<ObjectKey>,
    queued: FxHashSet<ObjectKey>,
    in_flight: FxHashSet<ObjectKey>,
    dirty: FxHashSet<ObjectKey>,
    cap: usize,
    dropped: u64,
}

impl WorkQueue {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            order: VecDeque::new(),
            queued: FxHashSet::default(),
            in_flight: FxHashSet::default(),
            dirty: FxHashSet::default(),
            cap: cap.max(1),
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize { self.order.len() }
    pub fn is_empty(&self) -> bool { self.order.is_empty() }
    pub fn in_flight(&self) -> usize { self.in_flight.len() }
    pub fn dropped(&self) -> u64 { self.dropped }

    /// Returns true when the key became ready to pop.
    pub fn push(&mut self, key: ObjectKey) -> bool {
        if self.in_flight.contains(&key) {
            self.dirty.insert(key);
            return false;
        }
        if self.queued.contains(&key) {
            return false;
        }
        if self.order.len() >= self.cap {
            if let Some(old) = self.order.pop_front() {
                self.queued.remove(&old);
                self.dropped += 1;
            }
        }
        self.queued.insert(key.clone());
        self.order.push_back(key);
        true
    }

    /// Take the oldest waiting key and mark it in flight.
    pub fn pop(&mut self) -> Option<ObjectKey> {
        let key = self.order.pop_front()?;
        self.queued.remove(&key);
        self.in_flight.insert(key.clone());
        Some(key)
    }

    /// Finish a pass. Returns true when the key was re-queued.
    pub fn done(&mut self, key: &ObjectKey) -> bool {
        self.in_flight.remove(key);
        if self.dirty.remove(key) {
            return self.push(key.clone());
        }
        false
    }
}
