use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::platform::UserId;

/// Deduplicating FIFO of identifiers awaiting verification.
///
/// Exception filtering happens at the call sites; the queue itself stays a
/// plain data structure.
#[derive(Debug, Default, Clone)]
pub struct WorkQueue {
    order: VecDeque<UserId>,
    members: HashSet<UserId>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` when the identifier is already queued.
    pub fn enqueue(&mut self, id: UserId) -> bool {
        if !self.members.insert(id) {
            return false;
        }
        self.order.push_back(id);
        true
    }

    pub fn dequeue_next(&mut self) -> Option<UserId> {
        let id = self.order.pop_front()?;
        self.members.remove(&id);
        Some(id)
    }

    pub fn size(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: UserId) -> bool {
        self.members.contains(&id)
    }

    pub fn clear(&mut self) -> usize {
        let removed = self.order.len();
        self.order.clear();
        self.members.clear();
        removed
    }
}

/// Shared handle around the queue plus the "currently draining" flag.
#[derive(Debug, Default)]
pub struct VerificationQueue {
    queue: Mutex<WorkQueue>,
    draining: AtomicBool,
}

impl VerificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, WorkQueue> {
        // The queue holds no invariants a panicking holder could break halfway.
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn enqueue(&self, id: UserId) -> bool {
        self.lock().enqueue(id)
    }

    /// Pops up to `limit` identifiers under a single lock acquisition.
    pub fn dequeue_batch(&self, limit: usize) -> Vec<UserId> {
        let mut queue = self.lock();
        std::iter::from_fn(|| queue.dequeue_next())
            .take(limit)
            .collect()
    }

    pub fn size(&self) -> usize {
        self.lock().size()
    }

    pub fn contains(&self, id: UserId) -> bool {
        self.lock().contains(id)
    }

    pub fn clear(&self) -> usize {
        self.lock().clear()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub(crate) fn set_draining(&self, draining: bool) {
        self.draining.store(draining, Ordering::Release);
    }
}
