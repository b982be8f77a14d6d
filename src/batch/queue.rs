//! Shared FIFO of pending batches.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::batch::partition::Batch;

/// Thread-safe queue of batches for one run.
///
/// Filled once before any worker starts; workers only pop. Popping from an
/// empty queue returns `None` immediately, which is a worker's signal to exit.
#[derive(Debug, Default)]
pub struct WorkQueue {
    inner: Mutex<VecDeque<Batch>>,
}

impl WorkQueue {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self {
            inner: Mutex::new(batches.into()),
        }
    }

    /// Pops the next batch, if any.
    pub fn pop(&self) -> Option<Batch> {
        // pop_front cannot leave the deque half-updated, so poisoning is ignored.
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.pop_front()
    }

    /// Removes and returns everything still queued.
    pub fn drain(&self) -> Vec<Batch> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
