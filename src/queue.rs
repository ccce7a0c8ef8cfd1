//! # Pending Mutation Queues
//!
//! Three FIFO queues (deletes, inserts, updates) hold mutations between the
//! call that made them and the flush that persists them.
//!
//! ## Snapshot, Then Confirm
//!
//! ```text
//! take()     queue ──► snapshot         queue is empty, new appends land behind
//!               │
//!     flush ok  ├──► snapshot dropped
//!               │
//!  flush fails  └──► restore(unflushed)  put back in front, original order kept
//! ```
//!
//! A flush never loses a queued mutation: whatever did not reach storage goes
//! back to the front of its queue, ahead of anything appended since the
//! snapshot was taken. The one exception is an item the database rejected on
//! integrity grounds; it leaves the live queue as a [`RejectedMutation`] so it
//! cannot block later flushes, and stays with the store until drained.
//!
//! The queues have no internal locking and take `&mut self` for every change.
//! The owning store is `!Sync` because of the SQLite connection its
//! datasource keeps open, so sharing across threads needs an external mutex.

use std::collections::VecDeque;

use crate::error::{BatchOp, FailedItem};
use crate::types::{ChunkCoord, Reinforcement};

/// A queued mutation: the reinforcement and the chunk the caller filed it under.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    pub reinforcement: Reinforcement,
    pub chunk: ChunkCoord,
}

impl PendingMutation {
    pub fn new(reinforcement: Reinforcement, chunk: ChunkCoord) -> Self {
        Self {
            reinforcement,
            chunk,
        }
    }
}

/// A mutation the database refused and that will not succeed unchanged,
/// paired with the failure it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedMutation {
    pub mutation: PendingMutation,
    pub failure: FailedItem,
}

/// One ordered, append-only queue of pending mutations.
#[derive(Debug, Default)]
pub struct BatchQueue {
    items: VecDeque<PendingMutation>,
}

impl BatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: PendingMutation) {
        self.items.push_back(item);
    }

    /// Returns everything queued and leaves the queue empty, in one step.
    pub fn take(&mut self) -> Vec<PendingMutation> {
        self.items.drain(..).collect()
    }

    /// Puts unflushed items back in front of anything queued since the
    /// snapshot, preserving their relative order.
    pub fn restore(&mut self, unflushed: Vec<PendingMutation>) {
        for item in unflushed.into_iter().rev() {
            self.items.push_front(item);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingMutation> {
        self.items.iter()
    }
}

/// Number of mutations waiting in each queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub deletes: usize,
    pub inserts: usize,
    pub updates: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.deletes + self.inserts + self.updates
    }
}

/// The three queues one store owns.
#[derive(Debug, Default)]
pub struct BatchQueues {
    deletes: BatchQueue,
    inserts: BatchQueue,
    updates: BatchQueue,
}

impl BatchQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// The queue that feeds the given statement.
    pub fn queue(&self, op: BatchOp) -> &BatchQueue {
        match op {
            BatchOp::Delete => &self.deletes,
            BatchOp::Insert => &self.inserts,
            BatchOp::Update => &self.updates,
        }
    }

    pub fn queue_mut(&mut self, op: BatchOp) -> &mut BatchQueue {
        match op {
            BatchOp::Delete => &mut self.deletes,
            BatchOp::Insert => &mut self.inserts,
            BatchOp::Update => &mut self.updates,
        }
    }

    pub fn counts(&self) -> PendingCounts {
        PendingCounts {
            deletes: self.deletes.len(),
            inserts: self.inserts.len(),
            updates: self.updates.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counts().total() == 0
    }
}

// =============================================================================
// Tests
// =============================================================================
