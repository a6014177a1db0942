//! Optimistic local writes awaiting the server's verdict.
//!
//! A write is accepted locally only for a cell that is empty in the store and
//! has no pending write of its own. The pending entry is shown to the user at
//! once and is cleared by the first authoritative word on that cell: a delta
//! (ours or a rival's) or a snapshot that has the cell occupied.

use std::collections::HashMap;

use grid_proto::CatalogId;

use crate::cache::{EmojiGrid, GridError};
use crate::protocol::Delta;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingWrite {
    pub value: CatalogId,
    /// Times this write has been sent again after a snapshot.
    pub replays: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Occupied { existing: CatalogId },
    AlreadyPending { value: CatalogId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDecision {
    /// Recorded as pending; the delta must be sent upstream.
    Accepted(Delta),
    Rejected(RejectReason),
}

/// What an authoritative delta meant for our pending write on that cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    NoPending,
    /// The server stored our value.
    Confirmed { value: CatalogId },
    /// Someone else got there first; our write is discarded.
    Superseded { ours: CatalogId, theirs: CatalogId },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotReconciliation {
    /// Cells the snapshot shows occupied: the pending write is resolved.
    pub resolved: Vec<(Delta, CatalogId)>,
    /// Cells still empty: the write may have been lost with the old
    /// connection, so it is kept and should be sent again.
    pub retained: Vec<Delta>,
}

#[derive(Debug, Default)]
pub struct WriteCoordinator {
    pending: HashMap<(usize, usize), PendingWrite>,
}

impl WriteCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_at(&self, row: usize, col: usize) -> Option<&PendingWrite> {
        self.pending.get(&(row, col))
    }

    pub fn request_write(
        &mut self,
        store: &EmojiGrid,
        row: usize,
        col: usize,
        value: CatalogId,
    ) -> Result<WriteDecision, GridError> {
        if let Some(existing) = CatalogId::new(store.read(row, col)?) {
            return Ok(WriteDecision::Rejected(RejectReason::Occupied { existing }));
        }
        if let Some(pending) = self.pending.get(&(row, col)) {
            return Ok(WriteDecision::Rejected(RejectReason::AlreadyPending {
                value: pending.value,
            }));
        }
        self.pending.insert(
            (row, col),
            PendingWrite {
                value,
                replays: 0,
            },
        );
        Ok(WriteDecision::Accepted(Delta::new(row, col, value)))
    }

    /// Settle the pending write on `delta`'s cell against the value the store
    /// now holds there (which is `delta.value` unless the cell was already
    /// occupied).
    pub fn reconcile(&mut self, delta: &Delta, stored: CatalogId) -> Reconciliation {
        match self.pending.remove(&(delta.row, delta.col)) {
            None => Reconciliation::NoPending,
            Some(pending) if pending.value == stored => {
                Reconciliation::Confirmed { value: stored }
            }
            Some(pending) => Reconciliation::Superseded {
                ours: pending.value,
                theirs: stored,
            },
        }
    }

    /// Re-check every pending write against a freshly installed snapshot.
    pub fn reconcile_snapshot(&mut self, store: &EmojiGrid) -> SnapshotReconciliation {
        let mut outcome = SnapshotReconciliation::default();
        self.pending.retain(|&(row, col), pending| {
            let delta = Delta::new(row, col, pending.value);
            match store.get(row, col) {
                Some(stored) => {
                    outcome.resolved.push((delta, stored));
                    false
                }
                None => {
                    pending.replays += 1;
                    outcome.retained.push(delta);
                    true
                }
            }
        });
        outcome
    }
}
