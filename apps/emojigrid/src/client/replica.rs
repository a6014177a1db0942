use std::sync::Arc;

use grid_proto::{CatalogId, GridDims};
use parking_lot::{RwLock, RwLockReadGuard};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::{EmojiGrid, GridError, SnapshotReport, WriteOutcome};
use crate::client::writes::{
    Reconciliation, SnapshotReconciliation, WriteCoordinator, WriteDecision,
};
use crate::protocol::{Delta, Snapshot};
use crate::telemetry;

const EVENT_CAPACITY: usize = 4096;

/// What a reader should display for one cell: the authoritative value wins,
/// then a pending local write, then empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisplayCell {
    Empty,
    Pending(CatalogId),
    Placed(CatalogId),
}

impl DisplayCell {
    pub fn id(&self) -> Option<CatalogId> {
        match self {
            DisplayCell::Empty => None,
            DisplayCell::Pending(id) | DisplayCell::Placed(id) => Some(*id),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, DisplayCell::Pending(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridEvent {
    /// Every cell may have changed.
    SnapshotApplied { generation: u64, occupied: usize },
    CellChanged {
        row: usize,
        col: usize,
        cell: DisplayCell,
    },
}

/// Store plus pending writes, always read and written together.
#[derive(Debug)]
pub struct ReplicaState {
    store: EmojiGrid,
    writes: WriteCoordinator,
    snapshots: u64,
}

impl ReplicaState {
    pub fn store(&self) -> &EmojiGrid {
        &self.store
    }

    pub fn writes(&self) -> &WriteCoordinator {
        &self.writes
    }

    /// Snapshots installed so far; 0 until the first one arrives.
    pub fn snapshot_generation(&self) -> u64 {
        self.snapshots
    }

    pub fn cell(&self, row: usize, col: usize) -> Result<DisplayCell, GridError> {
        let raw = self.store.read(row, col)?;
        Ok(self.merge(row, col, raw))
    }

    #[inline]
    pub(crate) fn merge(&self, row: usize, col: usize, raw: u16) -> DisplayCell {
        if let Some(id) = CatalogId::new(raw) {
            return DisplayCell::Placed(id);
        }
        match self.writes.pending_at(row, col) {
            Some(pending) => DisplayCell::Pending(pending.value),
            None => DisplayCell::Empty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotOutcome {
    pub report: SnapshotReport,
    pub writes: SnapshotReconciliation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaOutcome {
    pub write: WriteOutcome,
    pub reconciliation: Reconciliation,
}

/// Shared client-side replica of the grid. Cheap to clone; every clone sees
/// the same state and publishes to the same event stream.
#[derive(Clone)]
pub struct GridReplica {
    state: Arc<RwLock<ReplicaState>>,
    events: broadcast::Sender<GridEvent>,
}

impl GridReplica {
    pub fn new(dims: GridDims) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(ReplicaState {
                store: EmojiGrid::new(dims),
                writes: WriteCoordinator::new(),
                snapshots: 0,
            })),
            events,
        }
    }

    pub fn dims(&self) -> GridDims {
        self.state.read().store.dims()
    }

    /// Consistent read view. Hold it briefly: writers wait on it.
    pub fn read(&self) -> RwLockReadGuard<'_, ReplicaState> {
        self.state.read()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GridEvent> {
        self.events.subscribe()
    }

    /// Authoritative value at `(row, col)`.
    pub fn value(&self, row: usize, col: usize) -> Result<u16, GridError> {
        self.state.read().store.read(row, col)
    }

    pub fn cell(&self, row: usize, col: usize) -> Result<DisplayCell, GridError> {
        self.state.read().cell(row, col)
    }

    pub fn request_write(
        &self,
        row: usize,
        col: usize,
        value: CatalogId,
    ) -> Result<WriteDecision, GridError> {
        let decision = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let decision = state.writes.request_write(&state.store, row, col, value)?;
            if let WriteDecision::Accepted(delta) = decision {
                self.publish(GridEvent::CellChanged {
                    row: delta.row,
                    col: delta.col,
                    cell: DisplayCell::Pending(delta.value),
                });
            }
            decision
        };
        match decision {
            WriteDecision::Accepted(_) => debug!(
                target: "client::writes",
                row,
                col,
                value = value.get(),
                "write pending"
            ),
            WriteDecision::Rejected(reason) => debug!(
                target: "client::writes",
                row,
                col,
                value = value.get(),
                ?reason,
                "write rejected"
            ),
        }
        Ok(decision)
    }

    pub fn apply_snapshot(&self, snapshot: &Snapshot) -> Result<SnapshotOutcome, GridError> {
        let _perf = telemetry::PerfGuard::new("replica_apply_snapshot");
        let (outcome, generation) = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let report = state.store.apply_snapshot(snapshot)?;
            let writes = state.writes.reconcile_snapshot(&state.store);
            state.snapshots += 1;
            self.publish(GridEvent::SnapshotApplied {
                generation: state.snapshots,
                occupied: report.occupied,
            });
            (SnapshotOutcome { report, writes }, state.snapshots)
        };

        if outcome.report.regressed > 0 {
            telemetry::record_integrity_fault("snapshot_regression", outcome.report.regressed);
        }
        for (delta, stored) in &outcome.writes.resolved {
            if *stored != delta.value {
                debug!(
                    target: "client::writes",
                    row = delta.row,
                    col = delta.col,
                    ours = delta.value.get(),
                    theirs = stored.get(),
                    "pending write lost to another client"
                );
            }
        }
        info!(
            target: "grid::replica",
            generation,
            occupied = outcome.report.occupied,
            resolved = outcome.writes.resolved.len(),
            retained = outcome.writes.retained.len(),
            "snapshot applied"
        );
        Ok(outcome)
    }

    pub fn apply_delta(&self, delta: &Delta) -> Result<DeltaOutcome, GridError> {
        let outcome = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let write = state.store.apply_delta(delta)?;
            let stored = match write {
                WriteOutcome::Written => delta.value,
                WriteOutcome::SkippedOccupied { existing } => existing,
            };
            let reconciliation = state.writes.reconcile(delta, stored);
            let unchanged = matches!(write, WriteOutcome::SkippedOccupied { .. })
                && reconciliation == Reconciliation::NoPending;
            if !unchanged {
                self.publish(GridEvent::CellChanged {
                    row: delta.row,
                    col: delta.col,
                    cell: DisplayCell::Placed(stored),
                });
            }
            DeltaOutcome {
                write,
                reconciliation,
            }
        };

        match outcome.reconciliation {
            Reconciliation::Superseded { ours, theirs } => debug!(
                target: "client::writes",
                row = delta.row,
                col = delta.col,
                ours = ours.get(),
                theirs = theirs.get(),
                "pending write lost to another client"
            ),
            Reconciliation::Confirmed { value } => debug!(
                target: "client::writes",
                row = delta.row,
                col = delta.col,
                value = value.get(),
                "pending write confirmed"
            ),
            Reconciliation::NoPending => {}
        }
        if let (WriteOutcome::SkippedOccupied { existing }, Reconciliation::NoPending) =
            (outcome.write, outcome.reconciliation)
        {
            if existing != delta.value {
                warn!(
                    target: "grid::replica",
                    row = delta.row,
                    col = delta.col,
                    existing = existing.get(),
                    incoming = delta.value.get(),
                    "server sent a conflicting delta for an occupied cell"
                );
                telemetry::record_integrity_fault("conflicting_delta", 1);
            }
        }
        Ok(outcome)
    }

    /// Called with the write guard held so subscribers see events in the same
    /// order the state changed. `send` never blocks.
    fn publish(&self, event: GridEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u16) -> CatalogId {
        CatalogId::new(raw).unwrap()
    }

    #[test_timeout::timeout]
    fn merged_read_prefers_authoritative_value() {
        let replica = GridReplica::new(GridDims::new(2, 2));
        replica.request_write(0, 1, id(3)).unwrap();
        assert_eq!(replica.cell(0, 1), Ok(DisplayCell::Pending(id(3))));
        assert_eq!(replica.value(0, 1), Ok(0));

        replica.apply_delta(&Delta::new(0, 1, id(8))).unwrap();
        assert_eq!(replica.cell(0, 1), Ok(DisplayCell::Placed(id(8))));
        assert!(replica.read().writes().is_empty());
    }

    #[test_timeout::timeout]
    fn events_follow_transitions() {
        let replica = GridReplica::new(GridDims::new(2, 2));
        let mut events = replica.subscribe();

        replica.request_write(1, 1, id(4)).unwrap();
        replica.apply_delta(&Delta::new(1, 1, id(4))).unwrap();
        // Duplicate delivery changes nothing and says nothing.
        replica.apply_delta(&Delta::new(1, 1, id(4))).unwrap();
        replica
            .apply_snapshot(&Snapshot::empty(GridDims::new(2, 2)))
            .unwrap();

        assert_eq!(
            events.try_recv().unwrap(),
            GridEvent::CellChanged {
                row: 1,
                col: 1,
                cell: DisplayCell::Pending(id(4))
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            GridEvent::CellChanged {
                row: 1,
                col: 1,
                cell: DisplayCell::Placed(id(4))
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            GridEvent::SnapshotApplied {
                generation: 1,
                occupied: 0
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn out_of_range_delta_changes_nothing() {
        let replica = GridReplica::new(GridDims::new(2, 2));
        let mut events = replica.subscribe();
        assert!(replica.apply_delta(&Delta::new(5, 0, id(1))).is_err());
        assert_eq!(replica.read().store().occupied(), 0);
        assert!(events.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn snapshot_counts_generations() {
        let dims = GridDims::new(1, 2);
        let replica = GridReplica::new(dims);
        assert_eq!(replica.read().snapshot_generation(), 0);
        replica.apply_snapshot(&Snapshot::empty(dims)).unwrap();
        replica.apply_snapshot(&Snapshot::empty(dims)).unwrap();
        assert_eq!(replica.read().snapshot_generation(), 2);
    }
}
