use grid_proto::{CatalogId, GridDims};
use tracing::{trace, warn};

use super::{GridError, WriteOutcome};
use crate::protocol::{Delta, Snapshot};

/// Result of installing a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnapshotReport {
    pub occupied: usize,
    /// Cells that were occupied locally but empty in the snapshot. Cells never
    /// revert to empty, so anything here points at a server-side reset or a
    /// corrupted frame.
    pub regressed: usize,
}

/// Flat row-major table of cell values. One allocation for the lifetime of
/// the store; snapshots are copied into it in place.
#[derive(Debug, Clone)]
pub struct EmojiGrid {
    dims: GridDims,
    cells: Vec<u16>,
    occupied: usize,
}

impl EmojiGrid {
    pub fn new(dims: GridDims) -> Self {
        Self {
            dims,
            cells: vec![0; dims.cell_count()],
            occupied: 0,
        }
    }

    #[inline]
    pub fn dims(&self) -> GridDims {
        self.dims
    }

    /// Number of non-empty cells.
    #[inline]
    pub fn occupied(&self) -> usize {
        self.occupied
    }

    pub fn cells(&self) -> &[u16] {
        &self.cells
    }

    /// Raw value at `(row, col)`, 0 meaning empty.
    pub fn read(&self, row: usize, col: usize) -> Result<u16, GridError> {
        self.index(row, col).map(|index| self.cells[index])
    }

    /// In-range lookup that folds "empty" into `None`.
    pub fn get(&self, row: usize, col: usize) -> Option<CatalogId> {
        self.dims
            .index(row, col)
            .and_then(|index| CatalogId::new(self.cells[index]))
    }

    pub fn row(&self, row: usize) -> Option<&[u16]> {
        if row >= self.dims.rows {
            return None;
        }
        let start = row * self.dims.cols;
        Some(&self.cells[start..start + self.dims.cols])
    }

    /// Replace every cell with the snapshot's contents.
    ///
    /// The snapshot is installed even when it empties cells that were occupied
    /// here; such regressions are counted in the report and logged.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<SnapshotReport, GridError> {
        let incoming = snapshot.dims();
        if incoming != self.dims {
            return Err(GridError::DimensionMismatch {
                rows: self.dims.rows,
                cols: self.dims.cols,
                actual_rows: incoming.rows,
                actual_cols: incoming.cols,
            });
        }

        let mut report = SnapshotReport::default();
        for (current, &next) in self.cells.iter_mut().zip(snapshot.cells()) {
            if *current != 0 && next == 0 {
                report.regressed += 1;
            }
            if next != 0 {
                report.occupied += 1;
            }
            *current = next;
        }
        self.occupied = report.occupied;

        if report.regressed > 0 {
            warn!(
                target: "grid::store",
                regressed = report.regressed,
                occupied = report.occupied,
                "snapshot cleared previously occupied cells"
            );
        }
        Ok(report)
    }

    /// Fill one empty cell. Occupied cells are never overwritten; the store
    /// reports the value already there instead.
    pub fn apply_delta(&mut self, delta: &Delta) -> Result<WriteOutcome, GridError> {
        let index = self.index(delta.row, delta.col)?;
        if let Some(existing) = CatalogId::new(self.cells[index]) {
            trace!(
                target: "grid::store",
                row = delta.row,
                col = delta.col,
                existing = existing.get(),
                incoming = delta.value.get(),
                "delta for occupied cell ignored"
            );
            return Ok(WriteOutcome::SkippedOccupied { existing });
        }
        self.cells[index] = delta.value.get();
        self.occupied += 1;
        Ok(WriteOutcome::Written)
    }

    #[inline]
    fn index(&self, row: usize, col: usize) -> Result<usize, GridError> {
        self.dims
            .index(row, col)
            .ok_or_else(|| GridError::out_of_range(row as i64, col as i64, self.dims))
    }
}
