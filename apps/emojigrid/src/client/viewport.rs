//! Visible-window projection over the replica.
//!
//! Rendering only ever touches the cells inside the viewport plus a small
//! overscan margin. A projection is a lazy iterator over a read guard, so the
//! cells it yields are one consistent view of the grid; change notifications
//! are filtered down to the same window.

use std::collections::HashMap;
use std::ops::Range;

use grid_proto::GridDims;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::trace;

use crate::client::replica::{DisplayCell, GridEvent, GridReplica, ReplicaState};

pub const DEFAULT_OVERSCAN: usize = 5;

/// Half-open rectangle `[rows.start, rows.end) x [cols.start, cols.end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewport {
    pub rows: Range<usize>,
    pub cols: Range<usize>,
}

impl Viewport {
    pub fn new(rows: Range<usize>, cols: Range<usize>) -> Self {
        Self { rows, cols }
    }

    /// Top-left anchored window of `height x width` cells.
    pub fn at(row: usize, col: usize, height: usize, width: usize) -> Self {
        Self::new(
            row..row.saturating_add(height),
            col..col.saturating_add(width),
        )
    }

    pub fn full(dims: GridDims) -> Self {
        Self::new(0..dims.rows, 0..dims.cols)
    }

    /// Intersect with the grid. An inverted or fully outside range becomes
    /// empty.
    pub fn clamp(&self, dims: GridDims) -> Self {
        fn clamp_range(range: &Range<usize>, limit: usize) -> Range<usize> {
            let start = range.start.min(limit);
            let end = range.end.min(limit).max(start);
            start..end
        }
        Self::new(
            clamp_range(&self.rows, dims.rows),
            clamp_range(&self.cols, dims.cols),
        )
    }

    /// Grow by `margin` on every side, then clamp.
    pub fn expand(&self, margin: usize, dims: GridDims) -> Self {
        if self.is_empty() {
            return self.clamp(dims);
        }
        Self::new(
            self.rows.start.saturating_sub(margin)..self.rows.end.saturating_add(margin),
            self.cols.start.saturating_sub(margin)..self.cols.end.saturating_add(margin),
        )
        .clamp(dims)
    }

    pub fn contains(&self, row: usize, col: usize) -> bool {
        self.rows.contains(&row) && self.cols.contains(&col)
    }

    pub fn height(&self) -> usize {
        self.rows.end.saturating_sub(self.rows.start)
    }

    pub fn width(&self) -> usize {
        self.cols.end.saturating_sub(self.cols.start)
    }

    pub fn cell_count(&self) -> usize {
        self.height() * self.width()
    }

    pub fn is_empty(&self) -> bool {
        self.cell_count() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectedCell {
    pub row: usize,
    pub col: usize,
    pub cell: DisplayCell,
}

/// Row-major walk over one window of a [`ReplicaState`].
pub struct ViewportCells<'a> {
    state: &'a ReplicaState,
    cols: Range<usize>,
    rows_end: usize,
    row: usize,
    col: usize,
}

impl<'a> ViewportCells<'a> {
    fn new(state: &'a ReplicaState, window: &Viewport) -> Self {
        let rows_end = if window.cols.is_empty() {
            window.rows.start
        } else {
            window.rows.end
        };
        Self {
            state,
            cols: window.cols.clone(),
            rows_end,
            row: window.rows.start,
            col: window.cols.start,
        }
    }
}

impl Iterator for ViewportCells<'_> {
    type Item = ProjectedCell;

    fn next(&mut self) -> Option<Self::Item> {
        if self.row >= self.rows_end {
            return None;
        }
        let (row, col) = (self.row, self.col);
        self.col += 1;
        if self.col >= self.cols.end {
            self.col = self.cols.start;
            self.row += 1;
        }
        let raw = self.state.store().row(row).map(|cells| cells[col]).unwrap_or(0);
        Some(ProjectedCell {
            row,
            col,
            cell: self.state.merge(row, col, raw),
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.row >= self.rows_end {
            0
        } else {
            let width = self.cols.end - self.cols.start;
            (self.rows_end - self.row) * width - (self.col - self.cols.start)
        };
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ViewportCells<'_> {}

/// How the projected window changed since the last poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewportChange {
    /// Re-project the whole window (snapshot, window move, or missed events).
    Full,
    /// Only these cells changed, each reported once with its latest value.
    Cells(Vec<ProjectedCell>),
}

pub struct ViewportProjector {
    dims: GridDims,
    events: broadcast::Receiver<GridEvent>,
    visible: Viewport,
    window: Viewport,
    overscan: usize,
    needs_full: bool,
}

impl ViewportProjector {
    pub fn new(replica: &GridReplica, visible: Viewport, overscan: usize) -> Self {
        let dims = replica.dims();
        let visible = visible.clamp(dims);
        let window = visible.expand(overscan, dims);
        Self {
            dims,
            events: replica.subscribe(),
            visible,
            window,
            overscan,
            needs_full: true,
        }
    }

    pub fn visible(&self) -> &Viewport {
        &self.visible
    }

    /// Visible area plus overscan, clamped to the grid.
    pub fn window(&self) -> &Viewport {
        &self.window
    }

    pub fn overscan(&self) -> usize {
        self.overscan
    }

    pub fn set_visible(&mut self, visible: Viewport) {
        let visible = visible.clamp(self.dims);
        if visible == self.visible {
            return;
        }
        self.window = visible.expand(self.overscan, self.dims);
        self.visible = visible;
        self.needs_full = true;
    }

    /// Cells of the current window, in row-major order.
    pub fn project<'a>(&self, state: &'a ReplicaState) -> ViewportCells<'a> {
        ViewportCells::new(state, &self.window)
    }

    /// Cells of the visible area only, without overscan.
    pub fn project_visible<'a>(&self, state: &'a ReplicaState) -> ViewportCells<'a> {
        ViewportCells::new(state, &self.visible)
    }

    /// Everything that changed inside the window since the last call, without
    /// waiting. `None` when nothing relevant happened.
    pub fn poll_changes(&mut self) -> Option<ViewportChange> {
        let mut cells = HashMap::new();
        self.drain_into(&mut cells);
        self.finish(cells)
    }

    /// Wait for the next change inside the window. Returns `None` once every
    /// handle to the replica has been dropped.
    pub async fn changed(&mut self) -> Option<ViewportChange> {
        if let Some(change) = self.poll_changes() {
            return Some(change);
        }
        loop {
            let mut cells = HashMap::new();
            match self.events.recv().await {
                Ok(event) => self.absorb(event, &mut cells),
                Err(RecvError::Lagged(skipped)) => {
                    trace!(target: "grid::viewport", skipped, "projector lagged");
                    self.needs_full = true;
                }
                Err(RecvError::Closed) => return None,
            }
            self.drain_into(&mut cells);
            if let Some(change) = self.finish(cells) {
                return Some(change);
            }
        }
    }

    fn drain_into(&mut self, cells: &mut HashMap<(usize, usize), ProjectedCell>) {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.absorb(event, cells),
                Err(TryRecvError::Lagged(skipped)) => {
                    trace!(target: "grid::viewport", skipped, "projector lagged");
                    self.needs_full = true;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    fn absorb(&mut self, event: GridEvent, cells: &mut HashMap<(usize, usize), ProjectedCell>) {
        match event {
            GridEvent::SnapshotApplied { .. } => self.needs_full = true,
            GridEvent::CellChanged { row, col, cell } => {
                if self.window.contains(row, col) {
                    cells.insert((row, col), ProjectedCell { row, col, cell });
                }
            }
        }
    }

    fn finish(&mut self, cells: HashMap<(usize, usize), ProjectedCell>) -> Option<ViewportChange> {
        if std::mem::take(&mut self.needs_full) {
            return Some(ViewportChange::Full);
        }
        if cells.is_empty() {
            return None;
        }
        let mut cells: Vec<_> = cells.into_values().collect();
        cells.sort_by_key(|cell| (cell.row, cell.col));
        Some(ViewportChange::Cells(cells))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Delta, Snapshot};
    use grid_proto::CatalogId;

    fn id(raw: u16) -> CatalogId {
        CatalogId::new(raw).unwrap()
    }

    #[test_timeout::timeout]
    fn clamp_and_expand_stay_inside_grid() {
        let dims = GridDims::new(10, 10);
        assert_eq!(
            Viewport::new(8..15, 3..4).clamp(dims),
            Viewport::new(8..10, 3..4)
        );
        assert_eq!(Viewport::new(12..20, 0..4).clamp(dims).cell_count(), 0);
        assert_eq!(
            Viewport::new(2..4, 7..9).expand(5, dims),
            Viewport::new(0..9, 2..10)
        );
    }

    #[test_timeout::timeout]
    fn projection_covers_exactly_the_window() {
        let dims = GridDims::STANDARD;
        let replica = GridReplica::new(dims);
        let mut snapshot = Snapshot::empty(dims);
        snapshot.set(100, 200, 17).unwrap();
        replica.apply_snapshot(&snapshot).unwrap();

        let projector = ViewportProjector::new(&replica, Viewport::new(95..130, 180..260), 0);
        let state = replica.read();
        let cells: Vec<_> = projector.project(&state).collect();
        assert_eq!(cells.len(), 35 * 80);
        assert_eq!(projector.project(&state).len(), 35 * 80);
        assert_eq!((cells[0].row, cells[0].col), (95, 180));
        let last = cells[cells.len() - 1];
        assert_eq!((last.row, last.col), (129, 259));
        for cell in &cells {
            let expected = if (cell.row, cell.col) == (100, 200) {
                DisplayCell::Placed(id(17))
            } else {
                DisplayCell::Empty
            };
            assert_eq!(cell.cell, expected, "({}, {})", cell.row, cell.col);
        }
    }

    #[test_timeout::timeout]
    fn overscan_extends_the_window() {
        let replica = GridReplica::new(GridDims::STANDARD);
        let projector =
            ViewportProjector::new(&replica, Viewport::at(0, 990, 10, 10), DEFAULT_OVERSCAN);
        assert_eq!(projector.window(), &Viewport::new(0..15, 985..1000));
        assert_eq!(projector.project_visible(&replica.read()).count(), 100);
    }

    #[test_timeout::timeout]
    fn delta_inside_window_changes_one_entry() {
        let replica = GridReplica::new(GridDims::new(50, 50));
        let mut projector = ViewportProjector::new(&replica, Viewport::new(10..20, 10..20), 0);
        let before: Vec<_> = projector.project(&replica.read()).collect();
        assert_eq!(projector.poll_changes(), Some(ViewportChange::Full));

        replica.apply_delta(&Delta::new(12, 15, id(3))).unwrap();
        replica.apply_delta(&Delta::new(40, 40, id(3))).unwrap();

        let after: Vec<_> = projector.project(&replica.read()).collect();
        let differing = before.iter().zip(&after).filter(|(a, b)| a != b).count();
        assert_eq!(differing, 1);
        assert_eq!(
            projector.poll_changes(),
            Some(ViewportChange::Cells(vec![ProjectedCell {
                row: 12,
                col: 15,
                cell: DisplayCell::Placed(id(3))
            }]))
        );
        assert_eq!(projector.poll_changes(), None);
    }

    #[test_timeout::timeout]
    fn pending_writes_show_in_projection() {
        let replica = GridReplica::new(GridDims::new(5, 5));
        let projector = ViewportProjector::new(&replica, Viewport::full(GridDims::new(5, 5)), 0);
        replica.request_write(2, 2, id(9)).unwrap();
        let state = replica.read();
        let pending: Vec<_> = projector
            .project(&state)
            .filter(|cell| cell.cell.is_pending())
            .collect();
        assert_eq!(pending.len(), 1);
        assert_eq!((pending[0].row, pending[0].col), (2, 2));
    }

    #[test_timeout::timeout]
    fn moving_or_snapshot_requests_full_redraw() {
        let dims = GridDims::new(20, 20);
        let replica = GridReplica::new(dims);
        let mut projector = ViewportProjector::new(&replica, Viewport::new(0..5, 0..5), 0);
        projector.poll_changes();

        projector.set_visible(Viewport::new(5..10, 0..5));
        assert_eq!(projector.poll_changes(), Some(ViewportChange::Full));

        replica.apply_snapshot(&Snapshot::empty(dims)).unwrap();
        assert_eq!(projector.poll_changes(), Some(ViewportChange::Full));
        assert_eq!(projector.poll_changes(), None);
    }

    #[test_timeout::tokio_timeout_test]
    async fn changed_waits_for_relevant_events() {
        let replica = GridReplica::new(GridDims::new(20, 20));
        let mut projector = ViewportProjector::new(&replica, Viewport::new(0..5, 0..5), 0);
        assert_eq!(projector.changed().await, Some(ViewportChange::Full));

        let writer = replica.clone();
        tokio::spawn(async move {
            writer.apply_delta(&Delta::new(15, 15, id(1))).unwrap();
            writer.apply_delta(&Delta::new(1, 1, id(2))).unwrap();
        });
        assert_eq!(
            projector.changed().await,
            Some(ViewportChange::Cells(vec![ProjectedCell {
                row: 1,
                col: 1,
                cell: DisplayCell::Placed(id(2))
            }]))
        );
    }

    #[test_timeout::timeout]
    fn concurrent_write_and_delta_report_the_merged_value() {
        use std::sync::{Arc, Barrier};
        use std::thread;

        for _ in 0..500 {
            let replica = GridReplica::new(GridDims::new(10, 10));
            let mut projector = ViewportProjector::new(&replica, Viewport::new(0..10, 0..10), 0);
            assert_eq!(projector.poll_changes(), Some(ViewportChange::Full));

            let barrier = Arc::new(Barrier::new(2));
            let writer = {
                let replica = replica.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    replica.request_write(5, 5, id(10)).unwrap();
                })
            };
            let server = {
                let replica = replica.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    replica.apply_delta(&Delta::new(5, 5, id(99))).unwrap();
                })
            };
            writer.join().unwrap();
            server.join().unwrap();

            let Some(ViewportChange::Cells(cells)) = projector.poll_changes() else {
                panic!("expected a cell change");
            };
            assert_eq!(cells.len(), 1);
            assert_eq!(cells[0].cell, replica.cell(5, 5).unwrap());
            assert_eq!(cells[0].cell, DisplayCell::Placed(id(99)));
        }
    }
}
