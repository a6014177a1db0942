//! Authoritative cell storage for the shared grid.
//!
//! The store only ever holds what the server has said: snapshots replace the
//! whole table, deltas fill a single empty cell. Optimistic local writes live
//! in [`crate::client::writes`] and are merged at read time.
//!
//! ```
//! # use emojigrid_client::cache::{EmojiGrid, WriteOutcome};
//! # use emojigrid_client::protocol::Delta;
//! # use emojigrid_client::{CatalogId, GridDims};
//! let mut grid = EmojiGrid::new(GridDims::new(4, 4));
//! let smile = CatalogId::new(7).unwrap();
//! assert_eq!(grid.apply_delta(&Delta::new(1, 2, smile)).unwrap(), WriteOutcome::Written);
//! assert_eq!(grid.read(1, 2).unwrap(), 7);
//! ```

pub mod grid;

use grid_proto::{CatalogId, GridDims};

pub use grid::{EmojiGrid, SnapshotReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Cell already held a value; first writer wins so the delta was dropped.
    SkippedOccupied { existing: CatalogId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GridError {
    #[error("cell ({row}, {col}) is outside the {rows}x{cols} grid")]
    OutOfRange {
        row: i64,
        col: i64,
        rows: usize,
        cols: usize,
    },
    #[error("cell value {value} is not a catalog id")]
    InvalidValue { value: i64 },
    #[error("snapshot is {actual_rows}x{actual_cols}, store is {rows}x{cols}")]
    DimensionMismatch {
        rows: usize,
        cols: usize,
        actual_rows: usize,
        actual_cols: usize,
    },
}

impl GridError {
    pub fn out_of_range(row: i64, col: i64, dims: GridDims) -> Self {
        GridError::OutOfRange {
            row,
            col,
            rows: dims.rows,
            cols: dims.cols,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            GridError::OutOfRange { .. } => "out_of_range",
            GridError::InvalidValue { .. } => "invalid_value",
            GridError::DimensionMismatch { .. } => "dimension_mismatch",
        }
    }
}
