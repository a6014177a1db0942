use std::fmt;
use std::num::NonZeroU16;

pub const GRID_ROWS: usize = 1000;
pub const GRID_COLS: usize = 1000;

/// Dimensions of the shared grid. The wire contract always uses
/// [`GridDims::STANDARD`]; other sizes only exist to keep tests small.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridDims {
    pub rows: usize,
    pub cols: usize,
}

impl GridDims {
    pub const STANDARD: GridDims = GridDims {
        rows: GRID_ROWS,
        cols: GRID_COLS,
    };

    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    #[inline]
    pub const fn cell_count(&self) -> usize {
        self.rows * self.cols
    }

    /// Exact byte length of an encoded snapshot for these dimensions.
    #[inline]
    pub const fn snapshot_len(&self) -> usize {
        self.cell_count() * 2
    }

    #[inline]
    pub const fn contains(&self, row: usize, col: usize) -> bool {
        row < self.rows && col < self.cols
    }

    /// Row-major index of `(row, col)`, or `None` outside the grid.
    #[inline]
    pub const fn index(&self, row: usize, col: usize) -> Option<usize> {
        if self.contains(row, col) {
            Some(row * self.cols + col)
        } else {
            None
        }
    }
}

impl Default for GridDims {
    fn default() -> Self {
        Self::STANDARD
    }
}

/// Identifier of an entry in the emoji catalog. Zero is reserved for "empty"
/// on the wire, so a `CatalogId` is always in `1..=65535`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CatalogId(NonZeroU16);

impl CatalogId {
    #[inline]
    pub const fn new(raw: u16) -> Option<Self> {
        match NonZeroU16::new(raw) {
            Some(value) => Some(Self(value)),
            None => None,
        }
    }

    #[inline]
    pub const fn get(self) -> u16 {
        self.0.get()
    }
}

impl From<CatalogId> for u16 {
    fn from(id: CatalogId) -> Self {
        id.get()
    }
}

impl fmt::Display for CatalogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get())
    }
}
