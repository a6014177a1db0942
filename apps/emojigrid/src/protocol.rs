//! Client-side view of the wire protocol.
//!
//! `grid-proto` owns the byte layout; this module turns transport payloads into
//! the messages the grid store understands. Binary frames are always
//! snapshots and text frames are always single-cell updates: the server has no
//! other framing, so the frame kind is the message type.

use grid_proto::{
    CatalogId, FormatError, GridDims, UpdateMessage, WireError, decode_snapshot_into,
    decode_update, encode_snapshot, encode_update,
};

use crate::cache::GridError;
use crate::transport::Payload;

/// Dense row-major table of every cell value, 0 meaning empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    dims: GridDims,
    cells: Vec<u16>,
}

impl Snapshot {
    pub fn empty(dims: GridDims) -> Self {
        Self {
            dims,
            cells: vec![0; dims.cell_count()],
        }
    }

    pub fn from_cells(dims: GridDims, cells: Vec<u16>) -> Result<Self, FormatError> {
        if cells.len() != dims.cell_count() {
            return Err(FormatError::CellCount {
                expected: dims.cell_count(),
                actual: cells.len(),
            });
        }
        Ok(Self { dims, cells })
    }

    /// Overwrite this snapshot from a binary frame, keeping the allocation.
    /// On error the previous contents are left as they were.
    pub fn decode_into(&mut self, bytes: &[u8]) -> Result<(), FormatError> {
        decode_snapshot_into(bytes, self.dims, &mut self.cells)
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_snapshot(&self.cells)
    }

    pub fn dims(&self) -> GridDims {
        self.dims
    }

    pub fn cells(&self) -> &[u16] {
        &self.cells
    }

    /// Raw value at `(row, col)`; 0 for empty and for out-of-range coordinates.
    pub fn value(&self, row: usize, col: usize) -> u16 {
        self.dims
            .index(row, col)
            .map(|index| self.cells[index])
            .unwrap_or(0)
    }

    pub fn set(&mut self, row: usize, col: usize, value: u16) -> Result<(), GridError> {
        let index = self
            .dims
            .index(row, col)
            .ok_or_else(|| GridError::out_of_range(row as i64, col as i64, self.dims))?;
        self.cells[index] = value;
        Ok(())
    }
}

/// One cell going from empty to `value`. Coordinates are validated against
/// the grid when built from the wire, and again by the store on apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Delta {
    pub row: usize,
    pub col: usize,
    pub value: CatalogId,
}

impl Delta {
    pub const fn new(row: usize, col: usize, value: CatalogId) -> Self {
        Self { row, col, value }
    }

    pub fn from_wire(msg: &UpdateMessage, dims: GridDims) -> Result<Self, GridError> {
        let out_of_range = || GridError::out_of_range(msg.row, msg.col, dims);
        let row = usize::try_from(msg.row).map_err(|_| out_of_range())?;
        let col = usize::try_from(msg.col).map_err(|_| out_of_range())?;
        if !dims.contains(row, col) {
            return Err(out_of_range());
        }
        let value = u16::try_from(msg.value)
            .ok()
            .and_then(CatalogId::new)
            .ok_or(GridError::InvalidValue { value: msg.value })?;
        Ok(Self { row, col, value })
    }

    pub fn to_wire(&self) -> UpdateMessage {
        UpdateMessage::new(
            self.row as i64,
            self.col as i64,
            i64::from(self.value.get()),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundFrame<'a> {
    Snapshot(&'a Snapshot),
    Update(UpdateMessage),
}

impl InboundFrame<'_> {
    pub fn label(&self) -> &'static str {
        match self {
            InboundFrame::Snapshot(_) => "snapshot",
            InboundFrame::Update(_) => "update",
        }
    }
}

/// Classifies inbound payloads. Snapshots are decoded into one buffer that
/// lives as long as the decoder, so a resync does not allocate a fresh grid.
#[derive(Debug)]
pub struct FrameDecoder {
    snapshot: Snapshot,
}

impl FrameDecoder {
    pub fn new(dims: GridDims) -> Self {
        Self {
            snapshot: Snapshot::empty(dims),
        }
    }

    pub fn dims(&self) -> GridDims {
        self.snapshot.dims()
    }

    pub fn decode(&mut self, payload: &Payload) -> Result<InboundFrame<'_>, WireError> {
        match payload {
            Payload::Binary(bytes) => {
                self.snapshot.decode_into(bytes)?;
                Ok(InboundFrame::Snapshot(&self.snapshot))
            }
            Payload::Text(text) => Ok(InboundFrame::Update(decode_update(text)?)),
        }
    }
}

/// Write intents go upstream in exactly the update shape.
pub fn encode_write(msg: &UpdateMessage) -> Payload {
    Payload::Text(encode_update(msg))
}
