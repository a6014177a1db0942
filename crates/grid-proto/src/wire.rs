use serde::{Deserialize, Serialize};

use crate::dims::GridDims;

/// Cell values share the snapshot's 16-bit domain.
pub const VALUE_MASK: i64 = 0xFFFF;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("snapshot length {len} is not a whole number of u16 cells")]
    OddLength { len: usize },
    #[error("snapshot carries {actual} cells, expected {expected}")]
    CellCount { expected: usize, actual: usize },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("malformed update message: {reason}")]
pub struct ParseError {
    reason: String,
}

impl ParseError {
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        Self {
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl WireError {
    /// Short label used for logging and telemetry counters.
    pub fn label(&self) -> &'static str {
        match self {
            WireError::Format(_) => "format",
            WireError::Parse(_) => "parse",
        }
    }
}

/// Encode cell values as a snapshot frame: big-endian `u16` per cell, no
/// header, no padding.
pub fn encode_snapshot(cells: &[u16]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(cells.len() * 2);
    for cell in cells {
        buf.extend_from_slice(&cell.to_be_bytes());
    }
    buf
}

/// Decode a snapshot frame into `out`, reusing its allocation.
///
/// The byte length is the only validity check the format has: it must be
/// exactly `dims.snapshot_len()`. On error `out` is left untouched.
pub fn decode_snapshot_into(
    bytes: &[u8],
    dims: GridDims,
    out: &mut Vec<u16>,
) -> Result<(), FormatError> {
    if bytes.len() % 2 != 0 {
        return Err(FormatError::OddLength { len: bytes.len() });
    }
    let actual = bytes.len() / 2;
    if actual != dims.cell_count() {
        return Err(FormatError::CellCount {
            expected: dims.cell_count(),
            actual,
        });
    }
    out.clear();
    out.reserve(actual);
    out.extend(
        bytes
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]])),
    );
    Ok(())
}

pub fn decode_snapshot(bytes: &[u8], dims: GridDims) -> Result<Vec<u16>, FormatError> {
    let mut cells = Vec::new();
    decode_snapshot_into(bytes, dims, &mut cells)?;
    Ok(cells)
}

/// Single-cell update as it appears on the wire, in both directions.
///
/// Fields are kept as plain integers: range and occupancy checks belong to the
/// grid store, not the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UpdateMessage {
    pub row: i64,
    pub col: i64,
    pub value: i64,
}

impl UpdateMessage {
    pub const fn new(row: i64, col: i64, value: i64) -> Self {
        Self { row, col, value }
    }

    /// The value as it will be encoded, folded into the 16-bit cell domain.
    pub const fn masked_value(&self) -> i64 {
        self.value & VALUE_MASK
    }
}

/// Encode an update as compact JSON with a fixed key order
/// (`{"row":1,"col":2,"value":3}`), byte-identical to what the server emits.
pub fn encode_update(msg: &UpdateMessage) -> String {
    format!(
        r#"{{"row":{},"col":{},"value":{}}}"#,
        msg.row,
        msg.col,
        msg.masked_value()
    )
}

/// Decode an update text frame. Missing fields, non-integer fields and
/// non-object payloads are all `ParseError`s; unknown extra fields are ignored.
pub fn decode_update(text: &str) -> Result<UpdateMessage, ParseError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    // Derived struct deserializers also accept sequences; the wire only has objects.
    if !value.is_object() {
        return Err(ParseError {
            reason: "expected a JSON object".to_string(),
        });
    }
    Ok(serde_json::from_value(value)?)
}
