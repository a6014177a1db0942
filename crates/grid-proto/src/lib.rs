//! Shared wire definitions for emojigrid clients and the grid server.
//! Keeping this in a dedicated crate lets the client, the server and test
//! fixtures agree on the byte layout without pulling in runtime code.
//!
//! Two message shapes cross the wire:
//! - a full snapshot: `2 * rows * cols` bytes of big-endian `u16`, row-major,
//!   sent as one binary frame when a session opens;
//! - a single-cell update: a JSON text frame `{"row":..,"col":..,"value":..}`,
//!   used both for client write intents and for server broadcasts.

pub mod dims;
pub mod wire;

pub use dims::{CatalogId, GRID_COLS, GRID_ROWS, GridDims};
pub use wire::{
    FormatError, ParseError, UpdateMessage, VALUE_MASK, WireError, decode_snapshot,
    decode_snapshot_into, decode_update, encode_snapshot, encode_update,
};
