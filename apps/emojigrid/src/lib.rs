pub mod cache;
pub mod catalog;
pub mod client;
pub mod config;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use grid_proto::{CatalogId, GridDims};
