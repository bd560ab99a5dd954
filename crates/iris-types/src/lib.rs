//! Shared domain types for the IRIS streaming client.

pub mod analysis;
pub mod config;
pub mod frame;
pub mod protocol;
pub mod state;
pub mod telemetry;

mod errors;

pub use errors::{IrisError, Result};
