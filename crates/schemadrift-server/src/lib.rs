//! schemadrift server library.
//!
//! Wires the schema engine to CSV files on disk and exposes it as a
//! long-running reconciliation daemon plus one-shot CLI commands.

pub mod commands;
pub mod config;
pub mod csv_source;
pub mod error;

pub use config::{Args, Command, ServerConfig};
pub use csv_source::CsvSampleSource;
pub use error::Error;
