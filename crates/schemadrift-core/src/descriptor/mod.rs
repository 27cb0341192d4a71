//! Structural descriptors for provider data.
//!
//! A descriptor is the inferred shape of one provider: ordered columns with
//! their types and flags, plus a fingerprint used for cheap change detection.

mod column;
mod schema;
mod types;

pub use column::{is_identifier_name, normalize_value, value_key, ColumnDescriptor, MAX_SAMPLE_VALUES};
pub use schema::SchemaDescriptor;
pub use types::ColumnType;
