//! Schema descriptor - the inferred shape of a provider at a point in time.

use super::ColumnDescriptor;
use rkyv::{Archive, Deserialize, Serialize};

/// Field separator inside one column's fingerprint tuple.
const FIELD_SEP: u8 = 0x1f;

/// Record separator between column tuples.
const RECORD_SEP: u8 = 0x1e;

/// Ordered structural descriptor of one provider.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct SchemaDescriptor {
    /// Provider the descriptor was captured from.
    pub provider_id: String,
    /// Columns in source order. Order is significant.
    pub columns: Vec<ColumnDescriptor>,
    /// Hex-encoded blake3 hash over the ordered column tuples.
    pub fingerprint: String,
    /// Capture timestamp (microseconds since Unix epoch).
    pub captured_at: u64,
    /// Number of rows the descriptor was inferred from.
    pub row_count: u64,
}

impl SchemaDescriptor {
    /// Build a descriptor and compute its fingerprint.
    pub fn new(provider_id: impl Into<String>, columns: Vec<ColumnDescriptor>) -> Self {
        let fingerprint = Self::compute_fingerprint(&columns);
        Self {
            provider_id: provider_id.into(),
            columns,
            fingerprint,
            captured_at: crate::current_timestamp(),
            row_count: 0,
        }
    }

    /// Set the sampled row count.
    pub fn with_row_count(mut self, row_count: u64) -> Self {
        self.row_count = row_count;
        self
    }

    /// Hash the ordered `(name, type, nullable, unique)` tuple stream.
    ///
    /// Sample values, ordinals and candidate flags are excluded; order is
    /// captured by the stream itself.
    pub fn compute_fingerprint(columns: &[ColumnDescriptor]) -> String {
        let mut hasher = blake3::Hasher::new();
        for column in columns {
            hasher.update(column.name.as_bytes());
            hasher.update(&[FIELD_SEP]);
            hasher.update(column.inferred_type.as_str().as_bytes());
            hasher.update(&[FIELD_SEP]);
            hasher.update(&[column.nullable as u8]);
            hasher.update(&[FIELD_SEP]);
            hasher.update(&[column.unique as u8]);
            hasher.update(&[RECORD_SEP]);
        }
        hex::encode(hasher.finalize().as_bytes())
    }

    /// Recompute the fingerprint after the columns were edited in place.
    pub fn refresh_fingerprint(&mut self) {
        self.fingerprint = Self::compute_fingerprint(&self.columns);
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Look up a column by name (mutable).
    pub fn column_mut(&mut self, name: &str) -> Option<&mut ColumnDescriptor> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    /// Column names in order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Candidate identifier columns.
    pub fn identifier_columns(&self) -> Vec<&ColumnDescriptor> {
        self.columns.iter().filter(|c| c.is_identifier).collect()
    }

    /// Candidate timestamp columns.
    pub fn timestamp_columns(&self) -> Vec<&ColumnDescriptor> {
        self.columns.iter().filter(|c| c.is_timestamp).collect()
    }

    /// Reorder columns to follow `order` and renumber ordinals.
    ///
    /// Columns not named in `order` keep their relative order after the named
    /// ones.
    pub fn resequence(&mut self, order: &[&str]) {
        let rank = |name: &str| order.iter().position(|n| *n == name).unwrap_or(usize::MAX);
        self.columns.sort_by_key(|c| rank(&c.name));
        for (idx, column) in self.columns.iter_mut().enumerate() {
            column.ordinal_position = idx as u32;
        }
    }

    /// Check if the descriptor has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}
