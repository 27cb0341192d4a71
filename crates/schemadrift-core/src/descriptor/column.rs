//! Column descriptors.

use super::ColumnType;
use rkyv::{Archive, Deserialize, Serialize};

/// Upper bound on the distinct values retained per column.
pub const MAX_SAMPLE_VALUES: usize = 64;

/// Inferred structure of a single provider column.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct ColumnDescriptor {
    /// Column name as it appears in the source header.
    pub name: String,
    /// Inferred type.
    pub inferred_type: ColumnType,
    /// Whether any sampled value was empty or missing.
    pub nullable: bool,
    /// Whether all sampled non-null values were distinct.
    pub unique: bool,
    /// Zero-based position in the source.
    pub ordinal_position: u32,
    /// Distinct non-empty values in first-seen order, at most
    /// [`MAX_SAMPLE_VALUES`]. Diagnostics only; not part of the fingerprint.
    pub sample_values: Vec<String>,
    /// Sorted keys of every distinct sampled value, see [`value_key`].
    /// Drives value overlap; not part of the fingerprint.
    pub value_set: Vec<u64>,
    /// Candidate identifier column.
    pub is_identifier: bool,
    /// Candidate timestamp column.
    pub is_timestamp: bool,
}

impl ColumnDescriptor {
    /// Create a nullable, non-unique column with no samples.
    pub fn new(name: impl Into<String>, inferred_type: ColumnType, ordinal_position: u32) -> Self {
        Self {
            name: name.into(),
            inferred_type,
            nullable: true,
            unique: false,
            ordinal_position,
            sample_values: Vec::new(),
            value_set: Vec::new(),
            is_identifier: false,
            is_timestamp: inferred_type == ColumnType::DateTime,
        }
    }

    /// Mark the column as never empty in the sample.
    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Mark the column as holding distinct values.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Attach sample values.
    ///
    /// Every value contributes to the value set; only the first
    /// [`MAX_SAMPLE_VALUES`] distinct values are retained as text.
    pub fn with_samples<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sample_values.clear();
        self.value_set.clear();
        for value in values {
            let value = value.into();
            self.value_set.push(value_key(&value));
            if self.sample_values.len() < MAX_SAMPLE_VALUES && !self.sample_values.contains(&value) {
                self.sample_values.push(value);
            }
        }
        self.value_set.sort_unstable();
        self.value_set.dedup();
        self
    }

    /// Mark as candidate identifier.
    pub fn identifier(mut self) -> Self {
        self.is_identifier = true;
        self
    }

    /// Whether the name follows a recognized identifier pattern
    /// (`id` or a `_id` suffix, case-insensitive).
    pub fn has_identifier_name(&self) -> bool {
        is_identifier_name(&self.name)
    }

    /// Fraction of this column's distinct values also present in `other`'s.
    ///
    /// Values compare after [`normalize_value`]. Returns 0.0 when this
    /// column has no samples.
    pub fn value_overlap(&self, other: &ColumnDescriptor) -> f64 {
        if self.value_set.is_empty() {
            return 0.0;
        }
        let shared = self
            .value_set
            .iter()
            .filter(|key| other.value_set.binary_search(key).is_ok())
            .count();
        shared as f64 / self.value_set.len() as f64
    }

    /// Structural equality: the attributes covered by the fingerprint.
    pub fn same_structure(&self, other: &ColumnDescriptor) -> bool {
        self.name == other.name
            && self.inferred_type == other.inferred_type
            && self.nullable == other.nullable
            && self.unique == other.unique
    }
}

/// Canonical text of a sampled value: trimmed, and finite numbers written in
/// their shortest form so `10`, `10.0` and `1e1` compare equal.
pub fn normalize_value(value: &str) -> String {
    let trimmed = value.trim();
    match trimmed.parse::<f64>() {
        Ok(number) if number.is_finite() => {
            if number == 0.0 {
                "0".to_string()
            } else {
                number.to_string()
            }
        }
        _ => trimmed.to_string(),
    }
}

/// Compact key for a normalized value.
pub fn value_key(value: &str) -> u64 {
    let hash = blake3::hash(normalize_value(value).as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}

/// Check whether a column name follows an identifier pattern.
pub fn is_identifier_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    lowered == "id" || lowered.ends_with("_id")
}
