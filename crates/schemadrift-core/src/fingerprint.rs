//! Schema fingerprinting.
//!
//! Infers a [`SchemaDescriptor`] from a bounded row sample. Inference is a
//! pure function of the sample: it never looks at cached state.
//!
//! Each column's type is the first of `Integer → Float → Boolean → DateTime →
//! String` under which at least [`TYPE_ACCEPTANCE_RATIO`] of the non-empty
//! sampled values parse.

use crate::descriptor::{ColumnDescriptor, ColumnType, SchemaDescriptor};
use crate::migration::MigrationError;
use crate::source::{RowSample, SampleSource};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::collections::HashSet;
use tracing::debug;

/// Share of non-empty values that must parse for a type to be accepted.
pub const TYPE_ACCEPTANCE_RATIO: f64 = 0.95;

/// Default number of rows sampled per provider.
pub const DEFAULT_SAMPLE_CAP: usize = 1000;

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%d.%m.%Y"];

/// Infers descriptors from row samples.
#[derive(Debug, Clone)]
pub struct SchemaFingerprinter {
    sample_cap: usize,
}

impl Default for SchemaFingerprinter {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_CAP)
    }
}

impl SchemaFingerprinter {
    /// Create a fingerprinter that considers at most `sample_cap` rows.
    pub fn new(sample_cap: usize) -> Self {
        Self {
            sample_cap: sample_cap.max(1),
        }
    }

    /// Maximum rows considered per sample.
    pub fn sample_cap(&self) -> usize {
        self.sample_cap
    }

    /// Sample a provider from `source` and fingerprint it.
    pub fn fingerprint_source(
        &self,
        source: &dyn SampleSource,
        provider_id: &str,
    ) -> Result<SchemaDescriptor, MigrationError> {
        let sample = source
            .sample(provider_id, self.sample_cap)
            .map_err(|e| MigrationError::SchemaDetection {
                provider: provider_id.to_string(),
                reason: e.to_string(),
            })?;
        self.fingerprint(provider_id, &sample)
    }

    /// Infer a descriptor from a sample.
    pub fn fingerprint(
        &self,
        provider_id: &str,
        sample: &RowSample,
    ) -> Result<SchemaDescriptor, MigrationError> {
        let detection_error = |reason: &str| MigrationError::SchemaDetection {
            provider: provider_id.to_string(),
            reason: reason.to_string(),
        };

        if sample.columns.is_empty() {
            return Err(detection_error("sample has no columns"));
        }
        if sample.rows.is_empty() {
            return Err(detection_error("sample has no rows"));
        }

        let mut seen = HashSet::new();
        for name in &sample.columns {
            if name.trim().is_empty() {
                return Err(detection_error("sample has a blank column name"));
            }
            if !seen.insert(name.as_str()) {
                return Err(detection_error(&format!("duplicate column name '{}'", name)));
            }
        }

        let rows = sample.rows.len().min(self.sample_cap);
        let columns = sample
            .columns
            .iter()
            .enumerate()
            .map(|(idx, name)| Self::describe_column(sample, idx, name, rows))
            .collect();

        let descriptor = SchemaDescriptor::new(provider_id, columns).with_row_count(rows as u64);
        debug!(
            provider = provider_id,
            columns = descriptor.columns.len(),
            rows,
            fingerprint = %descriptor.fingerprint,
            "fingerprinted provider sample"
        );
        Ok(descriptor)
    }

    fn describe_column(sample: &RowSample, idx: usize, name: &str, rows: usize) -> ColumnDescriptor {
        let mut nullable = false;
        let mut values = Vec::with_capacity(rows);
        for value in sample.column_values(idx).take(rows) {
            match value.map(str::trim) {
                Some(v) if !v.is_empty() => values.push(v),
                _ => nullable = true,
            }
        }

        let inferred_type = infer_type(&values);
        let distinct: HashSet<&str> = values.iter().copied().collect();
        let unique = !values.is_empty() && distinct.len() == values.len();

        let mut column = ColumnDescriptor::new(name, inferred_type, idx as u32)
            .with_samples(values.iter().copied());
        column.nullable = nullable;
        column.unique = unique;
        column.is_identifier =
            unique && !nullable && (idx == 0 || column.has_identifier_name());
        column.is_timestamp = inferred_type == ColumnType::DateTime;
        column
    }
}

/// Infer the type of a column from its non-empty values.
pub fn infer_type(values: &[&str]) -> ColumnType {
    if values.is_empty() {
        return ColumnType::Unknown;
    }
    let total = values.len() as f64;
    ColumnType::INFERENCE_ORDER
        .into_iter()
        .find(|ty| {
            let parsed = values.iter().filter(|v| parses_as(ty, v)).count();
            parsed as f64 / total >= TYPE_ACCEPTANCE_RATIO
        })
        .unwrap_or(ColumnType::String)
}

/// Check whether `value` parses under `ty`.
pub fn parses_as(ty: &ColumnType, value: &str) -> bool {
    let value = value.trim();
    match ty {
        ColumnType::Integer => value.parse::<i64>().is_ok(),
        ColumnType::Float => value.parse::<f64>().map(f64::is_finite).unwrap_or(false),
        ColumnType::Boolean => matches!(
            value.to_ascii_lowercase().as_str(),
            "true" | "false" | "yes" | "no" | "y" | "n" | "t" | "f"
        ),
        ColumnType::DateTime => parse_datetime(value),
        ColumnType::String => true,
        ColumnType::Unknown => false,
    }
}

fn parse_datetime(value: &str) -> bool {
    if DateTime::parse_from_rfc3339(value).is_ok() {
        return true;
    }
    if DATETIME_FORMATS
        .iter()
        .any(|fmt| NaiveDateTime::parse_from_str(value, fmt).is_ok())
    {
        return true;
    }
    DATE_FORMATS
        .iter()
        .any(|fmt| NaiveDate::parse_from_str(value, fmt).is_ok())
}
