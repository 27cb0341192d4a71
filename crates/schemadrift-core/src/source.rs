//! Row samples and the data-loading boundary.
//!
//! The engine never parses raw files. A [`SampleSource`] hands it a bounded,
//! already-parsed sample per provider.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised by a sample source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The provider is not known to the source.
    #[error("provider not found: {0}")]
    NotFound(String),

    /// The provider's data could not be read or decoded.
    #[error("provider {provider} unreadable: {reason}")]
    Unreadable {
        /// Provider id.
        provider: String,
        /// Underlying failure.
        reason: String,
    },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A bounded, ordered sample of rows with untyped cells.
///
/// Empty cells are `None`. Rows shorter than the header are treated as
/// missing values for the trailing columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSample {
    /// Header names in source order.
    pub columns: Vec<String>,
    /// Rows in source order.
    pub rows: Vec<Vec<Option<String>>>,
}

impl RowSample {
    /// Create an empty sample with the given header.
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Append a row. Blank strings become `None`.
    pub fn with_row<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.push_row(values);
        self
    }

    /// Append a row in place. Blank strings become `None`.
    pub fn push_row<I, S>(&mut self, values: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let row = values
            .into_iter()
            .map(|v| {
                let v = v.as_ref();
                if v.trim().is_empty() {
                    None
                } else {
                    Some(v.to_string())
                }
            })
            .collect();
        self.rows.push(row);
    }

    /// Keep only the first `limit` rows.
    pub fn truncate(&mut self, limit: usize) {
        self.rows.truncate(limit);
    }

    /// Number of rows.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Values of the column at `idx`, one per row (`None` for empty or missing).
    pub fn column_values(&self, idx: usize) -> impl Iterator<Item = Option<&str>> + '_ {
        self.rows
            .iter()
            .map(move |row| row.get(idx).and_then(|v| v.as_deref()))
    }
}

/// The data-loading collaborator consumed by the engine.
pub trait SampleSource: Send + Sync {
    /// Providers the source knows about, in a stable order.
    fn provider_ids(&self) -> Vec<String>;

    /// Return at most `limit` rows for the provider.
    fn sample(&self, provider_id: &str, limit: usize) -> Result<RowSample, SourceError>;

    /// Raw snapshot of the provider's data, if the source supports it and the
    /// payload does not exceed `max_bytes`.
    fn snapshot(&self, _provider_id: &str, _max_bytes: u64) -> Result<Option<Vec<u8>>, SourceError> {
        Ok(None)
    }
}

/// In-memory sample source.
///
/// Samples can be replaced at any time, which makes it convenient for
/// embedding and for exercising drift in tests.
#[derive(Debug, Default)]
pub struct MemorySource {
    samples: RwLock<BTreeMap<String, RowSample>>,
}

impl MemorySource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the sample for a provider.
    pub fn set(&self, provider_id: impl Into<String>, sample: RowSample) {
        self.samples.write().insert(provider_id.into(), sample);
    }

    /// Remove a provider.
    pub fn remove(&self, provider_id: &str) {
        self.samples.write().remove(provider_id);
    }
}

impl SampleSource for MemorySource {
    fn provider_ids(&self) -> Vec<String> {
        self.samples.read().keys().cloned().collect()
    }

    fn sample(&self, provider_id: &str, limit: usize) -> Result<RowSample, SourceError> {
        let mut sample = self
            .samples
            .read()
            .get(provider_id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(provider_id.to_string()))?;
        sample.truncate(limit);
        Ok(sample)
    }
}
