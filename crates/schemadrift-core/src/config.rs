//! Engine configuration.

use crate::fingerprint::DEFAULT_SAMPLE_CAP;
use crate::migration::diff::RENAME_OVERLAP_THRESHOLD;
use std::time::Duration;

/// Default interval between scheduler passes.
pub const DEFAULT_SCHEDULER_INTERVAL: Duration = Duration::from_secs(300);

/// Default upper bound for compressed source snapshots taken during backup.
pub const DEFAULT_SNAPSHOT_LIMIT: u64 = 64 * 1024 * 1024;

/// Configuration for a [`SchemaEngine`](crate::SchemaEngine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Rows sampled per provider.
    pub sample_cap: usize,
    /// Minimum value overlap for a rename.
    pub rename_threshold: f64,
    /// Interval between scheduler passes.
    pub scheduler_interval: Duration,
    /// Maximum raw source size captured in a backup snapshot.
    pub snapshot_limit: u64,
    /// Whether backups include a snapshot of the source data.
    pub source_snapshots: bool,
    /// Whether reconciliation executes fully safe plans automatically.
    pub auto_execute: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_cap: DEFAULT_SAMPLE_CAP,
            rename_threshold: RENAME_OVERLAP_THRESHOLD,
            scheduler_interval: DEFAULT_SCHEDULER_INTERVAL,
            snapshot_limit: DEFAULT_SNAPSHOT_LIMIT,
            source_snapshots: true,
            auto_execute: true,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of rows sampled per provider.
    pub fn with_sample_cap(mut self, sample_cap: usize) -> Self {
        self.sample_cap = sample_cap.max(1);
        self
    }

    /// Set the rename overlap threshold, clamped to `(0, 1]`.
    pub fn with_rename_threshold(mut self, threshold: f64) -> Self {
        self.rename_threshold = threshold.clamp(f64::MIN_POSITIVE, 1.0);
        self
    }

    /// Set the scheduler interval.
    pub fn with_scheduler_interval(mut self, interval: Duration) -> Self {
        self.scheduler_interval = interval;
        self
    }

    /// Set the snapshot size limit in bytes.
    pub fn with_snapshot_limit(mut self, limit: u64) -> Self {
        self.snapshot_limit = limit;
        self
    }

    /// Do not capture source snapshots in backups.
    pub fn without_source_snapshots(mut self) -> Self {
        self.source_snapshots = false;
        self
    }

    /// Leave every plan pending, including fully safe ones.
    pub fn without_auto_execute(mut self) -> Self {
        self.auto_execute = false;
        self
    }
}
