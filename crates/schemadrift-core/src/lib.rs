//! schemadrift core - schema fingerprinting, drift detection and migration.
//!
//! The engine fingerprints the structure of tabular data providers, compares
//! it against the last committed structure, classifies the differences and
//! migrates its cached view transactionally with backup and rollback.
//!
//! ```ignore
//! use schemadrift_core::{EngineConfig, MemorySource, PlanOutcome, SchemaEngine};
//!
//! let source = Arc::new(MemorySource::new());
//! let engine = SchemaEngine::open("./data", source, EngineConfig::default())?;
//!
//! if let PlanOutcome::Planned(plan) = engine.create_plan("finops")? {
//!     println!("{} steps, breaking: {}", plan.steps.len(), plan.is_breaking());
//! }
//! ```

pub mod cache;
pub mod config;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod migration;
pub mod report;
pub mod scheduler;
pub mod source;

pub use cache::{CacheEntry, ColumnAlias, ColumnDefault, SchemaCache, SledSchemaCache};
pub use config::EngineConfig;
pub use descriptor::{ColumnDescriptor, ColumnType, SchemaDescriptor};
pub use engine::{PlanOutcome, ReconcileOutcome, SchemaEngine};
pub use error::Error;
pub use fingerprint::SchemaFingerprinter;
pub use migration::{
    AuditLog, AuditOutcome, AuditRecord, Backup, BackupStore, CancelToken, ChangeClassifier,
    Classification,
    MigrationError, MigrationExecutor, MigrationPlan, MigrationPlanner, MigrationStep, PlanStatus,
    PlanStore, SchemaDiffer, SledBackupStore, StepType,
};
pub use report::{
    Anomaly, AnomalyKind, ProviderReport, ProviderStatus, ReportSummary, SchemaReport, Severity,
    ValidationReport,
};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use source::{MemorySource, RowSample, SampleSource, SourceError};

/// Current time in microseconds since the Unix epoch.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// Copy persisted bytes into an aligned buffer for rkyv access.
pub(crate) fn aligned(bytes: &[u8]) -> rkyv::util::AlignedVec {
    let mut buf = rkyv::util::AlignedVec::with_capacity(bytes.len());
    buf.extend_from_slice(bytes);
    buf
}
