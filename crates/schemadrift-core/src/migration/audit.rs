//! Append-only audit log of migration executions.
//!
//! Records are keyed by `provider \0 sequence` so a provider's history is a
//! prefix scan in execution order. There is no update or delete path.

use super::error::MigrationError;
use rkyv::{Archive, Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Outcome of one execution attempt.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Plan applied and validated.
    Committed,
    /// Applied changes were undone.
    RolledBack,
    /// Nothing was applied.
    Failed,
}

impl std::fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditOutcome::Committed => write!(f, "committed"),
            AuditOutcome::RolledBack => write!(f, "rolled_back"),
            AuditOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// Immutable record of one execution attempt.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct AuditRecord {
    /// Position in the log.
    pub sequence: u64,
    /// Plan that was executed.
    pub plan_id: String,
    /// Provider the plan belongs to.
    pub provider_id: String,
    /// Execution start (microseconds since Unix epoch).
    pub started_at: u64,
    /// Execution end.
    pub executed_at: u64,
    /// Outcome.
    pub outcome: AuditOutcome,
    /// Backup taken for the run, if persisted.
    pub backup_ref: Option<String>,
    /// Failure detail.
    pub error_detail: Option<String>,
    /// Steps materialized before the run ended.
    pub steps_applied: u32,
}

impl AuditRecord {
    /// Create a record ending now. The sequence is assigned on append.
    pub fn new(plan_id: &str, provider_id: &str, started_at: u64, outcome: AuditOutcome) -> Self {
        Self {
            sequence: 0,
            plan_id: plan_id.to_string(),
            provider_id: provider_id.to_string(),
            started_at,
            executed_at: crate::current_timestamp(),
            outcome,
            backup_ref: None,
            error_detail: None,
            steps_applied: 0,
        }
    }

    /// Attach the backup reference.
    pub fn with_backup(mut self, backup_ref: Option<String>) -> Self {
        self.backup_ref = backup_ref;
        self
    }

    /// Attach failure detail.
    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error_detail = Some(error.to_string());
        self
    }

    /// Set the number of applied steps.
    pub fn with_steps_applied(mut self, steps: usize) -> Self {
        self.steps_applied = steps as u32;
        self
    }

    fn to_bytes(&self) -> Result<Vec<u8>, MigrationError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| MigrationError::Serialization(e.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, MigrationError> {
        let aligned = crate::aligned(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| MigrationError::Deserialization(e.to_string()))
    }
}

/// Sled-backed append-only audit log.
pub struct AuditLog {
    tree: sled::Tree,
    next_sequence: AtomicU64,
}

impl AuditLog {
    /// Tree name for audit records.
    pub const TREE_NAME: &'static str = "migration:audit";

    /// Open or create the audit log.
    pub fn open(db: &sled::Db) -> Result<Self, MigrationError> {
        let tree = db.open_tree(Self::TREE_NAME)?;
        let mut last = 0u64;
        for value in tree.iter().values() {
            let record = AuditRecord::from_bytes(&value?)?;
            last = last.max(record.sequence);
        }
        Ok(Self {
            tree,
            next_sequence: AtomicU64::new(last + 1),
        })
    }

    fn key(provider_id: &str, sequence: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(provider_id.len() + 9);
        key.extend_from_slice(provider_id.as_bytes());
        key.push(0);
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    /// Append a record, assigning its sequence. Returns the stored record.
    pub fn append(&self, mut record: AuditRecord) -> Result<AuditRecord, MigrationError> {
        record.sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let key = Self::key(&record.provider_id, record.sequence);
        self.tree.insert(key, record.to_bytes()?)?;
        self.tree.flush()?;
        debug!(
            provider = %record.provider_id,
            plan_id = %record.plan_id,
            sequence = record.sequence,
            outcome = %record.outcome,
            "appended audit record"
        );
        Ok(record)
    }

    /// Records for a provider in chronological order.
    pub fn history(&self, provider_id: &str) -> Result<Vec<AuditRecord>, MigrationError> {
        let mut prefix = provider_id.as_bytes().to_vec();
        prefix.push(0);
        let mut records = Vec::new();
        for value in self.tree.scan_prefix(prefix).values() {
            records.push(AuditRecord::from_bytes(&value?)?);
        }
        Ok(records)
    }

    /// Every record, ordered by sequence.
    pub fn all(&self) -> Result<Vec<AuditRecord>, MigrationError> {
        let mut records = Vec::new();
        for value in self.tree.iter().values() {
            records.push(AuditRecord::from_bytes(&value?)?);
        }
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }
}
