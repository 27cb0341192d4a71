//! Migration-specific error types.

use rkyv::{Archive, Deserialize, Serialize};
use thiserror::Error;

/// Safety classification of a migration step.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Archive,
    Serialize,
    Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Can be applied without risk of data loss or downstream breakage.
    Safe,
    /// May lose data or break consumers; requires an explicit execute call.
    Breaking,
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Classification::Safe => write!(f, "safe"),
            Classification::Breaking => write!(f, "breaking"),
        }
    }
}

/// Migration-specific errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The provider's source is empty or unreadable.
    #[error("schema detection failed for {provider}: {reason}")]
    SchemaDetection {
        /// Provider id.
        provider: String,
        /// Why detection failed.
        reason: String,
    },

    /// A migration is already in flight for the provider, or the plan is not
    /// in an executable state.
    #[error("plan conflict for {provider}: {reason}")]
    PlanConflict {
        /// Provider id.
        provider: String,
        /// Description of the conflict.
        reason: String,
    },

    /// The post-apply descriptor diverges from the plan's target.
    #[error("validation mismatch for plan {plan_id}: expected {expected}, found {found}")]
    ValidationMismatch {
        /// Plan being validated.
        plan_id: String,
        /// Target fingerprint.
        expected: String,
        /// Observed fingerprint.
        found: String,
    },

    /// The backup could not be written; nothing was applied.
    #[error("backup failed for plan {plan_id}: {reason}")]
    BackupFailure {
        /// Plan being executed.
        plan_id: String,
        /// Underlying failure.
        reason: String,
    },

    /// Plan not found.
    #[error("migration plan not found: {0}")]
    PlanNotFound(String),

    /// The provider has no plan awaiting execution.
    #[error("no pending migration plan for provider {0}")]
    NoPendingPlan(String),

    /// The cache moved since the plan was computed.
    #[error("plan {plan_id} is stale: cache fingerprint is {cached}, plan expects {expected}")]
    StalePlan {
        /// Plan id.
        plan_id: String,
        /// Fingerprint the plan was computed against.
        expected: String,
        /// Fingerprint currently cached.
        cached: String,
    },

    /// A step could not be materialized.
    #[error("step {step_index} failed: {message}")]
    StepFailed {
        /// Index of the failed step.
        step_index: usize,
        /// Error message.
        message: String,
    },

    /// Execution was interrupted by shutdown.
    #[error("migration cancelled by shutdown")]
    Cancelled,

    /// Restoring the backup failed. The cache may need manual repair.
    #[error("rollback failed: {reason}")]
    RollbackFailed {
        /// The reason rollback failed.
        reason: String,
    },

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] crate::error::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl From<sled::Error> for MigrationError {
    fn from(e: sled::Error) -> Self {
        MigrationError::Storage(crate::error::Error::Storage(e))
    }
}

impl MigrationError {
    /// Whether the error is local to one provider's detection pass.
    pub fn is_detection(&self) -> bool {
        matches!(self, MigrationError::SchemaDetection { .. })
    }

    /// Whether the error is a rejected concurrent request.
    pub fn is_conflict(&self) -> bool {
        matches!(self, MigrationError::PlanConflict { .. })
    }
}
