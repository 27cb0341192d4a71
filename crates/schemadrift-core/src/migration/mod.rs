//! Drift detection and migration.
//!
//! This module turns a detected schema change into a persisted, auditable
//! migration of the schema cache:
//! - Differ: name matching plus overlap-based rename detection
//! - Classifier: fixed Safe / Breaking table
//! - Planner: phase ordering and content-derived plan ids
//! - Executor: backup, apply, validate, commit or roll back
//! - Audit log: one immutable record per execution attempt
//!
//! # Classification
//!
//! | Class | Steps | Behavior |
//! |-------|-------|----------|
//! | **Safe** | AddColumn, IncreasePrecision, AddIndex, AlterNullability, ReorderColumn | Auto-executed by reconciliation |
//! | **Breaking** | RemoveColumn, RenameColumn, ChangeType, ReduceSize, DropIndex | Left pending for an explicit execute |

pub mod audit;
pub mod backup;
pub mod classifier;
pub mod diff;
pub mod error;
pub mod executor;
pub mod plan;

pub use audit::{AuditLog, AuditOutcome, AuditRecord};
pub use backup::{Backup, BackupStore, SledBackupStore};
pub use classifier::ChangeClassifier;
pub use diff::{RenameMatch, SchemaDiffer, RENAME_OVERLAP_THRESHOLD};
pub use error::{Classification, MigrationError};
pub use executor::{CancelToken, ExecutionPhase, MigrationExecutor};
pub use plan::{MigrationPlan, MigrationPlanner, MigrationStep, PlanStatus, PlanStore, StepType};
