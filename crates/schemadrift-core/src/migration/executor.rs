//! Migration executor - applies a plan to the schema cache.
//!
//! An execution walks `Pending → BackingUp → Applying → Validating →
//! Committed`. Steps are applied to an in-memory working entry; the cache is
//! written once, after validation. A failure while applying or validating
//! moves to `RollingBack`, which restores the pre-migration cache bytes
//! verbatim. Every attempt that passes the precondition checks ends with
//! exactly one audit record. Callers hold the provider's lock for the whole
//! run.

use super::audit::{AuditLog, AuditOutcome, AuditRecord};
use super::backup::{compress, Backup, BackupStore};
use super::error::MigrationError;
use super::plan::{MigrationPlan, MigrationStep, PlanStatus, PlanStore, StepType};
use crate::cache::{CacheEntry, SchemaCache};
use crate::current_timestamp;
use crate::descriptor::{ColumnDescriptor, ColumnType, SchemaDescriptor};
use crate::fingerprint::SchemaFingerprinter;
use crate::source::SampleSource;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Phase of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPhase {
    Pending,
    BackingUp,
    Applying,
    Validating,
    Committed,
    RollingBack,
    RolledBack,
    Failed,
}

impl std::fmt::Display for ExecutionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionPhase::Pending => write!(f, "pending"),
            ExecutionPhase::BackingUp => write!(f, "backing_up"),
            ExecutionPhase::Applying => write!(f, "applying"),
            ExecutionPhase::Validating => write!(f, "validating"),
            ExecutionPhase::Committed => write!(f, "committed"),
            ExecutionPhase::RollingBack => write!(f, "rolling_back"),
            ExecutionPhase::RolledBack => write!(f, "rolled_back"),
            ExecutionPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Cooperative cancellation for the executions started by one caller.
///
/// Cancelling a token only affects runs that were handed that token.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask runs holding this token to stop between steps.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Pre-migration state held for the duration of a run.
struct Checkpoint {
    cache_bytes: Option<Vec<u8>>,
    backup_ref: Option<String>,
}

/// Applies migration plans.
pub struct MigrationExecutor {
    cache: Arc<dyn SchemaCache>,
    plans: Arc<PlanStore>,
    backups: Arc<dyn BackupStore>,
    audit: Arc<AuditLog>,
    source: Arc<dyn SampleSource>,
    fingerprinter: SchemaFingerprinter,
    snapshot_limit: Option<u64>,
}

impl MigrationExecutor {
    /// Create an executor.
    ///
    /// `snapshot_limit` bounds the raw source snapshot stored in backups;
    /// `None` disables snapshots.
    pub fn new(
        cache: Arc<dyn SchemaCache>,
        plans: Arc<PlanStore>,
        backups: Arc<dyn BackupStore>,
        audit: Arc<AuditLog>,
        source: Arc<dyn SampleSource>,
        fingerprinter: SchemaFingerprinter,
        snapshot_limit: Option<u64>,
    ) -> Self {
        Self {
            cache,
            plans,
            backups,
            audit,
            source,
            fingerprinter,
            snapshot_limit,
        }
    }

    /// Execute a plan by id.
    ///
    /// Returns the committed audit record. Failures after the precondition
    /// checks are audited before the error is returned.
    pub fn execute(&self, plan_id: &str, backup: bool) -> Result<AuditRecord, MigrationError> {
        self.execute_with(plan_id, backup, &CancelToken::new())
    }

    /// Execute a plan, stopping between steps once `cancel` is triggered.
    pub fn execute_with(
        &self,
        plan_id: &str,
        backup: bool,
        cancel: &CancelToken,
    ) -> Result<AuditRecord, MigrationError> {
        let mut plan = self
            .plans
            .load(plan_id)?
            .ok_or_else(|| MigrationError::PlanNotFound(plan_id.to_string()))?;

        if !plan.status.is_executable() {
            return Err(MigrationError::PlanConflict {
                provider: plan.provider_id.clone(),
                reason: format!("plan {} is {}", plan.id, plan.status),
            });
        }

        let started_at = current_timestamp();
        let provider = plan.provider_id.clone();
        let cache_bytes = self.cache.load_raw(&provider)?;
        let current = cache_bytes
            .as_deref()
            .map(CacheEntry::from_bytes)
            .transpose()?;

        let cached = current
            .as_ref()
            .map(|e| e.fingerprint().to_string())
            .unwrap_or_default();
        if cached != plan.base_fingerprint {
            let err = MigrationError::StalePlan {
                plan_id: plan.id.clone(),
                expected: plan.base_fingerprint.clone(),
                cached,
            };
            warn!(provider = %provider, plan_id = %plan.id, "plan is stale");
            plan.fail(err.to_string());
            self.finish(
                &plan,
                AuditRecord::new(&plan.id, &provider, started_at, AuditOutcome::Failed)
                    .with_error(&err),
            )?;
            return Err(err);
        }

        plan.transition(PlanStatus::Executing);
        self.plans.save(&plan)?;
        self.enter(&plan, ExecutionPhase::BackingUp);

        let checkpoint = match self.back_up(&plan, cache_bytes, backup) {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                error!(provider = %provider, plan_id = %plan.id, error = %err, "backup failed");
                self.enter(&plan, ExecutionPhase::Failed);
                plan.fail(err.to_string());
                self.finish(
                    &plan,
                    AuditRecord::new(&plan.id, &provider, started_at, AuditOutcome::Failed)
                        .with_error(&err),
                )?;
                return Err(err);
            }
        };

        let mut applied = 0usize;
        let result = self.apply_and_validate(&plan, current, cancel, &mut applied);

        match result {
            Ok(()) => {
                self.enter(&plan, ExecutionPhase::Committed);
                plan.transition(PlanStatus::Executed);
                plan.error = None;
                let record = self.finish(
                    &plan,
                    AuditRecord::new(&plan.id, &provider, started_at, AuditOutcome::Committed)
                        .with_backup(checkpoint.backup_ref)
                        .with_steps_applied(applied),
                )?;
                info!(
                    provider = %provider,
                    plan_id = %plan.id,
                    steps = applied,
                    "migration committed"
                );
                Ok(record)
            }
            Err(err) => {
                warn!(provider = %provider, plan_id = %plan.id, error = %err, "migration failed, rolling back");
                self.enter(&plan, ExecutionPhase::RollingBack);

                if let Err(restore_err) = self.restore(&provider, checkpoint.cache_bytes.as_deref()) {
                    let err = MigrationError::RollbackFailed {
                        reason: format!("{} (after: {})", restore_err, err),
                    };
                    error!(provider = %provider, plan_id = %plan.id, error = %err, "rollback failed");
                    self.enter(&plan, ExecutionPhase::Failed);
                    plan.fail(err.to_string());
                    self.finish(
                        &plan,
                        AuditRecord::new(&plan.id, &provider, started_at, AuditOutcome::Failed)
                            .with_backup(checkpoint.backup_ref)
                            .with_error(&err)
                            .with_steps_applied(applied),
                    )?;
                    return Err(err);
                }

                self.enter(&plan, ExecutionPhase::RolledBack);
                if matches!(err, MigrationError::Cancelled) {
                    plan.transition(PlanStatus::RolledBack);
                    plan.error = Some(err.to_string());
                } else {
                    plan.fail(err.to_string());
                }
                self.finish(
                    &plan,
                    AuditRecord::new(&plan.id, &provider, started_at, AuditOutcome::RolledBack)
                        .with_backup(checkpoint.backup_ref)
                        .with_error(&err)
                        .with_steps_applied(applied),
                )?;
                Err(err)
            }
        }
    }

    /// Resolve plans left in `Executing` by an interrupted process.
    ///
    /// A plan with a persisted backup is rolled back from it. Without a
    /// backup the cache holds either the pre-migration entry or the fully
    /// validated one, since it is written once at commit: the plan is marked
    /// `Executed` if the cache already carries it, `Failed` otherwise.
    pub fn recover(&self) -> Result<Vec<AuditRecord>, MigrationError> {
        let mut records = Vec::new();
        for mut plan in self.plans.executing()? {
            let provider = plan.provider_id.clone();
            let backup = self
                .backups
                .list_for_provider(&provider)?
                .into_iter()
                .filter(|b| b.plan_id == plan.id)
                .last();

            let record = match backup {
                Some(backup) => {
                    self.restore(&provider, backup.cache_bytes.as_deref())?;
                    plan.transition(PlanStatus::RolledBack);
                    plan.error = Some("interrupted; restored from backup".to_string());
                    warn!(provider = %provider, plan_id = %plan.id, backup_ref = %backup.backup_ref, "recovered interrupted migration");
                    AuditRecord::new(&plan.id, &provider, plan.updated_at, AuditOutcome::RolledBack)
                        .with_backup(Some(backup.backup_ref))
                        .with_error("interrupted; restored from backup")
                }
                None if self.carries(&provider, &plan)? => {
                    plan.transition(PlanStatus::Executed);
                    plan.error = None;
                    warn!(provider = %provider, plan_id = %plan.id, "interrupted migration had already committed");
                    AuditRecord::new(&plan.id, &provider, plan.updated_at, AuditOutcome::Committed)
                        .with_steps_applied(plan.steps.len())
                }
                None => {
                    plan.fail("interrupted without a persisted backup");
                    warn!(provider = %provider, plan_id = %plan.id, "interrupted migration had no backup");
                    AuditRecord::new(&plan.id, &provider, plan.updated_at, AuditOutcome::Failed)
                        .with_error("interrupted without a persisted backup")
                }
            };
            records.push(self.finish(&plan, record)?);
        }
        Ok(records)
    }

    /// Whether the cached entry is the one committed by `plan`.
    fn carries(&self, provider: &str, plan: &MigrationPlan) -> Result<bool, MigrationError> {
        Ok(self.cache.load(provider)?.is_some_and(|entry| {
            entry.last_plan_id.as_deref() == Some(plan.id.as_str())
                && entry.fingerprint() == plan.target.fingerprint
        }))
    }

    /// Persist a plan's terminal status and its audit record.
    ///
    /// The record is appended even when saving the plan fails; the save
    /// error is returned afterwards.
    fn finish(&self, plan: &MigrationPlan, record: AuditRecord) -> Result<AuditRecord, MigrationError> {
        let saved = self.plans.save(plan);
        let record = self.audit.append(record)?;
        if let Err(e) = saved {
            error!(provider = %plan.provider_id, plan_id = %plan.id, error = %e, "failed to persist plan status");
            return Err(e);
        }
        Ok(record)
    }

    fn enter(&self, plan: &MigrationPlan, phase: ExecutionPhase) {
        debug!(provider = %plan.provider_id, plan_id = %plan.id, %phase, "execution phase");
    }

    fn back_up(
        &self,
        plan: &MigrationPlan,
        cache_bytes: Option<Vec<u8>>,
        backup: bool,
    ) -> Result<Checkpoint, MigrationError> {
        if !backup {
            return Ok(Checkpoint {
                cache_bytes,
                backup_ref: None,
            });
        }

        let backup_failure = |reason: String| MigrationError::BackupFailure {
            plan_id: plan.id.clone(),
            reason,
        };

        let snapshot = match self.snapshot_limit {
            Some(limit) => self
                .source
                .snapshot(&plan.provider_id, limit)
                .map_err(|e| backup_failure(e.to_string()))?
                .map(|raw| compress(&raw))
                .transpose()
                .map_err(|e| backup_failure(e.to_string()))?,
            None => None,
        };

        let record = Backup::new(&plan.provider_id, &plan.id, cache_bytes, snapshot);
        self.backups
            .save(&record)
            .map_err(|e| backup_failure(e.to_string()))?;
        debug!(provider = %plan.provider_id, plan_id = %plan.id, backup_ref = %record.backup_ref, "backup written");

        Ok(Checkpoint {
            cache_bytes: record.cache_bytes,
            backup_ref: Some(record.backup_ref),
        })
    }

    fn apply_and_validate(
        &self,
        plan: &MigrationPlan,
        current: Option<CacheEntry>,
        cancel: &CancelToken,
        applied: &mut usize,
    ) -> Result<(), MigrationError> {
        self.enter(plan, ExecutionPhase::Applying);
        let existed = current.is_some();
        let mut working = current.unwrap_or_else(|| {
            CacheEntry::new(SchemaDescriptor::new(plan.provider_id.as_str(), Vec::new()))
        });

        for (idx, step) in plan.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(MigrationError::Cancelled);
            }
            apply_step(&mut working, step, existed).map_err(|message| {
                MigrationError::StepFailed {
                    step_index: idx,
                    message,
                }
            })?;
            *applied += 1;
        }

        finalize(&mut working, &plan.target, &plan.id);

        if cancel.is_cancelled() {
            return Err(MigrationError::Cancelled);
        }

        self.enter(plan, ExecutionPhase::Validating);
        let expected = &plan.target.fingerprint;
        if working.fingerprint() != expected {
            return Err(MigrationError::ValidationMismatch {
                plan_id: plan.id.clone(),
                expected: expected.clone(),
                found: working.fingerprint().to_string(),
            });
        }
        let live = self
            .fingerprinter
            .fingerprint_source(self.source.as_ref(), &plan.provider_id)?;
        if &live.fingerprint != expected {
            return Err(MigrationError::ValidationMismatch {
                plan_id: plan.id.clone(),
                expected: expected.clone(),
                found: live.fingerprint,
            });
        }

        self.cache.store(&working)?;
        self.cache.flush()?;
        Ok(())
    }

    fn restore(&self, provider: &str, bytes: Option<&[u8]>) -> Result<(), MigrationError> {
        match bytes {
            Some(bytes) => self.cache.store_raw(provider, bytes)?,
            None => self.cache.remove(provider)?,
        }
        self.cache.flush()?;
        Ok(())
    }
}

/// Materialize one step against a working entry.
fn apply_step(entry: &mut CacheEntry, step: &MigrationStep, existed: bool) -> Result<(), String> {
    let columns = &mut entry.descriptor.columns;
    let target = || {
        step.column
            .clone()
            .ok_or_else(|| format!("{} step for '{}' has no target column", step.step_type, step.column_name))
    };

    match step.step_type {
        StepType::AddColumn => {
            if columns.iter().any(|c| c.name == step.column_name) {
                return Err(format!("column '{}' already exists", step.column_name));
            }
            let column = target()?;
            let at = (step.position as usize).min(columns.len());
            columns.insert(at, column);
            if existed {
                entry.set_default(&step.column_name, "");
            }
        }
        StepType::RemoveColumn => {
            let idx = column_index(columns, &step.column_name)?;
            columns.remove(idx);
            entry.drop_mappings(&step.column_name);
        }
        StepType::RenameColumn => {
            let idx = column_index(columns, &step.column_name)?;
            let column = target()?;
            let new_name = column.name.clone();
            if columns.iter().any(|c| c.name == new_name) {
                return Err(format!("column '{}' already exists", new_name));
            }
            columns[idx] = column;
            entry.add_alias(&step.column_name, &new_name);
            for default in entry.defaults.iter_mut().filter(|d| d.column == step.column_name) {
                default.column = new_name.clone();
            }
        }
        StepType::ChangeType | StepType::IncreasePrecision | StepType::ReduceSize => {
            let idx = column_index(columns, &step.column_name)?;
            let ty = step
                .new_value
                .as_deref()
                .and_then(ColumnType::from_name)
                .ok_or_else(|| format!("invalid target type for '{}'", step.column_name))?;
            columns[idx].inferred_type = ty;
            columns[idx].is_timestamp = ty == ColumnType::DateTime;
        }
        StepType::AddIndex | StepType::DropIndex => {
            let idx = column_index(columns, &step.column_name)?;
            columns[idx].unique = step.step_type == StepType::AddIndex;
        }
        StepType::AlterNullability => {
            let idx = column_index(columns, &step.column_name)?;
            columns[idx].nullable = step.new_value.as_deref() == Some("nullable");
        }
        StepType::ReorderColumn => {
            let idx = column_index(columns, &step.column_name)?;
            let ordinal = step
                .new_value
                .as_deref()
                .and_then(|v| v.parse::<u32>().ok())
                .ok_or_else(|| format!("invalid position for '{}'", step.column_name))?;
            columns[idx].ordinal_position = ordinal;
        }
    }
    Ok(())
}

fn column_index(columns: &[ColumnDescriptor], name: &str) -> Result<usize, String> {
    columns
        .iter()
        .position(|c| c.name == name)
        .ok_or_else(|| format!("column '{}' not found", name))
}

/// Resequence into the target order and carry over non-structural metadata.
fn finalize(entry: &mut CacheEntry, target: &SchemaDescriptor, plan_id: &str) {
    let order = target.column_names();
    entry.descriptor.resequence(&order);
    for column in entry.descriptor.columns.iter_mut() {
        if let Some(t) = target.column(&column.name) {
            column.sample_values = t.sample_values.clone();
            column.value_set = t.value_set.clone();
            column.is_identifier = t.is_identifier;
            column.is_timestamp = t.is_timestamp;
        }
    }
    entry.descriptor.row_count = target.row_count;
    entry.descriptor.captured_at = target.captured_at;
    entry.descriptor.refresh_fingerprint();
    entry.last_plan_id = Some(plan_id.to_string());
    entry.updated_at = current_timestamp();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SledSchemaCache;
    use crate::migration::backup::SledBackupStore;
    use crate::migration::diff::SchemaDiffer;
    use crate::migration::plan::MigrationPlanner;
    use crate::source::{MemorySource, RowSample};

    /// Sled cache that keeps a copy of every write.
    struct RecordingCache {
        inner: SledSchemaCache,
        writes: parking_lot::Mutex<Vec<Vec<u8>>>,
    }

    impl SchemaCache for RecordingCache {
        fn load_raw(&self, provider_id: &str) -> Result<Option<Vec<u8>>, crate::error::Error> {
            self.inner.load_raw(provider_id)
        }

        fn store_raw(&self, provider_id: &str, bytes: &[u8]) -> Result<(), crate::error::Error> {
            self.writes.lock().push(bytes.to_vec());
            self.inner.store_raw(provider_id, bytes)
        }

        fn remove(&self, provider_id: &str) -> Result<(), crate::error::Error> {
            self.inner.remove(provider_id)
        }

        fn providers(&self) -> Result<Vec<String>, crate::error::Error> {
            self.inner.providers()
        }

        fn flush(&self) -> Result<(), crate::error::Error> {
            self.inner.flush()
        }
    }

    struct Env {
        cache: Arc<RecordingCache>,
        plans: Arc<PlanStore>,
        audit: Arc<AuditLog>,
        source: Arc<MemorySource>,
        executor: MigrationExecutor,
    }

    fn env() -> Env {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let cache = Arc::new(RecordingCache {
            inner: SledSchemaCache::open(&db).unwrap(),
            writes: parking_lot::Mutex::new(Vec::new()),
        });
        let plans = Arc::new(PlanStore::open(&db).unwrap());
        let backups = Arc::new(SledBackupStore::open(&db).unwrap());
        let audit = Arc::new(AuditLog::open(&db).unwrap());
        let source = Arc::new(MemorySource::new());
        let executor = MigrationExecutor::new(
            cache.clone(),
            Arc::clone(&plans),
            backups,
            Arc::clone(&audit),
            source.clone(),
            SchemaFingerprinter::default(),
            Some(1024),
        );
        Env {
            cache,
            plans,
            audit,
            source,
            executor,
        }
    }

    fn v1() -> RowSample {
        RowSample::new(["app_id", "cost"])
            .with_row(["App1", "10"])
            .with_row(["App2", "12"])
    }

    fn v2() -> RowSample {
        RowSample::new(["app_id", "cost", "region"])
            .with_row(["App1", "10.5", "eu"])
            .with_row(["App2", "12", "us"])
    }

    fn plan_for(env: &Env) -> MigrationPlan {
        let fp = SchemaFingerprinter::default();
        let target = fp.fingerprint_source(env.source.as_ref(), "finops").unwrap();
        let cached = env.cache.load("finops").unwrap();
        let previous = cached.as_ref().map(|e| &e.descriptor);
        let steps = SchemaDiffer::default().diff(previous, &target);
        MigrationPlanner::new(Arc::clone(&env.plans))
            .create("finops", previous, target, steps)
            .unwrap()
    }

    fn seed(env: &Env) {
        env.source.set("finops", v1());
        let plan = plan_for(env);
        env.executor.execute(&plan.id, true).unwrap();
    }

    #[test]
    fn test_execute_new_provider() {
        let env = env();
        env.source.set("finops", v1());
        let plan = plan_for(&env);
        let record = env.executor.execute(&plan.id, true).unwrap();

        assert_eq!(record.outcome, AuditOutcome::Committed);
        assert_eq!(record.steps_applied, 2);
        assert!(record.backup_ref.as_deref().unwrap().starts_with("finops_"));

        let entry = env.cache.load("finops").unwrap().unwrap();
        assert_eq!(entry.fingerprint(), plan.target.fingerprint);
        assert_eq!(entry.last_plan_id.as_deref(), Some(plan.id.as_str()));
        assert!(entry.defaults.is_empty());
        assert_eq!(
            env.plans.load(&plan.id).unwrap().unwrap().status,
            PlanStatus::Executed
        );
    }

    #[test]
    fn test_execute_drift_records_defaults() {
        let env = env();
        seed(&env);
        env.source.set("finops", v2());
        let plan = plan_for(&env);
        assert!(!plan.is_breaking());

        env.executor.execute(&plan.id, false).unwrap();
        let entry = env.cache.load("finops").unwrap().unwrap();
        assert_eq!(entry.descriptor.column_names(), vec!["app_id", "cost", "region"]);
        assert_eq!(entry.descriptor.column("cost").unwrap().inferred_type, ColumnType::Float);
        assert_eq!(entry.default_for("region"), Some(""));
        assert_eq!(env.audit.history("finops").unwrap().len(), 2);
    }

    #[test]
    fn test_double_execute_conflicts() {
        let env = env();
        env.source.set("finops", v1());
        let plan = plan_for(&env);
        env.executor.execute(&plan.id, true).unwrap();
        let before = env.cache.load_raw("finops").unwrap();

        let err = env.executor.execute(&plan.id, true).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(env.cache.load_raw("finops").unwrap(), before);
        assert_eq!(env.audit.history("finops").unwrap().len(), 1);
    }

    #[test]
    fn test_validation_failure_restores_bytes() {
        let env = env();
        seed(&env);
        let before = env.cache.load_raw("finops").unwrap().unwrap();

        env.source.set("finops", v2());
        let plan = plan_for(&env);
        // The source drifts again before validation.
        env.source.set(
            "finops",
            RowSample::new(["app_id"]).with_row(["App1"]).with_row(["App2"]),
        );

        let err = env.executor.execute(&plan.id, true).unwrap_err();
        assert!(matches!(err, MigrationError::ValidationMismatch { .. }));
        assert_eq!(env.cache.load_raw("finops").unwrap().unwrap(), before);

        let plan = env.plans.load(&plan.id).unwrap().unwrap();
        assert_eq!(plan.status, PlanStatus::Failed);
        let last = env.audit.history("finops").unwrap().pop().unwrap();
        assert_eq!(last.outcome, AuditOutcome::RolledBack);
        assert!(last.error_detail.unwrap().contains("validation mismatch"));
    }

    #[test]
    fn test_stale_plan_fails_without_touching_cache() {
        let env = env();
        env.source.set("finops", v1());
        let stale = plan_for(&env);
        seed(&env);
        let before = env.cache.load_raw("finops").unwrap();

        // `seed` reused the same plan, so build one against an empty base.
        let mut stale = stale;
        stale.id = "0000stale".to_string();
        stale.status = PlanStatus::Pending;
        env.plans.save(&stale).unwrap();

        let err = env.executor.execute(&stale.id, true).unwrap_err();
        assert!(matches!(err, MigrationError::StalePlan { .. }));
        assert_eq!(env.cache.load_raw("finops").unwrap(), before);
        let last = env.audit.history("finops").unwrap().pop().unwrap();
        assert_eq!(last.outcome, AuditOutcome::Failed);
    }

    #[test]
    fn test_cancelled_execution_rolls_back() {
        let env = env();
        seed(&env);
        let before = env.cache.load_raw("finops").unwrap();
        env.source.set("finops", v2());
        let plan = plan_for(&env);

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = env.executor.execute_with(&plan.id, true, &cancel).unwrap_err();
        assert!(matches!(err, MigrationError::Cancelled));
        assert_eq!(env.cache.load_raw("finops").unwrap(), before);
        assert_eq!(
            env.plans.load(&plan.id).unwrap().unwrap().status,
            PlanStatus::RolledBack
        );

        // Another caller's token is unaffected.
        env.source.set("finops", v2());
        let retry = plan_for(&env);
        env.executor.execute(&retry.id, true).unwrap();
    }

    #[test]
    fn test_cache_never_holds_partial_entry() {
        let env = env();
        seed(&env);
        let before = env.cache.load_raw("finops").unwrap().unwrap();
        env.cache.writes.lock().clear();

        env.source.set("finops", v2());
        let plan = plan_for(&env);
        assert!(plan.steps.len() > 1);
        env.executor.execute(&plan.id, false).unwrap();

        let writes = env.cache.writes.lock().clone();
        assert_eq!(writes.len(), 1);
        let written = CacheEntry::from_bytes(&writes[0]).unwrap();
        assert_eq!(written.fingerprint(), plan.target.fingerprint);

        // A failing run only ever writes the pre-migration bytes back.
        let committed = env.cache.load_raw("finops").unwrap().unwrap();
        env.cache.writes.lock().clear();
        env.source.set("finops", v1());
        let plan = plan_for(&env);
        env.source.set("finops", RowSample::new(["app_id"]).with_row(["App1"]));
        env.executor.execute(&plan.id, false).unwrap_err();
        for bytes in env.cache.writes.lock().iter() {
            assert_eq!(bytes, &committed);
        }
        assert_ne!(committed, before);
    }

    #[test]
    fn test_recover_without_backup_keeps_committed_entry() {
        let env = env();
        seed(&env);
        let before = env.cache.load_raw("finops").unwrap().unwrap();
        env.source.set("finops", v2());
        let mut plan = plan_for(&env);

        // Crash after the plan went Executing, before the single cache write.
        plan.transition(PlanStatus::Executing);
        env.plans.save(&plan).unwrap();

        let records = env.executor.recover().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, AuditOutcome::Failed);
        assert!(records[0].backup_ref.is_none());
        assert_eq!(env.cache.load_raw("finops").unwrap().unwrap(), before);
        assert_eq!(
            env.plans.load(&plan.id).unwrap().unwrap().status,
            PlanStatus::Failed
        );
    }

    #[test]
    fn test_recover_without_backup_after_cache_write() {
        let env = env();
        seed(&env);
        env.source.set("finops", v2());
        let mut plan = plan_for(&env);

        // Crash after the cache write, before the plan was marked Executed.
        let mut entry = env.cache.load("finops").unwrap().unwrap();
        entry.descriptor = plan.target.clone();
        entry.last_plan_id = Some(plan.id.clone());
        env.cache.store(&entry).unwrap();
        plan.transition(PlanStatus::Executing);
        env.plans.save(&plan).unwrap();

        let records = env.executor.recover().unwrap();
        assert_eq!(records[0].outcome, AuditOutcome::Committed);
        assert_eq!(
            env.plans.load(&plan.id).unwrap().unwrap().status,
            PlanStatus::Executed
        );
        assert_eq!(
            env.cache.load("finops").unwrap().unwrap().fingerprint(),
            plan.target.fingerprint
        );
    }

    #[test]
    fn test_audit_written_when_plan_save_fails() {
        let env = env();
        seed(&env);
        let before = env.cache.load_raw("finops").unwrap().unwrap();
        env.source.set("finops", v2());
        let plan = plan_for(&env);
        env.source.set("finops", RowSample::new(["app_id"]).with_row(["App1"]));

        env.plans.reject_terminal_writes(true);
        let err = env.executor.execute(&plan.id, true).unwrap_err();
        env.plans.reject_terminal_writes(false);

        assert!(matches!(err, MigrationError::Serialization(_)));
        let records: Vec<_> = env
            .audit
            .history("finops")
            .unwrap()
            .into_iter()
            .filter(|r| r.plan_id == plan.id)
            .collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, AuditOutcome::RolledBack);
        assert_eq!(env.cache.load_raw("finops").unwrap().unwrap(), before);
    }

    #[test]
    fn test_recover_interrupted_plan() {
        let env = env();
        seed(&env);
        let before = env.cache.load_raw("finops").unwrap().unwrap();
        env.source.set("finops", v2());
        let mut plan = plan_for(&env);

        // Simulate a crash after backup and a partial apply.
        let backup = Backup::new("finops", &plan.id, Some(before.clone()), None);
        env.executor.backups.save(&backup).unwrap();
        env.cache.store_raw("finops", b"partial").unwrap();
        plan.transition(PlanStatus::Executing);
        env.plans.save(&plan).unwrap();

        let records = env.executor.recover().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, AuditOutcome::RolledBack);
        assert_eq!(env.cache.load_raw("finops").unwrap().unwrap(), before);
        assert_eq!(
            env.plans.load(&plan.id).unwrap().unwrap().status,
            PlanStatus::RolledBack
        );
    }

    #[test]
    fn test_apply_rename_records_alias() {
        let mut entry = CacheEntry::new(SchemaDescriptor::new(
            "finops",
            vec![ColumnDescriptor::new(
                "obs_platform",
                ColumnType::String,
                0,
            )],
        ));
        entry.set_default("obs_platform", "");
        let step = MigrationStep::new(StepType::RenameColumn, "obs_platform", 0, "rename")
            .with_values(
                Some("obs_platform".to_string()),
                Some("monitoring_platform".to_string()),
            )
            .with_column(ColumnDescriptor::new(
                "monitoring_platform",
                ColumnType::String,
                0,
            ));

        apply_step(&mut entry, &step, true).unwrap();
        assert_eq!(entry.resolve("obs_platform"), Some("monitoring_platform"));
        assert_eq!(entry.default_for("monitoring_platform"), Some(""));

        let missing = MigrationStep::new(StepType::RemoveColumn, "ghost", 0, "remove");
        assert!(apply_step(&mut entry, &missing, true).is_err());
    }
}
