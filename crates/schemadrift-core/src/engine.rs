//! Schema engine - the facade over fingerprinting, planning and execution.
//!
//! The engine owns the stores and a per-provider lock table. Mutating
//! operations (`create_plan`, `execute_plan`, `reconcile_provider`) take the
//! provider's lock with `try_lock` and are rejected with
//! [`MigrationError::PlanConflict`] when it is held. Read operations wait for
//! the lock so they never observe a migration half applied.

use crate::cache::{CacheEntry, SchemaCache, SledSchemaCache};
use crate::config::EngineConfig;
use crate::descriptor::SchemaDescriptor;
use crate::fingerprint::SchemaFingerprinter;
use crate::migration::{
    AuditLog, AuditRecord, BackupStore, CancelToken, MigrationError, MigrationExecutor, MigrationPlan,
    MigrationPlanner, PlanStatus, PlanStore, SchemaDiffer, SledBackupStore,
};
use crate::report::{ProviderReport, SchemaReport, ValidationReport};
use crate::source::SampleSource;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of [`SchemaEngine::create_plan`].
#[derive(Debug, Clone, PartialEq)]
pub enum PlanOutcome {
    /// A plan exists for the detected drift.
    Planned(MigrationPlan),
    /// The live structure matches the cache.
    NoMigrationNeeded,
}

/// Result of reconciling one provider.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    /// No drift.
    Unchanged,
    /// A fully safe plan was executed and committed.
    Executed(AuditRecord),
    /// A plan was created and awaits an explicit execute.
    AwaitingApproval(MigrationPlan),
}

/// The schema detection and migration engine.
pub struct SchemaEngine {
    _db: sled::Db,
    source: Arc<dyn SampleSource>,
    cache: Arc<dyn SchemaCache>,
    plans: Arc<PlanStore>,
    audit: Arc<AuditLog>,
    fingerprinter: SchemaFingerprinter,
    differ: SchemaDiffer,
    planner: MigrationPlanner,
    executor: MigrationExecutor,
    locks: DashMap<String, Arc<Mutex<()>>>,
    config: EngineConfig,
}

impl SchemaEngine {
    /// Open an engine persisting to `path`.
    pub fn open(
        path: impl AsRef<Path>,
        source: Arc<dyn SampleSource>,
        config: EngineConfig,
    ) -> Result<Self, MigrationError> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).map_err(crate::error::Error::Io)?;
        let db = sled::open(path)?;
        info!(path = %path.display(), "opened schema store");
        Self::with_db(db, source, config)
    }

    /// Open an engine backed by a temporary store, discarded on drop.
    pub fn temporary(
        source: Arc<dyn SampleSource>,
        config: EngineConfig,
    ) -> Result<Self, MigrationError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db, source, config)
    }

    /// Build an engine over an open database.
    pub fn with_db(
        db: sled::Db,
        source: Arc<dyn SampleSource>,
        config: EngineConfig,
    ) -> Result<Self, MigrationError> {
        let backups = Arc::new(SledBackupStore::open(&db)?);
        Self::with_backup_store(db, source, backups, config)
    }

    /// Build an engine with a custom backup store.
    pub fn with_backup_store(
        db: sled::Db,
        source: Arc<dyn SampleSource>,
        backups: Arc<dyn BackupStore>,
        config: EngineConfig,
    ) -> Result<Self, MigrationError> {
        let cache: Arc<dyn SchemaCache> = Arc::new(SledSchemaCache::open(&db)?);
        let plans = Arc::new(PlanStore::open(&db)?);
        let audit = Arc::new(AuditLog::open(&db)?);
        let fingerprinter = SchemaFingerprinter::new(config.sample_cap);
        let snapshot_limit = config.source_snapshots.then_some(config.snapshot_limit);

        let executor = MigrationExecutor::new(
            Arc::clone(&cache),
            Arc::clone(&plans),
            backups,
            Arc::clone(&audit),
            Arc::clone(&source),
            fingerprinter.clone(),
            snapshot_limit,
        );

        let engine = Self {
            _db: db,
            source,
            cache,
            planner: MigrationPlanner::new(Arc::clone(&plans)),
            plans,
            audit,
            fingerprinter,
            differ: SchemaDiffer::new(config.rename_threshold),
            executor,
            locks: DashMap::new(),
            config,
        };

        let recovered = engine.recover()?;
        if !recovered.is_empty() {
            warn!(count = recovered.len(), "recovered interrupted migrations");
        }
        Ok(engine)
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Providers known to the source.
    pub fn provider_ids(&self) -> Vec<String> {
        self.source.provider_ids()
    }

    fn provider_lock(&self, provider_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(provider_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn busy(provider_id: &str) -> MigrationError {
        MigrationError::PlanConflict {
            provider: provider_id.to_string(),
            reason: "a migration is already in flight".to_string(),
        }
    }

    /// Detect drift for a provider and plan the migration.
    pub fn create_plan(&self, provider_id: &str) -> Result<PlanOutcome, MigrationError> {
        let lock = self.provider_lock(provider_id);
        let _guard = lock.try_lock().ok_or_else(|| Self::busy(provider_id))?;
        self.plan_locked(provider_id)
    }

    fn plan_locked(&self, provider_id: &str) -> Result<PlanOutcome, MigrationError> {
        let live = self
            .fingerprinter
            .fingerprint_source(self.source.as_ref(), provider_id)?;
        let cached = self.cache.load(provider_id)?;

        if let Some(entry) = &cached {
            if entry.fingerprint() == live.fingerprint {
                debug!(provider = provider_id, "schema unchanged");
                return Ok(PlanOutcome::NoMigrationNeeded);
            }
        }

        let previous = cached.as_ref().map(|e| &e.descriptor);
        let steps = self.differ.diff(previous, &live);
        if steps.is_empty() {
            return Ok(PlanOutcome::NoMigrationNeeded);
        }

        info!(
            provider = provider_id,
            steps = steps.len(),
            new_provider = cached.is_none(),
            "schema drift detected"
        );
        let plan = self.planner.create(provider_id, previous, live, steps)?;
        Ok(PlanOutcome::Planned(plan))
    }

    /// Plans awaiting execution, ordered by creation time then id.
    pub fn list_pending_plans(&self) -> Result<Vec<MigrationPlan>, MigrationError> {
        self.plans.pending()
    }

    /// Load a plan by id.
    pub fn get_plan(&self, plan_id: &str) -> Result<Option<MigrationPlan>, MigrationError> {
        self.plans.load(plan_id)
    }

    /// Every plan of a provider, oldest first.
    pub fn plans_for_provider(&self, provider_id: &str) -> Result<Vec<MigrationPlan>, MigrationError> {
        self.plans.list_for_provider(provider_id)
    }

    /// Mark a pending plan approved.
    pub fn approve_plan(&self, plan_id: &str) -> Result<MigrationPlan, MigrationError> {
        let plan = self
            .plans
            .load(plan_id)?
            .ok_or_else(|| MigrationError::PlanNotFound(plan_id.to_string()))?;
        let lock = self.provider_lock(&plan.provider_id);
        let _guard = lock
            .try_lock()
            .ok_or_else(|| Self::busy(&plan.provider_id))?;

        // Reload under the lock.
        let mut plan = self
            .plans
            .load(plan_id)?
            .ok_or_else(|| MigrationError::PlanNotFound(plan_id.to_string()))?;
        if plan.status != PlanStatus::Pending {
            return Err(MigrationError::PlanConflict {
                provider: plan.provider_id.clone(),
                reason: format!("plan {} is {}", plan.id, plan.status),
            });
        }
        plan.transition(PlanStatus::Approved);
        self.plans.save(&plan)?;
        info!(provider = %plan.provider_id, plan_id = %plan.id, "plan approved");
        Ok(plan)
    }

    /// Execute the provider's pending plan.
    pub fn execute_plan(&self, provider_id: &str, backup: bool) -> Result<AuditRecord, MigrationError> {
        let lock = self.provider_lock(provider_id);
        let _guard = lock.try_lock().ok_or_else(|| Self::busy(provider_id))?;
        let plan = self
            .plans
            .pending_for_provider(provider_id)?
            .ok_or_else(|| MigrationError::NoPendingPlan(provider_id.to_string()))?;
        self.executor.execute(&plan.id, backup)
    }

    /// Execute a specific plan.
    pub fn execute_plan_by_id(&self, plan_id: &str, backup: bool) -> Result<AuditRecord, MigrationError> {
        let plan = self
            .plans
            .load(plan_id)?
            .ok_or_else(|| MigrationError::PlanNotFound(plan_id.to_string()))?;
        let lock = self.provider_lock(&plan.provider_id);
        let _guard = lock
            .try_lock()
            .ok_or_else(|| Self::busy(&plan.provider_id))?;
        self.executor.execute(plan_id, backup)
    }

    /// Detect drift and plan; execute the plan if it is fully safe.
    pub fn reconcile_provider(&self, provider_id: &str) -> Result<ReconcileOutcome, MigrationError> {
        self.reconcile_provider_with(provider_id, &CancelToken::new())
    }

    /// Reconcile a provider; an auto-execution stops between steps once
    /// `cancel` is triggered.
    pub fn reconcile_provider_with(
        &self,
        provider_id: &str,
        cancel: &CancelToken,
    ) -> Result<ReconcileOutcome, MigrationError> {
        let lock = self.provider_lock(provider_id);
        let _guard = lock.try_lock().ok_or_else(|| Self::busy(provider_id))?;

        let plan = match self.plan_locked(provider_id)? {
            PlanOutcome::NoMigrationNeeded => return Ok(ReconcileOutcome::Unchanged),
            PlanOutcome::Planned(plan) => plan,
        };

        if plan.is_breaking() || !self.config.auto_execute || !plan.status.is_executable() {
            info!(
                provider = provider_id,
                plan_id = %plan.id,
                breaking_steps = plan.breaking_steps(),
                "plan awaits approval"
            );
            return Ok(ReconcileOutcome::AwaitingApproval(plan));
        }

        let record = self.executor.execute_with(&plan.id, true, cancel)?;
        Ok(ReconcileOutcome::Executed(record))
    }

    /// Reconcile every provider known to the source, one after another.
    pub fn reconcile_all(&self) -> Vec<(String, Result<ReconcileOutcome, MigrationError>)> {
        self.provider_ids()
            .into_iter()
            .map(|id| {
                let outcome = self.reconcile_provider(&id);
                if let Err(e) = &outcome {
                    warn!(provider = %id, error = %e, "reconcile failed");
                }
                (id, outcome)
            })
            .collect()
    }

    /// Drift status of every provider in the source or the cache.
    pub fn get_schema_report(&self) -> Result<SchemaReport, MigrationError> {
        let mut providers: BTreeSet<String> = self.source.provider_ids().into_iter().collect();
        providers.extend(self.cache.providers()?);

        let mut sections = Vec::with_capacity(providers.len());
        for provider_id in &providers {
            let lock = self.provider_lock(provider_id);
            let _guard = lock.lock();

            let live = self
                .fingerprinter
                .fingerprint_source(self.source.as_ref(), provider_id);
            let cached = self.cache.load(provider_id)?;
            let pending = self.plans.pending_for_provider(provider_id)?;
            let last = self.audit.history(provider_id)?.pop();

            sections.push(ProviderReport::new(
                provider_id,
                cached.as_ref(),
                live.as_ref().map_err(|e| e.to_string()),
                pending.as_ref(),
                last.as_ref(),
            ));
        }
        Ok(SchemaReport::new(sections))
    }

    /// Validate a provider's live structure against its cached schema.
    pub fn validate_schema(&self, provider_id: &str) -> Result<ValidationReport, MigrationError> {
        let lock = self.provider_lock(provider_id);
        let _guard = lock.lock();

        let live = self
            .fingerprinter
            .fingerprint_source(self.source.as_ref(), provider_id);
        let cached = self.cache.load(provider_id)?;
        let pending = self.plans.pending_for_provider(provider_id)?;

        let report = ValidationReport::compare(
            provider_id,
            cached.as_ref(),
            live.as_ref().map_err(|e| e.to_string()),
            pending.as_ref(),
        );
        debug!(provider = provider_id, passed = report.passed, anomalies = report.anomalies.len(), "validated schema");
        Ok(report)
    }

    /// Execution history of a provider.
    pub fn audit_history(&self, provider_id: &str) -> Result<Vec<AuditRecord>, MigrationError> {
        self.audit.history(provider_id)
    }

    /// Every audit record, ordered by sequence.
    pub fn audit_log(&self) -> Result<Vec<AuditRecord>, MigrationError> {
        self.audit.all()
    }

    /// Committed descriptor of a provider.
    pub fn cached_descriptor(&self, provider_id: &str) -> Result<Option<SchemaDescriptor>, MigrationError> {
        Ok(self.cached_entry(provider_id)?.map(|e| e.descriptor))
    }

    /// Committed cache entry of a provider, including rename aliases and
    /// column defaults.
    pub fn cached_entry(&self, provider_id: &str) -> Result<Option<CacheEntry>, MigrationError> {
        let lock = self.provider_lock(provider_id);
        let _guard = lock.lock();
        Ok(self.cache.load(provider_id)?)
    }

    /// Roll back plans left executing by an interrupted process.
    pub fn recover(&self) -> Result<Vec<AuditRecord>, MigrationError> {
        self.executor.recover()
    }

    /// Flush every store.
    pub fn flush(&self) -> Result<(), MigrationError> {
        self.cache.flush()?;
        self.plans.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::AuditOutcome;
    use crate::source::{MemorySource, RowSample};

    fn engine() -> (SchemaEngine, Arc<MemorySource>) {
        let source = Arc::new(MemorySource::new());
        let engine = SchemaEngine::temporary(source.clone(), EngineConfig::default()).unwrap();
        (engine, source)
    }

    fn finops() -> RowSample {
        RowSample::new(["app_id", "cost"])
            .with_row(["App1", "10"])
            .with_row(["App2", "20"])
    }

    #[test]
    fn test_reconcile_new_provider_executes() {
        let (engine, source) = engine();
        source.set("finops", finops());

        let record = match engine.reconcile_provider("finops").unwrap() {
            ReconcileOutcome::Executed(record) => record,
            other => panic!("expected execution, got {other:?}"),
        };
        assert_eq!(record.outcome, AuditOutcome::Committed);
        assert_eq!(
            engine.reconcile_provider("finops").unwrap(),
            ReconcileOutcome::Unchanged
        );
        assert_eq!(
            engine.create_plan("finops").unwrap(),
            PlanOutcome::NoMigrationNeeded
        );
    }

    #[test]
    fn test_busy_provider_is_rejected() {
        let (engine, source) = engine();
        source.set("finops", finops());

        let lock = engine.provider_lock("finops");
        let _held = lock.lock();
        assert!(engine.create_plan("finops").unwrap_err().is_conflict());
        assert!(engine.execute_plan("finops", true).unwrap_err().is_conflict());
        assert!(engine.reconcile_provider("finops").unwrap_err().is_conflict());
    }

    #[test]
    fn test_execute_without_plan() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.execute_plan("finops", true),
            Err(MigrationError::NoPendingPlan(_))
        ));
        assert!(matches!(
            engine.execute_plan_by_id("nope", true),
            Err(MigrationError::PlanNotFound(_))
        ));
    }

    #[test]
    fn test_approve_plan() {
        let source = Arc::new(MemorySource::new());
        let engine = SchemaEngine::temporary(
            source.clone(),
            EngineConfig::default().without_auto_execute(),
        )
        .unwrap();
        source.set("finops", finops());

        let ReconcileOutcome::AwaitingApproval(plan) = engine.reconcile_provider("finops").unwrap()
        else {
            panic!("expected pending plan");
        };
        let approved = engine.approve_plan(&plan.id).unwrap();
        assert_eq!(approved.status, PlanStatus::Approved);
        assert!(engine.approve_plan(&plan.id).unwrap_err().is_conflict());

        assert_eq!(engine.list_pending_plans().unwrap().len(), 1);
        engine.execute_plan("finops", true).unwrap();
        assert!(engine.list_pending_plans().unwrap().is_empty());
    }

    #[test]
    fn test_detection_error_is_local() {
        let (engine, source) = engine();
        source.set("finops", finops());
        source.set("empty", RowSample::new(["a"]));

        let results = engine.reconcile_all();
        assert_eq!(results.len(), 2);
        let by_id = |id: &str| &results.iter().find(|(p, _)| p == id).unwrap().1;
        assert!(matches!(by_id("empty"), Err(e) if e.is_detection()));
        assert!(matches!(by_id("finops"), Ok(ReconcileOutcome::Executed(_))));
    }
}
