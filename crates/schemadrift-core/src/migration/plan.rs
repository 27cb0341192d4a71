//! Migration plans.
//!
//! A plan is the ordered list of steps that moves a provider's cached
//! descriptor to a newly detected one. Steps run in phases:
//!
//! 1. AddColumn
//! 2. ChangeType, IncreasePrecision, ReduceSize
//! 3. AddIndex, DropIndex, AlterNullability
//! 4. RenameColumn
//! 5. ReorderColumn
//! 6. RemoveColumn
//!
//! Within a phase, steps keep the new descriptor's column order (removals keep
//! the previous descriptor's order).

use super::classifier::ChangeClassifier;
use super::error::{Classification, MigrationError};
use crate::current_timestamp;
use crate::descriptor::{ColumnDescriptor, SchemaDescriptor};
use rkyv::{Archive, Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

const FIELD_SEP: u8 = 0x1f;
const RECORD_SEP: u8 = 0x1e;

/// Length of a plan id in hex characters.
pub const PLAN_ID_LEN: usize = 32;

/// Reason recorded on plans replaced by a newer plan for the same provider.
pub const SUPERSEDED: &str = "superseded";

/// Kind of structural change a step applies.
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
pub enum StepType {
    AddColumn,
    RemoveColumn,
    RenameColumn,
    ChangeType,
    ReduceSize,
    IncreasePrecision,
    AddIndex,
    DropIndex,
    AlterNullability,
    ReorderColumn,
}

impl StepType {
    /// Stable name used in step fingerprints and output.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::AddColumn => "add_column",
            StepType::RemoveColumn => "remove_column",
            StepType::RenameColumn => "rename_column",
            StepType::ChangeType => "change_type",
            StepType::ReduceSize => "reduce_size",
            StepType::IncreasePrecision => "increase_precision",
            StepType::AddIndex => "add_index",
            StepType::DropIndex => "drop_index",
            StepType::AlterNullability => "alter_nullability",
            StepType::ReorderColumn => "reorder_column",
        }
    }

    /// Execution phase of the step type. Lower phases run first.
    pub fn phase(&self) -> u8 {
        match self {
            StepType::AddColumn => 0,
            StepType::ChangeType | StepType::IncreasePrecision | StepType::ReduceSize => 1,
            StepType::AddIndex | StepType::DropIndex | StepType::AlterNullability => 2,
            StepType::RenameColumn => 3,
            StepType::ReorderColumn => 4,
            StepType::RemoveColumn => 5,
        }
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single structural change.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct MigrationStep {
    /// Kind of change.
    pub step_type: StepType,
    /// Column the step operates on, by the name it carries when the step runs.
    pub column_name: String,
    /// Value before the change (type name, flag, ordinal or previous name).
    pub old_value: Option<String>,
    /// Value after the change.
    pub new_value: Option<String>,
    /// Safety classification.
    pub classification: Classification,
    /// Human readable description.
    pub description: String,
    /// Target column for steps that create or replace a column.
    pub column: Option<ColumnDescriptor>,
    /// Ordinal the step sorts by within its phase.
    pub position: u32,
}

impl MigrationStep {
    /// Create a step, classified by its type.
    pub fn new(
        step_type: StepType,
        column_name: impl Into<String>,
        position: u32,
        description: impl Into<String>,
    ) -> Self {
        Self {
            step_type,
            column_name: column_name.into(),
            old_value: None,
            new_value: None,
            classification: ChangeClassifier::classify(step_type),
            description: description.into(),
            column: None,
            position,
        }
    }

    /// Set the before/after values.
    pub fn with_values(mut self, old: Option<String>, new: Option<String>) -> Self {
        self.old_value = old;
        self.new_value = new;
        self
    }

    /// Attach the target column.
    pub fn with_column(mut self, column: ColumnDescriptor) -> Self {
        self.column = Some(column);
        self
    }

    /// Whether the step is breaking.
    pub fn is_breaking(&self) -> bool {
        self.classification == Classification::Breaking
    }

    /// Content hash of the step. Descriptions and sample values are excluded.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.step_type.as_str().as_bytes());
        hasher.update(&[FIELD_SEP]);
        hasher.update(self.column_name.as_bytes());
        hasher.update(&[FIELD_SEP]);
        hasher.update(self.old_value.as_deref().unwrap_or_default().as_bytes());
        hasher.update(&[FIELD_SEP]);
        hasher.update(self.new_value.as_deref().unwrap_or_default().as_bytes());
        hasher.update(&[RECORD_SEP]);
        *hasher.finalize().as_bytes()
    }
}

/// Lifecycle status of a plan.
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
pub enum PlanStatus {
    /// Created, awaiting execution.
    Pending,
    /// Explicitly approved by an operator.
    Approved,
    /// An executor run is in progress.
    Executing,
    /// Committed.
    Executed,
    /// Failed or superseded. Terminal.
    Failed,
    /// Rolled back after cancellation. Terminal.
    RolledBack,
}

impl PlanStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Executed | PlanStatus::Failed | PlanStatus::RolledBack
        )
    }

    /// Whether the plan may be handed to the executor.
    pub fn is_executable(&self) -> bool {
        matches!(self, PlanStatus::Pending | PlanStatus::Approved)
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanStatus::Pending => write!(f, "pending"),
            PlanStatus::Approved => write!(f, "approved"),
            PlanStatus::Executing => write!(f, "executing"),
            PlanStatus::Executed => write!(f, "executed"),
            PlanStatus::Failed => write!(f, "failed"),
            PlanStatus::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// An ordered, persisted migration plan for one provider.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct MigrationPlan {
    /// Content-derived id.
    pub id: String,
    /// Provider the plan migrates.
    pub provider_id: String,
    /// Creation time (microseconds since Unix epoch).
    pub created_at: u64,
    /// Last status change.
    pub updated_at: u64,
    /// Steps in execution order.
    pub steps: Vec<MigrationStep>,
    /// Current status.
    pub status: PlanStatus,
    /// Cached fingerprint the plan was computed against. Empty for a new provider.
    pub base_fingerprint: String,
    /// Descriptor the plan migrates to.
    pub target: SchemaDescriptor,
    /// Retry generation.
    pub attempt: u32,
    /// Terminal failure reason.
    pub error: Option<String>,
}

impl MigrationPlan {
    /// Overall classification.
    pub fn classification(&self) -> Classification {
        ChangeClassifier::classify_all(&self.steps)
    }

    /// Whether any step is breaking.
    pub fn is_breaking(&self) -> bool {
        self.classification() == Classification::Breaking
    }

    /// Whether the plan has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Number of steps.
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Number of breaking steps.
    pub fn breaking_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.is_breaking()).count()
    }

    /// Set a new status and touch `updated_at`.
    pub fn transition(&mut self, status: PlanStatus) {
        self.status = status;
        self.updated_at = current_timestamp();
    }

    /// Mark the plan failed with a reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.transition(PlanStatus::Failed);
        self.error = Some(reason.into());
    }

    /// Serialize the plan to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MigrationError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| MigrationError::Serialization(e.to_string()))
    }

    /// Deserialize a plan from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MigrationError> {
        let aligned = crate::aligned(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| MigrationError::Deserialization(e.to_string()))
    }
}

/// Persistent store of plans, one document per plan keyed by id.
pub struct PlanStore {
    tree: sled::Tree,
    #[cfg(test)]
    reject_terminal: std::sync::atomic::AtomicBool,
}

impl PlanStore {
    /// Tree name for plans.
    pub const TREE_NAME: &'static str = "migration:plans";

    /// Open or create the plan store.
    pub fn open(db: &sled::Db) -> Result<Self, MigrationError> {
        let tree = db.open_tree(Self::TREE_NAME)?;
        Ok(Self {
            tree,
            #[cfg(test)]
            reject_terminal: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Fail every save of a plan in a terminal status.
    #[cfg(test)]
    pub(crate) fn reject_terminal_writes(&self, reject: bool) {
        self.reject_terminal
            .store(reject, std::sync::atomic::Ordering::SeqCst);
    }

    /// Save a plan, replacing any previous version.
    pub fn save(&self, plan: &MigrationPlan) -> Result<(), MigrationError> {
        #[cfg(test)]
        if plan.is_terminal() && self.reject_terminal.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(MigrationError::Serialization(
                "plan store rejected the write".to_string(),
            ));
        }
        self.tree.insert(plan.id.as_bytes(), plan.to_bytes()?)?;
        Ok(())
    }

    /// Load a plan by id.
    pub fn load(&self, id: &str) -> Result<Option<MigrationPlan>, MigrationError> {
        match self.tree.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(MigrationPlan::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All plans, ordered by creation time then id.
    pub fn list(&self) -> Result<Vec<MigrationPlan>, MigrationError> {
        let mut plans = Vec::new();
        for result in self.tree.iter() {
            let (_, value) = result?;
            plans.push(MigrationPlan::from_bytes(&value)?);
        }
        plans.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(plans)
    }

    /// Plans for one provider, ordered by creation time.
    pub fn list_for_provider(&self, provider_id: &str) -> Result<Vec<MigrationPlan>, MigrationError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|p| p.provider_id == provider_id)
            .collect())
    }

    /// Plans awaiting execution (Pending or Approved).
    pub fn pending(&self) -> Result<Vec<MigrationPlan>, MigrationError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|p| p.status.is_executable())
            .collect())
    }

    /// The oldest plan of the provider awaiting execution.
    pub fn pending_for_provider(&self, provider_id: &str) -> Result<Option<MigrationPlan>, MigrationError> {
        Ok(self
            .list_for_provider(provider_id)?
            .into_iter()
            .find(|p| p.status.is_executable()))
    }

    /// Plans left in `Executing`, e.g. by a crash.
    pub fn executing(&self) -> Result<Vec<MigrationPlan>, MigrationError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|p| p.status == PlanStatus::Executing)
            .collect())
    }

    /// Flush changes to disk.
    pub fn flush(&self) -> Result<(), MigrationError> {
        self.tree.flush()?;
        Ok(())
    }
}

/// Orders diff output into plans and persists them.
pub struct MigrationPlanner {
    store: Arc<PlanStore>,
}

impl MigrationPlanner {
    /// Create a planner over a plan store.
    pub fn new(store: Arc<PlanStore>) -> Self {
        Self { store }
    }

    /// Sort steps into execution order.
    pub fn order_steps(steps: &mut [MigrationStep]) {
        steps.sort_by_key(|s| (s.step_type.phase(), s.position));
    }

    /// Content-derived plan id.
    pub fn plan_id(provider_id: &str, steps: &[MigrationStep], attempt: u32) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(provider_id.as_bytes());
        hasher.update(&[RECORD_SEP]);
        for step in steps {
            hasher.update(&step.fingerprint());
        }
        hasher.update(&attempt.to_be_bytes());
        let mut id = hex::encode(hasher.finalize().as_bytes());
        id.truncate(PLAN_ID_LEN);
        id
    }

    /// Build and persist a plan from diff output.
    ///
    /// An existing non-terminal plan with the same content is returned as is.
    /// If only terminal plans share the content, the attempt counter moves on
    /// so the new plan gets a fresh id. Older executable plans for the
    /// provider are superseded.
    pub fn create(
        &self,
        provider_id: &str,
        base: Option<&SchemaDescriptor>,
        target: SchemaDescriptor,
        mut steps: Vec<MigrationStep>,
    ) -> Result<MigrationPlan, MigrationError> {
        Self::order_steps(&mut steps);

        let mut attempt = 0u32;
        let id = loop {
            let id = Self::plan_id(provider_id, &steps, attempt);
            match self.store.load(&id)? {
                Some(existing) if !existing.is_terminal() => {
                    debug!(provider = provider_id, plan_id = %id, "reusing existing plan");
                    return Ok(existing);
                }
                Some(_) => attempt += 1,
                None => break id,
            }
        };

        for mut older in self.store.list_for_provider(provider_id)? {
            if older.status.is_executable() {
                info!(provider = provider_id, plan_id = %older.id, superseded_by = %id, "superseding plan");
                older.fail(SUPERSEDED);
                self.store.save(&older)?;
            }
        }

        let now = current_timestamp();
        let plan = MigrationPlan {
            id,
            provider_id: provider_id.to_string(),
            created_at: now,
            updated_at: now,
            steps,
            status: PlanStatus::Pending,
            base_fingerprint: base.map(|b| b.fingerprint.clone()).unwrap_or_default(),
            target,
            attempt,
            error: None,
        };
        self.store.save(&plan)?;

        info!(
            provider = provider_id,
            plan_id = %plan.id,
            steps = plan.steps.len(),
            classification = %plan.classification(),
            attempt,
            "created migration plan"
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ColumnType;

    fn target() -> SchemaDescriptor {
        SchemaDescriptor::new(
            "finops",
            vec![
                ColumnDescriptor::new("app_id", ColumnType::String, 0),
                ColumnDescriptor::new("region", ColumnType::String, 1),
            ],
        )
    }

    fn steps() -> Vec<MigrationStep> {
        vec![
            MigrationStep::new(StepType::RemoveColumn, "legacy", 1, "remove legacy"),
            MigrationStep::new(StepType::RenameColumn, "obs", 3, "rename obs"),
            MigrationStep::new(StepType::AddColumn, "zone", 4, "add zone"),
            MigrationStep::new(StepType::AddColumn, "region", 1, "add region"),
            MigrationStep::new(StepType::IncreasePrecision, "cost", 2, "widen cost"),
            MigrationStep::new(StepType::RemoveColumn, "old", 0, "remove old"),
        ]
    }

    fn store() -> Arc<PlanStore> {
        let db = sled::Config::new().temporary(true).open().unwrap();
        Arc::new(PlanStore::open(&db).unwrap())
    }

    #[test]
    fn test_order_steps() {
        let mut steps = steps();
        MigrationPlanner::order_steps(&mut steps);
        let order: Vec<_> = steps
            .iter()
            .map(|s| (s.step_type, s.column_name.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                (StepType::AddColumn, "region"),
                (StepType::AddColumn, "zone"),
                (StepType::IncreasePrecision, "cost"),
                (StepType::RenameColumn, "obs"),
                (StepType::RemoveColumn, "old"),
                (StepType::RemoveColumn, "legacy"),
            ]
        );
    }

    #[test]
    fn test_plan_id_is_content_derived() {
        let mut a = steps();
        MigrationPlanner::order_steps(&mut a);
        let id = MigrationPlanner::plan_id("finops", &a, 0);
        assert_eq!(id.len(), PLAN_ID_LEN);
        assert_eq!(id, MigrationPlanner::plan_id("finops", &a, 0));
        assert_ne!(id, MigrationPlanner::plan_id("finops", &a, 1));
        assert_ne!(id, MigrationPlanner::plan_id("billing", &a, 0));

        let mut described = a.clone();
        described[0].description = "something else".to_string();
        assert_eq!(id, MigrationPlanner::plan_id("finops", &described, 0));
    }

    #[test]
    fn test_create_reuses_open_plan() {
        let planner = MigrationPlanner::new(store());
        let first = planner.create("finops", None, target(), steps()).unwrap();
        let second = planner.create("finops", None, target(), steps()).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.status, PlanStatus::Pending);
        assert_eq!(first.attempt, 0);
        assert!(first.base_fingerprint.is_empty());
    }

    #[test]
    fn test_terminal_plan_gets_fresh_attempt() {
        let store = store();
        let planner = MigrationPlanner::new(Arc::clone(&store));
        let mut first = planner.create("finops", None, target(), steps()).unwrap();
        first.fail("validation mismatch");
        store.save(&first).unwrap();

        let retry = planner.create("finops", None, target(), steps()).unwrap();
        assert_ne!(retry.id, first.id);
        assert_eq!(retry.attempt, 1);
        assert_eq!(retry.status, PlanStatus::Pending);
    }

    #[test]
    fn test_new_plan_supersedes_pending() {
        let store = store();
        let planner = MigrationPlanner::new(Arc::clone(&store));
        let first = planner.create("finops", None, target(), steps()).unwrap();
        let other = vec![MigrationStep::new(StepType::AddColumn, "zone", 2, "add zone")];
        let second = planner.create("finops", None, target(), other).unwrap();

        let first = store.load(&first.id).unwrap().unwrap();
        assert_eq!(first.status, PlanStatus::Failed);
        assert_eq!(first.error.as_deref(), Some(SUPERSEDED));

        let pending = store.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second.id);
        assert_eq!(
            store.pending_for_provider("finops").unwrap().unwrap().id,
            second.id
        );
    }

    #[test]
    fn test_plan_serialization() {
        let planner = MigrationPlanner::new(store());
        let plan = planner.create("finops", None, target(), steps()).unwrap();
        let restored = MigrationPlan::from_bytes(&plan.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, plan);
        assert!(restored.is_breaking());
        assert_eq!(restored.breaking_steps(), 3);
    }
}
