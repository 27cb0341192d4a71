//! Periodic reconciliation.
//!
//! The scheduler wakes on a fixed interval and reconciles every provider in
//! parallel on the blocking pool. Per-provider failures are logged and never
//! stop the loop. Shutdown cancels only the executions the scheduler started;
//! the engine stays usable afterwards.

use crate::engine::{ReconcileOutcome, SchemaEngine};
use crate::migration::{CancelToken, MigrationError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub unchanged: usize,
    pub executed: usize,
    pub awaiting_approval: usize,
    pub conflicts: usize,
    pub failed: usize,
}

/// Background reconciliation loop.
pub struct Scheduler {
    engine: Arc<SchemaEngine>,
    interval: Duration,
}

impl Scheduler {
    /// Create a scheduler using the engine's configured interval.
    pub fn new(engine: Arc<SchemaEngine>) -> Self {
        let interval = engine.config().scheduler_interval;
        Self { engine, interval }
    }

    /// Override the interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run one pass over every provider.
    pub async fn run_once(&self) -> PassSummary {
        run_pass(&self.engine, &CancelToken::new()).await
    }

    /// Spawn the loop. The first pass runs immediately.
    pub fn start(self) -> SchedulerHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let cancel = CancelToken::new();
        let engine = self.engine;
        let interval = self.interval;
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "scheduler started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let summary = run_pass(&engine, &token).await;
                        debug!(?summary, "reconciliation pass finished");
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("scheduler stopped");
        });

        SchedulerHandle {
            handle,
            stop_tx,
            cancel,
        }
    }
}

/// Handle to a running scheduler.
pub struct SchedulerHandle {
    handle: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
    cancel: CancelToken,
}

impl SchedulerHandle {
    /// Stop the loop, cancel its in-flight executions and wait for the task.
    ///
    /// Executions that were cancelled finish their rollback before this
    /// returns.
    pub async fn shutdown(self) {
        info!("scheduler shutting down");
        let _ = self.stop_tx.send(true);
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            error!(error = %e, "scheduler task panicked");
        }
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

async fn run_pass(engine: &Arc<SchemaEngine>, cancel: &CancelToken) -> PassSummary {
    let mut tasks = JoinSet::new();
    for provider_id in engine.provider_ids() {
        let engine = Arc::clone(engine);
        let cancel = cancel.clone();
        tasks.spawn_blocking(move || {
            let outcome = engine.reconcile_provider_with(&provider_id, &cancel);
            (provider_id, outcome)
        });
    }

    let mut summary = PassSummary::default();
    while let Some(joined) = tasks.join_next().await {
        let (provider_id, outcome) = match joined {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "reconcile task panicked");
                summary.failed += 1;
                continue;
            }
        };
        match outcome {
            Ok(ReconcileOutcome::Unchanged) => summary.unchanged += 1,
            Ok(ReconcileOutcome::Executed(record)) => {
                info!(provider = %provider_id, plan_id = %record.plan_id, "safe migration applied");
                summary.executed += 1;
            }
            Ok(ReconcileOutcome::AwaitingApproval(plan)) => {
                info!(provider = %provider_id, plan_id = %plan.id, "breaking migration awaits approval");
                summary.awaiting_approval += 1;
            }
            Err(MigrationError::PlanConflict { reason, .. }) => {
                warn!(provider = %provider_id, reason = %reason, "provider busy, skipped");
                summary.conflicts += 1;
            }
            Err(e) => {
                warn!(provider = %provider_id, error = %e, "reconcile failed");
                summary.failed += 1;
            }
        }
    }
    summary
}
