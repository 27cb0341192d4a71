//! Schema and validation reports.

use crate::cache::CacheEntry;
use crate::descriptor::SchemaDescriptor;
use crate::migration::{AuditOutcome, AuditRecord, MigrationPlan};
use serde::Serialize;

/// Drift status of one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    /// Live structure matches the cache.
    Current,
    /// Live structure differs from the cache.
    Drifted,
    /// Known to the source but never migrated.
    Untracked,
    /// Live structure could not be inferred.
    Error,
}

/// Per-provider section of a [`SchemaReport`].
#[derive(Debug, Clone, Serialize)]
pub struct ProviderReport {
    /// Provider id.
    pub provider_id: String,
    /// Drift status.
    pub status: ProviderStatus,
    /// Fingerprint in the cache.
    pub cached_fingerprint: Option<String>,
    /// Fingerprint of the live source.
    pub live_fingerprint: Option<String>,
    /// Cached columns in order.
    pub columns: Vec<String>,
    /// Plan awaiting execution.
    pub pending_plan_id: Option<String>,
    /// Whether the pending plan needs an explicit execute.
    pub pending_breaking: bool,
    /// Outcome of the most recent execution.
    pub last_outcome: Option<AuditOutcome>,
    /// Plan committed into the cache most recently.
    pub last_plan_id: Option<String>,
    /// Detection failure.
    pub error: Option<String>,
}

impl ProviderReport {
    /// Build a provider section.
    pub fn new(
        provider_id: &str,
        cached: Option<&CacheEntry>,
        live: Result<&SchemaDescriptor, String>,
        pending: Option<&MigrationPlan>,
        last: Option<&AuditRecord>,
    ) -> Self {
        let (live_fingerprint, error) = match live {
            Ok(descriptor) => (Some(descriptor.fingerprint.clone()), None),
            Err(reason) => (None, Some(reason)),
        };
        let cached_fingerprint = cached.map(|e| e.fingerprint().to_string());

        let status = match (&cached_fingerprint, &live_fingerprint) {
            (_, None) => ProviderStatus::Error,
            (None, Some(_)) => ProviderStatus::Untracked,
            (Some(c), Some(l)) if c == l => ProviderStatus::Current,
            _ => ProviderStatus::Drifted,
        };

        Self {
            provider_id: provider_id.to_string(),
            status,
            cached_fingerprint,
            live_fingerprint,
            columns: cached
                .map(|e| e.descriptor.columns.iter().map(|c| c.name.clone()).collect())
                .unwrap_or_default(),
            pending_plan_id: pending.map(|p| p.id.clone()),
            pending_breaking: pending.map(|p| p.is_breaking()).unwrap_or(false),
            last_outcome: last.map(|r| r.outcome),
            last_plan_id: cached.and_then(|e| e.last_plan_id.clone()),
            error,
        }
    }
}

/// Counts across a [`SchemaReport`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub total: usize,
    pub current: usize,
    pub drifted: usize,
    pub untracked: usize,
    pub errors: usize,
    pub pending_plans: usize,
}

/// Drift status of every provider.
#[derive(Debug, Clone, Serialize)]
pub struct SchemaReport {
    /// Generation time (microseconds since Unix epoch).
    pub generated_at: u64,
    /// One section per provider, ordered by id.
    pub providers: Vec<ProviderReport>,
    /// Totals.
    pub summary: ReportSummary,
}

impl SchemaReport {
    /// Assemble a report and compute its summary.
    pub fn new(mut providers: Vec<ProviderReport>) -> Self {
        providers.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        let mut summary = ReportSummary {
            total: providers.len(),
            ..Default::default()
        };
        for p in &providers {
            match p.status {
                ProviderStatus::Current => summary.current += 1,
                ProviderStatus::Drifted => summary.drifted += 1,
                ProviderStatus::Untracked => summary.untracked += 1,
                ProviderStatus::Error => summary.errors += 1,
            }
            if p.pending_plan_id.is_some() {
                summary.pending_plans += 1;
            }
        }
        Self {
            generated_at: crate::current_timestamp(),
            providers,
            summary,
        }
    }

    /// Section for one provider.
    pub fn provider(&self, provider_id: &str) -> Option<&ProviderReport> {
        self.providers.iter().find(|p| p.provider_id == provider_id)
    }
}

/// Severity of an anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Kind of anomaly found during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    NotCached,
    DetectionFailed,
    FingerprintMismatch,
    MissingColumn,
    UnexpectedColumn,
    TypeMismatch,
    NullabilityChanged,
    UniquenessChanged,
    OrderChanged,
    NoIdentifier,
    PendingPlan,
}

/// A single finding of a validation run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub severity: Severity,
    pub column: Option<String>,
    pub message: String,
}

impl Anomaly {
    fn new(kind: AnomalyKind, severity: Severity, column: Option<&str>, message: String) -> Self {
        Self {
            kind,
            severity,
            column: column.map(str::to_string),
            message,
        }
    }
}

/// Result of validating a provider's live structure against its cache.
///
/// Validation passes iff there is no anomaly of [`Severity::Error`].
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub provider_id: String,
    pub passed: bool,
    pub cached_fingerprint: Option<String>,
    pub live_fingerprint: Option<String>,
    pub anomalies: Vec<Anomaly>,
    pub validated_at: u64,
}

impl ValidationReport {
    /// Compare the cached entry with the live descriptor.
    pub fn compare(
        provider_id: &str,
        cached: Option<&CacheEntry>,
        live: Result<&SchemaDescriptor, String>,
        pending: Option<&MigrationPlan>,
    ) -> Self {
        let mut anomalies = Vec::new();

        if let Some(plan) = pending {
            anomalies.push(Anomaly::new(
                AnomalyKind::PendingPlan,
                Severity::Info,
                None,
                format!(
                    "plan {} with {} step(s) awaits execution ({})",
                    plan.id,
                    plan.steps.len(),
                    plan.classification()
                ),
            ));
        }

        let live_fingerprint = live.as_ref().ok().map(|d| d.fingerprint.clone());
        let live = match live {
            Ok(descriptor) => Some(descriptor),
            Err(reason) => {
                anomalies.push(Anomaly::new(
                    AnomalyKind::DetectionFailed,
                    Severity::Error,
                    None,
                    reason,
                ));
                None
            }
        };

        match cached {
            None => anomalies.push(Anomaly::new(
                AnomalyKind::NotCached,
                Severity::Error,
                None,
                format!("provider '{}' has no cached schema", provider_id),
            )),
            Some(entry) => {
                if entry.descriptor.identifier_columns().is_empty() {
                    anomalies.push(Anomaly::new(
                        AnomalyKind::NoIdentifier,
                        Severity::Info,
                        None,
                        "no candidate identifier column".to_string(),
                    ));
                }
                if let Some(live) = live {
                    if live.fingerprint != entry.descriptor.fingerprint {
                        anomalies.push(Anomaly::new(
                            AnomalyKind::FingerprintMismatch,
                            Severity::Error,
                            None,
                            format!(
                                "live fingerprint {} differs from cached {}",
                                live.fingerprint, entry.descriptor.fingerprint
                            ),
                        ));
                        column_anomalies(&entry.descriptor, live, &mut anomalies);
                    }
                }
            }
        }

        let passed = !anomalies.iter().any(|a| a.severity == Severity::Error);
        Self {
            provider_id: provider_id.to_string(),
            passed,
            cached_fingerprint: cached.map(|e| e.fingerprint().to_string()),
            live_fingerprint,
            anomalies,
            validated_at: crate::current_timestamp(),
        }
    }

    /// Anomalies at or above a severity.
    pub fn at_least(&self, severity: Severity) -> impl Iterator<Item = &Anomaly> {
        self.anomalies.iter().filter(move |a| a.severity >= severity)
    }
}

fn column_anomalies(cached: &SchemaDescriptor, live: &SchemaDescriptor, out: &mut Vec<Anomaly>) {
    for column in &cached.columns {
        let Some(found) = live.column(&column.name) else {
            out.push(Anomaly::new(
                AnomalyKind::MissingColumn,
                Severity::Error,
                Some(&column.name),
                format!("column '{}' is missing from the source", column.name),
            ));
            continue;
        };
        if found.inferred_type != column.inferred_type {
            out.push(Anomaly::new(
                AnomalyKind::TypeMismatch,
                Severity::Error,
                Some(&column.name),
                format!(
                    "column '{}' is {} in the source, cached as {}",
                    column.name, found.inferred_type, column.inferred_type
                ),
            ));
        }
        if found.nullable != column.nullable {
            out.push(Anomaly::new(
                AnomalyKind::NullabilityChanged,
                Severity::Warning,
                Some(&column.name),
                format!(
                    "column '{}' nullable: cached {}, source {}",
                    column.name, column.nullable, found.nullable
                ),
            ));
        }
        if found.unique != column.unique {
            out.push(Anomaly::new(
                AnomalyKind::UniquenessChanged,
                Severity::Warning,
                Some(&column.name),
                format!(
                    "column '{}' unique: cached {}, source {}",
                    column.name, column.unique, found.unique
                ),
            ));
        }
    }

    for column in &live.columns {
        if cached.column(&column.name).is_none() {
            out.push(Anomaly::new(
                AnomalyKind::UnexpectedColumn,
                Severity::Warning,
                Some(&column.name),
                format!("column '{}' is not in the cached schema", column.name),
            ));
        }
    }

    let shared = |d: &SchemaDescriptor, other: &SchemaDescriptor| -> Vec<String> {
        d.columns
            .iter()
            .filter(|c| other.column(&c.name).is_some())
            .map(|c| c.name.clone())
            .collect()
    };
    if shared(cached, live) != shared(live, cached) {
        out.push(Anomaly::new(
            AnomalyKind::OrderChanged,
            Severity::Warning,
            None,
            "relative column order differs from the cached schema".to_string(),
        ));
    }
}
