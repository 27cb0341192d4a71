//! One-shot CLI commands.
//!
//! Every command returns a JSON document for stdout.

use crate::config::Command;
use crate::error::Error;
use schemadrift_core::{PlanOutcome, SchemaEngine};
use serde_json::{json, Value};
use tracing::info;

/// Run a one-shot command against the engine.
///
/// `Serve` is handled by the binary and returns a configuration error here.
pub fn run(engine: &SchemaEngine, command: Command) -> Result<Value, Error> {
    let output = match command {
        Command::Serve => {
            return Err(Error::Config("serve is not a one-shot command".to_string()));
        }
        Command::Report => serde_json::to_value(engine.get_schema_report()?)?,
        Command::Validate { provider } => serde_json::to_value(engine.validate_schema(&provider)?)?,
        Command::Plans => serde_json::to_value(engine.list_pending_plans()?)?,
        Command::Plan { provider } => match engine.create_plan(&provider)? {
            PlanOutcome::Planned(plan) => json!({
                "provider_id": provider,
                "migration_needed": true,
                "classification": plan.classification(),
                "plan": plan,
            }),
            PlanOutcome::NoMigrationNeeded => json!({
                "provider_id": provider,
                "migration_needed": false,
            }),
        },
        Command::Approve { plan_id } => serde_json::to_value(engine.approve_plan(&plan_id)?)?,
        Command::Execute {
            provider,
            plan_id,
            no_backup,
        } => {
            let record = match (plan_id, provider) {
                (Some(plan_id), _) => engine.execute_plan_by_id(&plan_id, !no_backup)?,
                (None, Some(provider)) => engine.execute_plan(&provider, !no_backup)?,
                (None, None) => {
                    return Err(Error::Config("execute needs a provider or --plan-id".to_string()));
                }
            };
            info!(plan_id = %record.plan_id, outcome = ?record.outcome, "plan executed");
            serde_json::to_value(record)?
        }
        Command::History { provider } => {
            let records = match provider {
                Some(provider) => engine.audit_history(&provider)?,
                None => engine.audit_log()?,
            };
            serde_json::to_value(records)?
        }
    };
    engine.flush()?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csv_source::CsvSampleSource;
    use schemadrift_core::EngineConfig;
    use std::path::Path;
    use std::sync::Arc;

    fn engine(dir: &Path, contents: &str) -> SchemaEngine {
        let csv = dir.join("finops.csv");
        std::fs::write(&csv, contents).unwrap();
        let source = Arc::new(CsvSampleSource::default().with_file("finops", csv));
        SchemaEngine::open(dir.join("store"), source, EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_plan_execute_history() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), "app_id,cost\nApp1,10\nApp2,20\n");

        let planned = run(
            &engine,
            Command::Plan {
                provider: "finops".to_string(),
            },
        )
        .unwrap();
        assert_eq!(planned["migration_needed"], true);
        assert_eq!(planned["classification"], "safe");

        let record = run(
            &engine,
            Command::Execute {
                provider: Some("finops".to_string()),
                plan_id: None,
                no_backup: false,
            },
        )
        .unwrap();
        assert_eq!(record["outcome"], "committed");

        let again = run(
            &engine,
            Command::Plan {
                provider: "finops".to_string(),
            },
        )
        .unwrap();
        assert_eq!(again["migration_needed"], false);

        let history = run(&engine, Command::History { provider: None }).unwrap();
        assert_eq!(history.as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_report_and_validate() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), "app_id\nApp1\n");

        let report = run(&engine, Command::Report).unwrap();
        assert_eq!(report["summary"]["untracked"], 1);

        let validation = run(
            &engine,
            Command::Validate {
                provider: "finops".to_string(),
            },
        )
        .unwrap();
        assert_eq!(validation["passed"], false);
    }

    #[test]
    fn test_serve_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), "app_id\nApp1\n");
        assert!(matches!(run(&engine, Command::Serve), Err(Error::Config(_))));
    }
}
