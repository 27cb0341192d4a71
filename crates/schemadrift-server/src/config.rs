//! Server configuration.

use clap::{Parser, Subcommand};
use schemadrift_core::EngineConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Default reconciliation interval in seconds (5 minutes).
pub const DEFAULT_INTERVAL_SECS: u64 = 300;

/// Default number of rows sampled per provider.
pub const DEFAULT_SAMPLE_ROWS: usize = 1000;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path to the schema store directory.
    pub data_path: PathBuf,

    /// Provider files as `(provider_id, path)`.
    pub providers: Vec<(String, PathBuf)>,

    /// Interval between reconciliation passes.
    pub interval: Duration,

    /// Maximum rows sampled per provider.
    pub sample_rows: usize,

    /// Whether safe plans are executed by reconciliation.
    pub auto_execute: bool,
}

impl ServerConfig {
    /// Create a configuration with the given data path.
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
            providers: Vec::new(),
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            sample_rows: DEFAULT_SAMPLE_ROWS,
            auto_execute: true,
        }
    }

    /// Register a provider file.
    pub fn with_provider(mut self, id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.providers.push((id.into(), path.into()));
        self
    }

    /// Set the reconciliation interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Engine settings derived from this configuration.
    pub fn engine_config(&self) -> EngineConfig {
        let config = EngineConfig::default()
            .with_sample_cap(self.sample_rows)
            .with_scheduler_interval(self.interval);
        if self.auto_execute {
            config
        } else {
            config.without_auto_execute()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("./data")
    }
}

/// Parse a `id=path` provider argument.
pub fn parse_provider(value: &str) -> Result<(String, PathBuf), String> {
    let (id, path) = value
        .split_once('=')
        .ok_or_else(|| format!("expected ID=PATH, got '{value}'"))?;
    let id = id.trim();
    let path = path.trim();
    if id.is_empty() || path.is_empty() {
        return Err(format!("expected ID=PATH, got '{value}'"));
    }
    Ok((id.to_string(), PathBuf::from(path)))
}

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "schemadrift-server")]
#[command(version, about = "Schema drift detection and migration for CSV providers", long_about = None)]
pub struct Args {
    /// Path to the schema store directory.
    #[arg(short, long, default_value = "./data")]
    pub data_path: PathBuf,

    /// Provider file as ID=PATH. Repeatable.
    #[arg(short, long = "provider", value_name = "ID=PATH", value_parser = parse_provider)]
    pub providers: Vec<(String, PathBuf)>,

    /// Reconciliation interval in seconds.
    #[arg(long, default_value_t = DEFAULT_INTERVAL_SECS)]
    pub interval: u64,

    /// Maximum rows sampled per provider.
    #[arg(long, default_value_t = DEFAULT_SAMPLE_ROWS)]
    pub sample_rows: usize,

    /// Leave safe plans pending instead of executing them.
    #[arg(long)]
    pub no_auto_execute: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Operations exposed on the command line. Defaults to `serve`.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the reconciliation loop until interrupted.
    Serve,
    /// Print the drift status of every provider.
    Report,
    /// Validate one provider against its cached schema.
    Validate { provider: String },
    /// List plans awaiting execution.
    Plans,
    /// Detect drift for a provider and print the plan.
    Plan { provider: String },
    /// Approve a pending plan.
    Approve { plan_id: String },
    /// Execute a provider's pending plan, or a specific plan with --plan-id.
    Execute {
        /// Provider whose pending plan to execute.
        #[arg(required_unless_present = "plan_id")]
        provider: Option<String>,

        /// Execute this plan instead.
        #[arg(long, conflicts_with = "provider")]
        plan_id: Option<String>,

        /// Skip the persisted backup.
        #[arg(long)]
        no_backup: bool,
    },
    /// Print the audit history of a provider, or of all providers.
    History { provider: Option<String> },
}

impl Args {
    /// Split into server configuration and the command to run.
    pub fn into_config(self) -> (ServerConfig, Command) {
        let config = ServerConfig {
            data_path: self.data_path,
            providers: self.providers,
            interval: Duration::from_secs(self.interval.max(1)),
            sample_rows: self.sample_rows.max(1),
            auto_execute: !self.no_auto_execute,
        };
        (config, self.command.unwrap_or(Command::Serve))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.data_path, PathBuf::from("./data"));
        assert!(config.providers.is_empty());
        assert!(config.auto_execute);
        assert_eq!(config.interval, Duration::from_secs(DEFAULT_INTERVAL_SECS));
    }

    #[test]
    fn test_parse_provider() {
        assert_eq!(
            parse_provider("finops=data/finops.csv").unwrap(),
            ("finops".to_string(), PathBuf::from("data/finops.csv"))
        );
        assert!(parse_provider("finops").is_err());
        assert!(parse_provider("=x.csv").is_err());
    }

    #[test]
    fn test_args_into_config() {
        let args = Args::parse_from([
            "schemadrift-server",
            "--data-path",
            "/var/lib/schemadrift",
            "--provider",
            "finops=finops.csv",
            "-p",
            "observability=obs.csv",
            "--interval",
            "60",
            "--no-auto-execute",
            "validate",
            "finops",
        ]);
        let (config, command) = args.into_config();

        assert_eq!(config.data_path, PathBuf::from("/var/lib/schemadrift"));
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.interval, Duration::from_secs(60));
        assert!(!config.engine_config().auto_execute);
        assert_eq!(
            command,
            Command::Validate {
                provider: "finops".to_string()
            }
        );
    }

    #[test]
    fn test_default_command_is_serve() {
        let (_, command) = Args::parse_from(["schemadrift-server"]).into_config();
        assert_eq!(command, Command::Serve);
    }

    #[test]
    fn test_execute_by_plan_id() {
        let (_, command) =
            Args::parse_from(["schemadrift-server", "execute", "--plan-id", "abc", "--no-backup"])
                .into_config();
        assert_eq!(
            command,
            Command::Execute {
                provider: None,
                plan_id: Some("abc".to_string()),
                no_backup: true,
            }
        );
    }
}
