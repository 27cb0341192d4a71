//! schemadrift server - drift detection daemon and CLI.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use schemadrift_core::{Scheduler, SchemaEngine};
use schemadrift_server::{commands, Args, Command, CsvSampleSource};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "schemadrift_server=info,schemadrift_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let (config, command) = Args::parse().into_config();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_path = %config.data_path.display(),
        providers = config.providers.len(),
        interval_secs = config.interval.as_secs(),
        "configuration loaded"
    );

    let source = Arc::new(CsvSampleSource::new(config.providers.clone()));
    let engine = Arc::new(SchemaEngine::open(
        &config.data_path,
        source,
        config.engine_config(),
    )?);

    if command != Command::Serve {
        let engine = Arc::clone(&engine);
        let output = tokio::task::spawn_blocking(move || commands::run(&engine, command)).await??;
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let handle = Scheduler::new(Arc::clone(&engine)).start();
    tracing::info!("scheduler running, press ctrl+c to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl+c");
    } else {
        tracing::info!("received shutdown signal");
    }

    handle.shutdown().await;
    engine.flush()?;
    tracing::info!("shutdown complete");
    Ok(())
}
