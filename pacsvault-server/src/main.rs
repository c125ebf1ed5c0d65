//! # pacsvault server
//!
//! One archive node. It runs two dispatchers against the shared store:
//!
//! - **Maintenance**: scheduled service-lock entries such as filesystem
//!   reinventory and manifest rebuilds.
//! - **Ingestion**: study-process work items that merge received objects into
//!   their studies.
//!
//! Several nodes may share one database; each must carry its own
//! `--processor-id` so startup recovery only clears its own locks.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pacsvault_core::alerts::{AlertSink, TracingAlertSink};
use pacsvault_core::codec::{JsonSopCodec, SopCodec};
use pacsvault_core::database::{PacsStore, PostgresStore};
use pacsvault_core::rules::{NoopRulesEngine, RulesEngine};
use pacsvault_core::service_lock::{
    MaintenanceContext, ServiceLockProcessor, ServiceLockQueue, maintenance_registry,
};
use pacsvault_core::work_queue::{
    IngestionContext, WorkQueueDispatcher, WorkQueueQueue, work_queue_registry,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{ConfigSource, ServerConfig};

/// Extra grace on top of the dispatchers' own drain timeout.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "pacsvault-server")]
#[command(about = "Image archive node: study ingestion and filesystem maintenance")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Postgres connection string (overrides config)
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Path to a TOML or JSON config file
    #[arg(long, env = "PACSVAULT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Identity stamped on locked rows; must be stable per node
    #[arg(long, env = "PACSVAULT_PROCESSOR_ID", global = true)]
    processor_id: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run both dispatchers until interrupted (default)
    Run,
    /// Apply database migrations and exit
    Migrate,
    /// Print the effective configuration as TOML and exit
    PrintConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Override via RUST_LOG.
                "info,pacsvault::dispatch=info,pacsvault::pool=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (mut config, source) =
        ServerConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(processor_id) = cli.processor_id.clone() {
        config.core = config.core.with_processor_id(processor_id);
    }
    match &source {
        ConfigSource::File(path) => info!(path = %path.display(), "config loaded from file"),
        ConfigSource::EnvInline => info!("config loaded from inline environment json"),
        ConfigSource::Defaults => info!("no config found; using defaults"),
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::PrintConfig => {
            let rendered =
                toml::to_string_pretty(&config).context("failed to render configuration")?;
            println!("{rendered}");
            Ok(())
        }
        Command::Migrate => {
            let store = connect(&config, cli.database_url.as_deref()).await?;
            store
                .initialize_schema()
                .await
                .context("database migration failed")?;
            info!("database migrations applied");
            Ok(())
        }
        Command::Run => run(config, cli.database_url.as_deref()).await,
    }
}

async fn connect(config: &ServerConfig, override_url: Option<&str>) -> anyhow::Result<PostgresStore> {
    let url = config.database_url(override_url)?;
    PostgresStore::connect(&url, config.database.max_connections)
        .await
        .context("failed to connect to PostgreSQL")
}

async fn run(config: ServerConfig, override_url: Option<&str>) -> anyhow::Result<()> {
    let postgres = connect(&config, override_url).await?;
    postgres
        .initialize_schema()
        .await
        .context("database migration failed")?;

    let store: Arc<dyn PacsStore> = Arc::new(postgres);
    let alerts: Arc<dyn AlertSink> = Arc::new(TracingAlertSink);
    let codec: Arc<dyn SopCodec> = Arc::new(JsonSopCodec);
    let rules: Arc<dyn RulesEngine> = Arc::new(NoopRulesEngine);
    let core = config.core;

    let maintenance = Arc::new(ServiceLockProcessor::new(
        Arc::new(ServiceLockQueue::new(
            store.clone(),
            core.service_lock.failure_reschedule(),
        )),
        maintenance_registry(MaintenanceContext {
            store: store.clone(),
            alerts: alerts.clone(),
            codec: codec.clone(),
            maintenance: core.maintenance.clone(),
            study_process: core.study_process.clone(),
        }),
        alerts.clone(),
        core.service_lock.clone(),
    ));

    let ingestion = Arc::new(WorkQueueDispatcher::new(
        Arc::new(WorkQueueQueue::new(store.clone(), core.study_process.clone())),
        work_queue_registry(IngestionContext {
            store: store.clone(),
            alerts: alerts.clone(),
            codec,
            rules,
            config: core.study_process.clone(),
        }),
        alerts,
        core.work_queue.clone(),
    ));

    info!(
        processor_id = %core.work_queue.processor_id,
        maintenance_concurrency = core.service_lock.concurrency,
        ingestion_concurrency = core.work_queue.concurrency,
        "starting dispatchers"
    );

    let maintenance_task = {
        let dispatcher = maintenance.clone();
        tokio::spawn(async move { dispatcher.run().await })
    };
    let ingestion_task = {
        let dispatcher = ingestion.clone();
        tokio::spawn(async move { dispatcher.run().await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested; draining dispatchers");
    maintenance.request_stop();
    ingestion.request_stop();

    let drain = core
        .service_lock
        .drain_timeout()
        .max(core.work_queue.drain_timeout())
        .unwrap_or_default()
        + SHUTDOWN_GRACE;
    let joined = tokio::time::timeout(drain, async {
        let (maintenance, ingestion) = tokio::join!(maintenance_task, ingestion_task);
        for (name, result) in [("maintenance", maintenance), ("ingestion", ingestion)] {
            if let Err(err) = result {
                error!(dispatcher = name, error = %err, "dispatcher task ended abnormally");
            }
        }
    })
    .await;
    if joined.is_err() {
        warn!("dispatchers did not stop in time; exiting with work in flight");
    }

    info!("pacsvault server stopped");
    Ok(())
}
