mod adapters;
mod config;
mod serve_cmd;
mod status_cmd;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use jobmux_core::coordinator::{Coordinator, CoordinatorConfig};
use jobmux_core::notifier::{Channel, LogChannel};
use jobmux_core::registry::Registry;
use jobmux_core::scheduler::SchedulerConfig;
use jobmux_core::syncbus::{SyncBus, SyncBusConfig};
use jobmux_db::pool;

use config::AppConfig;
use status_cmd::StatusOutcome;

#[derive(Parser)]
#[command(name = "jobmux", about = "Multi-platform job search orchestration core")]
struct Cli {
    /// Database URL (overrides JOBMUX_DATABASE_URL env var / jobmux.toml)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP submission API and the WebSocket live event channel
    Serve {
        /// Bind address (overrides JOBMUX_API_BIND env var / jobmux.toml)
        #[arg(long)]
        bind: Option<String>,
        /// Bind port (overrides JOBMUX_API_PORT env var / jobmux.toml)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Create the database (if missing) and run migrations
    DbInit,
    /// Show a single job's status and per-platform task progress
    Status {
        /// Job ID to show status for
        job_id: String,
    },
}

/// Execute `jobmux db-init`: create database and run migrations.
async fn cmd_db_init(resolved: &AppConfig) -> anyhow::Result<()> {
    println!("Initializing jobmux database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;

    let migrations_path = pool::default_migrations_path();
    pool::run_migrations(&db_pool, migrations_path).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("jobmux db-init complete.");
    Ok(())
}

/// Execute `jobmux serve`: build a Coordinator over the real database and
/// run the HTTP + WebSocket surface until interrupted.
async fn cmd_serve(resolved: &AppConfig) -> anyhow::Result<()> {
    let db_pool = pool::create_pool(&resolved.db_config).await?;

    let registry = Arc::new(Registry::default_catalog());
    let adapters = Arc::new(adapters::build_placeholder_registry(&registry));

    let mut channels: HashMap<String, Box<dyn Channel>> = HashMap::new();
    channels.insert("log".to_string(), Box::new(LogChannel));

    let (sync_bus, sync_bus_handle) = SyncBus::new(SyncBusConfig::default());
    tokio::spawn(sync_bus.run());

    let coordinator = Arc::new(Coordinator::new(
        db_pool.clone(),
        Arc::clone(&registry),
        adapters,
        SchedulerConfig::default(),
        channels,
        CoordinatorConfig::default(),
        Some(sync_bus_handle),
        64,
    ));

    let result = serve_cmd::run_serve(coordinator, &resolved.api_bind, resolved.api_port).await;
    db_pool.close().await;
    result
}

/// Execute `jobmux status <job_id>`.
async fn cmd_status(resolved: &AppConfig, job_id: &str) -> anyhow::Result<StatusOutcome> {
    let id = uuid::Uuid::parse_str(job_id).with_context(|| format!("invalid job ID: {job_id}"))?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    let result = status_cmd::run_status(&db_pool, id).await;
    db_pool.close().await;
    result
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { bind, port } => {
            let resolved = match AppConfig::resolve(
                cli.database_url.as_deref(),
                bind.as_deref(),
                port,
            ) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("{e:#}");
                    std::process::exit(1);
                }
            };
            if let Err(e) = cmd_serve(&resolved).await {
                eprintln!("{e:#}");
                std::process::exit(2);
            }
        }
        Commands::DbInit => {
            let resolved = match AppConfig::resolve(cli.database_url.as_deref(), None, None) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("{e:#}");
                    std::process::exit(1);
                }
            };
            if let Err(e) = cmd_db_init(&resolved).await {
                eprintln!("{e:#}");
                std::process::exit(2);
            }
        }
        Commands::Status { job_id } => {
            let resolved = match AppConfig::resolve(cli.database_url.as_deref(), None, None) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("{e:#}");
                    std::process::exit(1);
                }
            };
            match cmd_status(&resolved, &job_id).await {
                Ok(StatusOutcome::Completed) => {}
                Ok(StatusOutcome::InProgress) => {}
                Ok(StatusOutcome::Failed) => std::process::exit(3),
                Err(e) => {
                    eprintln!("{e:#}");
                    let code = if e.downcast_ref::<uuid::Error>().is_some() {
                        1
                    } else {
                        2
                    };
                    std::process::exit(code);
                }
            }
        }
    }

    Ok(())
}
