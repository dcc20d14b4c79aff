//! `flowdeck` CLI entry-point.
//!
//! Sub-commands:
//! - `serve`: start the API server and the cron scheduler.
//! - `migrate`: run pending database migrations.
//! - `validate`: compile a flow JSON file and print its execution order.
//! - `tick`: run one scheduler tick and exit.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use engine::{compile, Engine, EngineConfig, FlowDefinition, TaskEngine};

#[derive(Parser)]
#[command(name = "flowdeck", about = "Workflow orchestration with human-in-the-loop steps", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct DbArgs {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://flowdeck.db?mode=rwc")]
    database_url: String,
    #[arg(long, default_value_t = 5)]
    max_connections: u32,
}

#[derive(Subcommand)]
enum Command {
    /// Start the REST API server.
    Serve {
        #[command(flatten)]
        db: DbArgs,
        #[arg(long, env = "FLOWDECK_BIND", default_value = "0.0.0.0:8080")]
        bind: SocketAddr,
        /// Seconds between scheduler ticks.
        #[arg(long, env = "FLOWDECK_TICK_SECS", default_value_t = 60)]
        tick_secs: u64,
        /// Do not start the cron scheduler.
        #[arg(long)]
        no_scheduler: bool,
    },
    /// Run pending database migrations.
    Migrate {
        #[command(flatten)]
        db: DbArgs,
    },
    /// Validate a flow definition JSON file (`{"nodes": [...], "edges": [...]}`).
    Validate {
        path: PathBuf,
    },
    /// Start every cron flow due in the current minute, then exit.
    Tick {
        #[command(flatten)]
        db: DbArgs,
    },
}

async fn connect(db: &DbArgs) -> Result<db::DbPool> {
    let pool = db::pool::create_pool(&db.database_url, db.max_connections)
        .await
        .with_context(|| format!("cannot open database {}", db.database_url))?;
    db::pool::run_migrations(&pool).await.context("migration failed")?;
    Ok(pool)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Serve { db, bind, tick_secs, no_scheduler } => {
            let pool = connect(&db).await?;
            let config = EngineConfig { tick_interval: Duration::from_secs(tick_secs.max(1)), ..EngineConfig::default() };
            let engine = Engine::with_tasks(TaskEngine::builder(pool).config(config).build());

            if no_scheduler {
                info!("cron scheduler disabled");
            } else {
                engine.scheduler().spawn();
            }
            api::serve(bind, api::AppState::new(engine)).await.context("server error")?;
        }
        Command::Migrate { db } => {
            connect(&db).await?;
            info!("migrations applied");
        }
        Command::Validate { path } => {
            let content =
                std::fs::read_to_string(&path).with_context(|| format!("cannot read {}", path.display()))?;
            let doc: serde_json::Value = serde_json::from_str(&content).context("invalid JSON")?;
            let definition = FlowDefinition::from_json(&doc["nodes"], &doc["edges"])?;
            match compile(&definition) {
                Ok(dag) => {
                    let order: Vec<&str> = dag.topological_order().collect();
                    println!("flow is valid; execution order: {}", order.join(" -> "));
                }
                Err(e) => {
                    eprintln!("validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Command::Tick { db } => {
            let engine = Engine::new(connect(&db).await?);
            let started = engine.scheduler().tick().await?;
            println!("{} task(s) started", started.len());
        }
    }
    Ok(())
}
