mod config;
mod review_cmd;
mod status_cmd;

use clap::{Parser, Subcommand};

use crowdrun_core::{MockProvider, ProviderRegistry};
use crowdrun_db::{PgDatastore, pool};

use config::CrowdrunConfig;

#[derive(Parser)]
#[command(name = "crowdrun", about = "Coordinate crowd workers across task runs")]
struct Cli {
    /// Database URL (overrides CROWDRUN_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a crowdrun config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/crowdrun")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create and migrate the crowdrun database
    DbInit,
    /// Show task run progress (omit task_run_id to list all runs)
    Status {
        /// Task run ID to show status for
        task_run_id: Option<String>,
    },
    /// Review completed work
    Review {
        #[command(subcommand)]
        command: ReviewCommands,
    },
    /// Worker management
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },
}

#[derive(Subcommand)]
pub enum ReviewCommands {
    /// Accept an agent's work and pay the worker
    Approve {
        /// Agent ID
        agent_id: String,
    },
    /// Reject an agent's work
    Reject {
        /// Agent ID
        agent_id: String,
        /// Reason shown to the worker (falls back to review.default_reject_reason)
        #[arg(long)]
        reason: Option<String>,
    },
    /// Pay for the work but block the worker from this task
    SoftReject {
        /// Agent ID
        agent_id: String,
    },
}

#[derive(Subcommand)]
pub enum WorkerCommands {
    /// Block a worker with their crowd provider
    Block {
        /// Worker ID
        worker_id: String,
        #[arg(long)]
        reason: String,
    },
    /// Lift a provider block
    Unblock {
        /// Worker ID
        worker_id: String,
        #[arg(long)]
        reason: String,
    },
}

/// Providers this binary can act through.
fn providers() -> ProviderRegistry {
    let mut providers = ProviderRegistry::new();
    providers.register(MockProvider::new());
    providers
}

/// Execute the `crowdrun init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
            max_connections: None,
        },
        review: config::ReviewSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `crowdrun db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `crowdrun db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = CrowdrunConfig::resolve(cli_db_url)?;

    println!("Initializing crowdrun database...");

    let datastore = pool::prepare_datastore(&resolved.db_config).await?;

    let counts = pool::record_counts(datastore.pool()).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    datastore.pool().close().await;

    println!("crowdrun db-init complete.");
    Ok(())
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
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Status { task_run_id } => {
            let resolved = CrowdrunConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let datastore = PgDatastore::new(db_pool.clone());
            let result = status_cmd::run_status(&datastore, task_run_id.as_deref()).await;
            db_pool.close().await;
            result?;
        }
        Commands::Review { command } => {
            let resolved = CrowdrunConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let datastore = PgDatastore::new(db_pool.clone());
            let result = review_cmd::run_review_command(
                command,
                &datastore,
                &providers(),
                resolved.default_reject_reason.as_deref(),
            )
            .await;
            db_pool.close().await;
            result?;
        }
        Commands::Worker { command } => {
            let resolved = CrowdrunConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let datastore = PgDatastore::new(db_pool.clone());
            let result = review_cmd::run_worker_command(command, &datastore, &providers()).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}
