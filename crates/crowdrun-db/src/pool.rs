use std::time::Duration;

use anyhow::{Context, Result, bail};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::info;

use crate::config::DbConfig;
use crate::postgres::PgDatastore;

/// Migrations embedded at compile time from `crates/crowdrun-db/migrations/`.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

/// Every crowdrun table, parents before children.
pub const TABLES: [&str; 11] = [
    "tasks",
    "task_runs",
    "assignments",
    "workers",
    "units",
    "agents",
    "onboarding_agents",
    "qualifications",
    "granted_qualifications",
    "unit_reservations",
    "agent_exchanges",
];

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Create a connection pool sized by `config`.
pub async fn create_pool(config: &DbConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(&config.database_url)
        .await
        .with_context(|| format!("failed to connect to database at {}", config.database_url))
}

/// Run all pending embedded migrations against the pool.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .context("failed to run database migrations")?;
    info!("migrations applied");
    Ok(())
}

/// Create the database if needed, migrate it and return a ready datastore.
pub async fn prepare_datastore(config: &DbConfig) -> Result<PgDatastore> {
    ensure_database_exists(config).await?;
    let pool = create_pool(config).await?;
    run_migrations(&pool).await?;
    Ok(PgDatastore::new(pool))
}

/// Create the configured database through the maintenance database if it
/// does not exist yet.
pub async fn ensure_database_exists(config: &DbConfig) -> Result<()> {
    let Some(db_name) = config.database_name() else {
        bail!("no database name in {}", config.database_url);
    };
    // CREATE DATABASE cannot take a bind parameter.
    if !db_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("database name {db_name:?} contains invalid characters");
    }

    let maintenance_url = config.maintenance_url();
    let maint = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect(&maintenance_url)
        .await
        .with_context(|| format!("failed to connect to maintenance database at {maintenance_url}"))?;

    let result = async {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
                .bind(db_name)
                .fetch_one(&maint)
                .await
                .context("failed to query pg_database")?;
        if !exists {
            maint
                .execute(format!("CREATE DATABASE {db_name}").as_str())
                .await
                .with_context(|| format!("failed to create database {db_name}"))?;
        }
        info!(db = db_name, created = !exists, "database ready");
        Ok::<_, anyhow::Error>(())
    }
    .await;
    maint.close().await;
    result
}

/// Row count of every crowdrun table, in [`TABLES`] order.
pub async fn record_counts(pool: &PgPool) -> Result<Vec<(&'static str, i64)>> {
    let mut counts = Vec::with_capacity(TABLES.len());
    for table in TABLES {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(pool)
            .await
            .with_context(|| format!("failed to count rows in {table}"))?;
        counts.push((table, count));
    }
    Ok(counts)
}
