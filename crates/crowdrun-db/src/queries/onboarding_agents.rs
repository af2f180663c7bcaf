//! Database query functions for the `onboarding_agents` table.

use sqlx::PgPool;
use uuid::Uuid;

use crate::datastore::{DatastoreError, DatastoreResult};
use crate::models::{AgentStatus, OnboardingAgent};

/// Insert a new onboarding agent in `none` status.
pub async fn insert_onboarding_agent(
    pool: &PgPool,
    worker_id: Uuid,
    task_run_id: Uuid,
) -> DatastoreResult<OnboardingAgent> {
    sqlx::query_as::<_, OnboardingAgent>(
        "INSERT INTO onboarding_agents (worker_id, task_run_id) VALUES ($1, $2) RETURNING *",
    )
    .bind(worker_id)
    .bind(task_run_id)
    .fetch_one(pool)
    .await
    .map_err(|e| match e.as_database_error() {
        Some(db) if db.is_foreign_key_violation() => DatastoreError::missing("worker", worker_id),
        _ => DatastoreError::Backend(e),
    })
}

/// Fetch a single onboarding agent by ID.
pub async fn get_onboarding_agent(pool: &PgPool, id: Uuid) -> DatastoreResult<OnboardingAgent> {
    sqlx::query_as::<_, OnboardingAgent>("SELECT * FROM onboarding_agents WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DatastoreError::missing("onboarding agent", id))
}

/// Set an onboarding agent's status and bump `updated_at`.
pub async fn update_onboarding_agent_status(
    pool: &PgPool,
    id: Uuid,
    status: AgentStatus,
) -> DatastoreResult<()> {
    let result = sqlx::query(
        "UPDATE onboarding_agents SET status = $1, updated_at = NOW() WHERE id = $2",
    )
    .bind(status)
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DatastoreError::missing("onboarding agent", id));
    }
    Ok(())
}
