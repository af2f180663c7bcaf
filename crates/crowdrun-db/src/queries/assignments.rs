//! Database query functions for the `assignments` table.

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::datastore::{DatastoreError, DatastoreResult};
use crate::models::Assignment;

/// Insert a new assignment carrying its task data.
pub async fn insert_assignment(
    pool: &PgPool,
    task_run_id: Uuid,
    data: &Value,
) -> DatastoreResult<Assignment> {
    sqlx::query_as::<_, Assignment>(
        "INSERT INTO assignments (task_run_id, data) VALUES ($1, $2) RETURNING *",
    )
    .bind(task_run_id)
    .bind(data)
    .fetch_one(pool)
    .await
    .map_err(|e| match e.as_database_error() {
        Some(db) if db.is_foreign_key_violation() => {
            DatastoreError::missing("task run", task_run_id)
        }
        _ => DatastoreError::Backend(e),
    })
}

/// Fetch a single assignment by ID.
pub async fn get_assignment(pool: &PgPool, id: Uuid) -> DatastoreResult<Assignment> {
    sqlx::query_as::<_, Assignment>("SELECT * FROM assignments WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DatastoreError::missing("assignment", id))
}

/// List all assignments for a task run, ordered by creation time.
pub async fn list_assignments(pool: &PgPool, task_run_id: Uuid) -> DatastoreResult<Vec<Assignment>> {
    let assignments = sqlx::query_as::<_, Assignment>(
        "SELECT * FROM assignments WHERE task_run_id = $1 ORDER BY created_at ASC, id ASC",
    )
    .bind(task_run_id)
    .fetch_all(pool)
    .await?;
    Ok(assignments)
}
