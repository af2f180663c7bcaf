//! Database query functions for the `task_runs` table.

use sqlx::PgPool;
use uuid::Uuid;

use crate::datastore::{DatastoreError, DatastoreResult, NewTaskRun};
use crate::models::TaskRun;

/// Insert a new task run.
pub async fn insert_task_run(pool: &PgPool, new: &NewTaskRun<'_>) -> DatastoreResult<TaskRun> {
    let run = sqlx::query_as::<_, TaskRun>(
        "INSERT INTO task_runs (task_id, task_type, provider_type, args) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(new.task_type)
    .bind(new.provider_type)
    .bind(new.args)
    .fetch_one(pool)
    .await
    .map_err(|e| match e.as_database_error() {
        Some(db) if db.is_foreign_key_violation() => DatastoreError::missing("task", new.task_id),
        _ => DatastoreError::Backend(e),
    })?;
    Ok(run)
}

/// Fetch a single task run by ID.
pub async fn get_task_run(pool: &PgPool, id: Uuid) -> DatastoreResult<TaskRun> {
    sqlx::query_as::<_, TaskRun>("SELECT * FROM task_runs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DatastoreError::missing("task run", id))
}

/// List task runs ordered by creation time.
pub async fn list_task_runs(pool: &PgPool, incomplete_only: bool) -> DatastoreResult<Vec<TaskRun>> {
    let runs = sqlx::query_as::<_, TaskRun>(
        "SELECT * FROM task_runs \
         WHERE ($1 = FALSE OR is_completed = FALSE) \
         ORDER BY created_at ASC",
    )
    .bind(incomplete_only)
    .fetch_all(pool)
    .await?;
    Ok(runs)
}

/// Flag a task run as completed.
pub async fn mark_task_run_completed(pool: &PgPool, id: Uuid) -> DatastoreResult<()> {
    let result = sqlx::query("UPDATE task_runs SET is_completed = TRUE WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DatastoreError::missing("task run", id));
    }
    Ok(())
}
