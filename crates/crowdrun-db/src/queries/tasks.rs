//! Database query functions for the `tasks` table.

use sqlx::PgPool;
use uuid::Uuid;

use super::on_unique_violation;
use crate::datastore::{DatastoreError, DatastoreResult};
use crate::models::Task;

/// Insert a new task. Task names are unique.
pub async fn insert_task(pool: &PgPool, name: &str, task_type: &str) -> DatastoreResult<Task> {
    sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (name, task_type) VALUES ($1, $2) RETURNING *",
    )
    .bind(name)
    .bind(task_type)
    .fetch_one(pool)
    .await
    .map_err(|e| on_unique_violation(e, "task", name))
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> DatastoreResult<Task> {
    sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DatastoreError::missing("task", id))
}

/// Look a task up by its unique name.
pub async fn find_task_by_name(pool: &PgPool, name: &str) -> DatastoreResult<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(task)
}
