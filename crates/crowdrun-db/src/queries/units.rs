//! Database query functions for the `units` table.

use sqlx::PgPool;
use uuid::Uuid;

use super::on_unique_violation;
use crate::datastore::{DatastoreError, DatastoreResult, NewUnit};
use crate::models::{Unit, UnitStatus};

/// Insert a new unit in `created` status.
///
/// `(assignment_id, unit_index)` is unique.
pub async fn insert_unit(pool: &PgPool, new: &NewUnit<'_>) -> DatastoreResult<Unit> {
    sqlx::query_as::<_, Unit>(
        "INSERT INTO units (assignment_id, task_run_id, unit_index, provider_type) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(new.assignment_id)
    .bind(new.task_run_id)
    .bind(new.unit_index)
    .bind(new.provider_type)
    .fetch_one(pool)
    .await
    .map_err(|e| {
        on_unique_violation(e, "unit", format!("{}#{}", new.assignment_id, new.unit_index))
    })
}

/// Fetch a single unit by ID.
pub async fn get_unit(pool: &PgPool, id: Uuid) -> DatastoreResult<Unit> {
    sqlx::query_as::<_, Unit>("SELECT * FROM units WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DatastoreError::missing("unit", id))
}

/// List an assignment's units ordered by index.
pub async fn list_units_for_assignment(
    pool: &PgPool,
    assignment_id: Uuid,
) -> DatastoreResult<Vec<Unit>> {
    let units = sqlx::query_as::<_, Unit>(
        "SELECT * FROM units WHERE assignment_id = $1 ORDER BY unit_index ASC",
    )
    .bind(assignment_id)
    .fetch_all(pool)
    .await?;
    Ok(units)
}

/// List a task run's units, optionally restricted to one status.
pub async fn list_units_for_task_run(
    pool: &PgPool,
    task_run_id: Uuid,
    status: Option<UnitStatus>,
) -> DatastoreResult<Vec<Unit>> {
    let units = sqlx::query_as::<_, Unit>(
        "SELECT * FROM units \
         WHERE task_run_id = $1 AND ($2::text IS NULL OR status = $2) \
         ORDER BY created_at ASC, unit_index ASC",
    )
    .bind(task_run_id)
    .bind(status)
    .fetch_all(pool)
    .await?;
    Ok(units)
}

/// Atomically move a unit from one status to another.
///
/// The WHERE clause includes `status = $from`; returns the number of rows
/// affected (0 means the status did not match).
pub async fn transition_unit_status(
    pool: &PgPool,
    unit_id: Uuid,
    from: UnitStatus,
    to: UnitStatus,
) -> DatastoreResult<u64> {
    let result = sqlx::query("UPDATE units SET status = $1 WHERE id = $2 AND status = $3")
        .bind(to)
        .bind(unit_id)
        .bind(from)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Set a unit's status unconditionally.
pub async fn update_unit_status(
    pool: &PgPool,
    unit_id: Uuid,
    status: UnitStatus,
) -> DatastoreResult<()> {
    let result = sqlx::query("UPDATE units SET status = $1 WHERE id = $2")
        .bind(status)
        .bind(unit_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DatastoreError::missing("unit", unit_id));
    }
    Ok(())
}

/// Clear a unit's agent binding and put it back to `launched`, only if it
/// is still bound to `agent_id`.
pub async fn release_unit(pool: &PgPool, unit_id: Uuid, agent_id: Uuid) -> DatastoreResult<u64> {
    let result = sqlx::query(
        "UPDATE units \
         SET status = 'launched', agent_id = NULL, worker_id = NULL \
         WHERE id = $1 AND agent_id = $2",
    )
    .bind(unit_id)
    .bind(agent_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
