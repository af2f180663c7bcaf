//! Database query functions for the `unit_reservations` table.
//!
//! A reservation row is a short-lived insert-or-fail marker; the primary key
//! on `(task_run_id, unit_id)` decides registration races.

use sqlx::PgPool;
use uuid::Uuid;

use crate::datastore::DatastoreResult;

/// Try to insert the reservation marker. Returns the rows inserted (0 when
/// another registration already holds it).
pub async fn insert_reservation(
    pool: &PgPool,
    task_run_id: Uuid,
    unit_id: Uuid,
) -> DatastoreResult<u64> {
    let result = sqlx::query(
        "INSERT INTO unit_reservations (task_run_id, unit_id) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(task_run_id)
    .bind(unit_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Remove a reservation marker. Idempotent.
pub async fn delete_reservation(pool: &PgPool, task_run_id: Uuid, unit_id: Uuid) -> DatastoreResult<()> {
    sqlx::query("DELETE FROM unit_reservations WHERE task_run_id = $1 AND unit_id = $2")
        .bind(task_run_id)
        .bind(unit_id)
        .execute(pool)
        .await?;
    Ok(())
}
