//! Database query functions for the `workers` table.

use sqlx::PgPool;
use uuid::Uuid;

use crate::datastore::{DatastoreError, DatastoreResult};
use crate::models::Worker;

/// Fetch the worker for `(worker_name, provider_type)`, inserting it first
/// if it does not exist yet.
///
/// The no-op `DO UPDATE` makes `RETURNING` yield the existing row on
/// conflict, so concurrent callers all see the same worker.
pub async fn upsert_worker(
    pool: &PgPool,
    worker_name: &str,
    provider_type: &str,
) -> DatastoreResult<Worker> {
    let worker = sqlx::query_as::<_, Worker>(
        "INSERT INTO workers (worker_name, provider_type) VALUES ($1, $2) \
         ON CONFLICT (worker_name, provider_type) \
         DO UPDATE SET worker_name = EXCLUDED.worker_name \
         RETURNING *",
    )
    .bind(worker_name)
    .bind(provider_type)
    .fetch_one(pool)
    .await?;
    Ok(worker)
}

/// Fetch a single worker by ID.
pub async fn get_worker(pool: &PgPool, id: Uuid) -> DatastoreResult<Worker> {
    sqlx::query_as::<_, Worker>("SELECT * FROM workers WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DatastoreError::missing("worker", id))
}
