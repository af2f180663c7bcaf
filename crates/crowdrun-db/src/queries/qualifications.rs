//! Database query functions for the `qualifications` and
//! `granted_qualifications` tables.

use sqlx::PgPool;
use uuid::Uuid;

use super::on_unique_violation;
use crate::datastore::{DatastoreError, DatastoreResult};
use crate::models::{GrantedQualification, Qualification};

/// Insert a new qualification. Names are unique.
pub async fn insert_qualification(pool: &PgPool, name: &str) -> DatastoreResult<Qualification> {
    sqlx::query_as::<_, Qualification>(
        "INSERT INTO qualifications (name) VALUES ($1) RETURNING *",
    )
    .bind(name)
    .fetch_one(pool)
    .await
    .map_err(|e| on_unique_violation(e, "qualification", name))
}

/// Look a qualification up by name.
pub async fn find_qualification(pool: &PgPool, name: &str) -> DatastoreResult<Option<Qualification>> {
    let qualification =
        sqlx::query_as::<_, Qualification>("SELECT * FROM qualifications WHERE name = $1")
            .bind(name)
            .fetch_optional(pool)
            .await?;
    Ok(qualification)
}

/// Grant a qualification value, overwriting any previous grant.
pub async fn upsert_granted_qualification(
    pool: &PgPool,
    worker_id: Uuid,
    qualification_id: Uuid,
    value: i32,
) -> DatastoreResult<GrantedQualification> {
    sqlx::query_as::<_, GrantedQualification>(
        "INSERT INTO granted_qualifications (worker_id, qualification_id, value) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (worker_id, qualification_id) \
         DO UPDATE SET value = EXCLUDED.value, granted_at = NOW() \
         RETURNING *",
    )
    .bind(worker_id)
    .bind(qualification_id)
    .bind(value)
    .fetch_one(pool)
    .await
    .map_err(|e| match e.as_database_error() {
        Some(db) if db.is_foreign_key_violation() => {
            DatastoreError::missing("qualification", qualification_id)
        }
        _ => DatastoreError::Backend(e),
    })
}

/// Remove a granted qualification. Idempotent.
pub async fn delete_granted_qualification(
    pool: &PgPool,
    worker_id: Uuid,
    qualification_id: Uuid,
) -> DatastoreResult<()> {
    sqlx::query(
        "DELETE FROM granted_qualifications WHERE worker_id = $1 AND qualification_id = $2",
    )
    .bind(worker_id)
    .bind(qualification_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fetch one worker's grant of one qualification.
pub async fn get_granted_qualification(
    pool: &PgPool,
    worker_id: Uuid,
    qualification_id: Uuid,
) -> DatastoreResult<Option<GrantedQualification>> {
    let granted = sqlx::query_as::<_, GrantedQualification>(
        "SELECT * FROM granted_qualifications WHERE worker_id = $1 AND qualification_id = $2",
    )
    .bind(worker_id)
    .bind(qualification_id)
    .fetch_optional(pool)
    .await?;
    Ok(granted)
}
