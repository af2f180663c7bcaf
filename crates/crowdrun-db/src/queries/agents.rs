//! Database query functions for the `agents` table.

use sqlx::PgPool;
use uuid::Uuid;

use crate::datastore::{AgentFilter, DatastoreError, DatastoreResult};
use crate::models::{Agent, AgentStatus, Unit, UnitStatus};

/// Create an agent and bind it to its unit in one transaction.
///
/// The unit row is locked with `FOR UPDATE`; the agent is only inserted if
/// the unit is `launched` and unbound, after which the unit moves to
/// `assigned`.
pub async fn insert_agent_binding_unit(
    pool: &PgPool,
    worker_id: Uuid,
    unit_id: Uuid,
) -> DatastoreResult<Agent> {
    let mut tx = pool.begin().await?;

    let unit = sqlx::query_as::<_, Unit>("SELECT * FROM units WHERE id = $1 FOR UPDATE")
        .bind(unit_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| DatastoreError::missing("unit", unit_id))?;

    if unit.status != UnitStatus::Launched || unit.agent_id.is_some() {
        return Err(DatastoreError::InvalidState(format!(
            "unit {unit_id} is {} and cannot take a new agent",
            unit.status
        )));
    }

    let agent = sqlx::query_as::<_, Agent>(
        "INSERT INTO agents (worker_id, unit_id, assignment_id, task_run_id, provider_type) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(worker_id)
    .bind(unit_id)
    .bind(unit.assignment_id)
    .bind(unit.task_run_id)
    .bind(&unit.provider_type)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| match e.as_database_error() {
        Some(db) if db.is_foreign_key_violation() => DatastoreError::missing("worker", worker_id),
        _ => DatastoreError::Backend(e),
    })?;

    sqlx::query(
        "UPDATE units SET status = 'assigned', agent_id = $1, worker_id = $2 WHERE id = $3",
    )
    .bind(agent.id)
    .bind(worker_id)
    .bind(unit_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(agent)
}

/// Fetch a single agent by ID.
pub async fn get_agent(pool: &PgPool, id: Uuid) -> DatastoreResult<Agent> {
    sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| DatastoreError::missing("agent", id))
}

/// Set an agent's status and bump `updated_at`.
pub async fn update_agent_status(pool: &PgPool, id: Uuid, status: AgentStatus) -> DatastoreResult<()> {
    let result = sqlx::query("UPDATE agents SET status = $1, updated_at = NOW() WHERE id = $2")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(DatastoreError::missing("agent", id));
    }
    Ok(())
}

/// Set an agent's status only if it is currently `from`. Returns the
/// number of rows changed.
pub async fn transition_agent_status(
    pool: &PgPool,
    id: Uuid,
    from: AgentStatus,
    to: AgentStatus,
) -> DatastoreResult<u64> {
    let result = sqlx::query(
        "UPDATE agents SET status = $1, updated_at = NOW() WHERE id = $2 AND status = $3",
    )
    .bind(to)
    .bind(id)
    .bind(from)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// List agents matching the filter, ordered by creation time.
pub async fn list_agents(pool: &PgPool, filter: &AgentFilter) -> DatastoreResult<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>(
        "SELECT * FROM agents \
         WHERE ($1::uuid IS NULL OR task_run_id = $1) \
           AND ($2::uuid IS NULL OR assignment_id = $2) \
           AND ($3::uuid IS NULL OR unit_id = $3) \
           AND ($4::uuid IS NULL OR worker_id = $4) \
         ORDER BY created_at ASC",
    )
    .bind(filter.task_run_id)
    .bind(filter.assignment_id)
    .bind(filter.unit_id)
    .bind(filter.worker_id)
    .fetch_all(pool)
    .await?;
    Ok(agents)
}
