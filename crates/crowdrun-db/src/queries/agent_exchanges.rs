//! Database query functions for the `agent_exchanges` table.

use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::datastore::{DatastoreError, DatastoreResult};
use crate::models::{AgentExchange, ExchangeDirection};

/// Append one packet to an agent's exchange log.
///
/// The agent may be a task agent or an onboarding agent; an id that is
/// neither is `DoesNotExist`.
pub async fn insert_agent_exchange(
    pool: &PgPool,
    agent_id: Uuid,
    direction: ExchangeDirection,
    packet: &Value,
) -> DatastoreResult<AgentExchange> {
    sqlx::query_as::<_, AgentExchange>(
        "INSERT INTO agent_exchanges (agent_id, direction, packet) \
         SELECT $1, $2, $3 \
         WHERE EXISTS (SELECT 1 FROM agents WHERE id = $1) \
            OR EXISTS (SELECT 1 FROM onboarding_agents WHERE id = $1) \
         RETURNING *",
    )
    .bind(agent_id)
    .bind(direction)
    .bind(packet)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| DatastoreError::missing("agent", agent_id))
}

/// List an agent's exchanges in recording order.
pub async fn list_agent_exchanges(pool: &PgPool, agent_id: Uuid) -> DatastoreResult<Vec<AgentExchange>> {
    let exchanges = sqlx::query_as::<_, AgentExchange>(
        "SELECT * FROM agent_exchanges WHERE agent_id = $1 ORDER BY id ASC",
    )
    .bind(agent_id)
    .fetch_all(pool)
    .await?;
    Ok(exchanges)
}
