//! Post-hoc review of completed work, and worker blocking.
//!
//! Review only applies to agents in `completed`; it moves the agent onto
//! the review axis and the unit to the matching final status.

use anyhow::{Context, Result};
use tracing::{info, warn};
use uuid::Uuid;

use crowdrun_db::Datastore;
use crowdrun_db::models::{Agent as AgentRecord, AgentStatus, UnitStatus, Worker};

use crate::error::AgentError;
use crate::provider::CrowdProvider;
use crate::qualifications;

/// Move a completed agent onto the review axis.
///
/// The status change is conditional on `completed`, so of two concurrent
/// reviews only one gets past this point; the other sees the winner's
/// status.
async fn claim_review(
    datastore: &dyn Datastore,
    agent_id: Uuid,
    outcome: AgentStatus,
    operation: &'static str,
) -> Result<AgentRecord> {
    let claimed = datastore
        .transition_agent_status(agent_id, AgentStatus::Completed, outcome)
        .await
        .with_context(|| format!("failed to record review status of agent {agent_id}"))?;
    let agent = datastore
        .get_agent(agent_id)
        .await
        .with_context(|| format!("failed to load agent {agent_id}"))?;
    if !claimed {
        return Err(AgentError::InvalidStatus {
            agent_id,
            operation,
            status: agent.status,
        }
        .into());
    }
    Ok(agent)
}

/// Put a claimed agent back to `completed` after the provider refused.
async fn release_review(datastore: &dyn Datastore, agent: &AgentRecord) {
    if let Err(e) = datastore
        .transition_agent_status(agent.id, agent.status, AgentStatus::Completed)
        .await
    {
        warn!(agent_id = %agent.id, error = %e, "failed to undo review status");
    }
}

async fn finish_review(
    datastore: &dyn Datastore,
    agent: &AgentRecord,
    unit_status: UnitStatus,
) -> Result<()> {
    datastore
        .update_unit_status(agent.unit_id, unit_status)
        .await
        .context("failed to record unit review status")?;
    info!(
        agent_id = %agent.id,
        unit_id = %agent.unit_id,
        review = %agent.status,
        "work reviewed"
    );
    Ok(())
}

/// Accept the agent's work and pay through the provider.
pub async fn approve_work(
    datastore: &dyn Datastore,
    provider: &dyn CrowdProvider,
    agent_id: Uuid,
) -> Result<AgentRecord> {
    let agent = claim_review(datastore, agent_id, AgentStatus::Approved, "approve work").await?;
    if let Err(e) = provider.approve_work(&agent).await {
        release_review(datastore, &agent).await;
        return Err(e.context(format!("provider failed to approve agent {agent_id}")));
    }
    finish_review(datastore, &agent, UnitStatus::Accepted).await?;
    Ok(agent)
}

/// Reject the agent's work through the provider.
pub async fn reject_work(
    datastore: &dyn Datastore,
    provider: &dyn CrowdProvider,
    agent_id: Uuid,
    reason: &str,
) -> Result<AgentRecord> {
    let agent = claim_review(datastore, agent_id, AgentStatus::Rejected, "reject work").await?;
    if let Err(e) = provider.reject_work(&agent, reason).await {
        release_review(datastore, &agent).await;
        return Err(e.context(format!("provider failed to reject agent {agent_id}")));
    }
    finish_review(datastore, &agent, UnitStatus::Rejected).await?;
    Ok(agent)
}

/// Pay for the work but keep the worker away from future units: the work
/// is approved with the provider and the worker is granted
/// `block_qualification` when one is given.
pub async fn soft_reject_work(
    datastore: &dyn Datastore,
    provider: &dyn CrowdProvider,
    agent_id: Uuid,
    block_qualification: Option<&str>,
) -> Result<AgentRecord> {
    let agent = claim_review(
        datastore,
        agent_id,
        AgentStatus::SoftRejected,
        "soft-reject work",
    )
    .await?;
    if let Err(e) = provider.approve_work(&agent).await {
        release_review(datastore, &agent).await;
        return Err(e.context(format!("provider failed to pay soft-rejected agent {agent_id}")));
    }
    finish_review(datastore, &agent, UnitStatus::SoftRejected).await?;
    if let Some(name) = block_qualification {
        qualifications::grant_qualification(datastore, agent.worker_id, name, 1)
            .await
            .with_context(|| format!("failed to grant block qualification {name}"))?;
    }
    Ok(agent)
}

/// Block a worker with the provider.
pub async fn block_worker(
    datastore: &dyn Datastore,
    provider: &dyn CrowdProvider,
    worker_id: Uuid,
    reason: &str,
) -> Result<Worker> {
    let worker = datastore
        .get_worker(worker_id)
        .await
        .with_context(|| format!("failed to load worker {worker_id}"))?;
    provider.block_worker(&worker, reason).await?;
    info!(worker_id = %worker_id, reason, "worker blocked");
    Ok(worker)
}

pub async fn unblock_worker(
    datastore: &dyn Datastore,
    provider: &dyn CrowdProvider,
    worker_id: Uuid,
    reason: &str,
) -> Result<Worker> {
    let worker = datastore
        .get_worker(worker_id)
        .await
        .with_context(|| format!("failed to load worker {worker_id}"))?;
    provider.unblock_worker(&worker, reason).await?;
    info!(worker_id = %worker_id, reason, "worker unblocked");
    Ok(worker)
}
