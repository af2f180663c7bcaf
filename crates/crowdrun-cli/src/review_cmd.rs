//! `crowdrun review` and `crowdrun worker` commands.

use std::sync::Arc;

use anyhow::{Context, Result};
use uuid::Uuid;

use crowdrun_core::{CrowdProvider, ProviderRegistry, TaskRunArgs, review};
use crowdrun_db::Datastore;

use crate::{ReviewCommands, WorkerCommands};

fn parse_id(kind: &str, id_str: &str) -> Result<Uuid> {
    Uuid::parse_str(id_str).with_context(|| format!("invalid {kind} ID: {id_str}"))
}

fn provider_for(providers: &ProviderRegistry, provider_type: &str) -> Result<Arc<dyn CrowdProvider>> {
    providers
        .get(provider_type)
        .with_context(|| format!("no crowd provider registered for '{provider_type}'"))
}

/// Run a review subcommand against a completed agent.
pub async fn run_review_command(
    command: ReviewCommands,
    datastore: &dyn Datastore,
    providers: &ProviderRegistry,
    default_reject_reason: Option<&str>,
) -> Result<()> {
    match command {
        ReviewCommands::Approve { agent_id } => {
            let id = parse_id("agent", &agent_id)?;
            let provider = agent_provider(datastore, providers, id).await?;
            review::approve_work(datastore, provider.as_ref(), id).await?;
            println!("Agent {id} approved.");
        }
        ReviewCommands::Reject { agent_id, reason } => {
            let id = parse_id("agent", &agent_id)?;
            let reason = reason
                .as_deref()
                .or(default_reject_reason)
                .unwrap_or("work did not meet the task requirements");
            let provider = agent_provider(datastore, providers, id).await?;
            review::reject_work(datastore, provider.as_ref(), id, reason).await?;
            println!("Agent {id} rejected: {reason}");
        }
        ReviewCommands::SoftReject { agent_id } => {
            let id = parse_id("agent", &agent_id)?;
            let provider = agent_provider(datastore, providers, id).await?;
            let block_qualification = block_qualification_of(datastore, id).await?;
            review::soft_reject_work(
                datastore,
                provider.as_ref(),
                id,
                block_qualification.as_deref(),
            )
            .await?;
            match block_qualification {
                Some(name) => println!("Agent {id} soft-rejected; worker granted '{name}'."),
                None => println!("Agent {id} soft-rejected."),
            }
        }
    }
    Ok(())
}

/// Run a worker subcommand.
pub async fn run_worker_command(
    command: WorkerCommands,
    datastore: &dyn Datastore,
    providers: &ProviderRegistry,
) -> Result<()> {
    match command {
        WorkerCommands::Block { worker_id, reason } => {
            let id = parse_id("worker", &worker_id)?;
            let provider = worker_provider(datastore, providers, id).await?;
            review::block_worker(datastore, provider.as_ref(), id, &reason).await?;
            println!("Worker {id} blocked.");
        }
        WorkerCommands::Unblock { worker_id, reason } => {
            let id = parse_id("worker", &worker_id)?;
            let provider = worker_provider(datastore, providers, id).await?;
            review::unblock_worker(datastore, provider.as_ref(), id, &reason).await?;
            println!("Worker {id} unblocked.");
        }
    }
    Ok(())
}

async fn agent_provider(
    datastore: &dyn Datastore,
    providers: &ProviderRegistry,
    agent_id: Uuid,
) -> Result<Arc<dyn CrowdProvider>> {
    let agent = datastore
        .get_agent(agent_id)
        .await
        .with_context(|| format!("agent {agent_id} not found"))?;
    provider_for(providers, &agent.provider_type)
}

async fn worker_provider(
    datastore: &dyn Datastore,
    providers: &ProviderRegistry,
    worker_id: Uuid,
) -> Result<Arc<dyn CrowdProvider>> {
    let worker = datastore
        .get_worker(worker_id)
        .await
        .with_context(|| format!("worker {worker_id} not found"))?;
    provider_for(providers, &worker.provider_type)
}

/// The `block_qualification` of the task run the agent worked in.
async fn block_qualification_of(datastore: &dyn Datastore, agent_id: Uuid) -> Result<Option<String>> {
    let agent = datastore
        .get_agent(agent_id)
        .await
        .with_context(|| format!("agent {agent_id} not found"))?;
    let run = datastore
        .get_task_run(agent.task_run_id)
        .await
        .with_context(|| format!("failed to load task run {}", agent.task_run_id))?;
    let args = TaskRunArgs::from_value(&run.args)
        .with_context(|| format!("task run {} has malformed args", run.id))?;
    Ok(args.block_qualification)
}
