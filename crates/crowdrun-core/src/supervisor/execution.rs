//! Starting blueprint executions and settling their outcome.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{error, info, warn};

use crowdrun_db::models::{AgentStatus, Unit, UnitStatus};

use super::{SupervisorInner, lock};
use crate::agent::Agent;
use crate::error::AgentError;

/// Start work for a freshly accepted agent.
///
/// Single-agent blueprints start a unit execution right away. Concurrent
/// blueprints park the agent in `waiting` until every unit of its
/// assignment has a live agent here; the last one in starts the shared
/// execution.
pub(super) async fn dispatch(sup: &Arc<SupervisorInner>, agent: Agent) {
    if sup.cancel.is_cancelled() {
        return;
    }
    if sup.job.blueprint.is_concurrent() {
        dispatch_concurrent(sup, agent).await;
    } else {
        dispatch_single(sup, agent).await;
    }
}

async fn dispatch_single(sup: &Arc<SupervisorInner>, agent: Agent) {
    let unit = match sup.datastore.get_unit(agent.unit_id()).await {
        Ok(unit) => unit,
        Err(e) => {
            error!(agent_id = %agent.id(), error = %e, "failed to load unit for agent");
            return;
        }
    };
    if let Err(e) = agent.update_status(AgentStatus::InTask).await {
        warn!(agent_id = %agent.id(), error = %e, "failed to start agent");
        return;
    }
    if agent.status() != AgentStatus::InTask {
        // Lost or expired before it could start.
        return;
    }
    agent.set_executing(true);

    let runner = sup.clone();
    sup.spawn(async move {
        let blueprint = runner.job.blueprint.clone();
        let outcome = AssertUnwindSafe(blueprint.run_unit(&unit, &agent))
            .catch_unwind()
            .await;
        agent.set_executing(false);
        let failure = failure_of(outcome);
        if failure.is_some() {
            blueprint.cleanup_unit(&unit).await;
        }
        settle(&runner, std::slice::from_ref(&agent), failure).await;
    });
}

async fn dispatch_concurrent(sup: &Arc<SupervisorInner>, agent: Agent) {
    let assignment_id = agent.assignment_id();
    let _serialized = sup.dispatch_lock.lock().await;
    let loaded = async {
        let assignment = sup.datastore.get_assignment(assignment_id).await?;
        let units = sup.datastore.list_units_for_assignment(assignment_id).await?;
        Ok::<_, crowdrun_db::DatastoreError>((assignment, units))
    };
    let (assignment, units) = match loaded.await {
        Ok(loaded) => loaded,
        Err(e) => {
            error!(assignment_id = %assignment_id, error = %e, "failed to load assignment");
            return;
        }
    };

    let running = lock(&sup.running_assignments).contains(&assignment_id);
    if running {
        // Started by a partner's dispatch, possibly with this agent.
        if agent.status() != AgentStatus::InTask {
            if let Err(e) = agent.update_status(AgentStatus::Waiting).await {
                warn!(agent_id = %agent.id(), error = %e, "failed to park agent");
            }
        }
        return;
    }
    let team = match full_team(sup, &units) {
        Some(team) => {
            lock(&sup.running_assignments).insert(assignment_id);
            team
        }
        None => {
            if let Err(e) = agent.update_status(AgentStatus::Waiting).await {
                warn!(agent_id = %agent.id(), error = %e, "failed to park agent");
            }
            return;
        }
    };

    for member in &team {
        if let Err(e) = member.update_status(AgentStatus::InTask).await {
            warn!(agent_id = %member.id(), error = %e, "failed to start agent");
        }
        member.set_executing(true);
    }
    info!(assignment_id = %assignment_id, agents = team.len(), "concurrent assignment started");

    let runner = sup.clone();
    sup.spawn(async move {
        let blueprint = runner.job.blueprint.clone();
        let outcome = AssertUnwindSafe(blueprint.run_assignment(&assignment, &team))
            .catch_unwind()
            .await;
        for member in &team {
            member.set_executing(false);
        }
        let failure = failure_of(outcome);
        if failure.is_some() {
            blueprint.cleanup_assignment(&assignment).await;
        }
        settle(&runner, &team, failure).await;
        lock(&runner.running_assignments).remove(&assignment.id);
    });
}

/// The live local agents bound to every unit, in unit order, or `None`
/// while some unit is still unfilled.
fn full_team(sup: &SupervisorInner, units: &[Unit]) -> Option<Vec<Agent>> {
    units
        .iter()
        .map(|unit| {
            unit.agent_id
                .filter(|_| unit.status == UnitStatus::Assigned)
                .and_then(|id| sup.agent(id))
                .filter(|agent| !agent.status().is_terminal())
        })
        .collect()
}

fn failure_of(
    outcome: Result<anyhow::Result<()>, Box<dyn std::any::Any + Send>>,
) -> Option<String> {
    match outcome {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(format!("{e:#}")),
        Err(panic) => Some(
            panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .map_or_else(|| "execution panicked".to_owned(), |m| format!("execution panicked: {m}")),
        ),
    }
}

/// Record the end of an execution for each of its agents.
///
/// Agents still live after a successful run complete, and so do their
/// units. Lost agents get their unit settled. Agents still live after a
/// failed run are expired with their units.
async fn settle(sup: &SupervisorInner, agents: &[Agent], failure: Option<String>) {
    for agent in agents {
        let status = agent.status();
        let result = if status.releases_waiters() {
            agent.resolve_lost_unit().await.map_err(Into::into)
        } else if status.is_terminal() {
            Ok(())
        } else if let Some(reason) = &failure {
            if sup.cancel.is_cancelled() {
                info!(agent_id = %agent.id(), "execution interrupted by shutdown");
            } else {
                error!(agent_id = %agent.id(), unit_id = %agent.unit_id(), reason = %reason, "execution failed");
            }
            expire(agent).await
        } else {
            complete(sup, agent).await
        };
        if let Err(e) = result {
            warn!(agent_id = %agent.id(), error = %e, "failed to settle agent");
        }
    }
}

async fn complete(sup: &SupervisorInner, agent: &Agent) -> Result<(), AgentError> {
    agent.update_status(AgentStatus::Completed).await?;
    let unit = sup.datastore.get_unit(agent.unit_id()).await?;
    if unit.agent_id == Some(agent.id()) {
        sup.datastore
            .transition_unit_status(unit.id, UnitStatus::Assigned, UnitStatus::Completed)
            .await?;
    }
    info!(agent_id = %agent.id(), unit_id = %unit.id, "unit completed");
    Ok(())
}

async fn expire(agent: &Agent) -> Result<(), AgentError> {
    agent.update_status(AgentStatus::Expired).await?;
    agent.resolve_lost_unit().await?;
    Ok(())
}
