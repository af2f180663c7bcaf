//! Worker and agent registration: NEW_WORKER, NEW_AGENT and
//! SUBMIT_ONBOARDING.
//!
//! Every reply is a PROVIDER_DETAILS packet echoing the request id. A
//! request id is answered once per channel; a duplicate delivery gets the
//! same answer again.
//!
//! Reconnection goes by the provider's `agent_registration_id` instead: a
//! worker that registers again under an id it already holds a live agent
//! for gets that agent back, moved to the new channel.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crowdrun_db::models::{AgentStatus, ExchangeDirection, UnitStatus, Worker};
use crowdrun_db::{AgentFilter, DatastoreError};

use super::{SupervisorInner, execution, lock};
use crate::agent::Agent;
use crate::packet::{Packet, PacketType};
use crate::qualifications;

/// Outcome of a registration: the reply, plus the agent to start once the
/// reply is queued.
struct Registration {
    reply: Value,
    agent: Option<Agent>,
}

impl Registration {
    fn reply(reply: Value) -> Self {
        Self { reply, agent: None }
    }
}

fn denied(request_id: &str, reason: &str) -> Registration {
    Registration::reply(json!({"request_id": request_id, "agent_id": null, "failure_reason": reason}))
}

fn provider_field<'a>(packet: &'a Packet, field: &str) -> Option<&'a str> {
    packet
        .data
        .get("provider_data")
        .and_then(|data| data.get(field))
        .and_then(Value::as_str)
}

fn worker_name(packet: &Packet) -> Option<&str> {
    provider_field(packet, "worker_name")
}

fn registration_id(packet: &Packet) -> Option<&str> {
    provider_field(packet, "agent_registration_id")
}

pub(super) async fn new_worker(sup: &Arc<SupervisorInner>, channel_id: &str, packet: Packet) {
    let request_id = packet.request_id().unwrap_or_default().to_owned();
    let reply = match worker_details(sup, &request_id, &packet).await {
        Ok(reply) => reply,
        Err(e) => {
            error!(channel_id = %channel_id, error = %e, "worker registration failed");
            json!({"request_id": request_id, "worker_id": null, "failure_reason": "registration failed"})
        }
    };
    sup.reply(channel_id, &packet.sender_id, PacketType::ProviderDetails, reply);
}

async fn worker_details(sup: &SupervisorInner, request_id: &str, packet: &Packet) -> Result<Value> {
    let Some(name) = worker_name(packet) else {
        return Ok(json!({"request_id": request_id, "worker_id": null, "failure_reason": "missing worker name"}));
    };
    let worker = sup
        .datastore
        .find_or_create_worker(name, &sup.job.task_run.provider_type)
        .await?;
    let blocked = qualifications::worker_is_blocked(
        sup.datastore.as_ref(),
        worker.id,
        sup.job.args.block_qualification.as_deref(),
    )
    .await?;
    if blocked {
        info!(worker_id = %worker.id, "blocked worker turned away");
        return Ok(json!({"request_id": request_id, "worker_id": null, "failure_reason": "worker is blocked"}));
    }
    Ok(json!({"request_id": request_id, "worker_id": worker.id.to_string()}))
}

/// Answer a registration request at most once per channel and request id.
///
/// `register` runs for the first delivery only; duplicates are answered
/// from the stored reply. A newly registered agent is dispatched after its
/// reply is queued.
async fn answer_once<F, Fut>(
    sup: &Arc<SupervisorInner>,
    channel_id: &str,
    packet: &Packet,
    register: F,
) where
    F: FnOnce(String) -> Fut,
    Fut: std::future::Future<Output = Result<Registration>>,
{
    let Some(request_id) = packet.request_id().map(str::to_owned) else {
        warn!(channel_id = %channel_id, packet_type = %packet.packet_type, "registration without request id dropped");
        return;
    };
    let slot = lock(&sup.replies)
        .entry((channel_id.to_owned(), request_id.clone()))
        .or_default()
        .clone();
    let mut answered = slot.lock().await;

    if let Some(previous) = answered.as_ref() {
        debug!(channel_id = %channel_id, request_id = %request_id, "duplicate registration answered from record");
        sup.reply(channel_id, &packet.sender_id, PacketType::ProviderDetails, previous.clone());
        return;
    }

    let registration = match register(request_id.clone()).await {
        Ok(registration) => registration,
        Err(e) => {
            error!(channel_id = %channel_id, request_id = %request_id, error = %e, "registration failed");
            denied(&request_id, "registration failed")
        }
    };
    *answered = Some(registration.reply.clone());
    sup.reply(channel_id, &packet.sender_id, PacketType::ProviderDetails, registration.reply);

    if let Some(agent) = registration.agent {
        execution::dispatch(sup, agent).await;
    }
}

/// Run `register` for a worker's registration id, or hand back the live
/// agent the worker already holds under that id.
///
/// Registrations under one (worker, registration id) are serialized, so a
/// client racing its own reconnect still ends up with a single agent.
async fn under_registration_id<F, Fut>(
    sup: &Arc<SupervisorInner>,
    channel_id: &str,
    request_id: &str,
    worker: &Worker,
    registration_id: Option<&str>,
    register: F,
) -> Result<Registration>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<Registration>>,
{
    let Some(registration_id) = registration_id else {
        return register().await;
    };
    let slot = lock(&sup.registrations)
        .entry((worker.id, registration_id.to_owned()))
        .or_default()
        .clone();
    let mut registered = slot.lock().await;

    let existing = (*registered)
        .and_then(|agent_id| sup.agent(agent_id))
        .filter(|agent| !agent.status().is_terminal());
    if let Some(agent) = existing {
        agent.set_channel_id(channel_id);
        info!(
            agent_id = %agent.id(),
            worker_id = %worker.id,
            channel_id = %channel_id,
            "worker reconnected to its agent"
        );
        return Ok(Registration::reply(
            json!({"request_id": request_id, "agent_id": agent.id().to_string()}),
        ));
    }

    let registration = register().await?;
    if let Some(agent) = &registration.agent {
        *registered = Some(agent.id());
    }
    Ok(registration)
}

pub(super) async fn new_agent(sup: &Arc<SupervisorInner>, channel_id: &str, packet: Packet) {
    let name = worker_name(&packet).map(str::to_owned);
    let registration_id = registration_id(&packet).map(str::to_owned);
    answer_once(sup, channel_id, &packet, |request_id| async move {
        let Some(name) = name else {
            return Ok(denied(&request_id, "missing worker name"));
        };
        register_agent(sup, channel_id, &request_id, &name, registration_id.as_deref()).await
    })
    .await;
}

async fn register_agent(
    sup: &Arc<SupervisorInner>,
    channel_id: &str,
    request_id: &str,
    worker_name: &str,
    registration_id: Option<&str>,
) -> Result<Registration> {
    let worker = sup
        .datastore
        .find_or_create_worker(worker_name, &sup.job.task_run.provider_type)
        .await?;

    if qualifications::worker_is_blocked(
        sup.datastore.as_ref(),
        worker.id,
        sup.job.args.block_qualification.as_deref(),
    )
    .await?
    {
        return Ok(denied(request_id, "worker is blocked"));
    }

    under_registration_id(sup, channel_id, request_id, &worker, registration_id, || {
        onboard_or_assign(sup, channel_id, request_id, &worker)
    })
    .await
}

/// Send a worker that still needs onboarding there; assign everyone else.
async fn onboard_or_assign(
    sup: &Arc<SupervisorInner>,
    channel_id: &str,
    request_id: &str,
    worker: &Worker,
) -> Result<Registration> {
    let ds = sup.datastore.as_ref();
    if let (Some(qualification), Some(onboard_data)) = (
        sup.job.args.onboarding_qualification.as_deref(),
        sup.job.blueprint.onboarding_data(),
    ) {
        match qualifications::worker_value(ds, worker.id, qualification).await? {
            Some(0) => return Ok(denied(request_id, "worker failed onboarding")),
            Some(_) => {}
            None => {
                let onboarding = ds
                    .create_onboarding_agent(worker.id, sup.task_run_id())
                    .await?;
                ds.update_onboarding_agent_status(onboarding.id, AgentStatus::Onboarding)
                    .await?;
                lock(&sup.onboarding).insert(onboarding.id, worker.id);
                info!(worker_id = %worker.id, onboarding_agent_id = %onboarding.id, "worker sent to onboarding");
                return Ok(Registration::reply(json!({
                    "request_id": request_id,
                    "agent_id": onboarding.id.to_string(),
                    "onboard_data": onboard_data,
                })));
            }
        }
    }

    assign_agent(sup, channel_id, request_id, worker).await
}

pub(super) async fn submit_onboarding(sup: &Arc<SupervisorInner>, channel_id: &str, packet: Packet) {
    let submitted = &packet;
    answer_once(sup, channel_id, submitted, |request_id| async move {
        judge_onboarding(sup, channel_id, &request_id, submitted).await
    })
    .await;
}

async fn judge_onboarding(
    sup: &Arc<SupervisorInner>,
    channel_id: &str,
    request_id: &str,
    packet: &Packet,
) -> Result<Registration> {
    let Some(qualification) = sup.job.args.onboarding_qualification.as_deref() else {
        return Ok(denied(request_id, "task run has no onboarding"));
    };
    let Some(onboarding_id) = packet
        .data
        .get("onboarding_agent_id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
    else {
        return Ok(denied(request_id, "missing onboarding agent id"));
    };

    let ds = sup.datastore.as_ref();
    let onboarding = match ds.get_onboarding_agent(onboarding_id).await {
        Ok(onboarding) if onboarding.task_run_id == sup.task_run_id() => onboarding,
        Ok(_) | Err(DatastoreError::DoesNotExist { .. }) => {
            return Ok(denied(request_id, "unknown onboarding agent"));
        }
        Err(e) => return Err(e.into()),
    };
    if onboarding.status != AgentStatus::Onboarding {
        return Ok(denied(request_id, "onboarding already judged"));
    }
    let worker = ds.get_worker(onboarding.worker_id).await?;
    ds.append_agent_exchange(onboarding.id, ExchangeDirection::Inbound, &packet.to_value())
        .await?;

    let submission = packet.data.get("data").cloned().unwrap_or(Value::Null);
    let passed = sup
        .job
        .blueprint
        .validate_onboarding(&worker, &onboarding, &submission)
        .await;
    qualifications::grant_qualification(ds, worker.id, qualification, i32::from(passed))
        .await
        .with_context(|| format!("failed to record onboarding result for worker {}", worker.id))?;
    let outcome = if passed {
        AgentStatus::Approved
    } else {
        AgentStatus::Rejected
    };
    ds.update_onboarding_agent_status(onboarding.id, outcome).await?;
    lock(&sup.onboarding).remove(&onboarding.id);
    info!(worker_id = %worker.id, onboarding_agent_id = %onboarding.id, passed, "onboarding judged");

    if !passed {
        return Ok(denied(request_id, "worker failed onboarding"));
    }
    under_registration_id(sup, channel_id, request_id, &worker, registration_id(packet), || {
        assign_agent(sup, channel_id, request_id, &worker)
    })
    .await
}

/// Check the worker's qualifications and caps, bind it to the first unit
/// it can take, then start the agent.
async fn assign_agent(
    sup: &Arc<SupervisorInner>,
    channel_id: &str,
    request_id: &str,
    worker: &Worker,
) -> Result<Registration> {
    let ds = sup.datastore.as_ref();
    let args = &sup.job.args;

    if !qualifications::worker_is_qualified(ds, worker.id, &args.qualifications).await? {
        return Ok(denied(request_id, "worker does not meet qualification requirements"));
    }

    let previous = ds
        .list_agents(&AgentFilter {
            task_run_id: Some(sup.task_run_id()),
            worker_id: Some(worker.id),
            ..AgentFilter::default()
        })
        .await?;
    if args.maximum_units_per_worker > 0 && previous.len() >= args.maximum_units_per_worker {
        return Ok(denied(request_id, "worker reached the unit limit for this task run"));
    }
    let active = previous.iter().filter(|a| !a.status.is_terminal()).count();
    if args.allowed_concurrent > 0 && active >= args.allowed_concurrent {
        return Ok(denied(request_id, "worker holds too many units at once"));
    }
    let worked_on: HashSet<Uuid> = previous.iter().map(|a| a.assignment_id).collect();

    let candidates = ds
        .list_units_for_task_run(sup.task_run_id(), Some(UnitStatus::Launched))
        .await?;
    for unit in candidates
        .into_iter()
        .filter(|unit| !worked_on.contains(&unit.assignment_id))
    {
        if !ds.try_reserve_unit(sup.task_run_id(), unit.id).await? {
            continue;
        }
        let created = ds.create_agent(worker.id, unit.id).await;
        if let Err(e) = ds.release_reservation(sup.task_run_id(), unit.id).await {
            warn!(unit_id = %unit.id, error = %e, "failed to release unit reservation");
        }
        let record = match created {
            Ok(record) => record,
            Err(DatastoreError::InvalidState(reason)) => {
                debug!(unit_id = %unit.id, reason = %reason, "unit taken meanwhile");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let agent = Agent::new(record, channel_id, sup.agent_context());
        // The agent must be routable before the client learns its id.
        if let Err(e) = agent.update_status(AgentStatus::Accepted).await {
            warn!(agent_id = %agent.id(), error = %e, "failed to accept agent");
        }
        lock(&sup.agents).insert(agent.id(), agent.clone());
        info!(
            agent_id = %agent.id(),
            worker_id = %worker.id,
            unit_id = %unit.id,
            "agent registered"
        );
        return Ok(Registration {
            reply: json!({"request_id": request_id, "agent_id": agent.id().to_string()}),
            agent: Some(agent),
        });
    }

    Ok(denied(request_id, "no unit available"))
}
