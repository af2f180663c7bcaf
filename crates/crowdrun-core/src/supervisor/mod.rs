//! Per-task-run supervisor: owns the channels, registers workers, routes
//! packets to agents and drives blueprint executions.
//!
//! One supervisor serves one task run. Channel callbacks only forward
//! [`ChannelEvent`]s; a router task handles them, a sender task drains the
//! [`Outbox`], and each execution runs in its own task.

mod execution;
mod registration;
mod sender;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crowdrun_db::Datastore;
use crowdrun_db::models::{AgentStatus, TaskRun, UnitStatus};

use crate::agent::{Agent, AgentContext};
use crate::blueprint::Blueprint;
use crate::channel::{Channel, ChannelError, ChannelEvent, ChannelHandlers, Outbox};
use crate::config::{SupervisorConfig, TaskRunArgs};
use crate::packet::{Packet, PacketType};
use crate::provider::CrowdProvider;

/// What a supervisor runs: the task run plus the pieces plugged into it.
#[derive(Clone)]
pub struct SupervisorJob {
    pub task_run: TaskRun,
    pub args: TaskRunArgs,
    pub blueprint: Arc<dyn Blueprint>,
    pub provider: Arc<dyn CrowdProvider>,
}

impl fmt::Debug for SupervisorJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorJob")
            .field("task_run_id", &self.task_run.id)
            .field("blueprint", &self.blueprint.blueprint_type())
            .field("provider", &self.provider.provider_type())
            .finish()
    }
}

struct ChannelEntry {
    channel: Arc<dyn Channel>,
    last_status_poll: Option<Instant>,
    /// REQUEST_AGENT_STATUS ids not yet answered.
    pending_status_requests: HashSet<String>,
}

/// Reply already given for a channel's request id, if any.
type ReplySlot = Arc<tokio::sync::Mutex<Option<Value>>>;

/// Agent registered under a worker's registration id, if any.
type RegistrationSlot = Arc<tokio::sync::Mutex<Option<Uuid>>>;

pub(crate) struct SupervisorInner {
    datastore: Arc<dyn Datastore>,
    job: SupervisorJob,
    config: SupervisorConfig,
    cancel: CancellationToken,
    outbox: Arc<Outbox>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    channels: Mutex<HashMap<String, ChannelEntry>>,
    agents: Mutex<HashMap<Uuid, Agent>>,
    /// Keyed by (channel id, request id).
    replies: Mutex<HashMap<(String, String), ReplySlot>>,
    /// Keyed by (worker id, agent registration id).
    registrations: Mutex<HashMap<(Uuid, String), RegistrationSlot>>,
    /// Onboarding agent id -> worker id, for sessions opened by this
    /// supervisor.
    onboarding: Mutex<HashMap<Uuid, Uuid>>,
    /// Concurrent assignments with an execution in flight.
    running_assignments: Mutex<HashSet<Uuid>>,
    /// Serializes concurrent-assignment dispatch.
    dispatch_lock: tokio::sync::Mutex<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    sender: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to a running supervisor. Clones share it.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    /// Start a supervisor for `job`. Must be called within a tokio runtime;
    /// the router and sender tasks start immediately and stop when
    /// `cancel` fires or [`Supervisor::shutdown`] runs.
    pub fn new(
        datastore: Arc<dyn Datastore>,
        job: SupervisorJob,
        config: SupervisorConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SupervisorInner {
            datastore,
            job,
            config,
            cancel,
            outbox: Arc::new(Outbox::new()),
            events_tx,
            channels: Mutex::new(HashMap::new()),
            agents: Mutex::new(HashMap::new()),
            replies: Mutex::new(HashMap::new()),
            registrations: Mutex::new(HashMap::new()),
            onboarding: Mutex::new(HashMap::new()),
            running_assignments: Mutex::new(HashSet::new()),
            dispatch_lock: tokio::sync::Mutex::new(()),
            tasks: Mutex::new(Vec::new()),
            sender: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        let router = tokio::spawn(route_events(inner.clone(), events_rx));
        let sender = tokio::spawn(sender::run(inner.clone()));
        lock(&inner.tasks).push(router);
        *lock(&inner.sender) = Some(sender);

        info!(task_run_id = %inner.job.task_run.id, "supervisor started");
        Self { inner }
    }

    pub fn task_run_id(&self) -> Uuid {
        self.inner.job.task_run.id
    }

    /// Attach a channel and open it.
    ///
    /// On failure the channel is forgotten and the error returned.
    pub async fn register_channel(&self, channel: Arc<dyn Channel>) -> Result<(), ChannelError> {
        let channel_id = channel.channel_id().to_owned();
        if self.inner.cancel.is_cancelled() {
            return Err(ChannelError::Closed(channel_id));
        }
        lock(&self.inner.channels).insert(
            channel_id.clone(),
            ChannelEntry {
                channel: channel.clone(),
                last_status_poll: None,
                pending_status_requests: HashSet::new(),
            },
        );
        channel.set_handlers(ChannelHandlers::forwarding(self.inner.events_tx.clone()));

        if let Err(e) = channel.open().await {
            warn!(channel_id = %channel_id, error = %e, "channel failed to open");
            lock(&self.inner.channels).remove(&channel_id);
            return Err(e);
        }
        info!(channel_id = %channel_id, task_run_id = %self.task_run_id(), "channel registered");
        Ok(())
    }

    /// A live agent registered through this supervisor.
    pub fn agent(&self, agent_id: Uuid) -> Option<Agent> {
        lock(&self.inner.agents).get(&agent_id).cloned()
    }

    pub fn agents(&self) -> Vec<Agent> {
        lock(&self.inner.agents).values().cloned().collect()
    }

    /// Expire an agent whose time ran out, releasing its unit with the
    /// provider. Agents from an earlier process are expired in storage.
    pub async fn expire_agent(&self, agent_id: Uuid) -> Result<()> {
        self.inner.expire_agent(agent_id).await
    }

    /// Stop routing and sending, wait up to the configured grace for
    /// executions to unwind, flush what can be flushed, then close every
    /// channel.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();

        // The final flush must be the only one popping the outbox.
        let sender = lock(&self.inner.sender).take();
        if let Some(sender) = sender {
            if let Err(e) = sender.await {
                warn!(task_run_id = %self.task_run_id(), error = %e, "sender task ended abnormally");
            }
        }

        let handles: Vec<JoinHandle<()>> = lock(&self.inner.tasks).drain(..).collect();
        let grace = self.inner.config.shutdown_grace;
        if tokio::time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(task_run_id = %self.task_run_id(), ?grace, "executions still running after shutdown grace");
        }
        self.inner.flush().await;

        let channels: Vec<Arc<dyn Channel>> = lock(&self.inner.channels)
            .drain()
            .map(|(_, entry)| entry.channel)
            .collect();
        for channel in channels {
            channel.close().await;
        }
        info!(task_run_id = %self.task_run_id(), "supervisor stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("job", &self.inner.job)
            .field("channels", &lock(&self.inner.channels).len())
            .field("agents", &lock(&self.inner.agents).len())
            .finish()
    }
}

impl SupervisorInner {
    fn task_run_id(&self) -> Uuid {
        self.job.task_run.id
    }

    fn agent_context(&self) -> AgentContext {
        AgentContext {
            datastore: self.datastore.clone(),
            provider: self.job.provider.clone(),
            outbox: self.outbox.clone(),
            shutdown: self.cancel.clone(),
            block_qualification: self.job.args.block_qualification.clone(),
        }
    }

    fn agent(&self, agent_id: Uuid) -> Option<Agent> {
        lock(&self.agents).get(&agent_id).cloned()
    }

    fn agents_on_channel(&self, channel_id: &str) -> Vec<Agent> {
        lock(&self.agents)
            .values()
            .filter(|agent| agent.channel_id() == channel_id)
            .cloned()
            .collect()
    }

    fn agents_for_assignment(&self, assignment_id: Uuid) -> Vec<Agent> {
        lock(&self.agents)
            .values()
            .filter(|agent| agent.assignment_id() == assignment_id)
            .cloned()
            .collect()
    }

    /// Spawn a task tracked for shutdown.
    fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut tasks = lock(&self.tasks);
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Queue a server packet for a channel.
    fn reply(&self, channel_id: &str, receiver_id: &str, packet_type: PacketType, data: Value) {
        self.outbox
            .push(channel_id, Packet::from_system(packet_type, receiver_id, data));
    }

    /// Send everything queued, in order per channel. A channel whose send
    /// fails keeps the packet at its head and is retried on the next pass.
    async fn flush(&self) {
        for channel_id in self.outbox.pending_channels() {
            let channel = lock(&self.channels)
                .get(&channel_id)
                .map(|entry| entry.channel.clone());
            let Some(channel) = channel else {
                let dropped = self.outbox.drop_channel(&channel_id);
                debug!(channel_id = %channel_id, dropped, "packets for a forgotten channel dropped");
                continue;
            };
            while let Some(packet) = self.outbox.pop(&channel_id) {
                if !channel.send(&packet).await {
                    debug!(channel_id = %channel_id, packet_type = %packet.packet_type, "send failed, will retry");
                    self.outbox.requeue_front(&channel_id, packet);
                    break;
                }
            }
        }
    }

    async fn expire_agent(&self, agent_id: Uuid) -> Result<()> {
        let record = self
            .datastore
            .get_agent(agent_id)
            .await
            .with_context(|| format!("failed to load agent {agent_id}"))?;
        if record.status.is_terminal() {
            return Ok(());
        }
        let unit = self.datastore.get_unit(record.unit_id).await?;
        if let Err(e) = self.job.provider.expire_unit(&unit).await {
            warn!(unit_id = %unit.id, error = %e, "provider failed to expire unit");
        }

        match self.agent(agent_id) {
            Some(agent) => {
                agent.update_status(AgentStatus::Expired).await?;
                if !agent.is_executing() {
                    agent.resolve_lost_unit().await?;
                }
            }
            None => {
                self.datastore
                    .update_agent_status(agent_id, AgentStatus::Expired)
                    .await?;
                if unit.agent_id == Some(agent_id) {
                    self.datastore
                        .transition_unit_status(unit.id, UnitStatus::Assigned, UnitStatus::Expired)
                        .await?;
                }
            }
        }
        info!(agent_id = %agent_id, unit_id = %unit.id, "agent expired");
        Ok(())
    }

    // -- event handling ------------------------------------------------------

    async fn handle_event(self: &Arc<Self>, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened { channel_id } => {
                debug!(channel_id = %channel_id, "channel open");
                // Anything queued while the remote side was away goes now.
                self.outbox.wake();
            }
            ChannelEvent::Disconnected { channel_id } => {
                self.handle_disconnect(&channel_id).await;
            }
            ChannelEvent::Message { channel_id, packet } => {
                self.handle_packet(channel_id, packet).await;
            }
        }
    }

    async fn handle_packet(self: &Arc<Self>, channel_id: String, packet: Packet) {
        match packet.packet_type {
            PacketType::NewWorker => {
                let sup = self.clone();
                self.spawn(async move { registration::new_worker(&sup, &channel_id, packet).await });
            }
            PacketType::NewAgent => {
                let sup = self.clone();
                self.spawn(async move { registration::new_agent(&sup, &channel_id, packet).await });
            }
            PacketType::SubmitOnboarding => {
                let sup = self.clone();
                self.spawn(async move {
                    registration::submit_onboarding(&sup, &channel_id, packet).await
                });
            }
            PacketType::GetInitData => {
                let sup = self.clone();
                self.spawn(async move { sup.send_init_data(&channel_id, packet).await });
            }
            PacketType::AgentAction => self.route_action(&packet).await,
            PacketType::ReturnAgentStatus => self.merge_agent_statuses(&channel_id, &packet).await,
            PacketType::Alive => debug!(channel_id = %channel_id, "alive"),
            other => {
                warn!(channel_id = %channel_id, packet_type = %other, "unexpected packet from client");
            }
        }
    }

    async fn route_action(&self, packet: &Packet) {
        let Some(agent) = packet.agent_id().and_then(|id| self.agent(id)) else {
            warn!(sender_id = %packet.sender_id, "action for unknown agent dropped");
            return;
        };
        if let Err(e) = agent.receive_action(packet).await {
            warn!(agent_id = %agent.id(), error = %e, "failed to record action");
        }
    }

    async fn send_init_data(&self, channel_id: &str, packet: Packet) {
        let request_id = packet.request_id().map(str::to_owned);
        let Some(agent) = packet.agent_id().and_then(|id| self.agent(id)) else {
            self.reply(
                channel_id,
                &packet.sender_id,
                PacketType::InitData,
                json!({
                    "request_id": request_id,
                    "agent_id": packet.data.get("agent_id"),
                    "init_data": null,
                    "failure_reason": "unknown agent",
                }),
            );
            return;
        };

        let init_data = match agent.init_data() {
            Some(cached) => cached,
            None => match self.job.blueprint.get_init_data_for_agent(&agent).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(agent_id = %agent.id(), error = %e, "blueprint failed to produce init data");
                    Value::Null
                }
            },
        };
        let reply = Packet::from_system(
            PacketType::InitData,
            packet.sender_id.clone(),
            json!({
                "request_id": request_id,
                "agent_id": agent.id().to_string(),
                "init_data": init_data,
                "state": agent.state().current_view(),
                "agent_status": agent.status(),
            }),
        );
        if !init_data.is_null() {
            if let Err(e) = agent.record_init_data(init_data, &reply).await {
                warn!(agent_id = %agent.id(), error = %e, "failed to record init data");
            }
        }
        self.outbox.push(channel_id, reply);
    }

    /// Every live agent on the channel is gone.
    async fn handle_disconnect(&self, channel_id: &str) {
        let lost: Vec<Agent> = self
            .agents_on_channel(channel_id)
            .into_iter()
            .filter(|agent| !agent.status().is_terminal())
            .collect();
        info!(channel_id = %channel_id, agents = lost.len(), "channel disconnected");
        for agent in lost {
            self.mark_lost(&agent, AgentStatus::Disconnect).await;
        }

        let still_live = self
            .agents_on_channel(channel_id)
            .iter()
            .any(|agent| !agent.status().is_terminal());
        if !still_live {
            self.forget_channel(channel_id).await;
        }
    }

    /// Drop a dead channel with everything queued or remembered for it.
    async fn forget_channel(&self, channel_id: &str) {
        let entry = lock(&self.channels).remove(channel_id);
        let dropped = self.outbox.drop_channel(channel_id);
        lock(&self.replies).retain(|(channel, _), _| channel != channel_id);
        if let Some(entry) = entry {
            entry.channel.close().await;
        }
        debug!(channel_id = %channel_id, dropped, "channel forgotten");
    }

    /// Move an agent to a loss status, tell its running partners, and
    /// settle its unit if no execution will.
    async fn mark_lost(&self, agent: &Agent, status: AgentStatus) {
        if let Err(e) = agent.update_status(status).await {
            warn!(agent_id = %agent.id(), error = %e, "failed to record agent loss");
            return;
        }

        let assignment_id = agent.assignment_id();
        let running = lock(&self.running_assignments).contains(&assignment_id);
        if running {
            for partner in self.agents_for_assignment(assignment_id) {
                if partner.id() == agent.id() || partner.status().is_terminal() {
                    continue;
                }
                if let Err(e) = partner.update_status(AgentStatus::PartnerDisconnect).await {
                    warn!(agent_id = %partner.id(), error = %e, "failed to mark partner disconnect");
                }
            }
        }

        if !agent.is_executing() {
            if let Err(e) = agent.resolve_lost_unit().await {
                warn!(agent_id = %agent.id(), error = %e, "failed to settle unit of lost agent");
            }
        }
    }

    /// Apply a RETURN_AGENT_STATUS answer. Only disconnects and returns
    /// reported by the client are taken over; everything else the server
    /// already knows better.
    async fn merge_agent_statuses(&self, channel_id: &str, packet: &Packet) {
        let Some(request_id) = packet.request_id() else {
            debug!(channel_id = %channel_id, "status report without request id dropped");
            return;
        };
        let expected = lock(&self.channels)
            .get_mut(channel_id)
            .is_some_and(|entry| entry.pending_status_requests.remove(request_id));
        if !expected {
            debug!(channel_id = %channel_id, request_id, "unknown or repeated status report dropped");
            return;
        }

        let Some(statuses) = packet.data.get("statuses").and_then(Value::as_object) else {
            return;
        };
        for (agent_id, reported) in statuses {
            let Some(agent) = Uuid::parse_str(agent_id).ok().and_then(|id| self.agent(id)) else {
                continue;
            };
            let Some(reported) = reported
                .as_str()
                .and_then(|s| s.parse::<AgentStatus>().ok())
            else {
                continue;
            };
            let current = agent.status();
            if reported != current
                && matches!(reported, AgentStatus::Disconnect | AgentStatus::Returned)
                && !current.is_terminal()
            {
                info!(agent_id = %agent.id(), reported = %reported, "client reported agent loss");
                self.mark_lost(&agent, reported).await;
            }
        }
    }

    /// Queue REQUEST_AGENT_STATUS on channels serving live agents, at most
    /// once per poll interval per channel.
    fn poll_agent_statuses(&self) {
        let live_channels: HashSet<String> = lock(&self.agents)
            .values()
            .filter(|agent| !agent.status().is_terminal())
            .map(Agent::channel_id)
            .collect();
        let interval: Duration = self.config.status_poll_interval;
        let now = Instant::now();

        let mut channels = lock(&self.channels);
        for (channel_id, entry) in channels.iter_mut() {
            if !live_channels.contains(channel_id) {
                continue;
            }
            if entry.last_status_poll.is_some_and(|at| now - at < interval) {
                continue;
            }
            let request_id = Uuid::new_v4().to_string();
            // An unanswered earlier poll is stale by now.
            entry.pending_status_requests.clear();
            entry.pending_status_requests.insert(request_id.clone());
            entry.last_status_poll = Some(now);
            self.outbox.push(
                channel_id,
                Packet::from_system(
                    PacketType::RequestAgentStatus,
                    channel_id.clone(),
                    json!({"request_id": request_id}),
                ),
            );
        }
    }
}

async fn route_events(sup: Arc<SupervisorInner>, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
    loop {
        tokio::select! {
            _ = sup.cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => sup.handle_event(event).await,
                None => break,
            },
        }
    }
    debug!(task_run_id = %sup.task_run_id(), "router stopped");
}
