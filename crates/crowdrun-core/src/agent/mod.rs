//! Live agent handle: the status machine, the act/observe handshake with
//! the remote client, and the agent's [`AgentState`].
//!
//! Status flow:
//!
//! ```text
//! none -> accepted -> [onboarding -> waiting] -> in_task
//!      -> completed | disconnect | partner_disconnect | timeout | expired | returned
//!      -> [approved | rejected | soft_rejected]   (review, from completed only)
//! ```
//!
//! Terminal agents ignore further status changes. Statuses that release
//! waiters wake a blocked [`Agent::act`] with the matching [`AgentError`].

pub mod state;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use anyhow::Result;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crowdrun_db::models::{Agent as AgentRecord, AgentStatus, ExchangeDirection, UnitStatus};
use crowdrun_db::{Datastore, DatastoreError};

use crate::channel::Outbox;
use crate::error::AgentError;
use crate::packet::{Packet, PacketType, action_is_submit};
use crate::provider::CrowdProvider;
use crate::review;

pub use state::AgentState;

/// Everything an agent needs from the supervisor that owns it.
#[derive(Clone)]
pub(crate) struct AgentContext {
    pub datastore: Arc<dyn Datastore>,
    pub provider: Arc<dyn CrowdProvider>,
    pub outbox: Arc<Outbox>,
    pub shutdown: CancellationToken,
    pub block_qualification: Option<String>,
}

/// Handle to one live agent. Clones share the same agent.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

struct AgentInner {
    record: AgentRecord,
    ctx: AgentContext,
    channel_id: RwLock<String>,
    status: watch::Sender<AgentStatus>,
    /// Serializes status transitions.
    transition: tokio::sync::Mutex<()>,
    state: Mutex<AgentState>,
    actions_tx: mpsc::UnboundedSender<Value>,
    actions_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>,
    awaiting_action: AtomicBool,
    submitted: AtomicBool,
    executing: AtomicBool,
}

impl Agent {
    pub(crate) fn new(record: AgentRecord, channel_id: &str, ctx: AgentContext) -> Self {
        let (status, _) = watch::channel(record.status);
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(AgentInner {
                record,
                ctx,
                channel_id: RwLock::new(channel_id.to_owned()),
                status,
                transition: tokio::sync::Mutex::new(()),
                state: Mutex::new(AgentState::new()),
                actions_tx,
                actions_rx: tokio::sync::Mutex::new(actions_rx),
                awaiting_action: AtomicBool::new(false),
                submitted: AtomicBool::new(false),
                executing: AtomicBool::new(false),
            }),
        }
    }

    // -- identity ------------------------------------------------------------

    pub fn id(&self) -> Uuid {
        self.inner.record.id
    }

    pub fn worker_id(&self) -> Uuid {
        self.inner.record.worker_id
    }

    pub fn unit_id(&self) -> Uuid {
        self.inner.record.unit_id
    }

    pub fn assignment_id(&self) -> Uuid {
        self.inner.record.assignment_id
    }

    pub fn task_run_id(&self) -> Uuid {
        self.inner.record.task_run_id
    }

    pub fn provider_type(&self) -> &str {
        &self.inner.record.provider_type
    }

    /// Channel currently serving this agent's remote client.
    pub fn channel_id(&self) -> String {
        self.inner
            .channel_id
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn set_channel_id(&self, channel_id: &str) {
        *self
            .inner
            .channel_id
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = channel_id.to_owned();
    }

    // -- status --------------------------------------------------------------

    pub fn status(&self) -> AgentStatus {
        *self.inner.status.borrow()
    }

    /// True once the agent submitted, or was released so nobody waits on it.
    pub fn is_submitted(&self) -> bool {
        self.inner.submitted.load(Ordering::SeqCst)
    }

    /// True once the worker has sent any action.
    pub fn has_partial_progress(&self) -> bool {
        self.lock_state().has_inputs()
    }

    /// Wait until the status satisfies `predicate`, returning that status.
    pub async fn wait_for_status(&self, predicate: impl Fn(AgentStatus) -> bool) -> AgentStatus {
        let mut rx = self.inner.status.subscribe();
        match rx.wait_for(|status| predicate(*status)).await {
            Ok(status) => *status,
            // The sender lives in `self`, so it cannot be dropped here.
            Err(_) => self.status(),
        }
    }

    /// Move the agent to `status`.
    ///
    /// Ignored (with a warning) once the agent is terminal, and for review
    /// statuses, which only the review operations set. Entering `waiting`
    /// while blocked in [`Agent::act`] gives the unit back for reassignment.
    pub async fn update_status(&self, status: AgentStatus) -> Result<(), AgentError> {
        let _guard = self.inner.transition.lock().await;
        let agent_id = self.id();
        let current = self.status();

        if current.is_terminal() {
            warn!(agent_id = %agent_id, from = %current, to = %status, "ignoring status change of terminal agent");
            return Ok(());
        }
        if status.is_review() {
            warn!(agent_id = %agent_id, to = %status, "review statuses are set by review operations only");
            return Ok(());
        }
        if current == status {
            return Ok(());
        }

        self.inner
            .ctx
            .datastore
            .update_agent_status(agent_id, status)
            .await?;
        self.inner.status.send_replace(status);
        info!(agent_id = %agent_id, from = %current, to = %status, "agent status changed");

        if status.releases_waiters() {
            self.inner.submitted.store(true, Ordering::SeqCst);
        }
        if status == AgentStatus::Waiting && self.inner.awaiting_action.load(Ordering::SeqCst) {
            let released = self
                .inner
                .ctx
                .datastore
                .release_unit(self.unit_id(), agent_id)
                .await?;
            if released {
                info!(agent_id = %agent_id, unit_id = %self.unit_id(), "unit released while agent waits");
            }
        }

        self.push_to_remote(
            PacketType::UpdateAgentStatus,
            json!({"agent_id": agent_id.to_string(), "agent_status": status}),
        );
        Ok(())
    }

    // -- act / observe -------------------------------------------------------

    /// Block until the worker sends an action.
    ///
    /// Asks the remote client with REQUEST_ACTION, then waits for the
    /// action, a status that releases waiters, supervisor shutdown, or the
    /// timeout. On timeout the agent moves to `timeout`.
    pub async fn act(&self, timeout: Option<Duration>) -> Result<Value, AgentError> {
        let agent_id = self.id();
        let mut actions = self.inner.actions_rx.lock().await;

        if let Ok(action) = actions.try_recv() {
            return Ok(action);
        }
        if let Some(err) = AgentError::from_status(agent_id, self.status()) {
            return Err(err);
        }
        if self.inner.ctx.shutdown.is_cancelled() {
            return Err(AgentError::Shutdown(agent_id));
        }

        self.inner.awaiting_action.store(true, Ordering::SeqCst);
        self.push_to_remote(
            PacketType::RequestAction,
            json!({"agent_id": agent_id.to_string()}),
        );

        let mut status_rx = self.inner.status.subscribe();
        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            action = actions.recv() => action.ok_or(AgentError::Shutdown(agent_id)),
            released = status_rx.wait_for(|s| s.releases_waiters()) => {
                let status = released.map(|s| *s).unwrap_or(AgentStatus::Disconnect);
                Err(AgentError::from_status(agent_id, status)
                    .unwrap_or(AgentError::Disconnected(agent_id)))
            }
            _ = self.inner.ctx.shutdown.cancelled() => Err(AgentError::Shutdown(agent_id)),
            _ = deadline => Err(AgentError::Timeout(agent_id)),
        };
        self.inner.awaiting_action.store(false, Ordering::SeqCst);

        if matches!(outcome, Err(AgentError::Timeout(_))) && !self.status().releases_waiters() {
            self.update_status(AgentStatus::Timeout).await?;
        }
        outcome
    }

    /// Send an observation to the worker.
    pub async fn observe(&self, action: Value) -> Result<(), AgentError> {
        let agent_id = self.id();
        let packet = Packet::from_system(
            PacketType::AgentAction,
            agent_id.to_string(),
            json!({"agent_id": agent_id.to_string(), "action": action.clone()}),
        );
        self.inner
            .ctx
            .datastore
            .append_agent_exchange(agent_id, ExchangeDirection::Outbound, &packet.to_value())
            .await?;
        self.lock_state().record_outbound(action);
        self.inner.ctx.outbox.push(&self.channel_id(), packet);
        Ok(())
    }

    /// Hand an inbound AGENT_ACTION to whoever is (or will be) in `act`.
    pub(crate) async fn receive_action(&self, packet: &Packet) -> Result<(), AgentError> {
        let agent_id = self.id();
        if self.status().is_terminal() {
            warn!(agent_id = %agent_id, status = %self.status(), "dropping action for terminal agent");
            return Ok(());
        }
        let action = packet.action().cloned().unwrap_or(Value::Null);
        // Only stored actions count as progress.
        self.inner
            .ctx
            .datastore
            .append_agent_exchange(agent_id, ExchangeDirection::Inbound, &packet.to_value())
            .await?;
        self.lock_state().record_inbound(action.clone());
        if action_is_submit(&action) {
            self.inner.submitted.store(true, Ordering::SeqCst);
        }
        // The receiver lives in `self`; send cannot fail.
        let _ = self.inner.actions_tx.send(action);
        Ok(())
    }

    // -- state ---------------------------------------------------------------

    fn lock_state(&self) -> MutexGuard<'_, AgentState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of the agent's exchange state.
    pub fn state(&self) -> AgentState {
        self.lock_state().clone()
    }

    pub fn init_data(&self) -> Option<Value> {
        self.lock_state().init_data().cloned()
    }

    /// Store init data the first time it is sent, logging the reply packet.
    pub(crate) async fn record_init_data(
        &self,
        init_data: Value,
        reply: &Packet,
    ) -> Result<(), AgentError> {
        {
            let mut state = self.lock_state();
            if state.init_data().is_some() {
                return Ok(());
            }
            state.set_init_data(init_data);
        }
        self.inner
            .ctx
            .datastore
            .append_agent_exchange(self.id(), ExchangeDirection::Outbound, &reply.to_value())
            .await?;
        Ok(())
    }

    // -- supervisor bookkeeping ----------------------------------------------

    pub(crate) fn set_executing(&self, executing: bool) {
        self.inner.executing.store(executing, Ordering::SeqCst);
    }

    /// True while a unit or assignment execution is driving this agent.
    pub fn is_executing(&self) -> bool {
        self.inner.executing.load(Ordering::SeqCst)
    }

    /// Queue a packet for this agent's remote client.
    pub(crate) fn push_to_remote(&self, packet_type: PacketType, data: Value) {
        let packet = Packet::from_system(packet_type, self.id().to_string(), data);
        self.inner.ctx.outbox.push(&self.channel_id(), packet);
    }

    /// Settle the unit of an agent that is gone.
    ///
    /// Without partial progress the unit goes back to `launched` for another
    /// worker; with partial progress (or after expiry) it is marked
    /// `expired` and the lost work is logged. A no-op if the unit is no
    /// longer bound to this agent.
    pub(crate) async fn resolve_lost_unit(&self) -> Result<(), DatastoreError> {
        let agent_id = self.id();
        let datastore = &self.inner.ctx.datastore;
        let unit = datastore.get_unit(self.unit_id()).await?;
        if unit.agent_id != Some(agent_id) || unit.status != UnitStatus::Assigned {
            return Ok(());
        }

        let expired = self.status() == AgentStatus::Expired;
        if !expired && !self.has_partial_progress() {
            if datastore.release_unit(unit.id, agent_id).await? {
                info!(agent_id = %agent_id, unit_id = %unit.id, "unit returned to launched");
            }
            return Ok(());
        }

        if datastore
            .transition_unit_status(unit.id, UnitStatus::Assigned, UnitStatus::Expired)
            .await?
        {
            if expired {
                info!(agent_id = %agent_id, unit_id = %unit.id, "unit expired with its agent");
            } else {
                warn!(
                    agent_id = %agent_id,
                    unit_id = %unit.id,
                    inputs = self.state().inputs().len(),
                    "agent lost after partial progress, unit marked expired and its work is lost"
                );
            }
        }
        Ok(())
    }

    // -- review --------------------------------------------------------------

    /// Approve this agent's completed work.
    pub async fn approve_work(&self) -> Result<()> {
        review::approve_work(
            self.inner.ctx.datastore.as_ref(),
            self.inner.ctx.provider.as_ref(),
            self.id(),
        )
        .await?;
        self.set_review_status(AgentStatus::Approved).await;
        Ok(())
    }

    /// Reject this agent's completed work.
    pub async fn reject_work(&self, reason: &str) -> Result<()> {
        review::reject_work(
            self.inner.ctx.datastore.as_ref(),
            self.inner.ctx.provider.as_ref(),
            self.id(),
            reason,
        )
        .await?;
        self.set_review_status(AgentStatus::Rejected).await;
        Ok(())
    }

    /// Soft-reject this agent's completed work, blocking the worker from
    /// the task run's future units.
    pub async fn soft_reject_work(&self) -> Result<()> {
        review::soft_reject_work(
            self.inner.ctx.datastore.as_ref(),
            self.inner.ctx.provider.as_ref(),
            self.id(),
            self.inner.ctx.block_qualification.as_deref(),
        )
        .await?;
        self.set_review_status(AgentStatus::SoftRejected).await;
        Ok(())
    }

    async fn set_review_status(&self, status: AgentStatus) {
        let _guard = self.inner.transition.lock().await;
        self.inner.status.send_replace(status);
        debug!(agent_id = %self.id(), review = %status, "review status mirrored");
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id())
            .field("unit_id", &self.unit_id())
            .field("status", &self.status())
            .field("channel_id", &self.channel_id())
            .finish()
    }
}
