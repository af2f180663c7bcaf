//! Shared harness for crowdrun-core integration tests: test blueprints, a
//! scripted remote client over `LocalChannel`, and polling helpers.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crowdrun_core::agent::Agent;
use crowdrun_core::channel::{RemoteEnd, local_pair};
use crowdrun_core::packet::{SYSTEM_CHANNEL_ID, action_is_submit};
use crowdrun_core::{
    AssignmentSource, Blueprint, MockProvider, Packet, PacketType, Supervisor, SupervisorConfig,
    SupervisorJob, TaskLauncher, TaskRunArgs,
};
use crowdrun_db::models::{Assignment, OnboardingAgent, Unit, UnitStatus, Worker};
use crowdrun_db::{Datastore, MemoryDatastore, NewTaskRun};

pub const WAIT: Duration = Duration::from_secs(5);

// ===========================================================================
// Blueprints
// ===========================================================================

/// Single-agent blueprint: echoes every action back as an observation until
/// the worker submits.
pub struct Echo {
    pub act_timeout: Option<Duration>,
    pub onboarding: bool,
    pub cleanups: AtomicUsize,
}

impl Echo {
    pub fn new() -> Self {
        Self {
            act_timeout: None,
            onboarding: false,
            cleanups: AtomicUsize::new(0),
        }
    }

    pub fn with_act_timeout(timeout: Duration) -> Self {
        Self {
            act_timeout: Some(timeout),
            ..Self::new()
        }
    }

    pub fn with_onboarding() -> Self {
        Self {
            onboarding: true,
            ..Self::new()
        }
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Blueprint for Echo {
    fn blueprint_type(&self) -> &str {
        "echo"
    }

    fn onboarding_data(&self) -> Option<Value> {
        self.onboarding
            .then(|| json!({"question": "what is six times seven?"}))
    }

    async fn validate_onboarding(
        &self,
        _worker: &Worker,
        _onboarding_agent: &OnboardingAgent,
        submission: &Value,
    ) -> bool {
        submission.get("answer").and_then(Value::as_i64) == Some(42)
    }

    async fn get_init_data_for_agent(&self, agent: &Agent) -> Result<Value> {
        Ok(json!({"unit_id": agent.unit_id().to_string()}))
    }

    async fn run_unit(&self, _unit: &Unit, agent: &Agent) -> Result<()> {
        loop {
            let action = agent.act(self.act_timeout).await?;
            agent.observe(json!({"echo": action.clone()})).await?;
            if action_is_submit(&action) {
                return Ok(());
            }
        }
    }

    async fn cleanup_unit(&self, _unit: &Unit) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

/// Two-worker concurrent blueprint: every agent must submit once.
pub struct Pair;

#[async_trait]
impl Blueprint for Pair {
    fn blueprint_type(&self) -> &str {
        "pair"
    }

    fn is_concurrent(&self) -> bool {
        true
    }

    fn units_for_assignment(&self, _data: &Value) -> usize {
        2
    }

    async fn get_init_data_for_agent(&self, _agent: &Agent) -> Result<Value> {
        Ok(json!({"role": "partner"}))
    }

    async fn run_assignment(&self, _assignment: &Assignment, agents: &[Agent]) -> Result<()> {
        for agent in agents {
            let action = agent.act(None).await?;
            for other in agents {
                other.observe(action.clone()).await?;
            }
        }
        Ok(())
    }
}

// ===========================================================================
// Supervisor harness
// ===========================================================================

pub struct Harness {
    pub ds: Arc<dyn Datastore>,
    pub provider: Arc<MockProvider>,
    pub supervisor: Supervisor,
    pub launcher: TaskLauncher,
    pub cancel: CancellationToken,
}

impl Harness {
    /// A supervisor over a fresh task run with `assignments` created and
    /// every unit launched.
    pub async fn start(
        blueprint: Arc<dyn Blueprint>,
        args: TaskRunArgs,
        assignments: usize,
        config: SupervisorConfig,
    ) -> Self {
        Self::start_on(
            Arc::new(MemoryDatastore::new()),
            blueprint,
            args,
            assignments,
            config,
        )
        .await
    }

    /// [`Harness::start`] over a caller-supplied datastore.
    pub async fn start_on(
        ds: Arc<dyn Datastore>,
        blueprint: Arc<dyn Blueprint>,
        args: TaskRunArgs,
        assignments: usize,
        config: SupervisorConfig,
    ) -> Self {
        let task = ds
            .create_task("test-task", blueprint.blueprint_type())
            .await
            .unwrap();
        let task_run = ds
            .create_task_run(&NewTaskRun {
                task_id: task.id,
                task_type: blueprint.blueprint_type(),
                provider_type: MockProvider::PROVIDER_TYPE,
                args: &args.to_value(),
            })
            .await
            .unwrap();
        let provider = Arc::new(MockProvider::new());
        let cancel = CancellationToken::new();
        let launcher = TaskLauncher::new(
            ds.clone(),
            task_run.clone(),
            &args,
            blueprint.clone(),
            provider.clone(),
            cancel.clone(),
        );
        launcher
            .create_assignments(AssignmentSource::Static(vec![json!({}); assignments]))
            .await
            .unwrap();
        launcher.launch_pending().await.unwrap();

        let supervisor = Supervisor::new(
            ds.clone(),
            SupervisorJob {
                task_run,
                args,
                blueprint,
                provider: provider.clone(),
            },
            config,
            cancel.clone(),
        );
        Self {
            ds,
            provider,
            supervisor,
            launcher,
            cancel,
        }
    }

    pub async fn unit_statuses(&self) -> Vec<UnitStatus> {
        self.ds
            .list_units_for_task_run(self.supervisor.task_run_id(), None)
            .await
            .unwrap()
            .into_iter()
            .map(|unit| unit.status)
            .collect()
    }
}

/// Supervisor timings short enough for tests.
pub fn quick_config() -> SupervisorConfig {
    SupervisorConfig {
        status_poll_interval: Duration::from_secs(60),
        sender_tick: Duration::from_millis(10),
        shutdown_grace: Duration::from_secs(2),
    }
}

// ===========================================================================
// Remote client
// ===========================================================================

/// Plays the remote client of one channel.
pub struct TestClient {
    remote: RemoteEnd,
    backlog: Vec<Packet>,
}

impl TestClient {
    /// Open a fresh local channel on `supervisor`.
    pub async fn attach(supervisor: &Supervisor, channel_id: &str) -> Self {
        let (channel, remote) = local_pair(channel_id);
        let channel = channel.with_open_window(Duration::from_secs(2), Duration::from_millis(20));
        remote.connect();
        supervisor
            .register_channel(Arc::new(channel))
            .await
            .expect("channel should open");
        Self {
            remote,
            backlog: Vec::new(),
        }
    }

    pub fn remote(&self) -> &RemoteEnd {
        &self.remote
    }

    pub fn remote_mut(&mut self) -> &mut RemoteEnd {
        &mut self.remote
    }

    pub fn send(&self, packet_type: PacketType, data: Value) -> bool {
        self.remote.send(Packet::new(
            packet_type,
            self.remote.channel_id(),
            SYSTEM_CHANNEL_ID,
            data,
        ))
    }

    /// Next packet satisfying `pred`; others are kept for later calls.
    pub async fn expect(&mut self, what: &str, pred: impl Fn(&Packet) -> bool) -> Packet {
        if let Some(pos) = self.backlog.iter().position(&pred) {
            return self.backlog.remove(pos);
        }
        let remote = &mut self.remote;
        let backlog = &mut self.backlog;
        let found = tokio::time::timeout(WAIT, async {
            while let Some(packet) = remote.recv().await {
                if pred(&packet) {
                    return Some(packet);
                }
                backlog.push(packet);
            }
            None
        })
        .await;
        match found {
            Ok(Some(packet)) => packet,
            Ok(None) => panic!("channel closed while waiting for {what}"),
            Err(_) => panic!("timed out waiting for {what}"),
        }
    }

    /// The PROVIDER_DETAILS reply for `request_id`.
    pub async fn details(&mut self, request_id: &str) -> Value {
        self.expect("provider details", |p| {
            p.packet_type == PacketType::ProviderDetails && p.request_id() == Some(request_id)
        })
        .await
        .data
    }

    /// Send NEW_AGENT and return the reply data.
    pub async fn new_agent(&mut self, request_id: &str, worker_name: &str) -> Value {
        assert!(self.send(
            PacketType::NewAgent,
            json!({"request_id": request_id, "provider_data": {"worker_name": worker_name}}),
        ));
        self.details(request_id).await
    }

    /// Register and return the granted agent id, if any.
    pub async fn register(&mut self, request_id: &str, worker_name: &str) -> Option<Uuid> {
        agent_id_of(&self.new_agent(request_id, worker_name).await)
    }

    /// Register under a provider registration id and return the granted
    /// agent id, if any.
    pub async fn register_as(
        &mut self,
        request_id: &str,
        worker_name: &str,
        registration_id: &str,
    ) -> Option<Uuid> {
        assert!(self.send(
            PacketType::NewAgent,
            json!({
                "request_id": request_id,
                "provider_data": {
                    "worker_name": worker_name,
                    "agent_registration_id": registration_id,
                },
            }),
        ));
        agent_id_of(&self.details(request_id).await)
    }

    pub fn act(&self, agent_id: Uuid, action: Value) -> bool {
        self.send(
            PacketType::AgentAction,
            json!({"agent_id": agent_id.to_string(), "action": action}),
        )
    }

    pub fn submit(&self, agent_id: Uuid, mut action: Value) -> bool {
        action["is_submit"] = json!(true);
        self.act(agent_id, action)
    }

    /// Wait for an UPDATE_AGENT_STATUS push naming `status`.
    pub async fn expect_status(&mut self, agent_id: Uuid, status: &str) -> Packet {
        let agent = agent_id.to_string();
        self.expect(status, |p| {
            p.packet_type == PacketType::UpdateAgentStatus
                && p.data["agent_id"] == agent.as_str()
                && p.data["agent_status"] == status
        })
        .await
    }
}

pub fn agent_id_of(reply: &Value) -> Option<Uuid> {
    reply
        .get("agent_id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
}

/// Poll `check` until it holds, failing the test after [`WAIT`].
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check().await {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting until {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
