//! Top-level entry point: launches task runs, tracks them to completion
//! and shuts everything down.
//!
//! Each launched run gets its own [`Supervisor`] and [`TaskLauncher`]. One
//! tracking task, shared by all runs, expires agents that outlived their
//! assignment duration and marks runs completed once every assignment
//! settled.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crowdrun_db::models::{AssignmentStatus, TaskRun};
use crowdrun_db::{AgentFilter, Datastore, NewTaskRun};

use crate::assignment::assignment_status;
use crate::blueprint::Blueprint;
use crate::config::{OperatorConfig, TaskRunArgs};
use crate::launcher::{AssignmentSource, TaskLauncher};
use crate::provider::ProviderRegistry;
use crate::supervisor::{Supervisor, SupervisorJob};

/// A task run this operator is driving.
#[derive(Clone)]
struct LiveTaskRun {
    task_run: TaskRun,
    args: TaskRunArgs,
    supervisor: Supervisor,
    launcher: TaskLauncher,
}

struct OperatorInner {
    datastore: Arc<dyn Datastore>,
    providers: Arc<ProviderRegistry>,
    config: OperatorConfig,
    runs: Mutex<HashMap<Uuid, LiveTaskRun>>,
    run_finished: Notify,
    tracker: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

/// Handle to the operator. Clones share it.
#[derive(Clone)]
pub struct Operator {
    inner: Arc<OperatorInner>,
}

impl Operator {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        providers: ProviderRegistry,
        config: OperatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(OperatorInner {
                datastore,
                providers: Arc::new(providers),
                config,
                runs: Mutex::new(HashMap::new()),
                run_finished: Notify::new(),
                tracker: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        }
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<Uuid, LiveTaskRun>> {
        self.inner
            .runs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn datastore(&self) -> &Arc<dyn Datastore> {
        &self.inner.datastore
    }

    /// Create a task run of `task_name` and start serving it.
    ///
    /// The task is created on first use. Assignments come from `source`;
    /// units are launched with the provider named by `args.provider_type`.
    pub async fn launch_task_run(
        &self,
        task_name: &str,
        blueprint: Arc<dyn Blueprint>,
        args: TaskRunArgs,
        source: AssignmentSource,
    ) -> Result<Uuid> {
        if self.inner.cancel.is_cancelled() {
            bail!("operator is shut down");
        }
        let ds = &self.inner.datastore;
        let task_type = blueprint.blueprint_type().to_owned();
        let provider = self
            .inner
            .providers
            .get(&args.provider_type)
            .with_context(|| format!("no crowd provider registered for '{}'", args.provider_type))?;

        let task = match ds.find_task_by_name(task_name).await? {
            Some(task) if task.task_type != task_type => {
                bail!(
                    "task '{task_name}' has type '{}', not '{task_type}'",
                    task.task_type
                );
            }
            Some(task) => task,
            None => ds
                .create_task(task_name, &task_type)
                .await
                .with_context(|| format!("failed to create task '{task_name}'"))?,
        };
        let task_run = ds
            .create_task_run(&NewTaskRun {
                task_id: task.id,
                task_type: &task_type,
                provider_type: &args.provider_type,
                args: &args.to_value(),
            })
            .await
            .context("failed to create task run")?;

        let cancel = self.inner.cancel.child_token();
        let supervisor = Supervisor::new(
            ds.clone(),
            SupervisorJob {
                task_run: task_run.clone(),
                args: args.clone(),
                blueprint: blueprint.clone(),
                provider: provider.clone(),
            },
            self.inner.config.supervisor.clone(),
            cancel.clone(),
        );
        let launcher = TaskLauncher::new(
            ds.clone(),
            task_run.clone(),
            &args,
            blueprint,
            provider,
            cancel,
        );
        if let Err(e) = launcher.create_assignments(source).await {
            supervisor.shutdown().await;
            return Err(e.context(format!("failed to create assignments for task run {}", task_run.id)));
        }
        launcher.launch_units(self.inner.config.launcher_interval);

        let task_run_id = task_run.id;
        self.runs().insert(
            task_run_id,
            LiveTaskRun {
                task_run,
                args,
                supervisor,
                launcher,
            },
        );
        self.ensure_tracking();
        info!(task_run_id = %task_run_id, task = task_name, task_type = %task_type, "task run launched");
        Ok(task_run_id)
    }

    /// The supervisor serving a running task run; register channels on it.
    pub fn supervisor(&self, task_run_id: Uuid) -> Option<Supervisor> {
        self.runs().get(&task_run_id).map(|run| run.supervisor.clone())
    }

    pub fn launcher(&self, task_run_id: Uuid) -> Option<TaskLauncher> {
        self.runs().get(&task_run_id).map(|run| run.launcher.clone())
    }

    /// Ids of task runs not yet completed.
    pub fn get_running_task_runs(&self) -> Vec<Uuid> {
        let mut ids: Vec<(chrono::DateTime<Utc>, Uuid)> = self
            .runs()
            .values()
            .map(|run| (run.task_run.created_at, run.task_run.id))
            .collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// Number of assignments per derived status.
    pub async fn task_run_progress(
        &self,
        task_run_id: Uuid,
    ) -> Result<BTreeMap<String, usize>> {
        task_run_progress(self.inner.datastore.as_ref(), task_run_id).await
    }

    /// Wait until every launched run completed, then shut down.
    ///
    /// With a timeout, runs still going when it elapses are shut down
    /// anyway; returns false in that case.
    pub async fn wait_for_runs_then_shutdown(&self, timeout: Option<Duration>) -> bool {
        let all_done = async {
            loop {
                let finished = self.inner.run_finished.notified();
                if self.runs().is_empty() {
                    break;
                }
                finished.await;
            }
        };
        let completed = match timeout {
            Some(limit) => tokio::time::timeout(limit, all_done).await.is_ok(),
            None => {
                all_done.await;
                true
            }
        };
        if !completed {
            warn!(remaining = self.runs().len(), "timed out waiting for task runs");
        }
        self.shutdown().await;
        completed
    }

    /// Stop tracking, shut every supervisor down and expire units nobody
    /// took.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let tracker = self
            .inner
            .tracker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(tracker) = tracker {
            if let Err(e) = tracker.await {
                warn!(error = %e, "tracking task ended abnormally");
            }
        }

        let runs: Vec<LiveTaskRun> = self.runs().drain().map(|(_, run)| run).collect();
        for run in runs {
            run.supervisor.shutdown().await;
            if let Err(e) = run.launcher.expire_units().await {
                error!(task_run_id = %run.task_run.id, error = %e, "failed to expire units on shutdown");
            }
        }
        self.inner.run_finished.notify_waiters();
        info!("operator shut down");
    }

    fn ensure_tracking(&self) {
        let mut tracker = self
            .inner
            .tracker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if tracker.is_some() {
            return;
        }
        let operator = self.clone();
        *tracker = Some(tokio::spawn(async move { operator.track().await }));
    }

    async fn track(&self) {
        let mut tick = tokio::time::interval(self.inner.config.tracking_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            let runs: Vec<LiveTaskRun> = self.runs().values().cloned().collect();
            for run in runs {
                if let Err(e) = self.expire_overdue_agents(&run).await {
                    error!(task_run_id = %run.task_run.id, error = %e, "expiry sweep failed");
                }
                match self.is_run_complete(&run).await {
                    Ok(true) => self.finish_run(run).await,
                    Ok(false) => {}
                    Err(e) => {
                        error!(task_run_id = %run.task_run.id, error = %e, "completion check failed");
                    }
                }
            }
        }
    }

    async fn expire_overdue_agents(&self, run: &LiveTaskRun) -> Result<()> {
        let limit = run.args.assignment_duration();
        let now = Utc::now();
        let agents = self
            .inner
            .datastore
            .list_agents(&AgentFilter {
                task_run_id: Some(run.task_run.id),
                ..AgentFilter::default()
            })
            .await?;
        for agent in agents.iter().filter(|a| !a.status.is_terminal()) {
            let age = (now - agent.created_at).to_std().unwrap_or_default();
            if age >= limit {
                info!(agent_id = %agent.id, ?age, "agent outlived its assignment duration");
                run.supervisor.expire_agent(agent.id).await?;
            }
        }
        Ok(())
    }

    async fn is_run_complete(&self, run: &LiveTaskRun) -> Result<bool> {
        if !run.launcher.is_generation_finished() {
            return Ok(false);
        }
        let ds = self.inner.datastore.as_ref();
        for assignment in ds.list_assignments(run.task_run.id).await? {
            if !assignment_status(ds, assignment.id).await?.is_terminal() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn finish_run(&self, run: LiveTaskRun) {
        let task_run_id = run.task_run.id;
        if let Err(e) = self
            .inner
            .datastore
            .mark_task_run_completed(task_run_id)
            .await
        {
            error!(task_run_id = %task_run_id, error = %e, "failed to mark task run completed");
            return;
        }
        run.supervisor.shutdown().await;
        self.runs().remove(&task_run_id);
        self.inner.run_finished.notify_waiters();
        info!(task_run_id = %task_run_id, "task run completed");
    }
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("providers", &self.inner.providers)
            .field("running", &self.runs().len())
            .finish_non_exhaustive()
    }
}

/// Count a task run's assignments by derived status.
pub async fn task_run_progress(
    datastore: &dyn Datastore,
    task_run_id: Uuid,
) -> Result<BTreeMap<String, usize>> {
    let mut counts = BTreeMap::new();
    for assignment in datastore
        .list_assignments(task_run_id)
        .await
        .with_context(|| format!("failed to list assignments of task run {task_run_id}"))?
    {
        let status: AssignmentStatus = assignment_status(datastore, assignment.id).await?;
        *counts.entry(status.to_string()).or_insert(0) += 1;
    }
    Ok(counts)
}
