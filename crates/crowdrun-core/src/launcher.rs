//! Creates a task run's assignments and units and throttles how many units
//! are launched with the provider at once.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crowdrun_db::models::{TaskRun, Unit, UnitStatus};
use crowdrun_db::{Datastore, NewUnit};

use crate::blueprint::Blueprint;
use crate::config::TaskRunArgs;
use crate::provider::CrowdProvider;

/// Where assignment data comes from.
pub enum AssignmentSource {
    /// A finite list, created up front.
    Static(Vec<Value>),
    /// A stream consumed in the background; generation finishes when it
    /// ends.
    Stream(BoxStream<'static, Value>),
}

impl AssignmentSource {
    pub fn from_receiver(rx: mpsc::Receiver<Value>) -> Self {
        Self::Stream(ReceiverStream::new(rx).boxed())
    }
}

impl fmt::Debug for AssignmentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(items) => f.debug_tuple("Static").field(&items.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

#[derive(Default)]
struct Pools {
    unlaunched: VecDeque<Unit>,
    launched: Vec<Unit>,
}

struct LauncherInner {
    datastore: Arc<dyn Datastore>,
    task_run: TaskRun,
    blueprint: Arc<dyn Blueprint>,
    provider: Arc<dyn CrowdProvider>,
    /// 0 means unbounded.
    max_concurrent: usize,
    task_url: String,
    pools: Mutex<Pools>,
    generation_finished: AtomicBool,
    wake: Notify,
    cancel: CancellationToken,
}

/// Unit launcher for one task run. Clones share it.
#[derive(Clone)]
pub struct TaskLauncher {
    inner: Arc<LauncherInner>,
}

impl TaskLauncher {
    pub fn new(
        datastore: Arc<dyn Datastore>,
        task_run: TaskRun,
        args: &TaskRunArgs,
        blueprint: Arc<dyn Blueprint>,
        provider: Arc<dyn CrowdProvider>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(LauncherInner {
                datastore,
                task_run,
                blueprint,
                provider,
                max_concurrent: args.max_num_concurrent_units,
                task_url: args.task_url.clone(),
                pools: Mutex::new(Pools::default()),
                generation_finished: AtomicBool::new(false),
                wake: Notify::new(),
                cancel,
            }),
        }
    }

    fn pools(&self) -> MutexGuard<'_, Pools> {
        self.inner
            .pools
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn task_run_id(&self) -> uuid::Uuid {
        self.inner.task_run.id
    }

    /// Create assignments (and their units) from `source`.
    ///
    /// A static source is fully created before this returns. A stream is
    /// consumed by a background task; creation failures there are logged
    /// and the item skipped.
    pub async fn create_assignments(&self, source: AssignmentSource) -> Result<()> {
        match source {
            AssignmentSource::Static(items) => {
                for data in items {
                    self.create_assignment(data).await?;
                }
                self.finish_generation();
            }
            AssignmentSource::Stream(mut stream) => {
                let launcher = self.clone();
                tokio::spawn(async move {
                    loop {
                        let next = tokio::select! {
                            _ = launcher.inner.cancel.cancelled() => None,
                            next = stream.next() => next,
                        };
                        let Some(data) = next else {
                            break;
                        };
                        if let Err(e) = launcher.create_assignment(data).await {
                            error!(task_run_id = %launcher.task_run_id(), error = %e, "failed to create streamed assignment");
                        }
                    }
                    launcher.finish_generation();
                });
            }
        }
        Ok(())
    }

    async fn create_assignment(&self, data: Value) -> Result<()> {
        let ds = &self.inner.datastore;
        let run = &self.inner.task_run;
        let unit_count = self.inner.blueprint.units_for_assignment(&data).max(1);
        let assignment = ds
            .create_assignment(run.id, &data)
            .await
            .context("failed to create assignment")?;

        let mut units = Vec::with_capacity(unit_count);
        for index in 0..unit_count {
            let unit_index = i32::try_from(index).context("too many units in one assignment")?;
            let unit = ds
                .create_unit(&NewUnit {
                    assignment_id: assignment.id,
                    task_run_id: run.id,
                    unit_index,
                    provider_type: &run.provider_type,
                })
                .await
                .with_context(|| format!("failed to create unit {index} of assignment {}", assignment.id))?;
            units.push(unit);
        }
        debug!(assignment_id = %assignment.id, units = units.len(), "assignment created");

        self.pools().unlaunched.extend(units);
        self.inner.wake.notify_one();
        Ok(())
    }

    fn finish_generation(&self) {
        self.inner.generation_finished.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
        info!(task_run_id = %self.task_run_id(), "assignment generation finished");
    }

    /// True once the source is exhausted.
    pub fn is_generation_finished(&self) -> bool {
        self.inner.generation_finished.load(Ordering::SeqCst)
    }

    /// True once generation finished and every created unit was launched.
    pub fn is_finished(&self) -> bool {
        self.is_generation_finished() && self.pools().unlaunched.is_empty()
    }

    /// Units currently counted against the concurrency limit.
    pub fn launched_count(&self) -> usize {
        self.pools().launched.len()
    }

    pub fn unlaunched_count(&self) -> usize {
        self.pools().unlaunched.len()
    }

    /// One promotion pass: drop launched units that are no longer live,
    /// then launch waiting units while under the limit. Returns how many
    /// units were launched.
    pub async fn launch_pending(&self) -> Result<usize> {
        let ds = &self.inner.datastore;

        let tracked = std::mem::take(&mut self.pools().launched);
        let mut live = Vec::with_capacity(tracked.len());
        for unit in tracked {
            let fresh = ds.get_unit(unit.id).await?;
            if fresh.status.is_live() {
                live.push(fresh);
            }
        }
        self.pools().launched.extend(live);

        let mut launched = 0;
        loop {
            let next = {
                let mut pools = self.pools();
                let max = self.inner.max_concurrent;
                if max > 0 && pools.launched.len() >= max {
                    None
                } else {
                    pools.unlaunched.pop_front()
                }
            };
            let Some(mut unit) = next else {
                break;
            };
            if !ds
                .transition_unit_status(unit.id, UnitStatus::Created, UnitStatus::Launched)
                .await?
            {
                debug!(unit_id = %unit.id, "unit left created before launch, skipped");
                continue;
            }
            unit.status = UnitStatus::Launched;

            match self.inner.provider.launch_unit(&unit, &self.inner.task_url).await {
                Ok(()) => {
                    info!(unit_id = %unit.id, assignment_id = %unit.assignment_id, "unit launched");
                    self.pools().launched.push(unit);
                    launched += 1;
                }
                Err(e) => {
                    error!(unit_id = %unit.id, error = %e, "provider failed to launch unit, expiring it");
                    ds.transition_unit_status(unit.id, UnitStatus::Launched, UnitStatus::Expired)
                        .await?;
                }
            }
        }
        Ok(launched)
    }

    /// Run promotion passes every `interval` (and whenever new units
    /// appear) until every unit is launched or the launcher is cancelled.
    pub fn launch_units(&self, interval: Duration) -> JoinHandle<()> {
        let launcher = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = launcher.inner.cancel.cancelled() => break,
                    _ = tick.tick() => {}
                    _ = launcher.inner.wake.notified() => {}
                }
                if let Err(e) = launcher.launch_pending().await {
                    error!(task_run_id = %launcher.task_run_id(), error = %e, "launch pass failed");
                }
                if launcher.is_finished() {
                    info!(task_run_id = %launcher.task_run_id(), "all units launched");
                    break;
                }
            }
        })
    }

    /// Expire every unit of the run that no worker holds yet, telling the
    /// provider about launched ones. Returns how many were expired.
    pub async fn expire_units(&self) -> Result<usize> {
        let ds = &self.inner.datastore;
        let run_id = self.task_run_id();
        {
            let mut pools = self.pools();
            pools.unlaunched.clear();
            pools.launched.clear();
        }

        let mut expired = 0;
        for unit in ds.list_units_for_task_run(run_id, Some(UnitStatus::Launched)).await? {
            if let Err(e) = self.inner.provider.expire_unit(&unit).await {
                warn!(unit_id = %unit.id, error = %e, "provider failed to expire unit");
            }
            if ds
                .transition_unit_status(unit.id, UnitStatus::Launched, UnitStatus::Expired)
                .await?
            {
                expired += 1;
            }
        }
        for unit in ds.list_units_for_task_run(run_id, Some(UnitStatus::Created)).await? {
            if ds
                .transition_unit_status(unit.id, UnitStatus::Created, UnitStatus::Expired)
                .await?
            {
                expired += 1;
            }
        }
        if expired > 0 {
            info!(task_run_id = %run_id, expired, "unclaimed units expired");
        }
        Ok(expired)
    }
}

impl fmt::Debug for TaskLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskLauncher")
            .field("task_run_id", &self.task_run_id())
            .field("max_concurrent", &self.inner.max_concurrent)
            .field("generation_finished", &self.is_generation_finished())
            .finish_non_exhaustive()
    }
}
