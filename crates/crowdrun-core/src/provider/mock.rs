//! A provider that records every call and always succeeds, unless told to
//! fail launches or reviews.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crowdrun_db::models::{Agent as AgentRecord, Unit, Worker};

use super::CrowdProvider;

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    Launch { unit_id: Uuid, task_url: String },
    Expire { unit_id: Uuid },
    Block { worker_id: Uuid, reason: String },
    Unblock { worker_id: Uuid, reason: String },
    Approve { agent_id: Uuid },
    Reject { agent_id: Uuid, reason: String },
}

#[derive(Debug, Default)]
pub struct MockProvider {
    calls: Mutex<Vec<ProviderCall>>,
    fail_launches: AtomicBool,
    fail_reviews: AtomicBool,
}

impl MockProvider {
    pub const PROVIDER_TYPE: &str = "mock";

    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `launch_unit` calls fail.
    pub fn set_fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `approve_work` and `reject_work` calls fail.
    pub fn set_fail_reviews(&self, fail: bool) {
        self.fail_reviews.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ProviderCall>> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: ProviderCall) {
        debug!(?call, "mock provider call");
        self.lock().push(call);
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().clone()
    }

    /// Unit ids passed to `launch_unit`, in launch order.
    pub fn launched_units(&self) -> Vec<Uuid> {
        self.lock()
            .iter()
            .filter_map(|call| match call {
                ProviderCall::Launch { unit_id, .. } => Some(*unit_id),
                _ => None,
            })
            .collect()
    }

    /// Unit ids passed to `expire_unit`.
    pub fn expired_units(&self) -> Vec<Uuid> {
        self.lock()
            .iter()
            .filter_map(|call| match call {
                ProviderCall::Expire { unit_id } => Some(*unit_id),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl CrowdProvider for MockProvider {
    fn provider_type(&self) -> &str {
        Self::PROVIDER_TYPE
    }

    async fn launch_unit(&self, unit: &Unit, task_url: &str) -> Result<()> {
        if self.fail_launches.load(Ordering::SeqCst) {
            bail!("mock launch failure for unit {}", unit.id);
        }
        self.record(ProviderCall::Launch {
            unit_id: unit.id,
            task_url: task_url.to_owned(),
        });
        Ok(())
    }

    async fn expire_unit(&self, unit: &Unit) -> Result<()> {
        self.record(ProviderCall::Expire { unit_id: unit.id });
        Ok(())
    }

    async fn block_worker(&self, worker: &Worker, reason: &str) -> Result<()> {
        self.record(ProviderCall::Block {
            worker_id: worker.id,
            reason: reason.to_owned(),
        });
        Ok(())
    }

    async fn unblock_worker(&self, worker: &Worker, reason: &str) -> Result<()> {
        self.record(ProviderCall::Unblock {
            worker_id: worker.id,
            reason: reason.to_owned(),
        });
        Ok(())
    }

    async fn approve_work(&self, agent: &AgentRecord) -> Result<()> {
        if self.fail_reviews.load(Ordering::SeqCst) {
            bail!("mock review failure for agent {}", agent.id);
        }
        self.record(ProviderCall::Approve { agent_id: agent.id });
        Ok(())
    }

    async fn reject_work(&self, agent: &AgentRecord, reason: &str) -> Result<()> {
        if self.fail_reviews.load(Ordering::SeqCst) {
            bail!("mock review failure for agent {}", agent.id);
        }
        self.record(ProviderCall::Reject {
            agent_id: agent.id,
            reason: reason.to_owned(),
        });
        Ok(())
    }
}
