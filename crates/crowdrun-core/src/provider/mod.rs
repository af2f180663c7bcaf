//! Crowd-marketplace adapters.
//!
//! Task runs store a provider-type tag; the operator resolves it to an
//! implementation through a [`ProviderRegistry`].
//!
//! ```text
//! TaskRun.provider_type --get("mock")--> Arc<dyn CrowdProvider>
//!                                            |-- launch_unit / expire_unit
//!                                            |-- block_worker / unblock_worker
//!                                            '-- approve_work / reject_work
//! ```

pub mod mock;
pub mod registry;

use anyhow::Result;
use async_trait::async_trait;

use crowdrun_db::models::{Agent as AgentRecord, Unit, Worker};

pub use mock::{MockProvider, ProviderCall};
pub use registry::ProviderRegistry;

/// Provider-specific side effects invoked by the coordination layer.
#[async_trait]
pub trait CrowdProvider: Send + Sync {
    /// Tag stored on task runs, units and workers (e.g. "mock").
    fn provider_type(&self) -> &str;

    /// Make the unit visible to workers at `task_url`.
    async fn launch_unit(&self, unit: &Unit, task_url: &str) -> Result<()>;

    /// Withdraw the unit from the marketplace.
    async fn expire_unit(&self, unit: &Unit) -> Result<()>;

    async fn block_worker(&self, worker: &Worker, reason: &str) -> Result<()>;

    async fn unblock_worker(&self, worker: &Worker, reason: &str) -> Result<()>;

    async fn approve_work(&self, agent: &AgentRecord) -> Result<()>;

    async fn reject_work(&self, agent: &AgentRecord, reason: &str) -> Result<()>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn CrowdProvider) {}
};
