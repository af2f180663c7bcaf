//! The storage interface consumed by the coordination layer.
//!
//! Every backend serializes concurrent writers itself; callers assume no
//! in-process exclusivity beyond the unit reservation marker.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    Agent, AgentExchange, AgentStatus, Assignment, ExchangeDirection, GrantedQualification,
    OnboardingAgent, Qualification, Task, TaskRun, Unit, UnitStatus, Worker,
};

/// Errors raised by a [`Datastore`].
///
/// The first three variants are part of the interface contract and callers
/// match on them; `Backend` carries everything else.
#[derive(Debug, Error)]
pub enum DatastoreError {
    #[error("{entity} already exists: {key}")]
    AlreadyExists { entity: &'static str, key: String },

    #[error("{entity} {id} does not exist")]
    DoesNotExist { entity: &'static str, id: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("storage backend error: {0}")]
    Backend(#[from] sqlx::Error),
}

impl DatastoreError {
    pub(crate) fn missing(entity: &'static str, id: impl ToString) -> Self {
        Self::DoesNotExist {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn duplicate(entity: &'static str, key: impl ToString) -> Self {
        Self::AlreadyExists {
            entity,
            key: key.to_string(),
        }
    }

    /// Returns true for [`DatastoreError::DoesNotExist`].
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::DoesNotExist { .. })
    }
}

pub type DatastoreResult<T> = Result<T, DatastoreError>;

/// Parameters for creating a task run.
#[derive(Debug, Clone)]
pub struct NewTaskRun<'a> {
    pub task_id: Uuid,
    pub task_type: &'a str,
    pub provider_type: &'a str,
    pub args: &'a Value,
}

/// Parameters for creating a unit.
#[derive(Debug, Clone)]
pub struct NewUnit<'a> {
    pub assignment_id: Uuid,
    pub task_run_id: Uuid,
    pub unit_index: i32,
    pub provider_type: &'a str,
}

/// Filter for [`Datastore::list_agents`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub task_run_id: Option<Uuid>,
    pub assignment_id: Option<Uuid>,
    pub unit_id: Option<Uuid>,
    pub worker_id: Option<Uuid>,
}

impl AgentFilter {
    pub(crate) fn matches(&self, agent: &Agent) -> bool {
        self.task_run_id.is_none_or(|id| agent.task_run_id == id)
            && self.assignment_id.is_none_or(|id| agent.assignment_id == id)
            && self.unit_id.is_none_or(|id| agent.unit_id == id)
            && self.worker_id.is_none_or(|id| agent.worker_id == id)
    }
}

/// Narrow persistence interface for every coordination entity.
///
/// The trait is object-safe and is shared as `Arc<dyn Datastore>`; one
/// instance is constructed explicitly by the embedding process.
#[async_trait]
pub trait Datastore: Send + Sync {
    // -- tasks ---------------------------------------------------------------

    /// Create a task. Names are unique.
    async fn create_task(&self, name: &str, task_type: &str) -> DatastoreResult<Task>;

    async fn get_task(&self, id: Uuid) -> DatastoreResult<Task>;

    async fn find_task_by_name(&self, name: &str) -> DatastoreResult<Option<Task>>;

    // -- task runs -----------------------------------------------------------

    async fn create_task_run(&self, new: &NewTaskRun<'_>) -> DatastoreResult<TaskRun>;

    async fn get_task_run(&self, id: Uuid) -> DatastoreResult<TaskRun>;

    /// List task runs, oldest first; `incomplete_only` drops completed runs.
    async fn list_task_runs(&self, incomplete_only: bool) -> DatastoreResult<Vec<TaskRun>>;

    async fn mark_task_run_completed(&self, id: Uuid) -> DatastoreResult<()>;

    // -- assignments ---------------------------------------------------------

    async fn create_assignment(&self, task_run_id: Uuid, data: &Value)
    -> DatastoreResult<Assignment>;

    async fn get_assignment(&self, id: Uuid) -> DatastoreResult<Assignment>;

    /// List a task run's assignments in creation order.
    async fn list_assignments(&self, task_run_id: Uuid) -> DatastoreResult<Vec<Assignment>>;

    // -- units ---------------------------------------------------------------

    /// Create a unit in `created` status. `(assignment_id, unit_index)` is
    /// unique.
    async fn create_unit(&self, new: &NewUnit<'_>) -> DatastoreResult<Unit>;

    async fn get_unit(&self, id: Uuid) -> DatastoreResult<Unit>;

    /// List an assignment's units ordered by `unit_index`.
    async fn list_units_for_assignment(&self, assignment_id: Uuid) -> DatastoreResult<Vec<Unit>>;

    /// List a task run's units in creation order, optionally filtered by
    /// status.
    async fn list_units_for_task_run(
        &self,
        task_run_id: Uuid,
        status: Option<UnitStatus>,
    ) -> DatastoreResult<Vec<Unit>>;

    /// Set a unit's status only if it currently equals `from`.
    ///
    /// Returns false when the status did not match.
    async fn transition_unit_status(
        &self,
        unit_id: Uuid,
        from: UnitStatus,
        to: UnitStatus,
    ) -> DatastoreResult<bool>;

    /// Set a unit's status unconditionally.
    async fn update_unit_status(&self, unit_id: Uuid, status: UnitStatus) -> DatastoreResult<()>;

    /// Drop the unit's binding to `agent_id` and put it back to `launched`.
    ///
    /// Returns false when the unit is no longer bound to that agent.
    async fn release_unit(&self, unit_id: Uuid, agent_id: Uuid) -> DatastoreResult<bool>;

    // -- reservations --------------------------------------------------------

    /// Insert the reservation marker for `(task_run_id, unit_id)`.
    ///
    /// Returns false when another registration already holds it.
    async fn try_reserve_unit(&self, task_run_id: Uuid, unit_id: Uuid) -> DatastoreResult<bool>;

    async fn release_reservation(&self, task_run_id: Uuid, unit_id: Uuid) -> DatastoreResult<()>;

    // -- workers -------------------------------------------------------------

    /// Fetch the worker for `(worker_name, provider_type)`, creating it if
    /// absent.
    async fn find_or_create_worker(
        &self,
        worker_name: &str,
        provider_type: &str,
    ) -> DatastoreResult<Worker>;

    async fn get_worker(&self, id: Uuid) -> DatastoreResult<Worker>;

    // -- agents --------------------------------------------------------------

    /// Create an agent for `worker_id` on `unit_id`.
    ///
    /// Atomically binds the unit (`launched -> assigned`, sets `agent_id` and
    /// `worker_id`). Fails with [`DatastoreError::InvalidState`] if the unit
    /// is not launched or is already bound.
    async fn create_agent(&self, worker_id: Uuid, unit_id: Uuid) -> DatastoreResult<Agent>;

    async fn get_agent(&self, id: Uuid) -> DatastoreResult<Agent>;

    async fn update_agent_status(&self, id: Uuid, status: AgentStatus) -> DatastoreResult<()>;

    /// Set an agent's status only if it currently equals `from`.
    ///
    /// Returns false when the status did not match.
    async fn transition_agent_status(
        &self,
        id: Uuid,
        from: AgentStatus,
        to: AgentStatus,
    ) -> DatastoreResult<bool>;

    /// List agents in creation order.
    async fn list_agents(&self, filter: &AgentFilter) -> DatastoreResult<Vec<Agent>>;

    // -- onboarding agents ---------------------------------------------------

    async fn create_onboarding_agent(
        &self,
        worker_id: Uuid,
        task_run_id: Uuid,
    ) -> DatastoreResult<OnboardingAgent>;

    async fn get_onboarding_agent(&self, id: Uuid) -> DatastoreResult<OnboardingAgent>;

    async fn update_onboarding_agent_status(
        &self,
        id: Uuid,
        status: AgentStatus,
    ) -> DatastoreResult<()>;

    // -- qualifications ------------------------------------------------------

    /// Create a qualification. Names are unique.
    async fn create_qualification(&self, name: &str) -> DatastoreResult<Qualification>;

    async fn find_qualification(&self, name: &str) -> DatastoreResult<Option<Qualification>>;

    /// Grant (or overwrite) a qualification value. `(worker_id,
    /// qualification_id)` is unique.
    async fn grant_qualification(
        &self,
        worker_id: Uuid,
        qualification_id: Uuid,
        value: i32,
    ) -> DatastoreResult<GrantedQualification>;

    async fn revoke_qualification(
        &self,
        worker_id: Uuid,
        qualification_id: Uuid,
    ) -> DatastoreResult<()>;

    async fn get_granted_qualification(
        &self,
        worker_id: Uuid,
        qualification_id: Uuid,
    ) -> DatastoreResult<Option<GrantedQualification>>;

    // -- agent exchanges -----------------------------------------------------

    async fn append_agent_exchange(
        &self,
        agent_id: Uuid,
        direction: ExchangeDirection,
        packet: &Value,
    ) -> DatastoreResult<AgentExchange>;

    /// List an agent's exchanges in recording order.
    async fn list_agent_exchanges(&self, agent_id: Uuid) -> DatastoreResult<Vec<AgentExchange>>;
}

// Compile-time assertion: Datastore must be usable as `dyn Datastore`.
const _: () = {
    fn _assert_object_safe(_: &dyn Datastore) {}
};
