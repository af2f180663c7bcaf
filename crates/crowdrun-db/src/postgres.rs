//! PostgreSQL implementation of [`Datastore`].

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::datastore::{AgentFilter, Datastore, DatastoreResult, NewTaskRun, NewUnit};
use crate::models::{
    Agent, AgentExchange, AgentStatus, Assignment, ExchangeDirection, GrantedQualification,
    OnboardingAgent, Qualification, Task, TaskRun, Unit, UnitStatus, Worker,
};
use crate::queries::{
    agent_exchanges, agents, assignments, onboarding_agents, qualifications, reservations,
    task_runs, tasks, units, workers,
};

/// A [`Datastore`] over a shared connection pool.
///
/// Cloning is cheap; clones share the pool.
#[derive(Debug, Clone)]
pub struct PgDatastore {
    pool: PgPool,
}

impl PgDatastore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Datastore for PgDatastore {
    async fn create_task(&self, name: &str, task_type: &str) -> DatastoreResult<Task> {
        tasks::insert_task(&self.pool, name, task_type).await
    }

    async fn get_task(&self, id: Uuid) -> DatastoreResult<Task> {
        tasks::get_task(&self.pool, id).await
    }

    async fn find_task_by_name(&self, name: &str) -> DatastoreResult<Option<Task>> {
        tasks::find_task_by_name(&self.pool, name).await
    }

    async fn create_task_run(&self, new: &NewTaskRun<'_>) -> DatastoreResult<TaskRun> {
        task_runs::insert_task_run(&self.pool, new).await
    }

    async fn get_task_run(&self, id: Uuid) -> DatastoreResult<TaskRun> {
        task_runs::get_task_run(&self.pool, id).await
    }

    async fn list_task_runs(&self, incomplete_only: bool) -> DatastoreResult<Vec<TaskRun>> {
        task_runs::list_task_runs(&self.pool, incomplete_only).await
    }

    async fn mark_task_run_completed(&self, id: Uuid) -> DatastoreResult<()> {
        task_runs::mark_task_run_completed(&self.pool, id).await
    }

    async fn create_assignment(
        &self,
        task_run_id: Uuid,
        data: &Value,
    ) -> DatastoreResult<Assignment> {
        assignments::insert_assignment(&self.pool, task_run_id, data).await
    }

    async fn get_assignment(&self, id: Uuid) -> DatastoreResult<Assignment> {
        assignments::get_assignment(&self.pool, id).await
    }

    async fn list_assignments(&self, task_run_id: Uuid) -> DatastoreResult<Vec<Assignment>> {
        assignments::list_assignments(&self.pool, task_run_id).await
    }

    async fn create_unit(&self, new: &NewUnit<'_>) -> DatastoreResult<Unit> {
        units::insert_unit(&self.pool, new).await
    }

    async fn get_unit(&self, id: Uuid) -> DatastoreResult<Unit> {
        units::get_unit(&self.pool, id).await
    }

    async fn list_units_for_assignment(&self, assignment_id: Uuid) -> DatastoreResult<Vec<Unit>> {
        units::list_units_for_assignment(&self.pool, assignment_id).await
    }

    async fn list_units_for_task_run(
        &self,
        task_run_id: Uuid,
        status: Option<UnitStatus>,
    ) -> DatastoreResult<Vec<Unit>> {
        units::list_units_for_task_run(&self.pool, task_run_id, status).await
    }

    async fn transition_unit_status(
        &self,
        unit_id: Uuid,
        from: UnitStatus,
        to: UnitStatus,
    ) -> DatastoreResult<bool> {
        let rows = units::transition_unit_status(&self.pool, unit_id, from, to).await?;
        Ok(rows == 1)
    }

    async fn update_unit_status(&self, unit_id: Uuid, status: UnitStatus) -> DatastoreResult<()> {
        units::update_unit_status(&self.pool, unit_id, status).await
    }

    async fn release_unit(&self, unit_id: Uuid, agent_id: Uuid) -> DatastoreResult<bool> {
        let rows = units::release_unit(&self.pool, unit_id, agent_id).await?;
        Ok(rows == 1)
    }

    async fn try_reserve_unit(&self, task_run_id: Uuid, unit_id: Uuid) -> DatastoreResult<bool> {
        let rows = reservations::insert_reservation(&self.pool, task_run_id, unit_id).await?;
        Ok(rows == 1)
    }

    async fn release_reservation(&self, task_run_id: Uuid, unit_id: Uuid) -> DatastoreResult<()> {
        reservations::delete_reservation(&self.pool, task_run_id, unit_id).await
    }

    async fn find_or_create_worker(
        &self,
        worker_name: &str,
        provider_type: &str,
    ) -> DatastoreResult<Worker> {
        workers::upsert_worker(&self.pool, worker_name, provider_type).await
    }

    async fn get_worker(&self, id: Uuid) -> DatastoreResult<Worker> {
        workers::get_worker(&self.pool, id).await
    }

    async fn create_agent(&self, worker_id: Uuid, unit_id: Uuid) -> DatastoreResult<Agent> {
        agents::insert_agent_binding_unit(&self.pool, worker_id, unit_id).await
    }

    async fn get_agent(&self, id: Uuid) -> DatastoreResult<Agent> {
        agents::get_agent(&self.pool, id).await
    }

    async fn update_agent_status(&self, id: Uuid, status: AgentStatus) -> DatastoreResult<()> {
        agents::update_agent_status(&self.pool, id, status).await
    }

    async fn transition_agent_status(
        &self,
        id: Uuid,
        from: AgentStatus,
        to: AgentStatus,
    ) -> DatastoreResult<bool> {
        let rows = agents::transition_agent_status(&self.pool, id, from, to).await?;
        Ok(rows == 1)
    }

    async fn list_agents(&self, filter: &AgentFilter) -> DatastoreResult<Vec<Agent>> {
        agents::list_agents(&self.pool, filter).await
    }

    async fn create_onboarding_agent(
        &self,
        worker_id: Uuid,
        task_run_id: Uuid,
    ) -> DatastoreResult<OnboardingAgent> {
        onboarding_agents::insert_onboarding_agent(&self.pool, worker_id, task_run_id).await
    }

    async fn get_onboarding_agent(&self, id: Uuid) -> DatastoreResult<OnboardingAgent> {
        onboarding_agents::get_onboarding_agent(&self.pool, id).await
    }

    async fn update_onboarding_agent_status(
        &self,
        id: Uuid,
        status: AgentStatus,
    ) -> DatastoreResult<()> {
        onboarding_agents::update_onboarding_agent_status(&self.pool, id, status).await
    }

    async fn create_qualification(&self, name: &str) -> DatastoreResult<Qualification> {
        qualifications::insert_qualification(&self.pool, name).await
    }

    async fn find_qualification(&self, name: &str) -> DatastoreResult<Option<Qualification>> {
        qualifications::find_qualification(&self.pool, name).await
    }

    async fn grant_qualification(
        &self,
        worker_id: Uuid,
        qualification_id: Uuid,
        value: i32,
    ) -> DatastoreResult<GrantedQualification> {
        qualifications::upsert_granted_qualification(&self.pool, worker_id, qualification_id, value)
            .await
    }

    async fn revoke_qualification(
        &self,
        worker_id: Uuid,
        qualification_id: Uuid,
    ) -> DatastoreResult<()> {
        qualifications::delete_granted_qualification(&self.pool, worker_id, qualification_id).await
    }

    async fn get_granted_qualification(
        &self,
        worker_id: Uuid,
        qualification_id: Uuid,
    ) -> DatastoreResult<Option<GrantedQualification>> {
        qualifications::get_granted_qualification(&self.pool, worker_id, qualification_id).await
    }

    async fn append_agent_exchange(
        &self,
        agent_id: Uuid,
        direction: ExchangeDirection,
        packet: &Value,
    ) -> DatastoreResult<AgentExchange> {
        agent_exchanges::insert_agent_exchange(&self.pool, agent_id, direction, packet).await
    }

    async fn list_agent_exchanges(&self, agent_id: Uuid) -> DatastoreResult<Vec<AgentExchange>> {
        agent_exchanges::list_agent_exchanges(&self.pool, agent_id).await
    }
}
