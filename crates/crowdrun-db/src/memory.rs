//! In-process [`Datastore`] backend.
//!
//! All state lives behind one mutex, so every operation (including the
//! compound ones such as [`Datastore::create_agent`]) is atomic with respect
//! to every other. Used by tests and by embedders that do not need
//! durability.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::datastore::{
    AgentFilter, Datastore, DatastoreError, DatastoreResult, NewTaskRun, NewUnit,
};
use crate::models::{
    Agent, AgentExchange, AgentStatus, Assignment, ExchangeDirection, GrantedQualification,
    OnboardingAgent, Qualification, Task, TaskRun, Unit, UnitStatus, Worker,
};

#[derive(Default)]
struct Tables {
    tasks: Vec<Task>,
    task_runs: Vec<TaskRun>,
    assignments: Vec<Assignment>,
    units: Vec<Unit>,
    workers: Vec<Worker>,
    agents: Vec<Agent>,
    onboarding_agents: Vec<OnboardingAgent>,
    qualifications: Vec<Qualification>,
    granted: HashMap<(Uuid, Uuid), GrantedQualification>,
    reservations: HashSet<(Uuid, Uuid)>,
    exchanges: Vec<AgentExchange>,
    next_exchange_id: i64,
}

impl Tables {
    fn unit_mut(&mut self, id: Uuid) -> DatastoreResult<&mut Unit> {
        self.units
            .iter_mut()
            .find(|u| u.id == id)
            .ok_or_else(|| DatastoreError::missing("unit", id))
    }

    fn agent_mut(&mut self, id: Uuid) -> DatastoreResult<&mut Agent> {
        self.agents
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| DatastoreError::missing("agent", id))
    }
}

/// A [`Datastore`] that keeps everything in memory.
#[derive(Default)]
pub struct MemoryDatastore {
    tables: Mutex<Tables>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for MemoryDatastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.lock();
        f.debug_struct("MemoryDatastore")
            .field("task_runs", &tables.task_runs.len())
            .field("units", &tables.units.len())
            .field("agents", &tables.agents.len())
            .finish()
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn create_task(&self, name: &str, task_type: &str) -> DatastoreResult<Task> {
        let mut t = self.lock();
        if t.tasks.iter().any(|task| task.name == name) {
            return Err(DatastoreError::duplicate("task", name));
        }
        let task = Task {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            task_type: task_type.to_owned(),
            created_at: Utc::now(),
        };
        t.tasks.push(task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: Uuid) -> DatastoreResult<Task> {
        self.lock()
            .tasks
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| DatastoreError::missing("task", id))
    }

    async fn find_task_by_name(&self, name: &str) -> DatastoreResult<Option<Task>> {
        Ok(self.lock().tasks.iter().find(|t| t.name == name).cloned())
    }

    async fn create_task_run(&self, new: &NewTaskRun<'_>) -> DatastoreResult<TaskRun> {
        let mut t = self.lock();
        if !t.tasks.iter().any(|task| task.id == new.task_id) {
            return Err(DatastoreError::missing("task", new.task_id));
        }
        let run = TaskRun {
            id: Uuid::new_v4(),
            task_id: new.task_id,
            task_type: new.task_type.to_owned(),
            provider_type: new.provider_type.to_owned(),
            args: new.args.clone(),
            is_completed: false,
            created_at: Utc::now(),
        };
        t.task_runs.push(run.clone());
        Ok(run)
    }

    async fn get_task_run(&self, id: Uuid) -> DatastoreResult<TaskRun> {
        self.lock()
            .task_runs
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| DatastoreError::missing("task run", id))
    }

    async fn list_task_runs(&self, incomplete_only: bool) -> DatastoreResult<Vec<TaskRun>> {
        Ok(self
            .lock()
            .task_runs
            .iter()
            .filter(|r| !incomplete_only || !r.is_completed)
            .cloned()
            .collect())
    }

    async fn mark_task_run_completed(&self, id: Uuid) -> DatastoreResult<()> {
        let mut t = self.lock();
        let run = t
            .task_runs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| DatastoreError::missing("task run", id))?;
        run.is_completed = true;
        Ok(())
    }

    async fn create_assignment(
        &self,
        task_run_id: Uuid,
        data: &Value,
    ) -> DatastoreResult<Assignment> {
        let mut t = self.lock();
        if !t.task_runs.iter().any(|r| r.id == task_run_id) {
            return Err(DatastoreError::missing("task run", task_run_id));
        }
        let assignment = Assignment {
            id: Uuid::new_v4(),
            task_run_id,
            data: data.clone(),
            created_at: Utc::now(),
        };
        t.assignments.push(assignment.clone());
        Ok(assignment)
    }

    async fn get_assignment(&self, id: Uuid) -> DatastoreResult<Assignment> {
        self.lock()
            .assignments
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or_else(|| DatastoreError::missing("assignment", id))
    }

    async fn list_assignments(&self, task_run_id: Uuid) -> DatastoreResult<Vec<Assignment>> {
        Ok(self
            .lock()
            .assignments
            .iter()
            .filter(|a| a.task_run_id == task_run_id)
            .cloned()
            .collect())
    }

    async fn create_unit(&self, new: &NewUnit<'_>) -> DatastoreResult<Unit> {
        let mut t = self.lock();
        if !t.assignments.iter().any(|a| a.id == new.assignment_id) {
            return Err(DatastoreError::missing("assignment", new.assignment_id));
        }
        if t
            .units
            .iter()
            .any(|u| u.assignment_id == new.assignment_id && u.unit_index == new.unit_index)
        {
            return Err(DatastoreError::duplicate(
                "unit",
                format!("{}#{}", new.assignment_id, new.unit_index),
            ));
        }
        let unit = Unit {
            id: Uuid::new_v4(),
            assignment_id: new.assignment_id,
            task_run_id: new.task_run_id,
            unit_index: new.unit_index,
            provider_type: new.provider_type.to_owned(),
            status: UnitStatus::Created,
            agent_id: None,
            worker_id: None,
            created_at: Utc::now(),
        };
        t.units.push(unit.clone());
        Ok(unit)
    }

    async fn get_unit(&self, id: Uuid) -> DatastoreResult<Unit> {
        self.lock()
            .units
            .iter()
            .find(|u| u.id == id)
            .cloned()
            .ok_or_else(|| DatastoreError::missing("unit", id))
    }

    async fn list_units_for_assignment(&self, assignment_id: Uuid) -> DatastoreResult<Vec<Unit>> {
        let mut units: Vec<Unit> = self
            .lock()
            .units
            .iter()
            .filter(|u| u.assignment_id == assignment_id)
            .cloned()
            .collect();
        units.sort_by_key(|u| u.unit_index);
        Ok(units)
    }

    async fn list_units_for_task_run(
        &self,
        task_run_id: Uuid,
        status: Option<UnitStatus>,
    ) -> DatastoreResult<Vec<Unit>> {
        Ok(self
            .lock()
            .units
            .iter()
            .filter(|u| u.task_run_id == task_run_id && status.is_none_or(|s| u.status == s))
            .cloned()
            .collect())
    }

    async fn transition_unit_status(
        &self,
        unit_id: Uuid,
        from: UnitStatus,
        to: UnitStatus,
    ) -> DatastoreResult<bool> {
        let mut t = self.lock();
        let unit = t.unit_mut(unit_id)?;
        if unit.status != from {
            return Ok(false);
        }
        unit.status = to;
        Ok(true)
    }

    async fn update_unit_status(&self, unit_id: Uuid, status: UnitStatus) -> DatastoreResult<()> {
        let mut t = self.lock();
        t.unit_mut(unit_id)?.status = status;
        Ok(())
    }

    async fn release_unit(&self, unit_id: Uuid, agent_id: Uuid) -> DatastoreResult<bool> {
        let mut t = self.lock();
        let unit = t.unit_mut(unit_id)?;
        if unit.agent_id != Some(agent_id) {
            return Ok(false);
        }
        unit.agent_id = None;
        unit.worker_id = None;
        unit.status = UnitStatus::Launched;
        Ok(true)
    }

    async fn try_reserve_unit(&self, task_run_id: Uuid, unit_id: Uuid) -> DatastoreResult<bool> {
        Ok(self.lock().reservations.insert((task_run_id, unit_id)))
    }

    async fn release_reservation(&self, task_run_id: Uuid, unit_id: Uuid) -> DatastoreResult<()> {
        self.lock().reservations.remove(&(task_run_id, unit_id));
        Ok(())
    }

    async fn find_or_create_worker(
        &self,
        worker_name: &str,
        provider_type: &str,
    ) -> DatastoreResult<Worker> {
        let mut t = self.lock();
        if let Some(worker) = t
            .workers
            .iter()
            .find(|w| w.worker_name == worker_name && w.provider_type == provider_type)
        {
            return Ok(worker.clone());
        }
        let worker = Worker {
            id: Uuid::new_v4(),
            worker_name: worker_name.to_owned(),
            provider_type: provider_type.to_owned(),
            created_at: Utc::now(),
        };
        t.workers.push(worker.clone());
        Ok(worker)
    }

    async fn get_worker(&self, id: Uuid) -> DatastoreResult<Worker> {
        self.lock()
            .workers
            .iter()
            .find(|w| w.id == id)
            .cloned()
            .ok_or_else(|| DatastoreError::missing("worker", id))
    }

    async fn create_agent(&self, worker_id: Uuid, unit_id: Uuid) -> DatastoreResult<Agent> {
        let mut t = self.lock();
        if !t.workers.iter().any(|w| w.id == worker_id) {
            return Err(DatastoreError::missing("worker", worker_id));
        }
        let agent_id = Uuid::new_v4();
        let unit = t.unit_mut(unit_id)?;
        if unit.status != UnitStatus::Launched || unit.agent_id.is_some() {
            return Err(DatastoreError::InvalidState(format!(
                "unit {unit_id} is {} and cannot take a new agent",
                unit.status
            )));
        }
        unit.status = UnitStatus::Assigned;
        unit.agent_id = Some(agent_id);
        unit.worker_id = Some(worker_id);

        let now = Utc::now();
        let agent = Agent {
            id: agent_id,
            worker_id,
            unit_id,
            assignment_id: unit.assignment_id,
            task_run_id: unit.task_run_id,
            provider_type: unit.provider_type.clone(),
            status: AgentStatus::None,
            created_at: now,
            updated_at: now,
        };
        t.agents.push(agent.clone());
        Ok(agent)
    }

    async fn get_agent(&self, id: Uuid) -> DatastoreResult<Agent> {
        self.lock()
            .agents
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or_else(|| DatastoreError::missing("agent", id))
    }

    async fn update_agent_status(&self, id: Uuid, status: AgentStatus) -> DatastoreResult<()> {
        let mut t = self.lock();
        let agent = t.agent_mut(id)?;
        agent.status = status;
        agent.updated_at = Utc::now();
        Ok(())
    }

    async fn transition_agent_status(
        &self,
        id: Uuid,
        from: AgentStatus,
        to: AgentStatus,
    ) -> DatastoreResult<bool> {
        let mut t = self.lock();
        let agent = t.agent_mut(id)?;
        if agent.status != from {
            return Ok(false);
        }
        agent.status = to;
        agent.updated_at = Utc::now();
        Ok(true)
    }

    async fn list_agents(&self, filter: &AgentFilter) -> DatastoreResult<Vec<Agent>> {
        Ok(self
            .lock()
            .agents
            .iter()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect())
    }

    async fn create_onboarding_agent(
        &self,
        worker_id: Uuid,
        task_run_id: Uuid,
    ) -> DatastoreResult<OnboardingAgent> {
        let mut t = self.lock();
        if !t.workers.iter().any(|w| w.id == worker_id) {
            return Err(DatastoreError::missing("worker", worker_id));
        }
        let now = Utc::now();
        let agent = OnboardingAgent {
            id: Uuid::new_v4(),
            worker_id,
            task_run_id,
            status: AgentStatus::None,
            created_at: now,
            updated_at: now,
        };
        t.onboarding_agents.push(agent.clone());
        Ok(agent)
    }

    async fn get_onboarding_agent(&self, id: Uuid) -> DatastoreResult<OnboardingAgent> {
        self.lock()
            .onboarding_agents
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or_else(|| DatastoreError::missing("onboarding agent", id))
    }

    async fn update_onboarding_agent_status(
        &self,
        id: Uuid,
        status: AgentStatus,
    ) -> DatastoreResult<()> {
        let mut t = self.lock();
        let agent = t
            .onboarding_agents
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| DatastoreError::missing("onboarding agent", id))?;
        agent.status = status;
        agent.updated_at = Utc::now();
        Ok(())
    }

    async fn create_qualification(&self, name: &str) -> DatastoreResult<Qualification> {
        let mut t = self.lock();
        if t.qualifications.iter().any(|q| q.name == name) {
            return Err(DatastoreError::duplicate("qualification", name));
        }
        let qualification = Qualification {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            created_at: Utc::now(),
        };
        t.qualifications.push(qualification.clone());
        Ok(qualification)
    }

    async fn find_qualification(&self, name: &str) -> DatastoreResult<Option<Qualification>> {
        Ok(self
            .lock()
            .qualifications
            .iter()
            .find(|q| q.name == name)
            .cloned())
    }

    async fn grant_qualification(
        &self,
        worker_id: Uuid,
        qualification_id: Uuid,
        value: i32,
    ) -> DatastoreResult<GrantedQualification> {
        let mut t = self.lock();
        if !t.qualifications.iter().any(|q| q.id == qualification_id) {
            return Err(DatastoreError::missing("qualification", qualification_id));
        }
        let granted = GrantedQualification {
            worker_id,
            qualification_id,
            value,
            granted_at: Utc::now(),
        };
        t.granted
            .insert((worker_id, qualification_id), granted.clone());
        Ok(granted)
    }

    async fn revoke_qualification(
        &self,
        worker_id: Uuid,
        qualification_id: Uuid,
    ) -> DatastoreResult<()> {
        self.lock().granted.remove(&(worker_id, qualification_id));
        Ok(())
    }

    async fn get_granted_qualification(
        &self,
        worker_id: Uuid,
        qualification_id: Uuid,
    ) -> DatastoreResult<Option<GrantedQualification>> {
        Ok(self
            .lock()
            .granted
            .get(&(worker_id, qualification_id))
            .cloned())
    }

    async fn append_agent_exchange(
        &self,
        agent_id: Uuid,
        direction: ExchangeDirection,
        packet: &Value,
    ) -> DatastoreResult<AgentExchange> {
        let mut t = self.lock();
        let known = t.agents.iter().any(|a| a.id == agent_id)
            || t.onboarding_agents.iter().any(|a| a.id == agent_id);
        if !known {
            return Err(DatastoreError::missing("agent", agent_id));
        }
        t.next_exchange_id += 1;
        let exchange = AgentExchange {
            id: t.next_exchange_id,
            agent_id,
            direction,
            packet: packet.clone(),
            recorded_at: Utc::now(),
        };
        t.exchanges.push(exchange.clone());
        Ok(exchange)
    }

    async fn list_agent_exchanges(&self, agent_id: Uuid) -> DatastoreResult<Vec<AgentExchange>> {
        Ok(self
            .lock()
            .exchanges
            .iter()
            .filter(|e| e.agent_id == agent_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn launched_unit(store: &MemoryDatastore) -> Unit {
        let task = store.create_task("t", "mock").await.unwrap();
        let run = store
            .create_task_run(&NewTaskRun {
                task_id: task.id,
                task_type: "mock",
                provider_type: "mock",
                args: &json!({}),
            })
            .await
            .unwrap();
        let assignment = store.create_assignment(run.id, &json!({})).await.unwrap();
        let unit = store
            .create_unit(&NewUnit {
                assignment_id: assignment.id,
                task_run_id: run.id,
                unit_index: 0,
                provider_type: "mock",
            })
            .await
            .unwrap();
        store
            .update_unit_status(unit.id, UnitStatus::Launched)
            .await
            .unwrap();
        store.get_unit(unit.id).await.unwrap()
    }

    #[tokio::test]
    async fn duplicate_task_name_is_already_exists() {
        let store = MemoryDatastore::new();
        store.create_task("dup", "mock").await.unwrap();
        let err = store.create_task("dup", "mock").await.unwrap_err();
        assert!(matches!(err, DatastoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn missing_unit_is_does_not_exist() {
        let store = MemoryDatastore::new();
        let err = store.get_unit(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_missing());
    }

    #[tokio::test]
    async fn unit_index_is_unique_per_assignment() {
        let store = MemoryDatastore::new();
        let unit = launched_unit(&store).await;
        let err = store
            .create_unit(&NewUnit {
                assignment_id: unit.assignment_id,
                task_run_id: unit.task_run_id,
                unit_index: 0,
                provider_type: "mock",
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DatastoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn reservation_is_insert_or_fail() {
        let store = MemoryDatastore::new();
        let (run, unit) = (Uuid::new_v4(), Uuid::new_v4());
        assert!(store.try_reserve_unit(run, unit).await.unwrap());
        assert!(!store.try_reserve_unit(run, unit).await.unwrap());
        store.release_reservation(run, unit).await.unwrap();
        assert!(store.try_reserve_unit(run, unit).await.unwrap());
    }

    #[tokio::test]
    async fn create_agent_binds_unit_once() {
        let store = MemoryDatastore::new();
        let unit = launched_unit(&store).await;
        let w1 = store.find_or_create_worker("w1", "mock").await.unwrap();
        let w2 = store.find_or_create_worker("w2", "mock").await.unwrap();

        let agent = store.create_agent(w1.id, unit.id).await.unwrap();
        let bound = store.get_unit(unit.id).await.unwrap();
        assert_eq!(bound.status, UnitStatus::Assigned);
        assert_eq!(bound.agent_id, Some(agent.id));

        let err = store.create_agent(w2.id, unit.id).await.unwrap_err();
        assert!(matches!(err, DatastoreError::InvalidState(_)));
    }

    #[tokio::test]
    async fn release_unit_only_for_bound_agent() {
        let store = MemoryDatastore::new();
        let unit = launched_unit(&store).await;
        let worker = store.find_or_create_worker("w", "mock").await.unwrap();
        let agent = store.create_agent(worker.id, unit.id).await.unwrap();

        assert!(!store.release_unit(unit.id, Uuid::new_v4()).await.unwrap());
        assert!(store.release_unit(unit.id, agent.id).await.unwrap());
        let released = store.get_unit(unit.id).await.unwrap();
        assert_eq!(released.status, UnitStatus::Launched);
        assert!(released.agent_id.is_none());
    }

    #[tokio::test]
    async fn grant_qualification_overwrites_value() {
        let store = MemoryDatastore::new();
        let worker = store.find_or_create_worker("w", "mock").await.unwrap();
        let qual = store.create_qualification("onboarded").await.unwrap();
        store.grant_qualification(worker.id, qual.id, 0).await.unwrap();
        store.grant_qualification(worker.id, qual.id, 1).await.unwrap();
        let granted = store
            .get_granted_qualification(worker.id, qual.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(granted.value, 1);
    }

    #[tokio::test]
    async fn find_or_create_worker_is_idempotent() {
        let store = MemoryDatastore::new();
        let a = store.find_or_create_worker("alice", "mock").await.unwrap();
        let b = store.find_or_create_worker("alice", "mock").await.unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn exchanges_need_a_known_agent() {
        let store = MemoryDatastore::new();
        let err = store
            .append_agent_exchange(Uuid::new_v4(), ExchangeDirection::Inbound, &json!({}))
            .await
            .unwrap_err();
        assert!(err.is_missing());

        let unit = launched_unit(&store).await;
        let worker = store.find_or_create_worker("w", "mock").await.unwrap();
        let agent = store.create_agent(worker.id, unit.id).await.unwrap();
        store
            .append_agent_exchange(agent.id, ExchangeDirection::Inbound, &json!({"n": 1}))
            .await
            .unwrap();
        assert_eq!(store.list_agent_exchanges(agent.id).await.unwrap().len(), 1);
    }
}
