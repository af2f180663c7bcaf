//! The `Blueprint` trait -- task logic plugged into the coordination layer.
//!
//! A blueprint decides what one assignment looks like, what data an agent
//! starts with, and runs the actual exchange with the worker(s). The
//! supervisor calls it; it never talks to channels or storage directly.

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::Value;

use crowdrun_db::models::{Assignment, OnboardingAgent, Unit, Worker};

use crate::agent::Agent;

/// Task logic for one task type.
///
/// Single-agent blueprints implement [`Blueprint::run_unit`]; concurrent
/// ones return true from [`Blueprint::is_concurrent`] and implement
/// [`Blueprint::run_assignment`].
#[async_trait]
pub trait Blueprint: Send + Sync {
    /// Task type tag stored on tasks and task runs.
    fn blueprint_type(&self) -> &str;

    /// True if all units of an assignment must be filled before any work
    /// starts, with one shared execution driving every agent.
    fn is_concurrent(&self) -> bool {
        false
    }

    /// Number of units (worker slots) an assignment with this data gets.
    fn units_for_assignment(&self, _data: &Value) -> usize {
        1
    }

    /// Onboarding content. `None` means the blueprint has no onboarding.
    fn onboarding_data(&self) -> Option<Value> {
        None
    }

    /// Judge a submitted onboarding exercise.
    async fn validate_onboarding(
        &self,
        _worker: &Worker,
        _onboarding_agent: &OnboardingAgent,
        _submission: &Value,
    ) -> bool {
        true
    }

    /// Data the remote client needs to render the task for `agent`.
    async fn get_init_data_for_agent(&self, agent: &Agent) -> Result<Value>;

    /// Run a single-agent unit to completion.
    async fn run_unit(&self, unit: &Unit, _agent: &Agent) -> Result<()> {
        bail!("{} does not run single units (unit {})", self.blueprint_type(), unit.id)
    }

    /// Run a concurrent assignment with all of its agents.
    async fn run_assignment(&self, assignment: &Assignment, _agents: &[Agent]) -> Result<()> {
        bail!(
            "{} does not run concurrent assignments (assignment {})",
            self.blueprint_type(),
            assignment.id
        )
    }

    /// Called after `run_unit` failed or its agent was lost.
    async fn cleanup_unit(&self, _unit: &Unit) {}

    /// Called after `run_assignment` failed or one of its agents was lost.
    async fn cleanup_assignment(&self, _assignment: &Assignment) {}
}

const _: () = {
    fn _assert_object_safe(_: &dyn Blueprint) {}
};
