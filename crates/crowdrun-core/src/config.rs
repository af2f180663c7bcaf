//! Run-time parameters for task runs, supervisors and the operator.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::qualifications::QualificationRequirement;

/// Parameters fixed at launch and stored as JSON on the task run.
///
/// Every field has a default, so `{}` is a valid argument set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRunArgs {
    /// Maximum number of units launched at once. 0 means unbounded.
    pub max_num_concurrent_units: usize,
    /// Lifetime cap of units one worker may take in this run. 0 means
    /// unlimited.
    pub maximum_units_per_worker: usize,
    /// Cap on units one worker may hold at the same time. 0 means unlimited.
    pub allowed_concurrent: usize,
    /// Seconds an agent may stay non-terminal before the expiry sweep
    /// expires it.
    pub assignment_duration_secs: u64,
    /// Qualification recording onboarding results. Onboarding is required
    /// when this is set and the blueprint supplies onboarding data.
    pub onboarding_qualification: Option<String>,
    /// Workers holding this qualification are denied.
    pub block_qualification: Option<String>,
    /// Requirements a worker must meet to register.
    pub qualifications: Vec<QualificationRequirement>,
    /// URL handed to the provider when a unit is launched.
    pub task_url: String,
    /// Provider tag resolved through the operator's provider registry.
    pub provider_type: String,
}

impl Default for TaskRunArgs {
    fn default() -> Self {
        Self {
            max_num_concurrent_units: 0,
            maximum_units_per_worker: 0,
            allowed_concurrent: 0,
            assignment_duration_secs: 30 * 60,
            onboarding_qualification: None,
            block_qualification: None,
            qualifications: Vec::new(),
            task_url: "http://localhost:3000/".to_owned(),
            provider_type: "mock".to_owned(),
        }
    }
}

impl TaskRunArgs {
    pub fn assignment_duration(&self) -> Duration {
        Duration::from_secs(self.assignment_duration_secs)
    }

    pub fn to_value(&self) -> Value {
        // Plain struct of serializable fields; cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Parse args stored on a task run.
    pub fn from_value(value: &Value) -> serde_json::Result<Self> {
        serde_json::from_value(value.clone())
    }
}

/// Timing knobs for a [`crate::Supervisor`].
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Minimum spacing between REQUEST_AGENT_STATUS polls on one channel.
    pub status_poll_interval: Duration,
    /// How often the sender task flushes outboxes when not woken earlier.
    pub sender_tick: Duration,
    /// How long shutdown waits for in-flight executions to unwind.
    pub shutdown_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            status_poll_interval: Duration::from_secs(10),
            sender_tick: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Configuration for an [`crate::Operator`].
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    /// Period of the tracking task (expiry sweep and completion checks).
    pub tracking_interval: Duration,
    /// Period of each launcher's promotion loop.
    pub launcher_interval: Duration,
    pub supervisor: SupervisorConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            tracking_interval: Duration::from_secs(1),
            launcher_interval: Duration::from_millis(200),
            supervisor: SupervisorConfig::default(),
        }
    }
}
