use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a unit -- the smallest claimable piece of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Created,
    Launched,
    Assigned,
    Completed,
    Expired,
    Accepted,
    Rejected,
    SoftRejected,
}

impl UnitStatus {
    /// Statuses a unit may hold while it still occupies a launch slot.
    pub const LIVE: [UnitStatus; 2] = [UnitStatus::Launched, UnitStatus::Assigned];

    /// Statuses after which the unit will never be worked again.
    pub const FINAL: [UnitStatus; 5] = [
        UnitStatus::Completed,
        UnitStatus::Expired,
        UnitStatus::Accepted,
        UnitStatus::Rejected,
        UnitStatus::SoftRejected,
    ];

    /// Returns true while the unit is launched or held by an agent.
    pub fn is_live(&self) -> bool {
        Self::LIVE.contains(self)
    }

    /// Returns true once no agent can work this unit any more.
    pub fn is_final(&self) -> bool {
        Self::FINAL.contains(self)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Launched => "launched",
            Self::Assigned => "assigned",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::SoftRejected => "soft_rejected",
        };
        f.write_str(s)
    }
}

impl FromStr for UnitStatus {
    type Err = UnitStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "launched" => Ok(Self::Launched),
            "assigned" => Ok(Self::Assigned),
            "completed" => Ok(Self::Completed),
            "expired" => Ok(Self::Expired),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            "soft_rejected" => Ok(Self::SoftRejected),
            other => Err(UnitStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`UnitStatus`] string.
#[derive(Debug, Clone)]
pub struct UnitStatusParseError(pub String);

impl fmt::Display for UnitStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid unit status: {:?}", self.0)
    }
}

impl std::error::Error for UnitStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of an assignment.
///
/// Never stored: always derived from the statuses of the assignment's units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Created,
    Launched,
    Assigned,
    Completed,
    Expired,
    Accepted,
    Rejected,
    SoftRejected,
    Mixed,
}

impl AssignmentStatus {
    /// Returns true once every unit of the assignment has settled.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Created | Self::Launched | Self::Assigned)
    }
}

impl From<UnitStatus> for AssignmentStatus {
    fn from(status: UnitStatus) -> Self {
        match status {
            UnitStatus::Created => Self::Created,
            UnitStatus::Launched => Self::Launched,
            UnitStatus::Assigned => Self::Assigned,
            UnitStatus::Completed => Self::Completed,
            UnitStatus::Expired => Self::Expired,
            UnitStatus::Accepted => Self::Accepted,
            UnitStatus::Rejected => Self::Rejected,
            UnitStatus::SoftRejected => Self::SoftRejected,
        }
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Launched => "launched",
            Self::Assigned => "assigned",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::SoftRejected => "soft_rejected",
            Self::Mixed => "mixed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------

/// Status of an agent (a worker's binding to one unit) or an onboarding agent.
///
/// The forward path is `none -> accepted -> [onboarding -> waiting] ->
/// in_task -> <terminal>`. `approved`, `rejected` and `soft_rejected` form
/// the post-hoc review axis and are only reachable from `completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    None,
    Accepted,
    Onboarding,
    Waiting,
    InTask,
    Completed,
    Disconnect,
    PartnerDisconnect,
    Timeout,
    Expired,
    Returned,
    Approved,
    Rejected,
    SoftRejected,
}

impl AgentStatus {
    /// Terminal statuses of a task attempt.
    pub const TERMINAL: [AgentStatus; 6] = [
        AgentStatus::Completed,
        AgentStatus::Disconnect,
        AgentStatus::PartnerDisconnect,
        AgentStatus::Timeout,
        AgentStatus::Expired,
        AgentStatus::Returned,
    ];

    /// Review outcomes, reachable from `completed` only.
    pub const REVIEW: [AgentStatus; 3] = [
        AgentStatus::Approved,
        AgentStatus::Rejected,
        AgentStatus::SoftRejected,
    ];

    /// Returns true once the attempt is over (including reviewed attempts).
    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self) || Self::REVIEW.contains(self)
    }

    /// Returns true for the post-hoc review statuses.
    pub fn is_review(&self) -> bool {
        Self::REVIEW.contains(self)
    }

    /// Returns true for statuses that must wake any caller blocked on an
    /// action and count as "submitted" so nobody hangs on the agent.
    pub fn releases_waiters(&self) -> bool {
        matches!(
            self,
            Self::Disconnect
                | Self::PartnerDisconnect
                | Self::Returned
                | Self::Timeout
                | Self::Expired
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Accepted => "accepted",
            Self::Onboarding => "onboarding",
            Self::Waiting => "waiting",
            Self::InTask => "in_task",
            Self::Completed => "completed",
            Self::Disconnect => "disconnect",
            Self::PartnerDisconnect => "partner_disconnect",
            Self::Timeout => "timeout",
            Self::Expired => "expired",
            Self::Returned => "returned",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::SoftRejected => "soft_rejected",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentStatus {
    type Err = AgentStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "accepted" => Ok(Self::Accepted),
            "onboarding" => Ok(Self::Onboarding),
            "waiting" => Ok(Self::Waiting),
            "in_task" => Ok(Self::InTask),
            "completed" => Ok(Self::Completed),
            "disconnect" => Ok(Self::Disconnect),
            "partner_disconnect" => Ok(Self::PartnerDisconnect),
            "timeout" => Ok(Self::Timeout),
            "expired" => Ok(Self::Expired),
            "returned" => Ok(Self::Returned),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "soft_rejected" => Ok(Self::SoftRejected),
            other => Err(AgentStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentStatus`] string.
#[derive(Debug, Clone)]
pub struct AgentStatusParseError(pub String);

impl fmt::Display for AgentStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent status: {:?}", self.0)
    }
}

impl std::error::Error for AgentStatusParseError {}

// ---------------------------------------------------------------------------

/// Direction of a recorded agent exchange, seen from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExchangeDirection {
    /// Sent by the remote client (an action).
    Inbound,
    /// Sent by the server (an observation or init data).
    Outbound,
}

impl fmt::Display for ExchangeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        };
        f.write_str(s)
    }
}

impl FromStr for ExchangeDirection {
    type Err = ExchangeDirectionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            other => Err(ExchangeDirectionParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ExchangeDirection`] string.
#[derive(Debug, Clone)]
pub struct ExchangeDirectionParseError(pub String);

impl fmt::Display for ExchangeDirectionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid exchange direction: {:?}", self.0)
    }
}

impl std::error::Error for ExchangeDirectionParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A named grouping of work.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub task_type: String,
    pub created_at: DateTime<Utc>,
}

/// One launch of a task with fixed parameters.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskRun {
    pub id: Uuid,
    pub task_id: Uuid,
    pub task_type: String,
    pub provider_type: String,
    pub args: serde_json::Value,
    pub is_completed: bool,
    pub created_at: DateTime<Utc>,
}

/// One chunk of work, possibly needing several coordinated workers.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Assignment {
    pub id: Uuid,
    pub task_run_id: Uuid,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// The smallest claimable piece of work, indexed within its assignment.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Unit {
    pub id: Uuid,
    pub assignment_id: Uuid,
    pub task_run_id: Uuid,
    pub unit_index: i32,
    pub provider_type: String,
    pub status: UnitStatus,
    pub agent_id: Option<Uuid>,
    pub worker_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A persistent human identity at some crowd provider.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Worker {
    pub id: Uuid,
    pub worker_name: String,
    pub provider_type: String,
    pub created_at: DateTime<Utc>,
}

/// One worker's one-time binding to one unit.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Agent {
    pub id: Uuid,
    pub worker_id: Uuid,
    pub unit_id: Uuid,
    pub assignment_id: Uuid,
    pub task_run_id: Uuid,
    pub provider_type: String,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A worker's binding to the onboarding exercise of a task run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OnboardingAgent {
    pub id: Uuid,
    pub worker_id: Uuid,
    pub task_run_id: Uuid,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A named capability that can be granted to workers.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Qualification {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A qualification value held by one worker.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GrantedQualification {
    pub worker_id: Uuid,
    pub qualification_id: Uuid,
    pub value: i32,
    pub granted_at: DateTime<Utc>,
}

/// One packet recorded in an agent's exchange log.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentExchange {
    pub id: i64,
    pub agent_id: Uuid,
    pub direction: ExchangeDirection,
    pub packet: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_status_display_roundtrip() {
        let variants = [
            UnitStatus::Created,
            UnitStatus::Launched,
            UnitStatus::Assigned,
            UnitStatus::Completed,
            UnitStatus::Expired,
            UnitStatus::Accepted,
            UnitStatus::Rejected,
            UnitStatus::SoftRejected,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: UnitStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn unit_status_invalid() {
        assert!("paused".parse::<UnitStatus>().is_err());
    }

    #[test]
    fn unit_status_live_and_final_are_disjoint() {
        for s in UnitStatus::LIVE {
            assert!(!s.is_final(), "{s} should not be final");
        }
        assert!(!UnitStatus::Created.is_live());
        assert!(!UnitStatus::Created.is_final());
    }

    #[test]
    fn agent_status_parse_accepts_every_display_value() {
        let variants = [
            AgentStatus::None,
            AgentStatus::Accepted,
            AgentStatus::Onboarding,
            AgentStatus::Waiting,
            AgentStatus::InTask,
            AgentStatus::Completed,
            AgentStatus::Disconnect,
            AgentStatus::PartnerDisconnect,
            AgentStatus::Timeout,
            AgentStatus::Expired,
            AgentStatus::Returned,
            AgentStatus::Approved,
            AgentStatus::Rejected,
            AgentStatus::SoftRejected,
        ];
        for v in &variants {
            let parsed: AgentStatus = v.to_string().parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
        assert!("lost".parse::<AgentStatus>().is_err());
    }

    #[test]
    fn agent_status_terminal_set() {
        assert!(AgentStatus::Completed.is_terminal());
        assert!(AgentStatus::Returned.is_terminal());
        assert!(AgentStatus::Approved.is_terminal());
        assert!(!AgentStatus::Waiting.is_terminal());
        assert!(!AgentStatus::InTask.is_terminal());
        assert!(!AgentStatus::Completed.releases_waiters());
        assert!(AgentStatus::Disconnect.releases_waiters());
    }

    #[test]
    fn assignment_status_terminality() {
        assert!(!AssignmentStatus::Launched.is_terminal());
        assert!(AssignmentStatus::Mixed.is_terminal());
        assert!(AssignmentStatus::Expired.is_terminal());
        assert_eq!(
            AssignmentStatus::from(UnitStatus::SoftRejected),
            AssignmentStatus::SoftRejected
        );
    }

    #[test]
    fn exchange_direction_invalid() {
        assert!("sideways".parse::<ExchangeDirection>().is_err());
    }
}
