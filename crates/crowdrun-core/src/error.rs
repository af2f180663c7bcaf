use thiserror::Error;
use uuid::Uuid;

use crowdrun_db::DatastoreError;
use crowdrun_db::models::AgentStatus;

/// Errors raised to task logic from a blocked [`crate::Agent::act`] (and
/// from other agent operations that touch storage).
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent {0} disconnected")]
    Disconnected(Uuid),

    #[error("agent {0} returned the task")]
    Returned(Uuid),

    #[error("agent {0} timed out")]
    Timeout(Uuid),

    #[error("agent {0} was interrupted by shutdown")]
    Shutdown(Uuid),

    #[error("agent {agent_id} cannot {operation} while {status}")]
    InvalidStatus {
        agent_id: Uuid,
        operation: &'static str,
        status: AgentStatus,
    },

    #[error(transparent)]
    Datastore(#[from] DatastoreError),
}

impl AgentError {
    /// The error a blocked caller sees once the agent enters `status`, or
    /// `None` if `status` does not release waiters.
    pub fn from_status(agent_id: Uuid, status: AgentStatus) -> Option<Self> {
        match status {
            AgentStatus::Disconnect | AgentStatus::PartnerDisconnect => {
                Some(Self::Disconnected(agent_id))
            }
            AgentStatus::Returned => Some(Self::Returned(agent_id)),
            AgentStatus::Timeout | AgentStatus::Expired => Some(Self::Timeout(agent_id)),
            _ => None,
        }
    }

    /// True for the errors that mean the worker is gone, as opposed to a
    /// storage failure or a shutdown.
    pub fn is_agent_loss(&self) -> bool {
        matches!(
            self,
            Self::Disconnected(_) | Self::Returned(_) | Self::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn releasing_statuses_map_to_errors() {
        let id = Uuid::new_v4();
        assert!(matches!(
            AgentError::from_status(id, AgentStatus::Disconnect),
            Some(AgentError::Disconnected(x)) if x == id
        ));
        assert!(matches!(
            AgentError::from_status(id, AgentStatus::PartnerDisconnect),
            Some(AgentError::Disconnected(_))
        ));
        assert!(matches!(
            AgentError::from_status(id, AgentStatus::Returned),
            Some(AgentError::Returned(_))
        ));
        assert!(matches!(
            AgentError::from_status(id, AgentStatus::Expired),
            Some(AgentError::Timeout(_))
        ));
    }

    #[test]
    fn live_statuses_have_no_error() {
        let id = Uuid::new_v4();
        for status in [
            AgentStatus::None,
            AgentStatus::Accepted,
            AgentStatus::Waiting,
            AgentStatus::InTask,
            AgentStatus::Completed,
        ] {
            assert!(AgentError::from_status(id, status).is_none(), "{status}");
        }
    }

    #[test]
    fn shutdown_is_not_agent_loss() {
        let id = Uuid::new_v4();
        assert!(!AgentError::Shutdown(id).is_agent_loss());
        assert!(AgentError::Timeout(id).is_agent_loss());
    }
}
