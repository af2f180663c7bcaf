//! Runtime coordination layer for crowdsourced task execution.
//!
//! ```text
//! Operator
//!    |-- TaskLauncher   (creates units, throttles how many are launched)
//!    |-- Supervisor     (channels, registration, dispatch, status sync)
//!    |      |-- Channel --Packet--> remote client
//!    |      '-- Agent   (act / observe, status machine, AgentState)
//!    '-- tracking task  (expiry sweep, completion)
//! ```

pub mod agent;
pub mod assignment;
pub mod blueprint;
pub mod channel;
pub mod config;
pub mod error;
pub mod launcher;
pub mod operator;
pub mod packet;
pub mod provider;
pub mod qualifications;
pub mod review;
pub mod supervisor;

pub use agent::{Agent, AgentState};
pub use blueprint::Blueprint;
pub use channel::{Channel, ChannelError, ChannelHandlers, LocalChannel, RemoteEnd};
pub use config::{OperatorConfig, SupervisorConfig, TaskRunArgs};
pub use error::AgentError;
pub use launcher::{AssignmentSource, TaskLauncher};
pub use operator::Operator;
pub use packet::{Packet, PacketType};
pub use provider::{CrowdProvider, MockProvider, ProviderRegistry};
pub use supervisor::{Supervisor, SupervisorJob};
