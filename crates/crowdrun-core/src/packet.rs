//! Typed messages exchanged between the server and one remote endpoint.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

/// Endpoint id the server uses as sender of every packet it emits.
pub const SYSTEM_CHANNEL_ID: &str = "crowdrun";

/// Packet type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketType {
    Alive,
    NewWorker,
    NewAgent,
    SubmitOnboarding,
    AgentAction,
    GetInitData,
    InitData,
    RequestAgentStatus,
    ReturnAgentStatus,
    UpdateAgentStatus,
    RequestAction,
    ProviderDetails,
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Alive => "alive",
            Self::NewWorker => "new_worker",
            Self::NewAgent => "new_agent",
            Self::SubmitOnboarding => "submit_onboarding",
            Self::AgentAction => "agent_action",
            Self::GetInitData => "get_init_data",
            Self::InitData => "init_data",
            Self::RequestAgentStatus => "request_agent_status",
            Self::ReturnAgentStatus => "return_agent_status",
            Self::UpdateAgentStatus => "update_agent_status",
            Self::RequestAction => "request_action",
            Self::ProviderDetails => "provider_details",
        };
        f.write_str(s)
    }
}

impl FromStr for PacketType {
    type Err = PacketTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alive" => Ok(Self::Alive),
            "new_worker" => Ok(Self::NewWorker),
            "new_agent" => Ok(Self::NewAgent),
            "submit_onboarding" => Ok(Self::SubmitOnboarding),
            "agent_action" => Ok(Self::AgentAction),
            "get_init_data" => Ok(Self::GetInitData),
            "init_data" => Ok(Self::InitData),
            "request_agent_status" => Ok(Self::RequestAgentStatus),
            "return_agent_status" => Ok(Self::ReturnAgentStatus),
            "update_agent_status" => Ok(Self::UpdateAgentStatus),
            "request_action" => Ok(Self::RequestAction),
            "provider_details" => Ok(Self::ProviderDetails),
            other => Err(PacketTypeParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PacketTypeParseError(pub String);

impl fmt::Display for PacketTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid packet type: {:?}", self.0)
    }
}

impl std::error::Error for PacketTypeParseError {}

/// One message on a channel. Packets are values: build a new one rather
/// than mutating a received one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub packet_type: PacketType,
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(default)]
    pub data: Value,
}

impl Packet {
    pub fn new(
        packet_type: PacketType,
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            packet_type,
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            data,
        }
    }

    /// A packet sent by the server.
    pub fn from_system(packet_type: PacketType, receiver_id: impl Into<String>, data: Value) -> Self {
        Self::new(packet_type, SYSTEM_CHANNEL_ID, receiver_id, data)
    }

    pub fn alive(receiver_id: impl Into<String>) -> Self {
        Self::from_system(PacketType::Alive, receiver_id, json!({}))
    }

    /// Id correlating a request with its reply, if the packet carries one.
    pub fn request_id(&self) -> Option<&str> {
        self.data.get("request_id").and_then(Value::as_str)
    }

    /// The agent this packet concerns, if it names one.
    pub fn agent_id(&self) -> Option<Uuid> {
        self.data
            .get("agent_id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
    }

    /// The action payload of an AGENT_ACTION packet.
    pub fn action(&self) -> Option<&Value> {
        self.data.get("action")
    }

    /// True for an AGENT_ACTION carrying the agent's final submission.
    pub fn is_submit(&self) -> bool {
        self.packet_type == PacketType::AgentAction
            && self.action().is_some_and(action_is_submit)
    }

    pub fn to_value(&self) -> Value {
        json!({
            "packet_type": self.packet_type,
            "sender_id": self.sender_id,
            "receiver_id": self.receiver_id,
            "data": self.data,
        })
    }

    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }
}

/// True if an action object is flagged as the final submission.
pub fn action_is_submit(action: &Value) -> bool {
    action
        .get("is_submit")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}
