//! Per-agent record of what was exchanged with the remote client.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crowdrun_db::models::{AgentExchange, ExchangeDirection};
use crowdrun_db::{Datastore, DatastoreResult};

use crate::packet::{Packet, PacketType, action_is_submit};

/// Inputs (actions from the worker) and outputs (observations sent to the
/// worker) of one agent, plus its init data and final submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    init_data: Option<Value>,
    inputs: Vec<Value>,
    outputs: Vec<Value>,
    submission: Option<Value>,
}

impl AgentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_init_data(&mut self, init_data: Value) {
        self.init_data = Some(init_data);
    }

    pub fn init_data(&self) -> Option<&Value> {
        self.init_data.as_ref()
    }

    /// Record an action received from the worker. A submit action also
    /// becomes the submission.
    pub fn record_inbound(&mut self, action: Value) {
        if action_is_submit(&action) {
            self.submission = Some(action.clone());
        }
        self.inputs.push(action);
    }

    /// Record an observation sent to the worker.
    pub fn record_outbound(&mut self, observation: Value) {
        self.outputs.push(observation);
    }

    pub fn inputs(&self) -> &[Value] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Value] {
        &self.outputs
    }

    pub fn submission(&self) -> Option<&Value> {
        self.submission.as_ref()
    }

    /// True once the worker has sent anything, i.e. there is work that a
    /// reassignment would lose.
    pub fn has_inputs(&self) -> bool {
        !self.inputs.is_empty()
    }

    /// What a (re)connecting client needs to rebuild its view.
    pub fn current_view(&self) -> Value {
        json!({
            "init_data": self.init_data,
            "inputs": self.inputs,
            "outputs": self.outputs,
        })
    }

    /// Serialized form handed to review tooling.
    pub fn final_data(&self) -> Value {
        json!({
            "init_data": self.init_data,
            "inputs": self.inputs,
            "outputs": self.outputs,
            "submission": self.submission,
        })
    }

    /// Rebuild the state from an agent's exchange log.
    ///
    /// Outbound INIT_DATA sets the init data; AGENT_ACTION packets become
    /// inputs or outputs by direction. Anything else is skipped.
    pub fn from_exchanges(exchanges: &[AgentExchange]) -> Self {
        let mut state = Self::new();
        for exchange in exchanges {
            let Ok(packet) = Packet::from_value(exchange.packet.clone()) else {
                continue;
            };
            match (exchange.direction, packet.packet_type) {
                (ExchangeDirection::Outbound, PacketType::InitData) => {
                    if let Some(init_data) = packet.data.get("init_data") {
                        state.set_init_data(init_data.clone());
                    }
                }
                (ExchangeDirection::Inbound, PacketType::AgentAction) => {
                    state.record_inbound(packet.action().cloned().unwrap_or(Value::Null));
                }
                (ExchangeDirection::Outbound, PacketType::AgentAction) => {
                    state.record_outbound(packet.action().cloned().unwrap_or(Value::Null));
                }
                _ => {}
            }
        }
        state
    }

    /// Load an agent's state from storage.
    pub async fn load(datastore: &dyn Datastore, agent_id: Uuid) -> DatastoreResult<Self> {
        let exchanges = datastore.list_agent_exchanges(agent_id).await?;
        Ok(Self::from_exchanges(&exchanges))
    }
}
