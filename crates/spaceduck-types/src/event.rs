use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named event on the gateway bus. Task lifecycle events use the stable
/// `task:*` names; any other name may act as an external trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub name: String,
    pub payload: Value,
}

impl GatewayEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}
