use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames sent by the process side of a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EndpointFrame {
    #[serde(rename = "hello")]
    Hello { methods: Vec<String> },
    #[serde(rename = "resp")]
    Resp {
        id: u64,
        ok: bool,
        #[serde(default)]
        result: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "event")]
    Event {
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    #[serde(other)]
    Unknown,
}

/// Frames sent by the daemon side of a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "req")]
    Req {
        id: u64,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    #[serde(other)]
    Unknown,
}
