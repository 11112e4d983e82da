//! WebSocket wire format for `/chat/ws`.

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// A query sent by a WebSocket client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ClientMessage {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub agent_name: Option<String>,
}

/// Frames pushed to the client. Each exchange is `start`, any number of
/// `token`s, then `end`. A turn that cannot run ends with `error` after
/// `start`; a message without a usable query gets a lone `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Start { session_id: String, agent: String },
    Token { content: String },
    End { session_id: String },
    Error { content: String },
}

/// Encoder/decoder for the WebSocket channel.
pub trait Protocol: Send + Sync {
    fn encode(&self, frame: &ServerFrame) -> Result<String>;
    fn decode(&self, data: &str) -> Result<ClientMessage>;
    fn name(&self) -> &str;
}

/// JSON text frames.
#[derive(Debug, Clone, Default)]
pub struct JsonProtocol;

impl Protocol for JsonProtocol {
    fn encode(&self, frame: &ServerFrame) -> Result<String> {
        Ok(serde_json::to_string(frame)?)
    }

    fn decode(&self, data: &str) -> Result<ClientMessage> {
        Ok(serde_json::from_str(data)?)
    }

    fn name(&self) -> &str {
        "json"
    }
}
