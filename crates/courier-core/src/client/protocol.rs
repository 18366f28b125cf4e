//! JSON-lines wire format spoken with a bridge process.
//!
//! Commands go to the bridge's stdin, events come back on its stdout, one
//! JSON object per line.

use serde::{Deserialize, Serialize};

use super::OutgoingMessage;

/// Command written to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeCommand {
    Initialize,
    #[serde(rename_all = "camelCase")]
    Send {
        request_id: u64,
        to: String,
        message: OutgoingMessage,
    },
    Destroy,
}

/// Event read from the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    Qr {
        qr: String,
    },
    Ready,
    Disconnected {
        #[serde(default)]
        reason: Option<String>,
    },
    AuthFailure {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Sent {
        request_id: u64,
    },
    #[serde(rename_all = "camelCase")]
    SendFailed {
        request_id: u64,
        #[serde(default)]
        error: Option<String>,
    },
}

impl BridgeCommand {
    /// Serialize as a single line (no trailing newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl BridgeEvent {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
