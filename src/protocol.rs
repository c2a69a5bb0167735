//! Shared protocol constants and message shapes for the cairn object protocol
//!
//! Every frame on the wire is `<ascii decimal length><json payload>`, no
//! separator. Payloads are JSON objects tagged with a `type` field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BackupError;

pub const DEFAULT_PORT: u16 = 9001;

// Command vocabulary (value of the `type` field)
pub mod command {
    pub const HANDSHAKE: &str = "HANDSHAKE";
    pub const ADD_FILE: &str = "ADD_FILE";
    pub const ACK: &str = "ACK";
    pub const NACK: &str = "NACK";
    pub const CLOSE: &str = "CLOSE";

    pub const ALL: [&str; 5] = [HANDSHAKE, ADD_FILE, ACK, NACK, CLOSE];
}

// Timeouts used by the client side only; the server waits on peers indefinitely
pub mod timeouts {
    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 5_000;

    // How long the client waits for a reply to a request (ms)
    pub const REPLY_MS: u64 = 60_000;
}

/// Identity assertion exchanged during the handshake.
/// The server's reply carries the same fields without a `type`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub secretkey: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secretkey", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddFile {
    pub client_path: String,
    pub owner_id: i64,
    pub source_location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    Handshake(Credentials),
    AddFile(AddFile),
    Ack,
    Nack { msg: String },
    Close,
}

impl Message {
    pub fn nack(msg: impl Into<String>) -> Self {
        Message::Nack { msg: msg.into() }
    }

    /// Wire name of this message's command
    pub fn command(&self) -> &'static str {
        match self {
            Message::Handshake(_) => command::HANDSHAKE,
            Message::AddFile(_) => command::ADD_FILE,
            Message::Ack => command::ACK,
            Message::Nack { .. } => command::NACK,
            Message::Close => command::CLOSE,
        }
    }

    /// Interpret a received JSON value.
    ///
    /// Unknown or missing `type` values are a protocol error; a known type with
    /// missing or ill-typed fields is a parse error.
    pub fn from_value(value: Value) -> Result<Self, BackupError> {
        let kind = match value.get("type").and_then(Value::as_str) {
            Some(k) => k.to_string(),
            None => return Err(BackupError::Protocol("message has no type".into())),
        };
        if !command::ALL.contains(&kind.as_str()) {
            return Err(BackupError::Protocol(format!("unknown command {kind}")));
        }
        serde_json::from_value(value)
            .map_err(|e| BackupError::Parse(format!("malformed {kind}: {e}")))
    }
}
