//! JSON hub protocol codec
//!
//! Frames are JSON records terminated by the ASCII record separator (0x1E).
//! One WebSocket text message may carry several records.

use super::ChannelError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Record separator terminating every frame
pub const RECORD_SEPARATOR: char = '\u{1e}';

/// Hub message type codes
pub mod message_type {
    pub const INVOCATION: u8 = 1;
    pub const STREAM_ITEM: u8 = 2;
    pub const COMPLETION: u8 = 3;
    pub const STREAM_INVOCATION: u8 = 4;
    pub const CANCEL_INVOCATION: u8 = 5;
    pub const PING: u8 = 6;
    pub const CLOSE: u8 = 7;
}

#[derive(Debug, Serialize)]
struct HandshakeRequest<'a> {
    protocol: &'a str,
    version: u32,
}

#[derive(Debug, Deserialize)]
struct HandshakeResponse {
    #[serde(default)]
    error: Option<String>,
}

/// Decoded hub message
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// Server-to-client (or client-to-server) method call
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    /// Result of a client invocation
    Completion {
        invocation_id: String,
        error: Option<String>,
        result: Option<Value>,
    },
    /// Keepalive
    Ping,
    /// Server is closing the connection
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
    /// Message type this client does not handle (streaming)
    Other(u8),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_reconnect: Option<bool>,
}

/// Build the handshake frame opening a JSON protocol session
pub fn handshake_request() -> String {
    let request = HandshakeRequest { protocol: "json", version: 1 };
    // Serializing a two-field struct of plain types cannot fail
    let mut frame = serde_json::to_string(&request).unwrap_or_default();
    frame.push(RECORD_SEPARATOR);
    frame
}

/// Parse the hub's handshake response record.
///
/// Returns the records that followed the handshake in the same message.
pub fn parse_handshake_response(text: &str) -> Result<Vec<&str>, ChannelError> {
    let mut records = split_records(text);
    if records.is_empty() {
        return Err(ChannelError::HandshakeFailed("empty handshake response".to_string()));
    }
    let first = records.remove(0);
    let response: HandshakeResponse = serde_json::from_str(first)
        .map_err(|e| ChannelError::HandshakeFailed(format!("invalid handshake response: {}", e)))?;
    if let Some(error) = response.error {
        return Err(ChannelError::HandshakeFailed(error));
    }
    Ok(records)
}

/// Split a transport message into its non-empty records
pub fn split_records(text: &str) -> Vec<&str> {
    text.split(RECORD_SEPARATOR)
        .filter(|record| !record.trim().is_empty())
        .collect()
}

/// Decode a single record
pub fn decode(record: &str) -> Result<HubMessage, ChannelError> {
    let raw: RawMessage = serde_json::from_str(record)
        .map_err(|e| ChannelError::Protocol(format!("invalid hub message: {}", e)))?;

    match raw.kind {
        message_type::INVOCATION => {
            let target = raw
                .target
                .ok_or_else(|| ChannelError::Protocol("invocation without target".to_string()))?;
            Ok(HubMessage::Invocation {
                invocation_id: raw.invocation_id,
                target,
                arguments: raw.arguments.unwrap_or_default(),
            })
        }
        message_type::COMPLETION => {
            let invocation_id = raw
                .invocation_id
                .ok_or_else(|| ChannelError::Protocol("completion without invocationId".to_string()))?;
            Ok(HubMessage::Completion {
                invocation_id,
                error: raw.error,
                result: raw.result,
            })
        }
        message_type::PING => Ok(HubMessage::Ping),
        message_type::CLOSE => Ok(HubMessage::Close {
            error: raw.error,
            allow_reconnect: raw.allow_reconnect.unwrap_or(false),
        }),
        other => Ok(HubMessage::Other(other)),
    }
}

/// Encode a message as a single terminated record
pub fn encode(message: &HubMessage) -> Result<String, ChannelError> {
    let raw = match message {
        HubMessage::Invocation { invocation_id, target, arguments } => RawMessage {
            kind: message_type::INVOCATION,
            invocation_id: invocation_id.clone(),
            target: Some(target.clone()),
            arguments: Some(arguments.clone()),
            error: None,
            result: None,
            allow_reconnect: None,
        },
        HubMessage::Completion { invocation_id, error, result } => RawMessage {
            kind: message_type::COMPLETION,
            invocation_id: Some(invocation_id.clone()),
            target: None,
            arguments: None,
            error: error.clone(),
            result: result.clone(),
            allow_reconnect: None,
        },
        HubMessage::Ping => RawMessage {
            kind: message_type::PING,
            invocation_id: None,
            target: None,
            arguments: None,
            error: None,
            result: None,
            allow_reconnect: None,
        },
        HubMessage::Close { error, allow_reconnect } => RawMessage {
            kind: message_type::CLOSE,
            invocation_id: None,
            target: None,
            arguments: None,
            error: error.clone(),
            result: None,
            allow_reconnect: Some(*allow_reconnect),
        },
        HubMessage::Other(kind) => {
            return Err(ChannelError::Protocol(format!("cannot encode message type {}", kind)));
        }
    };

    let mut frame = serde_json::to_string(&raw)
        .map_err(|e| ChannelError::Protocol(format!("failed to encode hub message: {}", e)))?;
    frame.push(RECORD_SEPARATOR);
    Ok(frame)
}
