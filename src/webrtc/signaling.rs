//! WebRTC Signaling Protocol
//!
//! Peer signals travel as JSON strings inside the hub's `SendSignal` /
//! `ReceiveSignal` messages, in the shape browsers produce:
//! `{"type":"offer","sdp":"...","senderName":"Ada"}` or
//! `{"candidate":{"candidate":"...","sdpMid":"0","sdpMLineIndex":0},"senderName":"Ada"}`.

use super::WebRTCError;
use crate::transport::methods;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

/// ICE candidate in browser `RTCIceCandidateInit` JSON form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for IceCandidatePayload {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidatePayload> for RTCIceCandidateInit {
    fn from(payload: IceCandidatePayload) -> Self {
        RTCIceCandidateInit {
            candidate: payload.candidate,
            sdp_mid: payload.sdp_mid,
            sdp_mline_index: payload.sdp_mline_index,
            username_fragment: payload.username_fragment,
        }
    }
}

/// Signal frame exchanged between two peers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalPayload {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidatePayload>,
    #[serde(rename = "senderName", default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
}

/// Classified signal frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate(IceCandidatePayload),
    /// Frame carrying nothing this client acts on (a bare name announcement)
    Unknown,
}

impl SignalPayload {
    pub fn offer(sdp: String) -> Self {
        Self { kind: Some("offer".to_string()), sdp: Some(sdp), ..Default::default() }
    }

    pub fn answer(sdp: String) -> Self {
        Self { kind: Some("answer".to_string()), sdp: Some(sdp), ..Default::default() }
    }

    pub fn candidate(candidate: IceCandidatePayload) -> Self {
        Self { candidate: Some(candidate), ..Default::default() }
    }

    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = Some(name.into());
        self
    }

    /// Parse a signal from its JSON string form
    pub fn from_json(json: &str) -> Result<Self, WebRTCError> {
        serde_json::from_str(json)
            .map_err(|e| WebRTCError::SdpError(format!("Invalid signaling message: {}", e)))
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, WebRTCError> {
        serde_json::to_string(self)
            .map_err(|e| WebRTCError::SdpError(format!("Failed to serialize message: {}", e)))
    }

    /// Sender name, ignoring blank values
    pub fn sender_name(&self) -> Option<&str> {
        self.sender_name.as_deref().filter(|name| !name.trim().is_empty())
    }

    /// Classify the frame. Offers and answers take precedence over candidates.
    pub fn signal(&self) -> Signal {
        match (self.kind.as_deref(), &self.sdp, &self.candidate) {
            (Some("offer"), Some(sdp), _) => Signal::Offer { sdp: sdp.clone() },
            (Some("answer"), Some(sdp), _) => Signal::Answer { sdp: sdp.clone() },
            (_, _, Some(candidate)) => Signal::Candidate(candidate.clone()),
            _ => Signal::Unknown,
        }
    }
}

/// Hub message delivered to the session coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    UserJoined { connection_id: String, user_id: String },
    UserLeft { connection_id: String },
    ReceiveSignal { sender_connection_id: String, payload: String },
    MeetingEnded,
    ScreenShareRequested { requester_id: String, requester_name: String },
    ScreenSharePermissionResult { granted: bool },
    ScreenShareAccessUpdated { allowed: bool },
}

impl InboundMessage {
    /// Decode a hub invocation by event name and argument list
    pub fn from_hub(event: &str, args: &[Value]) -> Result<Self, WebRTCError> {
        match event {
            methods::USER_JOINED => Ok(InboundMessage::UserJoined {
                connection_id: string_arg(event, args, 0)?,
                user_id: optional_string_arg(args, 1).unwrap_or_default(),
            }),
            methods::USER_LEFT => Ok(InboundMessage::UserLeft {
                connection_id: string_arg(event, args, 0)?,
            }),
            methods::RECEIVE_SIGNAL => Ok(InboundMessage::ReceiveSignal {
                sender_connection_id: string_arg(event, args, 0)?,
                payload: signal_arg(event, args, 1)?,
            }),
            methods::MEETING_ENDED => Ok(InboundMessage::MeetingEnded),
            methods::SCREEN_SHARE_REQUESTED => Ok(InboundMessage::ScreenShareRequested {
                requester_id: string_arg(event, args, 0)?,
                requester_name: optional_string_arg(args, 1).unwrap_or_default(),
            }),
            methods::SCREEN_SHARE_PERMISSION_RESULT => Ok(InboundMessage::ScreenSharePermissionResult {
                granted: bool_arg(event, args, 0)?,
            }),
            methods::SCREEN_SHARE_ACCESS_UPDATED => Ok(InboundMessage::ScreenShareAccessUpdated {
                allowed: bool_arg(event, args, 0)?,
            }),
            other => Err(WebRTCError::InvalidState(format!("Unknown hub message {}", other))),
        }
    }
}

fn optional_string_arg(args: &[Value], index: usize) -> Option<String> {
    match args.get(index)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_arg(event: &str, args: &[Value], index: usize) -> Result<String, WebRTCError> {
    optional_string_arg(args, index)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| WebRTCError::InvalidState(format!("{} argument {} must be a non-empty string", event, index)))
}

/// Signals normally arrive as JSON strings; tolerate an already-decoded object
fn signal_arg(event: &str, args: &[Value], index: usize) -> Result<String, WebRTCError> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(value @ Value::Object(_)) => Ok(value.to_string()),
        _ => Err(WebRTCError::InvalidState(format!("{} argument {} must be a signal", event, index))),
    }
}

fn bool_arg(event: &str, args: &[Value], index: usize) -> Result<bool, WebRTCError> {
    args.get(index)
        .and_then(Value::as_bool)
        .ok_or_else(|| WebRTCError::InvalidState(format!("{} argument {} must be a boolean", event, index)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_browser_offer() {
        let json = r#"{"type":"offer","sdp":"v=0\r\n...","senderName":"Ada Lovelace"}"#;
        let payload = SignalPayload::from_json(json).unwrap();
        assert_eq!(payload.sender_name(), Some("Ada Lovelace"));
        match payload.signal() {
            Signal::Offer { sdp } => assert!(sdp.starts_with("v=0")),
            other => panic!("Expected Offer, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_browser_candidate() {
        let json = r#"{"candidate":{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"abcd"},"senderName":"Ada"}"#;
        match SignalPayload::from_json(json).unwrap().signal() {
            Signal::Candidate(c) => {
                assert_eq!(c.sdp_mid.as_deref(), Some("0"));
                assert_eq!(c.sdp_mline_index, Some(0));
                assert_eq!(c.username_fragment.as_deref(), Some("abcd"));
            }
            other => panic!("Expected Candidate, got {:?}", other),
        }
    }

    #[test]
    fn test_answer_wire_shape() {
        let json = SignalPayload::answer("v=0".to_string())
            .with_sender_name("Grace")
            .to_json()
            .unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value, json!({"type": "answer", "sdp": "v=0", "senderName": "Grace"}));
    }

    #[test]
    fn test_candidate_wire_shape_has_no_type() {
        let payload = SignalPayload::candidate(IceCandidatePayload {
            candidate: "candidate:1".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        })
        .with_sender_name("Grace");
        let value: Value = serde_json::from_str(&payload.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"candidate": {"candidate": "candidate:1", "sdpMid": "0", "sdpMLineIndex": 0}, "senderName": "Grace"})
        );
    }

    #[test]
    fn test_offer_without_sdp_is_unknown() {
        let payload = SignalPayload { kind: Some("offer".to_string()), ..Default::default() };
        assert_eq!(payload.signal(), Signal::Unknown);
    }

    #[test]
    fn test_blank_sender_name_is_ignored() {
        let payload = SignalPayload::default().with_sender_name("  ");
        assert_eq!(payload.sender_name(), None);
    }

    #[test]
    fn test_inbound_user_joined() {
        let msg = InboundMessage::from_hub("UserJoined", &[json!("g1"), json!("u1")]).unwrap();
        assert_eq!(
            msg,
            InboundMessage::UserJoined { connection_id: "g1".to_string(), user_id: "u1".to_string() }
        );
    }

    #[test]
    fn test_inbound_numeric_user_id() {
        let msg = InboundMessage::from_hub("UserJoined", &[json!("g1"), json!(42)]).unwrap();
        assert_eq!(
            msg,
            InboundMessage::UserJoined { connection_id: "g1".to_string(), user_id: "42".to_string() }
        );
    }

    #[test]
    fn test_inbound_rejects_bad_arguments() {
        assert!(InboundMessage::from_hub("UserLeft", &[]).is_err());
        assert!(InboundMessage::from_hub("ScreenShareAccessUpdated", &[json!("yes")]).is_err());
        assert!(InboundMessage::from_hub("Unrelated", &[]).is_err());
    }

    #[test]
    fn test_inbound_meeting_ended_takes_no_arguments() {
        assert_eq!(InboundMessage::from_hub("MeetingEnded", &[]).unwrap(), InboundMessage::MeetingEnded);
    }
}
