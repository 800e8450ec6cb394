//! Signaling transport
//!
//! The classroom core talks to the signaling hub only through the
//! [`SignalingChannel`] trait. [`HubConnection`] is the WebSocket
//! implementation speaking the JSON hub protocol.

pub mod hub_protocol;
pub mod hub_connection;

pub use hub_connection::{HubConnection, HubConnectionOptions};

use async_trait::async_trait;
use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Hub method and event names.
pub mod methods {
    pub const JOIN_ROOM: &str = "JoinRoom";
    pub const SEND_SIGNAL: &str = "SendSignal";
    pub const END_MEETING: &str = "EndMeeting";
    pub const REQUEST_SCREEN_SHARE: &str = "RequestScreenShare";
    pub const ALLOW_SCREEN_SHARE: &str = "AllowScreenShare";
    pub const DENY_SCREEN_SHARE: &str = "DenyScreenShare";
    pub const TOGGLE_SCREEN_SHARE_ACCESS: &str = "ToggleScreenShareAccess";

    pub const USER_JOINED: &str = "UserJoined";
    pub const USER_LEFT: &str = "UserLeft";
    pub const RECEIVE_SIGNAL: &str = "ReceiveSignal";
    pub const MEETING_ENDED: &str = "MeetingEnded";
    pub const SCREEN_SHARE_REQUESTED: &str = "ScreenShareRequested";
    pub const SCREEN_SHARE_PERMISSION_RESULT: &str = "ScreenSharePermissionResult";
    pub const SCREEN_SHARE_ACCESS_UPDATED: &str = "ScreenShareAccessUpdated";

    /// Every inbound event the session coordinator listens to
    pub const INBOUND: [&str; 7] = [
        USER_JOINED,
        USER_LEFT,
        RECEIVE_SIGNAL,
        MEETING_ENDED,
        SCREEN_SHARE_REQUESTED,
        SCREEN_SHARE_PERMISSION_RESULT,
        SCREEN_SHARE_ACCESS_UPDATED,
    ];
}

/// Handler invoked with the raw argument list of an inbound hub message
pub type MessageHandler = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// Signaling transport errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Transport could not be established
    ConnectFailed(String),
    /// Hub rejected or never answered the protocol handshake
    HandshakeFailed(String),
    /// Operation requires an open connection
    NotConnected,
    /// Connection dropped while the operation was in flight
    Disconnected,
    /// Hub returned an error for an invocation
    Invocation { method: String, message: String },
    /// Malformed frame
    Protocol(String),
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::ConnectFailed(msg) => write!(f, "Connect failed: {}", msg),
            ChannelError::HandshakeFailed(msg) => write!(f, "Handshake failed: {}", msg),
            ChannelError::NotConnected => write!(f, "Channel is not connected"),
            ChannelError::Disconnected => write!(f, "Channel disconnected"),
            ChannelError::Invocation { method, message } => {
                write!(f, "Invocation of {} failed: {}", method, message)
            }
            ChannelError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl Error for ChannelError {}

/// Publish/subscribe channel bound to the signaling hub
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Open the transport. Calling it on an open channel is a no-op.
    async fn connect(&self) -> Result<(), ChannelError>;

    /// Invoke a hub method and wait for the hub to acknowledge it
    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<(), ChannelError>;

    /// Register a listener for an inbound message name
    fn on(&self, event: &str, handler: MessageHandler);

    /// Close the transport. Idempotent, safe when never connected.
    async fn disconnect(&self);

    /// Whether the channel is currently open
    fn is_connected(&self) -> bool;
}
