//! WebRTC classroom session implementation
//!
//! This module provides the peer-to-peer side of a live classroom:
//! - Peer connection management (one connection per remote participant)
//! - SDP/ICE signaling over the hub channel
//! - Screen-share permission negotiation
//! - Outbound video track replacement for screen sharing

pub mod peer_connection;
pub mod peer_registry;
pub mod signaling;
pub mod screen_share;
pub mod media_track;
pub mod session;

pub use media_track::{MediaStream, MediaTrack, RemoteStream, TrackKind};
pub use peer_connection::{PeerConnector, PeerLink, PeerSignal, RtcPeerConnector};
pub use peer_registry::{NegotiationRole, PeerRegistry};
pub use screen_share::{ScreenShareNegotiator, ShareRequest};
pub use session::{ParticipantIdentity, ParticipantRole, RemoteParticipant, SessionCoordinator, SessionEvent};
pub use signaling::{IceCandidatePayload, Signal, SignalPayload};

use crate::transport::ChannelError;
use std::error::Error;
use std::fmt;

/// WebRTC-related errors
#[derive(Debug)]
pub enum WebRTCError {
    /// Peer connection creation failed
    ConnectionFailed(String),
    /// SDP processing failed
    SdpError(String),
    /// ICE candidate processing failed
    IceError(String),
    /// Media track error
    MediaError(String),
    /// Signaling channel error
    Channel(ChannelError),
    /// Screen sharing attempted without host permission
    ShareNotPermitted,
    /// Invalid state transition
    InvalidState(String),
}

impl fmt::Display for WebRTCError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebRTCError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            WebRTCError::SdpError(msg) => write!(f, "SDP error: {}", msg),
            WebRTCError::IceError(msg) => write!(f, "ICE error: {}", msg),
            WebRTCError::MediaError(msg) => write!(f, "Media error: {}", msg),
            WebRTCError::Channel(err) => write!(f, "Signaling channel error: {}", err),
            WebRTCError::ShareNotPermitted => write!(f, "Screen sharing is not permitted by the host"),
            WebRTCError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl Error for WebRTCError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WebRTCError::Channel(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ChannelError> for WebRTCError {
    fn from(err: ChannelError) -> Self {
        WebRTCError::Channel(err)
    }
}
