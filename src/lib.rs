//! classroom-rtc - peer-to-peer classroom session core
//!
//! A WebRTC mesh client for live classrooms: every participant holds one
//! peer connection per remote participant, negotiated over a JSON hub
//! signaling channel, with host-arbitrated screen sharing.

pub mod config;
pub mod transport;
pub mod webrtc;

// Re-exports
pub use config::Config;
pub use transport::{ChannelError, HubConnection, HubConnectionOptions, SignalingChannel};
pub use webrtc::{
    MediaStream, MediaTrack, ParticipantIdentity, ParticipantRole, RtcPeerConnector,
    SessionCoordinator, SessionEvent, WebRTCError,
};
