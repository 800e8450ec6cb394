//! Local and remote media model
//!
//! A [`MediaTrack`] wraps a `webrtc` sample track: the caller writes encoded
//! frames into it and every peer connection carrying the track sends them.
//! Tracks carry an enabled flag (mute) and an ended signal, the equivalent of
//! a capture source being stopped.

use super::WebRTCError;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }

    fn codec(&self) -> RTCRtpCodecCapability {
        match self {
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: "".to_string(),
                rtcp_feedback: vec![],
            },
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
        }
    }

    /// Map a `webrtc` codec type; `Unspecified` has no counterpart
    pub fn from_codec_type(kind: RTPCodecType) -> Option<Self> {
        match kind {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            _ => None,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    stream_id: String,
    label: String,
    local: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
}

/// Outbound media track. Clones share the same underlying track.
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Create a track belonging to `stream_id`
    pub fn new(kind: TrackKind, stream_id: impl Into<String>, label: impl Into<String>) -> Self {
        let stream_id = stream_id.into();
        let id = format!("{}-{}", kind, uuid::Uuid::new_v4());
        let local = Arc::new(TrackLocalStaticSample::new(kind.codec(), id.clone(), stream_id.clone()));

        Self {
            inner: Arc::new(TrackInner {
                id,
                kind,
                stream_id,
                label: label.into(),
                local,
                enabled: AtomicBool::new(true),
                ended: watch::channel(false).0,
            }),
        }
    }

    pub fn video(stream_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(TrackKind::Video, stream_id, label)
    }

    pub fn audio(stream_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self::new(TrackKind::Audio, stream_id, label)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// The `webrtc` track handed to peer connection senders
    pub fn local_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.inner.local.clone()
    }

    /// Write one encoded frame. Muted or ended tracks drop the frame.
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<(), WebRTCError> {
        if !self.is_enabled() || self.is_ended() {
            return Ok(());
        }
        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        self.inner
            .local
            .write_sample(&sample)
            .await
            .map_err(|e| WebRTCError::MediaError(format!("Failed to write sample to {}: {}", self.id(), e)))
    }

    /// Mute or unmute the track
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Relaxed)
    }

    /// Stop the track; fires the ended signal once
    pub fn stop(&self) {
        self.inner.ended.send_if_modified(|ended| {
            if *ended {
                false
            } else {
                *ended = true;
                true
            }
        });
    }

    pub fn is_ended(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// Resolves once the track has been stopped
    pub async fn ended(&self) {
        let mut rx = self.inner.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    /// Number of tasks waiting on the ended signal
    pub fn listener_count(&self) -> usize {
        self.inner.ended.receiver_count()
    }

    /// Whether two handles point at the same track
    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("stream_id", &self.inner.stream_id)
            .field("label", &self.inner.label)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// A group of local tracks sent together (camera + microphone, or a screen capture)
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), tracks: Vec::new() }
    }

    /// Camera stream with one video and one audio track
    pub fn camera() -> Self {
        let mut stream = Self::new(format!("camera-{}", uuid::Uuid::new_v4()));
        let video = MediaTrack::video(stream.id.clone(), "camera");
        let audio = MediaTrack::audio(stream.id.clone(), "microphone");
        stream.add_track(video);
        stream.add_track(audio);
        stream
    }

    /// Display capture stream with a single video track
    pub fn display_capture() -> Self {
        let mut stream = Self::new(format!("screen-{}", uuid::Uuid::new_v4()));
        let video = MediaTrack::video(stream.id.clone(), "screen");
        stream.add_track(video);
        stream
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn add_track(&mut self, track: MediaTrack) {
        self.tracks.push(track);
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// First video track, if any
    pub fn video_track(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    /// First audio track, if any
    pub fn audio_track(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    /// Stop every track of the stream
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Track received from a remote participant
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
    /// Underlying `webrtc` track for reading RTP; absent for non-RTC backends
    pub source: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

/// Media arriving from one remote participant
#[derive(Debug, Clone, Default)]
pub struct RemoteStream {
    pub stream_id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Add a track, replacing one with the same id
    pub fn add_track(&mut self, track: RemoteTrack) {
        if self.stream_id.is_empty() {
            self.stream_id = track.stream_id.clone();
        }
        self.tracks.retain(|t| t.id != track.id);
        self.tracks.push(track);
    }

    pub fn video_track(&self) -> Option<&RemoteTrack> {
        self.tracks.iter().find(|t| t.kind == TrackKind::Video)
    }

    pub fn audio_track(&self) -> Option<&RemoteTrack> {
        self.tracks.iter().find(|t| t.kind == TrackKind::Audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_camera_stream_has_both_kinds() {
        let stream = MediaStream::camera();
        assert_eq!(stream.tracks().len(), 2);
        let video = stream.video_track().unwrap();
        assert_eq!(video.kind(), TrackKind::Video);
        assert_eq!(video.stream_id(), stream.id());
        assert_eq!(video.local_track().kind(), RTPCodecType::Video);
        assert!(stream.audio_track().is_some());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let track = MediaTrack::video("s", "camera");
        assert!(!track.is_ended());
        track.stop();
        track.stop();
        assert!(track.is_ended());
    }

    #[tokio::test]
    async fn test_ended_resolves_after_stop() {
        let track = MediaTrack::video("s", "screen");
        let watcher = track.clone();
        let handle = tokio::spawn(async move { watcher.ended().await });
        track.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("ended signal")
            .unwrap();
    }

    #[test]
    fn test_clones_share_state() {
        let track = MediaTrack::audio("s", "microphone");
        let clone = track.clone();
        clone.set_enabled(false);
        assert!(!track.is_enabled());
        assert!(track.same_track(&clone));
        assert!(!track.same_track(&MediaTrack::audio("s", "microphone")));
    }

    #[test]
    fn test_remote_stream_replaces_duplicate_track() {
        let mut stream = RemoteStream::default();
        let track = RemoteTrack {
            id: "v1".to_string(),
            kind: TrackKind::Video,
            stream_id: "remote".to_string(),
            source: None,
        };
        stream.add_track(track.clone());
        stream.add_track(track);
        assert_eq!(stream.tracks.len(), 1);
        assert_eq!(stream.stream_id, "remote");
        assert!(stream.audio_track().is_none());
    }
}
