//! Peer connection registry
//!
//! Owns the `connection_id -> peer connection` map. At most one entry exists
//! per remote connection: creation is serialized and returns the existing
//! entry when one is already registered. Removed entries are never reused;
//! a reconnecting participant arrives with a new connection id.

use super::media_track::{MediaStream, MediaTrack, TrackKind};
use super::peer_connection::{PeerConnector, PeerLink, PeerSignalSender};
use super::signaling::SignalPayload;
use super::WebRTCError;
use crate::transport::{methods, SignalingChannel};
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Which side of the offer/answer exchange this client plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    /// Sent the offer (the remote participant joined after us)
    Initiator,
    /// Answered a remote offer
    Responder,
}

struct PeerEntry {
    link: Arc<dyn PeerLink>,
    role: NegotiationRole,
}

/// Registry of active peer connections
pub struct PeerRegistry {
    connector: Arc<dyn PeerConnector>,
    channel: Arc<dyn SignalingChannel>,
    sender_name: String,
    signals: PeerSignalSender,
    entries: Mutex<HashMap<String, PeerEntry>>,
    local_stream: RwLock<Option<MediaStream>>,
    /// Video track currently sent in place of the stream's own video track
    active_video: RwLock<Option<MediaTrack>>,
}

impl PeerRegistry {
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        channel: Arc<dyn SignalingChannel>,
        sender_name: impl Into<String>,
        signals: PeerSignalSender,
    ) -> Self {
        Self {
            connector,
            channel,
            sender_name: sender_name.into(),
            signals,
            entries: Mutex::new(HashMap::new()),
            local_stream: RwLock::new(None),
            active_video: RwLock::new(None),
        }
    }

    /// Record the outbound stream attached to connections created from now on
    pub fn set_local_stream(&self, stream: MediaStream) {
        *self.active_video.write() = None;
        *self.local_stream.write() = Some(stream);
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.local_stream.read().clone()
    }

    /// Tracks a new connection starts with
    fn outbound_tracks(&self) -> Vec<MediaTrack> {
        let Some(stream) = self.local_stream.read().clone() else {
            return Vec::new();
        };
        let active_video = self.active_video.read().clone();
        stream
            .tracks()
            .iter()
            .map(|track| match (&active_video, track.kind()) {
                (Some(active), TrackKind::Video) => active.clone(),
                _ => track.clone(),
            })
            .collect()
    }

    /// Return the connection for `connection_id`, creating it when absent.
    ///
    /// A new initiator connection immediately sends its offer.
    pub async fn create_connection(
        &self,
        connection_id: &str,
        is_initiator: bool,
    ) -> Result<Arc<dyn PeerLink>, WebRTCError> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(connection_id) {
            debug!("Reusing existing connection for {}", connection_id);
            return Ok(entry.link.clone());
        }

        let link = self.connector.connect(connection_id, self.signals.clone()).await?;
        let offer = match self.prepare(&link, is_initiator).await {
            Ok(offer) => offer,
            Err(e) => {
                let _ = link.close().await;
                return Err(e);
            }
        };

        let role = if is_initiator {
            NegotiationRole::Initiator
        } else {
            NegotiationRole::Responder
        };
        entries.insert(
            connection_id.to_string(),
            PeerEntry { link: link.clone(), role },
        );
        drop(entries);
        info!("Peer connection created for {} ({:?})", connection_id, role);

        if let Some(sdp) = offer {
            if let Err(e) = self.send_signal(connection_id, SignalPayload::offer(sdp)).await {
                // An unsent offer leaves a connection nobody will answer
                warn!("Offer to {} not sent, dropping connection: {}", connection_id, e);
                let mut entries = self.entries.lock().await;
                let ours = entries
                    .get(connection_id)
                    .map(|entry| Arc::ptr_eq(&entry.link, &link))
                    .unwrap_or(false);
                if ours {
                    entries.remove(connection_id);
                }
                drop(entries);
                if let Err(close_err) = link.close().await {
                    warn!("Error closing connection {}: {}", connection_id, close_err);
                }
                return Err(e);
            }
        }
        Ok(link)
    }

    async fn prepare(&self, link: &Arc<dyn PeerLink>, is_initiator: bool) -> Result<Option<String>, WebRTCError> {
        for track in self.outbound_tracks() {
            link.add_track(&track).await?;
        }
        if is_initiator {
            Ok(Some(link.create_offer().await?))
        } else {
            Ok(None)
        }
    }

    /// Send a signal frame to one remote connection, stamped with our name
    pub async fn send_signal(&self, connection_id: &str, payload: SignalPayload) -> Result<(), WebRTCError> {
        let json = payload.with_sender_name(self.sender_name.clone()).to_json()?;
        self.channel
            .invoke(
                methods::SEND_SIGNAL,
                vec![Value::from(connection_id), Value::from(json)],
            )
            .await?;
        Ok(())
    }

    pub async fn get(&self, connection_id: &str) -> Option<Arc<dyn PeerLink>> {
        self.entries
            .lock()
            .await
            .get(connection_id)
            .map(|entry| entry.link.clone())
    }

    pub async fn role(&self, connection_id: &str) -> Option<NegotiationRole> {
        self.entries.lock().await.get(connection_id).map(|entry| entry.role)
    }

    pub async fn contains(&self, connection_id: &str) -> bool {
        self.entries.lock().await.contains_key(connection_id)
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Connection ids in sorted order
    pub async fn connection_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close and remove one connection. Returns whether it existed.
    pub async fn close(&self, connection_id: &str) -> bool {
        let removed = self.entries.lock().await.remove(connection_id);
        match removed {
            Some(entry) => {
                if let Err(e) = entry.link.close().await {
                    warn!("Error closing connection {}: {}", connection_id, e);
                }
                info!("Peer connection {} closed", connection_id);
                true
            }
            None => false,
        }
    }

    /// Close every connection. Returns how many were closed; a second call closes none.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<(String, PeerEntry)> = self.entries.lock().await.drain().collect();
        let count = drained.len();
        for (connection_id, entry) in drained {
            if let Err(e) = entry.link.close().await {
                warn!("Error closing connection {}: {}", connection_id, e);
            }
        }
        if count > 0 {
            info!("Closed {} peer connections", count);
        }
        count
    }

    /// Send `track` on the video sender of every connection, without renegotiation.
    ///
    /// Returns the number of senders swapped. Connections without a video sender
    /// are skipped.
    pub async fn replace_video_track(&self, track: &MediaTrack) -> usize {
        *self.active_video.write() = Some(track.clone());

        let links: Vec<(String, Arc<dyn PeerLink>)> = self
            .entries
            .lock()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.link.clone()))
            .collect();

        let mut replaced = 0;
        for (connection_id, link) in links {
            match link.replace_video_track(track).await {
                Ok(true) => replaced += 1,
                Ok(false) => debug!("Connection {} has no video sender", connection_id),
                Err(e) => warn!("Video track replacement failed for {}: {}", connection_id, e),
            }
        }
        debug!("Replaced video track {} on {} connections", track.id(), replaced);
        replaced
    }

    /// Forget any replacement video track; new connections use the stream's own
    pub fn clear_active_video(&self) {
        *self.active_video.write() = None;
    }
}
