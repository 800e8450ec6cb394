//! Classroom Session Management
//!
//! [`SessionCoordinator`] ties the signaling channel, the peer registry,
//! the screen-share negotiator and the local media together:
//! - Hub messages and peer backend signals are queued and handled in
//!   arrival order by one dispatch task
//! - Session events are published on a broadcast bus
//! - Teardown is idempotent

use super::media_track::{MediaStream, MediaTrack, RemoteStream, TrackKind};
use super::peer_connection::{PeerConnector, PeerSignal};
use super::peer_registry::PeerRegistry;
use super::screen_share::{ScreenShareNegotiator, ShareRequest};
use super::signaling::{InboundMessage, Signal, SignalPayload};
use super::WebRTCError;
use crate::config::FALLBACK_DISPLAY_NAME;
use crate::transport::{methods, SignalingChannel};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Participant role, decided by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantRole {
    /// Runs the meeting: ends it, arbitrates screen sharing
    Host,
    Guest,
}

/// Application identity of the local participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantIdentity {
    pub user_id: String,
    pub user_name: String,
}

impl ParticipantIdentity {
    /// Blank names fall back to a placeholder so every signal carries a name
    pub fn new(user_id: impl Into<String>, user_name: Option<&str>) -> Self {
        let user_name = user_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(FALLBACK_DISPLAY_NAME)
            .to_string();
        Self {
            user_id: user_id.into(),
            user_name,
        }
    }
}

/// Remote participant as learned from the hub and peer signals
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteParticipant {
    pub connection_id: String,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
}

/// Event published to the classroom UI
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Media from a remote participant arrived or gained a track
    RemoteStream { connection_id: String, stream: RemoteStream },
    /// A remote participant left the room
    PeerLeft { connection_id: String },
    /// A remote participant announced its display name
    PeerNameUpdate { connection_id: String, name: String },
    /// The host ended the meeting; the caller should tear down
    MeetingEnded,
    /// Host only: a guest asks to share its screen
    ScreenShareRequest { requester_id: String, requester_name: String },
    /// Guest only: the host answered our request
    ScreenShareResult { granted: bool },
    /// Room-wide screen-share flag changed
    ScreenShareAccessUpdate { allowed: bool },
    /// Our screen share ended and the camera track was restored
    ScreenShareStopped,
}

/// Screen share in progress and the task waiting for its capture to end
struct ActiveShare {
    track: MediaTrack,
    watcher: JoinHandle<()>,
}

type Queues = (
    mpsc::UnboundedReceiver<InboundMessage>,
    mpsc::UnboundedReceiver<PeerSignal>,
);

/// Peer-to-peer classroom session for one local participant
pub struct SessionCoordinator {
    identity: ParticipantIdentity,
    role: ParticipantRole,
    channel: Arc<dyn SignalingChannel>,
    registry: PeerRegistry,
    negotiator: Mutex<ScreenShareNegotiator>,
    /// Track currently shared in place of the camera
    screen_share: Mutex<Option<ActiveShare>>,
    remote_streams: Mutex<HashMap<String, RemoteStream>>,
    participants: Mutex<HashMap<String, RemoteParticipant>>,
    events: broadcast::Sender<SessionEvent>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    queues: Mutex<Option<Queues>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    handlers_registered: AtomicBool,
    closed: AtomicBool,
}

impl SessionCoordinator {
    pub fn new(
        identity: ParticipantIdentity,
        role: ParticipantRole,
        channel: Arc<dyn SignalingChannel>,
        connector: Arc<dyn PeerConnector>,
        event_capacity: usize,
    ) -> Arc<Self> {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(event_capacity.max(1));
        let registry = PeerRegistry::new(connector, channel.clone(), identity.user_name.clone(), signal_tx);

        Arc::new(Self {
            identity,
            role,
            channel,
            registry,
            negotiator: Mutex::new(ScreenShareNegotiator::new(role)),
            screen_share: Mutex::new(None),
            remote_streams: Mutex::new(HashMap::new()),
            participants: Mutex::new(HashMap::new()),
            events,
            inbound_tx,
            queues: Mutex::new(Some((inbound_rx, signal_rx))),
            dispatcher: Mutex::new(None),
            handlers_registered: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn identity(&self) -> &ParticipantIdentity {
        &self.identity
    }

    pub fn role(&self) -> ParticipantRole {
        self.role
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Subscribe to session events. Every subscriber sees every event.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    fn ensure_open(&self) -> Result<(), WebRTCError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(WebRTCError::InvalidState("session has been closed".to_string()))
        } else {
            Ok(())
        }
    }

    // Commands

    /// Record the camera stream; its tracks are attached to new connections
    /// and its video track is restored when a screen share ends
    pub fn set_local_stream(&self, stream: MediaStream) {
        self.registry.set_local_stream(stream);
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.registry.local_stream()
    }

    /// Connect to the hub (first call only) and join `room_id`
    pub async fn join_room(self: &Arc<Self>, room_id: &str) -> Result<(), WebRTCError> {
        self.ensure_open()?;
        self.register_handlers();
        self.channel.connect().await?;
        self.start_dispatcher();

        self.channel
            .invoke(
                methods::JOIN_ROOM,
                vec![Value::from(room_id), Value::from(self.identity.user_id.as_str())],
            )
            .await?;
        info!("Joined room {} as {} ({:?})", room_id, self.identity.user_id, self.role);
        Ok(())
    }

    /// End the meeting for everyone in `room_id`
    pub async fn end_meeting(&self, room_id: &str) -> Result<(), WebRTCError> {
        self.ensure_open()?;
        self.channel
            .invoke(methods::END_MEETING, vec![Value::from(room_id)])
            .await?;
        info!("Ended meeting {}", room_id);
        Ok(())
    }

    /// Guest: ask the host for permission to share
    pub async fn request_screen_share(&self, room_id: &str) -> Result<(), WebRTCError> {
        self.ensure_open()?;
        self.channel
            .invoke(
                methods::REQUEST_SCREEN_SHARE,
                vec![Value::from(room_id), Value::from(self.identity.user_name.as_str())],
            )
            .await?;
        debug!("Requested screen share in {}", room_id);
        Ok(())
    }

    /// Host: grant a pending request
    pub async fn allow_screen_share(&self, requester_id: &str) -> Result<(), WebRTCError> {
        self.resolve_share_request(methods::ALLOW_SCREEN_SHARE, requester_id).await
    }

    /// Host: refuse a pending request
    pub async fn deny_screen_share(&self, requester_id: &str) -> Result<(), WebRTCError> {
        self.resolve_share_request(methods::DENY_SCREEN_SHARE, requester_id).await
    }

    async fn resolve_share_request(&self, method: &str, requester_id: &str) -> Result<(), WebRTCError> {
        self.ensure_open()?;
        self.negotiator.lock().take_request(requester_id);
        self.channel
            .invoke(method, vec![Value::from(requester_id)])
            .await?;
        debug!("{} for {}", method, requester_id);
        Ok(())
    }

    /// Host: switch the room-wide screen-share flag
    pub async fn toggle_screen_share_access(&self, room_id: &str, allow: bool) -> Result<(), WebRTCError> {
        self.ensure_open()?;
        self.channel
            .invoke(
                methods::TOGGLE_SCREEN_SHARE_ACCESS,
                vec![Value::from(room_id), Value::from(allow)],
            )
            .await?;
        self.negotiator.lock().on_access_updated(allow);
        info!("Screen sharing for everyone in {}: {}", room_id, allow);
        Ok(())
    }

    /// Send `track` on every connection's video sender. Returns the number swapped.
    pub async fn replace_video_track(&self, track: &MediaTrack) -> usize {
        self.registry.replace_video_track(track).await
    }

    pub fn can_share_screen(&self) -> bool {
        self.negotiator.lock().can_share()
    }

    pub fn pending_share_requests(&self) -> Vec<ShareRequest> {
        self.negotiator.lock().pending_requests().to_vec()
    }

    pub fn screen_share_globally_allowed(&self) -> bool {
        self.negotiator.lock().is_globally_allowed()
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen_share.lock().is_some()
    }

    /// Start sending a captured screen track in place of the camera.
    ///
    /// Fails with `ShareNotPermitted` before touching any connection when the
    /// negotiator refuses. When the captured track ends, the share stops.
    pub async fn start_screen_share(self: &Arc<Self>, track: MediaTrack) -> Result<usize, WebRTCError> {
        self.ensure_open()?;
        self.negotiator.lock().check_can_share()?;
        if track.kind() != TrackKind::Video {
            return Err(WebRTCError::MediaError("screen share needs a video track".to_string()));
        }

        let replaced = self.registry.replace_video_track(&track).await;
        info!("Screen share started on {} connections", replaced);

        let weak = Arc::downgrade(self);
        let ended = track.clone();
        let watcher = tokio::spawn(async move {
            ended.ended().await;
            let Some(this) = weak.upgrade() else {
                return;
            };
            // Only the share that owns this watcher may be ended by it
            let share = {
                let mut active = this.screen_share.lock();
                let current = active
                    .as_ref()
                    .map(|share| share.track.same_track(&ended))
                    .unwrap_or(false);
                if current {
                    active.take()
                } else {
                    None
                }
            };
            if share.is_some() {
                debug!("Captured screen track ended");
                this.restore_camera().await;
            }
        });

        let previous = self.screen_share.lock().replace(ActiveShare {
            track: track.clone(),
            watcher,
        });
        if let Some(previous) = previous {
            previous.watcher.abort();
        }
        // The capture may have ended before the watcher was registered
        if track.is_ended() {
            self.stop_screen_share().await;
        }

        Ok(replaced)
    }

    /// Restore the camera video track. Returns whether a share was active.
    pub async fn stop_screen_share(&self) -> bool {
        let share = self.screen_share.lock().take();
        let Some(share) = share else {
            return false;
        };
        share.watcher.abort();
        self.restore_camera().await;
        true
    }

    async fn restore_camera(&self) {
        let camera = self
            .registry
            .local_stream()
            .and_then(|stream| stream.video_track().cloned());
        match camera {
            Some(camera) => {
                self.registry.replace_video_track(&camera).await;
            }
            None => self.registry.clear_active_video(),
        }

        self.negotiator.lock().on_share_stopped();
        info!("Screen share stopped");
        self.emit(SessionEvent::ScreenShareStopped);
    }

    /// Remote participants currently known, sorted by connection id
    pub fn participants(&self) -> Vec<RemoteParticipant> {
        let mut list: Vec<RemoteParticipant> = self.participants.lock().values().cloned().collect();
        list.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        list
    }

    pub fn remote_stream(&self, connection_id: &str) -> Option<RemoteStream> {
        self.remote_streams.lock().get(connection_id).cloned()
    }

    /// Tear the session down: close every connection, stop the camera
    /// stream, disconnect from the hub. Safe to call more than once.
    pub async fn close_all(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Session already closed");
            return;
        }

        let share = self.screen_share.lock().take();
        if let Some(share) = share {
            share.watcher.abort();
            share.track.stop();
        }
        self.registry.close_all().await;
        if let Some(stream) = self.registry.local_stream() {
            stream.stop();
        }
        self.channel.disconnect().await;

        if let Some(handle) = self.dispatcher.lock().take() {
            handle.abort();
        }
        self.remote_streams.lock().clear();
        self.participants.lock().clear();
        info!("Session for {} closed", self.identity.user_id);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // Inbound routing

    /// Forward every inbound hub message into the dispatch queue
    fn register_handlers(&self) {
        if self.handlers_registered.swap(true, Ordering::SeqCst) {
            return;
        }
        for event in methods::INBOUND {
            let tx = self.inbound_tx.clone();
            self.channel.on(
                event,
                Arc::new(move |args: Vec<Value>| match InboundMessage::from_hub(event, &args) {
                    Ok(message) => {
                        let _ = tx.send(message);
                    }
                    Err(e) => warn!("Dropping malformed {} message: {}", event, e),
                }),
            );
        }
    }

    fn start_dispatcher(self: &Arc<Self>) {
        let Some((inbound, signals)) = self.queues.lock().take() else {
            return;
        };
        let handle = tokio::spawn(run_dispatcher(Arc::downgrade(self), inbound, signals));
        *self.dispatcher.lock() = Some(handle);
    }

    /// Handle one hub message
    pub async fn handle_inbound(&self, message: InboundMessage) {
        if self.is_closed() {
            debug!("Ignoring {:?} after close", message);
            return;
        }

        match message {
            InboundMessage::UserJoined { connection_id, user_id } => {
                info!("User {} joined as {}", user_id, connection_id);
                self.participants
                    .lock()
                    .entry(connection_id.clone())
                    .or_insert_with(|| RemoteParticipant {
                        connection_id: connection_id.clone(),
                        ..Default::default()
                    })
                    .user_id = Some(user_id);
                if let Err(e) = self.registry.create_connection(&connection_id, true).await {
                    warn!("Failed to connect to {}: {}", connection_id, e);
                }
            }

            InboundMessage::UserLeft { connection_id } => {
                self.registry.close(&connection_id).await;
                self.remote_streams.lock().remove(&connection_id);
                self.participants.lock().remove(&connection_id);
                info!("Peer {} left", connection_id);
                self.emit(SessionEvent::PeerLeft { connection_id });
            }

            InboundMessage::ReceiveSignal { sender_connection_id, payload } => {
                self.route_signal(&sender_connection_id, &payload).await;
            }

            InboundMessage::MeetingEnded => {
                info!("Meeting ended by host");
                self.emit(SessionEvent::MeetingEnded);
            }

            InboundMessage::ScreenShareRequested { requester_id, requester_name } => {
                let request = self
                    .negotiator
                    .lock()
                    .on_share_requested(&requester_id, &requester_name);
                if let Some(request) = request {
                    info!("{} asks to share their screen", request.requester_name);
                    self.emit(SessionEvent::ScreenShareRequest {
                        requester_id: request.requester_id,
                        requester_name: request.requester_name,
                    });
                }
            }

            InboundMessage::ScreenSharePermissionResult { granted } => {
                self.negotiator.lock().on_permission_result(granted);
                info!("Screen share request {}", if granted { "granted" } else { "denied" });
                self.emit(SessionEvent::ScreenShareResult { granted });
            }

            InboundMessage::ScreenShareAccessUpdated { allowed } => {
                self.negotiator.lock().on_access_updated(allowed);
                info!("Room-wide screen sharing: {}", allowed);
                self.emit(SessionEvent::ScreenShareAccessUpdate { allowed });
            }
        }
    }

    /// Drive the peer connection of `connection_id` with one signal frame
    async fn route_signal(&self, connection_id: &str, json: &str) {
        let payload = match SignalPayload::from_json(json) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Dropping signal from {}: {}", connection_id, e);
                return;
            }
        };

        if let Some(name) = payload.sender_name() {
            self.participants
                .lock()
                .entry(connection_id.to_string())
                .or_insert_with(|| RemoteParticipant {
                    connection_id: connection_id.to_string(),
                    ..Default::default()
                })
                .user_name = Some(name.to_string());
            self.emit(SessionEvent::PeerNameUpdate {
                connection_id: connection_id.to_string(),
                name: name.to_string(),
            });
        }

        match payload.signal() {
            Signal::Offer { sdp } => {
                if let Err(e) = self.answer_offer(connection_id, &sdp).await {
                    warn!("Failed to answer offer from {}: {}", connection_id, e);
                }
            }
            Signal::Answer { sdp } => match self.registry.get(connection_id).await {
                Some(link) => {
                    if let Err(e) = link.accept_answer(&sdp).await {
                        warn!("Failed to apply answer from {}: {}", connection_id, e);
                    }
                }
                None => warn!("Dropping answer from {}: no connection", connection_id),
            },
            Signal::Candidate(candidate) => {
                let link = match self.registry.create_connection(connection_id, false).await {
                    Ok(link) => link,
                    Err(e) => {
                        warn!("Failed to connect to {}: {}", connection_id, e);
                        return;
                    }
                };
                if let Err(e) = link.add_ice_candidate(candidate).await {
                    warn!("Ignoring ICE candidate from {}: {}", connection_id, e);
                }
            }
            Signal::Unknown => debug!("Signal from {} carries no offer, answer or candidate", connection_id),
        }
    }

    async fn answer_offer(&self, connection_id: &str, sdp: &str) -> Result<(), WebRTCError> {
        let link = self.registry.create_connection(connection_id, false).await?;
        let answer = link.accept_offer(sdp).await?;
        self.registry
            .send_signal(connection_id, SignalPayload::answer(answer))
            .await
    }

    /// Handle one callback from a peer connection backend
    pub async fn handle_peer_signal(&self, signal: PeerSignal) {
        if self.is_closed() {
            return;
        }

        match signal {
            PeerSignal::LocalCandidate { connection_id, candidate } => {
                if !self.registry.contains(&connection_id).await {
                    return;
                }
                if let Err(e) = self
                    .registry
                    .send_signal(&connection_id, SignalPayload::candidate(candidate))
                    .await
                {
                    warn!("Failed to send ICE candidate to {}: {}", connection_id, e);
                }
            }
            PeerSignal::RemoteTrack { connection_id, track } => {
                if !self.registry.contains(&connection_id).await {
                    debug!("Dropping track from closed connection {}", connection_id);
                    return;
                }
                let stream = {
                    let mut streams = self.remote_streams.lock();
                    let stream = streams.entry(connection_id.clone()).or_default();
                    stream.add_track(track);
                    stream.clone()
                };
                self.emit(SessionEvent::RemoteStream { connection_id, stream });
            }
        }
    }
}

/// Dispatch loop: handles queued hub messages and peer signals in arrival order
async fn run_dispatcher(
    coordinator: Weak<SessionCoordinator>,
    mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
    mut signals: mpsc::UnboundedReceiver<PeerSignal>,
) {
    loop {
        tokio::select! {
            Some(message) = inbound.recv() => {
                let Some(this) = coordinator.upgrade() else { break };
                this.handle_inbound(message).await;
            }
            Some(signal) = signals.recv() => {
                let Some(this) = coordinator.upgrade() else { break };
                this.handle_peer_signal(signal).await;
            }
            else => break,
        }
    }
    debug!("Session dispatcher stopped");
}
