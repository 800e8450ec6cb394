//! In-memory signaling hub and peer backend shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use classroom_rtc::transport::{methods, ChannelError, MessageHandler, SignalingChannel};
use classroom_rtc::webrtc::media_track::RemoteTrack;
use classroom_rtc::webrtc::peer_connection::{PeerConnector, PeerLink, PeerSignal, PeerSignalSender};
use classroom_rtc::webrtc::{IceCandidatePayload, MediaTrack, TrackKind, WebRTCError};
use classroom_rtc::{ParticipantIdentity, ParticipantRole, SessionCoordinator, SessionEvent};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;

/// Routes invocations between channels the way the classroom hub does
#[derive(Default)]
pub struct LoopbackHub {
    clients: Mutex<HashMap<String, Weak<LoopbackChannel>>>,
    rooms: Mutex<HashMap<String, Vec<String>>>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Channel whose hub-assigned connection id is `connection_id`
    pub fn channel(self: &Arc<Self>, connection_id: &str) -> Arc<LoopbackChannel> {
        let channel = Arc::new(LoopbackChannel {
            connection_id: connection_id.to_string(),
            hub: Arc::downgrade(self),
            handlers: Mutex::new(HashMap::new()),
            invocations: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            connect_count: AtomicUsize::new(0),
            disconnect_count: AtomicUsize::new(0),
            fail_signals: AtomicBool::new(false),
        });
        self.clients
            .lock()
            .insert(connection_id.to_string(), Arc::downgrade(&channel));
        channel
    }

    fn client(&self, connection_id: &str) -> Option<Arc<LoopbackChannel>> {
        self.clients.lock().get(connection_id).and_then(Weak::upgrade)
    }

    fn room_of(&self, connection_id: &str) -> Option<String> {
        self.rooms
            .lock()
            .iter()
            .find(|(_, members)| members.iter().any(|m| m == connection_id))
            .map(|(room, _)| room.clone())
    }

    fn others_in_room(&self, room: &str, connection_id: &str) -> Vec<String> {
        self.rooms
            .lock()
            .get(room)
            .map(|members| members.iter().filter(|m| *m != connection_id).cloned().collect())
            .unwrap_or_default()
    }

    fn send(&self, target: &str, event: &str, args: Vec<Value>) {
        if let Some(client) = self.client(target) {
            client.deliver(event, args);
        }
    }

    /// Deliver a message to one connection as if the hub sent it
    pub fn push(&self, target: &str, event: &str, args: Vec<Value>) {
        self.send(target, event, args);
    }

    fn route(&self, sender: &str, method: &str, args: &[Value]) {
        let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Null);
        match method {
            methods::JOIN_ROOM => {
                let room = arg(0).as_str().unwrap_or_default().to_string();
                let others = self.others_in_room(&room, sender);
                self.rooms.lock().entry(room).or_default().push(sender.to_string());
                for other in others {
                    self.send(&other, methods::USER_JOINED, vec![Value::from(sender), arg(1)]);
                }
            }
            methods::SEND_SIGNAL => {
                let target = arg(0).as_str().unwrap_or_default().to_string();
                self.send(&target, methods::RECEIVE_SIGNAL, vec![Value::from(sender), arg(1)]);
            }
            methods::END_MEETING => {
                let room = arg(0).as_str().unwrap_or_default().to_string();
                for member in self.others_in_room(&room, "") {
                    self.send(&member, methods::MEETING_ENDED, vec![]);
                }
            }
            methods::REQUEST_SCREEN_SHARE => {
                let room = arg(0).as_str().unwrap_or_default().to_string();
                for other in self.others_in_room(&room, sender) {
                    self.send(
                        &other,
                        methods::SCREEN_SHARE_REQUESTED,
                        vec![Value::from(sender), arg(1)],
                    );
                }
            }
            methods::ALLOW_SCREEN_SHARE | methods::DENY_SCREEN_SHARE => {
                let target = arg(0).as_str().unwrap_or_default().to_string();
                let granted = method == methods::ALLOW_SCREEN_SHARE;
                self.send(&target, methods::SCREEN_SHARE_PERMISSION_RESULT, vec![Value::from(granted)]);
            }
            methods::TOGGLE_SCREEN_SHARE_ACCESS => {
                let room = arg(0).as_str().unwrap_or_default().to_string();
                for other in self.others_in_room(&room, sender) {
                    self.send(&other, methods::SCREEN_SHARE_ACCESS_UPDATED, vec![arg(1)]);
                }
            }
            _ => {}
        }
    }

    fn leave(&self, connection_id: &str) {
        let Some(room) = self.room_of(connection_id) else {
            return;
        };
        if let Some(members) = self.rooms.lock().get_mut(&room) {
            members.retain(|m| m != connection_id);
        }
        for other in self.others_in_room(&room, connection_id) {
            self.send(&other, methods::USER_LEFT, vec![Value::from(connection_id)]);
        }
    }
}

/// One participant's connection to the loopback hub
pub struct LoopbackChannel {
    pub connection_id: String,
    hub: Weak<LoopbackHub>,
    handlers: Mutex<HashMap<String, Vec<MessageHandler>>>,
    invocations: Mutex<Vec<(String, Vec<Value>)>>,
    connected: AtomicBool,
    pub connect_count: AtomicUsize,
    pub disconnect_count: AtomicUsize,
    /// When set, SendSignal invocations fail as if the socket dropped
    pub fail_signals: AtomicBool,
}

impl LoopbackChannel {
    fn deliver(&self, event: &str, args: Vec<Value>) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        let handlers = self.handlers.lock().get(event).cloned().unwrap_or_default();
        for handler in handlers {
            handler(args.clone());
        }
    }

    /// Every invocation made so far, in order
    pub fn invocations(&self) -> Vec<(String, Vec<Value>)> {
        self.invocations.lock().clone()
    }

    /// Invocations of `method`
    pub fn invocations_of(&self, method: &str) -> Vec<Vec<Value>> {
        self.invocations
            .lock()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, args)| args.clone())
            .collect()
    }

    /// Signal frames sent to `target`, decoded
    pub fn signals_to(&self, target: &str) -> Vec<Value> {
        self.invocations_of(methods::SEND_SIGNAL)
            .into_iter()
            .filter(|args| args.first().and_then(Value::as_str) == Some(target))
            .filter_map(|args| args.get(1).and_then(Value::as_str).map(str::to_string))
            .filter_map(|json| serde_json::from_str(&json).ok())
            .collect()
    }

    /// Offers sent to anyone
    pub fn offers_sent(&self) -> usize {
        self.invocations_of(methods::SEND_SIGNAL)
            .iter()
            .filter_map(|args| args.get(1).and_then(Value::as_str))
            .filter(|json| json.contains("\"type\":\"offer\""))
            .count()
    }
}

#[async_trait]
impl SignalingChannel for LoopbackChannel {
    async fn connect(&self) -> Result<(), ChannelError> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<(), ChannelError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ChannelError::NotConnected);
        }
        if method == methods::SEND_SIGNAL && self.fail_signals.load(Ordering::SeqCst) {
            return Err(ChannelError::Disconnected);
        }
        self.invocations.lock().push((method.to_string(), args.clone()));
        if let Some(hub) = self.hub.upgrade() {
            hub.route(&self.connection_id, method, &args);
        }
        Ok(())
    }

    fn on(&self, event: &str, handler: MessageHandler) {
        self.handlers
            .lock()
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    async fn disconnect(&self) {
        self.disconnect_count.fetch_add(1, Ordering::SeqCst);
        if self.connected.swap(false, Ordering::SeqCst) {
            if let Some(hub) = self.hub.upgrade() {
                hub.leave(&self.connection_id);
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// In-memory peer link that completes negotiation instantly
pub struct FakeLink {
    pub connection_id: String,
    signals: PeerSignalSender,
    senders: Mutex<Vec<MediaTrack>>,
    pub remote_sdp: Mutex<Option<String>>,
    pub candidates: Mutex<Vec<IceCandidatePayload>>,
    pub replace_calls: AtomicUsize,
    pub closed: AtomicBool,
    reject_candidates: bool,
}

impl FakeLink {
    /// Id of the track on the video sender, if any
    pub fn video_track_id(&self) -> Option<String> {
        self.senders
            .lock()
            .iter()
            .find(|t| t.kind() == TrackKind::Video)
            .map(|t| t.id().to_string())
    }

    pub fn sender_count(&self) -> usize {
        self.senders.lock().len()
    }

    fn gather_candidate(&self) {
        let _ = self.signals.send(PeerSignal::LocalCandidate {
            connection_id: self.connection_id.clone(),
            candidate: IceCandidatePayload {
                candidate: format!("candidate:1 1 udp 2122260223 127.0.0.1 9 typ host {}", self.connection_id),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        });
    }

    fn emit_remote_tracks(&self) {
        for kind in [TrackKind::Video, TrackKind::Audio] {
            let _ = self.signals.send(PeerSignal::RemoteTrack {
                connection_id: self.connection_id.clone(),
                track: RemoteTrack {
                    id: format!("{}-{}", self.connection_id, kind),
                    kind,
                    stream_id: format!("remote-{}", self.connection_id),
                    source: None,
                },
            });
        }
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), WebRTCError> {
        self.senders.lock().push(track.clone());
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, WebRTCError> {
        self.gather_candidate();
        Ok(format!("v=0 offer-for-{}", self.connection_id))
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String, WebRTCError> {
        *self.remote_sdp.lock() = Some(sdp.to_string());
        self.emit_remote_tracks();
        self.gather_candidate();
        Ok(format!("v=0 answer-for-{}", self.connection_id))
    }

    async fn accept_answer(&self, sdp: &str) -> Result<(), WebRTCError> {
        *self.remote_sdp.lock() = Some(sdp.to_string());
        self.emit_remote_tracks();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<(), WebRTCError> {
        if self.reject_candidates {
            return Err(WebRTCError::IceError("candidate rejected".to_string()));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn replace_video_track(&self, track: &MediaTrack) -> Result<bool, WebRTCError> {
        self.replace_calls.fetch_add(1, Ordering::SeqCst);
        let mut senders = self.senders.lock();
        match senders.iter_mut().find(|t| t.kind() == TrackKind::Video) {
            Some(sender) => {
                *sender = track.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn close(&self) -> Result<(), WebRTCError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector handing out [`FakeLink`]s and remembering every one created
#[derive(Default)]
pub struct FakeConnector {
    links: Mutex<Vec<Arc<FakeLink>>>,
    pub reject_candidates: AtomicBool,
    pub fail_connect: AtomicBool,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every link created for `connection_id`, oldest first
    pub fn links_for(&self, connection_id: &str) -> Vec<Arc<FakeLink>> {
        self.links
            .lock()
            .iter()
            .filter(|l| l.connection_id == connection_id)
            .cloned()
            .collect()
    }

    pub fn link(&self, connection_id: &str) -> Option<Arc<FakeLink>> {
        self.links_for(connection_id).pop()
    }

    pub fn created(&self) -> usize {
        self.links.lock().len()
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        connection_id: &str,
        signals: PeerSignalSender,
    ) -> Result<Arc<dyn PeerLink>, WebRTCError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(WebRTCError::ConnectionFailed("backend unavailable".to_string()));
        }
        // Suspend like a real backend so concurrent signals can interleave
        tokio::task::yield_now().await;
        let link = Arc::new(FakeLink {
            connection_id: connection_id.to_string(),
            signals,
            senders: Mutex::new(Vec::new()),
            remote_sdp: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            replace_calls: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            reject_candidates: self.reject_candidates.load(Ordering::SeqCst),
        });
        self.links.lock().push(link.clone());
        Ok(link)
    }
}

/// A coordinator wired to the loopback hub
pub struct Participant {
    pub session: Arc<SessionCoordinator>,
    pub channel: Arc<LoopbackChannel>,
    pub connector: Arc<FakeConnector>,
    pub events: broadcast::Receiver<SessionEvent>,
}

impl Participant {
    pub fn new(hub: &Arc<LoopbackHub>, connection_id: &str, user_id: &str, name: &str, role: ParticipantRole) -> Self {
        let channel = hub.channel(connection_id);
        let connector = FakeConnector::new();
        let session = SessionCoordinator::new(
            ParticipantIdentity::new(user_id, Some(name)),
            role,
            channel.clone(),
            connector.clone(),
            64,
        );
        session.set_local_stream(classroom_rtc::MediaStream::camera());
        let events = session.subscribe();
        Self { session, channel, connector, events }
    }

    /// Wait for the first event matching `pred`
    pub async fn next_event<F>(&mut self, mut pred: F) -> SessionEvent
    where
        F: FnMut(&SessionEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match self.events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for session event")
    }

    /// Every event already published, without waiting
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Let queued dispatch work run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
