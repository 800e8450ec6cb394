//! WebSocket hub connection
//!
//! Speaks the JSON hub protocol over a single WebSocket:
//! 1. Open the socket (negotiation skipped, WebSockets only)
//! 2. Exchange the protocol handshake
//! 3. Pump frames: invocations go to registered handlers, completions
//!    resolve pending `invoke` calls, pings keep the connection alive
//! 4. On an unexpected close, reconnect following the delay schedule

use super::hub_protocol::{self, HubMessage};
use super::{ChannelError, MessageHandler, SignalingChannel};
use crate::config::SignalingConfig;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type PendingInvocation = (String, oneshot::Sender<Result<(), ChannelError>>);

/// Connection options for a hub endpoint
#[derive(Debug, Clone)]
pub struct HubConnectionOptions {
    /// Hub URL (http, https, ws or wss)
    pub url: String,
    /// Bound on socket open + protocol handshake
    pub handshake_timeout: Duration,
    /// Interval between client pings
    pub keepalive_interval: Duration,
    /// Delays before each reconnect attempt; empty disables reconnection
    pub reconnect_delays: Vec<Duration>,
}

impl HubConnectionOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self::from_config(&SignalingConfig {
            url: url.into(),
            ..SignalingConfig::default()
        })
    }

    pub fn from_config(config: &SignalingConfig) -> Self {
        Self {
            url: config.url.clone(),
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs),
            keepalive_interval: Duration::from_secs(config.keepalive_interval_secs),
            reconnect_delays: config
                .reconnect_delays_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }
}

/// State shared between the public handle and the connection task
struct Shared {
    handlers: RwLock<HashMap<String, Vec<MessageHandler>>>,
    pending: Mutex<HashMap<String, PendingInvocation>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    connected: AtomicBool,
    /// Set while the connection task walks the reconnect schedule
    reconnecting: AtomicBool,
    closing: watch::Sender<bool>,
    next_invocation_id: AtomicU64,
}

impl Shared {
    fn dispatch(&self, record: &str) -> Option<PumpExit> {
        let message = match hub_protocol::decode(record) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping hub frame: {}", e);
                return None;
            }
        };

        match message {
            HubMessage::Invocation { target, arguments, .. } => {
                let handlers = self.handlers.read().get(&target).cloned();
                match handlers {
                    Some(handlers) => {
                        for handler in handlers {
                            handler(arguments.clone());
                        }
                    }
                    None => debug!("No handler registered for hub message {}", target),
                }
                None
            }
            HubMessage::Completion { invocation_id, error, .. } => {
                if let Some((method, reply)) = self.pending.lock().remove(&invocation_id) {
                    let result = match error {
                        Some(message) => Err(ChannelError::Invocation { method, message }),
                        None => Ok(()),
                    };
                    let _ = reply.send(result);
                } else {
                    debug!("Completion for unknown invocation {}", invocation_id);
                }
                None
            }
            HubMessage::Ping => None,
            HubMessage::Close { error, allow_reconnect } => {
                match error {
                    Some(e) => warn!("Hub closed the connection: {}", e),
                    None => info!("Hub closed the connection"),
                }
                Some(PumpExit::Closed { reconnect: allow_reconnect })
            }
            HubMessage::Other(kind) => {
                debug!("Ignoring hub message type {}", kind);
                None
            }
        }
    }

    fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    fn fail_pending(&self) {
        let pending: Vec<PendingInvocation> = self.pending.lock().drain().map(|(_, p)| p).collect();
        for (_, reply) in pending {
            let _ = reply.send(Err(ChannelError::Disconnected));
        }
    }
}

/// Why the frame pump stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpExit {
    /// Socket closed; `reconnect` tells whether another attempt makes sense
    Closed { reconnect: bool },
    /// Local side asked to disconnect
    Shutdown,
}

/// Hub connection over WebSocket
pub struct HubConnection {
    options: HubConnectionOptions,
    shared: Arc<Shared>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl HubConnection {
    pub fn new(options: HubConnectionOptions) -> Self {
        Self {
            options,
            shared: Arc::new(Shared {
                handlers: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                outbound: Mutex::new(None),
                connected: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                closing: watch::channel(false).0,
                next_invocation_id: AtomicU64::new(0),
            }),
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn options(&self) -> &HubConnectionOptions {
        &self.options
    }

    /// Whether the socket dropped and a reconnect attempt is pending or running
    pub fn is_reconnecting(&self) -> bool {
        self.shared.reconnecting.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingChannel for HubConnection {
    async fn connect(&self) -> Result<(), ChannelError> {
        let mut task = self.task.lock().await;
        if self.shared.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(stale) = task.take() {
            stale.abort();
        }

        self.shared.closing.send_replace(false);
        let (ws, leftover) = open_socket(&self.options).await?;
        info!("Connected to signaling hub at {}", self.options.url);

        let (tx, rx) = mpsc::unbounded_channel::<String>();
        *self.shared.outbound.lock() = Some(tx);
        self.shared.connected.store(true, Ordering::SeqCst);

        let mut exit = None;
        for record in &leftover {
            if let Some(e) = self.shared.dispatch(record) {
                exit = Some(e);
            }
        }

        let shared = self.shared.clone();
        let options = self.options.clone();
        *task = Some(tokio::spawn(run_connection(shared, options, ws, rx, exit)));
        Ok(())
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<(), ChannelError> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(ChannelError::NotConnected);
        }

        let invocation_id = self
            .shared
            .next_invocation_id
            .fetch_add(1, Ordering::SeqCst)
            .to_string();
        let frame = hub_protocol::encode(&HubMessage::Invocation {
            invocation_id: Some(invocation_id.clone()),
            target: method.to_string(),
            arguments: args,
        })?;

        let (reply_tx, reply_rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .insert(invocation_id.clone(), (method.to_string(), reply_tx));

        let sent = match self.shared.outbound.lock().as_ref() {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        };
        if !sent {
            self.shared.pending.lock().remove(&invocation_id);
            return Err(ChannelError::NotConnected);
        }

        debug!("Invoked {} (id {})", method, invocation_id);
        reply_rx.await.unwrap_or(Err(ChannelError::Disconnected))
    }

    fn on(&self, event: &str, handler: MessageHandler) {
        self.shared
            .handlers
            .write()
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    async fn disconnect(&self) {
        self.shared.closing.send_replace(true);
        let mut task = self.task.lock().await;
        // Dropping the sender makes the pump close the socket and exit
        self.shared.outbound.lock().take();
        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!("Hub connection task ended abnormally: {}", e);
                }
            }
            info!("Disconnected from signaling hub");
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.reconnecting.store(false, Ordering::SeqCst);
        self.shared.fail_pending();
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

/// Connection task: pump frames, reconnect on unexpected close
async fn run_connection(
    shared: Arc<Shared>,
    options: HubConnectionOptions,
    mut ws: WsStream,
    mut rx: mpsc::UnboundedReceiver<String>,
    early_exit: Option<PumpExit>,
) {
    let mut exit = match early_exit {
        Some(exit) => exit,
        None => pump(&shared, &mut ws, &mut rx, options.keepalive_interval).await,
    };

    loop {
        let reconnect = match exit {
            PumpExit::Shutdown => false,
            PumpExit::Closed { reconnect } => reconnect,
        } && !options.reconnect_delays.is_empty()
            && !shared.is_closing();

        shared.reconnecting.store(reconnect, Ordering::SeqCst);
        shared.connected.store(false, Ordering::SeqCst);
        shared.fail_pending();

        if !reconnect {
            let _ = ws.close(None).await;
            break;
        }

        warn!("Signaling connection lost, reconnecting");
        let Some((mut new_ws, leftover)) = reconnect_socket(&shared, &options).await else {
            shared.outbound.lock().take();
            shared.reconnecting.store(false, Ordering::SeqCst);
            break;
        };
        if shared.is_closing() {
            let _ = new_ws.close(None).await;
            shared.reconnecting.store(false, Ordering::SeqCst);
            break;
        }

        ws = new_ws;
        let (tx, new_rx) = mpsc::unbounded_channel::<String>();
        rx = new_rx;
        *shared.outbound.lock() = Some(tx);
        shared.connected.store(true, Ordering::SeqCst);
        shared.reconnecting.store(false, Ordering::SeqCst);
        info!("Reconnected to signaling hub at {}", options.url);

        let mut early = None;
        for record in &leftover {
            if let Some(e) = shared.dispatch(record) {
                early = Some(e);
            }
        }
        exit = match early {
            Some(e) => e,
            None => pump(&shared, &mut ws, &mut rx, options.keepalive_interval).await,
        };
    }
}

/// Walk the reconnect schedule until a socket opens, attempts run out or
/// the local side disconnects
async fn reconnect_socket(
    shared: &Arc<Shared>,
    options: &HubConnectionOptions,
) -> Option<(WsStream, Vec<String>)> {
    let mut closing = shared.closing.subscribe();
    for (attempt, delay) in options.reconnect_delays.iter().enumerate() {
        tokio::select! {
            _ = tokio::time::sleep(*delay) => {}
            _ = closing.wait_for(|closing| *closing) => return None,
        }
        let opened = tokio::select! {
            opened = open_socket(options) => opened,
            _ = closing.wait_for(|closing| *closing) => return None,
        };
        match opened {
            Ok(opened) => return Some(opened),
            Err(e) => warn!("Reconnect attempt {} failed: {}", attempt + 1, e),
        }
    }
    error!(
        "Giving up on signaling hub after {} reconnect attempts",
        options.reconnect_delays.len()
    );
    None
}

/// Move frames between the socket and the outbound queue until either side closes
async fn pump(
    shared: &Arc<Shared>,
    ws: &mut WsStream,
    rx: &mut mpsc::UnboundedReceiver<String>,
    keepalive_interval: Duration,
) -> PumpExit {
    let period = if keepalive_interval.is_zero() {
        Duration::from_secs(15)
    } else {
        keepalive_interval
    };
    let mut keepalive = tokio::time::interval(period);
    keepalive.tick().await;
    let mut closing = shared.closing.subscribe();

    loop {
        tokio::select! {
            _ = async { let _ = closing.wait_for(|closing| *closing).await; } => {
                let _ = ws.close(None).await;
                return PumpExit::Shutdown;
            }
            incoming = ws.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        for record in hub_protocol::split_records(&text) {
                            if let Some(exit) = shared.dispatch(record) {
                                return exit;
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Signaling socket closed: {:?}", frame);
                        return PumpExit::Closed { reconnect: true };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Signaling socket error: {}", e);
                        return PumpExit::Closed { reconnect: true };
                    }
                    None => return PumpExit::Closed { reconnect: true },
                }
            }
            outgoing = rx.recv() => {
                match outgoing {
                    Some(frame) => {
                        if let Err(e) = ws.send(Message::Text(frame)).await {
                            warn!("Failed to send hub frame: {}", e);
                            return PumpExit::Closed { reconnect: true };
                        }
                    }
                    None => {
                        let _ = ws.close(None).await;
                        return PumpExit::Shutdown;
                    }
                }
            }
            _ = keepalive.tick() => {
                if let Ok(ping) = hub_protocol::encode(&HubMessage::Ping) {
                    if let Err(e) = ws.send(Message::Text(ping)).await {
                        warn!("Failed to send keepalive: {}", e);
                        return PumpExit::Closed { reconnect: true };
                    }
                }
            }
        }
    }
}

/// Open the WebSocket and complete the protocol handshake
async fn open_socket(options: &HubConnectionOptions) -> Result<(WsStream, Vec<String>), ChannelError> {
    let url = websocket_url(&options.url)?;

    let (mut ws, _response) = tokio::time::timeout(options.handshake_timeout, connect_async(url.as_str()))
        .await
        .map_err(|_| ChannelError::ConnectFailed(format!("timed out connecting to {}", url)))?
        .map_err(|e| ChannelError::ConnectFailed(format!("{}: {}", url, e)))?;

    ws.send(Message::Text(hub_protocol::handshake_request()))
        .await
        .map_err(|e| ChannelError::HandshakeFailed(format!("failed to send handshake: {}", e)))?;

    let response = tokio::time::timeout(options.handshake_timeout, next_text(&mut ws))
        .await
        .map_err(|_| ChannelError::HandshakeFailed("timed out waiting for handshake response".to_string()))??;

    let leftover = hub_protocol::parse_handshake_response(&response)?
        .into_iter()
        .map(str::to_string)
        .collect();
    Ok((ws, leftover))
}

async fn next_text(ws: &mut WsStream) -> Result<String, ChannelError> {
    while let Some(message) = ws.next().await {
        match message {
            Ok(Message::Text(text)) => return Ok(text),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => return Err(ChannelError::HandshakeFailed(e.to_string())),
        }
    }
    Err(ChannelError::HandshakeFailed("socket closed during handshake".to_string()))
}

/// Map a hub URL onto its WebSocket form
pub fn websocket_url(url: &str) -> Result<String, ChannelError> {
    let url = url.trim();
    if let Some(rest) = url.strip_prefix("https://") {
        Ok(format!("wss://{}", rest))
    } else if let Some(rest) = url.strip_prefix("http://") {
        Ok(format!("ws://{}", rest))
    } else if url.starts_with("ws://") || url.starts_with("wss://") {
        Ok(url.to_string())
    } else {
        Err(ChannelError::ConnectFailed(format!("unsupported hub URL: {}", url)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url_mapping() {
        assert_eq!(
            websocket_url("https://localhost:7145/hubs/signaling").unwrap(),
            "wss://localhost:7145/hubs/signaling"
        );
        assert_eq!(websocket_url("http://hub/x").unwrap(), "ws://hub/x");
        assert_eq!(websocket_url("ws://hub/x").unwrap(), "ws://hub/x");
        assert!(websocket_url("ftp://hub").is_err());
    }

    #[tokio::test]
    async fn test_invoke_requires_connection() {
        let hub = HubConnection::new(HubConnectionOptions::new("ws://127.0.0.1:1/hub"));
        let result = hub.invoke("JoinRoom", vec![]).await;
        assert_eq!(result, Err(ChannelError::NotConnected));
    }

    #[tokio::test]
    async fn test_disconnect_when_never_connected() {
        let hub = HubConnection::new(HubConnectionOptions::new("ws://127.0.0.1:1/hub"));
        hub.disconnect().await;
        hub.disconnect().await;
        assert!(!hub.is_connected());
    }

    #[test]
    fn test_completion_resolves_pending_invocation() {
        let hub = HubConnection::new(HubConnectionOptions::new("ws://hub"));
        let (tx, mut rx) = oneshot::channel();
        hub.shared
            .pending
            .lock()
            .insert("7".to_string(), ("EndMeeting".to_string(), tx));

        hub.shared
            .dispatch(r#"{"type":3,"invocationId":"7","error":"not the host"}"#);

        assert_eq!(
            rx.try_recv().unwrap(),
            Err(ChannelError::Invocation {
                method: "EndMeeting".to_string(),
                message: "not the host".to_string(),
            })
        );
    }

    #[test]
    fn test_invocation_reaches_every_handler() {
        let hub = HubConnection::new(HubConnectionOptions::new("ws://hub"));
        let calls = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let calls = calls.clone();
            hub.on(
                "UserLeft",
                Arc::new(move |args: Vec<Value>| calls.lock().push((tag, args))),
            );
        }

        hub.shared
            .dispatch(r#"{"type":1,"target":"UserLeft","arguments":["g1"]}"#);

        let calls = calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, vec![Value::from("g1")]);
    }
}
