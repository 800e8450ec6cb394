//! classroom-rtc - Main entry point
//!
//! Headless classroom participant: joins a room over the signaling hub,
//! connects to every other participant and logs session events.

mod args;

use args::Args;
use clap::Parser;
use classroom_rtc::config::Config;
use classroom_rtc::{
    HubConnection, HubConnectionOptions, MediaStream, ParticipantIdentity, ParticipantRole,
    RtcPeerConnector, SessionCoordinator, SessionEvent,
};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let mut config = match args.load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load config {:?}: {}, using defaults", args.config, e);
            Config::default()
        }
    };
    args.apply_overrides(&mut config);

    // Initialize logging with noise filtering for third-party WebRTC crates
    env_logger::Builder::new()
        .parse_filters(&std::env::var("CLASSROOM_RTC_LOG").unwrap_or_else(|_| config.logging.level.clone()))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .init();

    info!("classroom-rtc v{}", env!("CARGO_PKG_VERSION"));

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    let user_id = args
        .user_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let name = args
        .name
        .clone()
        .unwrap_or_else(|| config.session.default_display_name.clone());
    let identity = ParticipantIdentity::new(user_id, Some(&name));
    let role = if args.host {
        ParticipantRole::Host
    } else {
        ParticipantRole::Guest
    };

    let channel = Arc::new(HubConnection::new(HubConnectionOptions::from_config(&config.signaling)));
    let connector = Arc::new(RtcPeerConnector::new());
    let session = SessionCoordinator::new(identity, role, channel, connector, config.session.event_capacity);

    let camera = MediaStream::camera();
    info!("Local stream {} with {} tracks", camera.id(), camera.tracks().len());
    session.set_local_stream(camera);

    let mut events = session.subscribe();
    if let Err(e) = session.join_room(&args.room).await {
        error!("Failed to join room {}: {}", args.room, e);
        session.close_all().await;
        return Err(e.into());
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::MeetingEnded) => {
                    info!("Meeting ended, leaving room");
                    break;
                }
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => {
                    warn!("Session events lagged, dropped {} events", n);
                }
                Err(RecvError::Closed) => break,
            },
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                if role == ParticipantRole::Host {
                    if let Err(e) = session.end_meeting(&args.room).await {
                        warn!("Failed to end meeting: {}", e);
                    }
                }
                break;
            }
        }
    }

    session.close_all().await;
    info!("Shutdown complete");
    Ok(())
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::RemoteStream { connection_id, stream } => {
            info!("Receiving {} tracks from {}", stream.tracks.len(), connection_id);
        }
        SessionEvent::PeerLeft { connection_id } => info!("Peer {} left", connection_id),
        SessionEvent::PeerNameUpdate { connection_id, name } => {
            debug!("Peer {} is {}", connection_id, name);
        }
        SessionEvent::ScreenShareRequest { requester_id, requester_name } => {
            info!("{} ({}) requests screen share", requester_name, requester_id);
        }
        SessionEvent::ScreenShareResult { granted } => info!("Screen share granted: {}", granted),
        SessionEvent::ScreenShareAccessUpdate { allowed } => {
            info!("Screen sharing allowed for everyone: {}", allowed)
        }
        SessionEvent::ScreenShareStopped => info!("Screen share stopped"),
        SessionEvent::MeetingEnded => info!("Meeting ended"),
    }
}
