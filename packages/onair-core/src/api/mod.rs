//! HTTP/WebSocket API layer.
//!
//! Thin handlers that delegate to the registry, the cleanup coordinator and
//! the collaborator services. Router construction and server startup live here.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::events::BroadcastEventBridge;
use crate::protocol_constants::{SERVER_PORT_RANGE_END, SERVER_PORT_RANGE_START};
use crate::services::{
    AudioMixer, BroadcastPreparation, BroadcastStore, CleanupCoordinator, PlaybackService,
};
use crate::session::{AudioSource, SessionRegistry};
use crate::state::Config;

pub mod http;
pub mod ws;
pub mod ws_connection;

pub use ws_connection::WsConnectionManager;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to a TCP port.
    #[error("Failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),

    /// No available ports in the specified range.
    #[error("No available ports in range {start}-{end}")]
    NoAvailablePort { start: u16, end: u16 },
}

/// Shared application state for the API layer.
///
/// Holds references to services only; business logic lives in the services.
#[derive(Clone)]
pub struct AppState {
    /// Live broadcast sessions.
    pub registry: Arc<SessionRegistry>,
    /// Single teardown path for sessions.
    pub coordinator: Arc<CleanupCoordinator>,
    /// Resolves speakers and playlists at connect time.
    pub preparation: Arc<dyn BroadcastPreparation>,
    pub mixer: Arc<dyn AudioMixer>,
    pub media: Arc<dyn PlaybackService>,
    pub tts: Arc<dyn PlaybackService>,
    /// Persisted channel state and broadcast records.
    pub store: Arc<dyn BroadcastStore>,
    /// Lifecycle events for WebSocket clients and external consumers.
    pub event_bridge: Arc<BroadcastEventBridge>,
    pub ws_manager: Arc<WsConnectionManager>,
    pub config: Arc<RwLock<Config>>,
}

/// Builder for constructing an `AppState`.
#[derive(Default)]
pub struct AppStateBuilder {
    registry: Option<Arc<SessionRegistry>>,
    coordinator: Option<Arc<CleanupCoordinator>>,
    preparation: Option<Arc<dyn BroadcastPreparation>>,
    mixer: Option<Arc<dyn AudioMixer>>,
    media: Option<Arc<dyn PlaybackService>>,
    tts: Option<Arc<dyn PlaybackService>>,
    store: Option<Arc<dyn BroadcastStore>>,
    event_bridge: Option<Arc<BroadcastEventBridge>>,
    ws_manager: Option<Arc<WsConnectionManager>>,
    config: Option<Arc<RwLock<Config>>>,
}

impl AppStateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(mut self, registry: Arc<SessionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn coordinator(mut self, coordinator: Arc<CleanupCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn preparation(mut self, preparation: Arc<dyn BroadcastPreparation>) -> Self {
        self.preparation = Some(preparation);
        self
    }

    pub fn mixer(mut self, mixer: Arc<dyn AudioMixer>) -> Self {
        self.mixer = Some(mixer);
        self
    }

    /// Sets the media and TTS players.
    pub fn players(
        mut self,
        media: Arc<dyn PlaybackService>,
        tts: Arc<dyn PlaybackService>,
    ) -> Self {
        self.media = Some(media);
        self.tts = Some(tts);
        self
    }

    pub fn store(mut self, store: Arc<dyn BroadcastStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn event_bridge(mut self, bridge: Arc<BroadcastEventBridge>) -> Self {
        self.event_bridge = Some(bridge);
        self
    }

    pub fn ws_manager(mut self, manager: Arc<WsConnectionManager>) -> Self {
        self.ws_manager = Some(manager);
        self
    }

    pub fn config(mut self, config: Arc<RwLock<Config>>) -> Self {
        self.config = Some(config);
        self
    }

    /// Builds the `AppState`, panicking if required fields are missing.
    pub fn build(self) -> AppState {
        AppState {
            registry: self.registry.expect("registry is required"),
            coordinator: self.coordinator.expect("coordinator is required"),
            preparation: self.preparation.expect("preparation is required"),
            mixer: self.mixer.expect("mixer is required"),
            media: self.media.expect("media player is required"),
            tts: self.tts.expect("tts player is required"),
            store: self.store.expect("store is required"),
            event_bridge: self.event_bridge.expect("event_bridge is required"),
            ws_manager: self.ws_manager.unwrap_or_default(),
            config: self.config.unwrap_or_default(),
        }
    }
}

impl AppState {
    pub fn builder() -> AppStateBuilder {
        AppStateBuilder::new()
    }

    /// The player responsible for a playback source. The microphone has none.
    pub fn player(&self, source: AudioSource) -> Option<&Arc<dyn PlaybackService>> {
        match source {
            AudioSource::Media => Some(&self.media),
            AudioSource::Tts => Some(&self.tts),
            AudioSource::Microphone => None,
        }
    }
}

async fn find_available_port(start: u16, end: u16) -> Result<(u16, TcpListener), ServerError> {
    for port in start..=end {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        if let Ok(listener) = TcpListener::bind(&addr).await {
            return Ok((port, listener));
        }
    }
    Err(ServerError::NoAvailablePort { start, end })
}

/// Binds the configured port, or the first free one in the default range.
pub async fn bind_listener(config: &Config) -> Result<(u16, TcpListener), ServerError> {
    if config.bind_port > 0 {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.bind_port));
        Ok((config.bind_port, TcpListener::bind(&addr).await?))
    } else {
        find_available_port(SERVER_PORT_RANGE_START, SERVER_PORT_RANGE_END).await
    }
}

/// Serves the API until `shutdown` is cancelled.
///
/// Open WebSocket connections keep the server alive; call
/// [`WsConnectionManager::close_all`] before cancelling.
pub async fn start_server(state: AppState, shutdown: CancellationToken) -> Result<(), ServerError> {
    let (port, listener) = {
        let config = state.config.read().clone();
        bind_listener(&config).await?
    };

    log::info!("Server listening on http://0.0.0.0:{}", port);
    let app = http::create_router(state);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;
    Ok(())
}
