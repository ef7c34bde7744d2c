//! Application bootstrap and dependency wiring.
//!
//! The composition root: every default service is created and wired here,
//! and nowhere else.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::api::{AppState, WsConnectionManager};
use crate::error::{OnAirError, OnAirResult};
use crate::events::{BroadcastEventBridge, LoggingEventEmitter};
use crate::services::{
    CleanupCoordinator, CompletionListener, Directory, DirectoryPreparation, FilePlayer,
    FrameMixer, JsonBroadcastStore, PlaybackService, UdpFanout,
};
use crate::session::{AudioSource, SessionRegistry};
use crate::state::Config;

/// Where the default services find their data.
#[derive(Debug, Clone, Default)]
pub struct BootstrapOptions {
    /// Speakers, groups and channel playlists.
    pub directory: Directory,
    /// Directory for `broadcasts.json`; `None` keeps state in memory.
    pub data_dir: Option<PathBuf>,
    /// Root that media filenames are resolved against.
    pub media_dir: PathBuf,
    /// Root that TTS filenames are resolved against.
    pub tts_dir: PathBuf,
}

/// Container for all bootstrapped services.
#[derive(Clone)]
pub struct BootstrappedServices {
    pub registry: Arc<SessionRegistry>,
    pub coordinator: Arc<CleanupCoordinator>,
    pub preparation: Arc<DirectoryPreparation>,
    pub mixer: Arc<FrameMixer>,
    pub media: Arc<FilePlayer>,
    pub tts: Arc<FilePlayer>,
    pub store: Arc<JsonBroadcastStore>,
    pub event_bridge: Arc<BroadcastEventBridge>,
    pub ws_manager: Arc<WsConnectionManager>,
    pub config: Arc<RwLock<Config>>,
    /// Routes playback completion into the cleanup coordinator.
    completion: Arc<CompletionListener>,
    /// Cancellation token for graceful shutdown.
    pub cancel_token: CancellationToken,
}

impl BootstrappedServices {
    /// Builds the API state over these services.
    pub fn app_state(&self) -> AppState {
        AppState::builder()
            .registry(Arc::clone(&self.registry))
            .coordinator(Arc::clone(&self.coordinator))
            .preparation(self.preparation.clone())
            .mixer(self.mixer.clone())
            .players(self.media.clone(), self.tts.clone())
            .store(self.store.clone())
            .event_bridge(Arc::clone(&self.event_bridge))
            .ws_manager(Arc::clone(&self.ws_manager))
            .config(Arc::clone(&self.config))
            .build()
    }

    /// Closes every connection and tears down every live broadcast.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Beginning graceful shutdown...");

        let connections = self.ws_manager.close_all();
        if connections > 0 {
            log::info!("[Bootstrap] Closed {} WebSocket connection(s)", connections);
        }

        let removed = self.coordinator.cleanup_all("server_shutdown").await;
        log::info!("[Bootstrap] Ended {} broadcast(s)", removed);

        self.completion.shutdown();
        self.mixer.shutdown();
        self.cancel_token.cancel();

        log::info!("[Bootstrap] Shutdown complete");
    }
}

/// Bootstraps all application services with their dependencies.
///
/// Must run inside a Tokio runtime: the fan-out socket and the completion
/// listener tasks are created here.
pub fn bootstrap_services(
    config: Config,
    options: BootstrapOptions,
) -> OnAirResult<BootstrappedServices> {
    config.validate().map_err(OnAirError::Configuration)?;
    options
        .directory
        .validate()
        .map_err(OnAirError::Configuration)?;

    let event_bridge = Arc::new(BroadcastEventBridge::new(config.event_channel_capacity));
    event_bridge.set_external_emitter(Arc::new(LoggingEventEmitter));

    let fanout = UdpFanout::bind_any(config.speaker_port)
        .map_err(|e| OnAirError::Configuration(format!("UDP fan-out socket: {}", e)))?;
    let mixer = Arc::new(FrameMixer::new(Arc::new(fanout)));

    let media = Arc::new(FilePlayer::new(
        AudioSource::Media,
        options.media_dir,
        mixer.clone(),
    ));
    let tts = Arc::new(FilePlayer::new(
        AudioSource::Tts,
        options.tts_dir,
        mixer.clone(),
    ));

    let store = Arc::new(match &options.data_dir {
        Some(dir) => JsonBroadcastStore::open(dir),
        None => {
            log::info!("[Bootstrap] No data directory, broadcast state kept in memory");
            JsonBroadcastStore::in_memory()
        }
    });

    let registry = Arc::new(SessionRegistry::new());
    let preparation = Arc::new(DirectoryPreparation::new(options.directory));

    let coordinator = Arc::new(CleanupCoordinator::new(
        Arc::clone(&registry),
        mixer.clone(),
        media.clone(),
        tts.clone(),
        store.clone(),
        preparation.clone(),
        event_bridge.clone(),
    ));

    let cancel_token = CancellationToken::new();
    let players: [Arc<dyn PlaybackService>; 2] = [media.clone(), tts.clone()];
    let completion = Arc::new(CompletionListener::spawn(
        &players,
        Arc::clone(&registry),
        Arc::clone(&coordinator),
        event_bridge.clone(),
        &cancel_token,
    ));

    Ok(BootstrappedServices {
        registry,
        coordinator,
        preparation,
        mixer,
        media,
        tts,
        store,
        event_bridge,
        ws_manager: Arc::new(WsConnectionManager::new()),
        config: Arc::new(RwLock::new(config)),
        completion,
        cancel_token,
    })
}
