//! File-backed media and TTS player.
//!
//! Plays a list of WAV or raw PCM files from a directory into the mixer, one
//! 60 ms frame per tick. One playlist runs per broadcast; a new request
//! replaces the running one. Natural end raises [`PlaybackCompleted`],
//! an explicit stop does not.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec::samples_to_pcm;
use crate::protocol_constants::{COMPLETION_CHANNEL_CAPACITY, FRAME_DURATION_MS, FRAME_SAMPLES};
use crate::services::traits::{
    AudioMixer, PlayOutcome, PlayRequest, PlaybackCompleted, PlaybackError, PlaybackService,
    PlaybackStatus,
};
use crate::session::{AudioSource, BroadcastId};
use crate::wav::decode_audio_file;

struct ActivePlaylist {
    session_id: String,
    files: Vec<String>,
    current: Arc<AtomicUsize>,
    token: CancellationToken,
}

/// Default [`PlaybackService`] for both media and TTS.
pub struct FilePlayer {
    source: AudioSource,
    root: PathBuf,
    mixer: Arc<dyn AudioMixer>,
    playlists: Arc<DashMap<BroadcastId, ActivePlaylist>>,
    completion_tx: broadcast::Sender<PlaybackCompleted>,
    frame_interval: Duration,
}

impl FilePlayer {
    pub fn new(source: AudioSource, root: impl Into<PathBuf>, mixer: Arc<dyn AudioMixer>) -> Self {
        let (completion_tx, _) = broadcast::channel(COMPLETION_CHANNEL_CAPACITY);
        Self {
            source,
            root: root.into(),
            mixer,
            playlists: Arc::new(DashMap::new()),
            completion_tx,
            frame_interval: Duration::from_millis(FRAME_DURATION_MS as u64),
        }
    }

    /// Overrides the frame pacing interval.
    #[must_use]
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Resolves a playlist filename under the root directory.
    ///
    /// Absolute paths and parent components are rejected.
    async fn resolve(&self, filename: &str) -> Result<PathBuf, PlaybackError> {
        let relative = Path::new(filename);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if filename.is_empty() || escapes {
            return Err(PlaybackError::FileNotFound(filename.to_string()));
        }

        let path = self.root.join(relative);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            _ => Err(PlaybackError::FileNotFound(filename.to_string())),
        }
    }
}

#[async_trait]
impl PlaybackService for FilePlayer {
    fn source(&self) -> AudioSource {
        self.source
    }

    async fn handle_play_request(&self, request: PlayRequest) -> Result<PlayOutcome, PlaybackError> {
        if request.items.is_empty() {
            return Err(PlaybackError::NothingToPlay);
        }

        let mut paths = Vec::with_capacity(request.items.len());
        for item in &request.items {
            paths.push(self.resolve(&item.filename).await?);
        }
        let files: Vec<String> = request.items.iter().map(|i| i.filename.clone()).collect();

        if let Some((_, previous)) = self.playlists.remove(&request.broadcast_id) {
            log::info!(
                "[Player] Replacing {} playlist {} for broadcast {}",
                self.source,
                previous.session_id,
                request.broadcast_id
            );
            previous.token.cancel();
        }

        let session_id = format!("{}-{}", self.source, Uuid::new_v4());
        let current = Arc::new(AtomicUsize::new(0));
        let token = CancellationToken::new();
        self.playlists.insert(
            request.broadcast_id.clone(),
            ActivePlaylist {
                session_id: session_id.clone(),
                files: files.clone(),
                current: Arc::clone(&current),
                token: token.clone(),
            },
        );

        log::info!(
            "[Player] Starting {} playlist {} ({} file(s)) for broadcast {}",
            self.source,
            session_id,
            files.len(),
            request.broadcast_id
        );

        let task = PlaylistTask {
            broadcast_id: request.broadcast_id,
            source: self.source,
            session_id: session_id.clone(),
            paths,
            current,
            token,
            mixer: Arc::clone(&self.mixer),
            playlists: Arc::clone(&self.playlists),
            completion_tx: self.completion_tx.clone(),
            frame_interval: self.frame_interval,
        };
        tokio::spawn(task.run());

        Ok(PlayOutcome {
            success: true,
            session_id,
            files,
        })
    }

    async fn stop_by_broadcast_id(&self, broadcast_id: &BroadcastId) -> bool {
        match self.playlists.remove(broadcast_id) {
            Some((_, playlist)) => {
                playlist.token.cancel();
                log::info!(
                    "[Player] Stopped {} playlist {} for broadcast {}",
                    self.source,
                    playlist.session_id,
                    broadcast_id
                );
                true
            }
            None => false,
        }
    }

    fn status_by_broadcast_id(&self, broadcast_id: &BroadcastId) -> PlaybackStatus {
        let Some(playlist) = self.playlists.get(broadcast_id) else {
            return PlaybackStatus::default();
        };
        let index = playlist.current.load(Ordering::Relaxed);
        PlaybackStatus {
            is_playing: true,
            session_id: Some(playlist.session_id.clone()),
            current_file: playlist.files.get(index).cloned(),
            current_index: index,
            total_files: playlist.files.len(),
        }
    }

    fn subscribe_completion(&self) -> broadcast::Receiver<PlaybackCompleted> {
        self.completion_tx.subscribe()
    }
}

struct PlaylistTask {
    broadcast_id: BroadcastId,
    source: AudioSource,
    session_id: String,
    paths: Vec<PathBuf>,
    current: Arc<AtomicUsize>,
    token: CancellationToken,
    mixer: Arc<dyn AudioMixer>,
    playlists: Arc<DashMap<BroadcastId, ActivePlaylist>>,
    completion_tx: broadcast::Sender<PlaybackCompleted>,
    frame_interval: Duration,
}

impl PlaylistTask {
    async fn run(self) {
        let mut ticker = tokio::time::interval(self.frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for (index, path) in self.paths.iter().enumerate() {
            self.current.store(index, Ordering::Relaxed);
            let samples = match load_samples(path).await {
                Ok(samples) => samples,
                Err(e) => {
                    log::warn!("[Player] Skipping {}: {}", path.display(), e);
                    continue;
                }
            };

            for frame in samples.chunks(FRAME_SAMPLES) {
                tokio::select! {
                    _ = self.token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let pcm = Bytes::from(samples_to_pcm(frame));
                if let Err(e) = self
                    .mixer
                    .add_source_data(&self.broadcast_id, self.source, pcm)
                    .await
                {
                    log::warn!(
                        "[Player] Mixer rejected {} audio for {}: {}",
                        self.source,
                        self.broadcast_id,
                        e
                    );
                    self.finish();
                    return;
                }
            }
        }

        if !self.token.is_cancelled() {
            self.finish();
        }
    }

    /// Clears status, then raises completion if this playlist was still current.
    fn finish(&self) {
        let removed = self
            .playlists
            .remove_if(&self.broadcast_id, |_, p| p.session_id == self.session_id)
            .is_some();
        if !removed {
            return;
        }

        log::info!(
            "[Player] {} playlist {} finished for broadcast {}",
            self.source,
            self.session_id,
            self.broadcast_id
        );
        let event = PlaybackCompleted {
            broadcast_id: self.broadcast_id.clone(),
            source: self.source,
            session_id: self.session_id.clone(),
        };
        if self.completion_tx.send(event).is_err() {
            log::debug!("[Player] No completion subscribers");
        }
    }
}

async fn load_samples(path: &Path) -> Result<Vec<i16>, PlaybackError> {
    let data = tokio::fs::read(path).await?;
    let unsupported = |reason: String| PlaybackError::UnsupportedFile {
        path: path.display().to_string(),
        reason,
    };
    // Resampling is CPU-bound.
    tokio::task::spawn_blocking(move || decode_audio_file(&data))
        .await
        .map_err(|e| unsupported(e.to_string()))?
        .map_err(|e| unsupported(e.to_string()))
}
