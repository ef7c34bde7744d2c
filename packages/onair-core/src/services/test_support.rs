//! Mock collaborators shared by service and API tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use super::traits::*;
use crate::session::{AudioSource, BroadcastId, ChannelId, GroupId, SpeakerInfo};

pub(crate) fn speaker(id: u32) -> SpeakerInfo {
    SpeakerInfo::new(id, format!("Speaker {}", id), format!("192.168.1.{}", id), None, false)
}

/// Mixer that records calls instead of mixing.
#[derive(Default)]
pub(crate) struct MockMixer {
    pub(crate) fail_init: AtomicBool,
    pub(crate) initialized: DashMap<BroadcastId, Vec<SpeakerInfo>>,
    pub(crate) mic_frames: Mutex<Vec<(BroadcastId, Bytes)>>,
    pub(crate) source_frames: AtomicUsize,
    pub(crate) volumes: Mutex<Vec<(BroadcastId, AudioSource, u8)>>,
    pub(crate) stops: AtomicUsize,
}

#[async_trait]
impl AudioMixer for MockMixer {
    async fn initialize(
        &self,
        broadcast_id: &BroadcastId,
        _channel_id: ChannelId,
        speakers: Vec<SpeakerInfo>,
    ) -> Result<(), MixerError> {
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(MixerError::NotInitialized(broadcast_id.clone()));
        }
        self.initialized.insert(broadcast_id.clone(), speakers);
        Ok(())
    }

    async fn add_microphone_data(
        &self,
        broadcast_id: &BroadcastId,
        pcm: Bytes,
    ) -> Result<(), MixerError> {
        self.mic_frames.lock().push((broadcast_id.clone(), pcm));
        Ok(())
    }

    async fn add_source_data(
        &self,
        _broadcast_id: &BroadcastId,
        _source: AudioSource,
        _pcm: Bytes,
    ) -> Result<(), MixerError> {
        self.source_frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_volume(
        &self,
        broadcast_id: &BroadcastId,
        source: AudioSource,
        level: u8,
    ) -> Result<(), MixerError> {
        self.volumes.lock().push((broadcast_id.clone(), source, level));
        Ok(())
    }

    async fn update_speakers(
        &self,
        broadcast_id: &BroadcastId,
        speakers: Vec<SpeakerInfo>,
    ) -> Result<(), MixerError> {
        self.initialized.insert(broadcast_id.clone(), speakers);
        Ok(())
    }

    async fn stop(&self, broadcast_id: &BroadcastId) -> Result<(), MixerError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.initialized.remove(broadcast_id);
        Ok(())
    }

    fn is_active(&self, broadcast_id: &BroadcastId) -> bool {
        self.initialized.contains_key(broadcast_id)
    }
}

/// Player whose playing state is set directly by the test.
pub(crate) struct MockPlayer {
    source: AudioSource,
    playing: DashMap<BroadcastId, String>,
    pub(crate) stops: AtomicUsize,
    pub(crate) requests: Mutex<Vec<PlayRequest>>,
    completion_tx: broadcast::Sender<PlaybackCompleted>,
}

impl MockPlayer {
    pub(crate) fn new(source: AudioSource) -> Self {
        let (completion_tx, _) = broadcast::channel(16);
        Self {
            source,
            playing: DashMap::new(),
            stops: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            completion_tx,
        }
    }

    pub(crate) fn set_playing(&self, broadcast_id: &str) {
        self.playing
            .insert(BroadcastId::from(broadcast_id), format!("{}-mock", self.source));
    }

    /// Ends playback naturally: clears status first, then raises completion.
    pub(crate) fn finish(&self, broadcast_id: &str) {
        let id = BroadcastId::from(broadcast_id);
        if let Some((_, session_id)) = self.playing.remove(&id) {
            let _ = self.completion_tx.send(PlaybackCompleted {
                broadcast_id: id,
                source: self.source,
                session_id,
            });
        }
    }
}

#[async_trait]
impl PlaybackService for MockPlayer {
    fn source(&self) -> AudioSource {
        self.source
    }

    async fn handle_play_request(&self, request: PlayRequest) -> Result<PlayOutcome, PlaybackError> {
        if request.items.is_empty() {
            return Err(PlaybackError::NothingToPlay);
        }
        let session_id = format!("{}-mock", self.source);
        self.playing
            .insert(request.broadcast_id.clone(), session_id.clone());
        let files = request.items.iter().map(|i| i.filename.clone()).collect();
        self.requests.lock().push(request);
        Ok(PlayOutcome {
            success: true,
            session_id,
            files,
        })
    }

    async fn stop_by_broadcast_id(&self, broadcast_id: &BroadcastId) -> bool {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.playing.remove(broadcast_id).is_some()
    }

    fn status_by_broadcast_id(&self, broadcast_id: &BroadcastId) -> PlaybackStatus {
        match self.playing.get(broadcast_id) {
            Some(session_id) => PlaybackStatus {
                is_playing: true,
                session_id: Some(session_id.clone()),
                current_file: None,
                current_index: 0,
                total_files: 1,
            },
            None => PlaybackStatus::default(),
        }
    }

    fn subscribe_completion(&self) -> broadcast::Receiver<PlaybackCompleted> {
        self.completion_tx.subscribe()
    }
}

/// Preparation returning a fixed result for every channel.
pub(crate) struct MockPreparation {
    pub(crate) prepared: Mutex<PreparedBroadcast>,
    pub(crate) releases: AtomicUsize,
}

impl MockPreparation {
    pub(crate) fn new(prepared: PreparedBroadcast) -> Self {
        Self {
            prepared: Mutex::new(prepared),
            releases: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BroadcastPreparation for MockPreparation {
    async fn prepare(
        &self,
        _channel_id: ChannelId,
        _group_ids: &[GroupId],
    ) -> Result<PreparedBroadcast, PreparationError> {
        Ok(self.prepared.lock().clone())
    }

    async fn release(&self, _channel_id: ChannelId) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// The full mock collaborator set.
pub(crate) struct Mocks {
    pub(crate) mixer: Arc<MockMixer>,
    pub(crate) media: Arc<MockPlayer>,
    pub(crate) tts: Arc<MockPlayer>,
    pub(crate) preparation: Arc<MockPreparation>,
    pub(crate) store: Arc<super::store::JsonBroadcastStore>,
}

impl Mocks {
    pub(crate) fn new(prepared: PreparedBroadcast) -> Self {
        Self {
            mixer: Arc::new(MockMixer::default()),
            media: Arc::new(MockPlayer::new(AudioSource::Media)),
            tts: Arc::new(MockPlayer::new(AudioSource::Tts)),
            preparation: Arc::new(MockPreparation::new(prepared)),
            store: Arc::new(super::store::JsonBroadcastStore::in_memory()),
        }
    }
}
