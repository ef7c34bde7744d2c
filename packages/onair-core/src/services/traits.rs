//! Trait abstractions for the collaborators a broadcast depends on.
//!
//! The connection handler and cleanup coordinator only ever see these traits.
//! Default implementations live next door (`mixer`, `fanout`, `player`,
//! `preparation`, `store`) and are wired together in bootstrap.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::codec::CodecError;
use crate::error::ErrorCode;
use crate::services::store::{BroadcastRecord, StoreError};
use crate::session::{
    AudioSource, BroadcastId, ChannelId, GroupId, MediaInfo, SpeakerId, SpeakerInfo, TtsInfo,
    VolumeLevels,
};

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Errors from resolving a channel's speakers and playlists.
#[derive(Debug, Error)]
pub enum PreparationError {
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),
}

impl ErrorCode for PreparationError {
    fn code(&self) -> &'static str {
        match self {
            Self::UnknownChannel(_) => "unknown_channel",
        }
    }
}

/// Errors from the audio mixer.
#[derive(Debug, Error)]
pub enum MixerError {
    /// No mix channel exists for the broadcast.
    #[error("mixer not initialized for broadcast {0}")]
    NotInitialized(BroadcastId),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl ErrorCode for MixerError {
    fn code(&self) -> &'static str {
        match self {
            Self::NotInitialized(_) => "mixer_not_initialized",
            Self::Codec(e) => e.code(),
        }
    }
}

/// Errors from a media or TTS player.
#[derive(Debug, Error)]
pub enum PlaybackError {
    /// The request selected no files.
    #[error("nothing to play")]
    NothingToPlay,

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("unsupported file {path}: {reason}")]
    UnsupportedFile { path: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Mixer(#[from] MixerError),
}

impl ErrorCode for PlaybackError {
    fn code(&self) -> &'static str {
        match self {
            Self::NothingToPlay => "nothing_to_play",
            Self::FileNotFound(_) => "file_not_found",
            Self::UnsupportedFile { .. } => "unsupported_file",
            Self::Io(_) => "io_error",
            Self::Mixer(e) => e.code(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Value Types
// ─────────────────────────────────────────────────────────────────────────────

/// A speaker that was claimed by another channel before this broadcast took it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Takeover {
    pub speaker_id: SpeakerId,
    pub previous_channel_id: ChannelId,
}

/// Everything a broadcast needs, resolved once at connect time.
#[derive(Debug, Clone, Default)]
pub struct PreparedBroadcast {
    pub speakers: Vec<SpeakerInfo>,
    pub media: Vec<MediaInfo>,
    pub tts: Vec<TtsInfo>,
    pub takeovers: Vec<Takeover>,
}

/// One file in a play request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayItem {
    pub id: u32,
    pub filename: String,
}

impl From<&MediaInfo> for PlayItem {
    fn from(m: &MediaInfo) -> Self {
        Self {
            id: m.id,
            filename: m.filename.clone(),
        }
    }
}

impl From<&TtsInfo> for PlayItem {
    fn from(t: &TtsInfo) -> Self {
        Self {
            id: t.id,
            filename: t.filename.clone(),
        }
    }
}

/// A request to play a playlist into a broadcast.
#[derive(Debug, Clone)]
pub struct PlayRequest {
    pub broadcast_id: BroadcastId,
    pub channel_id: ChannelId,
    pub speakers: Vec<SpeakerInfo>,
    pub items: Vec<PlayItem>,
}

/// Result of a successful play request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayOutcome {
    pub success: bool,
    pub session_id: String,
    pub files: Vec<String>,
}

/// Player state for one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackStatus {
    pub is_playing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    pub current_index: usize,
    pub total_files: usize,
}

/// Raised by a player when a playlist reaches its natural end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackCompleted {
    pub broadcast_id: BroadcastId,
    pub source: AudioSource,
    pub session_id: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Collaborator Traits
// ─────────────────────────────────────────────────────────────────────────────

/// Resolves a channel's online speakers and playlists.
#[async_trait]
pub trait BroadcastPreparation: Send + Sync {
    /// Resolves speakers, media and TTS for a broadcast.
    ///
    /// # Arguments
    /// * `channel_id` - Channel the broadcast runs on
    /// * `group_ids` - Speaker groups selected by the client
    async fn prepare(
        &self,
        channel_id: ChannelId,
        group_ids: &[GroupId],
    ) -> Result<PreparedBroadcast, PreparationError>;

    /// Releases every speaker claim held by the channel.
    async fn release(&self, channel_id: ChannelId);
}

/// Mixes microphone, media and TTS audio per broadcast.
#[async_trait]
pub trait AudioMixer: Send + Sync {
    /// Creates (or re-creates) the mix channel for a broadcast.
    async fn initialize(
        &self,
        broadcast_id: &BroadcastId,
        channel_id: ChannelId,
        speakers: Vec<SpeakerInfo>,
    ) -> Result<(), MixerError>;

    /// Queues one frame of little-endian 16-bit microphone PCM.
    async fn add_microphone_data(
        &self,
        broadcast_id: &BroadcastId,
        pcm: Bytes,
    ) -> Result<(), MixerError>;

    /// Queues PCM from a media or TTS player.
    async fn add_source_data(
        &self,
        broadcast_id: &BroadcastId,
        source: AudioSource,
        pcm: Bytes,
    ) -> Result<(), MixerError>;

    /// Sets a source gain (0-100).
    async fn set_volume(
        &self,
        broadcast_id: &BroadcastId,
        source: AudioSource,
        level: u8,
    ) -> Result<(), MixerError>;

    /// Replaces the fan-out speaker set.
    async fn update_speakers(
        &self,
        broadcast_id: &BroadcastId,
        speakers: Vec<SpeakerInfo>,
    ) -> Result<(), MixerError>;

    /// Stops and removes the mix channel. Stopping an unknown broadcast is not an error.
    async fn stop(&self, broadcast_id: &BroadcastId) -> Result<(), MixerError>;

    fn is_active(&self, broadcast_id: &BroadcastId) -> bool;
}

/// Delivers encoded frames to speaker endpoints.
#[async_trait]
pub trait SpeakerFanout: Send + Sync {
    /// Sends one frame to every speaker. Returns how many sends succeeded.
    async fn send_audio_to_speakers(&self, speakers: &[SpeakerInfo], frame: &[u8]) -> usize;
}

/// A media or TTS player.
#[async_trait]
pub trait PlaybackService: Send + Sync {
    /// The mixer source this player feeds.
    fn source(&self) -> AudioSource;

    /// Starts a playlist, replacing any playlist already running for the broadcast.
    async fn handle_play_request(&self, request: PlayRequest) -> Result<PlayOutcome, PlaybackError>;

    /// Stops the broadcast's playlist. Returns `false` if nothing was playing.
    ///
    /// Stopping never raises a completion event.
    async fn stop_by_broadcast_id(&self, broadcast_id: &BroadcastId) -> bool;

    fn status_by_broadcast_id(&self, broadcast_id: &BroadcastId) -> PlaybackStatus;

    /// Subscribes to natural-end completion events.
    fn subscribe_completion(&self) -> broadcast::Receiver<PlaybackCompleted>;
}

/// Persisted channel and broadcast state.
#[async_trait]
pub trait BroadcastStore: Send + Sync {
    /// Stored volume levels, or defaults for a channel never adjusted.
    async fn channel_volumes(&self, channel_id: ChannelId) -> Result<VolumeLevels, StoreError>;

    async fn set_channel_volume(
        &self,
        channel_id: ChannelId,
        source: AudioSource,
        level: u8,
    ) -> Result<(), StoreError>;

    async fn set_channel_broadcasting(
        &self,
        channel_id: ChannelId,
        broadcasting: bool,
    ) -> Result<(), StoreError>;

    async fn is_channel_broadcasting(&self, channel_id: ChannelId) -> Result<bool, StoreError>;

    /// Opens an ongoing broadcast record.
    async fn start_broadcast_record(&self, record: BroadcastRecord) -> Result<(), StoreError>;

    /// Marks every ongoing record for the channel finished. Returns how many changed.
    async fn finish_ongoing_broadcasts(&self, channel_id: ChannelId) -> Result<usize, StoreError>;
}
