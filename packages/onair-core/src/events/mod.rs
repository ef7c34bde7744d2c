//! Event system for real-time client communication.
//!
//! This module provides:
//! - [`EventEmitter`] trait for domain services to emit events
//! - [`BroadcastEventBridge`] for WebSocket transport
//! - Event types for session and playback lifecycles

mod bridge;
pub(crate) mod emitter;

pub use bridge::BroadcastEventBridge;
pub use emitter::{EventEmitter, LoggingEventEmitter};

use serde::Serialize;

use crate::session::{AudioSource, BroadcastId, ChannelId, SpeakerId};

/// Events broadcast to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "category", rename_all = "camelCase")]
pub enum BroadcastEvent {
    /// Broadcast session lifecycle.
    Session(SessionEvent),

    /// Media and TTS playback lifecycle.
    Playback(PlaybackEvent),
}

impl BroadcastEvent {
    /// The broadcast this event belongs to.
    #[must_use]
    pub fn broadcast_id(&self) -> &BroadcastId {
        match self {
            Self::Session(e) => e.broadcast_id(),
            Self::Playback(e) => e.broadcast_id(),
        }
    }
}

/// Events related to broadcast session state changes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    /// A session was registered and the mixer initialized.
    #[serde(rename_all = "camelCase")]
    Started {
        broadcast_id: BroadcastId,
        channel_id: ChannelId,
        speaker_count: usize,
        timestamp: u64,
    },
    /// A session was torn down.
    #[serde(rename_all = "camelCase")]
    Ended {
        broadcast_id: BroadcastId,
        channel_id: ChannelId,
        reason: String,
        duration_ms: u64,
        packet_count: u64,
        total_bytes: u64,
        timestamp: u64,
    },
    /// A speaker was enabled or disabled for fan-out.
    #[serde(rename_all = "camelCase")]
    SpeakerUpdated {
        broadcast_id: BroadcastId,
        speaker_id: SpeakerId,
        active: bool,
        timestamp: u64,
    },
}

impl SessionEvent {
    #[must_use]
    pub fn broadcast_id(&self) -> &BroadcastId {
        match self {
            Self::Started { broadcast_id, .. }
            | Self::Ended { broadcast_id, .. }
            | Self::SpeakerUpdated { broadcast_id, .. } => broadcast_id,
        }
    }
}

/// Events related to media/TTS playback.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PlaybackEvent {
    /// A playlist started.
    #[serde(rename_all = "camelCase")]
    Started {
        broadcast_id: BroadcastId,
        source: AudioSource,
        session_id: String,
        files: Vec<String>,
        timestamp: u64,
    },
    /// A playlist reached its natural end.
    #[serde(rename_all = "camelCase")]
    Completed {
        broadcast_id: BroadcastId,
        source: AudioSource,
        session_id: String,
        timestamp: u64,
    },
    /// A playlist was stopped on request.
    #[serde(rename_all = "camelCase")]
    Stopped {
        broadcast_id: BroadcastId,
        source: AudioSource,
        timestamp: u64,
    },
}

impl PlaybackEvent {
    #[must_use]
    pub fn broadcast_id(&self) -> &BroadcastId {
        match self {
            Self::Started { broadcast_id, .. }
            | Self::Completed { broadcast_id, .. }
            | Self::Stopped { broadcast_id, .. } => broadcast_id,
        }
    }
}

impl From<SessionEvent> for BroadcastEvent {
    fn from(event: SessionEvent) -> Self {
        BroadcastEvent::Session(event)
    }
}

impl From<PlaybackEvent> for BroadcastEvent {
    fn from(event: PlaybackEvent) -> Self {
        BroadcastEvent::Playback(event)
    }
}
