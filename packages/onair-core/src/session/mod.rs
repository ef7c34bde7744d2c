//! Broadcast session model.
//!
//! A [`BroadcastSession`] is the live state of one ongoing broadcast. Sessions
//! are shared as `Arc<BroadcastSession>` between the owning connection, the
//! cleanup coordinator and completion callbacks, so every field that changes
//! after creation is atomic or behind a lock.

mod descriptors;
pub mod registry;

pub use descriptors::{
    AudioSource, ChannelId, GroupId, MediaInfo, SpeakerId, SpeakerInfo, TtsInfo, VolumeLevels,
};
pub use registry::SessionRegistry;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::{Mutex, MutexGuard};

use crate::utils::now_millis;

// ─────────────────────────────────────────────────────────────────────────────
// Identifiers
// ─────────────────────────────────────────────────────────────────────────────

/// Opaque broadcast identifier.
///
/// Clients send either strings or integers; both normalize to the same string
/// key so `"42"` and `42` address the same session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct BroadcastId(String);

impl BroadcastId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BroadcastId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BroadcastId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<u64> for BroadcastId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl<'de> Deserialize<'de> for BroadcastId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(i64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Self(n.to_string())),
            Raw::Text(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    Err(serde::de::Error::custom("broadcastId must not be empty"))
                } else {
                    Ok(Self(trimmed.to_string()))
                }
            }
        }
    }
}

/// Encoding of inbound microphone frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MicEncoding {
    /// Raw 16-bit little-endian PCM, forwarded as-is.
    #[default]
    Pcm,
    /// Opus packets, decoded per connection before mixing.
    Opus,
}

// ─────────────────────────────────────────────────────────────────────────────
// Completion Gate
// ─────────────────────────────────────────────────────────────────────────────

/// Per-session barrier joining the media and TTS producers.
///
/// Non-forced teardown only proceeds once neither producer is active, and
/// `claim_teardown` lets exactly one caller run the teardown steps.
#[derive(Debug, Default)]
pub struct CompletionGate {
    media_active: AtomicBool,
    tts_active: AtomicBool,
    teardown_claimed: AtomicBool,
}

impl CompletionGate {
    /// Marks a playback producer as started or finished. Microphone is ignored.
    pub fn set_active(&self, source: AudioSource, active: bool) {
        match source {
            AudioSource::Media => self.media_active.store(active, Ordering::SeqCst),
            AudioSource::Tts => self.tts_active.store(active, Ordering::SeqCst),
            AudioSource::Microphone => {}
        }
    }

    #[must_use]
    pub fn is_active(&self, source: AudioSource) -> bool {
        match source {
            AudioSource::Media => self.media_active.load(Ordering::SeqCst),
            AudioSource::Tts => self.tts_active.load(Ordering::SeqCst),
            AudioSource::Microphone => false,
        }
    }

    /// True while media or TTS playback is still running.
    #[must_use]
    pub fn any_playback_active(&self) -> bool {
        self.is_active(AudioSource::Media) || self.is_active(AudioSource::Tts)
    }

    /// Returns `true` for the first caller only.
    pub fn claim_teardown(&self) -> bool {
        self.teardown_claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.teardown_claimed.load(Ordering::SeqCst)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Broadcast Session
// ─────────────────────────────────────────────────────────────────────────────

/// Inputs for building a session, resolved by the connection handler.
pub struct SessionParams {
    pub broadcast_id: BroadcastId,
    pub channel_id: ChannelId,
    pub connection_id: String,
    pub selected_group_ids: Vec<GroupId>,
    pub encoding: MicEncoding,
    pub speakers: Vec<SpeakerInfo>,
    pub media: Vec<MediaInfo>,
    pub tts: Vec<TtsInfo>,
}

/// State of one active broadcast.
pub struct BroadcastSession {
    broadcast_id: BroadcastId,
    channel_id: ChannelId,
    connection_id: String,
    start_time: Instant,
    started_at_ms: u64,
    selected_group_ids: Vec<GroupId>,
    encoding: MicEncoding,
    packet_count: AtomicU64,
    total_bytes: AtomicU64,
    online_speakers: RwLock<Vec<SpeakerInfo>>,
    selected_media: Vec<MediaInfo>,
    selected_tts: Vec<TtsInfo>,
    gate: CompletionGate,
    /// Serializes playback start against teardown for this broadcast.
    lifecycle: Mutex<()>,
}

impl BroadcastSession {
    pub fn new(params: SessionParams) -> Self {
        let mut selected_group_ids = Vec::with_capacity(params.selected_group_ids.len());
        for id in params.selected_group_ids {
            if !selected_group_ids.contains(&id) {
                selected_group_ids.push(id);
            }
        }

        Self {
            broadcast_id: params.broadcast_id,
            channel_id: params.channel_id,
            connection_id: params.connection_id,
            start_time: Instant::now(),
            started_at_ms: now_millis(),
            selected_group_ids,
            encoding: params.encoding,
            packet_count: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            online_speakers: RwLock::new(params.speakers),
            selected_media: params.media,
            selected_tts: params.tts,
            gate: CompletionGate::default(),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn broadcast_id(&self) -> &BroadcastId {
        &self.broadcast_id
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn selected_group_ids(&self) -> &[GroupId] {
        &self.selected_group_ids
    }

    pub fn encoding(&self) -> MicEncoding {
        self.encoding
    }

    pub fn selected_media(&self) -> &[MediaInfo] {
        &self.selected_media
    }

    pub fn selected_tts(&self) -> &[TtsInfo] {
        &self.selected_tts
    }

    pub fn gate(&self) -> &CompletionGate {
        &self.gate
    }

    /// Time since the session was created.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Counts one inbound audio packet and returns the new total.
    pub fn record_packet(&self) -> u64 {
        self.packet_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Adds decoded payload bytes to the throughput counter.
    pub fn add_bytes(&self, bytes: usize) {
        self.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn packet_count(&self) -> u64 {
        self.packet_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    /// Snapshot of every speaker resolved at connect time.
    #[must_use]
    pub fn online_speakers(&self) -> Vec<SpeakerInfo> {
        self.online_speakers.read().clone()
    }

    /// Speakers currently eligible for fan-out.
    #[must_use]
    pub fn active_speakers(&self) -> Vec<SpeakerInfo> {
        self.online_speakers
            .read()
            .iter()
            .filter(|s| s.active)
            .cloned()
            .collect()
    }

    /// Toggles the active flag on this session's own speaker instance.
    ///
    /// Returns the previous flag, or `None` if the speaker is not part of
    /// the session.
    pub fn set_speaker_active(&self, speaker_id: SpeakerId, active: bool) -> Option<bool> {
        let mut speakers = self.online_speakers.write();
        let speaker = speakers.iter_mut().find(|s| s.id == speaker_id)?;
        let previous = speaker.active;
        speaker.active = active;
        Some(previous)
    }

    /// Acquires the lifecycle lock shared by playback start and teardown.
    pub async fn lock_lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().await
    }

    /// Serializable view for the HTTP API and status messages.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            broadcast_id: self.broadcast_id.clone(),
            channel_id: self.channel_id,
            connection_id: self.connection_id.clone(),
            started_at: self.started_at_ms,
            duration_ms: self.duration().as_millis() as u64,
            selected_group_ids: self.selected_group_ids.clone(),
            packet_count: self.packet_count(),
            total_bytes: self.total_bytes(),
            active_speakers: self.active_speakers().len(),
            media_playing: self.gate.is_active(AudioSource::Media),
            tts_playing: self.gate.is_active(AudioSource::Tts),
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub broadcast_id: BroadcastId,
    pub channel_id: ChannelId,
    pub connection_id: String,
    pub started_at: u64,
    pub duration_ms: u64,
    pub selected_group_ids: Vec<GroupId>,
    pub packet_count: u64,
    pub total_bytes: u64,
    pub active_speakers: usize,
    pub media_playing: bool,
    pub tts_playing: bool,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Builds a session with the given speakers and no playlists.
    pub(crate) fn session_with(
        broadcast_id: &str,
        connection_id: &str,
        speakers: Vec<SpeakerInfo>,
    ) -> BroadcastSession {
        BroadcastSession::new(SessionParams {
            broadcast_id: BroadcastId::from(broadcast_id),
            channel_id: 1,
            connection_id: connection_id.to_string(),
            selected_group_ids: vec![10],
            encoding: MicEncoding::Pcm,
            speakers,
            media: vec![],
            tts: vec![],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::session_with;
    use super::*;

    #[test]
    fn broadcast_id_accepts_strings_and_numbers() {
        let from_num: BroadcastId = serde_json::from_str("42").unwrap();
        let from_str: BroadcastId = serde_json::from_str("\" 42 \"").unwrap();
        assert_eq!(from_num, from_str);
        assert_eq!(from_num.as_str(), "42");
        assert!(serde_json::from_str::<BroadcastId>("\"\"").is_err());
    }

    #[test]
    fn counters_accumulate() {
        let session = session_with("1", "ws-1", vec![]);
        assert_eq!(session.record_packet(), 1);
        session.add_bytes(100);
        assert_eq!(session.record_packet(), 2);
        session.add_bytes(60);
        assert_eq!(session.packet_count(), 2);
        assert_eq!(session.total_bytes(), 160);
    }

    #[test]
    fn group_ids_are_deduplicated_in_order() {
        let session = BroadcastSession::new(SessionParams {
            broadcast_id: BroadcastId::from("1"),
            channel_id: 1,
            connection_id: "ws-1".into(),
            selected_group_ids: vec![3, 1, 3, 2, 1],
            encoding: MicEncoding::Pcm,
            speakers: vec![],
            media: vec![],
            tts: vec![],
        });
        assert_eq!(session.selected_group_ids(), &[3, 1, 2]);
    }

    #[test]
    fn activation_acts_on_session_instance() {
        let speakers = vec![
            SpeakerInfo::new(1, "A", "192.168.1.1", None, false),
            SpeakerInfo::new(2, "B", "192.168.1.2", None, false),
        ];
        let session = session_with("1", "ws-1", speakers);
        assert_eq!(session.active_speakers().len(), 2);

        assert_eq!(session.set_speaker_active(2, false), Some(true));
        let active = session.active_speakers();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, 1);
        assert_eq!(session.online_speakers().len(), 2);

        assert_eq!(session.set_speaker_active(99, true), None);
    }

    #[test]
    fn gate_claim_is_single_winner() {
        let gate = CompletionGate::default();
        assert!(gate.claim_teardown());
        assert!(!gate.claim_teardown());
        assert!(gate.is_torn_down());
    }

    #[test]
    fn gate_tracks_playback_sources() {
        let gate = CompletionGate::default();
        gate.set_active(AudioSource::Media, true);
        assert!(gate.any_playback_active());
        gate.set_active(AudioSource::Media, false);
        gate.set_active(AudioSource::Microphone, true);
        assert!(!gate.any_playback_active());
    }
}
