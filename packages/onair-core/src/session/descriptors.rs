//! Value records describing fan-out targets and playable content.
//!
//! Produced by the preparation service at connect time and snapshotted into
//! the session; the core never re-resolves them per audio frame.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::protocol_constants::DEFAULT_VOLUME_LEVEL;

pub type ChannelId = u32;
pub type GroupId = u32;
pub type SpeakerId = u32;

/// A network speaker endpoint.
///
/// Equality and hashing use the speaker id only: two descriptors with the
/// same id are the same speaker even if their other fields differ.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeakerInfo {
    pub id: SpeakerId,
    pub name: String,
    /// Address audio is actually sent to (VPN address when VPN routing is on).
    pub address: String,
    pub primary_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpn_address: Option<String>,
    pub use_vpn: bool,
    pub active: bool,
}

impl SpeakerInfo {
    /// Builds an active speaker, resolving its effective address.
    pub fn new(
        id: SpeakerId,
        name: impl Into<String>,
        primary_address: impl Into<String>,
        vpn_address: Option<String>,
        use_vpn: bool,
    ) -> Self {
        let primary_address = primary_address.into();
        let vpn_address = vpn_address.filter(|a| !a.trim().is_empty());
        let address = effective_address(&primary_address, vpn_address.as_deref(), use_vpn);
        Self {
            id,
            name: name.into(),
            address,
            primary_address,
            vpn_address,
            use_vpn,
            active: true,
        }
    }

    /// Returns a copy with the given active flag.
    #[must_use]
    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }
}

/// VPN address wins when routing is enabled and one is configured.
fn effective_address(primary: &str, vpn: Option<&str>, use_vpn: bool) -> String {
    match vpn {
        Some(vpn) if use_vpn => vpn.to_string(),
        _ => primary.to_string(),
    }
}

impl PartialEq for SpeakerInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SpeakerInfo {}

impl Hash for SpeakerInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// A media file selected for a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub id: u32,
    pub filename: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// A pre-rendered text-to-speech announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TtsInfo {
    pub id: u32,
    pub filename: String,
    pub text: String,
}

/// Audio producers that feed the mixer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioSource {
    Microphone,
    Media,
    Tts,
}

impl AudioSource {
    pub const ALL: [AudioSource; 3] = [Self::Microphone, Self::Media, Self::Tts];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Microphone => "microphone",
            Self::Media => "media",
            Self::Tts => "tts",
        }
    }

    /// Index into per-source arrays.
    #[must_use]
    pub const fn index(&self) -> usize {
        match self {
            Self::Microphone => 0,
            Self::Media => 1,
            Self::Tts => 2,
        }
    }
}

impl std::fmt::Display for AudioSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-channel volume levels (0-100), persisted by the broadcast store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeLevels {
    pub microphone: u8,
    pub media: u8,
    pub tts: u8,
}

impl VolumeLevels {
    #[must_use]
    pub fn get(&self, source: AudioSource) -> u8 {
        match source {
            AudioSource::Microphone => self.microphone,
            AudioSource::Media => self.media,
            AudioSource::Tts => self.tts,
        }
    }

    /// Sets a level, clamping to 0-100.
    pub fn set(&mut self, source: AudioSource, level: u8) {
        let level = level.min(100);
        match source {
            AudioSource::Microphone => self.microphone = level,
            AudioSource::Media => self.media = level,
            AudioSource::Tts => self.tts = level,
        }
    }
}

impl Default for VolumeLevels {
    fn default() -> Self {
        Self {
            microphone: DEFAULT_VOLUME_LEVEL,
            media: DEFAULT_VOLUME_LEVEL,
            tts: DEFAULT_VOLUME_LEVEL,
        }
    }
}
