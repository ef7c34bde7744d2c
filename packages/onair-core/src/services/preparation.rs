//! Static-directory implementation of [`BroadcastPreparation`].
//!
//! Speakers, groups and channel playlists come from the server's YAML
//! configuration. A speaker is claimed by the last channel that prepared a
//! broadcast containing it; claims are released at teardown.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::services::traits::{BroadcastPreparation, PreparationError, PreparedBroadcast, Takeover};
use crate::session::{ChannelId, GroupId, MediaInfo, SpeakerId, SpeakerInfo, TtsInfo};

fn default_true() -> bool {
    true
}

/// A configured speaker endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SpeakerEntry {
    pub id: SpeakerId,
    pub name: String,
    /// `ip` or `ip:port`.
    pub address: String,
    #[serde(default)]
    pub vpn_address: Option<String>,
    #[serde(default)]
    pub use_vpn: bool,
    /// Disabled speakers are treated as offline.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupEntry {
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub speakers: Vec<SpeakerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub id: ChannelId,
    pub name: String,
    #[serde(default)]
    pub media: Vec<MediaInfo>,
    #[serde(default)]
    pub tts: Vec<TtsInfo>,
}

/// Speakers, groups and channels known to the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Directory {
    #[serde(default)]
    pub speakers: Vec<SpeakerEntry>,
    #[serde(default)]
    pub groups: Vec<GroupEntry>,
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
}

impl Directory {
    /// Checks ids are unique and groups only reference known speakers.
    pub fn validate(&self) -> Result<(), String> {
        fn check_unique<T: Copy + Ord + std::fmt::Display>(
            kind: &str,
            ids: impl Iterator<Item = T>,
        ) -> Result<(), String> {
            let mut ids: Vec<T> = ids.collect();
            ids.sort_unstable();
            for pair in ids.windows(2) {
                if pair[0] == pair[1] {
                    return Err(format!("duplicate {} id {}", kind, pair[0]));
                }
            }
            Ok(())
        }

        check_unique("speaker", self.speakers.iter().map(|s| s.id))?;
        check_unique("group", self.groups.iter().map(|g| g.id))?;
        check_unique("channel", self.channels.iter().map(|c| c.id))?;

        for group in &self.groups {
            if let Some(unknown) = group
                .speakers
                .iter()
                .find(|id| !self.speakers.iter().any(|s| s.id == **id))
            {
                return Err(format!(
                    "group {} references unknown speaker {}",
                    group.id, unknown
                ));
            }
        }
        Ok(())
    }
}

/// Default [`BroadcastPreparation`] over a static [`Directory`].
pub struct DirectoryPreparation {
    directory: Directory,
    /// speaker id → channel currently broadcasting to it
    claims: DashMap<SpeakerId, ChannelId>,
}

impl DirectoryPreparation {
    pub fn new(directory: Directory) -> Self {
        Self {
            directory,
            claims: DashMap::new(),
        }
    }

    /// Online speakers of the selected groups, in group order, de-duplicated.
    fn resolve_speakers(&self, group_ids: &[GroupId]) -> Vec<SpeakerInfo> {
        let mut speakers: Vec<SpeakerInfo> = Vec::new();
        for group_id in group_ids {
            let Some(group) = self.directory.groups.iter().find(|g| g.id == *group_id) else {
                log::warn!("[Prepare] Ignoring unknown group {}", group_id);
                continue;
            };
            for speaker_id in &group.speakers {
                let Some(entry) = self
                    .directory
                    .speakers
                    .iter()
                    .find(|s| s.id == *speaker_id && s.enabled)
                else {
                    continue;
                };
                if speakers.iter().any(|s| s.id == entry.id) {
                    continue;
                }
                speakers.push(SpeakerInfo::new(
                    entry.id,
                    entry.name.clone(),
                    entry.address.clone(),
                    entry.vpn_address.clone(),
                    entry.use_vpn,
                ));
            }
        }
        speakers
    }

    /// Claims speakers for the channel, reporting those taken from another channel.
    fn claim(&self, channel_id: ChannelId, speakers: &[SpeakerInfo]) -> Vec<Takeover> {
        let mut takeovers = Vec::new();
        for speaker in speakers {
            if let Some(previous) = self.claims.insert(speaker.id, channel_id) {
                if previous != channel_id {
                    takeovers.push(Takeover {
                        speaker_id: speaker.id,
                        previous_channel_id: previous,
                    });
                }
            }
        }
        takeovers
    }
}

#[async_trait]
impl BroadcastPreparation for DirectoryPreparation {
    async fn prepare(
        &self,
        channel_id: ChannelId,
        group_ids: &[GroupId],
    ) -> Result<PreparedBroadcast, PreparationError> {
        let channel = self
            .directory
            .channels
            .iter()
            .find(|c| c.id == channel_id)
            .ok_or(PreparationError::UnknownChannel(channel_id))?;

        let speakers = self.resolve_speakers(group_ids);
        let takeovers = self.claim(channel_id, &speakers);
        for t in &takeovers {
            log::info!(
                "[Prepare] Channel {} takes over speaker {} from channel {}",
                channel_id,
                t.speaker_id,
                t.previous_channel_id
            );
        }

        log::debug!(
            "[Prepare] Channel {} ({}): {} speaker(s), {} media, {} tts",
            channel_id,
            channel.name,
            speakers.len(),
            channel.media.len(),
            channel.tts.len()
        );

        Ok(PreparedBroadcast {
            speakers,
            media: channel.media.clone(),
            tts: channel.tts.clone(),
            takeovers,
        })
    }

    async fn release(&self, channel_id: ChannelId) {
        self.claims.retain(|_, claimed_by| *claimed_by != channel_id);
    }
}
