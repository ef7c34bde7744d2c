//! JSON-file implementation of [`BroadcastStore`].
//!
//! Channel state (broadcasting flag, volume levels) and broadcast history are
//! kept in one `broadcasts.json` under the data directory. Every mutation
//! rewrites the file via temp file + rename. Without a data directory the
//! store is purely in-memory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::error::ErrorCode;
use crate::services::traits::BroadcastStore;
use crate::session::{AudioSource, BroadcastId, ChannelId, GroupId, VolumeLevels};
use crate::utils::now_millis;

const STORE_FILE: &str = "broadcasts.json";
const STORE_TEMP_FILE: &str = "broadcasts.json.tmp";

/// Oldest finished records are dropped beyond this many.
const MAX_BROADCAST_RECORDS: usize = 500;

/// Errors from reading or writing persisted broadcast state.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("store serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ErrorCode for StoreError {
    fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "store_io_failed",
            Self::Serialization(_) => "store_serialization_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Ongoing,
    Finished,
}

/// One broadcast in the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastRecord {
    pub broadcast_id: BroadcastId,
    pub channel_id: ChannelId,
    pub group_ids: Vec<GroupId>,
    pub started_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    pub status: RecordStatus,
}

impl BroadcastRecord {
    /// A record for a broadcast starting now.
    pub fn ongoing(broadcast_id: BroadcastId, channel_id: ChannelId, group_ids: Vec<GroupId>) -> Self {
        Self {
            broadcast_id,
            channel_id,
            group_ids,
            started_at: now_millis(),
            ended_at: None,
            status: RecordStatus::Ongoing,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelState {
    #[serde(default)]
    broadcasting: bool,
    #[serde(default)]
    volumes: VolumeLevels,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    channels: BTreeMap<ChannelId, ChannelState>,
    #[serde(default)]
    broadcasts: Vec<BroadcastRecord>,
}

impl StoreState {
    fn channel_mut(&mut self, channel_id: ChannelId) -> &mut ChannelState {
        self.channels.entry(channel_id).or_default()
    }

    fn prune(&mut self) {
        while self.broadcasts.len() > MAX_BROADCAST_RECORDS {
            match self
                .broadcasts
                .iter()
                .position(|r| r.status == RecordStatus::Finished)
            {
                Some(idx) => {
                    self.broadcasts.remove(idx);
                }
                None => break,
            }
        }
    }
}

/// Broadcast store backed by a single JSON file.
pub struct JsonBroadcastStore {
    dir: Option<PathBuf>,
    state: Mutex<StoreState>,
}

impl JsonBroadcastStore {
    /// Opens the store under `data_dir`.
    ///
    /// A missing or unreadable file starts from empty state.
    pub fn open(data_dir: &Path) -> Self {
        let path = data_dir.join(STORE_FILE);
        let state = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(state) => state,
                Err(e) => {
                    log::warn!(
                        "[Store] Ignoring invalid {}: {}",
                        path.display(),
                        e
                    );
                    StoreState::default()
                }
            },
            Err(_) => StoreState::default(),
        };

        Self {
            dir: Some(data_dir.to_path_buf()),
            state: Mutex::new(state),
        }
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Copy of every broadcast record, oldest first.
    pub async fn records(&self) -> Vec<BroadcastRecord> {
        self.state.lock().await.broadcasts.clone()
    }

    /// Writes the state atomically. Called with the state lock held.
    async fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        tokio::fs::create_dir_all(dir).await?;
        let contents = serde_json::to_string_pretty(state)?;
        let temp_path = dir.join(STORE_TEMP_FILE);
        tokio::fs::write(&temp_path, contents).await?;
        tokio::fs::rename(&temp_path, dir.join(STORE_FILE)).await?;
        Ok(())
    }
}

#[async_trait]
impl BroadcastStore for JsonBroadcastStore {
    async fn channel_volumes(&self, channel_id: ChannelId) -> Result<VolumeLevels, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .channels
            .get(&channel_id)
            .map(|c| c.volumes)
            .unwrap_or_default())
    }

    async fn set_channel_volume(
        &self,
        channel_id: ChannelId,
        source: AudioSource,
        level: u8,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.channel_mut(channel_id).volumes.set(source, level);
        self.persist(&state).await
    }

    async fn set_channel_broadcasting(
        &self,
        channel_id: ChannelId,
        broadcasting: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let channel = state.channel_mut(channel_id);
        if channel.broadcasting == broadcasting {
            return Ok(());
        }
        channel.broadcasting = broadcasting;
        self.persist(&state).await
    }

    async fn is_channel_broadcasting(&self, channel_id: ChannelId) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .channels
            .get(&channel_id)
            .is_some_and(|c| c.broadcasting))
    }

    async fn start_broadcast_record(&self, record: BroadcastRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.broadcasts.push(record);
        state.prune();
        self.persist(&state).await
    }

    async fn finish_ongoing_broadcasts(&self, channel_id: ChannelId) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let now = now_millis();
        let mut finished = 0;
        for record in state
            .broadcasts
            .iter_mut()
            .filter(|r| r.channel_id == channel_id && r.status == RecordStatus::Ongoing)
        {
            record.status = RecordStatus::Finished;
            record.ended_at = Some(now);
            finished += 1;
        }
        if finished > 0 {
            self.persist(&state).await?;
        }
        Ok(finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_constants::DEFAULT_VOLUME_LEVEL;

    #[tokio::test]
    async fn unknown_channel_has_default_volumes() {
        let store = JsonBroadcastStore::in_memory();
        let volumes = store.channel_volumes(4).await.unwrap();
        assert_eq!(volumes.microphone, DEFAULT_VOLUME_LEVEL);
        assert!(!store.is_channel_broadcasting(4).await.unwrap());
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = JsonBroadcastStore::open(dir.path());
            store
                .set_channel_volume(2, AudioSource::Media, 35)
                .await
                .unwrap();
            store.set_channel_broadcasting(2, true).await.unwrap();
            store
                .start_broadcast_record(BroadcastRecord::ongoing("b1".into(), 2, vec![1]))
                .await
                .unwrap();
        }

        let reopened = JsonBroadcastStore::open(dir.path());
        assert_eq!(reopened.channel_volumes(2).await.unwrap().media, 35);
        assert!(reopened.is_channel_broadcasting(2).await.unwrap());
        assert_eq!(reopened.records().await.len(), 1);
        assert!(!dir.path().join(STORE_TEMP_FILE).exists());
    }

    #[tokio::test]
    async fn finish_only_touches_ongoing_records_of_channel() {
        let store = JsonBroadcastStore::in_memory();
        for (id, channel) in [("a", 1), ("b", 1), ("c", 2)] {
            store
                .start_broadcast_record(BroadcastRecord::ongoing(id.into(), channel, vec![]))
                .await
                .unwrap();
        }

        assert_eq!(store.finish_ongoing_broadcasts(1).await.unwrap(), 2);
        assert_eq!(store.finish_ongoing_broadcasts(1).await.unwrap(), 0);

        let records = store.records().await;
        let c = records.iter().find(|r| r.broadcast_id.as_str() == "c").unwrap();
        assert_eq!(c.status, RecordStatus::Ongoing);
        assert!(records
            .iter()
            .filter(|r| r.channel_id == 1)
            .all(|r| r.ended_at.is_some()));
    }

    #[tokio::test]
    async fn invalid_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(STORE_FILE), "{ not json").unwrap();

        let store = JsonBroadcastStore::open(dir.path());
        assert!(store.records().await.is_empty());
    }
}
