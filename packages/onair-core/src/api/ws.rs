//! WebSocket control channel for broadcast clients.
//!
//! A client connects to `/ws/{channelId}` and drives one or more broadcasts
//! with JSON messages. Messages are handled strictly in order per connection;
//! [`ConnectionHandler`] holds the per-connection state and turns each inbound
//! message into at most one reply, independent of the socket.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use futures::sink::SinkExt;
use futures::stream::{SplitSink, StreamExt};
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::codec::{CodecResult, FrameCodec};
use crate::error::{OnAirError, OnAirResult};
use crate::events::{BroadcastEvent, EventEmitter, PlaybackEvent, SessionEvent};
use crate::protocol_constants::MAX_CONCEALED_FRAMES;
use crate::services::store::BroadcastRecord;
use crate::services::traits::{PlayItem, PlayOutcome, PlayRequest, Takeover};
use crate::services::CleanupOptions;
use crate::session::{
    AudioSource, BroadcastId, BroadcastSession, ChannelId, GroupId, MediaInfo, MicEncoding,
    SessionParams, SessionSnapshot, SpeakerId, SpeakerInfo, TtsInfo,
};
use crate::utils::now_millis;

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket Message Types
// ─────────────────────────────────────────────────────────────────────────────

/// Incoming WebSocket message envelope.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsIncoming {
    #[serde(rename_all = "camelCase")]
    Connect {
        broadcast_id: BroadcastId,
        selected_group_ids: Vec<GroupId>,
        #[serde(default)]
        encoding: MicEncoding,
    },
    #[serde(rename_all = "camelCase")]
    Disconnect { broadcast_id: BroadcastId },
    #[serde(rename_all = "camelCase")]
    Audio {
        broadcast_id: BroadcastId,
        /// Base64 payload: raw PCM or one Opus packet, per the session encoding.
        data: String,
        #[serde(default)]
        seq: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    MediaPlay {
        broadcast_id: BroadcastId,
        #[serde(default)]
        media_ids: Option<Vec<u32>>,
    },
    #[serde(rename_all = "camelCase")]
    MediaStop { broadcast_id: BroadcastId },
    #[serde(rename_all = "camelCase")]
    TtsPlay {
        broadcast_id: BroadcastId,
        #[serde(default)]
        tts_ids: Option<Vec<u32>>,
    },
    #[serde(rename_all = "camelCase")]
    TtsStop { broadcast_id: BroadcastId },
    #[serde(rename_all = "camelCase")]
    SetVolume {
        broadcast_id: BroadcastId,
        source: AudioSource,
        level: u8,
    },
    #[serde(rename_all = "camelCase")]
    SetSpeakerActive {
        broadcast_id: BroadcastId,
        speaker_id: SpeakerId,
        active: bool,
    },
    Ping,
}

/// Outgoing WebSocket message envelope.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsOutgoing {
    #[serde(rename_all = "camelCase")]
    Connected {
        broadcast_id: BroadcastId,
        channel_id: ChannelId,
        active_speakers: usize,
        speakers: Vec<SpeakerInfo>,
        media: Vec<MediaInfo>,
        tts: Vec<TtsInfo>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        takeovers: Vec<Takeover>,
    },
    Error {
        code: &'static str,
        message: String,
    },
    Status {
        #[serde(flatten)]
        session: SessionSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    MediaPlayStarted {
        broadcast_id: BroadcastId,
        #[serde(flatten)]
        outcome: PlayOutcome,
    },
    #[serde(rename_all = "camelCase")]
    MediaStopped {
        broadcast_id: BroadcastId,
        stopped: bool,
    },
    #[serde(rename_all = "camelCase")]
    TtsPlayStarted {
        broadcast_id: BroadcastId,
        #[serde(flatten)]
        outcome: PlayOutcome,
    },
    #[serde(rename_all = "camelCase")]
    TtsStopped {
        broadcast_id: BroadcastId,
        stopped: bool,
    },
    #[serde(rename_all = "camelCase")]
    VolumeSet {
        broadcast_id: BroadcastId,
        source: AudioSource,
        level: u8,
    },
    #[serde(rename_all = "camelCase")]
    SpeakerUpdated {
        broadcast_id: BroadcastId,
        speaker_id: SpeakerId,
        active: bool,
    },
    Pong {
        timestamp: u64,
    },
    Event {
        event: BroadcastEvent,
    },
}

impl WsOutgoing {
    /// Serializes to a WebSocket text message.
    fn to_message(&self) -> Option<Message> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Message::Text(json.into())),
            Err(e) => {
                log::error!("[WS] Failed to serialize outgoing message: {}", e);
                None
            }
        }
    }

    fn error(err: &OnAirError) -> Self {
        Self::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }

    fn play_started(source: AudioSource, broadcast_id: BroadcastId, outcome: PlayOutcome) -> Self {
        match source {
            AudioSource::Tts => Self::TtsPlayStarted {
                broadcast_id,
                outcome,
            },
            _ => Self::MediaPlayStarted {
                broadcast_id,
                outcome,
            },
        }
    }

    fn stopped(source: AudioSource, broadcast_id: BroadcastId, stopped: bool) -> Self {
        match source {
            AudioSource::Tts => Self::TtsStopped {
                broadcast_id,
                stopped,
            },
            _ => Self::MediaStopped {
                broadcast_id,
                stopped,
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Opus Microphone Decoding
// ─────────────────────────────────────────────────────────────────────────────

/// Per-broadcast Opus decoder with sequence tracking for loss concealment.
struct MicDecoder {
    codec: FrameCodec,
    next_seq: Option<u64>,
}

impl MicDecoder {
    fn new() -> CodecResult<Self> {
        Ok(Self {
            codec: FrameCodec::new()?,
            next_seq: None,
        })
    }

    /// Decodes one packet into PCM frames, concealing frames lost before it.
    ///
    /// Late packets are dropped. Gaps wider than [`MAX_CONCEALED_FRAMES`]
    /// are treated as a restart and not concealed.
    fn decode(&mut self, packet: &[u8], seq: Option<u64>) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();

        if let (Some(expected), Some(seq)) = (self.next_seq, seq) {
            if seq < expected {
                log::debug!("[WS] Dropping late opus packet {} (expected {})", seq, expected);
                return frames;
            }
            let missing = seq - expected;
            if missing > u64::from(MAX_CONCEALED_FRAMES) {
                log::debug!("[WS] Opus sequence jumped by {}, not concealing", missing);
            } else if missing > 0 {
                for _ in 1..missing {
                    self.conceal(&mut frames);
                }
                // The first packet after a loss carries FEC data for the frame before it.
                match self.codec.decode_with_fec(packet, None) {
                    Ok(pcm) => frames.push(pcm),
                    Err(_) => self.conceal(&mut frames),
                }
            }
        }
        if let Some(seq) = seq {
            self.next_seq = Some(seq + 1);
        }

        match self.codec.decode(packet, None) {
            Ok(pcm) => frames.push(pcm),
            Err(e) => {
                log::debug!("[WS] Corrupt opus packet, concealing: {}", e);
                self.conceal(&mut frames);
            }
        }
        frames
    }

    fn conceal(&mut self, frames: &mut Vec<Vec<u8>>) {
        match self.codec.decode_lost_frame(None) {
            Ok(pcm) => frames.push(pcm),
            Err(e) => log::warn!("[WS] Packet loss concealment failed: {}", e),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection Handler
// ─────────────────────────────────────────────────────────────────────────────

/// Protocol state of one control connection.
struct ConnectionHandler {
    state: AppState,
    connection_id: String,
    channel_id: ChannelId,
    status_interval: u64,
    decoders: HashMap<BroadcastId, MicDecoder>,
    /// Broadcasts started here whose events are forwarded to this client.
    owned: HashSet<BroadcastId>,
}

impl ConnectionHandler {
    fn new(state: AppState, connection_id: String, channel_id: ChannelId) -> Self {
        let status_interval = state.config.read().status_interval_packets.max(1);
        Self {
            state,
            connection_id,
            channel_id,
            status_interval,
            decoders: HashMap::new(),
            owned: HashSet::new(),
        }
    }

    /// Handles one text frame and returns the reply to send, if any.
    async fn handle_text(&mut self, text: &str) -> Option<WsOutgoing> {
        let incoming = match serde_json::from_str::<WsIncoming>(text) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("[WS] {} sent a malformed message: {}", self.connection_id, e);
                let err = OnAirError::InvalidRequest(format!("Malformed message: {}", e));
                return Some(WsOutgoing::error(&err));
            }
        };

        match self.dispatch(incoming).await {
            Ok(reply) => reply,
            Err(e) => {
                log::warn!("[WS] Request on {} failed: {}", self.connection_id, e);
                Some(WsOutgoing::error(&e))
            }
        }
    }

    async fn dispatch(&mut self, msg: WsIncoming) -> OnAirResult<Option<WsOutgoing>> {
        match msg {
            WsIncoming::Connect {
                broadcast_id,
                selected_group_ids,
                encoding,
            } => self
                .handle_connect(broadcast_id, selected_group_ids, encoding)
                .await
                .map(Some),
            WsIncoming::Disconnect { broadcast_id } => {
                self.handle_disconnect(&broadcast_id).await;
                Ok(None)
            }
            WsIncoming::Audio {
                broadcast_id,
                data,
                seq,
            } => Ok(self.handle_audio(&broadcast_id, &data, seq).await),
            WsIncoming::MediaPlay {
                broadcast_id,
                media_ids,
            } => self
                .handle_play(AudioSource::Media, broadcast_id, media_ids)
                .await
                .map(Some),
            WsIncoming::TtsPlay {
                broadcast_id,
                tts_ids,
            } => self
                .handle_play(AudioSource::Tts, broadcast_id, tts_ids)
                .await
                .map(Some),
            WsIncoming::MediaStop { broadcast_id } => self
                .handle_stop(AudioSource::Media, broadcast_id)
                .await
                .map(Some),
            WsIncoming::TtsStop { broadcast_id } => self
                .handle_stop(AudioSource::Tts, broadcast_id)
                .await
                .map(Some),
            WsIncoming::SetVolume {
                broadcast_id,
                source,
                level,
            } => self
                .handle_set_volume(broadcast_id, source, level)
                .await
                .map(Some),
            WsIncoming::SetSpeakerActive {
                broadcast_id,
                speaker_id,
                active,
            } => self
                .handle_set_speaker_active(broadcast_id, speaker_id, active)
                .await
                .map(Some),
            WsIncoming::Ping => Ok(Some(WsOutgoing::Pong {
                timestamp: now_millis(),
            })),
        }
    }

    fn session(&self, broadcast_id: &BroadcastId) -> OnAirResult<Arc<BroadcastSession>> {
        self.state
            .registry
            .get(broadcast_id)
            .ok_or_else(|| OnAirError::SessionNotFound(broadcast_id.to_string()))
    }

    // ── connect / disconnect ────────────────────────────────────────────────

    async fn handle_connect(
        &mut self,
        broadcast_id: BroadcastId,
        group_ids: Vec<GroupId>,
        encoding: MicEncoding,
    ) -> OnAirResult<WsOutgoing> {
        let prepared = self
            .state
            .preparation
            .prepare(self.channel_id, &group_ids)
            .await?;

        let active: Vec<SpeakerInfo> = prepared
            .speakers
            .iter()
            .filter(|s| s.active)
            .cloned()
            .collect();
        if active.is_empty() {
            log::warn!(
                "[WS] Connect for {} on channel {} rejected: no active speakers",
                broadcast_id,
                self.channel_id
            );
            return Err(OnAirError::NoActiveSpeakers(self.channel_id));
        }

        self.apply_takeovers(&prepared.takeovers).await;

        let session = Arc::new(BroadcastSession::new(SessionParams {
            broadcast_id: broadcast_id.clone(),
            channel_id: self.channel_id,
            connection_id: self.connection_id.clone(),
            selected_group_ids: group_ids,
            encoding,
            speakers: prepared.speakers.clone(),
            media: prepared.media.clone(),
            tts: prepared.tts.clone(),
        }));

        if let Some(previous) = self
            .state
            .registry
            .upsert(broadcast_id.clone(), Arc::clone(&session))
        {
            log::warn!(
                "[WS] Broadcast {} replaced (previous owner {})",
                broadcast_id,
                previous.connection_id()
            );
        }
        self.decoders.remove(&broadcast_id);
        self.owned.insert(broadcast_id.clone());

        if let Err(e) = self
            .state
            .mixer
            .initialize(&broadcast_id, self.channel_id, active.clone())
            .await
        {
            log::error!("[WS] Mixer init failed for {}: {}", broadcast_id, e);
            let rollback = CleanupOptions {
                force: true,
                update_database: false,
                reason: "mixer_init_failed".to_string(),
            };
            let outcome = self.state.coordinator.cleanup_session(&session, rollback).await;
            log::debug!("[WS] Rollback of {}: {:?}", broadcast_id, outcome);
            return Err(e.into());
        }

        self.apply_persisted_volumes(&broadcast_id).await;
        self.persist_broadcast_start(&session).await;

        self.state.event_bridge.emit_session(SessionEvent::Started {
            broadcast_id: broadcast_id.clone(),
            channel_id: self.channel_id,
            speaker_count: active.len(),
            timestamp: now_millis(),
        });

        log::info!(
            "[WS] Broadcast {} started on channel {} by {} ({} speaker(s), {:?})",
            broadcast_id,
            self.channel_id,
            self.connection_id,
            active.len(),
            encoding
        );

        Ok(WsOutgoing::Connected {
            broadcast_id,
            channel_id: self.channel_id,
            active_speakers: active.len(),
            speakers: prepared.speakers,
            media: prepared.media,
            tts: prepared.tts,
            takeovers: prepared.takeovers,
        })
    }

    /// Deactivates taken-over speakers in the sessions of their previous channel.
    async fn apply_takeovers(&mut self, takeovers: &[Takeover]) {
        for takeover in takeovers {
            let sessions = self
                .state
                .registry
                .sessions_where(|s| s.channel_id() == takeover.previous_channel_id);
            for session in sessions {
                let id = session.broadcast_id();
                if session.set_speaker_active(takeover.speaker_id, false) != Some(true) {
                    continue;
                }
                log::info!(
                    "[WS] Speaker {} moved from broadcast {} to channel {}",
                    takeover.speaker_id,
                    id,
                    self.channel_id
                );
                if let Err(e) = self
                    .state
                    .mixer
                    .update_speakers(id, session.active_speakers())
                    .await
                {
                    log::warn!("[WS] Failed to update speakers of {}: {}", id, e);
                }
                self.state
                    .event_bridge
                    .emit_session(SessionEvent::SpeakerUpdated {
                        broadcast_id: id.clone(),
                        speaker_id: takeover.speaker_id,
                        active: false,
                        timestamp: now_millis(),
                    });
            }
        }
    }

    async fn apply_persisted_volumes(&mut self, broadcast_id: &BroadcastId) {
        let levels = match self.state.store.channel_volumes(self.channel_id).await {
            Ok(levels) => levels,
            Err(e) => {
                log::warn!(
                    "[WS] Could not read volumes for channel {}: {}",
                    self.channel_id,
                    e
                );
                return;
            }
        };
        for source in AudioSource::ALL {
            if let Err(e) = self
                .state
                .mixer
                .set_volume(broadcast_id, source, levels.get(source))
                .await
            {
                log::warn!("[WS] Failed to apply {} volume: {}", source, e);
            }
        }
    }

    async fn persist_broadcast_start(&mut self, session: &BroadcastSession) {
        let store = &self.state.store;
        if let Err(e) = store.set_channel_broadcasting(self.channel_id, true).await {
            log::warn!(
                "[WS] Failed to mark channel {} broadcasting: {}",
                self.channel_id,
                e
            );
        }
        let record = BroadcastRecord::ongoing(
            session.broadcast_id().clone(),
            self.channel_id,
            session.selected_group_ids().to_vec(),
        );
        if let Err(e) = store.start_broadcast_record(record).await {
            log::warn!(
                "[WS] Failed to record broadcast {}: {}",
                session.broadcast_id(),
                e
            );
        }
    }

    async fn handle_disconnect(&mut self, broadcast_id: &BroadcastId) {
        let outcome = self
            .state
            .coordinator
            .cleanup(broadcast_id, CleanupOptions::forced("client_disconnect"))
            .await;
        self.decoders.remove(broadcast_id);
        log::info!(
            "[WS] Disconnect of {} from {}: {:?}",
            broadcast_id,
            self.connection_id,
            outcome
        );
    }

    // ── audio ───────────────────────────────────────────────────────────────

    async fn handle_audio(
        &mut self,
        broadcast_id: &BroadcastId,
        data: &str,
        seq: Option<u64>,
    ) -> Option<WsOutgoing> {
        let Some(session) = self.state.registry.get(broadcast_id) else {
            log::trace!("[WS] Dropping audio for unknown broadcast {}", broadcast_id);
            return None;
        };

        let count = session.record_packet();
        if let Err(e) = self.ingest_audio(&session, data, seq).await {
            log::warn!(
                "[WS] Dropped audio packet {} of {}: {}",
                count,
                broadcast_id,
                e
            );
        }

        (count % self.status_interval == 0).then(|| WsOutgoing::Status {
            session: session.snapshot(),
        })
    }

    async fn ingest_audio(
        &mut self,
        session: &BroadcastSession,
        data: &str,
        seq: Option<u64>,
    ) -> OnAirResult<()> {
        let payload = BASE64
            .decode(data.as_bytes())
            .map_err(|e| OnAirError::InvalidRequest(format!("Invalid base64 audio: {}", e)))?;
        session.add_bytes(payload.len());

        let broadcast_id = session.broadcast_id();
        let frames = match session.encoding() {
            MicEncoding::Pcm => vec![payload],
            MicEncoding::Opus => self.decoder_for(broadcast_id)?.decode(&payload, seq),
        };

        for pcm in frames {
            self.state
                .mixer
                .add_microphone_data(broadcast_id, Bytes::from(pcm))
                .await?;
        }
        Ok(())
    }

    fn decoder_for(&mut self, broadcast_id: &BroadcastId) -> OnAirResult<&mut MicDecoder> {
        match self.decoders.entry(broadcast_id.clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(MicDecoder::new()?)),
        }
    }

    // ── media / tts ─────────────────────────────────────────────────────────

    async fn handle_play(
        &mut self,
        source: AudioSource,
        broadcast_id: BroadcastId,
        selected: Option<Vec<u32>>,
    ) -> OnAirResult<WsOutgoing> {
        let session = self.session(&broadcast_id)?;
        let player = self
            .state
            .player(source)
            .ok_or_else(|| OnAirError::InvalidRequest(format!("{} cannot be played", source)))?;

        let _lifecycle = session.lock_lifecycle().await;
        if session.gate().is_torn_down() {
            return Err(OnAirError::SessionNotFound(broadcast_id.to_string()));
        }

        let request = PlayRequest {
            broadcast_id: broadcast_id.clone(),
            channel_id: session.channel_id(),
            speakers: session.active_speakers(),
            items: select_items(source, &session, selected.as_deref()),
        };

        // Marked before the call so a completion racing the reply is not lost.
        session.gate().set_active(source, true);
        let outcome = match player.handle_play_request(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                session.gate().set_active(source, false);
                return Err(e.into());
            }
        };

        log::info!(
            "[WS] {} playback {} started for {} ({} file(s))",
            source,
            outcome.session_id,
            broadcast_id,
            outcome.files.len()
        );
        self.state.event_bridge.emit_playback(PlaybackEvent::Started {
            broadcast_id: broadcast_id.clone(),
            source,
            session_id: outcome.session_id.clone(),
            files: outcome.files.clone(),
            timestamp: now_millis(),
        });

        Ok(WsOutgoing::play_started(source, broadcast_id, outcome))
    }

    async fn handle_stop(
        &mut self,
        source: AudioSource,
        broadcast_id: BroadcastId,
    ) -> OnAirResult<WsOutgoing> {
        let player = self
            .state
            .player(source)
            .ok_or_else(|| OnAirError::InvalidRequest(format!("{} cannot be stopped", source)))?;

        let stopped = player.stop_by_broadcast_id(&broadcast_id).await;
        if let Some(session) = self.state.registry.get(&broadcast_id) {
            session.gate().set_active(source, false);
        }
        if stopped {
            self.state.event_bridge.emit_playback(PlaybackEvent::Stopped {
                broadcast_id: broadcast_id.clone(),
                source,
                timestamp: now_millis(),
            });
        }

        Ok(WsOutgoing::stopped(source, broadcast_id, stopped))
    }

    // ── volume / speakers ───────────────────────────────────────────────────

    async fn handle_set_volume(
        &mut self,
        broadcast_id: BroadcastId,
        source: AudioSource,
        level: u8,
    ) -> OnAirResult<WsOutgoing> {
        let session = self.session(&broadcast_id)?;
        let level = level.min(100);

        self.state
            .mixer
            .set_volume(&broadcast_id, source, level)
            .await?;
        if let Err(e) = self
            .state
            .store
            .set_channel_volume(session.channel_id(), source, level)
            .await
        {
            log::warn!("[WS] Failed to persist {} volume: {}", source, e);
        }

        Ok(WsOutgoing::VolumeSet {
            broadcast_id,
            source,
            level,
        })
    }

    async fn handle_set_speaker_active(
        &mut self,
        broadcast_id: BroadcastId,
        speaker_id: SpeakerId,
        active: bool,
    ) -> OnAirResult<WsOutgoing> {
        let session = self.session(&broadcast_id)?;
        let previous = session
            .set_speaker_active(speaker_id, active)
            .ok_or_else(|| {
                OnAirError::InvalidRequest(format!(
                    "Speaker {} is not part of broadcast {}",
                    speaker_id, broadcast_id
                ))
            })?;

        if previous != active {
            self.state
                .mixer
                .update_speakers(&broadcast_id, session.active_speakers())
                .await?;
            self.state
                .event_bridge
                .emit_session(SessionEvent::SpeakerUpdated {
                    broadcast_id: broadcast_id.clone(),
                    speaker_id,
                    active,
                    timestamp: now_millis(),
                });
        }

        Ok(WsOutgoing::SpeakerUpdated {
            broadcast_id,
            speaker_id,
            active,
        })
    }

    // ── events / close ──────────────────────────────────────────────────────

    /// Whether a lifecycle event belongs to a broadcast this connection owns.
    fn forwards(&mut self, event: &BroadcastEvent) -> bool {
        let broadcast_id = event.broadcast_id();
        if !self.owned.contains(broadcast_id) {
            return false;
        }
        if let BroadcastEvent::Session(SessionEvent::Ended { .. }) = event {
            self.owned.remove(broadcast_id);
            self.decoders.remove(broadcast_id);
            return true;
        }
        match self.state.registry.get(broadcast_id) {
            Some(session) if session.connection_id() != self.connection_id => {
                // Taken over by a reconnect on another connection.
                self.owned.remove(broadcast_id);
                false
            }
            _ => true,
        }
    }

    /// Tears down every broadcast this connection still owns.
    async fn close(&mut self) {
        let results = self
            .state
            .coordinator
            .cleanup_connection(&self.connection_id)
            .await;
        for (broadcast_id, outcome) in &results {
            log::info!(
                "[WS] Cleaned up {} on close of {}: {:?}",
                broadcast_id,
                self.connection_id,
                outcome
            );
        }
        self.decoders.clear();
        self.owned.clear();
    }
}

/// The session's media or TTS items, optionally narrowed to the given ids.
fn select_items(
    source: AudioSource,
    session: &BroadcastSession,
    selected: Option<&[u32]>,
) -> Vec<PlayItem> {
    let wanted = |id: u32| selected.map_or(true, |ids| ids.contains(&id));
    match source {
        AudioSource::Media => session
            .selected_media()
            .iter()
            .filter(|m| wanted(m.id))
            .map(PlayItem::from)
            .collect(),
        AudioSource::Tts => session
            .selected_tts()
            .iter()
            .filter(|t| wanted(t.id))
            .map(PlayItem::from)
            .collect(),
        AudioSource::Microphone => Vec::new(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Socket Loop
// ─────────────────────────────────────────────────────────────────────────────

/// Sends a reply, returning `false` once the client is gone.
async fn send(sender: &mut SplitSink<WebSocket, Message>, msg: &WsOutgoing) -> bool {
    match msg.to_message() {
        Some(message) => sender.send(message).await.is_ok(),
        None => true,
    }
}

/// WebSocket upgrade handler for `/ws/{channel_id}`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(channel_id): Path<ChannelId>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state, channel_id))
}

/// Main WebSocket connection loop.
async fn handle_ws(socket: WebSocket, state: AppState, channel_id: ChannelId) {
    let (mut sender, mut receiver) = socket.split();

    let conn_guard = state.ws_manager.register(channel_id);
    let cancel_token = conn_guard.cancel_token().clone();
    let mut events_rx = state.event_bridge.subscribe();

    let (timeout, check_interval) = {
        let config = state.config.read();
        (
            Duration::from_secs(config.ws_heartbeat_timeout_secs),
            Duration::from_secs(config.ws_heartbeat_check_interval_secs.max(1)),
        )
    };
    let mut handler = ConnectionHandler::new(state, conn_guard.id().to_string(), channel_id);
    let mut last_activity = Instant::now();

    // Delay mode skips missed ticks rather than bursting to catch up.
    let mut heartbeat_interval = tokio::time::interval(check_interval);
    heartbeat_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                log::info!("[WS] Connection force-closed: {}", conn_guard.id());
                break;
            }
            msg = receiver.next() => {
                last_activity = Instant::now();
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handler.handle_text(text.as_str()).await {
                            if !send(&mut sender, &reply).await {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let err = OnAirError::InvalidRequest("Binary frames are not supported".into());
                        if !send(&mut sender, &WsOutgoing::error(&err)).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
            Ok(event) = events_rx.recv() => {
                if handler.forwards(&event) && !send(&mut sender, &WsOutgoing::Event { event }).await {
                    break;
                }
            }
            _ = heartbeat_interval.tick() => {
                if last_activity.elapsed() > timeout {
                    log::warn!("[WS] Heartbeat timeout: {}", conn_guard.id());
                    break;
                }
            }
        }
    }

    handler.close().await;
    // ConnectionGuard drop unregisters the connection.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastEventBridge;
    use crate::services::test_support::{speaker, Mocks};
    use crate::services::preparation::{Directory, DirectoryPreparation};
    use crate::services::traits::{
        AudioMixer, BroadcastPreparation, BroadcastStore, PreparedBroadcast,
    };
    use crate::services::CleanupCoordinator;
    use crate::session::test_support::session_with;
    use crate::session::SessionRegistry;
    use std::sync::atomic::Ordering;

    fn prepared() -> PreparedBroadcast {
        PreparedBroadcast {
            speakers: vec![speaker(1), speaker(2)],
            media: vec![MediaInfo {
                id: 100,
                filename: "jingle.wav".into(),
                title: "Jingle".into(),
                duration_ms: None,
            }],
            tts: vec![TtsInfo {
                id: 200,
                filename: "welcome.wav".into(),
                text: "Welcome".into(),
            }],
            takeovers: vec![],
        }
    }

    fn app_state(mocks: &Mocks) -> AppState {
        app_state_with(mocks, mocks.preparation.clone())
    }

    fn app_state_with(mocks: &Mocks, preparation: Arc<dyn BroadcastPreparation>) -> AppState {
        let registry = Arc::new(SessionRegistry::new());
        let bridge = Arc::new(BroadcastEventBridge::new(64));
        let coordinator = Arc::new(CleanupCoordinator::new(
            Arc::clone(&registry),
            mocks.mixer.clone(),
            mocks.media.clone(),
            mocks.tts.clone(),
            mocks.store.clone(),
            preparation.clone(),
            bridge.clone(),
        ));
        AppState::builder()
            .registry(registry)
            .coordinator(coordinator)
            .preparation(preparation)
            .mixer(mocks.mixer.clone())
            .players(mocks.media.clone(), mocks.tts.clone())
            .store(mocks.store.clone())
            .event_bridge(bridge)
            .build()
    }

    fn handler(state: &AppState, conn: &str) -> ConnectionHandler {
        ConnectionHandler::new(state.clone(), conn.to_string(), 1)
    }

    async fn connect(handler: &mut ConnectionHandler, id: &str) -> WsOutgoing {
        let msg = format!(
            r#"{{"type":"connect","broadcastId":"{}","selectedGroupIds":[10]}}"#,
            id
        );
        handler.handle_text(&msg).await.unwrap()
    }

    fn audio(id: &str, payload: &[u8]) -> String {
        format!(
            r#"{{"type":"audio","broadcastId":"{}","data":"{}"}}"#,
            id,
            BASE64.encode(payload)
        )
    }

    fn error_code(reply: Option<WsOutgoing>) -> &'static str {
        match reply {
            Some(WsOutgoing::Error { code, .. }) => code,
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn connect_registers_session_and_initializes_mixer() {
        let mocks = Mocks::new(prepared());
        let state = app_state(&mocks);
        let mut h = handler(&state, "ws-1");

        match connect(&mut h, "b1").await {
            WsOutgoing::Connected {
                broadcast_id,
                channel_id,
                active_speakers,
                media,
                ..
            } => {
                assert_eq!(broadcast_id.as_str(), "b1");
                assert_eq!(channel_id, 1);
                assert_eq!(active_speakers, 2);
                assert_eq!(media.len(), 1);
            }
            other => panic!("unexpected reply {:?}", other),
        }

        let id = BroadcastId::from("b1");
        assert_eq!(state.registry.get(&id).unwrap().connection_id(), "ws-1");
        assert!(mocks.mixer.is_active(&id));
        assert!(mocks.store.is_channel_broadcasting(1).await.unwrap());
        // Persisted default levels pushed for every source.
        assert_eq!(mocks.mixer.volumes.lock().len(), 3);
    }

    #[tokio::test]
    async fn numeric_broadcast_id_routes_vpn_speaker_to_vpn_address() {
        let directory: Directory = serde_yaml::from_str(
            r#"
speakers:
  - { id: 5, name: Remote, address: 192.168.1.50, vpn_address: 10.8.0.50, use_vpn: true }
groups:
  - { id: 10, name: Field, speakers: [5] }
channels:
  - { id: 1, name: Main }
"#,
        )
        .unwrap();
        let mocks = Mocks::new(PreparedBroadcast::default());
        let state = app_state_with(&mocks, Arc::new(DirectoryPreparation::new(directory)));
        let mut h = handler(&state, "ws-1");

        let reply = h
            .handle_text(r#"{"type":"connect","broadcastId":1,"selectedGroupIds":[10]}"#)
            .await
            .unwrap();
        match reply {
            WsOutgoing::Connected {
                broadcast_id,
                active_speakers,
                ..
            } => {
                assert_eq!(broadcast_id.as_str(), "1");
                assert_eq!(active_speakers, 1);
            }
            other => panic!("unexpected reply {:?}", other),
        }

        let id = BroadcastId::from("1");
        let session = state.registry.get(&id).unwrap();
        let online = session.online_speakers();
        assert_eq!(online[0].address, "10.8.0.50");
        assert_ne!(online[0].address, online[0].primary_address);

        let initialized = mocks.mixer.initialized.get(&id).unwrap();
        assert_eq!(initialized.len(), 1);
        assert_eq!(initialized[0].address, "10.8.0.50");
    }

    #[tokio::test]
    async fn audio_packets_update_counters_with_decoded_length() {
        let mocks = Mocks::new(prepared());
        let state = app_state(&mocks);
        let mut h = handler(&state, "ws-1");
        connect(&mut h, "b1").await;

        assert!(h.handle_text(&audio("b1", &[1, 2, 3, 4])).await.is_none());
        assert!(h.handle_text(&audio("b1", &[5, 6])).await.is_none());
        assert!(h.handle_text(&audio("b1", &[0; 10])).await.is_none());

        let session = state.registry.get(&"b1".into()).unwrap();
        assert_eq!(session.packet_count(), 3);
        assert_eq!(session.total_bytes(), 16);
        assert_eq!(mocks.mixer.mic_frames.lock().len(), 3);
    }

    #[tokio::test]
    async fn status_sent_every_tenth_packet() {
        let mocks = Mocks::new(prepared());
        let state = app_state(&mocks);
        let mut h = handler(&state, "ws-1");
        connect(&mut h, "b1").await;

        for _ in 0..9 {
            assert!(h.handle_text(&audio("b1", &[0, 0])).await.is_none());
        }
        match h.handle_text(&audio("b1", &[0, 0])).await {
            Some(WsOutgoing::Status { session }) => {
                assert_eq!(session.packet_count, 10);
                assert_eq!(session.total_bytes, 20);
            }
            other => panic!("expected status, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn invalid_base64_still_counts_packet_but_not_bytes() {
        let mocks = Mocks::new(prepared());
        let state = app_state(&mocks);
        let mut h = handler(&state, "ws-1");
        connect(&mut h, "b1").await;

        let msg = r#"{"type":"audio","broadcastId":"b1","data":"***"}"#;
        assert!(h.handle_text(msg).await.is_none());

        let session = state.registry.get(&"b1".into()).unwrap();
        assert_eq!(session.packet_count(), 1);
        assert_eq!(session.total_bytes(), 0);
        assert!(mocks.mixer.mic_frames.lock().is_empty());
    }

    #[tokio::test]
    async fn zero_active_speakers_creates_no_session() {
        let mocks = Mocks::new(PreparedBroadcast {
            speakers: vec![speaker(1).with_active(false)],
            ..PreparedBroadcast::default()
        });
        let state = app_state(&mocks);
        let mut h = handler(&state, "ws-1");

        let msg = r#"{"type":"connect","broadcastId":"b1","selectedGroupIds":[10]}"#;
        assert_eq!(error_code(h.handle_text(msg).await), "no_active_speakers");
        assert!(state.registry.is_empty());
        assert!(mocks.mixer.initialized.is_empty());
    }

    #[tokio::test]
    async fn audio_for_unknown_broadcast_is_dropped() {
        let mocks = Mocks::new(prepared());
        let state = app_state(&mocks);
        let mut h = handler(&state, "ws-1");

        assert!(h.handle_text(&audio("ghost", &[1, 2])).await.is_none());
        assert!(state.registry.is_empty());
        assert!(mocks.mixer.mic_frames.lock().is_empty());
    }

    #[tokio::test]
    async fn malformed_and_unknown_messages_reply_error() {
        let mocks = Mocks::new(prepared());
        let state = app_state(&mocks);
        let mut h = handler(&state, "ws-1");

        assert_eq!(error_code(h.handle_text("not json").await), "invalid_request");
        assert_eq!(
            error_code(h.handle_text(r#"{"type":"bogus"}"#).await),
            "invalid_request"
        );
        assert!(matches!(
            h.handle_text(r#"{"type":"ping"}"#).await,
            Some(WsOutgoing::Pong { .. })
        ));
    }

    #[tokio::test]
    async fn media_play_and_stop_drive_the_gate() {
        let mocks = Mocks::new(prepared());
        let state = app_state(&mocks);
        let mut h = handler(&state, "ws-1");
        connect(&mut h, "b1").await;

        let reply = h
            .handle_text(r#"{"type":"media_play","broadcastId":"b1"}"#)
            .await;
        match reply {
            Some(WsOutgoing::MediaPlayStarted { outcome, .. }) => {
                assert!(outcome.success);
                assert_eq!(outcome.files, vec!["jingle.wav".to_string()]);
            }
            other => panic!("unexpected reply {:?}", other),
        }
        let session = state.registry.get(&"b1".into()).unwrap();
        assert!(session.gate().is_active(AudioSource::Media));
        assert_eq!(mocks.media.requests.lock()[0].speakers.len(), 2);

        let reply = h
            .handle_text(r#"{"type":"media_stop","broadcastId":"b1"}"#)
            .await;
        assert!(matches!(
            reply,
            Some(WsOutgoing::MediaStopped { stopped: true, .. })
        ));
        assert!(!session.gate().is_active(AudioSource::Media));
    }

    #[tokio::test]
    async fn tts_play_with_unknown_ids_fails_and_clears_gate() {
        let mocks = Mocks::new(prepared());
        let state = app_state(&mocks);
        let mut h = handler(&state, "ws-1");
        connect(&mut h, "b1").await;

        let reply = h
            .handle_text(r#"{"type":"tts_play","broadcastId":"b1","ttsIds":[999]}"#)
            .await;
        assert_eq!(error_code(reply), "playback_error");
        let session = state.registry.get(&"b1".into()).unwrap();
        assert!(!session.gate().is_active(AudioSource::Tts));

        let reply = h
            .handle_text(r#"{"type":"tts_play","broadcastId":"b1","ttsIds":[200]}"#)
            .await;
        assert!(matches!(reply, Some(WsOutgoing::TtsPlayStarted { .. })));
    }

    #[tokio::test]
    async fn play_on_missing_session_is_an_error() {
        let mocks = Mocks::new(prepared());
        let state = app_state(&mocks);
        let mut h = handler(&state, "ws-1");

        let reply = h
            .handle_text(r#"{"type":"media_play","broadcastId":"nope"}"#)
            .await;
        assert_eq!(error_code(reply), "session_not_found");
        assert!(mocks.media.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn disconnect_tears_down_and_emits_ended() {
        let mocks = Mocks::new(prepared());
        let state = app_state(&mocks);
        let mut events = state.event_bridge.subscribe();
        let mut h = handler(&state, "ws-1");
        connect(&mut h, "b1").await;
        h.handle_text(&audio("b1", &[1, 2])).await;

        let reply = h
            .handle_text(r#"{"type":"disconnect","broadcastId":"b1"}"#)
            .await;
        assert!(reply.is_none());
        assert!(state.registry.is_empty());
        assert_eq!(mocks.mixer.stops.load(Ordering::SeqCst), 1);
        assert!(!mocks.store.is_channel_broadcasting(1).await.unwrap());

        let mut ended = None;
        while let Ok(event) = events.try_recv() {
            if let BroadcastEvent::Session(SessionEvent::Ended { packet_count, .. }) = event {
                ended = Some(packet_count);
            }
        }
        assert_eq!(ended, Some(1));
    }

    #[tokio::test]
    async fn mixer_failure_rolls_back_registration() {
        let mocks = Mocks::new(prepared());
        mocks.mixer.fail_init.store(true, Ordering::SeqCst);
        let state = app_state(&mocks);
        let mut h = handler(&state, "ws-1");

        let msg = r#"{"type":"connect","broadcastId":"b1","selectedGroupIds":[10]}"#;
        assert_eq!(error_code(h.handle_text(msg).await), "mixer_error");
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn close_only_purges_own_sessions() {
        let mocks = Mocks::new(prepared());
        let state = app_state(&mocks);
        let mut first = handler(&state, "ws-1");
        let mut second = handler(&state, "ws-2");
        connect(&mut first, "a").await;
        connect(&mut second, "b").await;

        first.close().await;

        assert!(state.registry.get(&"a".into()).is_none());
        assert!(state.registry.get(&"b".into()).is_some());
    }

    #[tokio::test]
    async fn reconnect_elsewhere_survives_old_connection_close() {
        let mocks = Mocks::new(prepared());
        let state = app_state(&mocks);
        let mut old = handler(&state, "ws-1");
        let mut new = handler(&state, "ws-2");
        connect(&mut old, "b1").await;
        connect(&mut new, "b1").await;

        old.close().await;

        let session = state.registry.get(&"b1".into()).unwrap();
        assert_eq!(session.connection_id(), "ws-2");
    }

    #[tokio::test]
    async fn speaker_toggle_updates_mixer_and_volume_persists() {
        let mocks = Mocks::new(prepared());
        let state = app_state(&mocks);
        let mut h = handler(&state, "ws-1");
        connect(&mut h, "b1").await;
        let id = BroadcastId::from("b1");

        let reply = h
            .handle_text(
                r#"{"type":"set_speaker_active","broadcastId":"b1","speakerId":2,"active":false}"#,
            )
            .await;
        assert!(matches!(
            reply,
            Some(WsOutgoing::SpeakerUpdated { speaker_id: 2, active: false, .. })
        ));
        assert_eq!(mocks.mixer.initialized.get(&id).unwrap().len(), 1);

        let reply = h
            .handle_text(r#"{"type":"set_volume","broadcastId":"b1","source":"tts","level":140}"#)
            .await;
        assert!(matches!(
            reply,
            Some(WsOutgoing::VolumeSet { level: 100, .. })
        ));
        let levels = mocks.store.channel_volumes(1).await.unwrap();
        assert_eq!(levels.get(AudioSource::Tts), 100);
    }

    #[tokio::test]
    async fn takeover_deactivates_speaker_in_previous_channel() {
        let mut prepared = prepared();
        prepared.takeovers = vec![Takeover {
            speaker_id: 1,
            previous_channel_id: 1,
        }];
        let mocks = Mocks::new(prepared);
        let state = app_state(&mocks);

        let existing = Arc::new(session_with("old", "ws-9", vec![speaker(1), speaker(3)]));
        state.registry.upsert("old".into(), Arc::clone(&existing));

        let mut h = ConnectionHandler::new(state.clone(), "ws-1".into(), 7);
        connect(&mut h, "new").await;

        let active: Vec<_> = existing.active_speakers().iter().map(|s| s.id).collect();
        assert_eq!(active, vec![3]);
    }

    #[tokio::test]
    async fn events_forwarded_only_for_owned_broadcasts() {
        let mocks = Mocks::new(prepared());
        let state = app_state(&mocks);
        let mut h = handler(&state, "ws-1");
        connect(&mut h, "mine").await;

        let theirs = BroadcastEvent::Session(SessionEvent::SpeakerUpdated {
            broadcast_id: "theirs".into(),
            speaker_id: 1,
            active: false,
            timestamp: 0,
        });
        let mine = BroadcastEvent::Session(SessionEvent::Ended {
            broadcast_id: "mine".into(),
            channel_id: 1,
            reason: "test".into(),
            duration_ms: 0,
            packet_count: 0,
            total_bytes: 0,
            timestamp: 0,
        });
        assert!(!h.forwards(&theirs));
        assert!(h.forwards(&mine));
        // Ended releases ownership.
        assert!(!h.forwards(&mine));
    }

    #[tokio::test]
    async fn opus_audio_is_decoded_and_gaps_concealed() {
        let mocks = Mocks::new(prepared());
        let state = app_state(&mocks);
        let mut h = handler(&state, "ws-1");
        let msg = r#"{"type":"connect","broadcastId":"b1","selectedGroupIds":[10],"encoding":"opus"}"#;
        h.handle_text(msg).await;

        let mut encoder = FrameCodec::new().unwrap();
        let silence = vec![0u8; crate::protocol_constants::FRAME_BYTES];
        let packet = BASE64.encode(encoder.encode(&silence).unwrap());
        let opus = |seq: u64| {
            format!(
                r#"{{"type":"audio","broadcastId":"b1","data":"{}","seq":{}}}"#,
                packet, seq
            )
        };

        h.handle_text(&opus(0)).await;
        {
            let frames = mocks.mixer.mic_frames.lock();
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].1.len(), crate::protocol_constants::FRAME_BYTES);
        }

        // seq 1 lost: one recovered frame plus the packet itself.
        h.handle_text(&opus(2)).await;
        assert_eq!(mocks.mixer.mic_frames.lock().len(), 3);

        // Late packet is dropped but still counted.
        h.handle_text(&opus(1)).await;
        assert_eq!(mocks.mixer.mic_frames.lock().len(), 3);
        let session = state.registry.get(&"b1".into()).unwrap();
        assert_eq!(session.packet_count(), 3);
    }

    #[test]
    fn outgoing_messages_use_snake_case_type_and_camel_case_fields() {
        let msg = WsOutgoing::VolumeSet {
            broadcast_id: "b1".into(),
            source: AudioSource::Media,
            level: 50,
        };
        let json: serde_json::Value = serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(json["type"], "volume_set");
        assert_eq!(json["broadcastId"], "b1");
        assert_eq!(json["source"], "media");
    }
}
