//! The single teardown path for broadcast sessions.
//!
//! Explicit disconnects, dropped connections and playback completion all end
//! up in [`CleanupCoordinator::cleanup`]. Concurrent triggers for the same
//! broadcast are serialized on the session's lifecycle lock, and the
//! session's teardown claim guarantees the side effects run once.

use std::sync::Arc;

use crate::events::{EventEmitter, SessionEvent};
use crate::services::traits::{AudioMixer, BroadcastPreparation, BroadcastStore, PlaybackService};
use crate::session::{AudioSource, BroadcastId, BroadcastSession, ChannelId, SessionRegistry};
use crate::utils::now_millis;

/// How a cleanup call should behave.
#[derive(Debug, Clone)]
pub struct CleanupOptions {
    /// Skip the "still playing" check.
    pub force: bool,
    /// Update persisted channel and broadcast state.
    pub update_database: bool,
    /// Recorded in logs and the `Ended` event.
    pub reason: String,
}

impl CleanupOptions {
    /// Forced teardown with persistence updates.
    pub fn forced(reason: impl Into<String>) -> Self {
        Self {
            force: true,
            update_database: true,
            reason: reason.into(),
        }
    }

    /// Teardown that defers while media or TTS is still playing.
    pub fn when_idle(reason: impl Into<String>) -> Self {
        Self {
            force: false,
            update_database: true,
            reason: reason.into(),
        }
    }
}

/// Result of a cleanup call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// This call tore the session down.
    Removed,
    /// Media or TTS is still playing; nothing was done.
    Deferred,
    /// Another call already tore it down, or it never existed.
    AlreadyRemoved,
    /// Teardown ran but a persistence step failed.
    Failed(String),
}

impl CleanupOutcome {
    /// True for every outcome except `Failed`.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

/// Coordinates idempotent teardown across all collaborators.
pub struct CleanupCoordinator {
    registry: Arc<SessionRegistry>,
    mixer: Arc<dyn AudioMixer>,
    media: Arc<dyn PlaybackService>,
    tts: Arc<dyn PlaybackService>,
    store: Arc<dyn BroadcastStore>,
    preparation: Arc<dyn BroadcastPreparation>,
    emitter: Arc<dyn EventEmitter>,
}

impl CleanupCoordinator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        mixer: Arc<dyn AudioMixer>,
        media: Arc<dyn PlaybackService>,
        tts: Arc<dyn PlaybackService>,
        store: Arc<dyn BroadcastStore>,
        preparation: Arc<dyn BroadcastPreparation>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            registry,
            mixer,
            media,
            tts,
            store,
            preparation,
            emitter,
        }
    }

    /// Tears down one broadcast.
    ///
    /// Missing sessions are a normal outcome: stop calls still go out to the
    /// mixer and players so nothing keeps running for a stale id.
    pub async fn cleanup(&self, broadcast_id: &BroadcastId, options: CleanupOptions) -> CleanupOutcome {
        if let Some(session) = self.registry.get(broadcast_id) {
            return self.cleanup_session(&session, options).await;
        }

        if !options.force && self.playback_active(broadcast_id, None) {
            log::debug!(
                "[Cleanup] Deferring stale {} ({}): playback still active",
                broadcast_id,
                options.reason
            );
            return CleanupOutcome::Deferred;
        }
        self.stop_producers(broadcast_id).await;
        CleanupOutcome::AlreadyRemoved
    }

    /// Tears down a specific session instance.
    ///
    /// Does nothing if the instance was removed or replaced under its id while
    /// this call waited for the lifecycle lock, so a replacement registered by
    /// another connection is never touched.
    pub async fn cleanup_session(
        &self,
        session: &Arc<BroadcastSession>,
        options: CleanupOptions,
    ) -> CleanupOutcome {
        let broadcast_id = session.broadcast_id();
        let _lifecycle = session.lock_lifecycle().await;

        if !self.registry.is_current(session) {
            log::debug!(
                "[Cleanup] {} ({}) no longer registered for {}",
                broadcast_id,
                options.reason,
                session.connection_id()
            );
            return CleanupOutcome::AlreadyRemoved;
        }

        if !options.force && self.playback_active(broadcast_id, Some(session.as_ref())) {
            log::debug!(
                "[Cleanup] Deferring {} ({}): playback still active",
                broadcast_id,
                options.reason
            );
            return CleanupOutcome::Deferred;
        }

        if !session.gate().claim_teardown() {
            log::debug!("[Cleanup] {} already being torn down", broadcast_id);
            return CleanupOutcome::AlreadyRemoved;
        }

        let persistence_error = if options.update_database {
            self.finish_persisted_state(session).await
        } else {
            None
        };

        // Producers are keyed by broadcast id; once another instance owns the
        // id they belong to it.
        let Some(removed) = self.registry.remove_instance(session) else {
            log::info!(
                "[Cleanup] {} was re-registered during teardown ({}), leaving it running",
                broadcast_id,
                options.reason
            );
            return CleanupOutcome::AlreadyRemoved;
        };
        self.stop_producers(broadcast_id).await;
        self.release_channel_if_idle(removed.channel_id()).await;

        let duration = removed.duration();
        log::info!(
            "[Cleanup] Broadcast {} on channel {} ended ({}): {:.1}s, {} packets, {} bytes",
            broadcast_id,
            removed.channel_id(),
            options.reason,
            duration.as_secs_f64(),
            removed.packet_count(),
            removed.total_bytes()
        );
        self.emitter.emit_session(SessionEvent::Ended {
            broadcast_id: broadcast_id.clone(),
            channel_id: removed.channel_id(),
            reason: options.reason,
            duration_ms: duration.as_millis() as u64,
            packet_count: removed.packet_count(),
            total_bytes: removed.total_bytes(),
            timestamp: now_millis(),
        });

        match persistence_error {
            Some(e) => CleanupOutcome::Failed(e),
            None => CleanupOutcome::Removed,
        }
    }

    /// Force-cleans every session owned by a connection.
    ///
    /// Works on the instances owned at call time; ids re-registered by another
    /// connection during the purge are left alone.
    pub async fn cleanup_connection(&self, connection_id: &str) -> Vec<(BroadcastId, CleanupOutcome)> {
        let sessions = self
            .registry
            .sessions_where(|s| s.connection_id() == connection_id);
        if !sessions.is_empty() {
            log::info!(
                "[Cleanup] Connection {} closed, cleaning {} session(s)",
                connection_id,
                sessions.len()
            );
        }

        let mut outcomes = Vec::with_capacity(sessions.len());
        for session in sessions {
            let outcome = self
                .cleanup_session(&session, CleanupOptions::forced("connection_closed"))
                .await;
            outcomes.push((session.broadcast_id().clone(), outcome));
        }
        outcomes
    }

    /// Force-cleans every live session.
    pub async fn cleanup_all(&self, reason: &str) -> usize {
        let ids = self.registry.ids();
        let mut removed = 0;
        for id in ids {
            if self.cleanup(&id, CleanupOptions::forced(reason)).await == CleanupOutcome::Removed {
                removed += 1;
            }
        }
        removed
    }

    fn playback_active(&self, broadcast_id: &BroadcastId, session: Option<&BroadcastSession>) -> bool {
        let gate_says = |source| session.is_some_and(|s| s.gate().is_active(source));
        let media = gate_says(AudioSource::Media)
            || self.media.status_by_broadcast_id(broadcast_id).is_playing;
        let tts = gate_says(AudioSource::Tts)
            || self.tts.status_by_broadcast_id(broadcast_id).is_playing;
        media || tts
    }

    /// Returns the first failure message, if any step failed.
    async fn finish_persisted_state(&self, session: &BroadcastSession) -> Option<String> {
        let channel_id = session.channel_id();
        let mut failure = None;

        if let Err(e) = self.store.set_channel_broadcasting(channel_id, false).await {
            log::warn!("[Cleanup] Failed to clear broadcasting flag for channel {}: {}", channel_id, e);
            failure.get_or_insert_with(|| e.to_string());
        }
        match self.store.finish_ongoing_broadcasts(channel_id).await {
            Ok(n) => log::debug!("[Cleanup] Finished {} broadcast record(s) for channel {}", n, channel_id),
            Err(e) => {
                log::warn!("[Cleanup] Failed to finish broadcast records for channel {}: {}", channel_id, e);
                failure.get_or_insert_with(|| e.to_string());
            }
        }
        failure
    }

    /// Releases the channel's speaker claims once no broadcast is live on it.
    async fn release_channel_if_idle(&self, channel_id: ChannelId) {
        let remaining = self.registry.ids_where(|s| s.channel_id() == channel_id);
        if remaining.is_empty() {
            self.preparation.release(channel_id).await;
        } else {
            log::debug!(
                "[Cleanup] Channel {} still has {} live broadcast(s), keeping speaker claims",
                channel_id,
                remaining.len()
            );
        }
    }

    async fn stop_producers(&self, broadcast_id: &BroadcastId) {
        if let Err(e) = self.mixer.stop(broadcast_id).await {
            log::warn!("[Cleanup] Mixer stop failed for {}: {}", broadcast_id, e);
        }
        if self.media.stop_by_broadcast_id(broadcast_id).await {
            log::debug!("[Cleanup] Stopped media for {}", broadcast_id);
        }
        if self.tts.stop_by_broadcast_id(broadcast_id).await {
            log::debug!("[Cleanup] Stopped TTS for {}", broadcast_id);
        }
    }
}
