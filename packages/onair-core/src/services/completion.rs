//! Routes player completion events into the cleanup coordinator.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::events::{EventEmitter, PlaybackEvent};
use crate::services::cleanup::{CleanupCoordinator, CleanupOptions, CleanupOutcome};
use crate::services::traits::{PlaybackCompleted, PlaybackService};
use crate::session::SessionRegistry;
use crate::utils::now_millis;

/// Owns the completion subscriptions of every player.
///
/// One task per player holds its receiver. Dropping the listener (or
/// cancelling the parent token) ends those tasks, which drops the receivers:
/// each subscription is released exactly once.
pub struct CompletionListener {
    token: CancellationToken,
}

impl CompletionListener {
    pub fn spawn(
        players: &[Arc<dyn PlaybackService>],
        registry: Arc<SessionRegistry>,
        coordinator: Arc<CleanupCoordinator>,
        emitter: Arc<dyn EventEmitter>,
        parent: &CancellationToken,
    ) -> Self {
        let token = parent.child_token();
        for player in players {
            let rx = player.subscribe_completion();
            let handler = CompletionHandler {
                registry: Arc::clone(&registry),
                coordinator: Arc::clone(&coordinator),
                emitter: Arc::clone(&emitter),
            };
            tokio::spawn(run(rx, handler, token.clone()));
        }
        Self { token }
    }

    /// Stops listening. Idempotent.
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

impl Drop for CompletionListener {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct CompletionHandler {
    registry: Arc<SessionRegistry>,
    coordinator: Arc<CleanupCoordinator>,
    emitter: Arc<dyn EventEmitter>,
}

impl CompletionHandler {
    async fn handle(&self, event: PlaybackCompleted) -> CleanupOutcome {
        log::info!(
            "[Completion] {} finished for broadcast {} ({})",
            event.source,
            event.broadcast_id,
            event.session_id
        );

        if let Some(session) = self.registry.get(&event.broadcast_id) {
            session.gate().set_active(event.source, false);
        }

        self.emitter.emit_playback(PlaybackEvent::Completed {
            broadcast_id: event.broadcast_id.clone(),
            source: event.source,
            session_id: event.session_id,
            timestamp: now_millis(),
        });

        let reason = format!("{}_completed", event.source);
        self.coordinator
            .cleanup(&event.broadcast_id, CleanupOptions::when_idle(reason))
            .await
    }
}

async fn run(
    mut rx: broadcast::Receiver<PlaybackCompleted>,
    handler: CompletionHandler,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let outcome = handler.handle(event).await;
                        log::debug!("[Completion] Cleanup outcome: {:?}", outcome);
                    }
                    Err(RecvError::Lagged(n)) => {
                        log::warn!("[Completion] Dropped {} completion event(s)", n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
    log::debug!("[Completion] Listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::emitter::test_support::RecordingEmitter;
    use crate::services::test_support::{speaker, Mocks};
    use crate::services::traits::PreparedBroadcast;
    use crate::session::test_support::session_with;
    use crate::session::{AudioSource, BroadcastId};
    use std::time::Duration;

    struct Fixture {
        mocks: Mocks,
        registry: Arc<SessionRegistry>,
        listener: CompletionListener,
        emitter: Arc<RecordingEmitter>,
    }

    fn fixture() -> Fixture {
        let mocks = Mocks::new(PreparedBroadcast::default());
        let registry = Arc::new(SessionRegistry::new());
        let emitter = Arc::new(RecordingEmitter::default());
        let coordinator = Arc::new(CleanupCoordinator::new(
            Arc::clone(&registry),
            mocks.mixer.clone(),
            mocks.media.clone(),
            mocks.tts.clone(),
            mocks.store.clone(),
            mocks.preparation.clone(),
            emitter.clone(),
        ));
        let players: Vec<Arc<dyn PlaybackService>> = vec![mocks.media.clone(), mocks.tts.clone()];
        let listener = CompletionListener::spawn(
            &players,
            Arc::clone(&registry),
            coordinator,
            emitter.clone(),
            &CancellationToken::new(),
        );
        Fixture {
            mocks,
            registry,
            listener,
            emitter,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn last_producer_completion_tears_down() {
        let f = fixture();
        let session = Arc::new(session_with("1", "ws-1", vec![speaker(1)]));
        f.registry.upsert(BroadcastId::from("1"), Arc::clone(&session));

        f.mocks.media.set_playing("1");
        session.gate().set_active(AudioSource::Media, true);
        f.mocks.tts.set_playing("1");
        session.gate().set_active(AudioSource::Tts, true);

        f.mocks.media.finish("1");
        settle().await;
        assert!(f.registry.get(&"1".into()).is_some());
        assert!(!session.gate().is_active(AudioSource::Media));

        f.mocks.tts.finish("1");
        settle().await;
        assert!(f.registry.is_empty());
        assert_eq!(f.emitter.ended_count(), 1);
        assert_eq!(f.emitter.playbacks.lock().len(), 2);
    }

    #[tokio::test]
    async fn dropped_listener_ignores_completions() {
        let f = fixture();
        let session = Arc::new(session_with("1", "ws-1", vec![speaker(1)]));
        f.registry.upsert(BroadcastId::from("1"), session);
        f.mocks.media.set_playing("1");

        drop(f.listener);
        settle().await;

        f.mocks.media.finish("1");
        settle().await;
        assert!(f.registry.get(&"1".into()).is_some());
    }
}
