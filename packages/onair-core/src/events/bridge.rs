//! Bridge implementation that maps domain events to broadcast transport.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use super::emitter::EventEmitter;
use super::{BroadcastEvent, PlaybackEvent, SessionEvent};

/// Bridges domain events to the WebSocket broadcast channel.
///
/// Implements [`EventEmitter`] by forwarding events to a
/// `tokio::sync::broadcast` channel that connection handlers subscribe to,
/// and to an optional external emitter (e.g. [`LoggingEventEmitter`]).
///
/// [`LoggingEventEmitter`]: super::LoggingEventEmitter
#[derive(Clone)]
pub struct BroadcastEventBridge {
    tx: broadcast::Sender<BroadcastEvent>,
    external_emitter: Arc<RwLock<Option<Arc<dyn EventEmitter>>>>,
}

impl BroadcastEventBridge {
    /// Creates a new bridge with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            external_emitter: Arc::new(RwLock::new(None)),
        }
    }

    /// Sets an external emitter that receives a copy of every event.
    pub fn set_external_emitter(&self, emitter: Arc<dyn EventEmitter>) {
        *self.external_emitter.write() = Some(emitter);
    }

    /// Returns a new receiver for the broadcast channel.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.tx.subscribe()
    }
}

/// Generates an [`EventEmitter`] method that forwards to the external emitter
/// (if set) and then sends to the broadcast channel.
macro_rules! impl_emit {
    ($method:ident, $event_ty:ty, $variant:ident) => {
        fn $method(&self, event: $event_ty) {
            if let Some(ref emitter) = *self.external_emitter.read() {
                emitter.$method(event.clone());
            }
            if let Err(e) = self.tx.send(BroadcastEvent::$variant(event)) {
                log::trace!("[EventBridge] No broadcast receivers: {}", e);
            }
        }
    };
}

impl EventEmitter for BroadcastEventBridge {
    impl_emit!(emit_session, SessionEvent, Session);
    impl_emit!(emit_playback, PlaybackEvent, Playback);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::emitter::test_support::RecordingEmitter;
    use crate::session::{AudioSource, BroadcastId};

    #[tokio::test]
    async fn bridge_fans_out_to_subscribers_and_external() {
        let bridge = BroadcastEventBridge::new(8);
        let external = Arc::new(RecordingEmitter::default());
        bridge.set_external_emitter(external.clone());
        let mut rx = bridge.subscribe();

        bridge.emit_playback(PlaybackEvent::Stopped {
            broadcast_id: BroadcastId::from("3"),
            source: AudioSource::Media,
            timestamp: 0,
        });

        let received = rx.recv().await.unwrap();
        assert_eq!(received.broadcast_id().as_str(), "3");
        assert_eq!(external.playbacks.lock().len(), 1);
    }

    #[test]
    fn emit_without_subscribers_is_harmless() {
        let bridge = BroadcastEventBridge::new(4);
        bridge.emit_session(SessionEvent::SpeakerUpdated {
            broadcast_id: BroadcastId::from("1"),
            speaker_id: 2,
            active: false,
            timestamp: 0,
        });
    }
}
