//! Event emitter abstraction for decoupling services from transport.
//!
//! Services depend on the [`EventEmitter`] trait rather than concrete broadcast
//! channels, enabling testing and alternative transport implementations.

use super::{PlaybackEvent, SessionEvent};

/// Trait for emitting domain events without knowledge of transport.
///
/// The cleanup coordinator and connection handler emit through this trait;
/// how events reach clients (WebSocket, logs, nothing) is decided at bootstrap.
pub trait EventEmitter: Send + Sync {
    /// Emits a session lifecycle event.
    fn emit_session(&self, event: SessionEvent);

    /// Emits a playback lifecycle event.
    fn emit_playback(&self, event: PlaybackEvent);
}

/// Logging emitter for debugging and development.
///
/// Logs all events at debug level.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit_session(&self, event: SessionEvent) {
        tracing::debug!(?event, "session_event");
    }

    fn emit_playback(&self, event: PlaybackEvent) {
        tracing::debug!(?event, "playback_event");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// Records every emitted event for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingEmitter {
        pub(crate) sessions: Mutex<Vec<SessionEvent>>,
        pub(crate) playbacks: Mutex<Vec<PlaybackEvent>>,
    }

    impl RecordingEmitter {
        pub(crate) fn ended_count(&self) -> usize {
            self.sessions
                .lock()
                .iter()
                .filter(|e| matches!(e, SessionEvent::Ended { .. }))
                .count()
        }
    }

    impl EventEmitter for RecordingEmitter {
        fn emit_session(&self, event: SessionEvent) {
            self.sessions.lock().push(event);
        }

        fn emit_playback(&self, event: PlaybackEvent) {
            self.playbacks.lock().push(event);
        }
    }
}
