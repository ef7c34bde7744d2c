//! WebSocket connection tracking and management.
//!
//! - `WsConnectionManager`: tracks every open control connection
//! - `ConnectionGuard`: RAII guard that unregisters on disconnect

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::session::ChannelId;

struct ConnectionState {
    channel_id: ChannelId,
    connected_at: Instant,
}

/// Manages all active WebSocket connections.
///
/// Each connection gets a child of a global cancellation token so
/// [`close_all`](Self::close_all) can force-close every handler at once.
pub struct WsConnectionManager {
    connections: DashMap<String, ConnectionState>,
    next_id: AtomicU64,
    /// Replaced after `close_all()` so later connections get a live token.
    global_cancel: RwLock<CancellationToken>,
}

impl WsConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            global_cancel: RwLock::new(CancellationToken::new()),
        }
    }

    /// Registers a connection for a channel and returns its guard.
    pub fn register(self: &Arc<Self>, channel_id: ChannelId) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn_id = format!("ws-{}", id);
        let cancel_token = self.global_cancel.read().child_token();

        self.connections.insert(
            conn_id.clone(),
            ConnectionState {
                channel_id,
                connected_at: Instant::now(),
            },
        );
        log::info!(
            "[WS] Connection registered: {} on channel {} (total: {})",
            conn_id,
            channel_id,
            self.connections.len()
        );

        ConnectionGuard {
            id: conn_id,
            manager: Arc::clone(self),
            cancel_token,
        }
    }

    fn unregister(&self, id: &str) {
        if let Some((_, state)) = self.connections.remove(id) {
            log::info!(
                "[WS] Connection unregistered: {} on channel {} after {:?} (remaining: {})",
                id,
                state.channel_id,
                state.connected_at.elapsed(),
                self.connections.len()
            );
        }
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Force-closes all connections.
    ///
    /// Cancels the global token and installs a fresh one. Returns the number
    /// of connections that were signaled.
    pub fn close_all(&self) -> usize {
        let count = self.connections.len();
        if count > 0 {
            log::info!("[WS] Force-closing {} connection(s)", count);
            let mut guard = self.global_cancel.write();
            guard.cancel();
            *guard = CancellationToken::new();
        }
        count
    }
}

impl Default for WsConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Unregisters its connection when dropped, including on panic or early return.
pub struct ConnectionGuard {
    id: String,
    manager: Arc<WsConnectionManager>,
    cancel_token: CancellationToken,
}

impl ConnectionGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Cancelled when the connection is force-closed.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.manager.unregister(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_unregister_on_drop() {
        let manager = Arc::new(WsConnectionManager::new());
        let a = manager.register(1);
        let b = manager.register(2);
        assert_ne!(a.id(), b.id());
        assert_eq!(manager.connection_count(), 2);

        drop(a);
        assert_eq!(manager.connection_count(), 1);
        drop(b);
        assert_eq!(manager.connection_count(), 0);
    }

    #[test]
    fn close_all_cancels_existing_but_not_new_connections() {
        let manager = Arc::new(WsConnectionManager::new());
        let old = manager.register(1);

        assert_eq!(manager.close_all(), 1);
        assert!(old.cancel_token().is_cancelled());

        let fresh = manager.register(1);
        assert!(!fresh.cancel_token().is_cancelled());
    }
}
