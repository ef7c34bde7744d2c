//! HTTP route handlers.
//!
//! All handlers are thin; session state comes straight from the registry.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::ws::ws_handler;
use crate::api::AppState;
use crate::error::{OnAirError, OnAirResult};
use crate::protocol_constants::{APP_NAME, SERVICE_ID};
use crate::session::{BroadcastId, SessionSnapshot};

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Creates the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{broadcast_id}", get(get_session))
        .route("/ws/{channel_id}", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Liveness check: always 200 while the process is serving.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": SERVICE_ID,
        "name": APP_NAME,
        "sessions": state.registry.len(),
        "connections": state.ws_manager.connection_count(),
    }))
}

/// Snapshots of every live broadcast session.
async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSnapshot>> {
    let mut sessions = state.registry.snapshots();
    sessions.sort_by_key(|s| s.started_at);
    Json(sessions)
}

async fn get_session(
    Path(broadcast_id): Path<String>,
    State(state): State<AppState>,
) -> OnAirResult<Json<SessionSnapshot>> {
    let id = BroadcastId::new(broadcast_id.trim());
    state
        .registry
        .get(&id)
        .map(|s| Json(s.snapshot()))
        .ok_or_else(|| OnAirError::SessionNotFound(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::events::BroadcastEventBridge;
    use crate::services::test_support::{speaker, Mocks};
    use crate::services::traits::PreparedBroadcast;
    use crate::services::CleanupCoordinator;
    use crate::session::test_support::session_with;
    use crate::session::SessionRegistry;

    fn state() -> AppState {
        let mocks = Mocks::new(PreparedBroadcast::default());
        let registry = Arc::new(SessionRegistry::new());
        let bridge = Arc::new(BroadcastEventBridge::new(8));
        let coordinator = Arc::new(CleanupCoordinator::new(
            Arc::clone(&registry),
            mocks.mixer.clone(),
            mocks.media.clone(),
            mocks.tts.clone(),
            mocks.store.clone(),
            mocks.preparation.clone(),
            bridge.clone(),
        ));
        AppState::builder()
            .registry(registry)
            .coordinator(coordinator)
            .preparation(mocks.preparation)
            .mixer(mocks.mixer)
            .players(mocks.media, mocks.tts)
            .store(mocks.store)
            .event_bridge(bridge)
            .build()
    }

    #[tokio::test]
    async fn sessions_listing_reflects_registry() {
        let state = state();
        state
            .registry
            .upsert("b1".into(), Arc::new(session_with("b1", "ws-1", vec![speaker(1)])));

        let Json(sessions) = list_sessions(State(state.clone())).await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].active_speakers, 1);

        let found = get_session(Path(" b1 ".to_string()), State(state.clone())).await;
        assert!(found.is_ok());

        let missing = get_session(Path("nope".to_string()), State(state)).await;
        assert!(matches!(missing, Err(OnAirError::SessionNotFound(_))));
    }
}
