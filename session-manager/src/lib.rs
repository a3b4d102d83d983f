//! Session Manager: hosts the HTTP + WebSocket API on top of the `common`
//! terminal session fabric.

pub mod api;
pub mod state;
pub mod ws;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use common::config::Config;
use common::registry::Registry;

pub use state::AppState;

/// Build the Axum router. Split out from `main` so integration tests can
/// mount it against an in-memory registry without a real network listener.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(api::health))
        .route("/api/sessions", get(api::list_sessions).post(api::create_session))
        .route(
            "/api/sessions/{id}",
            get(api::get_session).put(api::rename_session).delete(api::kill_session),
        )
        .route("/api/sessions/{id}/reattach", post(api::reattach_session))
        .route("/api/sessions/{id}/send", post(api::send_keys))
        .route("/api/sessions/{id}/output", get(api::session_output))
        .route("/ws/terminal", get(ws::terminal_ws))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Open the registry, run the boot-time Reconciler, and build process
/// state. Does not start listening — callers drive `axum::serve`.
pub async fn bootstrap(config: &'static Config) -> anyhow::Result<AppState> {
    let registry = Arc::new(Registry::open(&config.registry_path)?);
    common::reconciler::run(&registry, &config.mux_session_prefix).await?;
    Ok(AppState::new(registry, config))
}
