//! Gateway: authenticates browser clients and exposes one multiplexed
//! WebSocket per browser, sharing a single upstream Session Manager
//! connection per session across every subscriber.

pub mod auth;
pub mod channel;
pub mod frames;
pub mod sm_link;
pub mod state;
pub mod upstream;
pub mod ws;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use state::GatewayState;

/// Build the Axum router. Split out from `main` so tests can exercise it
/// without a real network listener.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws/terminals", get(ws::terminals_ws))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
