//! The Gateway's multiplexed browser-facing endpoint:
//! `/ws/terminals?token=<jwt>`.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::channel::BrowserChannel;
use crate::frames::{ClientFrame, ServerFrame};
use crate::state::GatewayState;

#[derive(Deserialize)]
pub struct TerminalsQuery {
    token: Option<String>,
}

pub async fn terminals_ws(State(state): State<GatewayState>, Query(query): Query<TerminalsQuery>, ws: WebSocketUpgrade) -> Response {
    let Some(token) = query.token else {
        return ws.on_upgrade(|socket| close_with(socket, 4001, "missing token"));
    };
    match crate::auth::verify(&token, &state.config.jwt_secret) {
        Ok(claims) => ws.on_upgrade(move |socket| handle(socket, state, claims.sub)),
        Err(_) => ws.on_upgrade(|socket| close_with(socket, 4001, "invalid token")),
    }
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket.send(Message::Close(Some(CloseFrame { code, reason: reason.into() }))).await;
}

async fn handle(socket: WebSocket, state: GatewayState, user_id: String) {
    let mut channel = BrowserChannel::new(user_id, state.upstream_pool);
    let (server_tx, mut server_rx) = mpsc::channel::<ServerFrame>(256);
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => channel.handle_client_frame(frame, &server_tx).await,
                            Err(e) => tracing::debug!(error = %e, "malformed gateway frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "gateway socket read error");
                        break;
                    }
                }
            }
            frame = server_rx.recv() => {
                let Some(frame) = frame else { break };
                if let ServerFrame::Error { session_id, .. } = &frame {
                    channel.purge_on_upstream_error(session_id);
                }
                let text = serde_json::to_string(&frame).unwrap_or_default();
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            () = channel.next_timer() => {}
        }
    }

    channel.shutdown();
}
