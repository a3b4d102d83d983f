//! The Session Manager's raw per-session WebSocket endpoint:
//! `/ws/terminal?sessionId=<id>&preview=<bool>`. One socket, one
//! Subscriber, straight frames — no multiplexing. That lives one layer up,
//! in the Gateway's Browser Channel.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use common::hub::{Hub, OutboundFrame};

use crate::state::{AppState, DEFAULT_COLS, DEFAULT_ROWS};

#[derive(Deserialize)]
pub struct TerminalQuery {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    #[serde(default)]
    preview: bool,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ClientFrame {
    #[serde(rename = "terminal:input")]
    Input {
        #[serde(rename = "sessionId")]
        #[allow(dead_code)]
        session_id: String,
        data: String,
    },
    #[serde(rename = "terminal:resize")]
    Resize {
        #[serde(rename = "sessionId")]
        #[allow(dead_code)]
        session_id: String,
        cols: u16,
        rows: u16,
    },
}

pub async fn terminal_ws(
    State(state): State<AppState>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(session_id) = query.session_id else {
        return ws.on_upgrade(|socket| close_with(socket, 4002, "missing sessionId"));
    };
    match state.registry.get(&session_id) {
        Ok(session) => ws.on_upgrade(move |socket| handle(socket, state, session, query.preview)),
        Err(_) => ws.on_upgrade(move |socket| close_with(socket, 4003, "session not found")),
    }
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame { code, reason: reason.into() })))
        .await;
}

fn data_frame(session_id: &str, bytes: &[u8]) -> String {
    serde_json::json!({
        "type": "terminal:data",
        "sessionId": session_id,
        "data": String::from_utf8_lossy(bytes),
    })
    .to_string()
}

fn resized_frame(session_id: &str, cols: u16, rows: u16) -> String {
    serde_json::json!({
        "type": "terminal:resized",
        "sessionId": session_id,
        "cols": cols,
        "rows": rows,
    })
    .to_string()
}

async fn handle(socket: WebSocket, state: AppState, session: common::types::Session, preview: bool) {
    let session_id = session.id.as_str().to_string();
    let spec = state.spec_for(&session, DEFAULT_COLS, DEFAULT_ROWS);
    let hub = state.hubs.get_or_create(&session_id, spec);

    let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(256);
    let (client_id, replay) = match hub.subscribe(out_tx, preview, DEFAULT_COLS, DEFAULT_ROWS).await {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "failed to attach session hub");
            close_with(socket, 4000, "session unavailable").await;
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = socket.split();

    if let Some(bytes) = replay {
        if !bytes.is_empty() && ws_tx.send(Message::Text(data_frame(&session_id, &bytes).into())).await.is_err() {
            hub.unsubscribe(client_id).await;
            return;
        }
    }

    let outbound_session_id = session_id.clone();
    let outbound = async move {
        while let Some(frame) = out_rx.recv().await {
            let sent = match frame {
                OutboundFrame::Data(bytes) => {
                    ws_tx.send(Message::Text(data_frame(&outbound_session_id, &bytes).into())).await
                }
                OutboundFrame::Resized { cols, rows } => {
                    ws_tx.send(Message::Text(resized_frame(&outbound_session_id, cols, rows).into())).await
                }
                OutboundFrame::Detached => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame { code: 4000, reason: "session detached".into() })))
                        .await;
                    break;
                }
            };
            if sent.is_err() {
                break;
            }
        }
    };

    let hub_for_inbound: Arc<Hub> = Arc::clone(&hub);
    let inbound_session_id = session_id.clone();
    let inbound = async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            let Message::Text(text) = msg else { continue };
            match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Input { data, .. }) => {
                    if let Err(e) = hub_for_inbound.send_keys(data.as_bytes()).await {
                        tracing::warn!(session_id = %inbound_session_id, error = %e, "send_keys failed");
                    }
                }
                Ok(ClientFrame::Resize { cols, rows, .. }) => {
                    hub_for_inbound.resize(client_id, preview, cols, rows).await;
                }
                Err(e) => {
                    tracing::debug!(session_id = %inbound_session_id, error = %e, "malformed terminal frame");
                }
            }
        }
    };

    tokio::select! {
        _ = outbound => {}
        _ = inbound => {}
    }

    hub.unsubscribe(client_id).await;
}
