//! Thin WebSocket transport for the Upstream Pool's connection to the
//! Session Manager's raw `/ws/terminal` endpoint: type-isolated reader/writer
//! halves over `tokio-tungstenite`, so the select loop in [`crate::upstream`]
//! never touches the library's `Message` type directly.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug)]
pub enum SmMessage {
    Text(String),
    Close { code: u16 },
}

pub struct SmWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl SmWriter {
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink.send(tungstenite::Message::Text(text.to_string())).await.context("send to SM failed")
    }

    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await.context("close to SM failed")
    }
}

pub struct SmReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl SmReader {
    /// Receive the next message, returning `None` when the stream ends.
    /// Ping/pong/raw frames are absorbed silently — only text and close
    /// carry information the Upstream Pool cares about.
    pub async fn recv(&mut self) -> Option<Result<SmMessage>> {
        loop {
            return match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => Some(Ok(SmMessage::Text(text.to_string()))),
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    let code = frame.map(|f| f.code.into()).unwrap_or(1005);
                    Some(Ok(SmMessage::Close { code }))
                }
                Some(Ok(tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_) | tungstenite::Message::Frame(_) | tungstenite::Message::Binary(_))) => continue,
                Some(Err(e)) => Some(Err(anyhow::anyhow!("SM WebSocket read error: {e}"))),
                None => None,
            };
        }
    }
}

/// Connects to the Session Manager's per-session raw WebSocket endpoint.
///
/// Connects the TCP socket ourselves (instead of the one-shot
/// `connect_async` helper) so `set_nodelay` can be applied before the WS
/// handshake — every terminal-carrying socket, both client- and
/// upstream-facing, has Nagle's algorithm disabled.
pub async fn connect(url: &str) -> Result<(SmWriter, SmReader)> {
    use tungstenite::client::IntoClientRequest;

    let request = url.into_client_request().with_context(|| format!("invalid SM WebSocket URL: {url}"))?;
    let host = request.uri().host().with_context(|| format!("missing host in SM URL: {url}"))?.to_string();
    let port = request
        .uri()
        .port_u16()
        .unwrap_or(if request.uri().scheme_str() == Some("wss") { 443 } else { 80 });

    let tcp = tokio::net::TcpStream::connect((host.as_str(), port))
        .await
        .with_context(|| format!("TCP connect to SM at {host}:{port} failed"))?;
    tcp.set_nodelay(true).context("failed to disable Nagle's algorithm on SM upstream socket")?;

    let (ws_stream, _response) = tokio_tungstenite::client_async_tls(request, tcp)
        .await
        .context("SM WebSocket handshake failed")?;
    let (sink, stream) = ws_stream.split();
    Ok((SmWriter { sink }, SmReader { stream }))
}

/// Converts an HTTP(S) base URL to WS(S) scheme and appends the SM's raw
/// terminal path. `ws://`/`wss://` bases pass through unchanged.
pub fn terminal_url(sm_base_url: &str, session_id: &str) -> String {
    let ws_base = if sm_base_url.starts_with("ws://") || sm_base_url.starts_with("wss://") {
        sm_base_url.to_string()
    } else {
        sm_base_url.replace("https://", "wss://").replace("http://", "ws://")
    };
    format!("{ws_base}/ws/terminal?sessionId={session_id}&preview=false")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_non_preview_terminal_url() {
        assert_eq!(terminal_url("http://127.0.0.1:4096", "abc"), "ws://127.0.0.1:4096/ws/terminal?sessionId=abc&preview=false");
    }

    #[test]
    fn passes_through_existing_ws_scheme() {
        assert_eq!(terminal_url("wss://sm.internal", "abc"), "wss://sm.internal/ws/terminal?sessionId=abc&preview=false");
    }
}
