//! Upstream Pool: shares one Session Manager connection per `session_id`
//! across every browser subscribed to it through this Gateway process. The
//! pool is the exclusive owner of these links.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::hub::resize_wins;
use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};

use crate::frames::ServerFrame;
use crate::sm_link;

/// Bytes buffered since the SM link opened, replayed to browsers that
/// subscribe after the first one. Mirrors the Hub's own scrollback ring,
/// but bounded far smaller since it only needs to cover the gap between
/// this process's own connect and a later-joining browser — the SM side
/// already holds the authoritative ring.
const REPLAY_CAP: usize = 512;

enum SmCommand {
    Input(String),
    Resize(u16, u16),
    Shutdown,
}

struct Subscriber {
    tx: mpsc::Sender<ServerFrame>,
    is_preview: bool,
}

struct UpstreamState {
    size: (u16, u16),
    replay: VecDeque<String>,
}

pub struct Upstream {
    session_id: String,
    refcount: AtomicUsize,
    subscribers: DashMap<u64, Subscriber>,
    state: Mutex<UpstreamState>,
    cmd_tx: mpsc::UnboundedSender<SmCommand>,
}

impl Upstream {
    fn any_full(&self) -> bool {
        self.subscribers.iter().any(|s| !s.is_preview)
    }

    async fn send_to(&self, sub_id: u64, frame: ServerFrame) {
        if let Some(sub) = self.subscribers.get(&sub_id) {
            let _ = sub.tx.send(frame).await;
        }
    }

    fn fan_out(&self, frame: ServerFrame) {
        for sub in self.subscribers.iter() {
            let _ = sub.tx.try_send(frame.clone());
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum SmFrame {
    #[serde(rename = "terminal:data")]
    Data {
        #[allow(dead_code)]
        #[serde(rename = "sessionId")]
        session_id: String,
        data: String,
    },
    #[serde(rename = "terminal:resized")]
    Resized {
        #[allow(dead_code)]
        #[serde(rename = "sessionId")]
        session_id: String,
        cols: u16,
        rows: u16,
    },
}

pub struct UpstreamPool {
    sm_base_url: String,
    entries: DashMap<String, Arc<Upstream>>,
}

impl UpstreamPool {
    pub fn new(sm_base_url: String) -> Arc<Self> {
        Arc::new(Self { sm_base_url, entries: DashMap::new() })
    }

    /// Adds `subscriber_id` as a subscriber of `session_id`, opening a new SM
    /// link only if none is currently live for this session. Replays any
    /// bytes buffered since connect so a late-joining browser isn't left
    /// staring at a blank screen, and sends the current effective size as a
    /// `resized` ack.
    pub async fn subscribe(self: &Arc<Self>, session_id: &str, subscriber_id: u64, is_preview: bool, tx: mpsc::Sender<ServerFrame>) {
        let upstream = self
            .entries
            .entry(session_id.to_string())
            .or_insert_with(|| spawn_upstream(Arc::clone(self), session_id.to_string(), self.sm_base_url.clone()))
            .clone();
        upstream.refcount.fetch_add(1, Ordering::SeqCst);
        upstream.subscribers.insert(subscriber_id, Subscriber { tx, is_preview });

        let guard = upstream.state.lock().await;
        if !guard.replay.is_empty() {
            let replay: String = guard.replay.iter().cloned().collect();
            upstream.send_to(subscriber_id, ServerFrame::Data { session_id: session_id.to_string(), data: replay }).await;
        }
        let (cols, rows) = guard.size;
        drop(guard);
        upstream.send_to(subscriber_id, ServerFrame::Resized { session_id: session_id.to_string(), cols, rows }).await;
    }

    /// Drops `subscriber_id` from `session_id`'s upstream and, once the
    /// refcount reaches zero, removes the pool entry and tells the link task
    /// to close — *before* the link actually closes, so a fresh subscribe
    /// racing the close can never be clobbered by the stale close handler.
    pub fn unsubscribe(&self, session_id: &str, subscriber_id: u64) {
        let Some(upstream) = self.entries.get(session_id).map(|u| u.clone()) else { return };
        upstream.subscribers.remove(&subscriber_id);
        if upstream.refcount.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.entries.remove_if(session_id, |_, v| Arc::ptr_eq(v, &upstream));
            let _ = upstream.cmd_tx.send(SmCommand::Shutdown);
        }
    }

    pub fn input(&self, session_id: &str, data: &str) {
        if let Some(upstream) = self.entries.get(session_id) {
            let _ = upstream.cmd_tx.send(SmCommand::Input(data.to_string()));
        }
    }

    /// Applies the resize arbitration rule locally across this Gateway's own
    /// subscriber set (see module docs in `common::hub`): since every
    /// browser attached through this process shares one SM link, only the
    /// winning request is ever forwarded upstream, and suppressed preview
    /// requesters get a synthesized `resized` ack at the currently-applied
    /// size exactly as the Hub would reply to a direct SM subscriber.
    pub async fn resize(&self, session_id: &str, subscriber_id: u64, is_preview: bool, cols: u16, rows: u16) {
        let Some(upstream) = self.entries.get(session_id).map(|u| u.clone()) else { return };
        let any_full = upstream.any_full();
        let wins = resize_wins(any_full, is_preview);
        let effective = if wins {
            let mut guard = upstream.state.lock().await;
            guard.size = (cols, rows);
            let _ = upstream.cmd_tx.send(SmCommand::Resize(cols, rows));
            (cols, rows)
        } else {
            upstream.state.lock().await.size
        };
        upstream
            .send_to(subscriber_id, ServerFrame::Resized { session_id: session_id.to_string(), cols: effective.0, rows: effective.1 })
            .await;
    }
}

fn spawn_upstream(pool: Arc<UpstreamPool>, session_id: String, sm_base_url: String) -> Arc<Upstream> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let upstream = Arc::new(Upstream {
        session_id: session_id.clone(),
        refcount: AtomicUsize::new(0),
        subscribers: DashMap::new(),
        state: Mutex::new(UpstreamState { size: (80, 24), replay: VecDeque::new() }),
        cmd_tx,
    });
    tokio::spawn(run_upstream(pool, Arc::clone(&upstream), sm_base_url, cmd_rx));
    upstream
}

async fn run_upstream(pool: Arc<UpstreamPool>, upstream: Arc<Upstream>, sm_base_url: String, mut cmd_rx: mpsc::UnboundedReceiver<SmCommand>) {
    let url = sm_link::terminal_url(&sm_base_url, &upstream.session_id);
    let (mut writer, mut reader) = match sm_link::connect(&url).await {
        Ok(pair) => pair,
        Err(e) => {
            tracing::warn!(session_id = %upstream.session_id, error = %e, "failed to open SM upstream");
            fan_out_error(&upstream, &e.to_string());
            purge_if_current(&pool, &upstream);
            return;
        }
    };

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(SmCommand::Input(data)) => {
                    let frame = serde_json::json!({"type": "terminal:input", "sessionId": upstream.session_id, "data": data}).to_string();
                    if writer.send_text(&frame).await.is_err() { break; }
                }
                Some(SmCommand::Resize(cols, rows)) => {
                    let frame = serde_json::json!({"type": "terminal:resize", "sessionId": upstream.session_id, "cols": cols, "rows": rows}).to_string();
                    if writer.send_text(&frame).await.is_err() { break; }
                }
                Some(SmCommand::Shutdown) | None => {
                    let _ = writer.close().await;
                    return;
                }
            },
            msg = reader.recv() => match msg {
                Some(Ok(sm_link::SmMessage::Text(text))) => handle_sm_text(&upstream, &text).await,
                Some(Ok(sm_link::SmMessage::Close { .. })) | None => break,
                Some(Err(e)) => {
                    tracing::warn!(session_id = %upstream.session_id, error = %e, "SM upstream read error");
                    break;
                }
            },
        }
    }

    fan_out_error(&upstream, "upstream closed");
    purge_if_current(&pool, &upstream);
}

async fn handle_sm_text(upstream: &Arc<Upstream>, text: &str) {
    let Ok(frame) = serde_json::from_str::<SmFrame>(text) else {
        tracing::debug!(session_id = %upstream.session_id, "malformed SM frame");
        return;
    };
    match frame {
        SmFrame::Data { data, .. } => {
            {
                let mut guard = upstream.state.lock().await;
                if guard.replay.len() >= REPLAY_CAP {
                    guard.replay.pop_front();
                }
                guard.replay.push_back(data.clone());
            }
            upstream.fan_out(ServerFrame::Data { session_id: upstream.session_id.clone(), data });
        }
        SmFrame::Resized { cols, rows, .. } => {
            upstream.state.lock().await.size = (cols, rows);
            upstream.fan_out(ServerFrame::Resized { session_id: upstream.session_id.clone(), cols, rows });
        }
    }
}

/// Delivers `error(code=4000)` to every currently-subscribed browser for
/// this upstream. Browser Channels are responsible for purging the
/// subscription from their own set on receipt.
fn fan_out_error(upstream: &Upstream, message: &str) {
    upstream.fan_out(ServerFrame::Error { session_id: upstream.session_id.clone(), code: 4000, error: message.to_string() });
}

/// Only removes the pool entry if it still points at *this* upstream —
/// otherwise a new upstream raced ahead during this one's close handshake,
/// and the close handler must early-return rather than clobber it.
fn purge_if_current(pool: &UpstreamPool, upstream: &Arc<Upstream>) {
    pool.entries.remove_if(&upstream.session_id, |_, v| Arc::ptr_eq(v, upstream));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_upstream(session_id: &str) -> Arc<Upstream> {
        let (cmd_tx, _cmd_rx) = mpsc::unbounded_channel();
        Arc::new(Upstream {
            session_id: session_id.to_string(),
            refcount: AtomicUsize::new(0),
            subscribers: DashMap::new(),
            state: Mutex::new(UpstreamState { size: (80, 24), replay: VecDeque::new() }),
            cmd_tx,
        })
    }

    #[tokio::test]
    async fn full_subscriber_beats_preview_on_any_full() {
        let upstream = bare_upstream("s1");
        let (full_tx, _full_rx) = mpsc::channel(16);
        let (prev_tx, mut prev_rx) = mpsc::channel(16);
        upstream.subscribers.insert(1, Subscriber { tx: full_tx, is_preview: false });
        upstream.subscribers.insert(2, Subscriber { tx: prev_tx, is_preview: true });
        upstream.state.lock().await.size = (100, 30);

        let any_full = upstream.any_full();
        assert!(!resize_wins(any_full, true));
        assert!(resize_wins(any_full, false));

        upstream.send_to(2, ServerFrame::Resized { session_id: "s1".into(), cols: 100, rows: 30 }).await;
        match prev_rx.try_recv().unwrap() {
            ServerFrame::Resized { cols, rows, .. } => assert_eq!((cols, rows), (100, 30)),
            _ => panic!("expected resized ack"),
        }
    }

    #[test]
    fn preview_only_subscribers_mean_preview_wins() {
        assert!(resize_wins(false, true));
    }

    #[test]
    fn replay_buffer_evicts_oldest_past_capacity() {
        let mut replay: VecDeque<String> = VecDeque::new();
        for i in 0..(REPLAY_CAP + 3) {
            if replay.len() >= REPLAY_CAP {
                replay.pop_front();
            }
            replay.push_back(i.to_string());
        }
        assert_eq!(replay.len(), REPLAY_CAP);
        assert_eq!(replay.front().unwrap(), "3");
    }
}
