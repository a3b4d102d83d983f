//! Browser Channel: per-browser multiplexed session, running as a single
//! actor task so the subscribe/unsubscribe/grace-timer bookkeeping below
//! needs no locks around an equivalent actor-style mailbox.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::frames::{ClientFrame, ServerFrame};
use crate::upstream::UpstreamPool;

/// Grace window for deferred unsubscribe (~200 ms).
const UNSUB_GRACE: Duration = Duration::from_millis(200);

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

enum TimerEvent {
    UnsubGrace { session_id: String, epoch: u64 },
}

/// One browser's multiplexed session. Owns `subscriptions` and the pending
/// grace-timer epochs; both are only ever touched from `run`, so there is no
/// shared mutable state to lock.
pub struct BrowserChannel {
    pub channel_id: u64,
    #[allow(dead_code)]
    pub user_id: String,
    pool: Arc<UpstreamPool>,
    subscriptions: HashMap<String, bool>,
    unsub_epoch: HashMap<String, u64>,
    next_epoch: u64,
    timer_tx: mpsc::Sender<TimerEvent>,
    timer_rx: mpsc::Receiver<TimerEvent>,
}

impl BrowserChannel {
    pub fn new(user_id: String, pool: Arc<UpstreamPool>) -> Self {
        let (timer_tx, timer_rx) = mpsc::channel(32);
        Self {
            channel_id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            user_id,
            pool,
            subscriptions: HashMap::new(),
            unsub_epoch: HashMap::new(),
            next_epoch: 0,
            timer_tx,
            timer_rx,
        }
    }

    /// Handles one client frame. Replies (`data`/`resized`/`error`) are not
    /// returned directly — they arrive asynchronously on `server_tx` via the
    /// Upstream Pool's fan-out, same as every other subscriber.
    pub async fn handle_client_frame(&mut self, frame: ClientFrame, server_tx: &mpsc::Sender<ServerFrame>) {
        match frame {
            ClientFrame::Subscribe { session_id, preview } => self.handle_subscribe(session_id, preview, server_tx).await,
            ClientFrame::Unsubscribe { session_id } => self.handle_unsubscribe(session_id),
            ClientFrame::Input { session_id, data } => {
                if self.subscriptions.contains_key(&session_id) {
                    self.pool.input(&session_id, &data);
                }
            }
            ClientFrame::Resize { session_id, cols, rows } => {
                if let Some(&is_preview) = self.subscriptions.get(&session_id) {
                    self.pool.resize(&session_id, self.channel_id, is_preview, cols, rows).await;
                }
            }
        }
    }

    async fn handle_subscribe(&mut self, session_id: String, preview: bool, server_tx: &mpsc::Sender<ServerFrame>) {
        if self.unsub_epoch.remove(&session_id).is_some() {
            // A grace timer was pending: cancel it by dropping its epoch, the
            // subscription was never actually torn down upstream.
            self.subscriptions.insert(session_id, preview);
            return;
        }
        if self.subscriptions.contains_key(&session_id) {
            return; // idempotent: already live, no duplicate upstream ref
        }
        self.subscriptions.insert(session_id.clone(), preview);
        self.pool.subscribe(&session_id, self.channel_id, preview, server_tx.clone()).await;
    }

    fn handle_unsubscribe(&mut self, session_id: String) {
        if !self.subscriptions.contains_key(&session_id) {
            return;
        }
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        self.unsub_epoch.insert(session_id.clone(), epoch);
        let timer_tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(UNSUB_GRACE).await;
            let _ = timer_tx.send(TimerEvent::UnsubGrace { session_id, epoch }).await;
        });
    }

    /// Waits for the next fired grace timer and performs the real upstream
    /// unsubscribe, unless a resubscribe already cancelled it. Never
    /// resolves if no unsubscribe is pending — intended for a `select!` arm
    /// alongside the socket's own read/write futures.
    pub async fn next_timer(&mut self) {
        if let Some(TimerEvent::UnsubGrace { session_id, epoch }) = self.timer_rx.recv().await {
            self.fire_unsub_grace(session_id, epoch);
        }
    }

    #[cfg(test)]
    fn try_recv_timer(&mut self) -> bool {
        match self.timer_rx.try_recv() {
            Ok(TimerEvent::UnsubGrace { session_id, epoch }) => {
                self.fire_unsub_grace(session_id, epoch);
                true
            }
            Err(_) => false,
        }
    }

    fn fire_unsub_grace(&mut self, session_id: String, epoch: u64) {
        if self.unsub_epoch.get(&session_id) != Some(&epoch) {
            return; // stale: a newer unsub/subscribe cycle already happened
        }
        self.unsub_epoch.remove(&session_id);
        self.subscriptions.remove(&session_id);
        self.pool.unsubscribe(&session_id, self.channel_id);
    }

    /// Purges a session whose upstream reported `error` — the browser stops
    /// being considered subscribed, so subsequent input/resize frames for it
    /// are dropped rather than forwarded.
    pub fn purge_on_upstream_error(&mut self, session_id: &str) {
        self.subscriptions.remove(session_id);
        self.unsub_epoch.remove(session_id);
    }

    /// Tears down every live subscription when the browser's socket closes,
    /// without waiting out the deferred-unsubscribe grace window.
    pub fn shutdown(&mut self) {
        for session_id in self.subscriptions.keys().cloned().collect::<Vec<_>>() {
            self.pool.unsubscribe(&session_id, self.channel_id);
        }
        self.subscriptions.clear();
        self.unsub_epoch.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn pool() -> Arc<UpstreamPool> {
        UpstreamPool::new("http://127.0.0.1:1".to_string())
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let mut ch = BrowserChannel::new("u1".into(), pool());
        let (tx, _rx) = mpsc::channel(16);
        ch.handle_client_frame(ClientFrame::Subscribe { session_id: "s1".into(), preview: false }, &tx).await;
        assert_eq!(ch.subscriptions.len(), 1);
        ch.handle_client_frame(ClientFrame::Subscribe { session_id: "s1".into(), preview: false }, &tx).await;
        assert_eq!(ch.subscriptions.len(), 1);
    }

    #[tokio::test]
    async fn resubscribe_within_grace_window_cancels_timer() {
        let mut ch = BrowserChannel::new("u1".into(), pool());
        let (tx, _rx) = mpsc::channel(16);
        ch.handle_client_frame(ClientFrame::Subscribe { session_id: "s1".into(), preview: false }, &tx).await;
        ch.handle_client_frame(ClientFrame::Unsubscribe { session_id: "s1".into() }, &tx).await;
        assert_eq!(ch.unsub_epoch.len(), 1);
        ch.handle_client_frame(ClientFrame::Subscribe { session_id: "s1".into(), preview: false }, &tx).await;
        assert!(ch.unsub_epoch.is_empty());
        assert!(ch.subscriptions.contains_key("s1"));
        // The grace timer still fires eventually, but its epoch is stale now.
        tokio::time::sleep(UNSUB_GRACE + Duration::from_millis(50)).await;
        assert!(!ch.try_recv_timer());
        assert!(ch.subscriptions.contains_key("s1"));
    }

    #[tokio::test]
    async fn unsubscribe_without_resubscribe_eventually_clears() {
        let mut ch = BrowserChannel::new("u1".into(), pool());
        let (tx, _rx) = mpsc::channel(16);
        ch.handle_client_frame(ClientFrame::Subscribe { session_id: "s1".into(), preview: false }, &tx).await;
        ch.handle_client_frame(ClientFrame::Unsubscribe { session_id: "s1".into() }, &tx).await;
        ch.next_timer().await;
        assert!(!ch.subscriptions.contains_key("s1"));
    }
}
