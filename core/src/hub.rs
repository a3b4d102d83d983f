//! Session Hub — the core of the core. One Hub per session,
//! created lazily on first subscriber: a single upstream Controller reader
//! fanned out to N subscribers, a bounded scrollback ring, and resize
//! arbitration between "preview" and "full" viewers.

use crate::backend::{self, ControllerEvent, ControllerHandle, SessionSpec};
use crate::error::HubError;
use crate::registry::Registry;
use crate::types::{unix_now, SessionStatus};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// What the Hub sends each subscriber.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Data(Vec<u8>),
    Resized { cols: u16, rows: u16 },
    Detached,
}

/// A subscriber's outbound link. Bounded: a subscriber whose link fills up
/// is evicted rather than allowed to stall the broadcast.
pub struct Subscriber {
    pub id: u64,
    pub tx: mpsc::Sender<OutboundFrame>,
    pub is_preview: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    Dormant,
    Attaching,
    Live,
    Detached,
    Idle,
    Terminating,
    Dead,
}

/// Bounded ring of raw byte chunks, replayed in full to non-preview
/// subscribers on attach.
struct ScrollbackRing {
    capacity: usize,
    chunks: VecDeque<Vec<u8>>,
}

impl ScrollbackRing {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            chunks: VecDeque::with_capacity(capacity.min(256)),
        }
    }

    fn push(&mut self, chunk: Vec<u8>) {
        if self.chunks.len() >= self.capacity {
            self.chunks.pop_front();
        }
        self.chunks.push_back(chunk);
    }

    fn replay(&self) -> Vec<u8> {
        self.chunks.iter().flat_map(|c| c.iter().copied()).collect()
    }
}

struct Inner {
    state: HubState,
    controller: Option<ControllerHandle>,
    ring: ScrollbackRing,
    clients: Vec<Subscriber>,
    size: (u16, u16),
    next_client_id: u64,
}

/// Per-session fan-out hub. Cheap to clone (`Arc` inside); the Hub Manager
/// hands out clones to API handlers.
pub struct Hub {
    session_id: String,
    spec: SessionSpec,
    registry: Arc<Registry>,
    inner: Mutex<Inner>,
    last_activity_write: AtomicI64,
}

impl Hub {
    pub fn new(session_id: String, spec: SessionSpec, registry: Arc<Registry>, scrollback_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            spec,
            registry,
            inner: Mutex::new(Inner {
                state: HubState::Dormant,
                controller: None,
                ring: ScrollbackRing::new(scrollback_capacity),
                clients: Vec::new(),
                size: (80, 24),
                next_client_id: 0,
            }),
            last_activity_write: AtomicI64::new(0),
        })
    }

    pub async fn state(&self) -> HubState {
        self.inner.lock().await.state
    }

    /// Add a subscriber, attaching the Controller on first subscribe.
    /// Returns the subscriber's id (used later to unsubscribe) and, for
    /// non-preview subscribers, the ring replay to send before live data.
    pub async fn subscribe(
        self: &Arc<Self>,
        tx: mpsc::Sender<OutboundFrame>,
        is_preview: bool,
        cols: u16,
        rows: u16,
    ) -> Result<(u64, Option<Vec<u8>>), HubError> {
        let mut guard = self.inner.lock().await;

        if guard.controller.is_none() {
            guard.state = HubState::Attaching;
            drop(guard);
            self.attach().await?;
            guard = self.inner.lock().await;
        }

        let id = guard.next_client_id;
        guard.next_client_id += 1;
        guard.clients.push(Subscriber { id, tx, is_preview });
        guard.state = HubState::Live;
        let _ = self.registry.update_status(&self.session_id, SessionStatus::Running);

        let replay = if is_preview { None } else { Some(guard.ring.replay()) };

        self.apply_resize_locked(&mut guard, is_preview, cols, rows);
        let (eff_cols, eff_rows) = guard.size;
        if let Some(sub) = guard.clients.iter().find(|c| c.id == id) {
            let _ = sub.tx.try_send(OutboundFrame::Resized { cols: eff_cols, rows: eff_rows });
        }

        Ok((id, replay))
    }

    async fn attach(self: &Arc<Self>) -> Result<(), HubError> {
        let (controller, mut events) = backend::start(&self.spec).await?;
        {
            let mut guard = self.inner.lock().await;
            guard.controller = Some(controller);
            guard.state = HubState::Live;
        }

        let hub = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ControllerEvent::Output(bytes) => hub.on_output(bytes).await,
                    ControllerEvent::Detached => {
                        hub.on_detached().await;
                        break;
                    }
                    ControllerEvent::Error(msg) => {
                        tracing::warn!(session_id = %hub.session_id, error = %msg, "controller error");
                    }
                }
            }
        });

        Ok(())
    }

    async fn on_output(&self, bytes: Vec<u8>) {
        let mut guard = self.inner.lock().await;
        guard.ring.push(bytes.clone());
        broadcast(&mut guard.clients, OutboundFrame::Data(bytes));
        drop(guard);
        self.note_activity().await;
    }

    async fn on_detached(&self) {
        let mut guard = self.inner.lock().await;
        guard.controller = None;
        guard.state = HubState::Detached;
        broadcast(&mut guard.clients, OutboundFrame::Detached);
        drop(guard);
        let _ = self.registry.update_status(&self.session_id, SessionStatus::Stopped);
    }

    /// Coalesce activity writes to at most once per second per session.
    async fn note_activity(&self) {
        let now = unix_now();
        let last = self.last_activity_write.load(Ordering::Relaxed);
        if now > last && self.last_activity_write.compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed).is_ok() {
            let _ = self.registry.update_activity(&self.session_id, now);
        }
    }

    /// Remove a subscriber. Returns true if the Hub should be torn down
    /// (clients empty and the session is in a terminal state).
    pub async fn unsubscribe(&self, client_id: u64) -> bool {
        let mut guard = self.inner.lock().await;
        guard.clients.retain(|c| c.id != client_id);
        if guard.clients.is_empty() {
            if guard.state == HubState::Detached {
                guard.state = HubState::Dead;
                return true;
            }
            guard.state = HubState::Idle;
            let _ = self.registry.update_status(&self.session_id, SessionStatus::Idle);
        }
        false
    }

    /// Best-effort rendered-output snapshot for `GET .../output`. `None`
    /// when the Hub has no live Controller to ask.
    pub async fn capture(&self, n_lines: u32) -> Option<Vec<u8>> {
        let guard = self.inner.lock().await;
        guard.controller.as_ref().map(|c| c.capture(n_lines))
    }

    pub async fn send_keys(&self, bytes: &[u8]) -> Result<(), HubError> {
        let guard = self.inner.lock().await;
        match &guard.controller {
            Some(c) => c.send_keys(bytes).map_err(HubError::from),
            None => Err(HubError::Terminating),
        }
    }

    /// Apply the resize arbitration rule and reply to the requester.
    pub async fn resize(&self, client_id: u64, is_preview: bool, cols: u16, rows: u16) {
        let mut guard = self.inner.lock().await;
        self.apply_resize_locked(&mut guard, is_preview, cols, rows);
        let (eff_cols, eff_rows) = guard.size;
        if let Some(sub) = guard.clients.iter().find(|c| c.id == client_id) {
            let _ = sub.tx.try_send(OutboundFrame::Resized { cols: eff_cols, rows: eff_rows });
        }
    }

    /// Apply the arbitration rule: a non-preview request always wins over
    /// preview requests; among same-tier requests, the latest wins. Does
    /// not send any ack — callers read the resulting `guard.size` and reply
    /// to the requester themselves.
    fn apply_resize_locked(&self, guard: &mut Inner, is_preview: bool, cols: u16, rows: u16) {
        let any_full = guard.clients.iter().any(|c| !c.is_preview);
        if resize_wins(any_full, is_preview) {
            guard.size = (cols, rows);
            if let Some(controller) = &guard.controller {
                controller.resize(cols, rows);
            }
        }
    }

    /// Kill this session's Controller. Idempotent: a second call on an
    /// already-dead Hub is a no-op.
    pub async fn terminate(&self) {
        let controller = {
            let mut guard = self.inner.lock().await;
            guard.state = HubState::Terminating;
            guard.controller.take()
        };
        if let Some(controller) = controller {
            controller.stop().await;
        }
        let mut guard = self.inner.lock().await;
        guard.state = HubState::Dead;
        broadcast(&mut guard.clients, OutboundFrame::Detached);
    }
}

/// The resize arbitration rule, factored out as a pure function so the
/// Gateway's Upstream Pool can replicate it locally across the browsers
/// sharing one shared SM connection: a non-preview request always beats a
/// preview one; among same-tier requests, the latest caller wins.
pub fn resize_wins(any_full_subscriber: bool, requester_is_preview: bool) -> bool {
    if any_full_subscriber {
        !requester_is_preview
    } else {
        true
    }
}

/// Send a frame to every subscriber whose link is still open; closed or
/// full links are evicted in place so one stuck client cannot stall
/// everyone else.
fn broadcast(clients: &mut Vec<Subscriber>, frame: OutboundFrame) {
    clients.retain(|c| c.tx.try_send(frame.clone()).is_ok());
}

/// Keyed collection of Hubs, one per live or recently-live session.
pub struct HubManager {
    hubs: DashMap<String, Arc<Hub>>,
    registry: Arc<Registry>,
    scrollback_capacity: usize,
}

impl HubManager {
    pub fn new(registry: Arc<Registry>, scrollback_capacity: usize) -> Self {
        Self {
            hubs: DashMap::new(),
            registry,
            scrollback_capacity,
        }
    }

    pub fn get_or_create(&self, session_id: &str, spec: SessionSpec) -> Arc<Hub> {
        self.hubs
            .entry(session_id.to_string())
            .or_insert_with(|| Hub::new(session_id.to_string(), spec, Arc::clone(&self.registry), self.scrollback_capacity))
            .clone()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Hub>> {
        self.hubs.get(session_id).map(|h| h.clone())
    }

    pub fn remove(&self, session_id: &str) {
        self.hubs.remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BackendKind, SessionKind};
    use std::path::PathBuf;

    fn spec() -> SessionSpec {
        SessionSpec {
            kind: SessionKind::Shell,
            backend: BackendKind::DirectPty,
            mux_name: String::new(),
            workspace_path: PathBuf::from("/tmp"),
            agent_args: vec![],
            agent_resume_id: None,
            cols: 80,
            rows: 24,
        }
    }

    #[tokio::test]
    async fn unsubscribe_last_client_goes_idle_not_dead() {
        let registry = Arc::new(Registry::open_in_memory().unwrap());
        let hub = Hub::new("s1".into(), spec(), registry, 10_000);
        let (tx, _rx) = mpsc::channel(16);
        let (id, _replay) = {
            // Bypass attach (no real PTY in unit tests) by poking state directly.
            let mut guard = hub.inner.lock().await;
            guard.state = HubState::Live;
            let id = guard.next_client_id;
            guard.next_client_id += 1;
            guard.clients.push(Subscriber { id, tx, is_preview: false });
            (id, None::<Vec<u8>>)
        };
        let dead = hub.unsubscribe(id).await;
        assert!(!dead);
        assert_eq!(hub.state().await, HubState::Idle);
    }

    #[tokio::test]
    async fn resize_arbitration_prefers_non_preview() {
        let registry = Arc::new(Registry::open_in_memory().unwrap());
        let hub = Hub::new("s1".into(), spec(), registry, 10_000);
        let (full_tx, mut full_rx) = mpsc::channel(16);
        let (prev_tx, mut prev_rx) = mpsc::channel(16);
        {
            let mut guard = hub.inner.lock().await;
            guard.size = (80, 24);
            guard.clients.push(Subscriber { id: 1, tx: full_tx, is_preview: false });
            guard.clients.push(Subscriber { id: 2, tx: prev_tx, is_preview: true });
        }
        // Preview's resize is suppressed because a full subscriber exists;
        // only the preview requester gets an ack, at the unchanged size.
        hub.resize(2, true, 40, 10).await;
        {
            let guard = hub.inner.lock().await;
            assert_eq!(guard.size, (80, 24));
        }
        match prev_rx.try_recv().unwrap() {
            OutboundFrame::Resized { cols, rows } => assert_eq!((cols, rows), (80, 24)),
            _ => panic!("expected resized ack"),
        }
        assert!(full_rx.try_recv().is_err());
    }

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let mut ring = ScrollbackRing::new(2);
        ring.push(b"a".to_vec());
        ring.push(b"b".to_vec());
        ring.push(b"c".to_vec());
        assert_eq!(ring.replay(), b"bc".to_vec());
    }
}
