//! Shared process state handed to every HTTP/WS handler: the durable
//! Registry, the in-memory HubManager, and the transient per-session spawn
//! arguments the durable schema deliberately doesn't persist.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use common::backend::SessionSpec;
use common::config::Config;
use common::hub::HubManager;
use common::registry::Registry;
use common::types::Session;
use dashmap::DashMap;

/// Default viewport a session's backend is spawned at before any subscriber
/// has stated a real preference; the first subscriber's resize immediately
/// corrects this via the Hub's arbitration rule.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// `agent_args` is accepted by the Create RPC but has no column in the
/// durable schema, which persists only `agent_resume_id`: it only matters
/// for the very first spawn of an agent-kind session, and a restarted SM
/// has no live `direct_pty` process to resume into. Kept in-memory, lost on
/// restart along with the processes it would have respawned.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub hubs: Arc<HubManager>,
    pub config: &'static Config,
    pub agent_args: Arc<DashMap<String, Vec<String>>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(registry: Arc<Registry>, config: &'static Config) -> Self {
        let hubs = Arc::new(HubManager::new(Arc::clone(&registry), config.scrollback_capacity));
        Self {
            registry,
            hubs,
            config,
            agent_args: Arc::new(DashMap::new()),
            started_at: Instant::now(),
        }
    }

    /// Build the `SessionSpec` the Backend Adapter needs to (re)start a
    /// session's Controller, from its durable row plus whatever transient
    /// agent args this process still remembers for it.
    pub fn spec_for(&self, session: &Session, cols: u16, rows: u16) -> SessionSpec {
        let agent_args = self
            .agent_args
            .get(session.id.as_str())
            .map(|v| v.clone())
            .unwrap_or_default();
        SessionSpec {
            kind: session.kind,
            backend: session.backend,
            mux_name: session.mux_name.clone(),
            workspace_path: PathBuf::from(&session.workspace_path),
            agent_args,
            agent_resume_id: session.agent_resume_id.clone(),
            cols,
            rows,
        }
    }
}
