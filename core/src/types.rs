//! Session data model. Plain data only; behavior lives in
//! `registry` (durable storage) and `hub` (live fan-out).

use serde::{Deserialize, Serialize};

/// Opaque, globally unique, restart-stable session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// `shell` vs `agent` — agent differs only in the command line launched in the PTY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Shell,
    Agent,
}

impl Default for SessionKind {
    fn default() -> Self {
        Self::Shell
    }
}

/// How the session's PTY is backed: a bare spawned process, or a detachable
/// multiplexer session that a PTY attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    DirectPty,
    Muxed,
}

impl Default for BackendKind {
    fn default() -> Self {
        Self::DirectPty
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Idle,
    Stopped,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Idle => "idle",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "idle" => Some(Self::Idle),
            "stopped" => Some(Self::Stopped),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// The primary entity. `created_at`/`last_activity` are Unix
/// timestamps (seconds, UTC) to keep the registry's wire format simple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub workspace_path: String,
    pub kind: SessionKind,
    pub backend: BackendKind,
    /// For `muxed`, the external multiplexer session name (unique). For
    /// `direct_pty`, an opaque label used only for display/logging.
    pub mux_name: String,
    pub status: SessionStatus,
    pub skip_permissions: bool,
    pub agent_resume_id: Option<String>,
    pub created_at: i64,
    pub last_activity: i64,
}

/// Fields accepted by the Create RPC (`POST /api/sessions`).
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionRequest {
    pub name: String,
    #[serde(rename = "workspacePath")]
    pub workspace_path: String,
    #[serde(default)]
    pub kind: Option<SessionKind>,
    #[serde(default)]
    pub backend: Option<BackendKind>,
    #[serde(rename = "skipPermissions", default)]
    pub skip_permissions: bool,
    #[serde(rename = "agentArgs", default)]
    pub agent_args: Vec<String>,
    #[serde(rename = "agentResumeId", default)]
    pub agent_resume_id: Option<String>,
}

pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
