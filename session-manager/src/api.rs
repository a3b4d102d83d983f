//! REST surface of the Session Manager API. Every response body wraps its
//! payload as `{ok, data?, error?}`.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use common::error::{BackendError, HubError, RegistryError};
use common::pty;
use common::types::{BackendKind, CreateSessionRequest, Session, SessionStatus, unix_now};

use crate::state::AppState;

#[derive(Serialize)]
pub struct Envelope<T: Serialize> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> Envelope<T> {
    fn ok(data: T) -> Self {
        Self { ok: true, data: Some(data), error: None }
    }
}

pub enum ApiError {
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        let body = Envelope::<()> { ok: false, data: None, error: Some(message) };
        (status, Json(body)).into_response()
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => ApiError::NotFound(format!("session not found: {id}")),
            RegistryError::DuplicateMuxName(name) => ApiError::Conflict(format!("mux_name already in use: {name}")),
            RegistryError::Database(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<HubError> for ApiError {
    fn from(e: HubError) -> Self {
        match e {
            HubError::NotFound(id) => ApiError::NotFound(id),
            HubError::Terminating => ApiError::Internal("hub is terminating".into()),
            HubError::Backend(b) => b.into(),
        }
    }
}

impl From<BackendError> for ApiError {
    fn from(e: BackendError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

/// `GET /api/health`.
#[derive(Serialize)]
pub struct HealthResponse {
    mux_available: bool,
    uptime_secs: u64,
}

pub async fn health(State(state): State<AppState>) -> Json<Envelope<HealthResponse>> {
    Json(Envelope::ok(HealthResponse {
        mux_available: pty::mux_available(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    }))
}

/// `POST /api/sessions`. Creates a registry row only; no PTY/multiplexer
/// process exists until the first subscriber attaches (attach-on-demand),
/// so the initial status is always `stopped`.
pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<Envelope<Session>>), ApiError> {
    let kind = req.kind.unwrap_or_default();
    let backend = req.backend.unwrap_or_default();
    let id = common::types::SessionId::new();
    let mux_name = match backend {
        BackendKind::Muxed => format!("{}{}", state.config.mux_session_prefix, id.as_str()),
        BackendKind::DirectPty => format!("direct:{}", id.as_str()),
    };
    let now = unix_now();
    let session = Session {
        id: id.clone(),
        name: req.name,
        workspace_path: req.workspace_path,
        kind,
        backend,
        mux_name,
        status: SessionStatus::Stopped,
        skip_permissions: req.skip_permissions,
        agent_resume_id: req.agent_resume_id,
        created_at: now,
        last_activity: now,
    };
    state.registry.create(&session)?;
    if !req.agent_args.is_empty() {
        state.agent_args.insert(id.as_str().to_string(), req.agent_args);
    }
    tracing::info!(session_id = %session.id, kind = ?session.kind, backend = ?session.backend, "session created");
    Ok((StatusCode::CREATED, Json(Envelope::ok(session))))
}

/// Map a live Hub's state machine position onto the durable `status`
/// column, refreshing it against live state before returning.
fn derive_status(state: common::hub::HubState) -> SessionStatus {
    use common::hub::HubState::*;
    match state {
        Attaching | Live => SessionStatus::Running,
        Idle => SessionStatus::Idle,
        Dormant | Detached | Terminating | Dead => SessionStatus::Stopped,
    }
}

async fn refresh_status(state: &AppState, session: &mut Session) {
    if let Some(hub) = state.hubs.get(session.id.as_str()) {
        let derived = derive_status(hub.state().await);
        if derived != session.status {
            let _ = state.registry.update_status(session.id.as_str(), derived);
            session.status = derived;
        }
    }
}

/// `GET /api/sessions`.
pub async fn list_sessions(State(state): State<AppState>) -> Result<Json<Envelope<Vec<Session>>>, ApiError> {
    let mut sessions = state.registry.list()?;
    for session in sessions.iter_mut() {
        refresh_status(&state, session).await;
    }
    Ok(Json(Envelope::ok(sessions)))
}

/// `GET /api/sessions/{id}`.
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<Session>>, ApiError> {
    let mut session = state.registry.get(&id)?;
    refresh_status(&state, &mut session).await;
    Ok(Json(Envelope::ok(session)))
}

/// `DELETE /api/sessions/{id}`. Idempotent: a session already gone returns
/// 404 rather than erroring, so a repeated kill never corrupts state.
/// Tears down the live Controller (mux-first kill order) before the
/// registry row is dropped.
pub async fn kill_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    let session = state.registry.get(&id)?;
    if let Some(hub) = state.hubs.get(&id) {
        hub.terminate().await;
        state.hubs.remove(&id);
    } else if session.backend == BackendKind::Muxed {
        pty::kill_mux_session(&session.mux_name);
    }
    state.registry.delete(&id)?;
    state.agent_args.remove(&id);
    tracing::info!(session_id = %id, "session killed");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct RenameRequest {
    name: String,
}

/// `PUT /api/sessions/{id}`.
pub async fn rename_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RenameRequest>,
) -> Result<Json<Envelope<Session>>, ApiError> {
    state.registry.rename(&id, &body.name)?;
    Ok(Json(Envelope::ok(state.registry.get(&id)?)))
}

/// `POST /api/sessions/{id}/reattach`. Tears down any live Controller and
/// clears the Hub so the *next* subscriber re-attaches a fresh one, keeping
/// the attach-on-demand discipline rather than spawning a
/// Controller with nobody yet connected to read it.
pub async fn reattach_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Envelope<Session>>, ApiError> {
    let _ = state.registry.get(&id)?;
    if let Some(hub) = state.hubs.get(&id) {
        hub.terminate().await;
    }
    state.hubs.remove(&id);
    state.registry.update_status(&id, SessionStatus::Stopped)?;
    tracing::info!(session_id = %id, "session marked for reattach");
    Ok(Json(Envelope::ok(state.registry.get(&id)?)))
}

#[derive(Deserialize)]
pub struct SendKeysRequest {
    keys: String,
}

/// `POST /api/sessions/{id}/send`.
pub async fn send_keys(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SendKeysRequest>,
) -> Result<StatusCode, ApiError> {
    let hub = state.hubs.get(&id).ok_or_else(|| ApiError::NotFound(id.clone()))?;
    hub.send_keys(body.keys.as_bytes()).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub struct OutputQuery {
    lines: Option<u32>,
}

#[derive(Serialize)]
pub struct OutputResponse {
    output: String,
}

/// `GET /api/sessions/{id}/output?lines=N`. Empty string when no Controller
/// is currently attached to capture from.
pub async fn session_output(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<OutputQuery>,
) -> Result<Json<Envelope<OutputResponse>>, ApiError> {
    let _ = state.registry.get(&id)?;
    let lines = query.lines.unwrap_or(200);
    let output = match state.hubs.get(&id) {
        Some(hub) => hub
            .capture(lines)
            .await
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default(),
        None => String::new(),
    };
    Ok(Json(Envelope::ok(OutputResponse { output })))
}
