//! Error taxonomy. Each subsystem gets its own `thiserror` enum so
//! callers can match on the failure shape instead of string-matching.

#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenFailed(String),
    #[error("failed to spawn command: {0}")]
    SpawnFailed(String),
    #[error("io error: {0}")]
    Io(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Pty(#[from] PtyError),
    #[error("multiplexer unavailable")]
    MultiplexerUnavailable,
    #[error("multiplexer command failed: {0}")]
    MultiplexerFailed(String),
    #[error("controller already stopped")]
    AlreadyStopped,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("mux_name already in use: {0}")]
    DuplicateMuxName(String),
    #[error("database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for RegistryError {
    fn from(e: rusqlite::Error) -> Self {
        RegistryError::Database(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("hub is terminating")]
    Terminating,
}
