//! Backend Adapter. Uniform interface over the two backend
//! kinds — `direct_pty` (a bare spawned shell/agent) and `muxed` (a PTY
//! attached to a detachable external multiplexer session) — so the Session
//! Hub never has to branch on `BackendKind` itself.

use crate::error::BackendError;
use crate::pty::{self, ExitEvent, PtyIo};
use crate::types::{BackendKind, SessionKind};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// What a backend was started from, enough to `reattach` later.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    pub kind: SessionKind,
    pub backend: BackendKind,
    pub mux_name: String,
    pub workspace_path: PathBuf,
    pub agent_args: Vec<String>,
    pub agent_resume_id: Option<String>,
    pub cols: u16,
    pub rows: u16,
}

/// Events a backend emits; the Hub is the sole subscriber.
#[derive(Debug)]
pub enum ControllerEvent {
    Output(Vec<u8>),
    Detached,
    Error(String),
}

fn command_for(kind: SessionKind, agent_args: &[String], agent_resume_id: Option<&str>) -> (String, Vec<String>) {
    match kind {
        SessionKind::Shell => {
            #[cfg(unix)]
            {
                ("bash".to_string(), vec!["-l".to_string()])
            }
            #[cfg(windows)]
            {
                ("cmd.exe".to_string(), vec![])
            }
        }
        SessionKind::Agent => {
            let mut args = agent_args.to_vec();
            // agent_resume_id is passed through untouched into the child's
            // command line; it is the external agent CLI's job to interpret it.
            if let Some(resume) = agent_resume_id {
                args.push("--resume".to_string());
                args.push(resume.to_string());
            }
            ("agent".to_string(), args)
        }
    }
}

/// Handle to a live backend connection. Operations (`send_keys`, `resize`,
/// `capture`, `stop`) go through here; raw PTY events were handed off to a
/// bridge task at construction time and arrive on the paired receiver.
pub struct ControllerHandle {
    io: PtyIo,
    backend: BackendKind,
    mux_name: String,
}

/// Start a fresh backend for `spec`, returning a handle plus the channel
/// its output/lifecycle events arrive on.
pub async fn start(spec: &SessionSpec) -> Result<(ControllerHandle, mpsc::Receiver<ControllerEvent>), BackendError> {
    let handle = match spec.backend {
        BackendKind::DirectPty => {
            let (cmd, args) = command_for(spec.kind, &spec.agent_args, spec.agent_resume_id.as_deref());
            pty::spawn(&cmd, &args, Some(&spec.workspace_path), &HashMap::new(), spec.cols, spec.rows)?
        }
        BackendKind::Muxed => {
            if !pty::mux_available() {
                return Err(BackendError::MultiplexerUnavailable);
            }
            pty::attach_mux(&spec.mux_name, Some(&spec.workspace_path), true, spec.cols, spec.rows)?
        }
    };
    let (data_rx, exit_rx, io) = handle.into_parts();
    Ok(bridge(data_rx, exit_rx, io, spec.backend, spec.mux_name.clone()))
}

/// Reattach to a session: the caller must have already `stop`ped any prior
/// handle. For `direct_pty` this restarts the shell; for `muxed` it
/// reattaches the still-running multiplexer session, so scrollback inside
/// the multiplexer survives even though the Hub's own ring does not.
pub async fn reattach(spec: &SessionSpec) -> Result<(ControllerHandle, mpsc::Receiver<ControllerEvent>), BackendError> {
    start(spec).await
}

/// Spawn the task that drains the PTY's raw data/exit channels and forwards
/// them as a single `ControllerEvent` stream, then wrap the remaining I/O
/// handle for the caller to drive.
fn bridge(
    mut data_rx: mpsc::Receiver<Vec<u8>>,
    exit_rx: tokio::sync::oneshot::Receiver<ExitEvent>,
    io: PtyIo,
    backend: BackendKind,
    mux_name: String,
) -> (ControllerHandle, mpsc::Receiver<ControllerEvent>) {
    let (tx, rx) = mpsc::channel::<ControllerEvent>(256);

    tokio::spawn(async move {
        let mut exit_rx = exit_rx;
        loop {
            tokio::select! {
                biased;
                chunk = data_rx.recv() => {
                    match chunk {
                        Some(bytes) => {
                            if tx.send(ControllerEvent::Output(bytes)).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            // Data side closed; the exit side tells us whether
                            // that was a real exit or our own kill() request.
                            match (&mut exit_rx).await {
                                Ok(ExitEvent::Detached) => {
                                    let _ = tx.send(ControllerEvent::Detached).await;
                                }
                                Ok(ExitEvent::Exited(_)) => {
                                    let _ = tx.send(ControllerEvent::Detached).await;
                                }
                                Err(_) => {
                                    let _ = tx.send(ControllerEvent::Error("controller lost".into())).await;
                                }
                            }
                            break;
                        }
                    }
                }
            }
        }
    });

    (ControllerHandle { io, backend, mux_name }, rx)
}

impl ControllerHandle {
    pub fn send_keys(&self, bytes: &[u8]) -> Result<(), BackendError> {
        self.io.write(bytes).map_err(BackendError::from)
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        self.io.resize(cols, rows);
    }

    /// Best-effort text snapshot. For `muxed` backends this reads directly
    /// from the multiplexer's pane buffer; `direct_pty` backends have no
    /// out-of-band capture mechanism, so scrollback replay (owned by the
    /// Hub's ring, not this layer) is the only source of history for them.
    pub fn capture(&self, n_lines: u32) -> Vec<u8> {
        match self.backend {
            BackendKind::Muxed => {
                let start = format!("-{}", n_lines);
                std::process::Command::new("tmux")
                    .args(["capture-pane", "-p", "-S", &start, "-t", &self.mux_name])
                    .output()
                    .map(|o| o.stdout)
                    .unwrap_or_default()
            }
            BackendKind::DirectPty => Vec::new(),
        }
    }

    /// Stop the backend. For `muxed`, kills the multiplexer session first
    /// and waits ~200ms before closing the PTY, to avoid a platform-specific
    /// race where tearing down the PTY first leaves an orphan
    /// "console already detached" error on some operating systems.
    pub async fn stop(self) {
        if self.backend == BackendKind::Muxed {
            pty::kill_mux_session(&self.mux_name);
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
        self.io.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn shell_kind_ignores_agent_args() {
        let (cmd, args) = command_for(SessionKind::Shell, &["--unused".to_string()], None);
        assert_eq!(cmd, "bash");
        assert_eq!(args, vec!["-l".to_string()]);
    }

    #[test]
    fn agent_kind_appends_resume_flag() {
        let (cmd, args) = command_for(SessionKind::Agent, &["--flag".to_string()], Some("resume-123"));
        assert_eq!(cmd, "agent");
        assert_eq!(args, vec!["--flag".to_string(), "--resume".to_string(), "resume-123".to_string()]);
    }

    #[test]
    fn agent_kind_without_resume_id_omits_flag() {
        let (_, args) = command_for(SessionKind::Agent, &[], None);
        assert!(args.is_empty());
    }
}
