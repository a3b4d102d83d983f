//! PTY Driver. Owns the raw `portable-pty` plumbing: opening a
//! pty, spawning either a bare command or a multiplexer attach command
//! inside it, and bridging stdin/stdout/resize/exit across blocking OS
//! threads into async channels the rest of the fabric can await on.
//!
//! Kept deliberately free of any notion of "session" or "tool" — that
//! belongs to `backend` (4.B), which is the only caller of this module.

use crate::error::PtyError;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{self, Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

/// What `on_exit` reports. Platform-specific "console detached" codes are
/// normalized to `Detached` here so nothing above this module ever sees a
/// raw OS exit code for a kill it asked for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitEvent {
    Exited(u32),
    Detached,
}

/// Sender used to push resize requests (cols, rows) to the dedicated resize
/// thread. Synchronous because resize is fire-and-forget from async code.
pub type ResizeSender = sync::mpsc::Sender<(u16, u16)>;

/// Handle to one spawned PTY. `data_rx` and `exit_rx` are each consumed
/// exactly once by the owning `backend::Controller`.
pub struct PtyHandle {
    pub data_rx: mpsc::Receiver<Vec<u8>>,
    pub exit_rx: oneshot::Receiver<ExitEvent>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    resize_tx: ResizeSender,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    killed: Arc<AtomicBool>,
}

fn base_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

#[cfg(unix)]
fn inject_term_env(cmd: &mut CommandBuilder) {
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
}

#[cfg(windows)]
fn inject_term_env(cmd: &mut CommandBuilder) {
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
}

/// Spawn `cmd args...` inside a fresh PTY, in `cwd` with `env` merged on top
/// of the child's inherited environment.
pub fn spawn(
    cmd: &str,
    args: &[String],
    cwd: Option<&Path>,
    env: &HashMap<String, String>,
    cols: u16,
    rows: u16,
) -> Result<PtyHandle, PtyError> {
    let mut builder = CommandBuilder::new(cmd);
    for arg in args {
        builder.arg(arg);
    }
    if let Some(dir) = cwd {
        builder.cwd(dir);
    }
    inject_term_env(&mut builder);
    for (k, v) in env {
        builder.env(k, v);
    }
    run(builder, cols, rows)
}

/// Spawn the multiplexer's attach command (attach-or-create) inside a PTY.
/// `detach_others` maps to `tmux attach -d` vs plain `attach`, matching the
/// teacher's `tmux_detach_others` setting.
pub fn attach_mux(
    mux_name: &str,
    cwd: Option<&Path>,
    detach_others: bool,
    cols: u16,
    rows: u16,
) -> Result<PtyHandle, PtyError> {
    let mut builder = CommandBuilder::new("tmux");
    builder.arg("new-session");
    builder.arg("-A");
    if detach_others {
        builder.arg("-d");
    }
    builder.arg("-s");
    builder.arg(mux_name);
    if let Some(dir) = cwd {
        builder.arg("-c");
        builder.arg(dir);
    }
    // A nested tmux complains about "sessions should be nested with care";
    // unset TMUX so attaching from inside another session doesn't trip it.
    builder.env_remove("TMUX");
    inject_term_env(&mut builder);
    run(builder, cols, rows)
}

fn run(builder: CommandBuilder, cols: u16, rows: u16) -> Result<PtyHandle, PtyError> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(base_size(cols, rows))
        .map_err(|e| PtyError::OpenFailed(e.to_string()))?;

    let child = pair
        .slave
        .spawn_command(builder)
        .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
    drop(pair.slave);

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| PtyError::Io(e.to_string()))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| PtyError::Io(e.to_string()))?;
    let master = pair.master;

    let (data_tx, data_rx) = mpsc::channel::<Vec<u8>>(256);
    let (resize_tx, resize_rx) = sync::mpsc::channel::<(u16, u16)>();
    let (exit_tx, exit_rx) = oneshot::channel::<ExitEvent>();

    let child = Arc::new(Mutex::new(child));
    let killed = Arc::new(AtomicBool::new(false));

    // Reader thread: delivers byte chunks to the async side in arrival order.
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if data_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // Resize thread: best-effort; failures are not surfaced to the caller.
    std::thread::spawn(move || {
        while let Ok((cols, rows)) = resize_rx.recv() {
            let _ = master.resize(base_size(cols, rows));
        }
    });

    // Exit thread: polls try_wait() and reports exactly once, regardless of
    // whether the caller ever reads the data channel to EOF.
    let child_poll = Arc::clone(&child);
    let killed_poll = Arc::clone(&killed);
    std::thread::spawn(move || {
        let event = loop {
            let status = {
                let mut guard = match child_poll.lock() {
                    Ok(g) => g,
                    Err(_) => break ExitEvent::Detached,
                };
                guard.try_wait()
            };
            match status {
                Ok(None) => std::thread::sleep(std::time::Duration::from_millis(200)),
                Ok(Some(_)) if killed_poll.load(Ordering::SeqCst) => break ExitEvent::Detached,
                Ok(Some(status)) => break ExitEvent::Exited(status.exit_code()),
                Err(_) => break ExitEvent::Detached,
            }
        };
        let _ = exit_tx.send(event);
    });

    Ok(PtyHandle {
        data_rx,
        exit_rx,
        writer: Arc::new(Mutex::new(writer)),
        resize_tx,
        child,
        killed,
    })
}

impl PtyHandle {
    /// Best-effort resize; failure is logged by the caller, never raised.
    pub fn resize(&self, cols: u16, rows: u16) {
        let _ = self.resize_tx.send((cols, rows));
    }

    /// Enqueue input; never blocks the caller for more than a bounded time
    /// since the write goes straight to the OS pipe buffer.
    pub fn write(&self, bytes: &[u8]) -> Result<(), PtyError> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| PtyError::Io("writer mutex poisoned".into()))?;
        guard.write_all(bytes).map_err(|e| PtyError::Io(e.to_string()))?;
        guard.flush().map_err(|e| PtyError::Io(e.to_string()))
    }

    /// Terminate the child and mark the upcoming exit event as a normalized
    /// detach rather than a real process exit. Idempotent.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = self.child.lock() {
            let _ = guard.kill();
        }
    }

    /// Split into the raw channels (consumed once by a bridge task) and an
    /// `PtyIo` handle retaining write/resize/kill, so callers that need to
    /// hand the channels to a separate task aren't forced to keep the whole
    /// struct alive under a lock.
    pub fn into_parts(self) -> (mpsc::Receiver<Vec<u8>>, oneshot::Receiver<ExitEvent>, PtyIo) {
        let io = PtyIo {
            writer: self.writer,
            resize_tx: self.resize_tx,
            child: self.child,
            killed: self.killed,
        };
        (self.data_rx, self.exit_rx, io)
    }
}

/// The operable half of a `PtyHandle` once its channels have been taken by a
/// bridge task.
pub struct PtyIo {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    resize_tx: ResizeSender,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    killed: Arc<AtomicBool>,
}

impl PtyIo {
    pub fn resize(&self, cols: u16, rows: u16) {
        let _ = self.resize_tx.send((cols, rows));
    }

    pub fn write(&self, bytes: &[u8]) -> Result<(), PtyError> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| PtyError::Io("writer mutex poisoned".into()))?;
        guard.write_all(bytes).map_err(|e| PtyError::Io(e.to_string()))?;
        guard.flush().map_err(|e| PtyError::Io(e.to_string()))
    }

    pub fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = self.child.lock() {
            let _ = guard.kill();
        }
    }
}

/// List active multiplexer sessions whose name carries `prefix` (name only).
/// Empty if the multiplexer binary is missing or no sessions exist.
pub fn list_mux_sessions(prefix: &str) -> Vec<String> {
    let output = std::process::Command::new("tmux")
        .args(["list-sessions", "-F", "#{session_name}"])
        .output();
    match output {
        Ok(o) if o.status.success() => String::from_utf8_lossy(&o.stdout)
            .lines()
            .filter(|l| !l.is_empty() && l.starts_with(prefix))
            .map(str::to_string)
            .collect(),
        _ => vec![],
    }
}

/// Whether the multiplexer binary is available on this host.
pub fn mux_available() -> bool {
    std::process::Command::new("tmux")
        .arg("-V")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Best-effort cwd of a live multiplexer session's active pane, used by the
/// reconciler to synthesize `workspace_path` for adopted orphans.
pub fn mux_session_cwd(mux_name: &str) -> Option<String> {
    let output = std::process::Command::new("tmux")
        .args(["display-message", "-p", "-t", mux_name, "#{pane_current_path}"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if path.is_empty() {
        None
    } else {
        Some(path)
    }
}

/// Kill a live multiplexer session by name. Idempotent: missing session is
/// not an error.
pub fn kill_mux_session(mux_name: &str) {
    let _ = std::process::Command::new("tmux")
        .args(["kill-session", "-t", mux_name])
        .output();
}
