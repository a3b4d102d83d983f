//! Reconciler. Runs once at Session Manager start, before the
//! listener accepts clients, to fold OS-visible multiplexer reality back
//! into the registry after a restart. Idempotent: running it twice in a
//! row performs no changes on the second run.

use crate::error::RegistryError;
use crate::pty;
use crate::registry::Registry;
use crate::types::{unix_now, BackendKind, Session, SessionKind, SessionStatus};
use std::time::Duration;

const RECOVERED_SUFFIX: &str = " (recovered)";
const PROBE_TIMEBOX: Duration = Duration::from_secs(5);

/// Synthesize a stable registry id from a multiplexer session name so
/// repeated adoption runs produce the same id for the same orphan.
fn synthesize_id(mux_name: &str) -> String {
    format!("mux:{mux_name}")
}

pub async fn run(registry: &Registry, mux_session_prefix: &str) -> Result<(), RegistryError> {
    mark_direct_pty_stopped(registry)?;

    if !pty::mux_available() {
        tracing::info!("multiplexer unavailable, skipping orphan/ghost reconciliation");
        return Ok(());
    }

    let prefix = mux_session_prefix.to_string();
    let live = tokio::time::timeout(PROBE_TIMEBOX, tokio::task::spawn_blocking(move || pty::list_mux_sessions(&prefix)))
        .await
        .ok()
        .and_then(Result::ok)
        .unwrap_or_default();

    adopt_orphans(registry, &live)?;
    evict_ghosts(registry, &live)?;
    clean_legacy_names(registry)?;

    Ok(())
}

/// Step 1: direct_pty sessions cannot survive an SM restart, since the
/// owning process no longer holds their PTY file descriptor.
fn mark_direct_pty_stopped(registry: &Registry) -> Result<(), RegistryError> {
    for session in registry.list()? {
        if session.backend == BackendKind::DirectPty
            && matches!(session.status, SessionStatus::Running | SessionStatus::Idle)
        {
            registry.update_status(session.id.as_str(), SessionStatus::Stopped)?;
        }
    }
    Ok(())
}

/// Step 3: a live multiplexer session with no matching registry row
/// gets a synthesized row so it becomes reattachable from the API.
fn adopt_orphans(registry: &Registry, live_mux_names: &[String]) -> Result<(), RegistryError> {
    for mux_name in live_mux_names {
        if registry.find_by_mux_name(mux_name)?.is_some() {
            continue;
        }
        let workspace_path = pty::mux_session_cwd(mux_name).unwrap_or_else(|| "/".to_string());
        let now = unix_now();
        let session = Session {
            id: synthesize_id(mux_name).into(),
            name: mux_name.clone(),
            workspace_path,
            kind: SessionKind::Shell,
            backend: BackendKind::Muxed,
            mux_name: mux_name.clone(),
            status: SessionStatus::Running,
            skip_permissions: false,
            agent_resume_id: None,
            created_at: now,
            last_activity: now,
        };
        registry.create(&session)?;
        tracing::info!(mux_name, "adopted orphaned multiplexer session");
    }
    Ok(())
}

/// Step 4: a registry row whose multiplexer target no longer exists
/// is stale and is deleted outright.
fn evict_ghosts(registry: &Registry, live_mux_names: &[String]) -> Result<(), RegistryError> {
    for session in registry.list()? {
        if session.backend != BackendKind::Muxed {
            continue;
        }
        if !live_mux_names.contains(&session.mux_name) {
            registry.delete(session.id.as_str())?;
            tracing::info!(session_id = %session.id, "evicted ghost session, multiplexer target gone");
        }
    }
    Ok(())
}

/// Step 5: strip a historical `" (recovered)"` suffix left by an older
/// reconciler generation.
fn clean_legacy_names(registry: &Registry) -> Result<(), RegistryError> {
    for session in registry.list()? {
        if let Some(stripped) = session.name.strip_suffix(RECOVERED_SUFFIX) {
            registry.rename(session.id.as_str(), stripped)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str, mux_name: &str, backend: BackendKind, status: SessionStatus) -> Session {
        Session {
            id: id.to_string().into(),
            name: "scratch".into(),
            workspace_path: "/tmp".into(),
            kind: SessionKind::Shell,
            backend,
            mux_name: mux_name.into(),
            status,
            skip_permissions: false,
            agent_resume_id: None,
            created_at: unix_now(),
            last_activity: unix_now(),
        }
    }

    #[test]
    fn direct_pty_sessions_stop_on_boot() {
        let registry = Registry::open_in_memory().unwrap();
        registry.create(&sample("s1", "", BackendKind::DirectPty, SessionStatus::Running)).unwrap();
        mark_direct_pty_stopped(&registry).unwrap();
        assert_eq!(registry.get("s1").unwrap().status, SessionStatus::Stopped);
    }

    #[test]
    fn ghosts_without_live_mux_are_deleted() {
        let registry = Registry::open_in_memory().unwrap();
        registry
            .create(&sample("s1", "tf-gone", BackendKind::Muxed, SessionStatus::Running))
            .unwrap();
        evict_ghosts(&registry, &[]).unwrap();
        assert!(matches!(registry.get("s1"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn known_mux_session_is_not_evicted() {
        let registry = Registry::open_in_memory().unwrap();
        registry
            .create(&sample("s1", "tf-alive", BackendKind::Muxed, SessionStatus::Running))
            .unwrap();
        evict_ghosts(&registry, &["tf-alive".to_string()]).unwrap();
        assert!(registry.get("s1").is_ok());
    }

    #[test]
    fn legacy_recovered_suffix_is_stripped() {
        let registry = Registry::open_in_memory().unwrap();
        let mut s = sample("s1", "tf-a", BackendKind::Muxed, SessionStatus::Running);
        s.name = "my-session (recovered)".to_string();
        registry.create(&s).unwrap();
        clean_legacy_names(&registry).unwrap();
        assert_eq!(registry.get("s1").unwrap().name, "my-session");
    }

    #[test]
    fn evict_ghosts_twice_is_idempotent() {
        let registry = Registry::open_in_memory().unwrap();
        registry
            .create(&sample("s1", "tf-gone", BackendKind::Muxed, SessionStatus::Running))
            .unwrap();
        evict_ghosts(&registry, &[]).unwrap();
        evict_ghosts(&registry, &[]).unwrap();
        assert!(registry.list().unwrap().is_empty());
    }
}
