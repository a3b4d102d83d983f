//! Session Registry. The durable source of truth for session
//! metadata, backed by a single SQLite connection in WAL mode. Survives
//! restarts; the Session Hub consults it to restore state and the
//! Reconciler consults/mutates it to fold multiplexer reality back in.

use crate::error::RegistryError;
use crate::types::{BackendKind, Session, SessionKind, SessionStatus};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

pub struct Registry {
    conn: Mutex<Connection>,
}

impl Registry {
    /// Open (or create) the registry file at `path`, enabling WAL mode and
    /// running schema migrations. Never truncates or deletes an existing
    /// file, `-wal`, or `-shm` sidecar — SQLite owns recovery of those.
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| RegistryError::Database(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory registry for tests; same schema, no file on disk.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn create(&self, session: &Session) -> Result<(), RegistryError> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        let result = conn.execute(
            "INSERT INTO sessions
                (id, name, workspace_path, kind, backend, mux_name, status,
                 skip_permissions, agent_resume_id, created_at, last_activity)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                session.id.as_str(),
                session.name,
                session.workspace_path,
                kind_str(session.kind),
                backend_str(session.backend),
                session.mux_name,
                session.status.as_str(),
                session.skip_permissions,
                session.agent_resume_id,
                session.created_at,
                session.last_activity,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(RegistryError::DuplicateMuxName(session.mux_name.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, id: &str) -> Result<Session, RegistryError> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        conn.query_row("SELECT * FROM sessions WHERE id = ?1", params![id], row_to_session)
            .optional()?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn find_by_mux_name(&self, mux_name: &str) -> Result<Option<Session>, RegistryError> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        Ok(conn
            .query_row(
                "SELECT * FROM sessions WHERE mux_name = ?1",
                params![mux_name],
                row_to_session,
            )
            .optional()?)
    }

    pub fn list(&self) -> Result<Vec<Session>, RegistryError> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        let mut stmt = conn.prepare("SELECT * FROM sessions ORDER BY created_at ASC")?;
        let rows = stmt.query_map([], row_to_session)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn update_status(&self, id: &str, status: SessionStatus) -> Result<(), RegistryError> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        let n = conn.execute(
            "UPDATE sessions SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        if n == 0 {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Bump `last_activity`. Callers coalesce these themselves (at most once
    /// per second per session) — this call is unconditional.
    pub fn update_activity(&self, id: &str, at: i64) -> Result<(), RegistryError> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        let n = conn.execute("UPDATE sessions SET last_activity = ?1 WHERE id = ?2", params![at, id])?;
        if n == 0 {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn rename(&self, id: &str, name: &str) -> Result<(), RegistryError> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        let n = conn.execute("UPDATE sessions SET name = ?1 WHERE id = ?2", params![name, id])?;
        if n == 0 {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<(), RegistryError> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        let n = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// Flush WAL content into the main database file. Call on graceful
    /// shutdown; not required for correctness, only for tidy checkpoints.
    pub fn checkpoint(&self) -> Result<(), RegistryError> {
        let conn = self.conn.lock().expect("registry mutex poisoned");
        conn.pragma_update(None, "wal_checkpoint", "TRUNCATE")?;
        Ok(())
    }
}

fn kind_str(kind: SessionKind) -> &'static str {
    match kind {
        SessionKind::Shell => "shell",
        SessionKind::Agent => "agent",
    }
}

fn parse_kind(s: &str) -> SessionKind {
    match s {
        "agent" => SessionKind::Agent,
        _ => SessionKind::Shell,
    }
}

fn backend_str(backend: BackendKind) -> &'static str {
    match backend {
        BackendKind::DirectPty => "direct_pty",
        BackendKind::Muxed => "muxed",
    }
}

fn parse_backend(s: &str) -> BackendKind {
    match s {
        "muxed" => BackendKind::Muxed,
        _ => BackendKind::DirectPty,
    }
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    let status_str: String = row.get("status")?;
    Ok(Session {
        id: row.get::<_, String>("id")?.into(),
        name: row.get("name")?,
        workspace_path: row.get("workspace_path")?,
        kind: parse_kind(&row.get::<_, String>("kind")?),
        backend: parse_backend(&row.get::<_, String>("backend")?),
        mux_name: row.get("mux_name")?,
        status: SessionStatus::parse(&status_str).unwrap_or(SessionStatus::Error),
        skip_permissions: row.get("skip_permissions")?,
        agent_resume_id: row.get("agent_resume_id")?,
        created_at: row.get("created_at")?,
        last_activity: row.get("last_activity")?,
    })
}

/// Additive-only schema migrations. Every `ALTER TABLE ADD COLUMN` absorbs
/// "duplicate column" so re-running against an already-migrated database is
/// a no-op rather than an error.
fn migrate(conn: &Connection) -> Result<(), RegistryError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
            id                TEXT PRIMARY KEY,
            name              TEXT NOT NULL,
            workspace_path    TEXT NOT NULL,
            kind              TEXT NOT NULL,
            backend           TEXT NOT NULL,
            mux_name          TEXT NOT NULL,
            status            TEXT NOT NULL,
            skip_permissions  INTEGER NOT NULL DEFAULT 0,
            created_at        INTEGER NOT NULL,
            last_activity     INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_mux_name
            ON sessions(mux_name) WHERE mux_name != '';",
    )?;
    add_column_if_missing(conn, "sessions", "agent_resume_id", "TEXT")?;
    Ok(())
}

fn add_column_if_missing(conn: &Connection, table: &str, column: &str, decl: &str) -> Result<(), RegistryError> {
    let sql = format!("ALTER TABLE {table} ADD COLUMN {column} {decl}");
    match conn.execute(&sql, []) {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(_, Some(msg))) if msg.contains("duplicate column") => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::unix_now;

    fn sample(id: &str, mux_name: &str) -> Session {
        Session {
            id: id.to_string().into(),
            name: "scratch".into(),
            workspace_path: "/tmp/scratch".into(),
            kind: SessionKind::Shell,
            backend: BackendKind::Muxed,
            mux_name: mux_name.into(),
            status: SessionStatus::Running,
            skip_permissions: false,
            agent_resume_id: None,
            created_at: unix_now(),
            last_activity: unix_now(),
        }
    }

    #[test]
    fn create_then_get_round_trips() {
        let reg = Registry::open_in_memory().unwrap();
        let s = sample("s1", "tf-s1");
        reg.create(&s).unwrap();
        let got = reg.get("s1").unwrap();
        assert_eq!(got.name, "scratch");
        assert_eq!(got.mux_name, "tf-s1");
    }

    #[test]
    fn duplicate_mux_name_rejected() {
        let reg = Registry::open_in_memory().unwrap();
        reg.create(&sample("s1", "tf-dup")).unwrap();
        let err = reg.create(&sample("s2", "tf-dup")).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateMuxName(_)));
    }

    #[test]
    fn update_status_and_activity() {
        let reg = Registry::open_in_memory().unwrap();
        reg.create(&sample("s1", "tf-s1")).unwrap();
        reg.update_status("s1", SessionStatus::Idle).unwrap();
        reg.update_activity("s1", 42).unwrap();
        let got = reg.get("s1").unwrap();
        assert_eq!(got.status, SessionStatus::Idle);
        assert_eq!(got.last_activity, 42);
    }

    #[test]
    fn missing_session_is_not_found() {
        let reg = Registry::open_in_memory().unwrap();
        assert!(matches!(reg.get("nope"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn migrate_twice_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
    }

    #[test]
    fn delete_removes_row() {
        let reg = Registry::open_in_memory().unwrap();
        reg.create(&sample("s1", "tf-s1")).unwrap();
        reg.delete("s1").unwrap();
        assert!(matches!(reg.get("s1"), Err(RegistryError::NotFound(_))));
    }

    /// On-disk WAL + checkpoint round trip: never delete WAL/recovery files
    /// on open, and checkpoint on close. Opens the same file twice to
    /// confirm a fresh `Registry::open` never wipes state a prior instance
    /// wrote, with or without an intervening checkpoint.
    #[test]
    fn reopening_on_disk_registry_preserves_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");

        {
            let reg = Registry::open(&path).unwrap();
            reg.create(&sample("s1", "tf-s1")).unwrap();
            reg.checkpoint().unwrap();
        }
        assert!(path.exists());

        let reg = Registry::open(&path).unwrap();
        let got = reg.get("s1").unwrap();
        assert_eq!(got.mux_name, "tf-s1");

        reg.create(&sample("s2", "tf-s2")).unwrap();
        drop(reg);

        let reg = Registry::open(&path).unwrap();
        assert_eq!(reg.list().unwrap().len(), 2);
    }
}
