use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::{Mutex, MutexGuard};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handle to the single gateway database file. WAL journaling keeps
/// concurrent readers cheap while the mutex serializes the writer.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database and initialize the schema.
    pub async fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // PRAGMA journal_mode returns a row, so query_row to ignore it
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema().await?;
        Ok(db)
    }

    pub(crate) async fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    async fn init_schema(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                upstream_session_id TEXT NOT NULL,
                owner_fingerprint TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_accessed_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_sessions_owner
             ON sessions(owner_fingerprint)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL CHECK (status IN ('running','completed','failed')),
                owner_fingerprint TEXT NOT NULL,
                prompt TEXT NOT NULL,
                model TEXT,
                allowed_tools TEXT,
                working_directory TEXT,
                session_id TEXT,
                max_turns INTEGER,
                result TEXT,
                failure_reason TEXT,
                upstream_session_id TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                duration_ms INTEGER
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_owner
             ON tasks(owner_fingerprint)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_status_completed
             ON tasks(status, completed_at)",
            [],
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_initializes_schema() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open(&dir.path().join("gatehouse.sqlite"))
            .await
            .expect("open");

        let conn = db.conn().await;
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare")
            .query_map([], |row| row.get(0))
            .expect("query")
            .collect::<Result<_, _>>()
            .expect("collect");
        assert!(tables.contains(&"sessions".to_string()));
        assert!(tables.contains(&"tasks".to_string()));
    }

    #[tokio::test]
    async fn open_is_idempotent_across_restarts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gatehouse.sqlite");
        drop(Database::open(&path).await.expect("first open"));
        Database::open(&path).await.expect("second open");
    }

    #[tokio::test]
    async fn task_status_check_constraint_rejects_unknown_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::open(&dir.path().join("gatehouse.sqlite"))
            .await
            .expect("open");

        let conn = db.conn().await;
        let result = conn.execute(
            "INSERT INTO tasks (id, status, owner_fingerprint, prompt, created_at)
             VALUES ('t1', 'queued', 'f', 'p', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(result.is_err());
    }
}
