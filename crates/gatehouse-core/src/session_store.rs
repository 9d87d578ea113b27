use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use gatehouse_types::{GatewayError, Session};

use crate::Database;

/// SHA-256 hex digest of a caller credential. This is the only form in which
/// credentials ever reach persistence.
pub fn owner_fingerprint(credential: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credential.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStoreStats {
    pub sessions: usize,
    pub active_locks: usize,
}

/// Owner-scoped session CRUD plus the in-process per-session lock table.
/// Ownership mismatches surface as not-found so existence never leaks.
#[derive(Clone)]
pub struct SessionStore {
    db: Database,
    max_sessions_per_key: usize,
    locks: Arc<Mutex<HashMap<String, VecDeque<oneshot::Sender<()>>>>>,
}

impl SessionStore {
    pub fn new(db: Database, max_sessions_per_key: usize) -> Self {
        Self {
            db,
            max_sessions_per_key: max_sessions_per_key.max(1),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Persist a fresh session for the caller. Rejects with `session_limit`
    /// when the owner already holds the configured quota.
    pub async fn create(
        &self,
        upstream_session_id: &str,
        credential: &str,
    ) -> Result<Session, GatewayError> {
        let fingerprint = owner_fingerprint(credential);
        let held = self.count_for_owner(&fingerprint).await?;
        if held >= self.max_sessions_per_key {
            return Err(GatewayError::session_limit(format!(
                "session limit of {} reached for this key",
                self.max_sessions_per_key
            )));
        }

        let session = Session {
            id: Uuid::new_v4().to_string(),
            upstream_session_id: upstream_session_id.to_string(),
            owner_fingerprint: fingerprint,
            created_at: Utc::now(),
            last_accessed_at: Utc::now(),
        };

        let conn = self.db.conn().await;
        conn.execute(
            "INSERT INTO sessions (id, upstream_session_id, owner_fingerprint, created_at, last_accessed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session.id,
                session.upstream_session_id,
                session.owner_fingerprint,
                session.created_at.to_rfc3339(),
                session.last_accessed_at.to_rfc3339(),
            ],
        )
        .map_err(db_error)?;

        Ok(session)
    }

    pub async fn get(&self, id: &str, credential: &str) -> Result<Session, GatewayError> {
        let fingerprint = owner_fingerprint(credential);
        let conn = self.db.conn().await;
        conn.query_row(
            "SELECT id, upstream_session_id, owner_fingerprint, created_at, last_accessed_at
             FROM sessions WHERE id = ?1 AND owner_fingerprint = ?2",
            params![id, fingerprint],
            row_to_session,
        )
        .optional()
        .map_err(db_error)?
        .ok_or_else(GatewayError::session_not_found)
    }

    /// Advance `last_accessed_at`, resetting the TTL clock.
    pub async fn touch(&self, id: &str) -> Result<(), GatewayError> {
        let conn = self.db.conn().await;
        conn.execute(
            "UPDATE sessions SET last_accessed_at = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )
        .map_err(db_error)?;
        Ok(())
    }

    pub async fn delete(&self, id: &str, credential: &str) -> Result<(), GatewayError> {
        let fingerprint = owner_fingerprint(credential);
        let deleted = {
            let conn = self.db.conn().await;
            conn.execute(
                "DELETE FROM sessions WHERE id = ?1 AND owner_fingerprint = ?2",
                params![id, fingerprint],
            )
            .map_err(db_error)?
        };
        if deleted == 0 {
            return Err(GatewayError::session_not_found());
        }
        self.purge_lock(id);
        Ok(())
    }

    pub async fn list(&self, credential: &str) -> Result<Vec<Session>, GatewayError> {
        let fingerprint = owner_fingerprint(credential);
        let conn = self.db.conn().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, upstream_session_id, owner_fingerprint, created_at, last_accessed_at
                 FROM sessions WHERE owner_fingerprint = ?1
                 ORDER BY last_accessed_at DESC",
            )
            .map_err(db_error)?;
        let sessions = stmt
            .query_map(params![fingerprint], row_to_session)
            .map_err(db_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_error)?;
        Ok(sessions)
    }

    pub async fn count_for_owner(&self, fingerprint: &str) -> Result<usize, GatewayError> {
        let conn = self.db.conn().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sessions WHERE owner_fingerprint = ?1",
                params![fingerprint],
                |row| row.get(0),
            )
            .map_err(db_error)?;
        Ok(count as usize)
    }

    pub async fn stats(&self) -> Result<SessionStoreStats, GatewayError> {
        let sessions: i64 = {
            let conn = self.db.conn().await;
            conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))
                .map_err(db_error)?
        };
        let active_locks = self.locks.lock().len();
        Ok(SessionStoreStats {
            sessions: sessions as usize,
            active_locks,
        })
    }

    /// Take the per-session mutex. Returns immediately when the session is
    /// unheld; otherwise the caller joins a strict-FIFO waiter queue. The
    /// lock is advisory: callers must pair every acquire with a release on
    /// all exit paths. Release is synchronous so callers can run it from a
    /// drop guard.
    pub async fn acquire(&self, id: &str) {
        let rx = {
            let mut locks = self.locks.lock();
            match locks.entry(id.to_string()) {
                Entry::Vacant(entry) => {
                    entry.insert(VecDeque::new());
                    return;
                }
                Entry::Occupied(mut entry) => {
                    let (tx, rx) = oneshot::channel();
                    entry.get_mut().push_back(tx);
                    rx
                }
            }
        };
        // An Err here means the entry was purged (session deleted); the lock
        // no longer guards anything, so proceed.
        let _ = rx.await;
    }

    /// Hand the lock to the first live waiter, or unlock entirely.
    pub fn release(&self, id: &str) {
        let mut locks = self.locks.lock();
        let Some(queue) = locks.get_mut(id) else {
            return;
        };
        while let Some(waiter) = queue.pop_front() {
            if waiter.send(()).is_ok() {
                // ownership transferred
                return;
            }
        }
        locks.remove(id);
    }

    fn purge_lock(&self, id: &str) {
        // Dropping the queue wakes every waiter at once; the session is gone,
        // so exclusivity no longer matters.
        self.locks.lock().remove(id);
    }

    /// Delete sessions idle past `ttl` and purge their lock entries.
    /// Returns the number of rows removed.
    pub async fn sweep_expired(&self, ttl: Duration) -> Result<usize, GatewayError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(ttl)
                .map_err(|err| GatewayError::internal(format!("invalid session TTL: {err}")))?;
        let cutoff = cutoff.to_rfc3339();

        let expired: Vec<String> = {
            let conn = self.db.conn().await;
            let mut stmt = conn
                .prepare("SELECT id FROM sessions WHERE last_accessed_at < ?1")
                .map_err(db_error)?;
            let ids = stmt
                .query_map(params![cutoff], |row| row.get(0))
                .map_err(db_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_error)?;
            if !ids.is_empty() {
                conn.execute(
                    "DELETE FROM sessions WHERE last_accessed_at < ?1",
                    params![cutoff],
                )
                .map_err(db_error)?;
            }
            ids
        };

        for id in &expired {
            self.purge_lock(id);
        }
        Ok(expired.len())
    }

    /// Recurring TTL sweep until shutdown.
    pub fn spawn_sweeper(
        &self,
        ttl: Duration,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => match store.sweep_expired(ttl).await {
                        Ok(0) => {}
                        Ok(deleted) => info!(deleted, "session sweep removed expired sessions"),
                        Err(err) => warn!(%err, "session sweep failed"),
                    },
                }
            }
        })
    }
}

fn row_to_session(row: &Row<'_>) -> Result<Session, rusqlite::Error> {
    Ok(Session {
        id: row.get(0)?,
        upstream_session_id: row.get(1)?,
        owner_fingerprint: row.get(2)?,
        created_at: parse_timestamp(row, 3)?,
        last_accessed_at: parse_timestamp(row, 4)?,
    })
}

fn parse_timestamp(row: &Row<'_>, index: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    let raw: String = row.get(index)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                index,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })
}

fn db_error(err: rusqlite::Error) -> GatewayError {
    GatewayError::internal(format!("session store error: {err}"))
}
