use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use gatehouse_types::{GatewayError, RunOptions, TaskRecord, TaskStatus};

use crate::session_store::owner_fingerprint;
use crate::Database;

/// Terminal rows older than this are swept.
const TASK_RETENTION: Duration = Duration::from_secs(3600);

/// Persistent record of long-running background jobs plus the in-memory
/// cancellation handles for the ones currently executing.
#[derive(Clone)]
pub struct TaskStore {
    db: Database,
    cancels: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl TaskStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            cancels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Insert a `running` row and hand back its cancellation token.
    pub async fn create(
        &self,
        options: &RunOptions,
        session_id: Option<&str>,
        credential: &str,
    ) -> Result<(TaskRecord, CancellationToken), GatewayError> {
        let now = Utc::now();
        let record = TaskRecord {
            id: Uuid::new_v4().to_string(),
            owner_fingerprint: owner_fingerprint(credential),
            status: TaskStatus::Running,
            options: options.clone(),
            session_id: session_id.map(str::to_string),
            result: None,
            failure_reason: None,
            upstream_session_id: None,
            created_at: now,
            started_at: Some(now),
            completed_at: None,
            duration_ms: None,
        };

        let allowed_tools = record
            .options
            .allowed_tools
            .as_ref()
            .map(|tools| serde_json::to_string(tools))
            .transpose()
            .map_err(|err| GatewayError::internal(format!("task options encoding: {err}")))?;

        {
            let conn = self.db.conn().await;
            conn.execute(
                "INSERT INTO tasks (id, status, owner_fingerprint, prompt, model, allowed_tools,
                                    working_directory, session_id, max_turns, created_at, started_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    record.id,
                    record.status.as_str(),
                    record.owner_fingerprint,
                    record.options.prompt,
                    record.options.model,
                    allowed_tools,
                    record.options.working_directory,
                    record.session_id,
                    record.options.max_turns,
                    record.created_at.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )
            .map_err(db_error)?;
        }

        let token = CancellationToken::new();
        self.cancels
            .lock()
            .await
            .insert(record.id.clone(), token.clone());

        Ok((record, token))
    }

    pub async fn get(&self, id: &str, credential: &str) -> Result<TaskRecord, GatewayError> {
        let fingerprint = owner_fingerprint(credential);
        let conn = self.db.conn().await;
        conn.query_row(
            &format!("{SELECT_TASK} WHERE id = ?1 AND owner_fingerprint = ?2"),
            params![id, fingerprint],
            row_to_task,
        )
        .optional()
        .map_err(db_error)?
        .ok_or_else(GatewayError::task_not_found)
    }

    pub async fn list(&self, credential: &str) -> Result<Vec<TaskRecord>, GatewayError> {
        let fingerprint = owner_fingerprint(credential);
        let conn = self.db.conn().await;
        let mut stmt = conn
            .prepare(&format!(
                "{SELECT_TASK} WHERE owner_fingerprint = ?1 ORDER BY created_at DESC"
            ))
            .map_err(db_error)?;
        let tasks = stmt
            .query_map(params![fingerprint], row_to_task)
            .map_err(db_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_error)?;
        Ok(tasks)
    }

    /// Terminal transition for a successful execution. Returns false when the
    /// row is absent or already terminal (for example a cancel won the race).
    pub async fn set_completed(
        &self,
        id: &str,
        result: &str,
        upstream_session_id: Option<&str>,
    ) -> Result<bool, GatewayError> {
        self.finish(
            id,
            TaskStatus::Completed,
            Some(result),
            None,
            upstream_session_id,
        )
        .await
    }

    /// Terminal transition for a failed execution.
    pub async fn set_failed(&self, id: &str, reason: &str) -> Result<bool, GatewayError> {
        self.finish(id, TaskStatus::Failed, None, Some(reason), None).await
    }

    async fn finish(
        &self,
        id: &str,
        status: TaskStatus,
        result: Option<&str>,
        failure_reason: Option<&str>,
        upstream_session_id: Option<&str>,
    ) -> Result<bool, GatewayError> {
        let completed_at = Utc::now();
        let changed = {
            let conn = self.db.conn().await;
            let started_at: Option<Option<String>> = conn
                .query_row(
                    "SELECT started_at FROM tasks WHERE id = ?1 AND status = 'running'",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(db_error)?;
            let Some(started_at) = started_at else {
                return Ok(false);
            };

            let duration_ms = started_at
                .as_deref()
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|started| (completed_at - started.with_timezone(&Utc)).num_milliseconds());

            conn.execute(
                "UPDATE tasks
                 SET status = ?1, result = ?2, failure_reason = ?3, upstream_session_id = ?4,
                     completed_at = ?5, duration_ms = ?6
                 WHERE id = ?7 AND status = 'running'",
                params![
                    status.as_str(),
                    result,
                    failure_reason,
                    upstream_session_id,
                    completed_at.to_rfc3339(),
                    duration_ms,
                    id,
                ],
            )
            .map_err(db_error)?
        };

        self.cancels.lock().await.remove(id);
        Ok(changed > 0)
    }

    /// Fire the task's cancellation handle and record the terminal state.
    /// False when the task is unknown or already terminal.
    pub async fn cancel(&self, id: &str) -> Result<bool, GatewayError> {
        let token = self.cancels.lock().await.get(id).cloned();
        let Some(token) = token else {
            return Ok(false);
        };
        token.cancel();
        self.set_failed(id, "cancelled").await
    }

    /// Startup recovery: every persisted `running` row belongs to a previous
    /// process and can never complete. Must run before new work is admitted.
    pub async fn mark_orphaned_failed(&self) -> Result<usize, GatewayError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.db.conn().await;
        let rewritten = conn
            .execute(
                "UPDATE tasks
                 SET status = 'failed', failure_reason = 'server_restart', completed_at = ?1
                 WHERE status = 'running'",
                params![now],
            )
            .map_err(db_error)?;
        if rewritten > 0 {
            info!(rewritten, "recovered orphaned running tasks as failed");
        }
        Ok(rewritten)
    }

    /// Delete terminal rows older than the retention window.
    pub async fn sweep_terminal(&self) -> Result<usize, GatewayError> {
        let cutoff = (Utc::now()
            - chrono::Duration::from_std(TASK_RETENTION)
                .map_err(|err| GatewayError::internal(format!("invalid retention: {err}")))?)
        .to_rfc3339();
        let conn = self.db.conn().await;
        let deleted = conn
            .execute(
                "DELETE FROM tasks
                 WHERE status IN ('completed', 'failed') AND completed_at < ?1",
                params![cutoff],
            )
            .map_err(db_error)?;
        Ok(deleted)
    }

    pub fn spawn_sweeper(
        &self,
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
                    _ = ticker.tick() => match store.sweep_terminal().await {
                        Ok(0) => {}
                        Ok(deleted) => info!(deleted, "task sweep removed terminal rows"),
                        Err(err) => warn!(%err, "task sweep failed"),
                    },
                }
            }
        })
    }
}

const SELECT_TASK: &str = "SELECT id, status, owner_fingerprint, prompt, model, allowed_tools,
        working_directory, session_id, max_turns, result, failure_reason,
        upstream_session_id, created_at, started_at, completed_at, duration_ms
 FROM tasks";

fn row_to_task(row: &Row<'_>) -> Result<TaskRecord, rusqlite::Error> {
    let status_raw: String = row.get(1)?;
    let status = TaskStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown task status `{status_raw}`").into(),
        )
    })?;

    let allowed_tools: Option<String> = row.get(5)?;
    let allowed_tools = allowed_tools
        .filter(|raw| !raw.is_empty())
        .and_then(|raw| serde_json::from_str(&raw).ok());

    Ok(TaskRecord {
        id: row.get(0)?,
        status,
        owner_fingerprint: row.get(2)?,
        options: RunOptions {
            prompt: row.get(3)?,
            model: row.get(4)?,
            allowed_tools,
            working_directory: row.get(6)?,
            resume_session_id: None,
            max_turns: row.get(8)?,
            stream: false,
            timeout_ms: None,
        },
        session_id: row.get(7)?,
        result: row.get(9)?,
        failure_reason: row.get(10)?,
        upstream_session_id: row.get(11)?,
        created_at: parse_timestamp(row, 12)?,
        started_at: parse_opt_timestamp(row, 13)?,
        completed_at: parse_opt_timestamp(row, 14)?,
        duration_ms: row.get(15)?,
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

fn parse_opt_timestamp(
    row: &Row<'_>,
    index: usize,
) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    let raw: Option<String> = row.get(index)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    index,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })
    })
    .transpose()
}

fn db_error(err: rusqlite::Error) -> GatewayError {
    GatewayError::internal(format!("task store error: {err}"))
}
