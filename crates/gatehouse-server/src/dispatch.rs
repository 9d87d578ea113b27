use gatehouse_core::{SessionStore, Submission};
use gatehouse_types::{ErrorKind, GatewayError, RunOptions, RunResult, StreamChunk, TaskRecord};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::AppState;

pub struct DispatchOutcome {
    pub result: RunResult,
    pub session_id: Option<String>,
}

/// Releases the session lock on every exit path, including cancellation:
/// release is synchronous, so it runs even when the dispatch future is
/// dropped mid-await.
struct SessionLockGuard<'a> {
    sessions: &'a SessionStore,
    id: &'a str,
}

impl Drop for SessionLockGuard<'_> {
    fn drop(&mut self) {
        self.sessions.release(self.id);
    }
}

/// The one dispatch path every surface goes through. With a session: resolve
/// it owner-scoped, serialize on its lock, resume with the stored upstream
/// token, and touch on success. Without: run fresh and persist any upstream
/// token the CLI handed back as a new session.
pub async fn run_with_session(
    state: &AppState,
    mut options: RunOptions,
    session_id: Option<String>,
    credential: &str,
    cancel: CancellationToken,
    chunk_tx: Option<UnboundedSender<StreamChunk>>,
) -> Result<DispatchOutcome, GatewayError> {
    let request_id = Uuid::new_v4().to_string();

    match session_id {
        Some(session_id) => {
            let session = state.sessions.get(&session_id, credential).await?;
            state.sessions.acquire(&session_id).await;
            let _lock = SessionLockGuard {
                sessions: &state.sessions,
                id: &session_id,
            };

            options.resume_session_id = Some(session.upstream_session_id.clone());
            let result = state
                .pool
                .submit(Submission {
                    options,
                    chunk_tx,
                    cancel,
                    request_id,
                })
                .await?;
            state.sessions.touch(&session_id).await?;

            Ok(DispatchOutcome {
                result,
                session_id: Some(session_id.clone()),
            })
        }
        None => {
            let result = state
                .pool
                .submit(Submission {
                    options,
                    chunk_tx,
                    cancel,
                    request_id,
                })
                .await?;
            let session_id = match result.upstream_session_id.as_deref() {
                Some(upstream) => Some(state.sessions.create(upstream, credential).await?.id),
                None => None,
            };
            Ok(DispatchOutcome { result, session_id })
        }
    }
}

/// Run a dispatch in a detached task and await its outcome. When the caller
/// (an HTTP handler) is dropped on client disconnect, the task keeps driving
/// the child through the cooperative SIGTERM escalation instead of the run
/// being torn down mid-await; the caller's drop guard fires `cancel`.
pub fn spawn_dispatch(
    state: &AppState,
    options: RunOptions,
    session_id: Option<String>,
    credential: &str,
    cancel: CancellationToken,
    chunk_tx: Option<UnboundedSender<StreamChunk>>,
) -> tokio::task::JoinHandle<Result<DispatchOutcome, GatewayError>> {
    let state = state.clone();
    let credential = credential.to_string();
    tokio::spawn(async move {
        run_with_session(&state, options, session_id, &credential, cancel, chunk_tx).await
    })
}

/// Drive a background task to a terminal state. When the cancel token fired,
/// the executor exits silently: `TaskStore::cancel` already recorded it.
pub fn spawn_task(state: AppState, task: TaskRecord, cancel: CancellationToken, credential: String) {
    tokio::spawn(async move {
        let outcome = run_with_session(
            &state,
            task.options.clone(),
            task.session_id.clone(),
            &credential,
            cancel.clone(),
            None,
        )
        .await;

        match outcome {
            Ok(outcome) => {
                let _ = state
                    .tasks
                    .set_completed(
                        &task.id,
                        &outcome.result.result,
                        outcome.result.upstream_session_id.as_deref(),
                    )
                    .await;
                info!(task_id = %task.id, "background task completed");
            }
            Err(_) if cancel.is_cancelled() => {}
            Err(err) => {
                let reason = match err.kind {
                    ErrorKind::Timeout => "timeout".to_string(),
                    _ => format!("error:{}", err.message),
                };
                warn!(task_id = %task.id, code = err.code(), "background task failed");
                let _ = state.tasks.set_failed(&task.id, &reason).await;
            }
        }
    });
}
