use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gatehouse_types::{GatewayError, RunOptions, RunResult, StreamChunk};

use crate::Runner;

const RETRY_DELAYS_MS: [u64; 3] = [1000, 2000, 4000];
const MAX_ATTEMPTS: u32 = 3;
const JITTER_FRACTION: f64 = 0.15;

/// One admitted unit of work: the captured options plus the runtime-only
/// companions that never touch persistence.
pub struct Submission {
    pub options: RunOptions,
    pub chunk_tx: Option<UnboundedSender<StreamChunk>>,
    pub cancel: CancellationToken,
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub outstanding: usize,
    pub running: usize,
    pub concurrency: usize,
    pub max_queue_size: usize,
    pub paused: bool,
}

/// Bounded-concurrency admission queue over the [`Runner`]. FIFO among
/// waiters, at most `concurrency` children alive, at most `max_queue_size`
/// submissions waiting for a slot.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    runner: Runner,
    concurrency: usize,
    max_queue_size: usize,
    request_timeout: Duration,
    queue_timeout: Duration,
    semaphore: Arc<Semaphore>,
    waiting: AtomicUsize,
    running: watch::Sender<usize>,
    shutting_down: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        runner: Runner,
        concurrency: usize,
        max_queue_size: usize,
        request_timeout: Duration,
        queue_timeout: Duration,
    ) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            inner: Arc::new(PoolInner {
                runner,
                concurrency,
                max_queue_size: max_queue_size.max(1),
                request_timeout,
                queue_timeout,
                semaphore: Arc::new(Semaphore::new(concurrency)),
                waiting: AtomicUsize::new(0),
                running: watch::Sender::new(0),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Submit one run. Non-streaming submissions are retried on transient
    /// failures with exponential backoff and jitter; streaming submissions
    /// fail fast so partially-delivered output is never replayed.
    pub async fn submit(&self, submission: Submission) -> Result<RunResult, GatewayError> {
        if submission.options.stream {
            return self.submit_once(&submission).await;
        }

        let mut attempt = 1;
        loop {
            if submission.cancel.is_cancelled() {
                return Err(GatewayError::aborted());
            }

            match self.submit_once(&submission).await {
                Ok(result) => {
                    if attempt > 1 {
                        info!(
                            request_id = %submission.request_id,
                            attempt,
                            "submission succeeded after retry"
                        );
                    }
                    return Ok(result);
                }
                Err(err) if attempt < MAX_ATTEMPTS && err.is_retryable() => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        request_id = %submission.request_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        code = err.code(),
                        "transient failure, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = submission.cancel.cancelled() => return Err(GatewayError::aborted()),
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn submit_once(&self, submission: &Submission) -> Result<RunResult, GatewayError> {
        let inner = &self.inner;

        if inner.shutting_down.load(Ordering::SeqCst) {
            return Err(GatewayError::cli("gateway is shutting down"));
        }

        // Admission: bound the waiter queue before touching the semaphore.
        let admitted = inner.waiting.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |waiting| (waiting < inner.max_queue_size).then_some(waiting + 1),
        );
        if admitted.is_err() {
            return Err(GatewayError::queue_full(format!(
                "request queue is full ({} outstanding)",
                self.outstanding()
            )));
        }

        let enqueued_at = Instant::now();
        let ceiling = inner.request_timeout + inner.queue_timeout;
        let body = self.execute(submission, enqueued_at);

        match tokio::time::timeout(ceiling, body).await {
            Ok(result) => result,
            // The runner's own request timer normally fires first; this is
            // the absolute ceiling over queue wait plus execution.
            Err(_) => Err(GatewayError::timeout(format!(
                "request exceeded the combined ceiling of {} ms",
                ceiling.as_millis()
            ))),
        }
    }

    async fn execute(
        &self,
        submission: &Submission,
        enqueued_at: Instant,
    ) -> Result<RunResult, GatewayError> {
        let inner = &self.inner;
        let waiting_guard = CountGuard(&inner.waiting);

        let permit = tokio::select! {
            permit = inner.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| GatewayError::cli("gateway is shutting down"))?
            }
            _ = submission.cancel.cancelled() => return Err(GatewayError::aborted()),
        };

        if enqueued_at.elapsed() > inner.queue_timeout {
            return Err(GatewayError::queue_timeout(format!(
                "request waited longer than {} ms for a worker slot",
                inner.queue_timeout.as_millis()
            )));
        }

        // No longer a waiter from here on; the running gauge takes over.
        drop(waiting_guard);
        inner.running.send_modify(|n| *n += 1);
        let _running_guard = RunningGuard(&inner.running);

        debug!(request_id = %submission.request_id, "worker slot acquired");

        let mut opts = submission.options.clone();
        opts.timeout_ms = Some(inner.request_timeout.as_millis() as u64);

        let result = inner
            .runner
            .run(&opts, submission.chunk_tx.clone(), &submission.cancel)
            .await;
        drop(permit);
        result
    }

    /// Idempotent: refuse new submissions, fail waiters that have not
    /// started, then wait for in-flight executors to finish.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if !inner.shutting_down.swap(true, Ordering::SeqCst) {
            info!("worker pool shutting down");
            inner.semaphore.close();
        }
        let mut rx = inner.running.subscribe();
        let _ = rx.wait_for(|running| *running == 0).await;
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let running = *inner.running.borrow();
        PoolStats {
            outstanding: running + inner.waiting.load(Ordering::SeqCst),
            running,
            concurrency: inner.concurrency,
            max_queue_size: inner.max_queue_size,
            paused: inner.shutting_down.load(Ordering::SeqCst),
        }
    }

    pub fn healthy(&self) -> bool {
        (self.outstanding() as f64) < 0.9 * self.inner.max_queue_size as f64
    }

    fn outstanding(&self) -> usize {
        *self.inner.running.borrow() + self.inner.waiting.load(Ordering::SeqCst)
    }
}

struct CountGuard<'a>(&'a AtomicUsize);

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct RunningGuard<'a>(&'a watch::Sender<usize>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n -= 1);
    }
}

/// Backoff before attempt `attempt + 1`, with ±15% uniform jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let index = ((attempt - 1) as usize).min(RETRY_DELAYS_MS.len() - 1);
    let base = RETRY_DELAYS_MS[index] as f64;
    let factor = rand::thread_rng().gen_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
    Duration::from_millis((base * factor) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_stays_within_jitter_bounds() {
        for (attempt, base) in [(1_u32, 1000_u64), (2, 2000), (3, 4000)] {
            for _ in 0..50 {
                let delay = backoff_delay(attempt).as_millis() as u64;
                let min = base * 85 / 100;
                let max = base * 115 / 100;
                assert!(
                    (min..=max).contains(&delay),
                    "attempt {attempt}: {delay} outside [{min}, {max}]"
                );
            }
        }
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::path::Path;
        use std::time::Instant;

        fn fake_cli(dir: &Path, name: &str, body: &str) -> String {
            use std::os::unix::fs::PermissionsExt;
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
            let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).expect("chmod");
            path.display().to_string()
        }

        fn pool_for(cli: String, concurrency: usize, max_queue: usize) -> WorkerPool {
            WorkerPool::new(
                Runner::new(cli, None, None),
                concurrency,
                max_queue,
                Duration::from_secs(10),
                Duration::from_secs(10),
            )
        }

        fn submission(prompt: &str) -> Submission {
            Submission {
                options: RunOptions {
                    prompt: prompt.to_string(),
                    ..RunOptions::default()
                },
                chunk_tx: None,
                cancel: CancellationToken::new(),
                request_id: format!("req-{prompt}"),
            }
        }

        #[tokio::test]
        async fn happy_path_spawns_exactly_once() {
            let dir = tempfile::tempdir().expect("tempdir");
            let marker = dir.path().join("spawns");
            let cli = fake_cli(
                dir.path(),
                "cli",
                &format!(
                    "echo run >> {}\necho '{{\"result\":\"hello\",\"session_id\":\"U\"}}'",
                    marker.display()
                ),
            );
            let pool = pool_for(cli, 2, 10);

            let result = pool.submit(submission("hi")).await.expect("submit");
            assert_eq!(result.result, "hello");
            assert_eq!(result.upstream_session_id.as_deref(), Some("U"));

            let spawns = std::fs::read_to_string(&marker).expect("marker");
            assert_eq!(spawns.lines().count(), 1);
        }

        #[tokio::test]
        async fn third_submission_is_rejected_when_queue_is_full() {
            let dir = tempfile::tempdir().expect("tempdir");
            let cli = fake_cli(
                dir.path(),
                "cli",
                "sleep 0.4\necho '{\"result\":\"done\"}'",
            );
            let pool = pool_for(cli, 1, 1);

            let first = {
                let pool = pool.clone();
                tokio::spawn(async move { pool.submit(submission("a")).await })
            };
            tokio::time::sleep(Duration::from_millis(100)).await;
            let second = {
                let pool = pool.clone();
                tokio::spawn(async move { pool.submit(submission("b")).await })
            };
            tokio::time::sleep(Duration::from_millis(100)).await;

            let err = pool.submit(submission("c")).await.unwrap_err();
            assert_eq!(err.kind, gatehouse_types::ErrorKind::QueueFull);

            assert!(first.await.expect("join").is_ok());
            assert!(second.await.expect("join").is_ok());
        }

        #[tokio::test]
        async fn queue_wait_longer_than_queue_timeout_fails_without_spawn() {
            let dir = tempfile::tempdir().expect("tempdir");
            let marker = dir.path().join("spawns");
            let cli = fake_cli(
                dir.path(),
                "cli",
                &format!(
                    "echo run >> {}\nsleep 0.4\necho '{{\"result\":\"done\"}}'",
                    marker.display()
                ),
            );
            let pool = WorkerPool::new(
                Runner::new(cli, None, None),
                1,
                10,
                Duration::from_secs(10),
                Duration::from_millis(100),
            );

            let first = {
                let pool = pool.clone();
                tokio::spawn(async move { pool.submit(submission("a")).await })
            };
            tokio::time::sleep(Duration::from_millis(50)).await;

            let err = pool.submit(submission("b")).await.unwrap_err();
            assert_eq!(err.kind, gatehouse_types::ErrorKind::QueueTimeout);

            assert!(first.await.expect("join").is_ok());
            let spawns = std::fs::read_to_string(&marker).expect("marker");
            assert_eq!(spawns.lines().count(), 1, "second submission must not spawn");
        }

        #[tokio::test]
        async fn transient_failure_is_retried_up_to_three_attempts() {
            let dir = tempfile::tempdir().expect("tempdir");
            let marker = dir.path().join("attempts");
            let cli = fake_cli(
                dir.path(),
                "cli",
                &format!(
                    "echo attempt >> {}\necho 'rate limit exceeded' >&2\nexit 1",
                    marker.display()
                ),
            );
            let pool = pool_for(cli, 1, 10);

            let err = pool.submit(submission("hi")).await.unwrap_err();
            assert_eq!(err.kind, gatehouse_types::ErrorKind::RateLimit);

            let attempts = std::fs::read_to_string(&marker).expect("marker");
            assert_eq!(attempts.lines().count(), 3);
        }

        #[tokio::test]
        async fn transient_failure_then_success_recovers_on_retry() {
            let dir = tempfile::tempdir().expect("tempdir");
            let marker = dir.path().join("failed-once");
            let cli = fake_cli(
                dir.path(),
                "cli",
                &format!(
                    "if [ -f {marker} ]; then echo '{{\"result\":\"ok\"}}'; \
                     else touch {marker}; echo 'rate limit exceeded' >&2; exit 1; fi",
                    marker = marker.display()
                ),
            );
            let pool = pool_for(cli, 1, 10);

            let started = Instant::now();
            let result = pool.submit(submission("hi")).await.expect("submit");
            assert_eq!(result.result, "ok");
            // one backoff sleep separates the two attempts
            assert!(started.elapsed() >= Duration::from_millis(800));
        }

        #[tokio::test]
        async fn non_retryable_failure_makes_one_attempt() {
            let pool = pool_for("/nonexistent/gatehouse-cli".to_string(), 1, 10);
            let started = Instant::now();
            let err = pool.submit(submission("hi")).await.unwrap_err();
            assert_eq!(err.kind, gatehouse_types::ErrorKind::CliNotFound);
            assert!(started.elapsed() < Duration::from_millis(500), "no backoff expected");
        }

        #[tokio::test]
        async fn streaming_failure_is_never_retried() {
            let dir = tempfile::tempdir().expect("tempdir");
            let marker = dir.path().join("attempts");
            let cli = fake_cli(
                dir.path(),
                "cli",
                &format!(
                    "echo attempt >> {}\necho 'rate limit exceeded' >&2\nexit 1",
                    marker.display()
                ),
            );
            let pool = pool_for(cli, 1, 10);

            let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
            let mut sub = submission("hi");
            sub.options.stream = true;
            sub.chunk_tx = Some(tx);

            let err = pool.submit(sub).await.unwrap_err();
            assert_eq!(err.kind, gatehouse_types::ErrorKind::RateLimit);

            let attempts = std::fs::read_to_string(&marker).expect("marker");
            assert_eq!(attempts.lines().count(), 1);
        }

        #[tokio::test]
        async fn cancellation_during_backoff_aborts_the_retry_loop() {
            let dir = tempfile::tempdir().expect("tempdir");
            let cli = fake_cli(
                dir.path(),
                "cli",
                "echo 'rate limit exceeded' >&2\nexit 1",
            );
            let pool = pool_for(cli, 1, 10);

            let mut sub = submission("hi");
            sub.cancel = CancellationToken::new();
            let fire = sub.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                fire.cancel();
            });

            let started = Instant::now();
            let err = pool.submit(sub).await.unwrap_err();
            assert!(err.message.contains("aborted"));
            assert!(started.elapsed() < Duration::from_secs(1));
        }

        #[tokio::test]
        async fn shutdown_drops_waiters_and_drains_in_flight() {
            let dir = tempfile::tempdir().expect("tempdir");
            let cli = fake_cli(
                dir.path(),
                "cli",
                "sleep 0.3\necho '{\"result\":\"done\"}'",
            );
            let pool = pool_for(cli, 1, 10);

            let in_flight = {
                let pool = pool.clone();
                tokio::spawn(async move { pool.submit(submission("a")).await })
            };
            tokio::time::sleep(Duration::from_millis(100)).await;
            let waiter = {
                let pool = pool.clone();
                tokio::spawn(async move { pool.submit(submission("b")).await })
            };
            tokio::time::sleep(Duration::from_millis(50)).await;

            pool.shutdown().await;

            assert!(in_flight.await.expect("join").is_ok());
            let err = waiter.await.expect("join").unwrap_err();
            assert!(err.message.contains("shutting down"));

            let refused = pool.submit(submission("c")).await.unwrap_err();
            assert!(refused.message.contains("shutting down"));
            assert!(pool.stats().paused);

            // idempotent
            pool.shutdown().await;
        }

        #[tokio::test]
        async fn stats_and_health_reflect_bounds() {
            let dir = tempfile::tempdir().expect("tempdir");
            let cli = fake_cli(dir.path(), "cli", "echo '{\"result\":\"ok\"}'");
            let pool = pool_for(cli, 2, 10);

            let stats = pool.stats();
            assert_eq!(stats.outstanding, 0);
            assert_eq!(stats.running, 0);
            assert_eq!(stats.concurrency, 2);
            assert_eq!(stats.max_queue_size, 10);
            assert!(!stats.paused);
            assert!(pool.healthy());
        }
    }
}
