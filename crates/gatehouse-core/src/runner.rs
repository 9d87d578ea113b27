use std::path::{Component, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use gatehouse_observability::redact_text;
use gatehouse_types::{GatewayError, RunOptions, RunResult, StreamChunk};

const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_millis(300_000);
/// Fixed interval between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

enum KillReason {
    Timeout,
    ClientDisconnect,
}

/// Spawns and supervises one CLI invocation: argv assembly, stdio capture,
/// timeout, cancellation, signal escalation, stdout parsing, and the
/// streaming line demux.
pub struct Runner {
    cli_command: String,
    default_model: Option<String>,
    default_workspace_dir: Option<PathBuf>,
}

impl Runner {
    pub fn new(
        cli_command: impl Into<String>,
        default_model: Option<String>,
        default_workspace_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            cli_command: cli_command.into(),
            default_model,
            default_workspace_dir,
        }
    }

    /// Run the CLI once. Returns when the child exits, times out, or is
    /// cancelled; the child never outlives this call.
    pub async fn run(
        &self,
        opts: &RunOptions,
        chunk_tx: Option<UnboundedSender<StreamChunk>>,
        cancel: &CancellationToken,
    ) -> Result<RunResult, GatewayError> {
        if opts.prompt.trim().is_empty() {
            return Err(GatewayError::invalid_request("prompt must not be empty"));
        }

        let workspace = self.prepare_workspace(opts)?;

        if cancel.is_cancelled() {
            return Err(GatewayError::aborted());
        }

        let model = self.effective_model(opts);
        let args = self.build_args(opts, model.as_deref());
        let model = model.unwrap_or_else(|| "default".to_string());

        debug!(
            cli = %self.cli_command,
            prompt = %redact_text(&opts.prompt),
            model = %model,
            stream = opts.stream,
            "spawning CLI"
        );

        let mut command = Command::new(&self.cli_command);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &workspace {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                GatewayError::cli_not_found(format!(
                    "CLI binary `{}` was not found on the host path",
                    self.cli_command
                ))
            } else {
                GatewayError::cli(format!("failed to spawn CLI: {err}"))
            }
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GatewayError::internal("child stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| GatewayError::internal("child stderr was not piped"))?;

        let stdout_task = tokio::spawn(drain_stdout(stdout, chunk_tx));
        let stderr_task = tokio::spawn(drain_stream(stderr));

        let timeout = opts
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RUN_TIMEOUT);

        let mut killed = None;
        let status = tokio::select! {
            status = child.wait() => {
                status.map_err(|err| GatewayError::cli(format!("failed to await CLI exit: {err}")))?
            }
            _ = tokio::time::sleep(timeout) => {
                killed = Some(KillReason::Timeout);
                terminate_then_kill(&mut child).await?
            }
            _ = cancel.cancelled() => {
                killed = Some(KillReason::ClientDisconnect);
                terminate_then_kill(&mut child).await?
            }
        };

        let stdout_buf = stdout_task.await.unwrap_or_default();
        let stderr_buf = stderr_task.await.unwrap_or_default();

        match killed {
            Some(KillReason::ClientDisconnect) => Err(GatewayError::aborted()),
            Some(KillReason::Timeout) => Err(GatewayError::timeout(format!(
                "CLI execution exceeded {} ms",
                timeout.as_millis()
            ))),
            None if status.success() => parse_output(&stdout_buf, model),
            None => Err(classify_failure(&status, &stderr_buf)),
        }
    }

    /// Deterministic argv for one invocation.
    fn build_args(&self, opts: &RunOptions, model: Option<&str>) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            opts.prompt.clone(),
            "--output-format".to_string(),
            if opts.stream { "stream-json" } else { "json" }.to_string(),
            // required for non-interactive operation
            "--dangerously-skip-permissions".to_string(),
        ];
        if let Some(model) = model {
            args.push("--model".to_string());
            args.push(model.to_string());
        }
        if let Some(tools) = &opts.allowed_tools {
            if !tools.is_empty() {
                args.push("--allowedTools".to_string());
                args.push(tools.join(","));
            }
        }
        if let Some(resume) = &opts.resume_session_id {
            args.push("--resume".to_string());
            args.push(resume.clone());
        }
        if let Some(turns) = opts.max_turns {
            if turns > 0 {
                args.push("--max-turns".to_string());
                args.push(turns.to_string());
            }
        }
        args
    }

    fn effective_model(&self, opts: &RunOptions) -> Option<String> {
        opts.model
            .as_deref()
            .or(self.default_model.as_deref())
            .map(|m| m.trim().to_lowercase())
            .filter(|m| !m.is_empty())
    }

    /// Resolve and create the working directory. The `..` check is enforced
    /// here even though the HTTP layer also validates.
    fn prepare_workspace(&self, opts: &RunOptions) -> Result<Option<PathBuf>, GatewayError> {
        let dir = opts
            .working_directory
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| self.default_workspace_dir.clone());
        let Some(dir) = dir else {
            return Ok(None);
        };

        if dir
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(GatewayError::invalid_request(
                "working directory must not contain `..`",
            ));
        }

        std::fs::create_dir_all(&dir).map_err(|err| {
            GatewayError::cli(format!(
                "failed to create working directory {}: {err}",
                dir.display()
            ))
        })?;

        Ok(Some(dir))
    }
}

/// SIGTERM, then SIGKILL after the grace period if the child is still alive.
async fn terminate_then_kill(child: &mut Child) -> Result<ExitStatus, GatewayError> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(status) => {
            status.map_err(|err| GatewayError::cli(format!("failed to await CLI exit: {err}")))
        }
        Err(_) => {
            warn!("CLI ignored SIGTERM, escalating to SIGKILL");
            let _ = child.start_kill();
            child
                .wait()
                .await
                .map_err(|err| GatewayError::cli(format!("failed to await CLI exit: {err}")))
        }
    }
}

/// Buffer stdout to completion. When a chunk sink is attached, complete
/// NDJSON lines are demuxed and delivered in source order before the next
/// read; the trailing partial line stays buffered until more bytes arrive.
async fn drain_stdout(
    mut stream: tokio::process::ChildStdout,
    chunk_tx: Option<UnboundedSender<StreamChunk>>,
) -> String {
    let mut output = String::new();
    let mut pending = String::new();
    let mut saw_end = false;
    let mut buf = vec![0_u8; 8192];

    loop {
        let read = match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        let chunk = String::from_utf8_lossy(&buf[..read]);
        output.push_str(&chunk);

        if let Some(tx) = &chunk_tx {
            pending.push_str(&chunk);
            while let Some(pos) = pending.find('\n') {
                let line: String = pending.drain(..=pos).collect();
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Some(chunk) = demux_line(line) {
                    saw_end = saw_end || matches!(chunk, StreamChunk::End { .. });
                    // receiver may have gone away; keep draining to EOF
                    let _ = tx.send(chunk);
                }
            }
        }
    }

    if let Some(tx) = &chunk_tx {
        let tail = pending.trim();
        if !tail.is_empty() {
            if let Some(chunk) = demux_line(tail) {
                saw_end = saw_end || matches!(chunk, StreamChunk::End { .. });
                let _ = tx.send(chunk);
            }
        }
        if !saw_end {
            let _ = tx.send(StreamChunk::End {
                stop_reason: "end_turn".to_string(),
            });
        }
    }

    output
}

async fn drain_stream(mut stream: impl tokio::io::AsyncRead + Unpin) -> String {
    let mut output = String::new();
    let mut buf = vec![0_u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => output.push_str(&String::from_utf8_lossy(&buf[..n])),
            Err(_) => break,
        }
    }
    output
}

/// Map one stream-json line to a chunk. Unknown types and malformed lines
/// are skipped, never fatal.
fn demux_line(line: &str) -> Option<StreamChunk> {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(err) => {
            debug!(%err, "skipping malformed stream line");
            return None;
        }
    };

    match value.get("type").and_then(Value::as_str) {
        Some("content_block_delta") => value
            .pointer("/delta/text")
            .and_then(Value::as_str)
            .map(|text| StreamChunk::Delta {
                text: text.to_string(),
            }),
        Some("assistant") => {
            assistant_text(value.get("message")).map(|text| StreamChunk::Delta { text })
        }
        Some("message_stop") | Some("message_end") => {
            let stop_reason = value
                .pointer("/message/stop_reason")
                .and_then(Value::as_str)
                .unwrap_or("end_turn")
                .to_string();
            Some(StreamChunk::End { stop_reason })
        }
        _ => None,
    }
}

/// Assistant message content is either a plain string or a block list whose
/// first element carries a `text` field.
fn assistant_text(message: Option<&Value>) -> Option<String> {
    let content = message?.get("content")?;
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(blocks) => blocks
            .first()?
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

/// Zero-exit stdout handling: JSON object with a `result` field, an
/// `is_error` flag, or a raw-text fallback when the CLI printed something
/// unstructured.
fn parse_output(raw: &str, model: String) -> Result<RunResult, GatewayError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(GatewayError::cli("CLI exited successfully but produced no output"));
    }

    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
        if map
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            let message = map
                .get("result")
                .and_then(Value::as_str)
                .unwrap_or("CLI reported an error");
            return Err(GatewayError::cli(message));
        }
        if let Some(result) = map.get("result").and_then(Value::as_str) {
            return Ok(RunResult {
                result: result.to_string(),
                upstream_session_id: map
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                raw_output: trimmed.to_string(),
                model,
            });
        }
    }

    // graceful fallback: hand back whatever the CLI printed
    Ok(RunResult {
        result: trimmed.to_string(),
        upstream_session_id: None,
        raw_output: trimmed.to_string(),
        model,
    })
}

/// Non-zero exit: classify by stderr content, case-insensitively.
fn classify_failure(status: &ExitStatus, stderr: &str) -> GatewayError {
    let lowered = stderr.to_lowercase();

    if lowered.contains("rate limit") || lowered.contains("too many requests") {
        return GatewayError::rate_limit("CLI reported an upstream rate limit");
    }
    if lowered.contains("authentication")
        || lowered.contains("not logged in")
        || lowered.contains("login")
    {
        return GatewayError::upstream_auth("CLI is not authenticated with its upstream");
    }
    if lowered.contains("out of memory")
        || lowered.contains("heap limit")
        || lowered.contains("allocation failed")
    {
        return GatewayError::memory("CLI ran out of memory");
    }

    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal: Option<i32> = None;

    GatewayError::cli(format!(
        "CLI exited with status {}",
        status.code().unwrap_or(-1)
    ))
    .with_details(json!({
        "exitCode": status.code(),
        "signal": signal,
        "stderr": stderr.trim(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> Runner {
        Runner::new("claude", None, None)
    }

    fn opts(prompt: &str) -> RunOptions {
        RunOptions {
            prompt: prompt.to_string(),
            ..RunOptions::default()
        }
    }

    #[test]
    fn build_args_minimal_request() {
        let args = runner().build_args(&opts("hi"), None);
        assert_eq!(
            args,
            vec![
                "-p",
                "hi",
                "--output-format",
                "json",
                "--dangerously-skip-permissions",
            ]
        );
    }

    #[test]
    fn build_args_full_request() {
        let mut options = opts("do the thing");
        options.stream = true;
        options.allowed_tools = Some(vec!["Bash".to_string(), "Edit".to_string()]);
        options.resume_session_id = Some("U-42".to_string());
        options.max_turns = Some(3);

        let args = runner().build_args(&options, Some("sonnet"));
        assert_eq!(
            args,
            vec![
                "-p",
                "do the thing",
                "--output-format",
                "stream-json",
                "--dangerously-skip-permissions",
                "--model",
                "sonnet",
                "--allowedTools",
                "Bash,Edit",
                "--resume",
                "U-42",
                "--max-turns",
                "3",
            ]
        );
    }

    #[test]
    fn build_args_skips_zero_max_turns_and_empty_tools() {
        let mut options = opts("hi");
        options.max_turns = Some(0);
        options.allowed_tools = Some(vec![]);
        let args = runner().build_args(&options, None);
        assert!(!args.contains(&"--max-turns".to_string()));
        assert!(!args.contains(&"--allowedTools".to_string()));
    }

    #[test]
    fn effective_model_lowercases_and_prefers_request() {
        let runner = Runner::new("claude", Some("Haiku".to_string()), None);
        let mut options = opts("hi");
        assert_eq!(runner.effective_model(&options).as_deref(), Some("haiku"));
        options.model = Some("SONNET".to_string());
        assert_eq!(runner.effective_model(&options).as_deref(), Some("sonnet"));
    }

    #[test]
    fn workspace_with_parent_components_is_rejected() {
        let mut options = opts("hi");
        options.working_directory = Some("work/../escape".to_string());
        let err = runner().prepare_workspace(&options).unwrap_err();
        assert_eq!(err.kind, gatehouse_types::ErrorKind::InvalidRequest);
    }

    #[test]
    fn workspace_is_created_before_spawn() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("a/b/c");
        let mut options = opts("hi");
        options.working_directory = Some(nested.display().to_string());
        let resolved = runner().prepare_workspace(&options).expect("workspace");
        assert_eq!(resolved, Some(nested.clone()));
        assert!(nested.is_dir());
    }

    #[test]
    fn parse_output_reads_result_and_session() {
        let result = parse_output(
            r#"{"result":"hello","session_id":"U","is_error":false}"#,
            "sonnet".to_string(),
        )
        .expect("parse");
        assert_eq!(result.result, "hello");
        assert_eq!(result.upstream_session_id.as_deref(), Some("U"));
        assert_eq!(result.model, "sonnet");
    }

    #[test]
    fn parse_output_surfaces_is_error() {
        let err = parse_output(
            r#"{"result":"prompt too long","is_error":true}"#,
            "default".to_string(),
        )
        .unwrap_err();
        assert_eq!(err.kind, gatehouse_types::ErrorKind::CliError);
        assert_eq!(err.message, "prompt too long");
    }

    #[test]
    fn parse_output_falls_back_to_raw_text() {
        let result = parse_output("plain old text", "default".to_string()).expect("parse");
        assert_eq!(result.result, "plain old text");
        assert!(result.upstream_session_id.is_none());
    }

    #[test]
    fn parse_output_rejects_empty_stdout() {
        let err = parse_output("   \n", "default".to_string()).unwrap_err();
        assert_eq!(err.kind, gatehouse_types::ErrorKind::CliError);
    }

    #[test]
    fn demux_maps_known_event_types() {
        assert_eq!(
            demux_line(r#"{"type":"content_block_delta","delta":{"text":"hi"}}"#),
            Some(StreamChunk::Delta {
                text: "hi".to_string()
            })
        );
        assert_eq!(
            demux_line(r#"{"type":"assistant","message":{"content":"hello"}}"#),
            Some(StreamChunk::Delta {
                text: "hello".to_string()
            })
        );
        assert_eq!(
            demux_line(r#"{"type":"assistant","message":{"content":[{"type":"text","text":"block"}]}}"#),
            Some(StreamChunk::Delta {
                text: "block".to_string()
            })
        );
        assert_eq!(
            demux_line(r#"{"type":"message_stop","message":{"stop_reason":"max_tokens"}}"#),
            Some(StreamChunk::End {
                stop_reason: "max_tokens".to_string()
            })
        );
        assert_eq!(
            demux_line(r#"{"type":"message_stop"}"#),
            Some(StreamChunk::End {
                stop_reason: "end_turn".to_string()
            })
        );
    }

    #[test]
    fn demux_skips_unknown_and_malformed_lines() {
        assert_eq!(demux_line(r#"{"type":"ping"}"#), None);
        assert_eq!(demux_line("{not json"), None);
    }

    #[cfg(unix)]
    #[test]
    fn stderr_classification_table() {
        let status = exit_status(1);
        assert_eq!(
            classify_failure(&status, "Error: rate limit exceeded").kind,
            gatehouse_types::ErrorKind::RateLimit
        );
        assert_eq!(
            classify_failure(&status, "Too Many Requests").kind,
            gatehouse_types::ErrorKind::RateLimit
        );
        assert_eq!(
            classify_failure(&status, "please login first").kind,
            gatehouse_types::ErrorKind::UpstreamAuth
        );
        assert_eq!(
            classify_failure(&status, "Authentication required").kind,
            gatehouse_types::ErrorKind::UpstreamAuth
        );
        assert_eq!(
            classify_failure(&status, "FATAL: out of memory").kind,
            gatehouse_types::ErrorKind::Memory
        );
        assert_eq!(
            classify_failure(&status, "JavaScript heap limit reached").kind,
            gatehouse_types::ErrorKind::Memory
        );
        let other = classify_failure(&status, "something else broke");
        assert_eq!(other.kind, gatehouse_types::ErrorKind::CliError);
        assert_eq!(
            other
                .details
                .as_ref()
                .and_then(|d| d.get("stderr"))
                .and_then(Value::as_str),
            Some("something else broke")
        );
    }

    #[cfg(unix)]
    fn exit_status(code: i32) -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(code << 8)
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::path::Path;
        use std::time::Instant;

        fn fake_cli(dir: &Path, body: &str) -> String {
            use std::os::unix::fs::PermissionsExt;
            let path = dir.join("fake-cli");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
            let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).expect("chmod");
            path.display().to_string()
        }

        #[tokio::test]
        async fn happy_path_parses_result_and_session() {
            let dir = tempfile::tempdir().expect("tempdir");
            let cli = fake_cli(
                dir.path(),
                r#"echo '{"result":"hello","session_id":"U"}'"#,
            );
            let runner = Runner::new(cli, None, None);
            let result = runner
                .run(&opts("hi"), None, &CancellationToken::new())
                .await
                .expect("run");
            assert_eq!(result.result, "hello");
            assert_eq!(result.upstream_session_id.as_deref(), Some("U"));
        }

        #[tokio::test]
        async fn missing_binary_is_cli_not_found() {
            let runner = Runner::new("/nonexistent/gatehouse-fake-cli", None, None);
            let err = runner
                .run(&opts("hi"), None, &CancellationToken::new())
                .await
                .unwrap_err();
            assert_eq!(err.kind, gatehouse_types::ErrorKind::CliNotFound);
        }

        #[tokio::test]
        async fn stderr_drives_error_kind() {
            let dir = tempfile::tempdir().expect("tempdir");
            let cases = [
                ("echo 'Error: rate limit exceeded' >&2; exit 1", gatehouse_types::ErrorKind::RateLimit),
                ("echo 'please login' >&2; exit 1", gatehouse_types::ErrorKind::UpstreamAuth),
                ("echo 'out of memory' >&2; exit 1", gatehouse_types::ErrorKind::Memory),
            ];
            for (body, kind) in cases {
                let cli = fake_cli(dir.path(), body);
                let runner = Runner::new(cli, None, None);
                let err = runner
                    .run(&opts("hi"), None, &CancellationToken::new())
                    .await
                    .unwrap_err();
                assert_eq!(err.kind, kind, "body: {body}");
            }
        }

        #[tokio::test]
        async fn timeout_kills_child_and_reports_timeout() {
            let dir = tempfile::tempdir().expect("tempdir");
            let cli = fake_cli(dir.path(), "sleep 5");
            let runner = Runner::new(cli, None, None);
            let mut options = opts("hi");
            options.timeout_ms = Some(200);

            let started = Instant::now();
            let err = runner
                .run(&options, None, &CancellationToken::new())
                .await
                .unwrap_err();
            assert_eq!(err.kind, gatehouse_types::ErrorKind::Timeout);
            // SIGTERM lands well inside the grace window for a plain sleep
            assert!(started.elapsed() < Duration::from_secs(3));
        }

        #[tokio::test]
        async fn cancellation_aborts_running_child() {
            let dir = tempfile::tempdir().expect("tempdir");
            let cli = fake_cli(dir.path(), "sleep 5");
            let runner = Runner::new(cli, None, None);

            let cancel = CancellationToken::new();
            let fire = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                fire.cancel();
            });

            let started = Instant::now();
            let err = runner
                .run(&opts("hi"), None, &cancel)
                .await
                .unwrap_err();
            assert_eq!(err.kind, gatehouse_types::ErrorKind::CliError);
            assert!(err.message.contains("aborted"));
            assert!(started.elapsed() < Duration::from_secs(3));
        }

        #[tokio::test]
        async fn pre_fired_cancellation_skips_spawn() {
            let dir = tempfile::tempdir().expect("tempdir");
            let marker = dir.path().join("spawned");
            let cli = fake_cli(dir.path(), &format!("touch {}", marker.display()));
            let runner = Runner::new(cli, None, None);

            let cancel = CancellationToken::new();
            cancel.cancel();
            let err = runner.run(&opts("hi"), None, &cancel).await.unwrap_err();
            assert!(err.message.contains("aborted"));
            assert!(!marker.exists());
        }

        #[tokio::test]
        async fn streaming_delivers_chunks_in_order_with_final_end() {
            let dir = tempfile::tempdir().expect("tempdir");
            let cli = fake_cli(
                dir.path(),
                concat!(
                    r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"Hel"}]}}'"#,
                    "\n",
                    r#"echo '{"type":"content_block_delta","delta":{"text":"lo"}}'"#,
                    "\n",
                    r#"echo 'not json at all'"#,
                    "\n",
                    r#"echo '{"type":"message_stop","message":{"stop_reason":"end_turn"}}'"#,
                ),
            );
            let runner = Runner::new(cli, None, None);
            let mut options = opts("hi");
            options.stream = true;

            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            runner
                .run(&options, Some(tx), &CancellationToken::new())
                .await
                .expect("run");

            let mut chunks = Vec::new();
            while let Some(chunk) = rx.recv().await {
                chunks.push(chunk);
            }
            assert_eq!(
                chunks,
                vec![
                    StreamChunk::Delta {
                        text: "Hel".to_string()
                    },
                    StreamChunk::Delta {
                        text: "lo".to_string()
                    },
                    StreamChunk::End {
                        stop_reason: "end_turn".to_string()
                    },
                ]
            );
        }
    }
}
