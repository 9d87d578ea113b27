use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use gatehouse_core::{
    resolve_state_dir, Database, GatewayConfig, Runner, SessionStore, TaskStore, WorkerPool,
    DEFAULT_HOST, DEFAULT_PORT,
};
use gatehouse_observability::{init_process_logging, logs_dir_from_state_dir};
use gatehouse_server::{serve, AppState};
use gatehouse_types::RunOptions;

const ENGINE_CLI_EXAMPLES: &str = r#"Examples:
  gatehouse-engine serve --hostname 127.0.0.1 --port 8995
  gatehouse-engine serve --state-dir .gatehouse-test --api-key sk-local-1
  gatehouse-engine status --hostname 127.0.0.1 --port 8995
  gatehouse-engine run "Summarize this repository" --model sonnet
"#;

const SERVE_EXAMPLES: &str = r#"Examples:
  gatehouse-engine serve
  gatehouse-engine serve --hostname 0.0.0.0 --port 8995
  gatehouse-engine serve --config gatehouse.json --api-key sk-local-1 --api-key sk-local-2
"#;

const STATUS_EXAMPLES: &str = r#"Examples:
  gatehouse-engine status
  gatehouse-engine status --hostname 127.0.0.1 --port 8995
"#;

const RUN_EXAMPLES: &str = r#"Examples:
  gatehouse-engine run "Write a short status update"
  gatehouse-engine run "Summarize README.md" --model haiku --workspace ./scratch
"#;

#[derive(Parser, Debug)]
#[command(name = "gatehouse-engine")]
#[command(version)]
#[command(about = "HTTP gateway for a local command-line AI assistant")]
#[command(
    long_about = "HTTP gateway that fronts a local command-line AI assistant as a hosted chat API.\n\nUse `serve` for the HTTP runtime, `status` to probe a running gateway, and `run` for one-shot prompts."
)]
#[command(after_help = ENGINE_CLI_EXAMPLES)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Start the HTTP gateway.")]
    #[command(after_help = SERVE_EXAMPLES)]
    Serve {
        #[arg(
            long,
            env = "GATEHOUSE_HOST",
            alias = "host",
            default_value = DEFAULT_HOST,
            help = "Hostname or IP address to bind."
        )]
        hostname: String,
        #[arg(
            long,
            env = "GATEHOUSE_PORT",
            default_value_t = DEFAULT_PORT,
            help = "Port to bind."
        )]
        port: u16,
        #[arg(
            long,
            help = "State directory for the database and logs. Defaults to GATEHOUSE_STATE_DIR or the platform data dir."
        )]
        state_dir: Option<String>,
        #[arg(long, help = "Path to a JSON config file.")]
        config: Option<String>,
        #[arg(
            long = "api-key",
            help = "Accepted API key; repeat for multiple keys. Without any, the gateway is open."
        )]
        api_keys: Vec<String>,
        #[arg(long, help = "CLI binary override for this process.")]
        cli_command: Option<String>,
    },
    #[command(about = "Check gateway health (GET /health).")]
    #[command(after_help = STATUS_EXAMPLES)]
    Status {
        #[arg(
            long,
            env = "GATEHOUSE_HOST",
            alias = "host",
            default_value = DEFAULT_HOST,
            help = "Hostname or IP address to check."
        )]
        hostname: String,
        #[arg(
            long,
            env = "GATEHOUSE_PORT",
            default_value_t = DEFAULT_PORT,
            help = "Port to check."
        )]
        port: u16,
    },
    #[command(about = "Run one prompt through the CLI and print the response.")]
    #[command(after_help = RUN_EXAMPLES)]
    Run {
        #[arg(help = "Prompt text to execute.")]
        prompt: String,
        #[arg(long, help = "Model alias override.")]
        model: Option<String>,
        #[arg(long, help = "Working directory for the CLI.")]
        workspace: Option<String>,
        #[arg(long, help = "Path to a JSON config file.")]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            state_dir,
            config,
            api_keys,
            cli_command,
        } => {
            let mut config = GatewayConfig::load(config.as_deref().map(std::path::Path::new))?;
            config.host = hostname;
            config.port = port;
            if !api_keys.is_empty() {
                config.api_keys.extend(api_keys);
            }
            if let Some(cli_command) = cli_command {
                config.cli_command = cli_command;
            }

            let state_dir = resolve_state_dir(state_dir.map(PathBuf::from));
            let logs_dir = logs_dir_from_state_dir(&state_dir);
            let (_log_guard, log_info) = init_process_logging(&logs_dir, 14)?;
            info!("gateway logging initialized: {:?}", log_info);

            run_server(config, &state_dir).await?;
        }
        Command::Status { hostname, port } => {
            let url = format!("http://{hostname}:{port}/health");
            let resp = reqwest::Client::new().get(&url).send().await?;
            let status = resp.status();
            let body = resp.text().await?;
            if !status.is_success() {
                anyhow::bail!("gateway health check failed: {} {}", status, body);
            }
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(&body) {
                println!("{}", serde_json::to_string_pretty(&json)?);
            } else {
                println!("{body}");
            }
        }
        Command::Run {
            prompt,
            model,
            workspace,
            config,
        } => {
            let config = GatewayConfig::load(config.as_deref().map(std::path::Path::new))?;
            let runner = Runner::new(
                config.cli_command.clone(),
                config.default_model.clone(),
                config.default_workspace_dir.clone(),
            );
            let options = RunOptions {
                prompt,
                model,
                working_directory: workspace,
                timeout_ms: Some(config.request_timeout_ms),
                ..RunOptions::default()
            };
            let result = runner
                .run(&options, None, &CancellationToken::new())
                .await
                .map_err(|err| anyhow::anyhow!("{err}"))?;
            println!("{}", result.result);
        }
    }

    Ok(())
}

async fn run_server(config: GatewayConfig, state_dir: &std::path::Path) -> anyhow::Result<()> {
    let startup = Instant::now();
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid hostname or port")?;

    let db_path = config.db_path(state_dir);
    info!(
        "startup paths: state_dir={} db={}",
        state_dir.display(),
        db_path.display()
    );

    let db = Database::open(&db_path).await?;
    let sessions = SessionStore::new(db.clone(), config.max_sessions_per_key);
    let tasks = TaskStore::new(db);

    // recover tasks stranded by a previous process before admitting work
    let recovered = tasks
        .mark_orphaned_failed()
        .await
        .map_err(|err| anyhow::anyhow!("orphan recovery failed: {err}"))?;
    if recovered > 0 {
        info!(recovered, "marked orphaned tasks as failed after restart");
    }

    let runner = Runner::new(
        config.cli_command.clone(),
        config.default_model.clone(),
        config.default_workspace_dir.clone(),
    );
    let pool = WorkerPool::new(
        runner,
        config.worker_concurrency,
        config.max_queue_size,
        config.request_timeout(),
        config.queue_timeout(),
    );

    let sweeper_shutdown = CancellationToken::new();
    let session_sweeper = sessions.spawn_sweeper(
        config.session_ttl(),
        config.cleanup_interval(),
        sweeper_shutdown.clone(),
    );
    let task_sweeper = tasks.spawn_sweeper(config.cleanup_interval(), sweeper_shutdown.clone());

    let state = AppState::new(pool.clone(), sessions, tasks, &config);
    info!(
        concurrency = config.worker_concurrency,
        max_queue_size = config.max_queue_size,
        cli = %config.cli_command,
        elapsed_ms = startup.elapsed().as_millis() as u64,
        "gateway runtime ready"
    );

    serve(addr, state).await?;

    // drain: refuse new work, let in-flight children finish
    sweeper_shutdown.cancel();
    pool.shutdown().await;
    let _ = session_sweeper.await;
    let _ = task_sweeper.await;
    info!("gateway drained and stopped");

    Ok(())
}
