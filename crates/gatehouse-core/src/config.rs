use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8995;

const ENV_PREFIX: &str = "GATEHOUSE_";

/// Recognized gateway options. Resolution order: built-in defaults, then an
/// optional JSON config file, then `GATEHOUSE_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Binary name (or path) of the CLI invoked as a child process.
    pub cli_command: String,
    /// Maximum parallel child processes.
    pub worker_concurrency: usize,
    /// Admission limit for outstanding submissions (running + queued).
    pub max_queue_size: usize,
    /// Per-execution ceiling.
    pub request_timeout_ms: u64,
    /// Per-waiter ceiling before execution starts.
    pub queue_timeout_ms: u64,
    /// Inactivity window before a session row is swept.
    pub session_ttl_ms: u64,
    /// Per-owner session quota.
    pub max_sessions_per_key: usize,
    /// Sweep cadence for sessions and terminal tasks.
    pub session_cleanup_interval_ms: u64,
    /// Persistent store location; defaults under the state dir when unset.
    pub session_db_path: Option<PathBuf>,
    pub default_model: Option<String>,
    pub default_workspace_dir: Option<PathBuf>,
    /// Accepted bearer keys. Empty means the gateway is open and every
    /// caller shares the anonymous owner fingerprint.
    pub api_keys: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            cli_command: "claude".to_string(),
            worker_concurrency: 2,
            max_queue_size: 100,
            request_timeout_ms: 300_000,
            queue_timeout_ms: 60_000,
            session_ttl_ms: 3_600_000,
            max_sessions_per_key: 10,
            session_cleanup_interval_ms: 60_000,
            session_db_path: None,
            default_model: None,
            default_workspace_dir: None,
            api_keys: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load the effective configuration. A missing config file is not an
    /// error; a present but malformed one is.
    pub fn load(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path {
            if path.exists() {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                config = serde_json::from_str(&raw)
                    .with_context(|| format!("invalid config file {}", path.display()))?;
            }
        }

        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_string("HOST") {
            self.host = v;
        }
        if let Some(v) = env_parse::<u16>("PORT") {
            self.port = v;
        }
        if let Some(v) = env_string("CLI_COMMAND") {
            self.cli_command = v;
        }
        if let Some(v) = env_parse::<usize>("WORKER_CONCURRENCY") {
            self.worker_concurrency = v.max(1);
        }
        if let Some(v) = env_parse::<usize>("MAX_QUEUE_SIZE") {
            self.max_queue_size = v.max(1);
        }
        if let Some(v) = env_parse::<u64>("REQUEST_TIMEOUT_MS") {
            self.request_timeout_ms = v;
        }
        if let Some(v) = env_parse::<u64>("QUEUE_TIMEOUT_MS") {
            self.queue_timeout_ms = v;
        }
        if let Some(v) = env_parse::<u64>("SESSION_TTL_MS") {
            self.session_ttl_ms = v;
        }
        if let Some(v) = env_parse::<usize>("MAX_SESSIONS_PER_KEY") {
            self.max_sessions_per_key = v.max(1);
        }
        if let Some(v) = env_parse::<u64>("SESSION_CLEANUP_INTERVAL_MS") {
            self.session_cleanup_interval_ms = v.max(1_000);
        }
        if let Some(v) = env_string("SESSION_DB_PATH") {
            self.session_db_path = Some(PathBuf::from(v));
        }
        if let Some(v) = env_string("DEFAULT_MODEL") {
            self.default_model = Some(v);
        }
        if let Some(v) = env_string("DEFAULT_WORKSPACE_DIR") {
            self.default_workspace_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env_string("API_KEYS") {
            self.api_keys = v
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.session_ttl_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.session_cleanup_interval_ms)
    }

    pub fn db_path(&self, state_dir: &Path) -> PathBuf {
        self.session_db_path
            .clone()
            .unwrap_or_else(|| state_dir.join("gatehouse.sqlite"))
    }
}

/// State directory for the database and logs: explicit flag, then
/// `GATEHOUSE_STATE_DIR`, then the platform data dir, then `~/.gatehouse`.
pub fn resolve_state_dir(flag: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = flag {
        return dir;
    }
    if let Ok(dir) = std::env::var(format!("{ENV_PREFIX}STATE_DIR")) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Some(data_dir) = dirs::data_dir() {
        return data_dir.join("gatehouse");
    }
    dirs::home_dir()
        .map(|home| home.join(".gatehouse"))
        .unwrap_or_else(|| PathBuf::from(".gatehouse"))
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|v| v.parse().ok())
}
