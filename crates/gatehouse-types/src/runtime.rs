use serde::{Deserialize, Serialize};

/// One CLI invocation, as captured by the dispatch engine. Serializable so
/// background task rows can persist the exact options they were created with.
/// Runtime-only companions (chunk sink, cancel handle) travel next to this,
/// never inside it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOptions {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    /// Per-execution ceiling in milliseconds. The worker pool overwrites this
    /// with its configured request timeout on every admitted submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Parsed outcome of a successful CLI invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_session_id: Option<String>,
    pub raw_output: String,
    pub model: String,
}

/// In-order streaming unit delivered through the chunk sink. The final chunk
/// of a streamed run is always `End`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamChunk {
    Delta { text: String },
    End { stop_reason: String },
}
