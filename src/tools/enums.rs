use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How `analyze` renders versions.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Text,
}

/// Cache maintenance actions.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheAction {
    /// Counts by mode and provider, time range, file size.
    Stats,
    /// Delete versions, optionally narrowed by `commit` and/or `mode`.
    Clear,
    /// Keep only the newest `keep` versions of every key.
    Cleanup,
    /// Per-provider call, token, and cost counters.
    Usage,
}
