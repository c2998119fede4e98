use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::analysis::{AnalysisMode, Version};
use crate::tools::enums::OutputFormat;

/// Upper bound on commits resolved by a single batch `analyze` call.
pub const MAX_BATCH: usize = 50;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AnalyzeRequest {
    /// Commit hash, short hash, or revision (e.g. "HEAD~2"). Ignored when `recent` or `since` is set.
    pub commit: Option<String>,
    /// Analyze the N most recent commits instead of a single one (max 50).
    pub recent: Option<usize>,
    /// Analyze commits after this date (anything `git log --since` accepts, e.g. "2 weeks ago").
    pub since: Option<String>,
    /// "pattern" (no model), "brief" (default), or "deep".
    pub mode: Option<AnalysisMode>,
    /// Ignore cached versions and compute a new one.
    pub force_refresh: Option<bool>,
    /// Prompt template name from `templates`. Defaults to the mode's default template.
    pub template: Option<String>,
    /// "json" (default) or "text".
    pub format: Option<OutputFormat>,
}

impl AnalyzeRequest {
    pub fn mode_or_default(&self) -> AnalysisMode {
        self.mode.unwrap_or(AnalysisMode::Brief)
    }

    pub fn is_batch(&self) -> bool {
        self.recent.is_some() || self.since.is_some()
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TriggerRequest {
    /// Commit hash, short hash, or revision.
    pub commit: String,
    /// "pattern", "brief", or "deep".
    pub mode: AnalysisMode,
    /// Ignore cached versions and compute a new one.
    pub force_refresh: Option<bool>,
    /// Prompt template name from `templates`.
    pub template: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct StatusRequest {
    /// Commit hash, short hash, or revision.
    pub commit: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct HistoryRequest {
    /// Commit hash, short hash, or revision.
    pub commit: String,
    pub mode: AnalysisMode,
    /// Return only this version number.
    pub version: Option<u32>,
}

/// One commit's result inside a batch `analyze` response.
#[derive(Debug, Serialize)]
pub struct BatchItem {
    pub commit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct TriggerResponse {
    pub commit: String,
    pub mode: AnalysisMode,
    /// "cached" or "pending".
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}
