use schemars::JsonSchema;
use serde::Deserialize;

use crate::analysis::AnalysisMode;
use crate::store::ClearScope;
use crate::tools::enums::CacheAction;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CacheRequest {
    /// "stats", "clear", "cleanup", or "usage".
    pub action: CacheAction,
    /// Clear: only this commit (full hash as stored).
    pub commit: Option<String>,
    /// Clear: only this mode.
    pub mode: Option<AnalysisMode>,
    /// Cleanup: versions to keep per commit/mode (min 1; defaults to config `keep_versions`).
    pub keep: Option<usize>,
    /// Clear everything. Required when neither `commit` nor `mode` is given.
    pub all: Option<bool>,
}

impl CacheRequest {
    /// Scope for `clear`, or an error message when the request is too broad by accident.
    pub fn clear_scope(&self) -> Result<ClearScope, String> {
        match (&self.commit, self.mode) {
            (Some(commit), Some(mode)) => Ok(ClearScope::Key {
                commit: commit.clone(),
                mode,
            }),
            (Some(commit), None) => Ok(ClearScope::Commit(commit.clone())),
            (None, Some(mode)) => Ok(ClearScope::Mode(mode)),
            (None, None) if self.all == Some(true) => Ok(ClearScope::All),
            (None, None) => Err("clear needs `commit`, `mode`, or `all: true`".to_string()),
        }
    }
}
