//! Core analysis data types: commits, modes, payloads, and stored versions.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Provider name recorded on versions produced by the deterministic analyzer.
pub const PATTERN_PROVIDER: &str = "pattern_analyzer";

/// Commit data handed over by the git collaborator. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    pub hash: String,
    pub message: String,
    pub author: String,
    /// Commit date as reported by git (ISO-8601).
    pub timestamp: String,
    pub changed_paths: Vec<String>,
    pub insertions: u64,
    pub deletions: u64,
}

impl CommitRef {
    pub fn short_hash(&self) -> &str {
        let end = self
            .hash
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.hash.len());
        &self.hash[..end]
    }

    pub fn total_changes(&self) -> u64 {
        self.insertions + self.deletions
    }
}

/// Analysis fidelity. The declaration order is the user-facing toggle cycle.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    /// Deterministic heuristics, no provider.
    #[serde(alias = "pat")]
    Pattern,
    /// Single-provider, short output.
    Brief,
    /// Single-provider, structured output.
    Deep,
}

impl AnalysisMode {
    pub const ALL: [AnalysisMode; 3] = [Self::Pattern, Self::Brief, Self::Deep];

    /// Next mode in the fixed cycle `Pattern → Brief → Deep → Pattern`.
    pub fn next(self) -> Self {
        match self {
            Self::Pattern => Self::Brief,
            Self::Brief => Self::Deep,
            Self::Deep => Self::Pattern,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pattern => "pattern",
            Self::Brief => "brief",
            Self::Deep => "deep",
        }
    }

    pub fn uses_provider(&self) -> bool {
        !matches!(self, Self::Pattern)
    }
}

impl fmt::Display for AnalysisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pattern" | "pat" => Ok(Self::Pattern),
            "brief" => Ok(Self::Brief),
            "deep" => Ok(Self::Deep),
            other => Err(format!("unknown analysis mode: {other}")),
        }
    }
}

/// What a computation produces, before it is numbered and stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisPayload {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    /// Token counts, latency, cost estimate, prompt fingerprint, ...
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl AnalysisPayload {
    pub fn summary_only(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Default::default()
        }
    }

    /// Interpret model output for `mode`. Deep output is expected to be a JSON
    /// object (optionally inside a fenced block); anything else becomes the summary.
    pub fn from_model_text(mode: AnalysisMode, text: &str) -> Self {
        let trimmed = text.trim();
        if mode == AnalysisMode::Deep
            && let Some(parsed) = parse_structured(trimmed)
        {
            return parsed;
        }
        Self::summary_only(trimmed)
    }

    pub fn metadata_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(|v| v.as_u64())
    }

    pub fn metadata_f64(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(|v| v.as_f64())
    }
}

#[derive(Deserialize)]
struct StructuredOutput {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    details: Option<String>,
    #[serde(default)]
    risks: Vec<String>,
    #[serde(default)]
    recommendations: Vec<String>,
}

fn parse_structured(text: &str) -> Option<AnalysisPayload> {
    let body = strip_code_fence(text);
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    if end < start {
        return None;
    }
    let out: StructuredOutput = serde_json::from_str(&body[start..=end]).ok()?;
    if out.summary.trim().is_empty() {
        return None;
    }
    Some(AnalysisPayload {
        summary: out.summary.trim().to_string(),
        details: out.details.filter(|d| !d.trim().is_empty()),
        risks: out.risks,
        recommendations: out.recommendations,
        metadata: serde_json::Map::new(),
    })
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Skip the info string (e.g. "json") on the opening fence line.
    let rest = rest.split_once('\n').map(|(_, r)| r).unwrap_or(rest);
    rest.trim_end().strip_suffix("```").unwrap_or(rest)
}

/// One immutable stored result for a (commit, mode) key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Version {
    pub commit: String,
    pub mode: AnalysisMode,
    pub number: u32,
    pub provider: String,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub risks: Vec<String>,
    pub recommendations: Vec<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at_ms: i64,
}

impl Version {
    /// Flattened text rendering for terminals and plain-text tool output.
    pub fn to_text(&self) -> String {
        let short: String = self.commit.chars().take(8).collect();
        let mut out = format!(
            "{short} ({}, v{}, {})\n  {}\n",
            self.mode, self.number, self.provider, self.summary
        );
        if let Some(ref details) = self.details {
            out.push_str(&format!("  Details: {details}\n"));
        }
        if !self.risks.is_empty() {
            out.push_str(&format!("  Risks: {}\n", self.risks.join("; ")));
        }
        if !self.recommendations.is_empty() {
            out.push_str(&format!(
                "  Recommendations: {}\n",
                self.recommendations.join("; ")
            ));
        }
        out.push_str(&format!("  Created: {}\n", iso_timestamp(self.created_at_ms)));
        out
    }
}

/// View state owned by one interactive front end. Toggling it never touches
/// the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    mode: AnalysisMode,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(AnalysisMode::Pattern)
    }
}

impl Session {
    pub fn new(mode: AnalysisMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> AnalysisMode {
        self.mode
    }

    pub fn advance(&mut self) -> AnalysisMode {
        self.mode = self.mode.next();
        self.mode
    }
}

/// Current epoch time in milliseconds.
pub fn epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// ISO timestamp string (YYYY-MM-DDTHH:MM:SSZ) for an epoch-millis value.
pub fn iso_timestamp(ms: i64) -> String {
    let secs = (ms.max(0) / 1000) as u64;
    let (year, month, day) = days_to_ymd(secs / 86400);
    let day_secs = secs % 86400;
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}Z",
        day_secs / 3600,
        (day_secs % 3600) / 60,
        day_secs % 60
    )
}

/// Convert days since Unix epoch to (year, month, day).
fn days_to_ymd(mut days: u64) -> (u64, u64, u64) {
    // civil_from_days (Howard Hinnant)
    days += 719468;
    let era = days / 146097;
    let doe = days % 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}
