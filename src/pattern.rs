//! Deterministic commit analysis used by `AnalysisMode::Pattern`.
//!
//! Only the output contract matters to the rest of the crate: a summary line,
//! details, risk and recommendation lists, and `change_type` / `magnitude` /
//! `file_categories` metadata. The heuristics are intentionally shallow.

use std::collections::BTreeMap;

use crate::analysis::{AnalysisPayload, CommitRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Feature,
    BugFix,
    Docs,
    Refactor,
    Security,
    Breaking,
    Cleanup,
    Performance,
    Test,
    Config,
    Unknown,
}

impl ChangeType {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Feature => "Feature",
            Self::BugFix => "Bug Fix",
            Self::Docs => "Documentation",
            Self::Refactor => "Refactor",
            Self::Security => "Security",
            Self::Breaking => "Breaking",
            Self::Cleanup => "Cleanup",
            Self::Performance => "Performance",
            Self::Test => "Test",
            Self::Config => "Configuration",
            Self::Unknown => "Change",
        }
    }
}

/// Conventional-commit prefixes, checked before keyword heuristics.
const PREFIXES: &[(&str, ChangeType)] = &[
    ("feat", ChangeType::Feature),
    ("feature", ChangeType::Feature),
    ("fix", ChangeType::BugFix),
    ("docs", ChangeType::Docs),
    ("refactor", ChangeType::Refactor),
    ("perf", ChangeType::Performance),
    ("test", ChangeType::Test),
    ("chore", ChangeType::Cleanup),
    ("config", ChangeType::Config),
    ("build", ChangeType::Config),
    ("ci", ChangeType::Config),
    ("security", ChangeType::Security),
];

/// Keyword heuristics in precedence order.
const KEYWORDS: &[(&[&str], ChangeType)] = &[
    (&["breaking", "incompatible"], ChangeType::Breaking),
    (&["security", "vulnerab", "cve"], ChangeType::Security),
    (&["performance", "optimiz", "speed up", "faster"], ChangeType::Performance),
    (&["refactor", "restructure", "rename"], ChangeType::Refactor),
    (&["clean", "remove", "delete", "drop "], ChangeType::Cleanup),
    (&["fix", "resolve", "repair", "bug"], ChangeType::BugFix),
    (&["add", "implement", "create", "introduce"], ChangeType::Feature),
];

const CATEGORY_RULES: &[(&str, &[&str], &[&str])] = &[
    // (category, extensions, path fragments)
    ("docs", &[".md", ".rst", ".adoc", ".txt"], &["docs/", "readme", "changelog"]),
    ("tests", &[], &["tests/", "test_", "_test.", ".spec.", "__tests__/"]),
    (
        "config",
        &[".json", ".yaml", ".yml", ".toml", ".ini", ".cfg", ".conf"],
        &["dockerfile", "makefile", ".env"],
    ),
    ("database", &[".sql"], &["migration", "schema", "db/"]),
    ("security", &[".pem", ".key", ".crt"], &["auth", "security", "crypto", "password", "token"]),
    (
        "source",
        &[".rs", ".py", ".go", ".java", ".js", ".ts", ".tsx", ".jsx", ".c", ".cpp", ".rb", ".php", ".cs"],
        &[],
    ),
];

/// Risk indicators matched against the lowercased commit message.
const RISK_MESSAGE_RULES: &[(&[&str], &str)] = &[
    (&["breaking change", "incompatible", "major version"], "Possible breaking change"),
    (&["security", "vuln", "cve", "password", "token"], "Touches security-sensitive behavior"),
    (&["migration", "schema"], "Database schema change"),
    (&["memory leak", "slow"], "Performance regression risk"),
];

#[derive(Debug, Default)]
pub struct PatternAnalyzer;

impl PatternAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, commit: &CommitRef) -> AnalysisPayload {
        let categories = categorize(&commit.changed_paths);
        let change_type = detect_change_type(&commit.message, &categories);
        let magnitude = magnitude(commit.insertions, commit.deletions);
        let risks = identify_risks(commit, &categories);
        let recommendations = recommend(commit, &categories, &risks);

        let file_count = commit.changed_paths.len();
        let summary = format!(
            "{}: {} ({} file{}, +{} -{})",
            change_type.label(),
            first_line(&commit.message),
            file_count,
            if file_count == 1 { "" } else { "s" },
            commit.insertions,
            commit.deletions
        );

        let details = if categories.is_empty() {
            format!("{magnitude}.")
        } else {
            let parts: Vec<String> = categories
                .iter()
                .map(|(cat, files)| format!("{cat}: {}", files.len()))
                .collect();
            format!("{magnitude}. Files by area: {}.", parts.join(", "))
        };

        let mut metadata = serde_json::Map::new();
        metadata.insert("change_type".into(), change_type.label().into());
        metadata.insert("magnitude".into(), magnitude.into());
        metadata.insert(
            "file_categories".into(),
            serde_json::to_value(&categories).unwrap_or_default(),
        );

        AnalysisPayload {
            summary,
            details: Some(details),
            risks,
            recommendations,
            metadata,
        }
    }
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or("").trim()
}

fn categorize(paths: &[String]) -> BTreeMap<&'static str, Vec<String>> {
    let mut out: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
    for path in paths {
        let lower = path.to_lowercase();
        let category = CATEGORY_RULES
            .iter()
            .find(|(_, exts, frags)| {
                exts.iter().any(|e| lower.ends_with(e)) || frags.iter().any(|f| lower.contains(f))
            })
            .map(|(cat, _, _)| *cat)
            .unwrap_or("other");
        out.entry(category).or_default().push(path.clone());
    }
    out
}

fn detect_change_type(message: &str, categories: &BTreeMap<&str, Vec<String>>) -> ChangeType {
    let lower = first_line(message).to_lowercase();

    // "type(scope)!: subject" or "type: subject"
    if let Some((head, _)) = lower.split_once(':') {
        let kind = head.split('(').next().unwrap_or(head).trim_end_matches('!');
        if head.ends_with('!') {
            return ChangeType::Breaking;
        }
        if let Some((_, ct)) = PREFIXES.iter().find(|(p, _)| *p == kind) {
            return *ct;
        }
    }

    if let Some((_, ct)) = KEYWORDS
        .iter()
        .find(|(words, _)| words.iter().any(|w| lower.contains(w)))
    {
        return *ct;
    }

    // Fall back to what the files say when the message is uninformative.
    let only = |cat: &str| categories.len() == 1 && categories.contains_key(cat);
    if only("docs") {
        ChangeType::Docs
    } else if only("tests") {
        ChangeType::Test
    } else if only("config") {
        ChangeType::Config
    } else {
        ChangeType::Unknown
    }
}

fn magnitude(insertions: u64, deletions: u64) -> &'static str {
    if insertions == 0 && deletions == 0 {
        return "No line changes";
    }
    if deletions == 0 {
        return "Pure addition";
    }
    let ratio = insertions as f64 / deletions as f64;
    if ratio > 5.0 {
        "Major addition"
    } else if ratio > 2.0 {
        "Expansion"
    } else if ratio > 0.5 {
        "Balanced change"
    } else if ratio < 0.2 {
        "Major cleanup"
    } else {
        "Reduction"
    }
}

fn identify_risks(commit: &CommitRef, categories: &BTreeMap<&str, Vec<String>>) -> Vec<String> {
    let lower = commit.message.to_lowercase();
    let mut risks: Vec<String> = RISK_MESSAGE_RULES
        .iter()
        .filter(|(words, _)| words.iter().any(|w| lower.contains(w)))
        .map(|(_, risk)| risk.to_string())
        .collect();

    if categories.contains_key("security") {
        push_unique(&mut risks, "Touches security-sensitive files");
    }
    if categories.contains_key("database") {
        push_unique(&mut risks, "Database schema change");
    }
    if commit.total_changes() > 1000 {
        push_unique(&mut risks, "Large change set is hard to review");
    }
    if commit.changed_paths.len() > 20 {
        push_unique(&mut risks, "Wide blast radius across many files");
    }
    risks
}

fn recommend(
    commit: &CommitRef,
    categories: &BTreeMap<&str, Vec<String>>,
    risks: &[String],
) -> Vec<String> {
    let mut recs = Vec::new();
    if categories.contains_key("source") && !categories.contains_key("tests") {
        recs.push("Add or update tests for the changed source files".to_string());
    }
    if categories.contains_key("database") {
        recs.push("Verify the migration is reversible".to_string());
    }
    if risks.iter().any(|r| r.contains("security")) {
        recs.push("Request a security-focused review".to_string());
    }
    if commit.total_changes() > 1000 {
        recs.push("Consider splitting into smaller commits".to_string());
    }
    if first_line(&commit.message).len() < 10 {
        recs.push("Write a more descriptive commit message".to_string());
    }
    recs
}

fn push_unique(list: &mut Vec<String>, item: &str) {
    if !list.iter().any(|existing| existing == item) {
        list.push(item.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(message: &str, paths: &[&str], ins: u64, del: u64) -> CommitRef {
        CommitRef {
            hash: "abc123".into(),
            message: message.into(),
            author: "dev".into(),
            timestamp: "2025-01-01".into(),
            changed_paths: paths.iter().map(|p| p.to_string()).collect(),
            insertions: ins,
            deletions: del,
        }
    }

    #[test]
    fn conventional_prefix_wins() {
        let c = commit("fix(parser): handle empty input", &["src/parser.rs"], 4, 1);
        let p = PatternAnalyzer::new().analyze(&c);
        assert!(p.summary.starts_with("Bug Fix: fix(parser): handle empty input"));
        assert_eq!(p.metadata["change_type"], "Bug Fix");
    }

    #[test]
    fn bang_marks_breaking() {
        let c = commit("feat!: drop v1 api", &["src/api.rs"], 10, 200);
        let p = PatternAnalyzer::new().analyze(&c);
        assert_eq!(p.metadata["change_type"], "Breaking");
        assert_eq!(p.metadata["magnitude"], "Major cleanup");
    }

    #[test]
    fn docs_only_commit_detected_from_files() {
        let c = commit("Update words", &["README.md", "docs/guide.md"], 5, 5);
        let p = PatternAnalyzer::new().analyze(&c);
        assert_eq!(p.metadata["change_type"], "Documentation");
        assert!(p.recommendations.iter().all(|r| !r.contains("tests")));
    }

    #[test]
    fn source_without_tests_recommends_tests() {
        let c = commit("Add retry loop to client", &["src/client.rs"], 40, 2);
        let p = PatternAnalyzer::new().analyze(&c);
        assert!(p.recommendations.iter().any(|r| r.contains("tests")));
        assert_eq!(p.metadata["magnitude"], "Major addition");
    }

    #[test]
    fn security_files_raise_risk() {
        let c = commit("Rotate keys", &["src/auth/session.rs"], 3, 3);
        let p = PatternAnalyzer::new().analyze(&c);
        assert!(p.risks.iter().any(|r| r.contains("security-sensitive")));
        assert!(p.recommendations.iter().any(|r| r.contains("security")));
    }

    #[test]
    fn analysis_is_deterministic() {
        let c = commit("refactor: split module", &["src/a.rs", "tests/a.rs"], 30, 30);
        let a = PatternAnalyzer::new().analyze(&c);
        let b = PatternAnalyzer::new().analyze(&c);
        assert_eq!(a, b);
    }
}
