//! Commit data from the `git` CLI.

use std::path::{Path, PathBuf};

use crate::analysis::CommitRef;
use crate::error::DrommageError;

const RECORD_SEP: char = '\x1e';
const FIELD_SEP: char = '\x1f';

/// hash, author, author date (ISO-8601), raw body. Numstat lines follow the last separator.
const LOG_FORMAT: &str = "--format=%x1e%H%x1f%an%x1f%aI%x1f%B%x1f";

#[derive(Debug, Clone)]
pub struct GitLog {
    repo: PathBuf,
}

impl GitLog {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self { repo: repo.into() }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    /// Returns true if `repo` is inside a git work tree.
    pub async fn is_repository(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .await
            .map(|out| out.trim() == "true")
            .unwrap_or(false)
    }

    /// One commit by hash, short hash, or other revision expression.
    pub async fn show(&self, rev: &str) -> Result<CommitRef, DrommageError> {
        check_rev(rev)?;
        let out = self.run(&["log", "-1", "--numstat", LOG_FORMAT, rev, "--"]).await?;
        parse_log(&out)
            .into_iter()
            .next()
            .ok_or_else(|| DrommageError::Git(format!("unknown revision: {rev}")))
    }

    /// Most recent commits on HEAD, newest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<CommitRef>, DrommageError> {
        let n = format!("-{}", limit.max(1));
        let out = self.run(&["log", &n, "--numstat", LOG_FORMAT]).await?;
        Ok(parse_log(&out))
    }

    /// Commits after `date` (anything `git log --since` accepts), newest first.
    pub async fn since(&self, date: &str) -> Result<Vec<CommitRef>, DrommageError> {
        check_rev(date)?;
        let since = format!("--since={date}");
        let out = self.run(&["log", &since, "--numstat", LOG_FORMAT]).await?;
        Ok(parse_log(&out))
    }

    async fn run(&self, args: &[&str]) -> Result<String, DrommageError> {
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(&self.repo)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DrommageError::Git(format!("failed to run git: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let first = stderr.lines().next().unwrap_or("").trim();
            tracing::debug!(?args, "git failed: {stderr}");
            return Err(DrommageError::Git(if first.is_empty() {
                format!("git exited with {}", output.status)
            } else {
                first.to_string()
            }));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Arguments that look like options are refused before reaching git.
fn check_rev(rev: &str) -> Result<(), DrommageError> {
    let rev = rev.trim();
    if rev.is_empty() || rev.starts_with('-') {
        return Err(DrommageError::Git(format!("invalid revision: {rev:?}")));
    }
    Ok(())
}

/// Parse `git log --numstat` output produced with [`LOG_FORMAT`].
pub fn parse_log(output: &str) -> Vec<CommitRef> {
    output
        .split(RECORD_SEP)
        .filter(|r| !r.trim().is_empty())
        .filter_map(parse_record)
        .collect()
}

fn parse_record(record: &str) -> Option<CommitRef> {
    let mut fields = record.splitn(5, FIELD_SEP);
    let hash = fields.next()?.trim().to_string();
    let author = fields.next()?.trim().to_string();
    let timestamp = fields.next()?.trim().to_string();
    let message = fields.next()?.trim().to_string();
    let numstat = fields.next().unwrap_or("");

    if hash.is_empty() {
        return None;
    }

    let mut changed_paths = Vec::new();
    let (mut insertions, mut deletions) = (0u64, 0u64);
    for line in numstat.lines() {
        let mut cols = line.splitn(3, '\t');
        let (Some(ins), Some(del), Some(path)) = (cols.next(), cols.next(), cols.next()) else {
            continue;
        };
        // Binary files report "-" for both counts.
        insertions += ins.trim().parse::<u64>().unwrap_or(0);
        deletions += del.trim().parse::<u64>().unwrap_or(0);
        changed_paths.push(path.trim().to_string());
    }

    Some(CommitRef {
        hash,
        message,
        author,
        timestamp,
        changed_paths,
        insertions,
        deletions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(hash: &str, msg: &str, numstat: &str) -> String {
        format!("\x1e{hash}\x1fAda\x1f2025-01-02T03:04:05+00:00\x1f{msg}\n\x1f\n{numstat}")
    }

    #[test]
    fn parses_multiple_records() {
        let out = format!(
            "{}{}",
            record("aaa111", "feat: one\n\nbody line", "3\t1\tsrc/a.rs\n-\t-\tlogo.png\n"),
            record("bbb222", "fix: two", "10\t0\tREADME.md\n")
        );
        let commits = parse_log(&out);
        assert_eq!(commits.len(), 2);

        let a = &commits[0];
        assert_eq!(a.hash, "aaa111");
        assert_eq!(a.author, "Ada");
        assert_eq!(a.message, "feat: one\n\nbody line");
        assert_eq!(a.changed_paths, vec!["src/a.rs", "logo.png"]);
        assert_eq!((a.insertions, a.deletions), (3, 1));

        assert_eq!(commits[1].insertions, 10);
        assert_eq!(commits[1].timestamp, "2025-01-02T03:04:05+00:00");
    }

    #[test]
    fn commit_without_files() {
        let commits = parse_log(&record("ccc333", "empty", ""));
        assert_eq!(commits.len(), 1);
        assert!(commits[0].changed_paths.is_empty());
        assert_eq!(commits[0].total_changes(), 0);
    }

    #[test]
    fn garbage_is_ignored() {
        assert!(parse_log("").is_empty());
        assert!(parse_log("\x1e\n").is_empty());
        assert!(parse_log("\x1eonly-hash").is_empty());
    }

    #[test]
    fn option_like_revisions_are_refused() {
        assert!(check_rev("--output=/tmp/x").is_err());
        assert!(check_rev("  ").is_err());
        assert!(check_rev("HEAD~1").is_ok());
    }
}
