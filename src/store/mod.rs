//! Versioned analysis cache backed by DuckDB.
//!
//! Every `(commit, mode)` key holds an append-only sequence of versions
//! numbered 1, 2, 3, ... without gaps. Appends are serialized through the
//! writer connection and run in one transaction each, so concurrent callers
//! never observe or produce a duplicate number.
//!
//! The API is blocking. Async callers go through `spawn_blocking`.

pub mod schema;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use duckdb::{Connection, params};
use serde::Serialize;

use crate::analysis::{AnalysisMode, AnalysisPayload, Version, epoch_ms};
use crate::error::{DrommageError, Result};

/// Token, cost, and latency counters folded into `provider_usage` on append.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageDelta {
    pub tokens: u64,
    pub cost: f64,
    pub latency_ms: u64,
}

/// Which versions `clear` deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearScope {
    All,
    Mode(AnalysisMode),
    Commit(String),
    Key { commit: String, mode: AnalysisMode },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub total_versions: u64,
    pub keys: u64,
    pub commits: u64,
    pub by_mode: BTreeMap<String, u64>,
    pub by_provider: BTreeMap<String, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_size_bytes: Option<u64>,
    pub corruption_events: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderUsage {
    pub provider: String,
    pub calls: u64,
    pub tokens: u64,
    pub cost: f64,
    pub avg_latency_ms: u64,
    pub last_used_ms: i64,
}

/// Raw row before JSON columns are decoded.
struct Row {
    commit: String,
    mode: String,
    version: i64,
    provider: String,
    summary: String,
    details: Option<String>,
    risks: String,
    recommendations: String,
    metadata: String,
    created_at: i64,
}

const SELECT_COLUMNS: &str = "commit_hash, mode, version, provider, summary, details, \
     risks, recommendations, metadata, created_at";

pub struct Store {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    path: Option<PathBuf>,
    corruption_events: AtomicU64,
}

impl Store {
    /// Open (or create) the cache file, creating parent directories as needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DrommageError::Config(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)?;
        let store = Self::from_connection(conn, Some(path.to_path_buf()))?;
        tracing::info!(path = %path.display(), "analysis cache opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        schema::apply_migrations(&conn)?;
        let reader = conn.try_clone()?;
        Ok(Self {
            writer: Mutex::new(conn),
            reader: Mutex::new(reader),
            path,
            corruption_events: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn writer(&self) -> Result<MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| DrommageError::Internal("cache writer lock poisoned".into()))
    }

    fn reader(&self) -> Result<MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| DrommageError::Internal("cache reader lock poisoned".into()))
    }

    /// Store a new version for `(commit, mode)` and return it.
    ///
    /// The number is `max + 1` within the key, assigned inside the same
    /// transaction as the insert and the usage update.
    pub fn append(
        &self,
        commit: &str,
        mode: AnalysisMode,
        provider: &str,
        payload: &AnalysisPayload,
        usage: Option<UsageDelta>,
    ) -> Result<Version> {
        let risks = encode(&payload.risks)?;
        let recommendations = encode(&payload.recommendations)?;
        let metadata = encode(&payload.metadata)?;
        let created_at = epoch_ms();

        let mut conn = self.writer()?;
        let tx = conn.transaction()?;

        let number: i64 = tx.query_row(
            "SELECT CAST(COALESCE(MAX(version), 0) + 1 AS BIGINT) FROM analyses \
             WHERE commit_hash = ? AND mode = ?",
            params![commit, mode.as_str()],
            |r| r.get(0),
        )?;

        tx.execute(
            "INSERT INTO analyses (commit_hash, mode, version, provider, summary, details, \
             risks, recommendations, metadata, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                commit,
                mode.as_str(),
                number,
                provider,
                payload.summary,
                payload.details,
                risks,
                recommendations,
                metadata,
                created_at
            ],
        )?;

        if let Some(delta) = usage {
            record_usage(&tx, provider, delta, created_at)?;
        }

        tx.commit()?;

        tracing::debug!(commit, mode = %mode, version = number, provider, "appended version");

        Ok(Version {
            commit: commit.to_string(),
            mode,
            number: to_number(number),
            provider: provider.to_string(),
            summary: payload.summary.clone(),
            details: payload.details.clone(),
            risks: payload.risks.clone(),
            recommendations: payload.recommendations.clone(),
            metadata: payload.metadata.clone(),
            created_at_ms: created_at,
        })
    }

    /// Highest readable version for the key. Corrupt rows are skipped and counted.
    pub fn get_latest(&self, commit: &str, mode: AnalysisMode) -> Result<Option<Version>> {
        let rows = self.rows(commit, mode, "DESC")?;
        Ok(rows.into_iter().find_map(|row| self.decode(row)))
    }

    /// Every readable version for the key, oldest first.
    pub fn list_versions(&self, commit: &str, mode: AnalysisMode) -> Result<Vec<Version>> {
        let rows = self.rows(commit, mode, "ASC")?;
        Ok(rows.into_iter().filter_map(|row| self.decode(row)).collect())
    }

    /// A specific version number, if present and readable.
    pub fn get_version(&self, commit: &str, mode: AnalysisMode, number: u32) -> Result<Option<Version>> {
        let conn = self.reader()?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM analyses WHERE commit_hash = ? AND mode = ? AND version = ?"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query_map(params![commit, mode.as_str(), number as i64], read_row)?;
        match rows.next() {
            Some(row) => Ok(self.decode(row?)),
            None => Ok(None),
        }
    }

    fn rows(&self, commit: &str, mode: AnalysisMode, order: &str) -> Result<Vec<Row>> {
        let conn = self.reader()?;
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM analyses WHERE commit_hash = ? AND mode = ? \
             ORDER BY version {order}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![commit, mode.as_str()], read_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn decode(&self, row: Row) -> Option<Version> {
        match try_decode(&row) {
            Ok(v) => Some(v),
            Err(e) => {
                self.corruption_events.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("{}", e.user_message());
                tracing::debug!("corrupt row detail: {e}");
                None
            }
        }
    }

    /// Delete versions in `scope`. Returns the number of rows removed.
    pub fn clear(&self, scope: &ClearScope) -> Result<usize> {
        let conn = self.writer()?;
        let deleted = match scope {
            ClearScope::All => conn.execute("DELETE FROM analyses", [])?,
            ClearScope::Mode(mode) => {
                conn.execute("DELETE FROM analyses WHERE mode = ?", params![mode.as_str()])?
            }
            ClearScope::Commit(commit) => {
                conn.execute("DELETE FROM analyses WHERE commit_hash = ?", params![commit])?
            }
            ClearScope::Key { commit, mode } => conn.execute(
                "DELETE FROM analyses WHERE commit_hash = ? AND mode = ?",
                params![commit, mode.as_str()],
            )?,
        };
        tracing::info!(?scope, deleted, "cleared cached analyses");
        Ok(deleted)
    }

    /// Keep only the newest `keep` versions per key. The newest version of
    /// every key always survives, so `keep` is floored at 1.
    pub fn cleanup(&self, keep: usize) -> Result<usize> {
        let keep = keep.max(1) as i64;
        let conn = self.writer()?;
        let deleted = conn.execute(
            "DELETE FROM analyses WHERE version <= ( \
                SELECT MAX(a2.version) FROM analyses a2 \
                WHERE a2.commit_hash = analyses.commit_hash AND a2.mode = analyses.mode \
             ) - ?",
            params![keep],
        )?;
        tracing::info!(keep, deleted, "cache cleanup");
        Ok(deleted)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.reader()?;
        let (total, oldest, newest): (i64, Option<i64>, Option<i64>) = conn.query_row(
            "SELECT COUNT(*), MIN(created_at), MAX(created_at) FROM analyses",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;
        let keys: i64 = conn.query_row(
            "SELECT COUNT(*) FROM (SELECT DISTINCT commit_hash, mode FROM analyses)",
            [],
            |r| r.get(0),
        )?;
        let commits: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT commit_hash) FROM analyses",
            [],
            |r| r.get(0),
        )?;

        let by_mode = grouped_counts(&conn, "mode")?;
        let by_provider = grouped_counts(&conn, "provider")?;

        let db_size_bytes = self
            .path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len());

        Ok(StoreStats {
            total_versions: total.max(0) as u64,
            keys: keys.max(0) as u64,
            commits: commits.max(0) as u64,
            by_mode,
            by_provider,
            oldest_ms: oldest,
            newest_ms: newest,
            db_size_bytes,
            corruption_events: self.corruption_events(),
        })
    }

    /// Per-provider counters, most used first.
    pub fn provider_usage(&self) -> Result<Vec<ProviderUsage>> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare(
            "SELECT provider, calls, tokens, cost, total_latency_ms, last_used \
             FROM provider_usage ORDER BY calls DESC, provider ASC",
        )?;
        let rows = stmt
            .query_map([], |r| {
                let calls: i64 = r.get(1)?;
                let total_latency: i64 = r.get(4)?;
                Ok(ProviderUsage {
                    provider: r.get(0)?,
                    calls: calls.max(0) as u64,
                    tokens: r.get::<_, i64>(2)?.max(0) as u64,
                    cost: r.get(3)?,
                    avg_latency_ms: if calls > 0 {
                        (total_latency / calls).max(0) as u64
                    } else {
                        0
                    },
                    last_used_ms: r.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Number of unreadable rows encountered since this store was opened.
    pub fn corruption_events(&self) -> u64 {
        self.corruption_events.load(Ordering::Relaxed)
    }
}

fn read_row(r: &duckdb::Row<'_>) -> duckdb::Result<Row> {
    Ok(Row {
        commit: r.get(0)?,
        mode: r.get(1)?,
        version: r.get(2)?,
        provider: r.get(3)?,
        summary: r.get(4)?,
        details: r.get(5)?,
        risks: r.get(6)?,
        recommendations: r.get(7)?,
        metadata: r.get(8)?,
        created_at: r.get(9)?,
    })
}

fn try_decode(row: &Row) -> Result<Version> {
    let mode: AnalysisMode = row.mode.parse().map_err(|e: String| corrupt(row, e))?;
    if row.version < 1 || row.version > u32::MAX as i64 {
        return Err(corrupt(row, format!("invalid version number {}", row.version)));
    }
    let risks: Vec<String> =
        serde_json::from_str(&row.risks).map_err(|e| corrupt(row, format!("risks: {e}")))?;
    let recommendations: Vec<String> = serde_json::from_str(&row.recommendations)
        .map_err(|e| corrupt(row, format!("recommendations: {e}")))?;
    let metadata: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(&row.metadata).map_err(|e| corrupt(row, format!("metadata: {e}")))?;

    Ok(Version {
        commit: row.commit.clone(),
        mode,
        number: row.version as u32,
        provider: row.provider.clone(),
        summary: row.summary.clone(),
        details: row.details.clone(),
        risks,
        recommendations,
        metadata,
        created_at_ms: row.created_at,
    })
}

fn corrupt(row: &Row, message: String) -> DrommageError {
    DrommageError::CacheCorruption {
        commit: row.commit.clone(),
        mode: row.mode.parse().unwrap_or(AnalysisMode::Pattern),
        version: to_number(row.version),
        message,
    }
}

fn to_number(v: i64) -> u32 {
    u32::try_from(v).unwrap_or(0)
}

fn encode<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| DrommageError::Internal(format!("encode: {e}")))
}

fn record_usage(conn: &Connection, provider: &str, delta: UsageDelta, at: i64) -> Result<()> {
    let updated = conn.execute(
        "UPDATE provider_usage SET calls = calls + 1, tokens = tokens + ?, cost = cost + ?, \
         total_latency_ms = total_latency_ms + ?, last_used = ? WHERE provider = ?",
        params![
            delta.tokens as i64,
            delta.cost,
            delta.latency_ms as i64,
            at,
            provider
        ],
    )?;
    if updated == 0 {
        conn.execute(
            "INSERT INTO provider_usage (provider, calls, tokens, cost, total_latency_ms, last_used) \
             VALUES (?, 1, ?, ?, ?, ?)",
            params![
                provider,
                delta.tokens as i64,
                delta.cost,
                delta.latency_ms as i64,
                at
            ],
        )?;
    }
    Ok(())
}

fn grouped_counts(conn: &Connection, column: &str) -> Result<BTreeMap<String, u64>> {
    let sql = format!("SELECT {column}, COUNT(*) FROM analyses GROUP BY {column}");
    let mut stmt = conn.prepare(&sql)?;
    let pairs = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(pairs
        .into_iter()
        .map(|(k, n)| (k, n.max(0) as u64))
        .collect())
}
