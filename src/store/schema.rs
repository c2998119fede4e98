//! DuckDB schema definitions and migration support for the analysis cache.

use std::fmt;

use crate::analysis::epoch_ms;

// ---------------------------------------------------------------------------
// DDL constants
// ---------------------------------------------------------------------------

pub const DDL_SCHEMA_VERSION: &str = "\
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at BIGINT NOT NULL
);";

/// One row per stored version. JSON-encoded list/map columns are decoded on read;
/// a row that fails to decode is treated as corrupt and skipped.
pub const DDL_ANALYSES: &str = "\
CREATE TABLE IF NOT EXISTS analyses (
    commit_hash TEXT NOT NULL,
    mode TEXT NOT NULL,
    version BIGINT NOT NULL,
    provider TEXT NOT NULL,
    summary TEXT NOT NULL,
    details TEXT,
    risks TEXT NOT NULL,
    recommendations TEXT NOT NULL,
    metadata TEXT NOT NULL,
    created_at BIGINT NOT NULL,
    PRIMARY KEY (commit_hash, mode, version)
);";

pub const DDL_PROVIDER_USAGE: &str = "\
CREATE TABLE IF NOT EXISTS provider_usage (
    provider TEXT PRIMARY KEY,
    calls BIGINT NOT NULL,
    tokens BIGINT NOT NULL,
    cost DOUBLE NOT NULL,
    total_latency_ms BIGINT NOT NULL,
    last_used BIGINT NOT NULL
);";

pub const DDL_INDEX_ANALYSES_CREATED: &str = "\
CREATE INDEX IF NOT EXISTS idx_analyses_created ON analyses(created_at);";

/// All DDL statements for schema version 1, in order.
pub const SCHEMA_V1: &[&str] = &[
    DDL_SCHEMA_VERSION,
    DDL_ANALYSES,
    DDL_PROVIDER_USAGE,
    DDL_INDEX_ANALYSES_CREATED,
];

/// Current schema version.
pub const CURRENT_VERSION: i32 = 1;

// ---------------------------------------------------------------------------
// Migration support
// ---------------------------------------------------------------------------

/// Apply schema migrations up to `CURRENT_VERSION`.
///
/// Idempotent. Refuses to open a database written by a newer schema.
pub fn apply_migrations(conn: &duckdb::Connection) -> Result<i32, MigrationError> {
    conn.execute_batch(DDL_SCHEMA_VERSION)
        .map_err(MigrationError::Duckdb)?;

    let current = get_current_version(conn)?;

    if current > CURRENT_VERSION {
        return Err(MigrationError::Newer {
            found: current,
            supported: CURRENT_VERSION,
        });
    }
    if current == CURRENT_VERSION {
        return Ok(current);
    }

    if current < 1 {
        for ddl in SCHEMA_V1 {
            conn.execute_batch(ddl).map_err(MigrationError::Duckdb)?;
        }
        record_version(conn, 1)?;
    }

    Ok(CURRENT_VERSION)
}

fn get_current_version(conn: &duckdb::Connection) -> Result<i32, MigrationError> {
    let mut stmt = conn
        .prepare("SELECT COALESCE(MAX(version), 0) FROM schema_version")
        .map_err(MigrationError::Duckdb)?;
    let version: i32 = stmt
        .query_row([], |row| row.get(0))
        .map_err(MigrationError::Duckdb)?;
    Ok(version)
}

fn record_version(conn: &duckdb::Connection, version: i32) -> Result<(), MigrationError> {
    conn.execute(
        "INSERT INTO schema_version (version, applied_at) VALUES (?, ?)",
        duckdb::params![version, epoch_ms()],
    )
    .map_err(MigrationError::Duckdb)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum MigrationError {
    Duckdb(duckdb::Error),
    Newer { found: i32, supported: i32 },
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationError::Duckdb(e) => write!(f, "DuckDB migration error: {e}"),
            MigrationError::Newer { found, supported } => write!(
                f,
                "cache schema v{found} is newer than supported v{supported}"
            ),
        }
    }
}

impl std::error::Error for MigrationError {}
