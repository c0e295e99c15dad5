//! Schema migrations
//!
//! Applied once when a store is opened. Nothing downstream issues DDL.

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use tracing::info;

use crate::fields::TrackedField;

/// Connection pragmas, applied on every open.
pub(crate) const PRAGMAS_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;
PRAGMA foreign_keys = ON;
"#;

const META_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;
"#;

const V1_SUPPORT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS redemption_state (
    ticker TEXT PRIMARY KEY REFERENCES entities(ticker),
    shares_redeemed_total REAL NOT NULL DEFAULT 0,
    redemption_amount_total REAL NOT NULL DEFAULT 0,
    redemption_percentage REAL,
    event_count INTEGER NOT NULL DEFAULT 0,
    last_redemption_date TEXT,
    redemptions_occurred INTEGER,
    processed_filing_dates TEXT NOT NULL DEFAULT '[]',
    updated_at TEXT NOT NULL
) WITHOUT ROWID;

-- Append-only; rows are never updated or deleted
CREATE TABLE IF NOT EXISTS field_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ticker TEXT NOT NULL,
    field TEXT NOT NULL,
    old_value TEXT,
    new_value TEXT,
    source TEXT,
    filing_date TEXT,
    reason TEXT,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_field_history_ticker_field
    ON field_history(ticker, field, id DESC);

CREATE INDEX IF NOT EXISTS idx_field_history_ticker
    ON field_history(ticker, id DESC);

CREATE TRIGGER IF NOT EXISTS field_history_no_update
    BEFORE UPDATE ON field_history
BEGIN
    SELECT RAISE(ABORT, 'field_history is append-only');
END;

CREATE TRIGGER IF NOT EXISTS field_history_no_delete
    BEFORE DELETE ON field_history
BEGIN
    SELECT RAISE(ABORT, 'field_history is append-only');
END;

CREATE TABLE IF NOT EXISTS target_anomalies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ticker TEXT NOT NULL,
    candidate TEXT NOT NULL,
    sanitized TEXT NOT NULL,
    rejection_reason TEXT NOT NULL,
    source TEXT NOT NULL,
    filing_date TEXT NOT NULL,
    reason TEXT,
    detected_at TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'open',
    resolution_note TEXT
);

CREATE INDEX IF NOT EXISTS idx_target_anomalies_status
    ON target_anomalies(status, id DESC);
"#;

pub const SCHEMA_VERSION: i64 = 1;

/// `entities` DDL, one column triple per tracked field.
fn entities_ddl() -> String {
    let mut columns = vec!["ticker TEXT PRIMARY KEY".to_string()];
    for field in TrackedField::ALL {
        let col = field.column();
        let value_type = if field.is_text() { "TEXT" } else { "REAL" };
        columns.push(format!("{} {}", col, value_type));
        columns.push(format!("{}_source TEXT", col));
        columns.push(format!("{}_filing_date TEXT", col));
    }
    columns.push("price REAL".to_string());
    columns.push("premium REAL".to_string());
    columns.push("created_at TEXT NOT NULL".to_string());
    columns.push("updated_at TEXT NOT NULL".to_string());

    format!(
        "CREATE TABLE IF NOT EXISTS entities (\n    {}\n) WITHOUT ROWID;",
        columns.join(",\n    ")
    )
}

pub(crate) fn current_version(conn: &Connection) -> Result<i64> {
    conn.execute_batch(META_SQL)?;
    let version: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_meta WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .ok();
    Ok(version.and_then(|v| v.parse().ok()).unwrap_or(0))
}

/// Bring the database up to [`SCHEMA_VERSION`].
pub(crate) fn migrate(conn: &mut Connection) -> Result<()> {
    let from = current_version(conn)?;
    if from >= SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction().context("begin migration")?;
    if from < 1 {
        tx.execute_batch(&entities_ddl())
            .context("create entities table")?;
        tx.execute_batch(V1_SUPPORT_SQL)
            .context("create support tables")?;
    }
    tx.execute(
        "INSERT INTO schema_meta (key, value) VALUES ('schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![SCHEMA_VERSION.to_string()],
    )?;
    tx.commit().context("commit migration")?;

    info!(from, to = SCHEMA_VERSION, "Schema migrated");
    Ok(())
}
