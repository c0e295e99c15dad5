//! Audit Log
//!
//! Append-only record of every accepted mutation. Appends made inside an
//! engine transaction go through [`AuditLog::append_best_effort`], which
//! wraps the insert in a savepoint: a failed append is rolled back on its own
//! and never takes the field mutation down with it.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, Row};
use tracing::warn;

use super::entities::normalize_ticker;
use crate::models::{HistoryRecord, NewHistoryRecord};

const MAX_QUERY_LIMIT: usize = 1000;

fn map_history_row(row: &Row<'_>) -> rusqlite::Result<HistoryRecord> {
    Ok(HistoryRecord {
        id: row.get(0)?,
        ticker: row.get(1)?,
        field: row.get(2)?,
        old_value: row.get(3)?,
        new_value: row.get(4)?,
        source: row.get(5)?,
        filing_date: row.get(6)?,
        reason: row.get(7)?,
        recorded_at: row.get(8)?,
    })
}

pub struct AuditLog;

impl AuditLog {
    /// Insert one record and return its id.
    pub fn append(conn: &Connection, record: &NewHistoryRecord) -> Result<i64> {
        conn.execute(
            "INSERT INTO field_history
                (ticker, field, old_value, new_value, source, filing_date, reason, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                normalize_ticker(&record.ticker),
                &record.field,
                record.old_value.as_deref(),
                record.new_value.as_deref(),
                record.source.as_deref(),
                record.filing_date,
                record.reason.as_deref(),
                Utc::now(),
            ],
        )
        .context("append field history")?;
        Ok(conn.last_insert_rowid())
    }

    /// Append inside a savepoint. Returns whether the record was written;
    /// failures are logged and swallowed.
    pub fn append_best_effort(conn: &Connection, record: &NewHistoryRecord) -> bool {
        if let Err(e) = conn.execute_batch("SAVEPOINT history_append") {
            warn!(
                ticker = %record.ticker,
                field = %record.field,
                error = %e,
                "History savepoint unavailable, skipping audit record"
            );
            return false;
        }

        match Self::append(conn, record) {
            Ok(_) => {
                if let Err(e) = conn.execute_batch("RELEASE history_append") {
                    warn!(
                        ticker = %record.ticker,
                        error = %e,
                        "Failed to release history savepoint"
                    );
                }
                true
            }
            Err(e) => {
                warn!(
                    ticker = %record.ticker,
                    field = %record.field,
                    error = %e,
                    "History write failed; field mutation kept"
                );
                if let Err(e) =
                    conn.execute_batch("ROLLBACK TO history_append; RELEASE history_append")
                {
                    warn!(
                        ticker = %record.ticker,
                        error = %e,
                        "Failed to unwind history savepoint"
                    );
                }
                false
            }
        }
    }

    /// Records for an entity, optionally one field, newest first.
    pub fn query(
        conn: &Connection,
        ticker: &str,
        field: Option<&str>,
        limit: usize,
    ) -> Result<Vec<HistoryRecord>> {
        let limit = limit.clamp(1, MAX_QUERY_LIMIT) as i64;
        let ticker = normalize_ticker(ticker);

        let records = match field {
            Some(field) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, ticker, field, old_value, new_value, source, filing_date,
                            reason, recorded_at
                     FROM field_history WHERE ticker = ?1 AND field = ?2
                     ORDER BY id DESC LIMIT ?3",
                )?;
                let rows = stmt.query_map(params![ticker, field, limit], map_history_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, ticker, field, old_value, new_value, source, filing_date,
                            reason, recorded_at
                     FROM field_history WHERE ticker = ?1
                     ORDER BY id DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![ticker, limit], map_history_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };

        Ok(records)
    }

    pub fn count(conn: &Connection, ticker: &str) -> Result<usize> {
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM field_history WHERE ticker = ?1",
            params![normalize_ticker(ticker)],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }
}
