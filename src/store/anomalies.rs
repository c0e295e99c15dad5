//! Target anomaly queue
//!
//! Rejected target-name candidates land here for the investigation workflow
//! instead of being dropped.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, Row};

use super::entities::normalize_ticker;
use crate::models::TargetAnomaly;

pub const STATUS_OPEN: &str = "open";
pub const STATUS_RESOLVED: &str = "resolved";

/// Anomaly before insertion.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTargetAnomaly<'a> {
    pub ticker: &'a str,
    pub candidate: &'a str,
    pub sanitized: &'a str,
    pub rejection_reason: &'a str,
    pub source: &'a str,
    pub filing_date: NaiveDate,
    pub reason: Option<&'a str>,
}

fn map_anomaly_row(row: &Row<'_>) -> rusqlite::Result<TargetAnomaly> {
    Ok(TargetAnomaly {
        id: row.get(0)?,
        ticker: row.get(1)?,
        candidate: row.get(2)?,
        sanitized: row.get(3)?,
        rejection_reason: row.get(4)?,
        source: row.get(5)?,
        filing_date: row.get(6)?,
        reason: row.get(7)?,
        detected_at: row.get(8)?,
        status: row.get(9)?,
        resolution_note: row.get(10)?,
    })
}

pub struct AnomalyLog;

impl AnomalyLog {
    pub fn record(conn: &Connection, anomaly: &NewTargetAnomaly<'_>) -> Result<i64> {
        conn.execute(
            "INSERT INTO target_anomalies
                (ticker, candidate, sanitized, rejection_reason, source, filing_date, reason,
                 detected_at, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                normalize_ticker(anomaly.ticker),
                anomaly.candidate,
                anomaly.sanitized,
                anomaly.rejection_reason,
                anomaly.source,
                anomaly.filing_date,
                anomaly.reason,
                Utc::now(),
                STATUS_OPEN,
            ],
        )
        .context("record target anomaly")?;
        Ok(conn.last_insert_rowid())
    }

    /// Open anomalies, newest first.
    pub fn list_open(conn: &Connection, limit: usize) -> Result<Vec<TargetAnomaly>> {
        let limit = limit.clamp(1, 1000) as i64;
        let mut stmt = conn.prepare_cached(
            "SELECT id, ticker, candidate, sanitized, rejection_reason, source, filing_date,
                    reason, detected_at, status, resolution_note
             FROM target_anomalies WHERE status = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let anomalies = stmt
            .query_map(params![STATUS_OPEN, limit], map_anomaly_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(anomalies)
    }

    /// Mark an anomaly resolved. Returns false if it was not open.
    pub fn resolve(conn: &Connection, id: i64, note: Option<&str>) -> Result<bool> {
        let changes = conn
            .execute(
                "UPDATE target_anomalies SET status = ?1, resolution_note = ?2
                 WHERE id = ?3 AND status = ?4",
                params![STATUS_RESOLVED, note, id, STATUS_OPEN],
            )
            .context("resolve target anomaly")?;
        Ok(changes > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FactStore;

    #[test]
    fn test_record_list_resolve() {
        let store = FactStore::open_memory().unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 8, 1).unwrap();

        let id = store
            .with_transaction(|tx| {
                AnomalyLog::record(
                    tx,
                    &NewTargetAnomaly {
                        ticker: "vach",
                        candidate: "Voyager Acquisition Sponsor Holdco LLC.",
                        sanitized: "Voyager Acquisition Sponsor Holdco LLC",
                        rejection_reason: "contains sponsor keyword 'sponsor'",
                        source: "8-K",
                        filing_date: date,
                        reason: Some("press release"),
                    },
                )
            })
            .unwrap();

        let open = store.read(|c| AnomalyLog::list_open(c, 10)).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, id);
        assert_eq!(open[0].ticker, "VACH");
        assert_eq!(open[0].status, STATUS_OPEN);

        assert!(store
            .with_transaction(|tx| AnomalyLog::resolve(tx, id, Some("sponsor entity, ignore")))
            .unwrap());
        assert!(!store
            .with_transaction(|tx| AnomalyLog::resolve(tx, id, None))
            .unwrap());
        assert!(store.read(|c| AnomalyLog::list_open(c, 10)).unwrap().is_empty());
    }
}
