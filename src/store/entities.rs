//! Entity rows and redemption state.

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;

use crate::fields::{FieldValue, TrackedField};
use crate::models::{Entity, FieldTriple, RedemptionState, RedemptionStatus};

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Create the entity row if it does not exist. Returns whether it was created.
pub fn insert(conn: &Connection, ticker: &str) -> Result<bool> {
    let now = now_rfc3339();
    let changes = conn
        .execute(
            "INSERT OR IGNORE INTO entities (ticker, created_at, updated_at) VALUES (?1, ?2, ?2)",
            params![normalize_ticker(ticker), now],
        )
        .context("insert entity")?;
    Ok(changes > 0)
}

pub fn normalize_ticker(ticker: &str) -> String {
    ticker.trim().to_ascii_uppercase()
}

pub fn exists(conn: &Connection, ticker: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM entities WHERE ticker = ?1",
            params![normalize_ticker(ticker)],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn triple_at<T: FieldValue>(row: &Row<'_>, base: usize) -> rusqlite::Result<FieldTriple<T>> {
    Ok(FieldTriple {
        value: row.get(base)?,
        source: row.get(base + 1)?,
        filing_date: row.get(base + 2)?,
    })
}

/// Load one field's triple. `None` when the entity does not exist.
pub fn load_triple<T: FieldValue>(
    conn: &Connection,
    ticker: &str,
    field: TrackedField,
) -> Result<Option<FieldTriple<T>>> {
    let col = field.column();
    let sql = format!(
        "SELECT {col}, {col}_source, {col}_filing_date FROM entities WHERE ticker = ?1",
        col = col
    );
    let triple = conn
        .query_row(&sql, params![normalize_ticker(ticker)], |row| triple_at(row, 0))
        .optional()
        .with_context(|| format!("load {} for {}", field, ticker))?;
    Ok(triple)
}

/// Overwrite one field's triple.
pub fn store_triple<T: FieldValue>(
    conn: &Connection,
    ticker: &str,
    field: TrackedField,
    value: &T,
    source: &str,
    filing_date: Option<NaiveDate>,
) -> Result<()> {
    let col = field.column();
    let sql = format!(
        "UPDATE entities SET {col} = ?1, {col}_source = ?2, {col}_filing_date = ?3, \
         updated_at = ?4 WHERE ticker = ?5",
        col = col
    );
    let changes = conn
        .execute(
            &sql,
            params![value, source, filing_date, now_rfc3339(), normalize_ticker(ticker)],
        )
        .with_context(|| format!("store {} for {}", field, ticker))?;
    anyhow::ensure!(changes == 1, "entity {} vanished during update", ticker);
    Ok(())
}

/// Load the whole entity row.
pub fn load(conn: &Connection, ticker: &str) -> Result<Option<Entity>> {
    let mut columns = vec!["ticker".to_string()];
    for field in TrackedField::ALL {
        let col = field.column();
        columns.push(col.to_string());
        columns.push(format!("{}_source", col));
        columns.push(format!("{}_filing_date", col));
    }
    columns.extend(["price", "premium", "updated_at"].map(String::from));

    let sql = format!(
        "SELECT {} FROM entities WHERE ticker = ?1",
        columns.join(", ")
    );
    let price_idx = 1 + TrackedField::ALL.len() * 3;

    let entity = conn
        .query_row(&sql, params![normalize_ticker(ticker)], |row| {
            let ticker: String = row.get(0)?;
            let mut entity = Entity::new(&ticker);
            for (i, field) in TrackedField::ALL.iter().enumerate() {
                let base = 1 + i * 3;
                match entity.numeric_mut(*field) {
                    Some(slot) => *slot = triple_at(row, base)?,
                    None => entity.target_name = triple_at(row, base)?,
                }
            }
            entity.price = row.get(price_idx)?;
            entity.premium = row.get(price_idx + 1)?;
            entity.updated_at = row.get(price_idx + 2)?;
            Ok(entity)
        })
        .optional()
        .with_context(|| format!("load entity {}", ticker))?;
    Ok(entity)
}

pub fn set_price(conn: &Connection, ticker: &str, price: f64) -> Result<()> {
    conn.execute(
        "UPDATE entities SET price = ?1, updated_at = ?2 WHERE ticker = ?3",
        params![price, now_rfc3339(), normalize_ticker(ticker)],
    )
    .context("store price")?;
    Ok(())
}

pub fn set_premium(conn: &Connection, ticker: &str, premium: f64) -> Result<()> {
    conn.execute(
        "UPDATE entities SET premium = ?1, updated_at = ?2 WHERE ticker = ?3",
        params![premium, now_rfc3339(), normalize_ticker(ticker)],
    )
    .context("store premium")?;
    Ok(())
}

// =============================================================================
// Redemption state
// =============================================================================

/// Load redemption state; an entity with no row yet has the default state.
pub fn load_redemption_state(conn: &Connection, ticker: &str) -> Result<RedemptionState> {
    let state = conn
        .query_row(
            "SELECT shares_redeemed_total, redemption_amount_total, redemption_percentage,
                    event_count, last_redemption_date, redemptions_occurred, processed_filing_dates
             FROM redemption_state WHERE ticker = ?1",
            params![normalize_ticker(ticker)],
            |row| {
                let processed_json: String = row.get(6)?;
                Ok((
                    RedemptionState {
                        shares_redeemed_total: row.get(0)?,
                        redemption_amount_total: row.get(1)?,
                        redemption_percentage: row.get(2)?,
                        event_count: row.get(3)?,
                        last_redemption_date: row.get(4)?,
                        redemptions_occurred: RedemptionStatus::from_db(row.get(5)?),
                        processed_filing_dates: BTreeSet::new(),
                    },
                    processed_json,
                ))
            },
        )
        .optional()
        .context("load redemption state")?;

    match state {
        Some((mut state, processed_json)) => {
            state.processed_filing_dates = serde_json::from_str(&processed_json)
                .context("decode processed filing dates")?;
            Ok(state)
        }
        None => Ok(RedemptionState::default()),
    }
}

pub fn save_redemption_state(
    conn: &Connection,
    ticker: &str,
    state: &RedemptionState,
) -> Result<()> {
    let processed_json = serde_json::to_string(&state.processed_filing_dates)?;
    conn.execute(
        "INSERT INTO redemption_state (
            ticker, shares_redeemed_total, redemption_amount_total, redemption_percentage,
            event_count, last_redemption_date, redemptions_occurred, processed_filing_dates,
            updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(ticker) DO UPDATE SET
            shares_redeemed_total = excluded.shares_redeemed_total,
            redemption_amount_total = excluded.redemption_amount_total,
            redemption_percentage = excluded.redemption_percentage,
            event_count = excluded.event_count,
            last_redemption_date = excluded.last_redemption_date,
            redemptions_occurred = excluded.redemptions_occurred,
            processed_filing_dates = excluded.processed_filing_dates,
            updated_at = excluded.updated_at",
        params![
            normalize_ticker(ticker),
            state.shares_redeemed_total,
            state.redemption_amount_total,
            state.redemption_percentage,
            state.event_count,
            state.last_redemption_date,
            state.redemptions_occurred.to_db(),
            processed_json,
            now_rfc3339(),
        ],
    )
    .context("save redemption state")?;
    Ok(())
}
