//! Redemption aggregation
//!
//! Redemptions are deltas, not replacements. Each disclosure is applied at
//! most once, keyed by its filing date, and the resulting share count and
//! trust cash are pushed through the point-in-time updater like any other
//! fact. Trust cash is not assumed to fall monotonically: extension deposits
//! arrive as ordinary `trustCash` assertions between redemption events.

use anyhow::Result;
use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::json;
use tracing::{debug, info, warn};

use super::cascade::{self, round2};
use super::updater::{PointInTimeFieldUpdater, UpdateRequest};
use crate::errors::EngineError;
use crate::fields::{CandidateGuard, FieldDescriptor, NoGuard, TrackedField};
use crate::models::{
    filing_date_key, NewHistoryRecord, RedemptionEvent, RedemptionState, RedemptionStatus,
};
use crate::precedence::{normalize_source, PrecedencePolicy};
use crate::store::{entities, AuditLog};

pub const REDEMPTION_FIELD: &str = "redemptions";
pub const REDEMPTION_STATUS_FIELD: &str = "redemptionsOccurred";

fn totals_summary(state: &RedemptionState) -> String {
    json!({
        "sharesRedeemedTotal": state.shares_redeemed_total,
        "redemptionAmountTotal": state.redemption_amount_total,
        "redemptionPercentage": state.redemption_percentage,
        "eventCount": state.event_count,
    })
    .to_string()
}

/// Apply one redemption disclosure. Returns false if this filing date was
/// already applied.
pub fn record_event(
    policy: &PrecedencePolicy,
    conn: &Connection,
    ticker: &str,
    event: &RedemptionEvent,
) -> Result<bool> {
    let entity = entities::load(conn, ticker)?
        .ok_or_else(|| EngineError::EntityNotFound(ticker.to_string()))?;
    let mut state = entities::load_redemption_state(conn, ticker)?;

    let key = filing_date_key(event.filing_date);
    if state.processed_filing_dates.contains(&key) {
        debug!(%ticker, filing_date = %key, "Redemption filing already applied");
        return Ok(false);
    }

    let previous = state.clone();
    let shares_before = entity.shares_outstanding.value;
    let cash_before = entity.trust_cash.value;

    state.shares_redeemed_total += event.shares_redeemed;
    state.redemption_amount_total += event.redemption_amount;
    state.event_count += 1;
    // Cumulative redemptions over outstanding-before-this-event plus the
    // cumulative total, this event included
    state.redemption_percentage = shares_before.and_then(|before| {
        let base = before + state.shares_redeemed_total;
        (base > 0.0).then(|| round2(state.shares_redeemed_total / base * 100.0))
    });
    state.last_redemption_date = state.last_redemption_date.max(Some(event.filing_date));
    state.redemptions_occurred = RedemptionStatus::Occurred;
    state.processed_filing_dates.insert(key.clone());
    entities::save_redemption_state(conn, ticker, &state)?;

    let source = normalize_source(&event.source);
    let reason = event
        .reason
        .clone()
        .unwrap_or_else(|| format!("redemption disclosed {}", key));

    let guard: &dyn CandidateGuard<f64> = &NoGuard;
    let mut inputs_changed = false;
    for (field, before, delta) in [
        (TrackedField::SharesOutstanding, shares_before, event.shares_redeemed),
        (TrackedField::TrustCash, cash_before, event.redemption_amount),
    ] {
        let Some(before) = before else {
            warn!(%ticker, %field, "No stored value to apply redemption against");
            continue;
        };
        let updater = PointInTimeFieldUpdater::new(FieldDescriptor::new(field, guard), policy);
        let outcome = updater.update(
            conn,
            UpdateRequest {
                ticker,
                candidate: Some((before - delta).max(0.0)),
                source: &source,
                filing_date: event.filing_date,
                reason: Some(&reason),
            },
        )?;
        if outcome.applied {
            inputs_changed = true;
        } else {
            debug!(
                %ticker,
                %field,
                disposition = ?outcome.disposition,
                "Redemption-adjusted value not applied"
            );
        }
    }

    AuditLog::append_best_effort(
        conn,
        &NewHistoryRecord {
            ticker: ticker.to_string(),
            field: REDEMPTION_FIELD.to_string(),
            old_value: Some(totals_summary(&previous)),
            new_value: Some(totals_summary(&state)),
            source: Some(source.clone()),
            filing_date: Some(event.filing_date),
            reason: Some(reason.clone()),
        },
    );

    if inputs_changed {
        cascade::recompute_trust_value(policy, conn, ticker)?;
    }

    info!(
        %ticker,
        filing_date = %key,
        shares_redeemed = event.shares_redeemed,
        amount = event.redemption_amount,
        shares_redeemed_total = state.shares_redeemed_total,
        event_count = state.event_count,
        "Redemption recorded"
    );
    Ok(true)
}

/// Record that a filing was checked and disclosed no redemptions. The first
/// determination sticks, and a confirmed redemption is never erased.
pub fn mark_none_found(
    conn: &Connection,
    ticker: &str,
    source: &str,
    filing_date: NaiveDate,
    reason: Option<&str>,
) -> Result<bool> {
    if !entities::exists(conn, ticker)? {
        return Err(EngineError::EntityNotFound(ticker.to_string()).into());
    }
    let mut state = entities::load_redemption_state(conn, ticker)?;

    match state.redemptions_occurred {
        RedemptionStatus::Occurred => {
            debug!(%ticker, "Redemptions already confirmed, none-found ignored");
            return Ok(false);
        }
        RedemptionStatus::NoneFound if state.has_zero_totals() => {
            debug!(%ticker, "No-redemption status already recorded");
            return Ok(false);
        }
        _ => {}
    }

    let previous_status = state.redemptions_occurred;
    state.redemptions_occurred = RedemptionStatus::NoneFound;
    state.shares_redeemed_total = 0.0;
    state.redemption_amount_total = 0.0;
    state.redemption_percentage = Some(0.0);
    state.event_count = 0;
    entities::save_redemption_state(conn, ticker, &state)?;

    let source = normalize_source(source);
    AuditLog::append_best_effort(
        conn,
        &NewHistoryRecord {
            ticker: ticker.to_string(),
            field: REDEMPTION_STATUS_FIELD.to_string(),
            old_value: Some(previous_status.as_str().to_string()),
            new_value: Some(RedemptionStatus::NoneFound.as_str().to_string()),
            source: Some(source.clone()),
            filing_date: Some(filing_date),
            reason: Some(reason.unwrap_or("no redemptions disclosed").to_string()),
        },
    );

    info!(%ticker, %source, %filing_date, "Marked no redemptions");
    Ok(true)
}
