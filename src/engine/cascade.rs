//! Cascade recalculation
//!
//! Derived fields are re-derived whenever one of their inputs changes:
//! `trustValue = trustCash / sharesOutstanding` and
//! `premium = (price - trustValue) / trustValue * 100`, both rounded to cents.
//!
//! The calculated NAV is routed through the normal updater under the
//! `CALCULATED` source so a reported NAV on the same filing date still wins.
//! Premium is a pure derivation and is always overwritten.

use anyhow::Result;
use rusqlite::Connection;
use tracing::{debug, info};

use super::updater::{PointInTimeFieldUpdater, UpdateRequest};
use crate::errors::EngineError;
use crate::fields::{render_number, CandidateGuard, FieldDescriptor, NoGuard, TrackedField};
use crate::models::{DerivedChange, Entity, NewHistoryRecord, UpdateOutcome};
use crate::precedence::{PrecedencePolicy, CALCULATED_SOURCE};
use crate::store::{entities, AuditLog};

pub const PREMIUM_FIELD: &str = "premium";

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn load_entity(conn: &Connection, ticker: &str) -> Result<Entity> {
    Ok(entities::load(conn, ticker)?
        .ok_or_else(|| EngineError::EntityNotFound(ticker.to_string()))?)
}

/// Re-derive whatever depends on `field`.
pub fn after_change(
    policy: &PrecedencePolicy,
    conn: &Connection,
    ticker: &str,
    field: TrackedField,
) -> Result<()> {
    match field {
        TrackedField::TrustCash | TrackedField::SharesOutstanding => {
            recompute_trust_value(policy, conn, ticker)?;
        }
        TrackedField::TrustValue => {
            recompute_premium(conn, ticker)?;
        }
        _ => {}
    }
    Ok(())
}

/// Recompute NAV from trust cash and shares outstanding. Returns the updater
/// outcome when a new value was proposed, `None` when nothing needed to change.
pub fn recompute_trust_value(
    policy: &PrecedencePolicy,
    conn: &Connection,
    ticker: &str,
) -> Result<Option<UpdateOutcome>> {
    let entity = load_entity(conn, ticker)?;

    let (Some(cash), Some(shares)) = (entity.trust_cash.value, entity.shares_outstanding.value)
    else {
        return Ok(None);
    };
    if shares <= 0.0 {
        return Ok(None);
    }

    let nav = round2(cash / shares);
    if entity.trust_value.value == Some(nav) {
        // NAV already current; premium may still lag a price change
        recompute_premium(conn, ticker)?;
        return Ok(None);
    }

    // The calculation is as fresh as its freshest input
    let Some(as_of) = entity
        .trust_cash
        .filing_date
        .max(entity.shares_outstanding.filing_date)
    else {
        debug!(%ticker, "Trust inputs undated, NAV not recalculated");
        return Ok(None);
    };

    let guard: &dyn CandidateGuard<f64> = &NoGuard;
    let updater =
        PointInTimeFieldUpdater::new(FieldDescriptor::new(TrackedField::TrustValue, guard), policy);
    let outcome = updater.update(
        conn,
        UpdateRequest {
            ticker,
            candidate: Some(nav),
            source: CALCULATED_SOURCE,
            filing_date: as_of,
            reason: Some("recalculated from trust cash / shares outstanding"),
        },
    )?;

    if outcome.applied {
        recompute_premium(conn, ticker)?;
    } else {
        debug!(%ticker, nav, disposition = ?outcome.disposition, "Calculated NAV not applied");
    }
    Ok(Some(outcome))
}

/// Recompute premium from price and NAV. Only persists and logs a change.
pub fn recompute_premium(conn: &Connection, ticker: &str) -> Result<Option<DerivedChange>> {
    let entity = load_entity(conn, ticker)?;

    let (Some(price), Some(nav)) = (entity.price, entity.trust_value.value) else {
        return Ok(None);
    };
    if nav == 0.0 {
        return Ok(None);
    }

    let premium = round2((price - nav) / nav * 100.0);
    if entity.premium == Some(premium) {
        return Ok(None);
    }

    entities::set_premium(conn, ticker, premium)?;
    let history_written = AuditLog::append_best_effort(
        conn,
        &NewHistoryRecord {
            ticker: ticker.to_string(),
            field: PREMIUM_FIELD.to_string(),
            old_value: entity.premium.map(render_number),
            new_value: Some(render_number(premium)),
            source: Some(CALCULATED_SOURCE.to_string()),
            filing_date: entity.trust_value.filing_date,
            reason: Some(format!("price {} vs NAV {}", render_number(price), render_number(nav))),
        },
    );

    info!(%ticker, old = ?entity.premium, new = premium, "Premium recalculated");

    Ok(Some(DerivedChange {
        field: PREMIUM_FIELD.to_string(),
        previous: entity.premium,
        new: premium,
        history_written,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FactStore;
    use chrono::NaiveDate;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn seed(store: &FactStore, cash: f64, shares: f64, filed: &str) {
        store
            .with_transaction(|tx| {
                entities::insert(tx, "ACME")?;
                let filed = Some(date(filed));
                entities::store_triple(tx, "ACME", TrackedField::TrustCash, &cash, "10-Q", filed)?;
                entities::store_triple(
                    tx,
                    "ACME",
                    TrackedField::SharesOutstanding,
                    &shares,
                    "10-Q",
                    filed,
                )?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(419_200_000.0 / 42_000_000.0), 9.98);
        assert_eq!(round2((10.20 - 9.98) / 9.98 * 100.0), 2.20);
        assert_eq!(round2(-0.004), -0.0);
    }

    #[test]
    fn test_calculated_nav_and_premium() {
        let store = FactStore::open_memory().unwrap();
        let policy = PrecedencePolicy::default();
        seed(&store, 500_000_000.0, 50_000_000.0, "2025-09-30");
        store
            .with_transaction(|tx| entities::set_price(tx, "ACME", 10.25))
            .unwrap();

        let outcome = store
            .with_transaction(|tx| recompute_trust_value(&policy, tx, "ACME"))
            .unwrap()
            .unwrap();
        assert!(outcome.applied);

        let entity = store.read(|c| entities::load(c, "ACME")).unwrap().unwrap();
        assert_eq!(entity.trust_value.value, Some(10.0));
        assert_eq!(entity.trust_value.source.as_deref(), Some(CALCULATED_SOURCE));
        assert_eq!(entity.trust_value.filing_date, Some(date("2025-09-30")));
        assert_eq!(entity.premium, Some(2.5));

        // Nothing changed, nothing logged
        let before = store.read(|c| AuditLog::count(c, "ACME")).unwrap();
        let again = store
            .with_transaction(|tx| recompute_trust_value(&policy, tx, "ACME"))
            .unwrap();
        assert!(again.is_none());
        assert_eq!(store.read(|c| AuditLog::count(c, "ACME")).unwrap(), before);
    }

    #[test]
    fn test_reported_nav_same_day_is_not_overridden() {
        let store = FactStore::open_memory().unwrap();
        let policy = PrecedencePolicy::default();
        seed(&store, 500_000_000.0, 50_000_000.0, "2025-09-30");
        store
            .with_transaction(|tx| {
                let filed = Some(date("2025-09-30"));
                entities::store_triple(tx, "ACME", TrackedField::TrustValue, &10.03, "10-Q", filed)
            })
            .unwrap();

        let outcome = store
            .with_transaction(|tx| recompute_trust_value(&policy, tx, "ACME"))
            .unwrap()
            .unwrap();
        assert!(!outcome.applied);

        let entity = store.read(|c| entities::load(c, "ACME")).unwrap().unwrap();
        assert_eq!(entity.trust_value.value, Some(10.03));
    }

    #[test]
    fn test_no_nav_without_shares() {
        let store = FactStore::open_memory().unwrap();
        let policy = PrecedencePolicy::default();
        seed(&store, 500_000_000.0, 0.0, "2025-09-30");
        let outcome = store
            .with_transaction(|tx| recompute_trust_value(&policy, tx, "ACME"))
            .unwrap();
        assert!(outcome.is_none());
    }
}
