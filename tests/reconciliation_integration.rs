//! End-to-end tests for the reconciliation engine
//!
//! Exercises the public API against in-memory and on-disk stores: redemption
//! aggregation, cascade consistency, status stickiness, target vetting, the
//! audit trail and concurrent writers.

use std::sync::Arc;
use std::thread;

use chrono::{Duration, NaiveDate};
use spac_reconciler::engine::redemptions::REDEMPTION_FIELD;
use spac_reconciler::{
    ChannelAlertSink, Disposition, EngineConfig, FactAssertion, FactStore, FactValue,
    NullAlertSink, PrecedencePolicy, ReconciliationEngine, RedemptionEvent, RedemptionStatus,
    TargetLegitimacyValidator, TrackedField,
};

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn memory_engine() -> ReconciliationEngine {
    ReconciliationEngine::new(
        FactStore::open_memory().unwrap(),
        PrecedencePolicy::default(),
        TargetLegitimacyValidator::new(),
        Arc::new(NullAlertSink),
    )
}

/// Entity at 50,000,000 shares and $500,000,000 in trust per its 10-Q.
fn seeded_engine() -> ReconciliationEngine {
    let engine = memory_engine();
    engine.onboard("ACME").unwrap();
    let as_of = date("2025-09-30");
    for (field, value) in [
        (TrackedField::SharesOutstanding, 50_000_000.0),
        (TrackedField::TrustCash, 500_000_000.0),
    ] {
        engine
            .update_numeric("ACME", field, Some(value), "10-Q", as_of, None)
            .unwrap();
    }
    engine
}

fn redemption(shares: f64, amount: f64, filed: &str) -> RedemptionEvent {
    RedemptionEvent {
        shares_redeemed: shares,
        redemption_amount: amount,
        filing_date: date(filed),
        source: "8-K".to_string(),
        reason: None,
    }
}

#[test]
fn redemptions_accumulate_and_cascade_to_nav_and_premium() {
    let engine = seeded_engine();
    assert_eq!(engine.entity("ACME").unwrap().trust_value.value, Some(10.0));

    assert!(engine
        .record_redemption("ACME", &redemption(5_000_000.0, 50_500_000.0, "2025-11-01"))
        .unwrap());
    assert!(engine
        .record_redemption("ACME", &redemption(3_000_000.0, 30_300_000.0, "2025-11-15"))
        .unwrap());

    let state = engine.redemption_state("ACME").unwrap();
    assert_eq!(state.shares_redeemed_total, 8_000_000.0);
    assert_eq!(state.redemption_amount_total, 80_800_000.0);
    assert_eq!(state.event_count, 2);
    // 8M / (45M outstanding before the second event + 8M)
    assert_eq!(state.redemption_percentage, Some(15.09));
    assert_eq!(state.last_redemption_date, Some(date("2025-11-15")));
    assert_eq!(state.redemptions_occurred, RedemptionStatus::Occurred);

    let entity = engine.entity("ACME").unwrap();
    assert_eq!(entity.shares_outstanding.value, Some(42_000_000.0));
    assert_eq!(entity.trust_cash.value, Some(419_200_000.0));
    assert_eq!(entity.trust_value.value, Some(9.98));
    assert_eq!(entity.trust_value.source.as_deref(), Some("CALCULATED"));
    assert_eq!(entity.trust_value.filing_date, Some(date("2025-11-15")));

    let change = engine.set_price("ACME", 10.20).unwrap().unwrap();
    assert_eq!(change.new, 2.20);
    assert_eq!(engine.entity("ACME").unwrap().premium, Some(2.20));

    // Same price again: nothing to persist
    assert!(engine.set_price("ACME", 10.20).unwrap().is_none());

    let audit = engine.history("ACME", Some(REDEMPTION_FIELD), 10).unwrap();
    assert_eq!(audit.len(), 2);
    assert_eq!(audit[0].filing_date, Some(date("2025-11-15")));
}

#[test]
fn replayed_redemption_filing_changes_nothing() {
    let engine = seeded_engine();
    let event = redemption(5_000_000.0, 50_500_000.0, "2025-11-01");

    assert!(engine.record_redemption("ACME", &event).unwrap());
    let state = engine.redemption_state("ACME").unwrap();
    let entity = engine.entity("ACME").unwrap();
    let audit_len = engine.history("ACME", None, 1000).unwrap().len();

    assert!(!engine.record_redemption("ACME", &event).unwrap());
    assert_eq!(engine.redemption_state("ACME").unwrap(), state);
    let after = engine.entity("ACME").unwrap();
    assert_eq!(after.shares_outstanding, entity.shares_outstanding);
    assert_eq!(after.trust_cash, entity.trust_cash);
    assert_eq!(after.trust_value, entity.trust_value);
    assert_eq!(engine.history("ACME", None, 1000).unwrap().len(), audit_len);
}

#[test]
fn extension_deposit_between_redemptions_is_not_double_counted() {
    let engine = seeded_engine();
    engine
        .record_redemption("ACME", &redemption(5_000_000.0, 50_500_000.0, "2025-11-01"))
        .unwrap();

    // Sponsor deposit raises the trust balance
    let outcome = engine
        .update_numeric(
            "ACME",
            TrackedField::TrustCash,
            Some(451_000_000.0),
            "8-K",
            date("2025-11-05"),
            Some("extension deposit"),
        )
        .unwrap();
    assert!(outcome.applied);

    engine
        .record_redemption("ACME", &redemption(3_000_000.0, 30_300_000.0, "2025-11-15"))
        .unwrap();

    let entity = engine.entity("ACME").unwrap();
    assert_eq!(entity.trust_cash.value, Some(420_700_000.0));
    let state = engine.redemption_state("ACME").unwrap();
    assert_eq!(state.redemption_amount_total, 80_800_000.0);
}

#[test]
fn confirmed_redemptions_are_never_downgraded() {
    let engine = seeded_engine();
    engine
        .record_redemption("ACME", &redemption(5_000_000.0, 50_500_000.0, "2025-11-01"))
        .unwrap();

    let reason = Some("no redemption table found");
    assert!(!engine
        .mark_no_redemptions("ACME", "10-Q", date("2025-12-31"), reason)
        .unwrap());

    let state = engine.redemption_state("ACME").unwrap();
    assert_eq!(state.redemptions_occurred, RedemptionStatus::Occurred);
    assert_eq!(state.shares_redeemed_total, 5_000_000.0);
}

#[test]
fn none_found_is_audited_once() {
    let engine = seeded_engine();
    assert!(engine
        .mark_no_redemptions("ACME", "10-Q", date("2025-09-30"), None)
        .unwrap());
    assert!(!engine
        .mark_no_redemptions("ACME", "10-K", date("2025-12-31"), None)
        .unwrap());

    let audit = engine.history("ACME", Some("redemptionsOccurred"), 10).unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].new_value.as_deref(), Some("false"));
}

#[test]
fn blank_candidates_never_erase_stored_values() {
    let engine = seeded_engine();
    let blanks = [
        None,
        Some(FactValue::Text("".into())),
        Some(FactValue::Text("N/A".into())),
    ];
    for blank in blanks {
        let outcome = engine
            .apply(&FactAssertion {
                ticker: "ACME".into(),
                field: "trustCash".into(),
                candidate_value: blank,
                source: "10-K".into(),
                filing_date: date("2026-03-01"),
                reason: None,
            })
            .unwrap();
        assert!(!outcome.applied);
    }
    let trust_cash = engine.entity("ACME").unwrap().trust_cash;
    assert_eq!(trust_cash.value, Some(500_000_000.0));
}

#[test]
fn reported_nav_outranks_calculated_on_same_filing() {
    let engine = seeded_engine();
    let outcome = engine
        .update_numeric(
            "ACME",
            TrackedField::TrustValue,
            Some(10.02),
            "10-Q",
            date("2025-09-30"),
            None,
        )
        .unwrap();
    assert!(outcome.applied);

    // Recomputing from the same-dated inputs must not override the reported figure
    let recomputed = engine.recompute_trust_value("ACME").unwrap().unwrap();
    assert!(!recomputed.applied);
    assert!(matches!(recomputed.disposition, Disposition::RejectedByPrecedence(_)));

    let nav = engine.entity("ACME").unwrap().trust_value;
    assert_eq!(nav.value, Some(10.02));
    assert_eq!(nav.source.as_deref(), Some("10-Q"));
}

#[test]
fn sponsor_entity_is_queued_not_stored() {
    let engine = memory_engine();
    engine.onboard("VACH").unwrap();

    let outcome = engine
        .update_target_name(
            "VACH",
            Some("Voyager Acquisition Sponsor Holdco LLC"),
            "8-K",
            date("2025-08-01"),
            None,
        )
        .unwrap();
    assert!(!outcome.applied);
    assert_eq!(
        outcome.disposition,
        Disposition::RejectedByValidation("contains sponsor keyword 'sponsor'".to_string())
    );
    assert_eq!(engine.entity("VACH").unwrap().target_name.value, None);

    let open = engine.open_anomalies(10).unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].ticker, "VACH");
    let note = Some("sponsor vehicle, not a target");
    assert!(engine.resolve_anomaly(open[0].id, note).unwrap());
    assert!(engine.open_anomalies(10).unwrap().is_empty());
    assert!(!engine.resolve_anomaly(open[0].id, None).unwrap());

    let outcome = engine
        .update_target_name(
            "VACH",
            Some("Acme Technology Inc."),
            "S-4",
            date("2025-08-15"),
            None,
        )
        .unwrap();
    assert!(outcome.applied);
    assert_eq!(
        engine.entity("VACH").unwrap().target_name.value.as_deref(),
        Some("Acme Technology Inc")
    );
}

#[test]
fn history_is_newest_first_with_provenance() {
    let engine = memory_engine();
    engine.onboard("ACME").unwrap();
    for (value, source, filed, reason) in [
        (1.0e9, "8-K", "2025-05-01", "LOI"),
        (1.1e9, "S-4", "2025-07-01", "registration"),
    ] {
        engine
            .update_numeric(
                "ACME",
                TrackedField::DealValue,
                Some(value),
                source,
                date(filed),
                Some(reason),
            )
            .unwrap();
    }

    let rows = engine.history("ACME", Some("dealValue"), 10).unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].old_value.as_deref(), Some("1000000000"));
    assert_eq!(rows[0].new_value.as_deref(), Some("1100000000"));
    assert_eq!(rows[0].source.as_deref(), Some("S-4"));
    assert_eq!(rows[0].reason.as_deref(), Some("registration"));
    assert_eq!(rows[1].old_value, None);
    assert!(rows[0].id > rows[1].id);
}

#[test]
fn alert_sink_silent_on_normal_outcomes() {
    let (sink, rx) = ChannelAlertSink::pair();
    let engine = ReconciliationEngine::new(
        FactStore::open_memory().unwrap(),
        PrecedencePolicy::default(),
        TargetLegitimacyValidator::new(),
        Arc::new(sink),
    );
    engine.onboard("ACME").unwrap();
    for (value, source, filed) in [(2e8, "DEFM14A", "2025-06-01"), (1e8, "8-K", "2025-01-01")] {
        engine
            .update_numeric("ACME", TrackedField::MinCash, Some(value), source, date(filed), None)
            .unwrap();
    }
    engine
        .update_target_name("ACME", Some("Exhibit 99.1"), "8-K", date("2025-06-01"), None)
        .unwrap();
    assert!(rx.try_recv().is_err());
}

#[test]
fn on_disk_store_survives_reopen_and_rejects_history_edits() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("facts.db");
    let config = EngineConfig {
        db_path: db_path.to_str().unwrap().to_string(),
        ..EngineConfig::default()
    };

    {
        let engine = ReconciliationEngine::from_config(&config).unwrap();
        engine.onboard("ACME").unwrap();
        engine
            .update_numeric(
                "ACME",
                TrackedField::PipeSize,
                Some(7.5e7),
                "8-K",
                date("2025-06-01"),
                None,
            )
            .unwrap();
        engine
            .record_redemption("ACME", &redemption(1.0, 10.0, "2025-11-01"))
            .unwrap();
    }

    let engine = ReconciliationEngine::from_config(&config).unwrap();
    assert_eq!(engine.entity("ACME").unwrap().pipe_size.value, Some(7.5e7));
    let state = engine.redemption_state("ACME").unwrap();
    assert!(state.processed_filing_dates.contains("2025-11-01"));
    assert!(!engine
        .record_redemption("ACME", &redemption(1.0, 10.0, "2025-11-01"))
        .unwrap());
    drop(engine);

    let conn = rusqlite::Connection::open(&db_path).unwrap();
    assert!(conn.execute("UPDATE field_history SET new_value = 'x'", []).is_err());
    assert!(conn.execute("DELETE FROM field_history", []).is_err());
}

const CONTEST_DAYS: i64 = 40;

/// Two writers race on one field over the same run of filing dates while
/// both replay the same redemption filings. Filings may land out of date
/// order, so only the dedup invariants are checked for redemptions. `a` and `b` may be the same
/// engine or two engines over one database file.
fn contest(a: &ReconciliationEngine, b: &ReconciliationEngine) {
    a.onboard("ACME").unwrap();
    let as_of = date("2025-09-30");
    for (field, value) in [
        (TrackedField::SharesOutstanding, 50_000_000.0),
        (TrackedField::TrustCash, 500_000_000.0),
    ] {
        a.update_numeric("ACME", field, Some(value), "10-Q", as_of, None).unwrap();
    }

    let base = date("2025-01-01");
    let events: Vec<RedemptionEvent> = (1..=5)
        .map(|i| redemption(1_000_000.0, 10_100_000.0, &format!("2025-11-0{}", i)))
        .collect();

    let writer = |engine: &ReconciliationEngine, source: &str, tag: f64| {
        let mut applied = 0;
        let mut redemptions = 0;
        for day in 1..=CONTEST_DAYS {
            let value = day as f64 * 1000.0 + tag;
            let filed = base + Duration::days(day);
            let outcome = engine
                .update_numeric("ACME", TrackedField::DealValue, Some(value), source, filed, None)
                .unwrap();
            if outcome.applied {
                applied += 1;
            }
            if let Some(event) = events.get((day - 1) as usize % 8) {
                if engine.record_redemption("ACME", event).unwrap() {
                    redemptions += 1;
                }
            }
        }
        (applied, redemptions)
    };

    let ((applied_a, redeemed_a), (applied_b, redeemed_b)) = thread::scope(|s| {
        let first = s.spawn(|| writer(a, "8-K", 1.0));
        let second = s.spawn(|| writer(b, "S-4", 2.0));
        (first.join().unwrap(), second.join().unwrap())
    });

    // S-4 outranks 8-K on the final shared date, whichever arrived first
    let deal = a.entity("ACME").unwrap().deal_value;
    assert_eq!(deal.value, Some(CONTEST_DAYS as f64 * 1000.0 + 2.0));
    assert_eq!(deal.source.as_deref(), Some("S-4"));
    assert_eq!(deal.filing_date, Some(base + Duration::days(CONTEST_DAYS)));
    assert_eq!(b.entity("ACME").unwrap().deal_value, deal);

    // Every accepted write left exactly one audit row
    let audit = a.history("ACME", Some("dealValue"), 1000).unwrap();
    assert_eq!(audit.len(), applied_a + applied_b);

    // Each redemption filing was applied by exactly one writer
    assert_eq!(redeemed_a + redeemed_b, events.len());
    let state = a.redemption_state("ACME").unwrap();
    assert_eq!(state.event_count, events.len() as u32);
    assert_eq!(state.shares_redeemed_total, 5_000_000.0);
    assert_eq!(state.redemption_amount_total, 50_500_000.0);
    assert_eq!(state.processed_filing_dates.len(), events.len());
}

#[test]
fn concurrent_writers_on_shared_engine_serialize() {
    let engine = memory_engine();
    contest(&engine, &engine);
}

#[test]
fn concurrent_engines_on_one_database_serialize() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        db_path: dir.path().join("facts.db").to_str().unwrap().to_string(),
        ..EngineConfig::default()
    };
    let a = ReconciliationEngine::from_config(&config).unwrap();
    let b = ReconciliationEngine::from_config(&config).unwrap();
    contest(&a, &b);
}
