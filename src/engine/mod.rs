//! Reconciliation Engine
//!
//! Public entry point. Every call runs as one immediate transaction on the
//! fact store: the field mutation, its cascade and the best-effort history
//! append commit together or not at all. Failures of the primary mutation are
//! rolled back, surfaced as [`EngineError::Persistence`] and forwarded to the
//! alert sink.

pub mod cascade;
pub mod redemptions;
pub mod updater;

use anyhow::Context;
use chrono::NaiveDate;
use rusqlite::{Connection, Transaction};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::alerts::{AlertSink, FailureAlert, LogAlertSink, WebhookAlertSink};
use crate::config::EngineConfig;
use crate::errors::{EngineError, EngineResult};
use crate::fields::{CandidateGuard, FactValue, FieldDescriptor, NoGuard, TrackedField};
use crate::models::{
    BatchStats, DerivedChange, Disposition, Entity, FactAssertion, HistoryRecord, RedemptionEvent,
    RedemptionState, TargetAnomaly, UpdateOutcome,
};
use crate::precedence::PrecedencePolicy;
use crate::store::entities::{self, normalize_ticker};
use crate::store::{AnomalyLog, AuditLog, FactStore};
use crate::target_validator::TargetLegitimacyValidator;
use updater::{PointInTimeFieldUpdater, UpdateRequest};

pub struct ReconciliationEngine {
    store: FactStore,
    policy: PrecedencePolicy,
    validator: TargetLegitimacyValidator,
    alerts: Arc<dyn AlertSink>,
}

impl ReconciliationEngine {
    pub fn new(
        store: FactStore,
        policy: PrecedencePolicy,
        validator: TargetLegitimacyValidator,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            store,
            policy,
            validator,
            alerts,
        }
    }

    /// Open the configured store, load priority tables and wire the alert
    /// sink (webhook when configured, structured log otherwise).
    pub fn from_config(config: &EngineConfig) -> anyhow::Result<Self> {
        let tables = config
            .load_precedence()
            .map_err(|e| EngineError::Config(format!("{:#}", e)))?;
        let policy = PrecedencePolicy::new(tables);
        let store = FactStore::open(&config.db_path)?;

        let alerts: Arc<dyn AlertSink> = match &config.alert_webhook_url {
            Some(url) => Arc::new(
                WebhookAlertSink::spawn(url, config.alert_timeout)
                    .context("Failed to start alert webhook worker")?,
            ),
            None => Arc::new(LogAlertSink),
        };

        Ok(Self::new(store, policy, TargetLegitimacyValidator::new(), alerts))
    }

    pub fn store(&self) -> &FactStore {
        &self.store
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Create the entity row. Idempotent.
    pub fn onboard(&self, ticker: &str) -> EngineResult<bool> {
        let ticker = normalize_ticker(ticker);
        let created = self.run("onboard", &ticker, json!({}), |tx| entities::insert(tx, &ticker))?;
        if created {
            info!(%ticker, "Entity onboarded");
        }
        Ok(created)
    }

    /// Apply one extracted fact, dispatching on its field name.
    pub fn apply(&self, assertion: &FactAssertion) -> EngineResult<UpdateOutcome> {
        let field = TrackedField::parse(&assertion.field).ok_or_else(|| {
            EngineError::InvalidAssertion(format!("unknown field '{}'", assertion.field))
        })?;
        let reason = assertion.reason.as_deref();

        if field.is_text() {
            let candidate = match &assertion.candidate_value {
                None => None,
                Some(FactValue::Text(s)) => Some(s.as_str()),
                Some(FactValue::Number(n)) => {
                    return Err(EngineError::InvalidAssertion(format!(
                        "{} expects text, got number {}",
                        field, n
                    )))
                }
            };
            self.update_target_name(
                &assertion.ticker,
                candidate,
                &assertion.source,
                assertion.filing_date,
                reason,
            )
        } else {
            // Unparseable amounts are treated as blank
            let candidate = assertion
                .candidate_value
                .as_ref()
                .and_then(FactValue::as_number);
            self.update_numeric(
                &assertion.ticker,
                field,
                candidate,
                &assertion.source,
                assertion.filing_date,
                reason,
            )
        }
    }

    /// Apply many facts. Each assertion is its own transaction; one failure
    /// does not abort the rest.
    pub fn apply_batch(&self, assertions: &[FactAssertion]) -> BatchStats {
        let mut stats = BatchStats::default();

        for assertion in assertions {
            match self.apply(assertion) {
                Ok(outcome) => match outcome.disposition {
                    Disposition::Applied(_) => stats.applied += 1,
                    Disposition::RejectedByPrecedence(_) => stats.rejected += 1,
                    Disposition::RejectedByValidation(_) => stats.invalid += 1,
                    Disposition::Unchanged => stats.unchanged += 1,
                },
                Err(EngineError::InvalidAssertion(msg)) => {
                    warn!(
                        ticker = %assertion.ticker,
                        field = %assertion.field,
                        error = %msg,
                        "Skipping invalid assertion"
                    );
                    stats.invalid += 1;
                }
                Err(e) => {
                    warn!(
                        ticker = %assertion.ticker,
                        field = %assertion.field,
                        error = %e,
                        "Assertion failed"
                    );
                    stats.failed += 1;
                }
            }
        }

        info!(
            total = stats.total(),
            applied = stats.applied,
            rejected = stats.rejected,
            unchanged = stats.unchanged,
            invalid = stats.invalid,
            failed = stats.failed,
            "Batch applied"
        );
        stats
    }

    pub fn update_numeric(
        &self,
        ticker: &str,
        field: TrackedField,
        candidate: Option<f64>,
        source: &str,
        filing_date: NaiveDate,
        reason: Option<&str>,
    ) -> EngineResult<UpdateOutcome> {
        if field.is_text() {
            return Err(EngineError::InvalidAssertion(format!("{} is not numeric", field)));
        }
        let ticker = normalize_ticker(ticker);
        let guard: &dyn CandidateGuard<f64> = &NoGuard;
        let updater =
            PointInTimeFieldUpdater::new(FieldDescriptor::new(field, guard), &self.policy);

        let context = json!({
            "field": field.name(),
            "candidate": candidate,
            "source": source,
            "filingDate": filing_date.to_string(),
        });
        self.run("update_field", &ticker, context, |tx| {
            updater.update_and_cascade(
                tx,
                UpdateRequest {
                    ticker: &ticker,
                    candidate,
                    source,
                    filing_date,
                    reason,
                },
            )
        })
    }

    pub fn update_target_name(
        &self,
        ticker: &str,
        candidate: Option<&str>,
        source: &str,
        filing_date: NaiveDate,
        reason: Option<&str>,
    ) -> EngineResult<UpdateOutcome> {
        let ticker = normalize_ticker(ticker);
        let guard: &dyn CandidateGuard<String> = &self.validator;
        let updater = PointInTimeFieldUpdater::new(
            FieldDescriptor::new(TrackedField::TargetName, guard),
            &self.policy,
        );

        let context = json!({
            "field": TrackedField::TargetName.name(),
            "candidate": candidate,
            "source": source,
            "filingDate": filing_date.to_string(),
        });
        self.run("update_field", &ticker, context, |tx| {
            updater.update_and_cascade(
                tx,
                UpdateRequest {
                    ticker: &ticker,
                    candidate: candidate.map(str::to_string),
                    source,
                    filing_date,
                    reason,
                },
            )
        })
    }

    /// Apply a redemption disclosure. Returns false for an already-applied
    /// filing date.
    pub fn record_redemption(&self, ticker: &str, event: &RedemptionEvent) -> EngineResult<bool> {
        for (name, v) in [
            ("sharesRedeemed", event.shares_redeemed),
            ("redemptionAmount", event.redemption_amount),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(EngineError::InvalidAssertion(format!(
                    "{} must be a non-negative amount, got {}",
                    name, v
                )));
            }
        }

        let ticker = normalize_ticker(ticker);
        let context = json!({
            "sharesRedeemed": event.shares_redeemed,
            "redemptionAmount": event.redemption_amount,
            "source": event.source,
            "filingDate": event.filing_date.to_string(),
        });
        self.run("record_redemption", &ticker, context, |tx| {
            redemptions::record_event(&self.policy, tx, &ticker, event)
        })
    }

    /// Record that a filing disclosed no redemptions.
    pub fn mark_no_redemptions(
        &self,
        ticker: &str,
        source: &str,
        filing_date: NaiveDate,
        reason: Option<&str>,
    ) -> EngineResult<bool> {
        let ticker = normalize_ticker(ticker);
        let context = json!({ "source": source, "filingDate": filing_date.to_string() });
        self.run("mark_no_redemptions", &ticker, context, |tx| {
            redemptions::mark_none_found(tx, &ticker, source, filing_date, reason)
        })
    }

    /// Store a market price and re-derive the premium.
    pub fn set_price(&self, ticker: &str, price: f64) -> EngineResult<Option<DerivedChange>> {
        if !price.is_finite() || price <= 0.0 {
            return Err(EngineError::InvalidAssertion(format!(
                "price must be positive, got {}",
                price
            )));
        }
        let ticker = normalize_ticker(ticker);
        self.run("set_price", &ticker, json!({ "price": price }), |tx| {
            if !entities::exists(tx, &ticker)? {
                return Err(EngineError::EntityNotFound(ticker.clone()).into());
            }
            entities::set_price(tx, &ticker, price)?;
            cascade::recompute_premium(tx, &ticker)
        })
    }

    pub fn recompute_trust_value(&self, ticker: &str) -> EngineResult<Option<UpdateOutcome>> {
        let ticker = normalize_ticker(ticker);
        self.run("recompute_trust_value", &ticker, json!({}), |tx| {
            cascade::recompute_trust_value(&self.policy, tx, &ticker)
        })
    }

    pub fn recompute_premium(&self, ticker: &str) -> EngineResult<Option<DerivedChange>> {
        let ticker = normalize_ticker(ticker);
        self.run("recompute_premium", &ticker, json!({}), |tx| {
            cascade::recompute_premium(tx, &ticker)
        })
    }

    pub fn resolve_anomaly(&self, id: i64, note: Option<&str>) -> EngineResult<bool> {
        self.run("resolve_anomaly", "", json!({ "anomalyId": id }), |tx| {
            AnomalyLog::resolve(tx, id, note)
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn entity(&self, ticker: &str) -> EngineResult<Entity> {
        let ticker = normalize_ticker(ticker);
        self.query("entity", &ticker, |conn| {
            Ok(entities::load(conn, &ticker)?
                .ok_or_else(|| EngineError::EntityNotFound(ticker.clone()))?)
        })
    }

    pub fn redemption_state(&self, ticker: &str) -> EngineResult<RedemptionState> {
        let ticker = normalize_ticker(ticker);
        self.query("redemption_state", &ticker, |conn| {
            if !entities::exists(conn, &ticker)? {
                return Err(EngineError::EntityNotFound(ticker.clone()).into());
            }
            entities::load_redemption_state(conn, &ticker)
        })
    }

    /// Audit rows, newest first. Tracked field names are accepted in either
    /// camelCase or snake_case; other names (`premium`, `redemptions`) are
    /// matched verbatim.
    pub fn history(
        &self,
        ticker: &str,
        field: Option<&str>,
        limit: usize,
    ) -> EngineResult<Vec<HistoryRecord>> {
        let ticker = normalize_ticker(ticker);
        let field = field.map(|f| {
            TrackedField::parse(f)
                .map(|tracked| tracked.name().to_string())
                .unwrap_or_else(|| f.trim().to_string())
        });
        self.query("history", &ticker, |conn| {
            AuditLog::query(conn, &ticker, field.as_deref(), limit)
        })
    }

    pub fn open_anomalies(&self, limit: usize) -> EngineResult<Vec<TargetAnomaly>> {
        self.query("open_anomalies", "", |conn| AnomalyLog::list_open(conn, limit))
    }

    // =========================================================================
    // Failure handling
    // =========================================================================

    /// Run a write in one transaction. Typed engine errors pass through;
    /// anything else is a persistence failure and raises an alert.
    fn run<R>(
        &self,
        operation: &'static str,
        ticker: &str,
        context: serde_json::Value,
        f: impl FnOnce(&Transaction<'_>) -> anyhow::Result<R>,
    ) -> EngineResult<R> {
        self.store
            .with_transaction(f)
            .map_err(|e| match e.downcast::<EngineError>() {
                Ok(engine_err) => engine_err,
                Err(e) => {
                    let err = persistence_error(operation, ticker, &e);
                    self.alerts.notify(FailureAlert::new(
                        operation,
                        ticker,
                        &err.to_string(),
                        context,
                    ));
                    err
                }
            })
    }

    /// Reads never mutate, so a failure is reported but not alerted.
    fn query<R>(
        &self,
        operation: &'static str,
        ticker: &str,
        f: impl FnOnce(&Connection) -> anyhow::Result<R>,
    ) -> EngineResult<R> {
        self.store
            .read(f)
            .map_err(|e| match e.downcast::<EngineError>() {
                Ok(engine_err) => engine_err,
                Err(e) => persistence_error(operation, ticker, &e),
            })
    }
}

fn persistence_error(operation: &'static str, ticker: &str, err: &anyhow::Error) -> EngineError {
    let message = format!("{:#}", err);
    error!(%operation, %ticker, error = %message, "Persistence failure, transaction rolled back");
    EngineError::Persistence {
        operation,
        ticker: ticker.to_string(),
        message,
    }
}
