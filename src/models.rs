//! Data models shared by the store, the engine and the CLI.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;

use crate::fields::{FactValue, TrackedField};
use crate::precedence::{AcceptReason, RejectReason};

/// Parse a filing date as upstream extractors emit it: `2025-11-01`,
/// `20251101`, or an RFC 3339 timestamp whose date part is used.
pub fn parse_filing_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(d);
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y%m%d") {
        return Some(d);
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.date_naive())
        .or_else(|| raw.get(..10).and_then(|p| NaiveDate::parse_from_str(p, "%Y-%m-%d").ok()))
}

fn deserialize_filing_date<'de, D>(deserializer: D) -> Result<NaiveDate, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_filing_date(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("unparseable filing date: {}", raw)))
}

// =============================================================================
// Entity
// =============================================================================

/// One point-in-time field: value plus the provenance that put it there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldTriple<T> {
    pub value: Option<T>,
    pub source: Option<String>,
    pub filing_date: Option<NaiveDate>,
}

impl<T> Default for FieldTriple<T> {
    fn default() -> Self {
        Self {
            value: None,
            source: None,
            filing_date: None,
        }
    }
}

impl<T> FieldTriple<T> {
    pub fn has_value(&self) -> bool {
        self.value.is_some()
    }
}

/// A tracked SPAC, keyed by ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub ticker: String,
    pub deal_value: FieldTriple<f64>,
    pub target_name: FieldTriple<String>,
    pub min_cash: FieldTriple<f64>,
    pub min_cash_percentage: FieldTriple<f64>,
    pub pipe_size: FieldTriple<f64>,
    pub pipe_price: FieldTriple<f64>,
    pub earnout_shares: FieldTriple<f64>,
    pub forward_purchase: FieldTriple<f64>,
    pub trust_cash: FieldTriple<f64>,
    pub trust_value: FieldTriple<f64>,
    pub shares_outstanding: FieldTriple<f64>,
    pub price: Option<f64>,
    pub premium: Option<f64>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Entity {
    pub fn new(ticker: &str) -> Self {
        Self {
            ticker: ticker.to_string(),
            deal_value: FieldTriple::default(),
            target_name: FieldTriple::default(),
            min_cash: FieldTriple::default(),
            min_cash_percentage: FieldTriple::default(),
            pipe_size: FieldTriple::default(),
            pipe_price: FieldTriple::default(),
            earnout_shares: FieldTriple::default(),
            forward_purchase: FieldTriple::default(),
            trust_cash: FieldTriple::default(),
            trust_value: FieldTriple::default(),
            shares_outstanding: FieldTriple::default(),
            price: None,
            premium: None,
            updated_at: None,
        }
    }

    /// Numeric triple for a field, `None` for the text field.
    pub(crate) fn numeric_mut(&mut self, field: TrackedField) -> Option<&mut FieldTriple<f64>> {
        match field {
            TrackedField::DealValue => Some(&mut self.deal_value),
            TrackedField::TargetName => None,
            TrackedField::MinCash => Some(&mut self.min_cash),
            TrackedField::MinCashPercentage => Some(&mut self.min_cash_percentage),
            TrackedField::PipeSize => Some(&mut self.pipe_size),
            TrackedField::PipePrice => Some(&mut self.pipe_price),
            TrackedField::EarnoutShares => Some(&mut self.earnout_shares),
            TrackedField::ForwardPurchase => Some(&mut self.forward_purchase),
            TrackedField::TrustCash => Some(&mut self.trust_cash),
            TrackedField::TrustValue => Some(&mut self.trust_value),
            TrackedField::SharesOutstanding => Some(&mut self.shares_outstanding),
        }
    }
}

// =============================================================================
// Redemptions
// =============================================================================

/// Whether redemptions have been looked for and found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedemptionStatus {
    #[default]
    Unknown,
    /// Checked, none found.
    NoneFound,
    Occurred,
}

impl RedemptionStatus {
    pub(crate) fn to_db(self) -> Option<i64> {
        match self {
            Self::Unknown => None,
            Self::NoneFound => Some(0),
            Self::Occurred => Some(1),
        }
    }

    pub(crate) fn from_db(v: Option<i64>) -> Self {
        match v {
            None => Self::Unknown,
            Some(0) => Self::NoneFound,
            Some(_) => Self::Occurred,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::NoneFound => "false",
            Self::Occurred => "true",
        }
    }
}

/// Cumulative redemption totals for one entity.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionState {
    pub shares_redeemed_total: f64,
    pub redemption_amount_total: f64,
    pub redemption_percentage: Option<f64>,
    pub event_count: u32,
    pub last_redemption_date: Option<NaiveDate>,
    pub redemptions_occurred: RedemptionStatus,
    /// Filing-date keys already applied. Only grows.
    pub processed_filing_dates: BTreeSet<String>,
}

impl RedemptionState {
    pub fn has_zero_totals(&self) -> bool {
        self.shares_redeemed_total == 0.0
            && self.redemption_amount_total == 0.0
            && self.event_count == 0
    }
}

/// One disclosed redemption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionEvent {
    pub shares_redeemed: f64,
    pub redemption_amount: f64,
    #[serde(deserialize_with = "deserialize_filing_date")]
    pub filing_date: NaiveDate,
    pub source: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Dedup key for a redemption filing.
pub fn filing_date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

// =============================================================================
// Inputs and records
// =============================================================================

/// A candidate value for one field, with provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FactAssertion {
    pub ticker: String,
    pub field: String,
    #[serde(default, alias = "value", alias = "candidate_value")]
    pub candidate_value: Option<FactValue>,
    pub source: String,
    #[serde(alias = "filing_date", deserialize_with = "deserialize_filing_date")]
    pub filing_date: NaiveDate,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Append-only audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: i64,
    pub ticker: String,
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub source: Option<String>,
    pub filing_date: Option<NaiveDate>,
    pub reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// History row before it has been assigned an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewHistoryRecord {
    pub ticker: String,
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub source: Option<String>,
    pub filing_date: Option<NaiveDate>,
    pub reason: Option<String>,
}

/// A rejected target-name candidate awaiting human review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetAnomaly {
    pub id: i64,
    pub ticker: String,
    pub candidate: String,
    pub sanitized: String,
    pub rejection_reason: String,
    pub source: String,
    pub filing_date: NaiveDate,
    pub reason: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub status: String,
    pub resolution_note: Option<String>,
}

// =============================================================================
// Outcomes
// =============================================================================

/// What happened to a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum Disposition {
    Applied(AcceptReason),
    RejectedByPrecedence(RejectReason),
    RejectedByValidation(String),
    /// Candidate restates the stored value.
    Unchanged,
}

/// Result of one point-in-time update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOutcome {
    pub ticker: String,
    pub field: TrackedField,
    pub applied: bool,
    pub disposition: Disposition,
    pub previous: Option<FactValue>,
    pub new: Option<FactValue>,
    /// False when the best-effort history append failed or was not needed.
    pub history_written: bool,
}

impl UpdateOutcome {
    pub(crate) fn not_applied(
        ticker: &str,
        field: TrackedField,
        disposition: Disposition,
        previous: Option<FactValue>,
    ) -> Self {
        Self {
            ticker: ticker.to_string(),
            field,
            applied: false,
            disposition,
            new: previous.clone(),
            previous,
            history_written: false,
        }
    }
}

/// A pure derived value that was rewritten (premium).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedChange {
    pub field: String,
    pub previous: Option<f64>,
    pub new: f64,
    pub history_written: bool,
}

/// Per-batch accounting for `apply_batch`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub applied: usize,
    pub rejected: usize,
    pub unchanged: usize,
    pub invalid: usize,
    pub failed: usize,
}

impl BatchStats {
    pub fn total(&self) -> usize {
        self.applied + self.rejected + self.unchanged + self.invalid + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filing_date_formats() {
        let expected = NaiveDate::from_ymd_opt(2025, 11, 1);
        assert_eq!(parse_filing_date("2025-11-01"), expected);
        assert_eq!(parse_filing_date("20251101"), expected);
        assert_eq!(parse_filing_date("2025-11-01T16:05:00-05:00"), expected);
        assert_eq!(parse_filing_date("2025-11-01 16:05:00"), expected);
        assert_eq!(parse_filing_date("November"), None);
    }

    #[test]
    fn test_fact_assertion_from_extractor_json() {
        let raw = r#"{
            "ticker": "ACME",
            "field": "dealValue",
            "value": "$1,250,000,000",
            "source": "S-4",
            "filingDate": "2025-10-15",
            "reason": "merger agreement"
        }"#;
        let assertion: FactAssertion = serde_json::from_str(raw).unwrap();
        assert_eq!(assertion.filing_date, NaiveDate::from_ymd_opt(2025, 10, 15).unwrap());
        assert_eq!(
            assertion.candidate_value.and_then(|v| v.as_number()),
            Some(1_250_000_000.0)
        );
    }

    #[test]
    fn test_redemption_status_db_roundtrip() {
        for status in [
            RedemptionStatus::Unknown,
            RedemptionStatus::NoneFound,
            RedemptionStatus::Occurred,
        ] {
            assert_eq!(RedemptionStatus::from_db(status.to_db()), status);
        }
    }
}
