//! Tracked field catalogue
//!
//! Every point-in-time field is described once here: its wire name, its
//! storage column, the source-priority family that arbitrates it and the value
//! type it carries. The updater is generic over [`FieldValue`] and takes a
//! [`FieldDescriptor`] instead of having one hand-written tracker per field.

use rusqlite::types::{FromSql, ToSql};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Field identity
// =============================================================================

/// Point-in-time fields carried as `(value, source, filing_date)` triples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TrackedField {
    DealValue,
    TargetName,
    MinCash,
    MinCashPercentage,
    PipeSize,
    PipePrice,
    EarnoutShares,
    ForwardPurchase,
    TrustCash,
    TrustValue,
    SharesOutstanding,
}

impl TrackedField {
    pub const ALL: [TrackedField; 11] = [
        Self::DealValue,
        Self::TargetName,
        Self::MinCash,
        Self::MinCashPercentage,
        Self::PipeSize,
        Self::PipePrice,
        Self::EarnoutShares,
        Self::ForwardPurchase,
        Self::TrustCash,
        Self::TrustValue,
        Self::SharesOutstanding,
    ];

    /// Name used in assertions and history records.
    pub fn name(self) -> &'static str {
        match self {
            Self::DealValue => "dealValue",
            Self::TargetName => "targetName",
            Self::MinCash => "minCash",
            Self::MinCashPercentage => "minCashPercentage",
            Self::PipeSize => "pipeSize",
            Self::PipePrice => "pipePrice",
            Self::EarnoutShares => "earnoutShares",
            Self::ForwardPurchase => "forwardPurchase",
            Self::TrustCash => "trustCash",
            Self::TrustValue => "trustValue",
            Self::SharesOutstanding => "sharesOutstanding",
        }
    }

    /// Base column name in the `entities` table. The triple occupies
    /// `{column}`, `{column}_source` and `{column}_filing_date`.
    pub fn column(self) -> &'static str {
        match self {
            Self::DealValue => "deal_value",
            Self::TargetName => "target_name",
            Self::MinCash => "min_cash",
            Self::MinCashPercentage => "min_cash_percentage",
            Self::PipeSize => "pipe_size",
            Self::PipePrice => "pipe_price",
            Self::EarnoutShares => "earnout_shares",
            Self::ForwardPurchase => "forward_purchase",
            Self::TrustCash => "trust_cash",
            Self::TrustValue => "trust_value",
            Self::SharesOutstanding => "shares_outstanding",
        }
    }

    pub fn family(self) -> SourceFamily {
        match self {
            Self::TrustCash | Self::SharesOutstanding => SourceFamily::TrustAccount,
            Self::TrustValue => SourceFamily::TrustNav,
            _ => SourceFamily::DealTerms,
        }
    }

    pub fn is_text(self) -> bool {
        matches!(self, Self::TargetName)
    }

    /// Accepts either the camelCase wire name or the snake_case column name.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.name().eq_ignore_ascii_case(s) || f.column().eq_ignore_ascii_case(s))
    }
}

impl fmt::Display for TrackedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Groups of fields that share one source-priority table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFamily {
    DealTerms,
    TrustAccount,
    TrustNav,
}

// =============================================================================
// Values
// =============================================================================

/// A candidate or stored value as it crosses the engine boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FactValue {
    Number(f64),
    Text(String),
}

impl FactValue {
    /// Numeric view. Extractors frequently emit amounts as strings such as
    /// `"$50,500,000"`; those are accepted.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => {
                let cleaned: String = s
                    .chars()
                    .filter(|c| !matches!(c, '$' | ',' | ' ' | '_'))
                    .collect();
                if cleaned.is_empty() {
                    return None;
                }
                cleaned.parse::<f64>().ok()
            }
        }
    }
}

impl fmt::Display for FactValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => f.write_str(&render_number(*n)),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Renders integral amounts without a trailing `.0` so history rows read
/// like the filings they came from.
pub(crate) fn render_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Value types a tracked field can hold.
pub trait FieldValue:
    Clone + PartialEq + fmt::Debug + ToSql + FromSql + Send + Sync + 'static
{
    /// Null-guard: blank candidates never overwrite a stored value.
    fn is_blank(&self) -> bool;

    /// Text form written to `field_history`.
    fn render(&self) -> String;

    fn to_fact(&self) -> FactValue;
}

impl FieldValue for f64 {
    fn is_blank(&self) -> bool {
        !self.is_finite()
    }

    fn render(&self) -> String {
        render_number(*self)
    }

    fn to_fact(&self) -> FactValue {
        FactValue::Number(*self)
    }
}

impl FieldValue for String {
    fn is_blank(&self) -> bool {
        let t = self.trim();
        t.is_empty()
            || t.eq_ignore_ascii_case("null")
            || t.eq_ignore_ascii_case("none")
            || t.eq_ignore_ascii_case("n/a")
    }

    fn render(&self) -> String {
        self.clone()
    }

    fn to_fact(&self) -> FactValue {
        FactValue::Text(self.clone())
    }
}

// =============================================================================
// Candidate guards
// =============================================================================

/// Why a guard refused a candidate. Routed to the anomaly log.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardRejection {
    pub sanitized: String,
    pub reason: String,
}

/// Pre-validation hook run before precedence is consulted.
pub trait CandidateGuard<T>: Send + Sync {
    /// Normalize the candidate, or refuse it outright.
    fn vet(&self, candidate: T, ticker: &str) -> Result<T, GuardRejection>;

    /// Whether the candidate restates the stored value. Asked only after the
    /// candidate has won on precedence; a winning restatement is a no-op.
    fn same_fact(&self, _current: &T, _candidate: &T) -> bool {
        false
    }
}

/// Guard for fields with no pre-validation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGuard;

impl<T> CandidateGuard<T> for NoGuard {
    fn vet(&self, candidate: T, _ticker: &str) -> Result<T, GuardRejection> {
        Ok(candidate)
    }
}

/// Everything the updater needs to know about one field.
pub struct FieldDescriptor<'g, T> {
    pub field: TrackedField,
    pub guard: &'g dyn CandidateGuard<T>,
}

impl<'g, T> FieldDescriptor<'g, T> {
    pub fn new(field: TrackedField, guard: &'g dyn CandidateGuard<T>) -> Self {
        Self { field, guard }
    }
}

impl<T> Clone for FieldDescriptor<'_, T> {
    fn clone(&self) -> Self {
        Self {
            field: self.field,
            guard: self.guard,
        }
    }
}

impl<T> Copy for FieldDescriptor<'_, T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_both_spellings() {
        assert_eq!(TrackedField::parse("trustCash"), Some(TrackedField::TrustCash));
        assert_eq!(TrackedField::parse("trust_cash"), Some(TrackedField::TrustCash));
        assert_eq!(TrackedField::parse(" TARGETNAME "), Some(TrackedField::TargetName));
        assert_eq!(TrackedField::parse("price"), None);
    }

    #[test]
    fn test_families() {
        assert_eq!(TrackedField::DealValue.family(), SourceFamily::DealTerms);
        assert_eq!(TrackedField::TargetName.family(), SourceFamily::DealTerms);
        assert_eq!(TrackedField::SharesOutstanding.family(), SourceFamily::TrustAccount);
        assert_eq!(TrackedField::TrustValue.family(), SourceFamily::TrustNav);
    }

    #[test]
    fn test_fact_value_numeric_coercion() {
        assert_eq!(FactValue::Text("$50,500,000".into()).as_number(), Some(50_500_000.0));
        assert_eq!(FactValue::Number(10.2).as_number(), Some(10.2));
        assert_eq!(FactValue::Text("unknown".into()).as_number(), None);
        assert_eq!(FactValue::Text("".into()).as_number(), None);
    }

    #[test]
    fn test_blank_values() {
        assert!(f64::NAN.is_blank());
        assert!(!0.0_f64.is_blank());
        assert!("  ".to_string().is_blank());
        assert!("N/A".to_string().is_blank());
        assert!(!"Acme".to_string().is_blank());
    }

    #[test]
    fn test_render_number() {
        assert_eq!(render_number(50_000_000.0), "50000000");
        assert_eq!(render_number(9.98), "9.98");
    }
}
