//! Source Precedence Policy
//!
//! Decides whether a candidate fact supersedes the stored one. The rule is a
//! pure function of the two facts' provenance:
//! - blank candidates never win
//! - an empty slot is always filled
//! - an undated stored fact yields to an equally or more authoritative source
//! - otherwise the newer filing wins, and on the same filing date only a
//!   strictly more authoritative source wins
//!
//! Priorities are per field family and configurable. Lower numbers are more
//! authoritative; unknown sources rank below everything configured.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::fields::SourceFamily;

/// Source tag used for values derived by the cascade recalculator.
pub const CALCULATED_SOURCE: &str = "CALCULATED";

/// Rank given to sources absent from a table.
pub const UNKNOWN_PRIORITY: u32 = u32::MAX;

// =============================================================================
// Source normalization
// =============================================================================

/// Canonical form of a filing-type tag: trimmed, uppercased, single-spaced,
/// `FORM ` prefix removed and `SC ` expanded to `SCHEDULE `.
pub fn normalize_source(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut s = collapsed.to_ascii_uppercase();

    if let Some(rest) = s.strip_prefix("FORM ") {
        s = rest.to_string();
    }
    if let Some(rest) = s.strip_prefix("SC ") {
        s = format!("SCHEDULE {}", rest);
    }
    // SCHEDULE TO-T / TO-I / TO-C are all tender-offer statements
    if s.starts_with("SCHEDULE TO") {
        s = "SCHEDULE TO".to_string();
    }
    if s == "SCHEDULE 13E3" {
        s = "SCHEDULE 13E-3".to_string();
    }
    s
}

// =============================================================================
// Priority tables
// =============================================================================

/// Source → priority for one field family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "HashMap<String, u32>", into = "HashMap<String, u32>")]
pub struct SourcePriorityTable {
    ranks: HashMap<String, u32>,
}

impl From<HashMap<String, u32>> for SourcePriorityTable {
    fn from(raw: HashMap<String, u32>) -> Self {
        Self {
            ranks: raw
                .into_iter()
                .map(|(source, rank)| (normalize_source(&source), rank))
                .collect(),
        }
    }
}

impl From<SourcePriorityTable> for HashMap<String, u32> {
    fn from(table: SourcePriorityTable) -> Self {
        table.ranks
    }
}

impl SourcePriorityTable {
    pub fn from_pairs(pairs: &[(&str, u32)]) -> Self {
        pairs
            .iter()
            .map(|(s, r)| (s.to_string(), *r))
            .collect::<HashMap<_, _>>()
            .into()
    }

    /// Priority of a source tag. Amendments (`/A`) inherit the base form's
    /// rank when they are not listed themselves.
    pub fn priority_of(&self, source: &str) -> u32 {
        let normalized = normalize_source(source);
        if let Some(rank) = self.ranks.get(&normalized) {
            return *rank;
        }
        if let Some(base) = normalized.strip_suffix("/A") {
            if let Some(rank) = self.ranks.get(base) {
                return *rank;
            }
        }
        UNKNOWN_PRIORITY
    }

    /// Deal value and merger terms.
    pub fn default_deal_terms() -> Self {
        Self::from_pairs(&[
            ("S-4", 1),
            ("F-4", 1),
            ("DEFM14A", 2),
            ("PREM14A", 2),
            ("8-K", 3),
            ("425", 3),
            ("SCHEDULE TO", 4),
            ("SCHEDULE 13E-3", 4),
            ("DEFA14A", 4),
        ])
    }

    /// Trust cash and share counts.
    pub fn default_trust_account() -> Self {
        Self::from_pairs(&[
            ("10-Q", 1),
            ("10-K", 1),
            ("8-K", 2),
            ("DEFM14A", 3),
            ("DEF 14A", 3),
            ("PREM14A", 3),
            ("425", 4),
            ("S-1", 5),
            ("424B4", 5),
            (CALCULATED_SOURCE, 6),
        ])
    }

    /// Per-share trust value. Reported NAV beats the calculated one.
    pub fn default_trust_nav() -> Self {
        Self::from_pairs(&[("10-Q", 1), ("10-K", 1), ("8-K", 1), (CALCULATED_SOURCE, 2)])
    }
}

/// All family tables. Deserializes from TOML; missing families keep their
/// defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecedenceTables {
    pub deal_terms: SourcePriorityTable,
    pub trust_account: SourcePriorityTable,
    pub trust_nav: SourcePriorityTable,
}

impl Default for PrecedenceTables {
    fn default() -> Self {
        Self {
            deal_terms: SourcePriorityTable::default_deal_terms(),
            trust_account: SourcePriorityTable::default_trust_account(),
            trust_nav: SourcePriorityTable::default_trust_nav(),
        }
    }
}

impl PrecedenceTables {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("Failed to parse precedence tables")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read precedence file {}", path.display()))?;
        Self::from_toml_str(&raw)
    }

    pub fn table(&self, family: SourceFamily) -> &SourcePriorityTable {
        match family {
            SourceFamily::DealTerms => &self.deal_terms,
            SourceFamily::TrustAccount => &self.trust_account,
            SourceFamily::TrustNav => &self.trust_nav,
        }
    }
}

// =============================================================================
// Decision
// =============================================================================

/// Provenance of the incoming candidate.
#[derive(Debug, Clone, Copy)]
pub struct CandidateFact<'a> {
    pub has_value: bool,
    pub source: &'a str,
    pub filing_date: NaiveDate,
}

/// Provenance of the stored triple.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoredFact<'a> {
    pub has_value: bool,
    pub source: Option<&'a str>,
    pub filing_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptReason {
    NoCurrentValue,
    UndatedCurrentOutranked,
    NewerFiling,
    SameDateHigherPriority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    EmptyCandidate,
    UndatedCurrentMoreAuthoritative,
    SameDateNotHigherPriority,
    OlderFiling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept(AcceptReason),
    Reject(RejectReason),
}

impl Decision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept(_))
    }
}

/// The precedence rule, parameterized by a source-priority lookup.
pub fn decide(
    candidate: &CandidateFact<'_>,
    current: &StoredFact<'_>,
    priority_of: impl Fn(&str) -> u32,
) -> Decision {
    if !candidate.has_value {
        return Decision::Reject(RejectReason::EmptyCandidate);
    }
    if !current.has_value {
        return Decision::Accept(AcceptReason::NoCurrentValue);
    }

    let candidate_rank = priority_of(candidate.source);
    let current_rank = current.source.map(&priority_of).unwrap_or(UNKNOWN_PRIORITY);

    let Some(current_date) = current.filing_date else {
        return if candidate_rank <= current_rank {
            Decision::Accept(AcceptReason::UndatedCurrentOutranked)
        } else {
            Decision::Reject(RejectReason::UndatedCurrentMoreAuthoritative)
        };
    };

    match candidate.filing_date.cmp(&current_date) {
        std::cmp::Ordering::Greater => Decision::Accept(AcceptReason::NewerFiling),
        std::cmp::Ordering::Equal if candidate_rank < current_rank => {
            Decision::Accept(AcceptReason::SameDateHigherPriority)
        }
        std::cmp::Ordering::Equal => Decision::Reject(RejectReason::SameDateNotHigherPriority),
        std::cmp::Ordering::Less => Decision::Reject(RejectReason::OlderFiling),
    }
}

/// Precedence rule bound to the configured family tables.
#[derive(Debug, Clone, Default)]
pub struct PrecedencePolicy {
    tables: PrecedenceTables,
}

impl PrecedencePolicy {
    pub fn new(tables: PrecedenceTables) -> Self {
        Self { tables }
    }

    pub fn priority_of(&self, family: SourceFamily, source: &str) -> u32 {
        self.tables.table(family).priority_of(source)
    }

    pub fn decide(
        &self,
        family: SourceFamily,
        candidate: &CandidateFact<'_>,
        current: &StoredFact<'_>,
    ) -> Decision {
        let table = self.tables.table(family);
        decide(candidate, current, |s| table.priority_of(s))
    }
}
