//! Target Legitimacy Validator
//!
//! Extractors regularly hand back the sponsor entity, the trustee, or a
//! fragment of filing boilerplate where the merger target's name should be.
//! These checks run before a target name can reach the precedence policy.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::fields::{CandidateGuard, GuardRejection};

const SPONSOR_KEYWORDS: &[&str] = &["sponsor", "holdco", "founder"];

const TRUSTEE_KEYWORDS: &[&str] = &[
    "trustee",
    "transfer agent",
    "trust company",
    "escrow agent",
];

/// Agents that show up in trust-account disclosures.
const KNOWN_AGENTS: &[&str] = &[
    "continental stock transfer",
    "american stock transfer",
    "equiniti",
    "computershare",
    "vstock transfer",
    "broadridge",
];

const BOILERPLATE_PHRASES: &[&str] = &[
    "exhibit",
    "schedule",
    "see ",
    "refer to",
    "pursuant to",
    "as defined",
    "table of contents",
    "hereinafter",
];

const MIN_NAME_LEN: usize = 3;

/// Why a candidate target name was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TargetRejection {
    Empty,
    SponsorKeyword(String),
    TrusteeKeyword(String),
    Boilerplate(String),
    SelfReference,
    NoAlphabetic,
    TooShort,
}

impl fmt::Display for TargetRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty name"),
            Self::SponsorKeyword(k) => write!(f, "contains sponsor keyword '{}'", k),
            Self::TrusteeKeyword(k) => write!(f, "contains trustee/transfer-agent keyword '{}'", k),
            Self::Boilerplate(p) => write!(f, "matches filing boilerplate '{}'", p),
            Self::SelfReference => write!(f, "name is the entity's own ticker"),
            Self::NoAlphabetic => write!(f, "no alphabetic characters"),
            Self::TooShort => write!(f, "shorter than {} characters", MIN_NAME_LEN),
        }
    }
}

/// Trim trailing punctuation and collapse whitespace.
pub fn sanitize(name: &str) -> String {
    let collapsed = name.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches(|c: char| c.is_ascii_punctuation() && c != ')')
        .trim()
        .to_string()
}

/// Comparison key: sanitized, lowercased, punctuation dropped.
pub fn normalize_name(name: &str) -> String {
    let stripped: String = sanitize(name)
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() || c == '&' {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First token is an all-caps abbreviation ending in a period ("NYSE.").
fn leading_abbreviation(name: &str) -> Option<&str> {
    let first = name.split_whitespace().next()?;
    let body = first.strip_suffix('.')?;
    if body.len() >= 2 && body.chars().all(|c| c.is_ascii_uppercase()) {
        Some(first)
    } else {
        None
    }
}

/// "Item 1.01", "item 7" and similar section references.
fn item_reference(lower: &str) -> bool {
    let tokens: Vec<&str> = lower.split_whitespace().collect();
    tokens.windows(2).any(|w| {
        w[0] == "item" && w[1].chars().next().is_some_and(|c| c.is_ascii_digit())
    })
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TargetLegitimacyValidator;

impl TargetLegitimacyValidator {
    pub fn new() -> Self {
        Self
    }

    /// Ordered, short-circuiting legitimacy checks on a sanitized name.
    pub fn validate(&self, candidate: &str, ticker: &str) -> Result<(), TargetRejection> {
        let name = sanitize(candidate);
        if name.is_empty() {
            return Err(TargetRejection::Empty);
        }
        let lower = name.to_lowercase();

        if let Some(k) = SPONSOR_KEYWORDS.iter().find(|k| lower.contains(*k)) {
            return Err(TargetRejection::SponsorKeyword(k.to_string()));
        }

        if let Some(k) = TRUSTEE_KEYWORDS
            .iter()
            .chain(KNOWN_AGENTS.iter())
            .find(|k| lower.contains(*k))
        {
            return Err(TargetRejection::TrusteeKeyword(k.to_string()));
        }

        if let Some(abbr) = leading_abbreviation(&name) {
            return Err(TargetRejection::Boilerplate(abbr.to_string()));
        }
        if item_reference(&lower) {
            return Err(TargetRejection::Boilerplate("item".to_string()));
        }
        let padded = format!("{} ", lower);
        if let Some(p) = BOILERPLATE_PHRASES.iter().find(|p| {
            if p.ends_with(' ') {
                padded.starts_with(*p) || padded.contains(&format!(" {}", p))
            } else {
                lower.contains(*p)
            }
        }) {
            return Err(TargetRejection::Boilerplate(p.trim().to_string()));
        }

        let compact: String = name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();
        if !ticker.trim().is_empty() && compact == ticker.trim().to_ascii_uppercase() {
            return Err(TargetRejection::SelfReference);
        }

        if !name.chars().any(|c| c.is_alphabetic()) {
            return Err(TargetRejection::NoAlphabetic);
        }

        if name.chars().count() < MIN_NAME_LEN {
            return Err(TargetRejection::TooShort);
        }

        Ok(())
    }

    pub fn sanitize(&self, name: &str) -> String {
        sanitize(name)
    }
}

impl CandidateGuard<String> for TargetLegitimacyValidator {
    fn vet(&self, candidate: String, ticker: &str) -> Result<String, GuardRejection> {
        let sanitized = sanitize(&candidate);
        match self.validate(&sanitized, ticker) {
            Ok(()) => Ok(sanitized),
            Err(rejection) => Err(GuardRejection {
                sanitized,
                reason: rejection.to_string(),
            }),
        }
    }

    fn same_fact(&self, current: &String, candidate: &String) -> bool {
        normalize_name(current) == normalize_name(candidate)
    }
}
