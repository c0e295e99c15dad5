//! Engine error taxonomy
//!
//! Only failures surface here. Precedence losses, validation rejections and
//! duplicate redemption filings are ordinary outcomes and live on
//! [`crate::models::UpdateOutcome`] instead.

use std::fmt;

/// Errors returned at the engine boundary.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// Storage failed. For writes the transaction was rolled back and the
    /// alert sink has been notified.
    Persistence {
        operation: &'static str,
        ticker: String,
        message: String,
    },
    /// No entity row exists for the ticker (onboarding has not run).
    EntityNotFound(String),
    /// The assertion itself is malformed (unknown field, wrong value type).
    InvalidAssertion(String),
    /// Configuration could not be loaded.
    Config(String),
}

impl EngineError {
    /// Whether this error should be forwarded to the failure-alerting channel.
    pub fn is_alertable(&self) -> bool {
        matches!(self, Self::Persistence { .. })
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Persistence {
                operation,
                ticker,
                message,
            } => write!(f, "{} failed for {}: {}", operation, ticker, message),
            Self::EntityNotFound(ticker) => write!(f, "entity not found: {}", ticker),
            Self::InvalidAssertion(msg) => write!(f, "invalid assertion: {}", msg),
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_persistence_is_alertable() {
        let err = EngineError::Persistence {
            operation: "update_field",
            ticker: "ACME".to_string(),
            message: "disk I/O error".to_string(),
        };
        assert!(err.is_alertable());
        assert_eq!(
            err.to_string(),
            "update_field failed for ACME: disk I/O error"
        );

        assert!(!EngineError::EntityNotFound("ACME".into()).is_alertable());
        assert!(!EngineError::InvalidAssertion("bad".into()).is_alertable());
    }
}
