//! SPAC Fact Reconciler
//!
//! Decides, for every extracted fact about a SPAC, whether it supersedes the
//! stored value; aggregates redemption disclosures without double counting;
//! keeps NAV and premium consistent with their inputs; and records every
//! accepted change in an append-only audit log.

pub mod alerts;
pub mod config;
pub mod engine;
pub mod errors;
pub mod fields;
pub mod models;
pub mod precedence;
pub mod store;
pub mod target_validator;

pub use alerts::{
    AlertSink, ChannelAlertSink, FailureAlert, LogAlertSink, NullAlertSink, WebhookAlertSink,
};
pub use config::EngineConfig;
pub use engine::ReconciliationEngine;
pub use errors::{EngineError, EngineResult};
pub use fields::{FactValue, TrackedField};
pub use models::{
    BatchStats, DerivedChange, Disposition, Entity, FactAssertion, HistoryRecord, RedemptionEvent,
    RedemptionState, RedemptionStatus, TargetAnomaly, UpdateOutcome,
};
pub use precedence::{PrecedencePolicy, PrecedenceTables};
pub use store::FactStore;
pub use target_validator::TargetLegitimacyValidator;
