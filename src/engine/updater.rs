//! Point-in-time field updater
//!
//! One generic implementation of the "latest known value" merge: guard the
//! candidate, ask the precedence policy, then write the triple and append
//! history unless the winner merely restates the stored value.

use anyhow::Result;
use chrono::NaiveDate;
use rusqlite::Connection;
use tracing::{debug, info, warn};

use super::cascade;
use crate::errors::EngineError;
use crate::fields::{FieldDescriptor, FieldValue};
use crate::models::{Disposition, NewHistoryRecord, UpdateOutcome};
use crate::precedence::{
    normalize_source, CandidateFact, Decision, PrecedencePolicy, RejectReason, StoredFact,
};
use crate::store::anomalies::NewTargetAnomaly;
use crate::store::{entities, AnomalyLog, AuditLog};

/// One candidate for one field of one entity.
#[derive(Debug, Clone)]
pub struct UpdateRequest<'r, T> {
    pub ticker: &'r str,
    pub candidate: Option<T>,
    pub source: &'r str,
    pub filing_date: NaiveDate,
    pub reason: Option<&'r str>,
}

pub struct PointInTimeFieldUpdater<'a, T> {
    descriptor: FieldDescriptor<'a, T>,
    policy: &'a PrecedencePolicy,
}

impl<'a, T: FieldValue> PointInTimeFieldUpdater<'a, T> {
    pub fn new(descriptor: FieldDescriptor<'a, T>, policy: &'a PrecedencePolicy) -> Self {
        Self { descriptor, policy }
    }

    /// Apply the candidate, then re-derive anything that depends on the field.
    pub fn update_and_cascade(
        &self,
        conn: &Connection,
        request: UpdateRequest<'_, T>,
    ) -> Result<UpdateOutcome> {
        let ticker = request.ticker;
        let outcome = self.update(conn, request)?;
        if outcome.applied {
            cascade::after_change(self.policy, conn, ticker, self.descriptor.field)?;
        }
        Ok(outcome)
    }

    /// Apply the candidate to this field only.
    pub fn update(
        &self,
        conn: &Connection,
        request: UpdateRequest<'_, T>,
    ) -> Result<UpdateOutcome> {
        let field = self.descriptor.field;
        let ticker = request.ticker;
        let source = normalize_source(request.source);

        let current = entities::load_triple::<T>(conn, ticker, field)?
            .ok_or_else(|| EngineError::EntityNotFound(ticker.to_string()))?;
        let previous = current.value.as_ref().map(FieldValue::to_fact);

        let stored = StoredFact {
            has_value: current.has_value(),
            source: current.source.as_deref(),
            filing_date: current.filing_date,
        };

        let candidate = match request.candidate {
            Some(v) if !v.is_blank() => v,
            _ => {
                debug!(%ticker, %field, %source, "Blank candidate ignored");
                return Ok(UpdateOutcome::not_applied(
                    ticker,
                    field,
                    Disposition::RejectedByPrecedence(RejectReason::EmptyCandidate),
                    previous,
                ));
            }
        };

        let raw_candidate = candidate.render();
        let candidate = match self.descriptor.guard.vet(candidate, ticker) {
            Ok(v) => v,
            Err(rejection) => {
                warn!(
                    %ticker,
                    %field,
                    candidate = %raw_candidate,
                    %source,
                    filing_date = %request.filing_date,
                    reason = %rejection.reason,
                    "Candidate failed legitimacy checks"
                );
                let anomaly = NewTargetAnomaly {
                    ticker,
                    candidate: &raw_candidate,
                    sanitized: &rejection.sanitized,
                    rejection_reason: &rejection.reason,
                    source: &source,
                    filing_date: request.filing_date,
                    reason: request.reason,
                };
                if let Err(e) = AnomalyLog::record(conn, &anomaly) {
                    warn!(%ticker, %field, error = %e, "Failed to queue anomaly for review");
                }
                return Ok(UpdateOutcome::not_applied(
                    ticker,
                    field,
                    Disposition::RejectedByValidation(rejection.reason),
                    previous,
                ));
            }
        };

        let proposal = CandidateFact {
            has_value: true,
            source: &source,
            filing_date: request.filing_date,
        };
        let accept_reason = match self.policy.decide(field.family(), &proposal, &stored) {
            Decision::Accept(reason) => reason,
            Decision::Reject(reason) => {
                debug!(
                    %ticker,
                    %field,
                    %source,
                    filing_date = %request.filing_date,
                    current_source = ?current.source,
                    current_filing_date = ?current.filing_date,
                    ?reason,
                    "Candidate lost on precedence"
                );
                return Ok(UpdateOutcome::not_applied(
                    ticker,
                    field,
                    Disposition::RejectedByPrecedence(reason),
                    previous,
                ));
            }
        };

        // Only a restatement that would have won is reported as unchanged
        if let Some(existing) = current.value.as_ref() {
            if self.descriptor.guard.same_fact(existing, &candidate) {
                debug!(%ticker, %field, "Candidate restates stored value");
                return Ok(UpdateOutcome::not_applied(
                    ticker,
                    field,
                    Disposition::Unchanged,
                    previous,
                ));
            }
        }

        let filed = Some(request.filing_date);
        entities::store_triple(conn, ticker, field, &candidate, &source, filed)?;

        let history_written = AuditLog::append_best_effort(
            conn,
            &NewHistoryRecord {
                ticker: ticker.to_string(),
                field: field.name().to_string(),
                old_value: current.value.as_ref().map(FieldValue::render),
                new_value: Some(candidate.render()),
                source: Some(source.clone()),
                filing_date: Some(request.filing_date),
                reason: request.reason.map(str::to_string),
            },
        );

        info!(
            %ticker,
            %field,
            old = ?current.value,
            new = ?candidate,
            %source,
            filing_date = %request.filing_date,
            ?accept_reason,
            "Field updated"
        );

        Ok(UpdateOutcome {
            ticker: ticker.to_string(),
            field,
            applied: true,
            disposition: Disposition::Applied(accept_reason),
            previous,
            new: Some(candidate.to_fact()),
            history_written,
        })
    }
}
