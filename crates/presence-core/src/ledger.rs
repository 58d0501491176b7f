//! Append-only attendance ledger.
//!
//! At most one `marked` record exists per (identity, period). Marking goes
//! through the repository's single insert-if-absent primitive; there is no
//! separate lookup before the write.

use crate::error::Result;
use crate::repository::{AttendanceFilter, Repository};
use crate::types::{AttendanceRecord, AttendanceStatus, IdentityId, MarkOutcome, PeriodKey};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Presence figures for one period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceSummary {
    pub period: PeriodKey,
    pub enrolled: usize,
    pub present: usize,
    pub absent: usize,
    /// Percentage of identities present, 0.0 when nobody is enrolled.
    pub attendance_rate: f32,
}

impl AttendanceSummary {
    pub fn calculate(period: PeriodKey, enrolled: usize, records: &[AttendanceRecord]) -> Self {
        let present = records
            .iter()
            .filter(|r| r.period == period && r.status == AttendanceStatus::Marked)
            .map(|r| &r.identity_id)
            .collect::<BTreeSet<_>>()
            .len();
        let attendance_rate = if enrolled > 0 {
            present as f32 / enrolled as f32 * 100.0
        } else {
            0.0
        };
        Self {
            period,
            enrolled,
            present,
            absent: enrolled.saturating_sub(present),
            attendance_rate,
        }
    }
}

pub struct Ledger {
    repo: Arc<dyn Repository>,
    audit_duplicates: bool,
}

impl Ledger {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self {
            repo,
            audit_duplicates: false,
        }
    }

    /// Also append a `duplicate-suppressed` record whenever a mark is suppressed.
    pub fn with_duplicate_audit(mut self, enabled: bool) -> Self {
        self.audit_duplicates = enabled;
        self
    }

    /// Record presence of `identity_id` in `period`, exactly once.
    ///
    /// Returns `AlreadyMarked` with the existing record when the period was
    /// already marked; that is the normal outcome for repeated recognition.
    /// The identity must have been created, but it need not still have vectors.
    pub fn mark(
        &self,
        identity_id: &IdentityId,
        period: PeriodKey,
        occurred_at: NaiveDateTime,
        confidence: f32,
    ) -> Result<MarkOutcome> {
        let candidate = AttendanceRecord::new(
            identity_id.clone(),
            period,
            occurred_at,
            confidence,
            AttendanceStatus::Marked,
        );
        let outcome = self.repo.mark_if_absent(candidate)?;

        match &outcome {
            MarkOutcome::Marked(record) => {
                tracing::info!(
                    identity = %identity_id,
                    period = %period,
                    time = %record.time_of_day(),
                    confidence,
                    "attendance marked"
                );
            }
            MarkOutcome::AlreadyMarked(existing) => {
                tracing::debug!(
                    identity = %identity_id,
                    period = %period,
                    marked_at = %existing.time_of_day(),
                    "attendance already marked"
                );
                if self.audit_duplicates {
                    let audit = AttendanceRecord::new(
                        identity_id.clone(),
                        period,
                        occurred_at,
                        confidence,
                        AttendanceStatus::DuplicateSuppressed,
                    );
                    // The mark itself succeeded; a lost audit row is not a mark failure.
                    if let Err(err) = self.repo.append_suppressed(audit) {
                        tracing::warn!(error = %err, identity = %identity_id, "failed to append duplicate audit record");
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Records with `start <= period <= end`. An inverted range is empty.
    pub fn query(&self, start: PeriodKey, end: PeriodKey) -> Result<Vec<AttendanceRecord>> {
        if start > end {
            return Ok(Vec::new());
        }
        self.repo
            .query_range(&AttendanceFilter::new().period_range(start, end))
    }

    /// Full history of one identity, for audit.
    pub fn query_by_identity(&self, identity_id: &IdentityId) -> Result<Vec<AttendanceRecord>> {
        self.repo
            .query_range(&AttendanceFilter::new().identity(identity_id.clone()))
    }

    pub fn filter(&self, filter: &AttendanceFilter) -> Result<Vec<AttendanceRecord>> {
        self.repo.query_range(filter)
    }

    pub fn summary(&self, period: PeriodKey) -> Result<AttendanceSummary> {
        let enrolled = self.repo.identities()?.len();
        let records = self.repo.query_range(
            &AttendanceFilter::new()
                .period(period)
                .status(AttendanceStatus::Marked),
        )?;
        Ok(AttendanceSummary::calculate(period, enrolled, &records))
    }
}
