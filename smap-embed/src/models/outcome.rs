//! Per-track outcomes and run summaries

use crate::error::{FailureKind, TrackError};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Terminal result for one track
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TrackOutcome {
    /// Track vector written to the dataset
    Success { vector: Vec<f32> },
    /// No candidate within tolerance
    NoMatch { best_diff: Option<f64> },
    Failed { kind: FailureKind, reason: String },
    /// Dataset already had this track; nothing was done
    Skipped,
    /// Not started, or aborted by run cancellation
    Cancelled,
}

impl TrackOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            TrackOutcome::Success { .. } => "success",
            TrackOutcome::NoMatch { .. } => "no_match",
            TrackOutcome::Failed { .. } => "failed",
            TrackOutcome::Skipped => "skipped",
            TrackOutcome::Cancelled => "cancelled",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TrackOutcome::Success { .. })
    }
}

impl From<TrackError> for TrackOutcome {
    fn from(error: TrackError) -> Self {
        match error {
            TrackError::NoMatch { best_diff } => TrackOutcome::NoMatch { best_diff },
            other => TrackOutcome::Failed {
                kind: other.kind(),
                reason: other.to_string(),
            },
        }
    }
}

/// Outcome of one track with timing
#[derive(Debug, Clone, Serialize)]
pub struct TrackReport {
    pub track_id: String,
    pub outcome: TrackOutcome,
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

/// One failed track in the summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub track_id: String,
    pub kind: FailureKind,
    pub reason: String,
}

/// Counts per outcome kind
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub success: usize,
    pub no_match: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub failures: Vec<FailureRecord>,
}

impl RunSummary {
    pub fn record(&mut self, report: &TrackReport) {
        self.total += 1;
        match &report.outcome {
            TrackOutcome::Success { .. } => self.success += 1,
            TrackOutcome::NoMatch { .. } => self.no_match += 1,
            TrackOutcome::Failed { kind, reason } => {
                self.failed += 1;
                self.failures.push(FailureRecord {
                    track_id: report.track_id.clone(),
                    kind: *kind,
                    reason: reason.clone(),
                });
            }
            TrackOutcome::Skipped => self.skipped += 1,
            TrackOutcome::Cancelled => self.cancelled += 1,
        }
    }

    pub fn from_reports(reports: &[TrackReport]) -> Self {
        let mut summary = Self::default();
        for report in reports {
            summary.record(report);
        }
        summary
    }

    /// Failures of one kind
    pub fn count_kind(&self, kind: FailureKind) -> usize {
        self.failures.iter().filter(|f| f.kind == kind).count()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} tracks: {} embedded, {} no match, {} failed, {} skipped, {} cancelled",
            self.total, self.success, self.no_match, self.failed, self.skipped, self.cancelled
        )?;
        for failure in &self.failures {
            writeln!(f, "  {}\t{}\t{}", failure.track_id, failure.kind, failure.reason)?;
        }
        Ok(())
    }
}

/// Everything a batch run produced
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub reports: Vec<TrackReport>,
    pub summary: RunSummary,
    /// Cancellation was requested during the run
    pub cancelled: bool,
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
