//! Result types returned by [`crate::run`].

use crate::error::Pdf2KbError;
use crate::pipeline::llm::LlmUsage;
use crate::schema::{DocumentRecord, Stage};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Every stage done or skipped without fallbacks.
    Complete,
    /// A stage failed, fell back, or is blocked behind a failure.
    Degraded,
}

impl Outcome {
    /// Process exit code for this outcome.
    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::Complete => 0,
            Outcome::Degraded => 2,
        }
    }
}

/// Exit code for a run that returned an error.
pub fn exit_code_for_error(err: &Pdf2KbError) -> i32 {
    if err.is_input_error() {
        3
    } else {
        1
    }
}

/// Statistics for one invocation. Never written into the schema.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    /// Stages that ran in this invocation, in completion order.
    pub stages_run: Vec<Stage>,
    /// Wall-clock duration per stage that ran.
    pub stage_durations_ms: BTreeMap<Stage, u64>,
    pub total_duration_ms: u64,
    /// LLM calls, retries and tokens.
    pub llm: LlmUsage,
}

/// The record after a run plus what this invocation did.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub document_id: String,
    /// Location of the schema file.
    pub schema_path: PathBuf,
    pub outcome: Outcome,
    /// Pending stages that can no longer run.
    pub blocked: Vec<Stage>,
    pub stats: PipelineStats,
    #[serde(skip)]
    pub record: DocumentRecord,
}

impl PipelineReport {
    pub fn new(record: DocumentRecord, schema_path: PathBuf, stats: PipelineStats) -> Self {
        let outcome = if record.is_complete() && !record.is_degraded() {
            Outcome::Complete
        } else {
            Outcome::Degraded
        };
        Self {
            document_id: record.document_id.clone(),
            schema_path,
            outcome,
            blocked: record.blocked_stages(),
            stats,
            record,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::StageState;
    use std::path::PathBuf;

    #[test]
    fn outcome_follows_record_state() {
        let mut record = DocumentRecord::new("abc", "doc.pdf");
        for s in Stage::ALL {
            record.set_state(s, StageState::done());
        }
        let report = PipelineReport::new(record.clone(), PathBuf::from("x"), PipelineStats::default());
        assert_eq!(report.outcome, Outcome::Complete);
        assert_eq!(report.exit_code(), 0);

        record.set_state(Stage::Chunking, StageState::done().degraded_if(true));
        let report = PipelineReport::new(record, PathBuf::from("x"), PipelineStats::default());
        assert_eq!(report.outcome, Outcome::Degraded);
        assert_eq!(report.exit_code(), 2);
    }

    #[test]
    fn input_errors_exit_with_three() {
        let err = Pdf2KbError::NotAPdf {
            path: PathBuf::from("a.txt"),
            magic: *b"hell",
        };
        assert_eq!(exit_code_for_error(&err), 3);
        assert_eq!(exit_code_for_error(&Pdf2KbError::Internal("x".into())), 1);
    }

    #[test]
    fn blocked_stages_are_reported() {
        let mut record = DocumentRecord::new("abc", "doc.pdf");
        record.set_state(Stage::Extraction, StageState::failed("corrupt"));
        let report = PipelineReport::new(record, PathBuf::from("x"), PipelineStats::default());
        assert_eq!(report.blocked.len(), 5);
        assert_eq!(report.outcome, Outcome::Degraded);
    }
}
