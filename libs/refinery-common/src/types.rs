use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SandboxErrorKind, SandboxFailure};

/// Input and output records are schemaless JSON mappings.
pub type Record = Value;

/// One generation's worth of candidate code, tagged with the iteration that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceProgram {
    pub iteration: u32,
    pub source: String,
}

impl SourceProgram {
    pub fn new(iteration: u32, source: impl Into<String>) -> Self {
        Self {
            iteration,
            source: source.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub stdout: String,
    pub output: Option<Record>,
    pub error: Option<SandboxFailure>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn success(stdout: String, output: Record, duration_ms: u64) -> Self {
        Self {
            status: ExecutionStatus::Success,
            stdout,
            output: Some(output),
            error: None,
            duration_ms,
        }
    }

    pub fn failure(
        kind: SandboxErrorKind,
        message: impl Into<String>,
        stdout: String,
        duration_ms: u64,
    ) -> Self {
        Self {
            status: ExecutionStatus::Failure,
            stdout,
            output: None,
            error: Some(SandboxFailure::new(kind, message)),
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn error_kind(&self) -> Option<SandboxErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Compare everything except wall-clock duration.
    pub fn same_outcome(&self, other: &ExecutionResult) -> bool {
        self.status == other.status
            && self.stdout == other.stdout
            && self.output == other.output
            && self.error == other.error
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub index: usize,
    pub input: Record,
    pub result: ExecutionResult,
}

/// Aggregate of one Batch Runner pass.
///
/// `outcomes` is ordered by input position and `success_count + failure_count == total`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub total: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub success_rate: String,
    pub outcomes: Vec<RecordOutcome>,
}

impl BatchReport {
    pub fn empty() -> Self {
        Self {
            total: 0,
            success_count: 0,
            failure_count: 0,
            success_rate: format_rate(0, 0),
            outcomes: Vec::new(),
        }
    }

    /// Fold already-joined outcomes into a report. Outcomes are sorted by index.
    pub fn from_outcomes(mut outcomes: Vec<RecordOutcome>) -> Self {
        if outcomes.is_empty() {
            return Self::empty();
        }
        outcomes.sort_by_key(|o| o.index);

        let total = outcomes.len();
        let success_count = outcomes.iter().filter(|o| o.result.is_success()).count();
        let failure_count = total - success_count;

        Self {
            total,
            success_count,
            failure_count,
            success_rate: format_rate(success_count, total),
            outcomes,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &RecordOutcome> {
        self.outcomes.iter().filter(|o| !o.result.is_success())
    }
}

/// Percentage with two decimals; an empty denominator yields "0.00%".
pub fn format_rate(numerator: usize, denominator: usize) -> String {
    if denominator == 0 {
        return "0.00%".to_string();
    }
    format!("{:.2}%", numerator as f64 / denominator as f64 * 100.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// The program ran but produced the wrong label.
    PredictionError,
    /// The program ran but its output had no readable classification.
    FormatError,
    /// The sandbox reported a failure.
    ExecutionError,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureKind::PredictionError => "PREDICTION_ERROR",
            FailureKind::FormatError => "FORMAT_ERROR",
            FailureKind::ExecutionError => "EXECUTION_ERROR",
        };
        f.write_str(name)
    }
}

/// A record whose evaluation did not match expectation, kept to drive the next feedback request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureCase {
    pub index: usize,
    pub input: Record,
    pub expected: Option<String>,
    pub observed: Option<String>,
    pub kind: FailureKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_kind: Option<SandboxErrorKind>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub accuracy: f64,
    pub failed_cases: usize,
    pub timestamp: DateTime<Utc>,
}

impl IterationRecord {
    pub fn now(iteration: u32, accuracy: f64, failed_cases: usize) -> Self {
        Self {
            iteration,
            accuracy,
            failed_cases,
            timestamp: Utc::now(),
        }
    }
}
