use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Per-record failure classes reported by the sandbox.
///
/// These never escape the Batch Runner as `Err`; they are folded into
/// `ExecutionResult`s and `FailureCase`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxErrorKind {
    /// Source failed to parse or its top-level code threw.
    Load,
    /// Reference to a name or module outside the allow-list.
    NameNotAllowed,
    /// Wall-clock or step budget exhausted.
    Timeout,
    /// The entry function threw.
    Runtime,
    /// Strict mode and no `generate_instruction` was defined.
    MissingEntryPoint,
    /// The input record was not a JSON object.
    InvalidRecord,
    /// The run was cancelled while the record was pending or executing.
    Cancelled,
}

impl std::fmt::Display for SandboxErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SandboxErrorKind::Load => "SandboxLoadError",
            SandboxErrorKind::NameNotAllowed => "SandboxNameNotAllowed",
            SandboxErrorKind::Timeout => "SandboxTimeout",
            SandboxErrorKind::Runtime => "SandboxRuntimeError",
            SandboxErrorKind::MissingEntryPoint => "SandboxMissingEntryPoint",
            SandboxErrorKind::InvalidRecord => "SandboxInvalidRecord",
            SandboxErrorKind::Cancelled => "SandboxCancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct SandboxFailure {
    pub kind: SandboxErrorKind,
    pub message: String,
}

impl SandboxFailure {
    pub fn new(kind: SandboxErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Failures talking to an external oracle.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle transport error: {0}")]
    Transport(String),

    #[error("oracle '{oracle}' returned an empty response after {attempts} attempts")]
    EmptyResponse { oracle: String, attempts: u32 },

    #[error("oracle response could not be decoded: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field} {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("dataset not found: {0}")]
    DatasetMissing(String),

    #[error("failed to read configuration {path}: {reason}")]
    Unreadable { path: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Terminal failures of a refinement run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("dataset is empty")]
    DatasetEmpty,

    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error("failed to load dataset: {0}")]
    Dataset(String),

    #[error("prompt rendering failed: {0}")]
    Prompt(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_failure_display() {
        let failure = SandboxFailure::new(SandboxErrorKind::NameNotAllowed, "require is not defined");
        assert_eq!(
            failure.to_string(),
            "SandboxNameNotAllowed: require is not defined"
        );
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let encoded = serde_json::to_string(&SandboxErrorKind::NameNotAllowed).unwrap();
        assert_eq!(encoded, "\"name_not_allowed\"");
    }

    #[test]
    fn test_run_error_from_oracle() {
        let err: RunError = OracleError::EmptyResponse {
            oracle: "codegen".into(),
            attempts: 4,
        }
        .into();
        assert!(err.to_string().contains("after 4 attempts"));
    }
}
