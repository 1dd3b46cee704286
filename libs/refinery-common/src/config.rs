// Run configuration shared by the worker and the CLI.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "config/refinery.json";

/// Names left on the sandbox global object besides the harness bindings.
pub const DEFAULT_ALLOWED_GLOBALS: &[&str] = &[
    "Object",
    "Array",
    "String",
    "Number",
    "Boolean",
    "Math",
    "JSON",
    "Date",
    "Map",
    "Set",
    "RegExp",
    "parseInt",
    "parseFloat",
    "isNaN",
    "isFinite",
    "Error",
    "TypeError",
    "RangeError",
    "SyntaxError",
    "ReferenceError",
    "NaN",
    "Infinity",
    "undefined",
];

pub const DEFAULT_LABEL_TOKENS: &[&str] = &["BC相", "AC相", "AB相", "A相", "B相", "C相"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub dataset_path: PathBuf,
    pub endpoints: Endpoints,
    pub models: ModelIds,
    pub max_iterations: u32,
    pub min_accuracy_threshold: f64,
    pub min_improvement_delta: f64,
    pub test_sample_ratio: f64,
    pub max_failures_tracked: usize,
    /// Records per ground-truth label shown to the code generator; 0 disables it.
    pub few_shot_per_label: usize,
    pub sandbox: SandboxConfig,
    pub oracle: OracleConfig,
    pub evaluation: EvaluationConfig,
    pub output_dir: PathBuf,
    pub sample_seed: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            dataset_path: PathBuf::from("data/dataset.json"),
            endpoints: Endpoints::default(),
            models: ModelIds::default(),
            max_iterations: 5,
            min_accuracy_threshold: 0.95,
            min_improvement_delta: 0.01,
            test_sample_ratio: 0.5,
            max_failures_tracked: 3,
            few_shot_per_label: 0,
            sandbox: SandboxConfig::default(),
            oracle: OracleConfig::default(),
            evaluation: EvaluationConfig::default(),
            output_dir: PathBuf::from("output"),
            sample_seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub generation_url: String,
    /// Falls back to `generation_url`.
    pub feedback_url: Option<String>,
    /// Without a cleaning endpoint records are used as loaded.
    pub clean_url: Option<String>,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            generation_url: "http://localhost:5000/analyze".to_string(),
            feedback_url: None,
            clean_url: None,
        }
    }
}

impl Endpoints {
    pub fn feedback_url(&self) -> &str {
        self.feedback_url.as_deref().unwrap_or(&self.generation_url)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelIds {
    pub codegen: String,
    pub datagen: String,
    pub feedback: Option<String>,
}

impl Default for ModelIds {
    fn default() -> Self {
        Self {
            codegen: "qwen_max".to_string(),
            datagen: "gpt-4o-0806".to_string(),
            feedback: None,
        }
    }
}

impl ModelIds {
    pub fn feedback(&self) -> &str {
        self.feedback.as_deref().unwrap_or(&self.codegen)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub timeout_ms: u64,
    pub max_workers: usize,
    pub loop_iteration_limit: u64,
    pub recursion_limit: usize,
    pub require_entry_point: bool,
    pub max_source_bytes: usize,
    pub max_output_bytes: usize,
    /// Timed-out executions allowed to keep running before the sandbox
    /// refuses new work.
    pub max_abandoned_threads: usize,
    pub allowed_globals: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            max_workers: 4,
            loop_iteration_limit: 10_000_000,
            recursion_limit: 512,
            require_entry_point: false,
            max_source_bytes: 1024 * 1024,
            max_output_bytes: 64 * 1024,
            max_abandoned_threads: 8,
            allowed_globals: DEFAULT_ALLOWED_GLOBALS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 180,
            max_retries: 3,
            retry_delay_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelPolicy {
    Exact,
    SharedToken,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub classification_field: String,
    pub output_field: Option<String>,
    pub ground_truth_field: String,
    pub label_policy: LabelPolicy,
    pub label_tokens: Vec<String>,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            classification_field: "Fault classification".to_string(),
            output_field: Some("output".to_string()),
            ground_truth_field: "gt".to_string(),
            label_policy: LabelPolicy::SharedToken,
            label_tokens: DEFAULT_LABEL_TOKENS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl RunConfig {
    /// Check thresholds and limits. Paths are checked by `validate_paths`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::invalid("max_iterations", "must be at least 1"));
        }
        check_unit_interval("min_accuracy_threshold", self.min_accuracy_threshold)?;
        if !self.min_improvement_delta.is_finite() || self.min_improvement_delta < 0.0 {
            return Err(ConfigError::invalid(
                "min_improvement_delta",
                format!("must be a non-negative number, got {}", self.min_improvement_delta),
            ));
        }
        if !(self.test_sample_ratio > 0.0 && self.test_sample_ratio <= 1.0) {
            return Err(ConfigError::invalid(
                "test_sample_ratio",
                format!("must be in (0, 1], got {}", self.test_sample_ratio),
            ));
        }
        if self.max_failures_tracked == 0 {
            return Err(ConfigError::invalid("max_failures_tracked", "must be at least 1"));
        }
        if self.endpoints.generation_url.trim().is_empty() {
            return Err(ConfigError::invalid("endpoints.generation_url", "must not be empty"));
        }
        if self.models.codegen.trim().is_empty() || self.models.datagen.trim().is_empty() {
            return Err(ConfigError::invalid("models", "model ids must not be empty"));
        }
        if self.sandbox.timeout_ms == 0 {
            return Err(ConfigError::invalid("sandbox.timeout_ms", "must be positive"));
        }
        if self.sandbox.max_workers == 0 {
            return Err(ConfigError::invalid("sandbox.max_workers", "must be at least 1"));
        }
        if self.sandbox.max_abandoned_threads == 0 {
            return Err(ConfigError::invalid(
                "sandbox.max_abandoned_threads",
                "must be at least 1",
            ));
        }
        if self.evaluation.classification_field.is_empty()
            || self.evaluation.ground_truth_field.is_empty()
        {
            return Err(ConfigError::invalid("evaluation", "field names must not be empty"));
        }
        Ok(())
    }

    pub fn validate_paths(&self) -> Result<(), ConfigError> {
        if !self.dataset_path.is_file() {
            return Err(ConfigError::DatasetMissing(
                self.dataset_path.display().to_string(),
            ));
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let unreadable = |reason: String| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason,
        };
        let content = std::fs::read_to_string(path).map_err(|e| unreadable(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| unreadable(e.to_string()))
    }
}

fn check_unit_interval(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::invalid(field, format!("must be in [0, 1], got {}", value)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RunConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: RunConfig = serde_json::from_str(
            r#"{"dataset_path": "data/train.json", "max_iterations": 8, "sandbox": {"timeout_ms": 250}}"#,
        )
        .unwrap();

        assert_eq!(config.dataset_path, PathBuf::from("data/train.json"));
        assert_eq!(config.max_iterations, 8);
        assert_eq!(config.sandbox.timeout_ms, 250);
        assert_eq!(config.sandbox.max_workers, 4);
        assert_eq!(config.max_failures_tracked, 3);
        assert_eq!(config.few_shot_per_label, 0);
        assert_eq!(config.evaluation.label_policy, LabelPolicy::SharedToken);
    }

    #[test]
    fn test_rejects_bad_ratio() {
        let mut config = RunConfig::default();
        config.test_sample_ratio = 0.0;
        assert!(config.validate().is_err());
        config.test_sample_ratio = 1.5;
        assert!(config.validate().is_err());
        config.test_sample_ratio = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_thresholds() {
        let mut config = RunConfig::default();
        config.min_accuracy_threshold = 1.2;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.min_improvement_delta = -0.1;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.max_iterations = 0;
        assert!(config.validate().is_err());

        let mut config = RunConfig::default();
        config.sandbox.max_abandoned_threads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_dataset() {
        let mut config = RunConfig::default();
        config.dataset_path = PathBuf::from("/definitely/not/here.json");
        assert!(matches!(
            config.validate_paths(),
            Err(ConfigError::DatasetMissing(_))
        ));
    }

    #[test]
    fn test_feedback_fallbacks() {
        let config = RunConfig::default();
        assert_eq!(config.endpoints.feedback_url(), config.endpoints.generation_url);
        assert_eq!(config.models.feedback(), config.models.codegen);
    }
}
