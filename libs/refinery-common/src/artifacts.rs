use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::types::IterationRecord;

pub const BATCH_RESULTS_FILE: &str = "batch_results.json";
pub const METRICS_FILE: &str = "metrics.json";
pub const BEST_PROGRAM_FILE: &str = "best_program.js";
pub const RUN_SUMMARY_FILE: &str = "run_summary.json";
pub const CHAT_RESULTS_FILE: &str = "chat_results.json";

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact {path} is not valid JSON: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Directory that receives every file a single run produces.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    dir: PathBuf,
}

impl RunArtifacts {
    /// Create `<output_dir>/<YYYYmmdd_HHMMSS>/`.
    pub fn create(output_dir: &Path, started_at: DateTime<Utc>) -> Result<Self, ArtifactError> {
        let dir = output_dir.join(started_at.format("%Y%m%d_%H%M%S").to_string());
        std::fs::create_dir_all(&dir).map_err(|source| ArtifactError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn open(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<PathBuf, ArtifactError> {
        let path = self.path(name);
        let body = serde_json::to_string_pretty(value).map_err(|source| ArtifactError::Json {
            path: path.display().to_string(),
            source,
        })?;
        self.write_bytes(&path, body.as_bytes())?;
        Ok(path)
    }

    pub fn write_text(&self, name: &str, text: &str) -> Result<PathBuf, ArtifactError> {
        let path = self.path(name);
        self.write_bytes(&path, text.as_bytes())?;
        Ok(path)
    }

    pub fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<T, ArtifactError> {
        read_json(&self.path(name))
    }

    fn write_bytes(&self, path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
        std::fs::write(path, bytes).map_err(|source| ArtifactError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ArtifactError> {
    let content = std::fs::read_to_string(path).map_err(|source| ArtifactError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| ArtifactError::Json {
        path: path.display().to_string(),
        source,
    })
}

/// Top-level record of how a run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stop_reason: Option<String>,
    pub cancelled: bool,
    pub best_iteration: Option<u32>,
    pub best_accuracy: Option<f64>,
    pub iterations: Vec<IterationRecord>,
    pub final_success_rate: Option<String>,
    /// Set when an oracle or dataset failure ended the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatRole {
    Human,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMetadata {
    pub gt: Option<String>,
    pub pred: Option<String>,
}

/// A successful program output rendered as a Human/Assistant exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub index: usize,
    pub chat: Vec<ChatTurn>,
    pub metadata: ChatMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatStatistics {
    pub total_samples: usize,
    pub correct_predictions: usize,
    pub accuracy: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatExport {
    pub statistics: ChatStatistics,
    pub results: Vec<ChatRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_run_directory_is_timestamped() {
        let tmp = tempfile::tempdir().unwrap();
        let started = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();

        let artifacts = RunArtifacts::create(tmp.path(), started).unwrap();

        assert_eq!(artifacts.dir(), tmp.path().join("20240309_140507"));
        assert!(artifacts.dir().is_dir());
    }

    #[test]
    fn test_write_then_read_summary() {
        let tmp = tempfile::tempdir().unwrap();
        let artifacts = RunArtifacts::open(tmp.path());
        let now = Utc::now();
        let summary = RunSummary {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            stop_reason: Some("plateau".into()),
            cancelled: false,
            best_iteration: Some(1),
            best_accuracy: Some(0.41),
            iterations: vec![],
            final_success_rate: Some("100.00%".into()),
            error: None,
        };

        artifacts.write_json(RUN_SUMMARY_FILE, &summary).unwrap();
        let loaded: RunSummary = artifacts.read_json(RUN_SUMMARY_FILE).unwrap();

        assert_eq!(loaded, summary);
    }

    #[test]
    fn test_read_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let artifacts = RunArtifacts::open(tmp.path());
        let err = artifacts.read_json::<RunSummary>(METRICS_FILE).unwrap_err();
        assert!(matches!(err, ArtifactError::Io { .. }));
    }

    #[test]
    fn test_write_text_keeps_source() {
        let tmp = tempfile::tempdir().unwrap();
        let artifacts = RunArtifacts::open(tmp.path());
        let path = artifacts
            .write_text(BEST_PROGRAM_FILE, "function generate_instruction(r) { return r; }\n")
            .unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.starts_with("function generate_instruction"));
    }
}
