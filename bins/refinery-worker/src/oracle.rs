//! Oracle clients: code generation, feedback and data cleaning.
//!
//! The controller only sees the traits; the HTTP implementations speak the
//! analysis service's JSON protocol and apply the fixed-delay retry policy.

use async_trait::async_trait;
use refinery_common::config::{OracleConfig, RunConfig};
use refinery_common::error::OracleError;
use refinery_common::types::{FailureCase, FailureKind, Record};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    SeedDescription,
    CodeGeneration,
    Improvement,
}

impl GenerationMode {
    /// Mode string understood by the analysis service.
    pub fn wire_name(&self) -> &'static str {
        match self {
            GenerationMode::SeedDescription => "prompt",
            GenerationMode::CodeGeneration | GenerationMode::Improvement => "codegen",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub mode: GenerationMode,
    /// Record text for seed descriptions, the rendered prompt otherwise.
    pub context: String,
    /// System instructions sent alongside the context.
    pub system: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct FeedbackRequest {
    pub source: String,
    pub failures: Vec<FailureCase>,
    pub kind_counts: BTreeMap<FailureKind, usize>,
    /// Rendered feedback prompt.
    pub prompt: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleReply {
    pub text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[async_trait]
pub trait GenerationOracle: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<OracleReply, OracleError>;
}

#[async_trait]
pub trait FeedbackOracle: Send + Sync {
    async fn critique(&self, request: &FeedbackRequest) -> Result<OracleReply, OracleError>;
}

#[async_trait]
pub trait CleaningOracle: Send + Sync {
    async fn clean(&self, records: Vec<Record>) -> Result<Vec<Record>, OracleError>;
}

/// Fixed-delay retry: `max_retries` extra attempts after the first.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

impl From<&OracleConfig> for RetryPolicy {
    fn from(config: &OracleConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

#[derive(Serialize)]
struct AnalysisRequest<'a> {
    mode: &'a str,
    file_content: &'a str,
    template: &'a str,
    model_id: &'a str,
    filepath: &'a str,
}

#[derive(Deserialize)]
struct AnalysisResponse {
    #[serde(default)]
    ai_response: Option<String>,
    #[serde(default)]
    token_prompt: Option<u64>,
    #[serde(default)]
    token_compli: Option<u64>,
}

#[derive(Serialize)]
struct CleanRequest<'a> {
    raw_data: &'a [Record],
}

#[derive(Deserialize)]
struct CleanResponse {
    #[serde(default)]
    cleaned_data: Vec<Record>,
}

enum AttemptError {
    Transport(String),
    Decode(String),
    Empty,
}

/// One POST endpoint of the analysis service.
#[derive(Debug, Clone)]
pub struct AnalysisEndpoint {
    client: Client,
    url: String,
    filepath: String,
    retry: RetryPolicy,
}

impl AnalysisEndpoint {
    pub fn new(
        url: impl Into<String>,
        filepath: impl Into<String>,
        config: &OracleConfig,
    ) -> Result<Self, OracleError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| OracleError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            filepath: filepath.into(),
            retry: RetryPolicy::from(config),
        })
    }

    #[instrument(skip(self, file_content, template), fields(url = %self.url))]
    async fn analyze(
        &self,
        oracle: &str,
        mode: &str,
        file_content: &str,
        template: &str,
        model: &str,
    ) -> Result<OracleReply, OracleError> {
        let body = AnalysisRequest {
            mode,
            file_content,
            template,
            model_id: model,
            filepath: &self.filepath,
        };

        let attempts = self.retry.attempts();
        let mut last = AttemptError::Empty;
        for attempt in 1..=attempts {
            match self.attempt(&body).await {
                Ok(reply) => {
                    debug!(attempt, prompt_tokens = reply.prompt_tokens, "oracle replied");
                    return Ok(reply);
                }
                Err(err) => {
                    let reason = match &err {
                        AttemptError::Transport(msg) | AttemptError::Decode(msg) => msg.as_str(),
                        AttemptError::Empty => "empty response",
                    };
                    warn!(oracle, attempt, attempts, reason, "oracle attempt failed");
                    last = err;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry.delay).await;
            }
        }

        Err(match last {
            AttemptError::Transport(msg) => OracleError::Transport(msg),
            AttemptError::Decode(msg) => OracleError::Decode(msg),
            AttemptError::Empty => OracleError::EmptyResponse {
                oracle: oracle.to_string(),
                attempts,
            },
        })
    }

    async fn attempt(&self, body: &AnalysisRequest<'_>) -> Result<OracleReply, AttemptError> {
        let response = self
            .client
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| AttemptError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AttemptError::Transport(format!(
                "analysis service returned status {}",
                response.status()
            )));
        }

        let decoded: AnalysisResponse = response
            .json()
            .await
            .map_err(|e| AttemptError::Decode(e.to_string()))?;

        let text = decoded.ai_response.unwrap_or_default();
        if text.trim().is_empty() {
            return Err(AttemptError::Empty);
        }
        Ok(OracleReply {
            text,
            prompt_tokens: decoded.token_prompt.unwrap_or(0),
            completion_tokens: decoded.token_compli.unwrap_or(0),
        })
    }
}

pub struct HttpGenerationOracle {
    endpoint: AnalysisEndpoint,
}

impl HttpGenerationOracle {
    pub fn new(endpoint: AnalysisEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl GenerationOracle for HttpGenerationOracle {
    async fn generate(&self, request: &GenerationRequest) -> Result<OracleReply, OracleError> {
        let oracle = match request.mode {
            GenerationMode::SeedDescription => "seed-description",
            GenerationMode::CodeGeneration => "code-generation",
            GenerationMode::Improvement => "improvement",
        };
        self.endpoint
            .analyze(
                oracle,
                request.mode.wire_name(),
                &request.context,
                &request.system,
                &request.model,
            )
            .await
    }
}

pub struct HttpFeedbackOracle {
    endpoint: AnalysisEndpoint,
}

impl HttpFeedbackOracle {
    pub fn new(endpoint: AnalysisEndpoint) -> Self {
        Self { endpoint }
    }
}

#[async_trait]
impl FeedbackOracle for HttpFeedbackOracle {
    async fn critique(&self, request: &FeedbackRequest) -> Result<OracleReply, OracleError> {
        self.endpoint
            .analyze("feedback", "feedback", &request.prompt, "", &request.model)
            .await
    }
}

pub struct HttpCleaningOracle {
    client: Client,
    url: String,
    retry: RetryPolicy,
}

impl HttpCleaningOracle {
    pub fn new(url: impl Into<String>, config: &OracleConfig) -> Result<Self, OracleError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| OracleError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            retry: RetryPolicy::from(config),
        })
    }

    async fn attempt(&self, records: &[Record]) -> Result<Vec<Record>, OracleError> {
        let response = self
            .client
            .post(&self.url)
            .json(&CleanRequest { raw_data: records })
            .send()
            .await
            .map_err(|e| OracleError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(OracleError::Transport(format!(
                "cleaning service returned status {}",
                response.status()
            )));
        }

        let decoded: CleanResponse = response
            .json()
            .await
            .map_err(|e| OracleError::Decode(e.to_string()))?;
        Ok(decoded.cleaned_data)
    }
}

#[async_trait]
impl CleaningOracle for HttpCleaningOracle {
    #[instrument(skip(self, records), fields(url = %self.url, records = records.len()))]
    async fn clean(&self, records: Vec<Record>) -> Result<Vec<Record>, OracleError> {
        let attempts = self.retry.attempts();
        let mut attempt = 1;
        loop {
            match self.attempt(&records).await {
                Ok(cleaned) => return Ok(cleaned),
                Err(e) if attempt < attempts => {
                    warn!(attempt, attempts, error = %e, "cleaning attempt failed");
                    tokio::time::sleep(self.retry.delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Used when no cleaning endpoint is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCleaner;

#[async_trait]
impl CleaningOracle for IdentityCleaner {
    async fn clean(&self, records: Vec<Record>) -> Result<Vec<Record>, OracleError> {
        Ok(records)
    }
}

/// The three oracles a run talks to.
pub struct Oracles {
    pub generation: Box<dyn GenerationOracle>,
    pub feedback: Box<dyn FeedbackOracle>,
    pub cleaning: Box<dyn CleaningOracle>,
}

impl Oracles {
    /// HTTP oracles for the configured endpoints.
    pub fn from_config(config: &RunConfig) -> Result<Self, OracleError> {
        let filepath = config.dataset_path.display().to_string();
        let generation = AnalysisEndpoint::new(
            config.endpoints.generation_url.clone(),
            filepath.clone(),
            &config.oracle,
        )?;
        let feedback = AnalysisEndpoint::new(
            config.endpoints.feedback_url().to_string(),
            filepath,
            &config.oracle,
        )?;
        let cleaning: Box<dyn CleaningOracle> = match &config.endpoints.clean_url {
            Some(url) => Box::new(HttpCleaningOracle::new(url.clone(), &config.oracle)?),
            None => Box::new(IdentityCleaner),
        };

        Ok(Self {
            generation: Box::new(HttpGenerationOracle::new(generation)),
            feedback: Box::new(HttpFeedbackOracle::new(feedback)),
            cleaning,
        })
    }
}
