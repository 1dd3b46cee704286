/// Run Executor - End-to-End Orchestration
///
/// **Pipeline:**
/// 1. Load the dataset (a JSON array of records)
/// 2. Pass it through the cleaning oracle
/// 3. Pick a seed record and ask for its standardized description
/// 4. Hand seed and dataset to the Refinement Controller
/// 5. Run the best program over the full dataset
/// 6. Render successful outputs as a chat export
///
/// This module is the glue layer - it knows nothing about:
/// - How code executes (engine's job)
/// - How scoring works (evaluator's job)
/// - When refinement stops (controller's job)
use chrono::{DateTime, Utc};
use rand::Rng;
use refinery_common::artifacts::{
    ArtifactError, ChatExport, ChatMetadata, ChatRecord, ChatRole, ChatStatistics, ChatTurn,
    RunArtifacts, RunSummary, BATCH_RESULTS_FILE, BEST_PROGRAM_FILE, CHAT_RESULTS_FILE,
    METRICS_FILE, RUN_SUMMARY_FILE,
};
use refinery_common::config::RunConfig;
use refinery_common::error::RunError;
use refinery_common::types::{format_rate, BatchReport, IterationRecord, Record};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::batch::BatchRunner;
use crate::controller::{Candidate, RefinementController, RunContext, Seed, StopReason};
use crate::engine::SandboxEngine;
use crate::evaluator::{seeded_rng, Evaluator};
use crate::metrics::{MetricsReport, STEP_DATA_CLEANING, STEP_FINAL_PROCESSING, STEP_SEED_GENERATION};
use crate::oracle::{GenerationMode, GenerationRequest, Oracles};
use crate::prompts::PromptRenderer;

/// Keys of the instruction-format records the generated program returns.
const INSTRUCTION_INPUT: &str = "input";
const INSTRUCTION_OUTPUT: &str = "output";

/// Everything a finished (or aborted) run produced.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stop_reason: Option<StopReason>,
    pub best: Option<Candidate>,
    pub iterations: Vec<IterationRecord>,
    pub final_report: Option<BatchReport>,
    pub chat: Option<ChatExport>,
    pub metrics: MetricsReport,
    /// Terminal failure raised by the controller, if any.
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn cancelled(&self) -> bool {
        self.stop_reason == Some(StopReason::Cancelled)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: self.finished_at,
            stop_reason: self.stop_reason.map(|r| r.to_string()),
            cancelled: self.cancelled(),
            best_iteration: self.best.as_ref().map(|b| b.program.iteration),
            best_accuracy: self.best.as_ref().map(|b| b.accuracy),
            iterations: self.iterations.clone(),
            final_success_rate: self.final_report.as_ref().map(|r| r.success_rate.clone()),
            error: self.error.clone(),
        }
    }

    /// Write every artifact this outcome has into the run directory.
    pub fn persist(&self, artifacts: &RunArtifacts) -> Result<Vec<PathBuf>, ArtifactError> {
        let mut written = vec![
            artifacts.write_json(METRICS_FILE, &self.metrics)?,
            artifacts.write_json(RUN_SUMMARY_FILE, &self.summary())?,
        ];
        if let Some(best) = &self.best {
            written.push(artifacts.write_text(BEST_PROGRAM_FILE, &best.program.source)?);
        }
        if let Some(report) = &self.final_report {
            written.push(artifacts.write_json(BATCH_RESULTS_FILE, report)?);
        }
        if let Some(chat) = &self.chat {
            written.push(artifacts.write_json(CHAT_RESULTS_FILE, chat)?);
        }
        Ok(written)
    }
}

/// Read a dataset file holding a JSON array of records.
pub async fn load_dataset(path: &Path) -> Result<Vec<Record>, RunError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunError::Dataset(format!("{}: {}", path.display(), e)))?;
    let value: Value = serde_json::from_str(&content)
        .map_err(|e| RunError::Dataset(format!("{}: {}", path.display(), e)))?;

    match value {
        Value::Array(records) if records.is_empty() => Err(RunError::DatasetEmpty),
        Value::Array(records) => Ok(records),
        _ => Err(RunError::Dataset(format!(
            "{}: expected a JSON array of records",
            path.display()
        ))),
    }
}

/// Run one refinement end to end.
///
/// Dataset, cleaning and seed failures are returned as `Err`. Failures
/// inside the refinement loop end the run but still yield an outcome
/// carrying the best candidate so far.
pub async fn execute_run(
    config: &RunConfig,
    oracles: &Oracles,
    cancel: CancellationToken,
) -> Result<RunOutcome, RunError> {
    let started_at = Utc::now();
    let mut ctx = RunContext::new(cancel);
    ctx.metrics.set_settings(config);

    info!(
        run_id = %ctx.run_id,
        dataset = %config.dataset_path.display(),
        max_iterations = config.max_iterations,
        threshold = config.min_accuracy_threshold,
        "Starting refinement run"
    );

    // Step 1: Load and clean
    let raw = load_dataset(&config.dataset_path).await?;
    ctx.metrics.start_step(STEP_DATA_CLEANING);
    let raw_len = raw.len();
    let dataset = oracles.cleaning.clean(raw).await?;
    ctx.metrics.end_step(STEP_DATA_CLEANING);
    if dataset.is_empty() {
        return Err(RunError::DatasetEmpty);
    }
    info!(raw = raw_len, cleaned = dataset.len(), "Dataset ready");

    let prompts = PromptRenderer::new(
        &config.evaluation.classification_field,
        &config.evaluation.ground_truth_field,
    )?;

    let evaluator = Evaluator::new(config);

    // Step 2: Seed description
    ctx.metrics.start_step(STEP_SEED_GENERATION);
    let seed = describe_seed(config, oracles, &prompts, &evaluator, &dataset, &mut ctx).await?;
    let Some(seed) = seed else {
        warn!("Run cancelled before refinement started");
        return Ok(finish(ctx, started_at, Some(StopReason::Cancelled), None, Vec::new(), None, None, None));
    };
    ctx.metrics.end_step(STEP_SEED_GENERATION);

    // Step 3: Refine
    let runner = BatchRunner::new(SandboxEngine::new(&config.sandbox), &config.sandbox);
    let mut controller = RefinementController::new(
        config,
        &runner,
        &evaluator,
        &prompts,
        oracles.generation.as_ref(),
        oracles.feedback.as_ref(),
    );
    let failure = match controller.run(&seed, &dataset, &mut ctx).await {
        Ok(_) => None,
        Err(e) => {
            error!(run_id = %ctx.run_id, error = %e, "Refinement failed");
            Some(e.to_string())
        }
    };
    let stop_reason = controller.stop_reason();
    let best = controller.best().cloned();
    let iterations = controller.history().to_vec();

    // Step 4: Full-dataset pass with the best program
    let mut final_report = None;
    let mut chat = None;
    match &best {
        Some(best) if failure.is_none() && !ctx.cancel.is_cancelled() => {
            ctx.metrics.start_step(STEP_FINAL_PROCESSING);
            let report = runner.run(&best.program, &dataset, &ctx.cancel).await;
            if ctx.cancel.is_cancelled() {
                warn!("Final pass cancelled; report discarded");
            } else {
                info!(
                    best_iteration = best.program.iteration,
                    best_accuracy = best.accuracy,
                    success_rate = %report.success_rate,
                    "Final pass complete"
                );
                chat = Some(chat_export(&report, &evaluator));
                final_report = Some(report);
            }
            ctx.metrics.end_step(STEP_FINAL_PROCESSING);
        }
        Some(_) => warn!("Final pass skipped"),
        None => warn!("No candidate was evaluated"),
    }

    Ok(finish(ctx, started_at, stop_reason, best, iterations, final_report, chat, failure))
}

#[allow(clippy::too_many_arguments)]
fn finish(
    ctx: RunContext,
    started_at: DateTime<Utc>,
    stop_reason: Option<StopReason>,
    best: Option<Candidate>,
    iterations: Vec<IterationRecord>,
    final_report: Option<BatchReport>,
    chat: Option<ChatExport>,
    error: Option<String>,
) -> RunOutcome {
    RunOutcome {
        run_id: ctx.run_id,
        started_at,
        finished_at: Utc::now(),
        stop_reason,
        best,
        iterations,
        final_report,
        chat,
        metrics: ctx.metrics.report(),
        error,
    }
}

/// Pick a random record and ask the generation oracle to describe it as an
/// instruction-format example, then draw the per-label examples. `None`
/// when cancelled.
async fn describe_seed(
    config: &RunConfig,
    oracles: &Oracles,
    prompts: &PromptRenderer,
    evaluator: &Evaluator,
    dataset: &[Record],
    ctx: &mut RunContext,
) -> Result<Option<Seed>, RunError> {
    let mut rng = seeded_rng(config.sample_seed);
    let index = rng.gen_range(0..dataset.len());
    let record = dataset[index].clone();

    let request = GenerationRequest {
        mode: GenerationMode::SeedDescription,
        context: serde_json::to_string_pretty(&record).unwrap_or_else(|_| record.to_string()),
        system: prompts.seed_system()?,
        model: config.models.datagen.clone(),
    };

    let reply = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return Ok(None),
        reply = oracles.generation.generate(&request) => reply?,
    };
    ctx.metrics.add_tokens(reply.prompt_tokens, reply.completion_tokens);
    info!(seed_index = index, "Seed description received");

    let few_shot = evaluator.few_shot_examples(dataset, config.few_shot_per_label, &mut rng);
    if !few_shot.is_empty() {
        info!(labels = few_shot.len(), per_label = config.few_shot_per_label, "Few-shot examples drawn");
    }

    Ok(Some(Seed {
        record,
        description: reply.text.trim().to_string(),
        few_shot,
    }))
}

/// Successful outputs carrying `input`/`output` fields, as Human/Assistant
/// pairs with the ground truth and prediction attached.
pub fn chat_export(report: &BatchReport, evaluator: &Evaluator) -> ChatExport {
    let mut results = Vec::new();
    let mut correct = 0usize;

    for outcome in report.outcomes.iter().filter(|o| o.result.is_success()) {
        let Some(output) = outcome.result.output.as_ref() else {
            continue;
        };
        let (Some(question), Some(answer)) =
            (output.get(INSTRUCTION_INPUT), output.get(INSTRUCTION_OUTPUT))
        else {
            continue;
        };

        if evaluator.is_correct(outcome) {
            correct += 1;
        }
        results.push(ChatRecord {
            index: outcome.index,
            chat: vec![
                ChatTurn {
                    role: ChatRole::Human,
                    content: question.clone(),
                },
                ChatTurn {
                    role: ChatRole::Assistant,
                    content: answer.clone(),
                },
            ],
            metadata: ChatMetadata {
                gt: evaluator.ground_truth(&outcome.input),
                pred: evaluator.extract_classification(output),
            },
        });
    }

    ChatExport {
        statistics: ChatStatistics {
            total_samples: results.len(),
            correct_predictions: correct,
            accuracy: format_rate(correct, results.len()),
        },
        results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{
        CleaningOracle, FeedbackOracle, FeedbackRequest, GenerationOracle, IdentityCleaner,
        OracleReply,
    };
    use async_trait::async_trait;
    use refinery_common::config::LabelPolicy;
    use refinery_common::error::OracleError;
    use refinery_common::types::{ExecutionResult, RecordOutcome};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    struct Replies(Mutex<VecDeque<String>>);

    impl Replies {
        fn new(replies: &[&str]) -> Self {
            Self(Mutex::new(replies.iter().map(|r| r.to_string()).collect()))
        }
    }

    #[async_trait]
    impl GenerationOracle for Replies {
        async fn generate(&self, _request: &GenerationRequest) -> Result<OracleReply, OracleError> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .map(|text| OracleReply {
                    text,
                    prompt_tokens: 1,
                    completion_tokens: 1,
                })
                .ok_or_else(|| OracleError::Transport("connection refused".into()))
        }
    }

    /// Replies with `PERFECT_PROGRAM` and keeps every prompt it was sent.
    struct PromptLog(Arc<Mutex<Vec<(GenerationMode, String)>>>);

    #[async_trait]
    impl GenerationOracle for PromptLog {
        async fn generate(&self, request: &GenerationRequest) -> Result<OracleReply, OracleError> {
            self.0.lock().unwrap().push((request.mode, request.context.clone()));
            Ok(OracleReply {
                text: PERFECT_PROGRAM.into(),
                prompt_tokens: 1,
                completion_tokens: 1,
            })
        }
    }

    struct SilentFeedback;

    #[async_trait]
    impl FeedbackOracle for SilentFeedback {
        async fn critique(&self, _request: &FeedbackRequest) -> Result<OracleReply, OracleError> {
            Ok(OracleReply {
                text: "no comment".into(),
                prompt_tokens: 0,
                completion_tokens: 0,
            })
        }
    }

    /// Cancels the run from inside the first feedback call.
    struct CancellingFeedback(CancellationToken);

    #[async_trait]
    impl FeedbackOracle for CancellingFeedback {
        async fn critique(&self, _request: &FeedbackRequest) -> Result<OracleReply, OracleError> {
            self.0.cancel();
            Ok(OracleReply {
                text: "stop".into(),
                prompt_tokens: 0,
                completion_tokens: 0,
            })
        }
    }

    struct DropEverything;

    #[async_trait]
    impl CleaningOracle for DropEverything {
        async fn clean(&self, _records: Vec<Record>) -> Result<Vec<Record>, OracleError> {
            Ok(Vec::new())
        }
    }

    const PERFECT_PROGRAM: &str = "```javascript\nfunction generate_instruction(input_data) {\n  return { input: \"record \" + input_data.id, output: { \"Fault classification\": \"X\" } };\n}\n```";

    fn write_dataset(dir: &Path, records: &Value) -> PathBuf {
        let path = dir.join("dataset.json");
        std::fs::write(&path, records.to_string()).unwrap();
        path
    }

    fn config_for(dataset_path: PathBuf, output_dir: &Path) -> RunConfig {
        let mut config = RunConfig::default();
        config.dataset_path = dataset_path;
        config.output_dir = output_dir.to_path_buf();
        config.test_sample_ratio = 1.0;
        config.sample_seed = Some(7);
        config.evaluation.label_policy = LabelPolicy::Exact;
        config
    }

    fn oracles(replies: &[&str]) -> Oracles {
        Oracles {
            generation: Box::new(Replies::new(replies)),
            feedback: Box::new(SilentFeedback),
            cleaning: Box::new(IdentityCleaner),
        }
    }

    fn records(n: usize) -> Value {
        Value::Array((0..n).map(|id| json!({"id": id, "gt": "X"})).collect())
    }

    #[tokio::test]
    async fn test_load_dataset_variants() {
        let tmp = tempfile::tempdir().unwrap();

        let path = write_dataset(tmp.path(), &records(3));
        assert_eq!(load_dataset(&path).await.unwrap().len(), 3);

        let path = write_dataset(tmp.path(), &json!([]));
        assert!(matches!(load_dataset(&path).await, Err(RunError::DatasetEmpty)));

        let path = write_dataset(tmp.path(), &json!({"records": []}));
        assert!(matches!(load_dataset(&path).await, Err(RunError::Dataset(_))));

        let missing = tmp.path().join("missing.json");
        assert!(matches!(load_dataset(&missing).await, Err(RunError::Dataset(_))));
    }

    #[tokio::test]
    async fn test_full_run_produces_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_for(write_dataset(tmp.path(), &records(20)), tmp.path());
        let oracles = oracles(&["{\"input\": \"record 0\", \"output\": {}}", PERFECT_PROGRAM]);

        let outcome = execute_run(&config, &oracles, CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.stop_reason, Some(StopReason::AccuracyThreshold));
        assert_eq!(outcome.best.as_ref().unwrap().accuracy, 1.0);

        let report = outcome.final_report.as_ref().unwrap();
        assert_eq!(report.total, 20);
        assert_eq!(report.success_rate, "100.00%");

        let chat = outcome.chat.as_ref().unwrap();
        assert_eq!(chat.statistics.total_samples, 20);
        assert_eq!(chat.statistics.correct_predictions, 20);
        assert_eq!(chat.results[3].chat[0].content, json!("record 3"));
        assert_eq!(chat.results[3].metadata.pred.as_deref(), Some("X"));

        let artifacts = RunArtifacts::open(tmp.path());
        let written = outcome.persist(&artifacts).unwrap();
        assert_eq!(written.len(), 5);
        let summary: RunSummary = artifacts.read_json(RUN_SUMMARY_FILE).unwrap();
        assert_eq!(summary.stop_reason.as_deref(), Some("accuracy_threshold"));
        assert_eq!(summary.best_iteration, Some(0));
        assert_eq!(summary.final_success_rate.as_deref(), Some("100.00%"));

        let steps: Vec<String> = outcome
            .metrics
            .execution_metrics
            .step_times
            .iter()
            .map(|s| s.step.clone())
            .collect();
        assert!(steps.contains(&STEP_SEED_GENERATION.to_string()));
        assert!(steps.contains(&STEP_FINAL_PROCESSING.to_string()));
    }

    #[tokio::test]
    async fn test_oracle_failure_keeps_best_and_skips_final_pass() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_for(write_dataset(tmp.path(), &records(10)), tmp.path());
        let half_right = "function generate_instruction(input_data) {\n  return { \"Fault classification\": input_data.id < 5 ? \"X\" : \"Y\" };\n}";
        // Seed description and the first program only; the improvement request fails
        let oracles = oracles(&["seed example", half_right]);

        let outcome = execute_run(&config, &oracles, CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.is_success());
        assert!(outcome.error.as_ref().unwrap().contains("connection refused"));
        assert_eq!(outcome.best.as_ref().unwrap().accuracy, 0.5);
        assert!(outcome.final_report.is_none());

        let written = outcome.persist(&RunArtifacts::open(tmp.path())).unwrap();
        // metrics, summary, best program
        assert_eq!(written.len(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_run_returns_outcome() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_for(write_dataset(tmp.path(), &records(5)), tmp.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = execute_run(&config, &oracles(&["seed", PERFECT_PROGRAM]), cancel)
            .await
            .unwrap();

        assert!(outcome.cancelled());
        assert!(outcome.best.is_none());
        assert!(outcome.summary().cancelled);
    }

    #[tokio::test]
    async fn test_cancel_after_first_iteration_persists_best() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_for(write_dataset(tmp.path(), &records(10)), tmp.path());
        let half_right = "function generate_instruction(input_data) {\n  return { \"Fault classification\": input_data.id < 5 ? \"X\" : \"Y\" };\n}";
        let cancel = CancellationToken::new();
        let oracles = Oracles {
            generation: Box::new(Replies::new(&["seed example", half_right, PERFECT_PROGRAM])),
            feedback: Box::new(CancellingFeedback(cancel.clone())),
            cleaning: Box::new(IdentityCleaner),
        };

        let outcome = execute_run(&config, &oracles, cancel).await.unwrap();

        assert!(outcome.cancelled());
        assert_eq!(outcome.stop_reason, Some(StopReason::Cancelled));
        assert!(outcome.error.is_none());
        assert_eq!(outcome.best.as_ref().unwrap().accuracy, 0.5);
        assert!(outcome.final_report.is_none());
        assert!(outcome.chat.is_none());

        let artifacts = RunArtifacts::open(tmp.path());
        let written = outcome.persist(&artifacts).unwrap();
        assert_eq!(written.len(), 3);
        assert!(written.iter().any(|p| p.ends_with(BEST_PROGRAM_FILE)));
        let saved = std::fs::read_to_string(tmp.path().join(BEST_PROGRAM_FILE)).unwrap();
        assert!(saved.contains("input_data.id < 5"));
        let summary: RunSummary = artifacts.read_json(RUN_SUMMARY_FILE).unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.best_iteration, Some(0));
    }

    #[tokio::test]
    async fn test_few_shot_groups_reach_codegen_prompt() {
        let tmp = tempfile::tempdir().unwrap();
        let dataset = json!([
            {"id": 0, "gt": "X"},
            {"id": 1, "gt": "Y"},
            {"id": 2, "gt": "X"},
        ]);
        let mut config = config_for(write_dataset(tmp.path(), &dataset), tmp.path());
        config.few_shot_per_label = 1;
        let log = Arc::new(Mutex::new(Vec::new()));
        let oracles = Oracles {
            generation: Box::new(PromptLog(log.clone())),
            feedback: Box::new(SilentFeedback),
            cleaning: Box::new(IdentityCleaner),
        };

        execute_run(&config, &oracles, CancellationToken::new())
            .await
            .unwrap();

        let log = log.lock().unwrap();
        let (mode, codegen) = &log[1];
        assert_eq!(*mode, GenerationMode::CodeGeneration);
        assert!(codegen.contains("#### X"));
        assert!(codegen.contains("#### Y"));
    }

    #[tokio::test]
    async fn test_empty_cleaned_dataset_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let config = config_for(write_dataset(tmp.path(), &records(5)), tmp.path());
        let oracles = Oracles {
            generation: Box::new(Replies::new(&[])),
            feedback: Box::new(SilentFeedback),
            cleaning: Box::new(DropEverything),
        };

        let err = execute_run(&config, &oracles, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::DatasetEmpty));
    }

    #[test]
    fn test_chat_export_skips_non_instruction_outputs() {
        let mut config = RunConfig::default();
        config.evaluation.label_policy = LabelPolicy::Exact;
        let evaluator = Evaluator::new(&config);

        let report = BatchReport::from_outcomes(vec![
            RecordOutcome {
                index: 0,
                input: json!({"gt": "A相接地"}),
                result: ExecutionResult::success(
                    String::new(),
                    json!({"input": "q0", "output": {"Fault classification": "A相接地"}}),
                    1,
                ),
            },
            RecordOutcome {
                index: 1,
                input: json!({"gt": "B相接地"}),
                result: ExecutionResult::success(
                    String::new(),
                    json!({"input": "q1", "output": {"Fault classification": "C相接地"}}),
                    1,
                ),
            },
            RecordOutcome {
                index: 2,
                input: json!({"gt": "B相接地"}),
                result: ExecutionResult::success(String::new(), json!("printed text"), 1),
            },
        ]);

        let export = chat_export(&report, &evaluator);

        assert_eq!(export.statistics.total_samples, 2);
        assert_eq!(export.statistics.correct_predictions, 1);
        assert_eq!(export.statistics.accuracy, "50.00%");
        assert_eq!(export.results[1].metadata.gt.as_deref(), Some("B相接地"));
        assert_eq!(export.results[1].chat[1].role, ChatRole::Assistant);
    }
}
