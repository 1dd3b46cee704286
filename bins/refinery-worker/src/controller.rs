/// Refinement Controller - Generate, Evaluate, Critique, Regenerate
///
/// **State Machine:**
/// `Generating → Evaluating → (Converged | Feedback → Generating) → Terminated`
///
/// **Termination Checks (in order, after each evaluation):**
/// 1. accuracy > `min_accuracy_threshold` → Converged
/// 2. iteration > 0 and accuracy - previous < `min_improvement_delta` → Converged (plateau)
/// 3. no failure cases → Converged (nothing to improve)
/// 4. `max_iterations` evaluations done → Terminated
///
/// **Ownership:**
/// The controller is the single writer of the iteration history, the best
/// candidate slot and the run's metrics. Iterations are strictly sequential.
/// When `run` returns an error the best candidate so far stays readable.
use rand::rngs::StdRng;
use refinery_common::config::RunConfig;
use refinery_common::error::RunError;
use refinery_common::types::{FailureCase, IterationRecord, Record, SourceProgram};
use serde::Serialize;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batch::BatchRunner;
use crate::evaluator::{sample_indices, seeded_rng, Evaluation, Evaluator, LabelExamples};
use crate::metrics::{MetricsCollector, STEP_CODE_OPTIMIZATION, STEP_INITIAL_CODE_GENERATION};
use crate::oracle::{
    FeedbackOracle, FeedbackRequest, GenerationMode, GenerationOracle, GenerationRequest,
    OracleReply,
};
use crate::prompts::{extract_code_block, PromptRenderer};

/// Per-run context threaded through the pipeline instead of globals.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: Uuid,
    pub metrics: MetricsCollector,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            metrics: MetricsCollector::new(),
            cancel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    AccuracyThreshold,
    Plateau,
    NoFailures,
    MaxIterations,
    Cancelled,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StopReason::AccuracyThreshold => "accuracy_threshold",
            StopReason::Plateau => "plateau",
            StopReason::NoFailures => "no_failures",
            StopReason::MaxIterations => "max_iterations",
            StopReason::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Generating,
    Evaluating,
    Feedback,
    Converged(StopReason),
    Terminated(StopReason),
}

impl ControllerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ControllerState::Converged(_) | ControllerState::Terminated(_))
    }
}

/// Best program seen so far and the accuracy it scored.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub program: SourceProgram,
    pub accuracy: f64,
}

/// Seed record and its standardized description, the input to the first generation.
#[derive(Debug, Clone)]
pub struct Seed {
    pub record: Record,
    pub description: String,
    pub few_shot: Vec<LabelExamples>,
}

/// Outcome of one refinement cycle.
enum Progress {
    /// A new program is ready; carries the accuracy just scored.
    Continue(f64),
    Stop(ControllerState),
}

pub struct RefinementController<'a> {
    config: &'a RunConfig,
    runner: &'a BatchRunner,
    evaluator: &'a Evaluator,
    prompts: &'a PromptRenderer,
    generation: &'a dyn GenerationOracle,
    feedback: &'a dyn FeedbackOracle,
    rng: StdRng,
    state: ControllerState,
    current: Option<SourceProgram>,
    best: Option<Candidate>,
    history: Vec<IterationRecord>,
    last_failures: Vec<FailureCase>,
}

impl<'a> RefinementController<'a> {
    pub fn new(
        config: &'a RunConfig,
        runner: &'a BatchRunner,
        evaluator: &'a Evaluator,
        prompts: &'a PromptRenderer,
        generation: &'a dyn GenerationOracle,
        feedback: &'a dyn FeedbackOracle,
    ) -> Self {
        Self {
            config,
            runner,
            evaluator,
            prompts,
            generation,
            feedback,
            rng: seeded_rng(config.sample_seed),
            state: ControllerState::Generating,
            current: None,
            best: None,
            history: Vec::new(),
            last_failures: Vec::new(),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn best(&self) -> Option<&Candidate> {
        self.best.as_ref()
    }

    pub fn current(&self) -> Option<&SourceProgram> {
        self.current.as_ref()
    }

    pub fn history(&self) -> &[IterationRecord] {
        &self.history
    }

    /// Failure cases from the most recent evaluation.
    pub fn last_failures(&self) -> &[FailureCase] {
        &self.last_failures
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self.state {
            ControllerState::Converged(reason) | ControllerState::Terminated(reason) => Some(reason),
            _ => None,
        }
    }

    /// Generate the first program from the seed, then refine until a stop
    /// condition holds.
    #[tracing::instrument(skip_all, fields(run_id = %ctx.run_id, records = dataset.len()))]
    pub async fn run(
        &mut self,
        seed: &Seed,
        dataset: &[Record],
        ctx: &mut RunContext,
    ) -> Result<StopReason, RunError> {
        if dataset.is_empty() {
            return Err(RunError::DatasetEmpty);
        }

        self.state = ControllerState::Generating;
        ctx.metrics.start_step(STEP_INITIAL_CODE_GENERATION);
        let generated = self.generate_initial(seed, ctx).await;
        ctx.metrics.end_step(STEP_INITIAL_CODE_GENERATION);
        if !generated? {
            return Ok(self.stop(ControllerState::Terminated(StopReason::Cancelled)));
        }

        ctx.metrics.start_step(STEP_CODE_OPTIMIZATION);
        let reason = self.refine(dataset, ctx).await;
        ctx.metrics.end_step(STEP_CODE_OPTIMIZATION);
        reason
    }

    /// Returns `false` when the run was cancelled before a program arrived.
    async fn generate_initial(&mut self, seed: &Seed, ctx: &mut RunContext) -> Result<bool, RunError> {
        let request = GenerationRequest {
            mode: GenerationMode::CodeGeneration,
            context: self.prompts.codegen(&seed.record, &seed.description, &seed.few_shot)?,
            system: self.prompts.codegen_system()?,
            model: self.config.models.codegen.clone(),
        };
        let reply = self.ask(ctx, self.generation.generate(&request)).await?;
        let Some(reply) = reply else {
            return Ok(false);
        };
        self.current = Some(SourceProgram::new(0, extract_code_block(&reply.text)));
        Ok(true)
    }

    async fn refine(&mut self, dataset: &[Record], ctx: &mut RunContext) -> Result<StopReason, RunError> {
        let mut iteration: u32 = 0;
        let mut previous_accuracy = 0.0;

        loop {
            if ctx.cancel.is_cancelled() {
                return Ok(self.stop(ControllerState::Terminated(StopReason::Cancelled)));
            }

            // Closed on every exit, stop and error included
            let step = format!("iteration_{}", iteration);
            ctx.metrics.start_step(&step);
            let progress = self.iterate(iteration, previous_accuracy, dataset, ctx).await;
            ctx.metrics.end_step(&step);

            match progress? {
                Progress::Continue(accuracy) => {
                    previous_accuracy = accuracy;
                    iteration += 1;
                }
                Progress::Stop(state) => return Ok(self.stop(state)),
            }
        }
    }

    /// One evaluate / critique / regenerate cycle.
    async fn iterate(
        &mut self,
        iteration: u32,
        previous_accuracy: f64,
        dataset: &[Record],
        ctx: &mut RunContext,
    ) -> Result<Progress, RunError> {
        let Some(program) = self.current.clone() else {
            return Err(RunError::Prompt("no program to evaluate".to_string()));
        };

        self.state = ControllerState::Evaluating;
        let indices = sample_indices(dataset.len(), self.config.test_sample_ratio, &mut self.rng);
        let report = self
            .runner
            .run_indices(&program, dataset, &indices, &ctx.cancel)
            .await;
        if ctx.cancel.is_cancelled() {
            // A cancelled batch says nothing about the program
            return Ok(Progress::Stop(ControllerState::Terminated(StopReason::Cancelled)));
        }

        let evaluation = self.evaluator.score(&report);
        self.record_iteration(iteration, &program, &evaluation, ctx);

        if let Some(state) = self.check_stop(iteration, previous_accuracy, &evaluation) {
            return Ok(Progress::Stop(state));
        }

        self.state = ControllerState::Feedback;
        let critique = self.request_feedback(&program, &evaluation, ctx).await?;
        let Some(critique) = critique else {
            return Ok(Progress::Stop(ControllerState::Terminated(StopReason::Cancelled)));
        };

        self.state = ControllerState::Generating;
        let request = GenerationRequest {
            mode: GenerationMode::Improvement,
            context: self
                .prompts
                .improvement(program.as_str(), &critique, &evaluation.failures)?,
            system: self.prompts.codegen_system()?,
            model: self.config.models.codegen.clone(),
        };
        let reply = self.ask(ctx, self.generation.generate(&request)).await?;
        let Some(reply) = reply else {
            return Ok(Progress::Stop(ControllerState::Terminated(StopReason::Cancelled)));
        };
        self.current = Some(SourceProgram::new(
            iteration + 1,
            extract_code_block(&reply.text),
        ));
        Ok(Progress::Continue(evaluation.accuracy))
    }

    fn record_iteration(
        &mut self,
        iteration: u32,
        program: &SourceProgram,
        evaluation: &Evaluation,
        ctx: &mut RunContext,
    ) {
        let record = IterationRecord::now(iteration, evaluation.accuracy, evaluation.failed_count);
        ctx.metrics.add_iteration(record.clone());
        self.history.push(record);
        self.last_failures = evaluation.failures.clone();

        let improved = self
            .best
            .as_ref()
            .map_or(true, |best| evaluation.accuracy > best.accuracy);
        if improved {
            self.best = Some(Candidate {
                program: program.clone(),
                accuracy: evaluation.accuracy,
            });
        }
        if let Some(best) = &self.best {
            ctx.metrics.set_final_accuracy(best.accuracy);
        }

        info!(
            iteration,
            accuracy = evaluation.accuracy,
            evaluated = evaluation.evaluated,
            failed = evaluation.failed_count,
            best = improved,
            "iteration evaluated"
        );
    }

    fn check_stop(
        &self,
        iteration: u32,
        previous_accuracy: f64,
        evaluation: &Evaluation,
    ) -> Option<ControllerState> {
        if evaluation.accuracy > self.config.min_accuracy_threshold {
            return Some(ControllerState::Converged(StopReason::AccuracyThreshold));
        }
        if iteration > 0
            && evaluation.accuracy - previous_accuracy < self.config.min_improvement_delta
        {
            return Some(ControllerState::Converged(StopReason::Plateau));
        }
        if !evaluation.has_failures() {
            return Some(ControllerState::Converged(StopReason::NoFailures));
        }
        // Another program would never be evaluated
        if iteration + 1 >= self.config.max_iterations {
            return Some(ControllerState::Terminated(StopReason::MaxIterations));
        }
        None
    }

    async fn request_feedback(
        &self,
        program: &SourceProgram,
        evaluation: &Evaluation,
        ctx: &mut RunContext,
    ) -> Result<Option<String>, RunError> {
        let request = FeedbackRequest {
            source: program.source.clone(),
            failures: evaluation.failures.clone(),
            kind_counts: evaluation.kind_counts.clone(),
            prompt: self.prompts.feedback(
                program.as_str(),
                &evaluation.kind_counts,
                &evaluation.failures,
            )?,
            model: self.config.models.feedback().to_string(),
        };
        let reply = self.ask(ctx, self.feedback.critique(&request)).await?;
        debug!(received = reply.is_some(), "feedback requested");
        Ok(reply.map(|r| r.text))
    }

    /// Await an oracle call unless the run is cancelled first; token usage is
    /// recorded on success.
    async fn ask<F>(&self, ctx: &mut RunContext, call: F) -> Result<Option<OracleReply>, RunError>
    where
        F: Future<Output = Result<OracleReply, refinery_common::error::OracleError>>,
    {
        let reply = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Ok(None),
            reply = call => reply?,
        };
        ctx.metrics.add_tokens(reply.prompt_tokens, reply.completion_tokens);
        Ok(Some(reply))
    }

    fn stop(&mut self, state: ControllerState) -> StopReason {
        self.state = state;
        let reason = match state {
            ControllerState::Converged(reason) | ControllerState::Terminated(reason) => reason,
            _ => StopReason::Cancelled,
        };
        match reason {
            StopReason::Cancelled => warn!(iterations = self.history.len(), "refinement cancelled"),
            _ => info!(
                iterations = self.history.len(),
                reason = %reason,
                best_accuracy = self.best.as_ref().map(|b| b.accuracy),
                "refinement stopped"
            ),
        }
        reason
    }
}
