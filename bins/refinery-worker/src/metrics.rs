use chrono::Utc;
use refinery_common::config::RunConfig;
use refinery_common::types::IterationRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const STEP_DATA_CLEANING: &str = "data_cleaning";
pub const STEP_SEED_GENERATION: &str = "seed_generation";
pub const STEP_INITIAL_CODE_GENERATION: &str = "initial_code_generation";
pub const STEP_CODE_OPTIMIZATION: &str = "code_optimization";
pub const STEP_FINAL_PROCESSING: &str = "final_processing";

/// Passive accumulator for one run's timings, token usage and iterations.
///
/// Single writer: the controller (and the pipeline around it). Safe to
/// render mid-run; steps that were started but not ended are left out.
#[derive(Debug)]
pub struct MetricsCollector {
    start: Instant,
    running: HashMap<String, Instant>,
    completed: Vec<(String, Duration)>,
    prompt_tokens: u64,
    completion_tokens: u64,
    iterations: Vec<IterationRecord>,
    final_accuracy: f64,
    settings: Option<ExperimentSettings>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            running: HashMap::new(),
            completed: Vec::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
            iterations: Vec::new(),
            final_accuracy: 0.0,
            settings: None,
        }
    }

    pub fn set_settings(&mut self, config: &RunConfig) {
        self.settings = Some(ExperimentSettings::from_config(config));
    }

    pub fn start_step(&mut self, name: &str) {
        self.running.insert(name.to_string(), Instant::now());
    }

    /// Returns the elapsed time, or zero for a step that was never started.
    pub fn end_step(&mut self, name: &str) -> Duration {
        match self.running.remove(name) {
            Some(started) => {
                let elapsed = started.elapsed();
                self.completed.push((name.to_string(), elapsed));
                elapsed
            }
            None => Duration::ZERO,
        }
    }

    pub fn add_tokens(&mut self, prompt: u64, completion: u64) {
        self.prompt_tokens += prompt;
        self.completion_tokens += completion;
    }

    pub fn add_iteration(&mut self, record: IterationRecord) {
        self.iterations.push(record);
    }

    pub fn set_final_accuracy(&mut self, accuracy: f64) {
        self.final_accuracy = accuracy;
    }

    pub fn iterations(&self) -> &[IterationRecord] {
        &self.iterations
    }

    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn report(&self) -> MetricsReport {
        let step_times = self
            .completed
            .iter()
            .map(|(step, elapsed)| StepTiming {
                step: step.clone(),
                elapsed: format_seconds(*elapsed),
            })
            .collect();

        MetricsReport {
            experiment_config: self.settings.clone(),
            execution_metrics: ExecutionMetrics {
                total_time: format_seconds(self.start.elapsed()),
                step_times,
            },
            token_metrics: TokenMetrics {
                prompt: self.prompt_tokens,
                completion: self.completion_tokens,
                total: self.total_tokens(),
            },
            iteration_metrics: self.iteration_metrics(),
        }
    }

    fn iteration_metrics(&self) -> IterationMetrics {
        let accuracies: Vec<f64> = self.iterations.iter().map(|r| r.accuracy).collect();
        let summary = accuracies.first().map(|&initial| {
            let best = accuracies.iter().copied().fold(f64::MIN, f64::max);
            let average = accuracies.iter().sum::<f64>() / accuracies.len() as f64;
            AccuracySummary {
                initial_accuracy: format!("{:.4}", initial),
                best_accuracy: format!("{:.4}", best),
                average_accuracy: format!("{:.4}", average),
                accuracy_improvement: relative_improvement(initial, self.final_accuracy),
            }
        });

        IterationMetrics {
            total_iterations: self.iterations.len(),
            iterations: self.iterations.clone(),
            final_accuracy: format!("{:.4}", self.final_accuracy),
            summary,
        }
    }
}

fn format_seconds(elapsed: Duration) -> String {
    format!("{:.2}s", elapsed.as_secs_f64())
}

/// Relative change from `initial` to `final_accuracy`, "+0.00%" when the
/// initial accuracy is zero.
pub fn relative_improvement(initial: f64, final_accuracy: f64) -> String {
    let improvement = if initial > 0.0 {
        (final_accuracy - initial) / initial * 100.0
    } else {
        0.0
    };
    format!("{:+.2}%", improvement)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSettings {
    pub model_codegen: String,
    pub model_datagen: String,
    pub model_feedback: String,
    pub max_iterations: u32,
    pub target_accuracy: f64,
    pub min_improvement_delta: f64,
    pub test_sample_ratio: f64,
    pub max_workers: usize,
    pub data_path: String,
    pub output_dir: String,
    pub timestamp: String,
}

impl ExperimentSettings {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            model_codegen: config.models.codegen.clone(),
            model_datagen: config.models.datagen.clone(),
            model_feedback: config.models.feedback().to_string(),
            max_iterations: config.max_iterations,
            target_accuracy: config.min_accuracy_threshold,
            min_improvement_delta: config.min_improvement_delta,
            test_sample_ratio: config.test_sample_ratio,
            max_workers: config.sandbox.max_workers,
            data_path: config.dataset_path.display().to_string(),
            output_dir: config.output_dir.display().to_string(),
            timestamp: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTiming {
    pub step: String,
    pub elapsed: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub total_time: String,
    pub step_times: Vec<StepTiming>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenMetrics {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccuracySummary {
    pub initial_accuracy: String,
    pub best_accuracy: String,
    pub average_accuracy: String,
    pub accuracy_improvement: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationMetrics {
    pub total_iterations: usize,
    pub iterations: Vec<IterationRecord>,
    pub final_accuracy: String,
    #[serde(flatten, default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<AccuracySummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub experiment_config: Option<ExperimentSettings>,
    pub execution_metrics: ExecutionMetrics,
    pub token_metrics: TokenMetrics,
    pub iteration_metrics: IterationMetrics,
}
