// CLI commands for Refinery
use anyhow::{bail, Context, Result};
use handlebars::Handlebars;
use refinery_common::artifacts::{RunArtifacts, RunSummary, METRICS_FILE, RUN_SUMMARY_FILE};
use refinery_common::config::{RunConfig, DEFAULT_CONFIG_PATH};
use refinery_common::types::{format_rate, Record, SourceProgram};
use refinery_worker::batch::BatchRunner;
use refinery_worker::config::load_or_default;
use refinery_worker::engine::SandboxEngine;
use refinery_worker::evaluator::{sample_size, Evaluator};
use refinery_worker::executor::load_dataset;
use refinery_worker::metrics::MetricsReport;
use refinery_worker::prompts::{extract_code_block, format_failure_cases};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

const REPORT_TEMPLATE: &str = r#"📈 Run report: {{dir}}
{{#if has_summary}}
  Run id:          {{run_id}}
  Stop reason:     {{stop_reason}}
  Best iteration:  {{best_iteration}}
  Best accuracy:   {{best_accuracy}}
  Final pass:      {{final_success_rate}}
{{#if error}}
  ❌ Error:        {{error}}
{{/if}}
{{/if}}

⏱️  Total time: {{total_time}}
{{#each steps}}
  {{step}}: {{elapsed}}
{{/each}}

🪙 Tokens: {{prompt_tokens}} prompt + {{completion_tokens}} completion = {{total_tokens}}

🔁 Iterations: {{total_iterations}} (final accuracy {{final_accuracy}}, improvement {{improvement}})
{{#each iterations}}
  #{{iteration}}  accuracy {{accuracy}}  failed {{failed_cases}}
{{/each}}"#;

/// Initialize a project directory with the default run configuration
pub fn init_project(path: &Path, force: bool) -> Result<()> {
    println!("🚀 Initializing Refinery project at: {}", path.display());

    for dir in ["config", "data", "output"] {
        fs::create_dir_all(path.join(dir))
            .with_context(|| format!("Failed to create directory: {}", dir))?;
        println!("  ✅ Created: {}", dir);
    }

    let config_path = path.join(DEFAULT_CONFIG_PATH);
    if config_path.exists() && !force {
        println!("  ⏭️  Kept existing: {}", DEFAULT_CONFIG_PATH);
    } else {
        let json_content = serde_json::to_string_pretty(&RunConfig::default())
            .context("Failed to serialize run configuration")?;
        fs::write(&config_path, json_content)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        println!("  ✅ Created: {}", DEFAULT_CONFIG_PATH);
    }

    println!("✅ Project initialized successfully!");
    println!("\n📋 Next steps:");
    println!("  1. Put the records to learn from in data/dataset.json");
    println!("  2. Point endpoints.generation_url at the analysis service");
    println!("  3. Check the setup: refinery-cli check");
    println!("  4. Start a run: refinery-worker");

    Ok(())
}

fn load_config(config_path: &Path, dataset: Option<PathBuf>) -> Result<RunConfig> {
    let required = config_path != Path::new(DEFAULT_CONFIG_PATH);
    let mut config = load_or_default(config_path, required)?;
    if let Some(dataset) = dataset {
        config.dataset_path = dataset;
    }
    config.validate().context("Invalid run configuration")?;
    Ok(config)
}

/// Validate configuration and summarize the dataset labels
pub async fn check(config_path: &Path, dataset: Option<PathBuf>) -> Result<()> {
    println!("🔍 Checking configuration: {}", config_path.display());

    let config = load_config(config_path, dataset)?;
    println!("  ✅ Thresholds and limits are valid");
    println!(
        "     max_iterations={} threshold={} delta={} ratio={}",
        config.max_iterations,
        config.min_accuracy_threshold,
        config.min_improvement_delta,
        config.test_sample_ratio
    );

    config
        .validate_paths()
        .context("Dataset check failed")?;
    let records = load_dataset(&config.dataset_path)
        .await
        .with_context(|| format!("Failed to load {}", config.dataset_path.display()))?;
    println!(
        "  ✅ Dataset: {} records ({} sampled per iteration)",
        records.len(),
        sample_size(records.len(), config.test_sample_ratio)
    );

    let evaluator = Evaluator::new(&config);
    let (labels, unlabelled) = label_distribution(&records, &evaluator);
    if unlabelled > 0 {
        println!(
            "  ⚠️  {} records have no '{}' label and will always count as failures",
            unlabelled, config.evaluation.ground_truth_field
        );
    }
    println!("\n🏷️  Labels:");
    for (label, count) in &labels {
        println!("  {:<24} {}", label, count);
    }

    println!("\n✅ Ready to run");
    Ok(())
}

/// Ground-truth label counts, plus the number of records without one.
pub fn label_distribution(records: &[Record], evaluator: &Evaluator) -> (BTreeMap<String, usize>, usize) {
    let mut labels = BTreeMap::new();
    let mut unlabelled = 0;
    for record in records {
        match evaluator.ground_truth(record) {
            Some(label) => *labels.entry(label).or_insert(0) += 1,
            None => unlabelled += 1,
        }
    }
    (labels, unlabelled)
}

pub struct ExecOptions {
    pub timeout_ms: Option<u64>,
    pub workers: Option<usize>,
    pub show_failures: usize,
    pub output: Option<PathBuf>,
}

/// Run one program file over the dataset and print its score
pub async fn exec_program(
    program_path: &Path,
    config_path: &Path,
    dataset: Option<PathBuf>,
    options: ExecOptions,
) -> Result<()> {
    let mut config = load_config(config_path, dataset)?;
    if let Some(timeout_ms) = options.timeout_ms {
        config.sandbox.timeout_ms = timeout_ms;
    }
    if let Some(workers) = options.workers {
        config.sandbox.max_workers = workers;
    }
    config.max_failures_tracked = options.show_failures.max(1);
    config.validate().context("Invalid overrides")?;

    let text = fs::read_to_string(program_path)
        .with_context(|| format!("Failed to read {}", program_path.display()))?;
    let source = extract_code_block(&text);
    if source.is_empty() {
        bail!("Program file {} is empty", program_path.display());
    }

    let records = load_dataset(&config.dataset_path)
        .await
        .with_context(|| format!("Failed to load {}", config.dataset_path.display()))?;

    println!(
        "▶️  Running {} over {} records ({} workers, {}ms timeout)",
        program_path.display(),
        records.len(),
        config.sandbox.max_workers,
        config.sandbox.timeout_ms
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let runner = BatchRunner::new(SandboxEngine::new(&config.sandbox), &config.sandbox);
    let report = runner
        .run(&SourceProgram::new(0, source), &records, &cancel)
        .await;
    let evaluation = Evaluator::new(&config).score(&report);

    println!("\n📊 Batch results:");
    println!("  Total:        {}", report.total);
    println!("  Succeeded:    {}", report.success_count);
    println!("  Failed:       {}", report.failure_count);
    println!("  Success rate: {}", report.success_rate);
    println!(
        "  Accuracy:     {} ({}/{})",
        format_rate(evaluation.correct, evaluation.evaluated),
        evaluation.correct,
        evaluation.evaluated
    );
    for (kind, count) in &evaluation.kind_counts {
        println!("  {}: {}", kind, count);
    }

    if options.show_failures > 0 && !evaluation.failures.is_empty() {
        println!("\n❌ First failures:");
        println!("{}", format_failure_cases(&evaluation.failures));
    }

    if let Some(output) = &options.output {
        let body = serde_json::to_string_pretty(&report).context("Failed to serialize report")?;
        fs::write(output, body).with_context(|| format!("Failed to write {}", output.display()))?;
        println!("💾 Report written to {}", output.display());
    }

    if cancel.is_cancelled() {
        println!("⚠️  Interrupted; results are partial");
    }
    Ok(())
}

#[derive(Serialize)]
struct StepView {
    step: String,
    elapsed: String,
}

#[derive(Serialize)]
struct IterationView {
    iteration: u32,
    accuracy: String,
    failed_cases: usize,
}

#[derive(Serialize)]
struct ReportView {
    dir: String,
    has_summary: bool,
    run_id: String,
    stop_reason: String,
    best_iteration: String,
    best_accuracy: String,
    final_success_rate: String,
    error: String,
    total_time: String,
    steps: Vec<StepView>,
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
    total_iterations: usize,
    final_accuracy: String,
    improvement: String,
    iterations: Vec<IterationView>,
}

/// Render a persisted metrics report (and summary, when present) as text.
pub fn render_report(dir: &Path, metrics: &MetricsReport, summary: Option<&RunSummary>) -> Result<String> {
    let dash = || "-".to_string();
    let view = ReportView {
        dir: dir.display().to_string(),
        has_summary: summary.is_some(),
        run_id: summary.map(|s| s.run_id.to_string()).unwrap_or_else(dash),
        stop_reason: summary.and_then(|s| s.stop_reason.clone()).unwrap_or_else(dash),
        best_iteration: summary
            .and_then(|s| s.best_iteration)
            .map(|i| i.to_string())
            .unwrap_or_else(dash),
        best_accuracy: summary
            .and_then(|s| s.best_accuracy)
            .map(|a| format!("{:.4}", a))
            .unwrap_or_else(dash),
        final_success_rate: summary
            .and_then(|s| s.final_success_rate.clone())
            .unwrap_or_else(dash),
        error: summary.and_then(|s| s.error.clone()).unwrap_or_default(),
        total_time: metrics.execution_metrics.total_time.clone(),
        steps: metrics
            .execution_metrics
            .step_times
            .iter()
            .map(|s| StepView {
                step: s.step.clone(),
                elapsed: s.elapsed.clone(),
            })
            .collect(),
        prompt_tokens: metrics.token_metrics.prompt,
        completion_tokens: metrics.token_metrics.completion,
        total_tokens: metrics.token_metrics.total,
        total_iterations: metrics.iteration_metrics.total_iterations,
        final_accuracy: metrics.iteration_metrics.final_accuracy.clone(),
        improvement: metrics
            .iteration_metrics
            .summary
            .as_ref()
            .map(|s| s.accuracy_improvement.clone())
            .unwrap_or_else(dash),
        iterations: metrics
            .iteration_metrics
            .iterations
            .iter()
            .map(|r| IterationView {
                iteration: r.iteration,
                accuracy: format!("{:.4}", r.accuracy),
                failed_cases: r.failed_cases,
            })
            .collect(),
    };

    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    handlebars.register_escape_fn(handlebars::no_escape);
    handlebars
        .register_template_string("report", REPORT_TEMPLATE)
        .context("Failed to register report template")?;
    handlebars
        .render("report", &view)
        .context("Failed to render report")
}

/// Print the report of a finished run directory
pub fn print_report(dir: &Path) -> Result<()> {
    let artifacts = RunArtifacts::open(dir);
    let metrics: MetricsReport = artifacts
        .read_json(METRICS_FILE)
        .with_context(|| format!("No {} in {}", METRICS_FILE, dir.display()))?;
    let summary: Option<RunSummary> = artifacts.read_json(RUN_SUMMARY_FILE).ok();

    println!("{}", render_report(dir, &metrics, summary.as_ref())?);
    Ok(())
}
