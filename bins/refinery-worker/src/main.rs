use chrono::Utc;
use refinery_common::artifacts::RunArtifacts;
use refinery_worker::config::load_run_config;
use refinery_worker::executor::execute_run;
use refinery_worker::oracle::Oracles;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Refinery Worker booting...");

    let config = load_run_config().map_err(|e| {
        error!("Failed to load run configuration: {:#}", e);
        e
    })?;

    info!(
        dataset = %config.dataset_path.display(),
        generation_url = %config.endpoints.generation_url,
        codegen_model = %config.models.codegen,
        workers = config.sandbox.max_workers,
        "Worker configured"
    );

    let oracles = Oracles::from_config(&config)?;

    // Ctrl-C stops the run between iterations; best-so-far is still persisted
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Received shutdown signal, stopping refinement...");
            on_signal.cancel();
        }
    });

    let started_at = Utc::now();
    let outcome = execute_run(&config, &oracles, cancel).await.map_err(|e| {
        error!(error = %e, "Run aborted");
        e
    })?;

    let artifacts = RunArtifacts::create(&config.output_dir, started_at)?;
    let written = outcome.persist(&artifacts)?;
    info!(
        dir = %artifacts.dir().display(),
        files = written.len(),
        "Artifacts persisted"
    );

    match (&outcome.best, outcome.stop_reason) {
        (Some(best), reason) => info!(
            best_iteration = best.program.iteration,
            best_accuracy = best.accuracy,
            stop_reason = ?reason,
            "Run finished"
        ),
        (None, reason) => warn!(stop_reason = ?reason, "Run finished without a candidate"),
    }

    if let Some(message) = &outcome.error {
        error!(error = %message, "Run ended with a terminal failure");
        std::process::exit(1);
    }

    info!("Worker shutdown complete");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .init();
    }
}
