use crate::engine::SandboxEngine;
use futures_util::stream::{self, StreamExt};
use refinery_common::config::SandboxConfig;
use refinery_common::types::{BatchReport, Record, RecordOutcome, SourceProgram};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Fans one program out over many records with bounded concurrency.
///
/// Outcomes are joined before aggregation, so counters are computed once
/// from the complete set and the report is ordered by record index.
#[derive(Debug, Clone)]
pub struct BatchRunner {
    engine: SandboxEngine,
    max_workers: usize,
    timeout: Duration,
}

impl BatchRunner {
    pub fn new(engine: SandboxEngine, config: &SandboxConfig) -> Self {
        Self {
            engine,
            max_workers: config.max_workers.max(1),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    pub fn engine(&self) -> &SandboxEngine {
        &self.engine
    }

    /// Run the program over every record.
    pub async fn run(
        &self,
        program: &SourceProgram,
        records: &[Record],
        cancel: &CancellationToken,
    ) -> BatchReport {
        let indices: Vec<usize> = (0..records.len()).collect();
        self.run_indices(program, records, &indices, cancel).await
    }

    /// Run the program over the records at `indices`; outcome indices refer
    /// to positions in `records`. Out-of-range indices are skipped.
    #[tracing::instrument(skip_all, fields(iteration = program.iteration, records = indices.len()))]
    pub async fn run_indices(
        &self,
        program: &SourceProgram,
        records: &[Record],
        indices: &[usize],
        cancel: &CancellationToken,
    ) -> BatchReport {
        if indices.is_empty() {
            return BatchReport::empty();
        }

        let workers = self.max_workers.min(indices.len());
        debug!(workers, timeout_ms = self.timeout.as_millis() as u64, "starting batch");

        let outcomes: Vec<RecordOutcome> = stream::iter(
            indices
                .iter()
                .copied()
                .filter_map(|index| records.get(index).map(|record| (index, record))),
        )
        .map(|(index, record)| async move {
            let result = self
                .engine
                .execute(program.as_str(), record, self.timeout, cancel)
                .await;
            if let Some(error) = &result.error {
                debug!(index, kind = %error.kind, duration_ms = result.duration_ms, "record failed");
            }
            RecordOutcome {
                index,
                input: record.clone(),
                result,
            }
        })
        .buffered(workers)
        .collect()
        .await;

        let report = BatchReport::from_outcomes(outcomes);
        info!(
            total = report.total,
            success = report.success_count,
            failed = report.failure_count,
            success_rate = %report.success_rate,
            "batch complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refinery_common::error::SandboxErrorKind;
    use serde_json::json;

    fn runner(max_workers: usize) -> BatchRunner {
        let config = SandboxConfig {
            max_workers,
            timeout_ms: 2000,
            ..SandboxConfig::default()
        };
        BatchRunner::new(SandboxEngine::new(&config), &config)
    }

    fn records(n: usize) -> Vec<Record> {
        (0..n).map(|i| json!({"id": i})).collect()
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let program = SourceProgram::new(0, "function generate_instruction(r) { return r; }");
        let report = runner(4).run(&program, &[], &CancellationToken::new()).await;
        assert_eq!(report, BatchReport::empty());
    }

    #[tokio::test]
    async fn test_counts_and_order() {
        let program = SourceProgram::new(
            0,
            r#"function generate_instruction(r) {
                if (r.id % 3 === 0) { throw new Error("divisible by three"); }
                return { id: r.id };
            }"#,
        );
        let report = runner(3).run(&program, &records(10), &CancellationToken::new()).await;

        assert_eq!(report.total, 10);
        assert_eq!(report.failure_count, 4); // 0, 3, 6, 9
        assert_eq!(report.success_count, 6);
        assert_eq!(report.success_rate, "60.00%");
        assert_eq!(
            report.outcomes.iter().map(|o| o.index).collect::<Vec<_>>(),
            (0..10).collect::<Vec<_>>()
        );
        assert!(report
            .failures()
            .all(|o| o.result.error_kind() == Some(SandboxErrorKind::Runtime)));
    }

    #[tokio::test]
    async fn test_concurrency_does_not_change_results() {
        let program = SourceProgram::new(0, "function generate_instruction(r) { return { double: r.id * 2 }; }");
        let data = records(12);

        let serial = runner(1).run(&program, &data, &CancellationToken::new()).await;
        let parallel = runner(6).run(&program, &data, &CancellationToken::new()).await;

        assert_eq!(serial.total, parallel.total);
        assert_eq!(serial.success_count, parallel.success_count);
        for (a, b) in serial.outcomes.iter().zip(parallel.outcomes.iter()) {
            assert_eq!(a.index, b.index);
            assert!(a.result.same_outcome(&b.result));
        }
    }

    #[tokio::test]
    async fn test_invalid_records_do_not_abort_batch() {
        let program = SourceProgram::new(0, "function generate_instruction(r) { return r; }");
        let data = vec![json!({"id": 0}), json!("not a record"), json!({"id": 2})];

        let report = runner(2).run(&program, &data, &CancellationToken::new()).await;

        assert_eq!(report.total, 3);
        assert_eq!(report.success_count, 2);
        assert_eq!(
            report.outcomes[1].result.error_kind(),
            Some(SandboxErrorKind::InvalidRecord)
        );
    }

    #[tokio::test]
    async fn test_subset_keeps_dataset_indices() {
        let program = SourceProgram::new(0, "function generate_instruction(r) { return r; }");
        let data = records(10);

        let report = runner(2)
            .run_indices(&program, &data, &[7, 2, 42], &CancellationToken::new())
            .await;

        assert_eq!(report.total, 2);
        assert_eq!(report.outcomes[0].index, 2);
        assert_eq!(report.outcomes[1].index, 7);
        assert_eq!(report.outcomes[1].input, json!({"id": 7}));
    }

    #[tokio::test]
    async fn test_cancelled_batch_reports_every_record() {
        let program = SourceProgram::new(0, "function generate_instruction(r) { return r; }");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = runner(4).run(&program, &records(5), &cancel).await;

        assert_eq!(report.total, 5);
        assert_eq!(report.failure_count, 5);
        assert!(report
            .failures()
            .all(|o| o.result.error_kind() == Some(SandboxErrorKind::Cancelled)));
    }
}
