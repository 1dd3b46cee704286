/// Accuracy Evaluator - Label Comparison and Failure Collection
///
/// **Core Responsibility:**
/// Turn a `BatchReport` into an accuracy figure and a bounded list of
/// failure cases for the feedback oracle.
///
/// **Critical Properties:**
/// - Knows nothing about the sandbox runtime
/// - Knows nothing about oracles or HTTP
/// - Pure function: (batch report, field names, comparator) → evaluation
///
/// **Scoring Rules:**
/// - accuracy = correct / evaluated, 0 when nothing was evaluated
/// - Every sampled record counts, including execution and format failures
/// - `failed_count` counts every incorrect record
/// - `failures` keeps only the first `max_failures_tracked` in index order
///
/// **Prediction Extraction:**
/// - `classification_field` at the top level of the output record, or
/// - inside `output_field`, given as an object or a string holding JSON
/// - a string output (fallback mode) is parsed as JSON and searched the same way
use rand::rngs::StdRng;
use rand::{seq::index, SeedableRng};
use refinery_common::config::{EvaluationConfig, LabelPolicy, RunConfig};
use refinery_common::types::{BatchReport, FailureCase, FailureKind, Record, RecordOutcome};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Decides whether a predicted label counts as correct.
pub trait LabelComparator: Send + Sync {
    fn matches(&self, expected: &str, predicted: &str) -> bool;
}

/// Labels must be byte-for-byte identical.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatch;

impl LabelComparator for ExactMatch {
    fn matches(&self, expected: &str, predicted: &str) -> bool {
        expected == predicted
    }
}

/// Labels match when equal or when any configured token occurs in both.
///
/// **Known Limitation:**
/// Two different labels sharing a broad token (e.g. "A相" inside both
/// "A相接地" and "A相短路") count as a match, so accuracy is overstated
/// for multi-part labels. Use `ExactMatch` when that matters.
#[derive(Debug, Clone)]
pub struct SharedTokenMatch {
    tokens: Vec<String>,
}

impl SharedTokenMatch {
    pub fn new(tokens: Vec<String>) -> Self {
        Self { tokens }
    }
}

impl LabelComparator for SharedTokenMatch {
    fn matches(&self, expected: &str, predicted: &str) -> bool {
        if expected == predicted {
            return true;
        }
        self.tokens
            .iter()
            .any(|token| expected.contains(token.as_str()) && predicted.contains(token.as_str()))
    }
}

pub fn comparator_for(config: &EvaluationConfig) -> Box<dyn LabelComparator> {
    match config.label_policy {
        LabelPolicy::Exact => Box::new(ExactMatch),
        LabelPolicy::SharedToken => Box::new(SharedTokenMatch::new(config.label_tokens.clone())),
    }
}

/// Number of records drawn for one evaluation: floor(ratio * n), at least one
/// when the dataset is non-empty.
pub fn sample_size(total: usize, ratio: f64) -> usize {
    if total == 0 {
        return 0;
    }
    let size = (ratio * total as f64).floor() as usize;
    size.clamp(1, total)
}

/// Draw a sorted sample of dataset indices without replacement.
pub fn sample_indices(total: usize, ratio: f64, rng: &mut StdRng) -> Vec<usize> {
    let size = sample_size(total, ratio);
    if size == total {
        return (0..total).collect();
    }
    let mut picked = index::sample(rng, total, size).into_vec();
    picked.sort_unstable();
    picked
}

pub fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Records sharing one ground-truth label, shown to the code generator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelExamples {
    pub label: String,
    pub records: Vec<Record>,
}

/// Outcome of scoring one batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub accuracy: f64,
    pub evaluated: usize,
    pub correct: usize,
    pub failed_count: usize,
    pub kind_counts: BTreeMap<FailureKind, usize>,
    pub failures: Vec<FailureCase>,
}

impl Evaluation {
    pub fn has_failures(&self) -> bool {
        self.failed_count > 0
    }
}

pub struct Evaluator {
    fields: EvaluationConfig,
    comparator: Box<dyn LabelComparator>,
    max_failures_tracked: usize,
}

impl Evaluator {
    pub fn new(config: &RunConfig) -> Self {
        Self {
            fields: config.evaluation.clone(),
            comparator: comparator_for(&config.evaluation),
            max_failures_tracked: config.max_failures_tracked,
        }
    }

    /// Up to `per_label` random records for every ground-truth label, labels
    /// in sorted order. Records without a label are skipped.
    pub fn few_shot_examples(
        &self,
        dataset: &[Record],
        per_label: usize,
        rng: &mut StdRng,
    ) -> Vec<LabelExamples> {
        if per_label == 0 {
            return Vec::new();
        }
        let mut by_label: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, record) in dataset.iter().enumerate() {
            if let Some(label) = self.ground_truth(record) {
                by_label.entry(label).or_default().push(i);
            }
        }

        by_label
            .into_iter()
            .map(|(label, members)| {
                let take = per_label.min(members.len());
                let mut picked: Vec<usize> = index::sample(rng, members.len(), take)
                    .into_iter()
                    .map(|k| members[k])
                    .collect();
                picked.sort_unstable();
                LabelExamples {
                    label,
                    records: picked.into_iter().map(|i| dataset[i].clone()).collect(),
                }
            })
            .collect()
    }

    pub fn with_comparator(
        fields: EvaluationConfig,
        comparator: Box<dyn LabelComparator>,
        max_failures_tracked: usize,
    ) -> Self {
        Self {
            fields,
            comparator,
            max_failures_tracked,
        }
    }

    /// Ground-truth label of an input record, rendered as text.
    pub fn ground_truth(&self, input: &Record) -> Option<String> {
        input.get(&self.fields.ground_truth_field).and_then(label_text)
    }

    /// Predicted label of an output record.
    pub fn extract_classification(&self, output: &Record) -> Option<String> {
        match output {
            Value::Object(_) => self.classification_in(output),
            Value::String(text) => serde_json::from_str::<Value>(text)
                .ok()
                .filter(Value::is_object)
                .and_then(|parsed| self.classification_in(&parsed)),
            _ => None,
        }
    }

    fn classification_in(&self, record: &Value) -> Option<String> {
        if let Some(label) = record.get(&self.fields.classification_field).and_then(label_text) {
            return Some(label);
        }
        let nested = record.get(self.fields.output_field.as_deref()?)?;
        match nested {
            Value::Object(_) => nested.get(&self.fields.classification_field).and_then(label_text),
            Value::String(text) => serde_json::from_str::<Value>(text)
                .ok()?
                .get(&self.fields.classification_field)
                .and_then(label_text),
            _ => None,
        }
    }

    /// Whether a successful outcome's prediction matches its ground truth.
    pub fn is_correct(&self, outcome: &RecordOutcome) -> bool {
        let Some(output) = outcome.result.output.as_ref().filter(|_| outcome.result.is_success())
        else {
            return false;
        };
        match (self.ground_truth(&outcome.input), self.extract_classification(output)) {
            (Some(expected), Some(predicted)) => self.comparator.matches(&expected, &predicted),
            _ => false,
        }
    }

    /// Score every outcome in the report.
    pub fn score(&self, report: &BatchReport) -> Evaluation {
        let mut correct = 0usize;
        let mut failed_count = 0usize;
        let mut kind_counts = BTreeMap::new();
        let mut failures = Vec::new();

        for outcome in &report.outcomes {
            match self.judge(outcome) {
                None => correct += 1,
                Some(case) => {
                    failed_count += 1;
                    *kind_counts.entry(case.kind).or_insert(0) += 1;
                    if failures.len() < self.max_failures_tracked {
                        failures.push(case);
                    }
                }
            }
        }

        let evaluated = report.outcomes.len();
        let accuracy = if evaluated == 0 {
            0.0
        } else {
            correct as f64 / evaluated as f64
        };

        Evaluation {
            accuracy,
            evaluated,
            correct,
            failed_count,
            kind_counts,
            failures,
        }
    }

    /// `None` when the outcome is correct.
    fn judge(&self, outcome: &RecordOutcome) -> Option<FailureCase> {
        let expected = self.ground_truth(&outcome.input);
        let case = |kind, observed, sandbox_kind, message: String| FailureCase {
            index: outcome.index,
            input: outcome.input.clone(),
            expected: expected.clone(),
            observed,
            kind,
            sandbox_kind,
            message,
        };

        if let Some(error) = &outcome.result.error {
            return Some(case(
                FailureKind::ExecutionError,
                None,
                Some(error.kind),
                error.to_string(),
            ));
        }

        let output = outcome.result.output.clone().unwrap_or(Value::Null);
        let Some(predicted) = self.extract_classification(&output) else {
            return Some(case(
                FailureKind::FormatError,
                Some(raw_text(&output)),
                None,
                format!(
                    "output has no '{}' field",
                    self.fields.classification_field
                ),
            ));
        };

        match &expected {
            Some(label) if self.comparator.matches(label, &predicted) => None,
            Some(label) => {
                let message = format!("expected {}, actual {}", label, predicted);
                Some(case(FailureKind::PredictionError, Some(predicted), None, message))
            }
            None => {
                let message = format!(
                    "record has no '{}' label",
                    self.fields.ground_truth_field
                );
                Some(case(FailureKind::PredictionError, Some(predicted), None, message))
            }
        }
    }
}

fn label_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

fn raw_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refinery_common::error::SandboxErrorKind;
    use refinery_common::types::ExecutionResult;
    use serde_json::json;

    fn exact_evaluator(max_failures: usize) -> Evaluator {
        Evaluator::with_comparator(EvaluationConfig::default(), Box::new(ExactMatch), max_failures)
    }

    fn make_outcome(index: usize, gt: &str, output: Value) -> RecordOutcome {
        RecordOutcome {
            index,
            input: json!({"id": index, "gt": gt}),
            result: ExecutionResult::success(String::new(), output, 1),
        }
    }

    fn make_failed(index: usize, gt: &str, kind: SandboxErrorKind) -> RecordOutcome {
        RecordOutcome {
            index,
            input: json!({"id": index, "gt": gt}),
            result: ExecutionResult::failure(kind, "boom", String::new(), 1),
        }
    }

    fn labelled(label: &str) -> Value {
        json!({"input": "q", "output": {"Fault classification": label}})
    }

    #[test]
    fn test_shared_token_policy() {
        let matcher = SharedTokenMatch::new(vec!["A相".into(), "B相".into()]);
        assert!(matcher.matches("A相接地", "A相接地"));
        assert!(matcher.matches("A相接地", "A相短路"));
        assert!(!matcher.matches("A相接地", "B相接地"));
        assert!(!matcher.matches("正常", "异常"));
    }

    #[test]
    fn test_labels_compared_untrimmed() {
        assert!(ExactMatch.matches("X", "X"));
        assert!(!ExactMatch.matches(" X ", "X"));
        assert!(!ExactMatch.matches("X", "Y"));

        let matcher = SharedTokenMatch::new(vec!["A相".into()]);
        assert!(!matcher.matches("正常 ", "正常"));
        assert!(matcher.matches(" A相接地", "A相接地"));
    }

    #[test]
    fn test_few_shot_examples_cover_every_label() {
        let evaluator = Evaluator::new(&RunConfig::default());
        let dataset: Vec<Record> = (0..9)
            .map(|id| {
                let gt = ["A相", "B相", "C相"][id % 3];
                json!({"id": id, "gt": gt})
            })
            .chain(std::iter::once(json!({"id": 99})))
            .collect();
        let mut rng = seeded_rng(Some(3));

        let groups = evaluator.few_shot_examples(&dataset, 2, &mut rng);

        let labels: Vec<&str> = groups.iter().map(|g| g.label.as_str()).collect();
        assert_eq!(labels, vec!["A相", "B相", "C相"]);
        for group in &groups {
            assert_eq!(group.records.len(), 2);
            assert!(group.records.iter().all(|r| r["gt"] == json!(group.label)));
        }

        let all = evaluator.few_shot_examples(&dataset, 10, &mut rng);
        assert_eq!(all[0].records.len(), 3);
        assert!(evaluator.few_shot_examples(&dataset, 0, &mut rng).is_empty());
    }

    #[test]
    fn test_sample_size_floor_and_clamp() {
        assert_eq!(sample_size(0, 0.5), 0);
        assert_eq!(sample_size(10, 0.5), 5);
        assert_eq!(sample_size(3, 0.5), 1);
        assert_eq!(sample_size(1, 0.1), 1);
        assert_eq!(sample_size(7, 1.0), 7);
    }

    #[test]
    fn test_sample_indices_seeded() {
        let a = sample_indices(100, 0.3, &mut seeded_rng(Some(7)));
        let b = sample_indices(100, 0.3, &mut seeded_rng(Some(7)));
        assert_eq!(a, b);
        assert_eq!(a.len(), 30);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(sample_indices(5, 1.0, &mut seeded_rng(None)), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_extract_classification_locations() {
        let evaluator = exact_evaluator(3);
        assert_eq!(
            evaluator.extract_classification(&json!({"Fault classification": "X"})),
            Some("X".into())
        );
        assert_eq!(evaluator.extract_classification(&labelled("Y")), Some("Y".into()));
        assert_eq!(
            evaluator.extract_classification(&json!({"output": "{\"Fault classification\": \"Z\"}"})),
            Some("Z".into())
        );
        assert_eq!(
            evaluator.extract_classification(&json!("{\"output\": {\"Fault classification\": \"W\"}}")),
            Some("W".into())
        );
        assert_eq!(evaluator.extract_classification(&json!({"output": "plain"})), None);
        assert_eq!(evaluator.extract_classification(&json!("free text")), None);
    }

    #[test]
    fn test_score_all_correct() {
        let report = BatchReport::from_outcomes(vec![
            make_outcome(0, "X", labelled("X")),
            make_outcome(1, "Y", labelled("Y")),
        ]);
        let evaluation = exact_evaluator(3).score(&report);

        assert_eq!(evaluation.accuracy, 1.0);
        assert_eq!(evaluation.correct, 2);
        assert!(!evaluation.has_failures());
        assert!(evaluation.failures.is_empty());
    }

    #[test]
    fn test_score_classifies_failures() {
        let report = BatchReport::from_outcomes(vec![
            make_outcome(0, "X", labelled("X")),
            make_outcome(1, "X", labelled("Y")),
            make_outcome(2, "X", json!({"input": "q"})),
            make_failed(3, "X", SandboxErrorKind::Timeout),
        ]);
        let evaluation = exact_evaluator(10).score(&report);

        assert_eq!(evaluation.evaluated, 4);
        assert_eq!(evaluation.accuracy, 0.25);
        assert_eq!(evaluation.failed_count, 3);

        let kinds: Vec<FailureKind> = evaluation.failures.iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![
                FailureKind::PredictionError,
                FailureKind::FormatError,
                FailureKind::ExecutionError
            ]
        );
        assert_eq!(evaluation.failures[0].expected.as_deref(), Some("X"));
        assert_eq!(evaluation.failures[0].observed.as_deref(), Some("Y"));
        assert_eq!(evaluation.failures[2].sandbox_kind, Some(SandboxErrorKind::Timeout));
        assert_eq!(evaluation.kind_counts[&FailureKind::FormatError], 1);
    }

    #[test]
    fn test_failures_capped_but_counted() {
        let outcomes = (0..10).map(|i| make_outcome(i, "X", labelled("Y"))).collect();
        let evaluation = exact_evaluator(3).score(&BatchReport::from_outcomes(outcomes));

        assert_eq!(evaluation.failures.len(), 3);
        assert_eq!(evaluation.failed_count, 10);
        assert_eq!(
            evaluation.failures.iter().map(|f| f.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_empty_report_scores_zero() {
        let evaluation = exact_evaluator(3).score(&BatchReport::empty());
        assert_eq!(evaluation.accuracy, 0.0);
        assert_eq!(evaluation.evaluated, 0);
    }

    #[test]
    fn test_missing_ground_truth_is_incorrect() {
        let outcome = RecordOutcome {
            index: 0,
            input: json!({"id": 0}),
            result: ExecutionResult::success(String::new(), labelled("X"), 1),
        };
        let evaluator = exact_evaluator(3);
        assert!(!evaluator.is_correct(&outcome));

        let evaluation = evaluator.score(&BatchReport::from_outcomes(vec![outcome]));
        assert_eq!(evaluation.failures[0].kind, FailureKind::PredictionError);
        assert!(evaluation.failures[0].message.contains("no 'gt' label"));
    }

    #[test]
    fn test_non_string_labels_are_rendered() {
        let outcome = RecordOutcome {
            index: 0,
            input: json!({"gt": 3}),
            result: ExecutionResult::success(String::new(), json!({"Fault classification": 3}), 1),
        };
        assert!(exact_evaluator(3).is_correct(&outcome));
    }
}
