//! Prompt templates for the generation and feedback oracles.

use handlebars::Handlebars;
use lazy_static::lazy_static;
use refinery_common::error::RunError;
use refinery_common::types::{FailureCase, FailureKind, Record};
use regex::Regex;
use serde_json::json;
use std::collections::BTreeMap;

use crate::engine::{ENTRY_POINT, INPUT_SYMBOL};
use crate::evaluator::LabelExamples;

const SEED_SYSTEM: &str = "seed_system";
const CODEGEN_SYSTEM: &str = "codegen_system";
const CODEGEN: &str = "codegen";
const FEEDBACK: &str = "feedback";
const IMPROVEMENT: &str = "improvement";

const SEED_SYSTEM_TEMPLATE: &str = r#"You turn one structured JSON record into a training example with exactly two fields, "input" and "output".
"input" is a natural-language question built from the record's values.
"output" is a JSON object that contains a "{{classification_field}}" field with the record's classification, plus a short analysis.
Return only the JSON example, nothing else."#;

const CODEGEN_SYSTEM_TEMPLATE: &str = r#"You are an expert JavaScript programmer. You write a single function that converts structured records into instruction-format training examples.
Reply with code only."#;

const CODEGEN_TEMPLATE: &str = r#"Write a JavaScript function that turns records like the one below into instruction-format data with two fields, "input" and "output".

### Steps:
1. Validate that the record contains every field you rely on. Throw an Error naming the field when one is missing.
2. Extract the values you need into local variables.
3. Build the "input" text from the extracted values.
4. Analyse the values numerically to decide the classification.
5. Build "output" as an object with a "{{classification_field}}" field holding the classification.
6. Never read the "{{ground_truth_field}}" field of the record. The classification must be inferred by the code.

### Input record (JSON):
{{record}}

### Expected instruction format:
{{example}}
{{#if few_shot}}

### Records of every class:
{{#each few_shot}}
#### {{this.label}}
{{this.records}}
{{/each}}
{{/if}}

### Output code format:
```javascript
function {{entry_point}}({{input_symbol}}) {
  // validation and analysis
  const output_data = {
    input: input_value,
    output: output_value,
  };
  return output_data;
}
```

### Rules:
- Define exactly one top-level function named {{entry_point}} taking one argument, {{input_symbol}}.
- Return a plain object. Do not print it.
- No import, require, network, file or timer access. Only the built-in JSON, Math, String, Number, Array, Object, Date, Map, Set and RegExp are available.
- Return only the code, with no explanation or usage example."#;

const FEEDBACK_TEMPLATE: &str = r#"You are an expert in JavaScript and code review. Analyse why the following function misclassifies records.

Current code:
```javascript
{{source}}
```

Failure statistics:
{{statistics}}

Typical failure cases:
{{cases}}

Please answer in three steps:
1. Error pattern analysis: identify the main problem patterns and the likely cause of each error type.
2. Improvement suggestions: give concrete code changes and the expected effect of each.
3. Robustness: suggest input validation and error handling improvements, with code examples."#;

const IMPROVEMENT_TEMPLATE: &str = r#"You are a JavaScript code optimisation expert. Produce an improved version of the code below.

1. Current code:
```javascript
{{source}}
```

2. Review feedback:
{{feedback}}

3. Failure summary:
{{summary}}

Requirements:
1. Handle every error type listed above.
2. Keep a single top-level function named {{entry_point}} taking one argument, {{input_symbol}}, returning a plain object.
3. Keep the code readable.
4. Return only the complete code, without explanation."#;

lazy_static! {
    static ref CODE_FENCE: Regex =
        Regex::new(r"(?s)```[ \t]*(?:javascript|js|JavaScript|JS)?[ \t]*\r?\n(.*?)```").unwrap();
}

/// Handlebars registry holding every prompt, rendered in strict mode
/// without HTML escaping.
pub struct PromptRenderer {
    registry: Handlebars<'static>,
    classification_field: String,
    ground_truth_field: String,
}

impl PromptRenderer {
    pub fn new(classification_field: &str, ground_truth_field: &str) -> Result<Self, RunError> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);

        for (name, template) in [
            (SEED_SYSTEM, SEED_SYSTEM_TEMPLATE),
            (CODEGEN_SYSTEM, CODEGEN_SYSTEM_TEMPLATE),
            (CODEGEN, CODEGEN_TEMPLATE),
            (FEEDBACK, FEEDBACK_TEMPLATE),
            (IMPROVEMENT, IMPROVEMENT_TEMPLATE),
        ] {
            registry
                .register_template_string(name, template)
                .map_err(|e| RunError::Prompt(format!("template {}: {}", name, e)))?;
        }

        Ok(Self {
            registry,
            classification_field: classification_field.to_string(),
            ground_truth_field: ground_truth_field.to_string(),
        })
    }

    fn render(&self, name: &str, data: &serde_json::Value) -> Result<String, RunError> {
        self.registry
            .render(name, data)
            .map_err(|e| RunError::Prompt(format!("template {}: {}", name, e)))
    }

    pub fn seed_system(&self) -> Result<String, RunError> {
        self.render(
            SEED_SYSTEM,
            &json!({ "classification_field": self.classification_field }),
        )
    }

    pub fn codegen_system(&self) -> Result<String, RunError> {
        self.render(CODEGEN_SYSTEM, &json!({}))
    }

    /// Seed record plus its standardized example → code-generation prompt.
    /// `few_shot` adds one group of records per label when non-empty.
    pub fn codegen(
        &self,
        record: &Record,
        example: &str,
        few_shot: &[LabelExamples],
    ) -> Result<String, RunError> {
        let groups: Vec<_> = few_shot
            .iter()
            .map(|group| json!({ "label": group.label, "records": pretty(&json!(group.records)) }))
            .collect();
        self.render(
            CODEGEN,
            &json!({
                "record": pretty(record),
                "example": example.trim(),
                "few_shot": groups,
                "classification_field": self.classification_field,
                "ground_truth_field": self.ground_truth_field,
                "entry_point": ENTRY_POINT,
                "input_symbol": INPUT_SYMBOL,
            }),
        )
    }

    pub fn feedback(
        &self,
        source: &str,
        kind_counts: &BTreeMap<FailureKind, usize>,
        failures: &[FailureCase],
    ) -> Result<String, RunError> {
        self.render(
            FEEDBACK,
            &json!({
                "source": source.trim(),
                "statistics": pretty(&json!(kind_counts)),
                "cases": format_failure_cases(failures),
            }),
        )
    }

    pub fn improvement(
        &self,
        source: &str,
        feedback: &str,
        failures: &[FailureCase],
    ) -> Result<String, RunError> {
        let summary: Vec<_> = failures
            .iter()
            .map(|case| json!({ "error_type": case.kind, "error_message": case.message }))
            .collect();
        self.render(
            IMPROVEMENT,
            &json!({
                "source": source.trim(),
                "feedback": feedback.trim(),
                "summary": pretty(&json!(summary)),
                "entry_point": ENTRY_POINT,
                "input_symbol": INPUT_SYMBOL,
            }),
        )
    }
}

fn pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Human-readable list of failure cases for the feedback prompt.
pub fn format_failure_cases(failures: &[FailureCase]) -> String {
    let mut out = Vec::with_capacity(failures.len());
    for (n, case) in failures.iter().enumerate() {
        let mut text = format!(
            "Case {} (record {}):\nInput: {}\n",
            n + 1,
            case.index,
            pretty(&case.input)
        );
        match case.kind {
            FailureKind::PredictionError => {
                text.push_str(&format!(
                    "Expected: {}\nActual: {}\n",
                    case.expected.as_deref().unwrap_or("unknown"),
                    case.observed.as_deref().unwrap_or("none")
                ));
            }
            FailureKind::FormatError => {
                text.push_str(&format!(
                    "Format error: {}\nRaw output: {}\n",
                    case.message,
                    case.observed.as_deref().unwrap_or("none")
                ));
            }
            FailureKind::ExecutionError => {
                text.push_str(&format!("Execution error: {}\n", case.message));
                if let Some(kind) = case.sandbox_kind {
                    text.push_str(&format!("Error type: {}\n", kind));
                }
            }
        }
        out.push(text);
    }
    out.join("\n")
}

/// Pull program text out of a Markdown reply: the first fenced block, or
/// the trimmed reply when there is none.
pub fn extract_code_block(reply: &str) -> String {
    match CODE_FENCE.captures(reply).and_then(|c| c.get(1)) {
        Some(body) => body.as_str().trim().to_string(),
        None => reply.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refinery_common::error::SandboxErrorKind;

    fn renderer() -> PromptRenderer {
        PromptRenderer::new("Fault classification", "gt").unwrap()
    }

    #[test]
    fn test_extract_javascript_fence() {
        let reply = "Here you go:\n```javascript\nfunction generate_instruction(r) {\n  return r;\n}\n```\nEnjoy.";
        assert_eq!(
            extract_code_block(reply),
            "function generate_instruction(r) {\n  return r;\n}"
        );
    }

    #[test]
    fn test_extract_js_and_bare_fences() {
        assert_eq!(extract_code_block("```js\nlet a = 1;\n```"), "let a = 1;");
        assert_eq!(extract_code_block("```\nlet b = 2;\n```"), "let b = 2;");
    }

    #[test]
    fn test_extract_without_fence() {
        assert_eq!(
            extract_code_block("  function generate_instruction(r) { return r; }\n"),
            "function generate_instruction(r) { return r; }"
        );
    }

    #[test]
    fn test_first_block_wins() {
        let reply = "```js\nfirst();\n```\n\n```js\nsecond();\n```";
        assert_eq!(extract_code_block(reply), "first();");
    }

    #[test]
    fn test_codegen_prompt_is_not_escaped() {
        let prompt = renderer()
            .codegen(&json!({"line": "220kV <A>"}), "{\"input\": \"q & a\"}", &[])
            .unwrap();
        assert!(prompt.contains("220kV <A>"));
        assert!(prompt.contains("q & a"));
        assert!(prompt.contains("function generate_instruction(input_data)"));
        assert!(prompt.contains("\"gt\" field"));
        assert!(!prompt.contains("Records of every class"));
    }

    #[test]
    fn test_codegen_prompt_lists_label_groups() {
        let few_shot = vec![
            LabelExamples {
                label: "A相".into(),
                records: vec![json!({"ia": 9.5, "gt": "A相"})],
            },
            LabelExamples {
                label: "BC相".into(),
                records: vec![json!({"ib": 7.1, "gt": "BC相"})],
            },
        ];
        let prompt = renderer()
            .codegen(&json!({"ia": 1.0}), "{}", &few_shot)
            .unwrap();

        assert!(prompt.contains("### Records of every class:"));
        let a = prompt.find("#### A相").unwrap();
        let bc = prompt.find("#### BC相").unwrap();
        assert!(a < bc);
        assert!(prompt.contains("\"ib\": 7.1"));
    }

    #[test]
    fn test_feedback_prompt_lists_cases() {
        let failures = vec![
            FailureCase {
                index: 4,
                input: json!({"id": 4}),
                expected: Some("A相接地".into()),
                observed: Some("B相接地".into()),
                kind: FailureKind::PredictionError,
                sandbox_kind: None,
                message: "expected A相接地, actual B相接地".into(),
            },
            FailureCase {
                index: 9,
                input: json!({"id": 9}),
                expected: None,
                observed: None,
                kind: FailureKind::ExecutionError,
                sandbox_kind: Some(SandboxErrorKind::Timeout),
                message: "execution exceeded 5000ms".into(),
            },
        ];
        let mut counts = BTreeMap::new();
        counts.insert(FailureKind::PredictionError, 7);
        counts.insert(FailureKind::ExecutionError, 1);

        let prompt = renderer()
            .feedback("function generate_instruction(r) {}", &counts, &failures)
            .unwrap();

        assert!(prompt.contains("\"PREDICTION_ERROR\": 7"));
        assert!(prompt.contains("Case 1 (record 4)"));
        assert!(prompt.contains("Actual: B相接地"));
        assert!(prompt.contains("Error type: SandboxTimeout"));
    }

    #[test]
    fn test_improvement_prompt_summarises_failures() {
        let failures = vec![FailureCase {
            index: 0,
            input: json!({}),
            expected: Some("X".into()),
            observed: None,
            kind: FailureKind::FormatError,
            sandbox_kind: None,
            message: "output has no 'Fault classification' field".into(),
        }];
        let prompt = renderer()
            .improvement("function generate_instruction(r) {}", "Add the field.", &failures)
            .unwrap();

        assert!(prompt.contains("Add the field."));
        assert!(prompt.contains("\"error_type\": \"FORMAT_ERROR\""));
    }

    #[test]
    fn test_system_prompts_render() {
        let renderer = renderer();
        assert!(renderer.seed_system().unwrap().contains("\"Fault classification\""));
        assert!(renderer.codegen_system().unwrap().contains("JavaScript"));
    }
}
