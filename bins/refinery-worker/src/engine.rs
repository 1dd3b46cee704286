/// Sandbox Engine - Restricted Execution of Generated Programs
///
/// **Core Responsibility:**
/// Load untrusted source text into an isolated JavaScript context, bind one
/// input record, call `generate_instruction`, and return the raw result.
///
/// **Critical Architectural Boundary:**
/// - Engine knows HOW to execute (embedded Boa context per call)
/// - Engine does NOT know labels or ground truth
/// - Engine does NOT judge correctness
/// - Every failure is folded into an `ExecutionResult`, never an `Err`
///
/// **Isolation Rules:**
/// 1. Fresh `Context` per execution, so no state leaks between records
/// 2. Global object pruned to an allow-list before user code runs
/// 3. `print` / `console.*` write to a capped per-execution buffer
/// 4. Loop-iteration and recursion limits bound runaway code
/// 5. Wall-clock timeout enforced by the async caller
/// 6. Threads abandoned after a timeout are capped; past the cap new
///    executions fail fast with `Timeout` instead of spawning
use boa_engine::{
    js_string, property::Attribute, Context, JsError, JsResult, JsValue, NativeFunction, Source,
};
use lazy_static::lazy_static;
use refinery_common::config::SandboxConfig;
use refinery_common::error::{SandboxErrorKind, SandboxFailure};
use refinery_common::types::{ExecutionResult, Record};
use regex::Regex;
use serde_json::Value;
use std::cell::RefCell;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Name of the function every generated program must define.
pub const ENTRY_POINT: &str = "generate_instruction";

/// Global symbol the input record is bound to.
pub const INPUT_SYMBOL: &str = "input_data";

const SANDBOX_STACK_BYTES: usize = 16 * 1024 * 1024;

const ENTRY_LOOKUP: &str =
    "typeof generate_instruction === 'function' ? generate_instruction : undefined";

lazy_static! {
    /// Module loading is rejected before the source reaches the parser.
    /// Matched against `mask_non_code` output, never the raw source.
    static ref IMPORT_PATTERN: Regex =
        Regex::new(r#"(?m)(^\s*import\s*[\w{*'"]|(?:^|[^.\w$])import\s*\()"#).unwrap();
}

const THREAD_RUNNING: u8 = 0;
const THREAD_FINISHED: u8 = 1;
const THREAD_ABANDONED: u8 = 2;

thread_local! {
    static CAPTURED: RefCell<CapturedOutput> = RefCell::new(CapturedOutput::new(0));
}

/// Text written through `print` / `console.*` during one execution.
struct CapturedOutput {
    text: String,
    limit: usize,
    truncated: bool,
}

impl CapturedOutput {
    fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    fn push_line(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        let remaining = self.limit.saturating_sub(self.text.len());
        let needed = line.len() + 1;
        if needed <= remaining {
            self.text.push_str(line);
            self.text.push('\n');
            return;
        }
        // Cut on a char boundary
        let mut end = remaining.min(line.len());
        while end > 0 && !line.is_char_boundary(end) {
            end -= 1;
        }
        self.text.push_str(&line[..end]);
        self.truncated = true;
    }
}

fn reset_captured(limit: usize) {
    CAPTURED.with(|c| *c.borrow_mut() = CapturedOutput::new(limit));
}

fn captured_text() -> String {
    CAPTURED.with(|c| c.borrow().text.clone())
}

fn take_captured() -> String {
    CAPTURED.with(|c| std::mem::take(&mut c.borrow_mut().text))
}

/// Limits applied to every execution, cloned into each sandbox thread.
#[derive(Debug, Clone)]
struct SandboxLimits {
    loop_iteration_limit: u64,
    recursion_limit: usize,
    require_entry_point: bool,
    max_source_bytes: usize,
    max_output_bytes: usize,
    max_abandoned_threads: usize,
    allowed_globals: Vec<String>,
}

impl From<&SandboxConfig> for SandboxLimits {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            loop_iteration_limit: config.loop_iteration_limit,
            recursion_limit: config.recursion_limit,
            require_entry_point: config.require_entry_point,
            max_source_bytes: config.max_source_bytes,
            max_output_bytes: config.max_output_bytes,
            max_abandoned_threads: config.max_abandoned_threads,
            allowed_globals: config.allowed_globals.clone(),
        }
    }
}

/// Result handed back from the sandbox thread.
struct ProgramOutcome {
    stdout: String,
    result: Result<Record, SandboxFailure>,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Load,
    Invoke,
}

/// Thread accounting guard - decrements the live counter when the sandbox
/// thread finishes, and the abandoned counter if the caller gave up on it.
struct ThreadGuard {
    live: Arc<AtomicUsize>,
    abandoned: Arc<AtomicUsize>,
    state: Arc<AtomicU8>,
}

impl ThreadGuard {
    fn new(live: Arc<AtomicUsize>, abandoned: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self {
            live,
            abandoned,
            state: Arc::new(AtomicU8::new(THREAD_RUNNING)),
        }
    }
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        let finished = self.state.compare_exchange(
            THREAD_RUNNING,
            THREAD_FINISHED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        // Only fails when the caller already counted this thread as abandoned
        if finished.is_err() {
            self.abandoned.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Embedded JavaScript sandbox.
///
/// Each call runs on its own OS thread. On timeout or cancellation the
/// caller stops waiting and the thread is left to hit its loop or
/// recursion limit. Nested loops can outlive both limits, so at most
/// `max_abandoned_threads` such threads exist per engine; once the cap is
/// reached every new execution fails with `Timeout` without spawning.
#[derive(Debug, Clone)]
pub struct SandboxEngine {
    limits: SandboxLimits,
    live: Arc<AtomicUsize>,
    abandoned: Arc<AtomicUsize>,
}

impl SandboxEngine {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            limits: SandboxLimits::from(config),
            live: Arc::new(AtomicUsize::new(0)),
            abandoned: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sandbox threads currently running, including abandoned ones.
    pub fn live_threads(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Threads still running after their caller timed out or was cancelled.
    pub fn abandoned_threads(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }

    fn abandon(&self, state: &AtomicU8) {
        // Count first so the thread's guard never decrements below zero
        self.abandoned.fetch_add(1, Ordering::SeqCst);
        let marked = state.compare_exchange(
            THREAD_RUNNING,
            THREAD_ABANDONED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if marked.is_err() {
            self.abandoned.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Execute `source` against one record.
    ///
    /// **Failure Classification:**
    /// - Non-object record → `InvalidRecord`
    /// - Oversized source, parse error, top-level throw → `Load`
    /// - Module loading or unknown identifier → `NameNotAllowed`
    /// - Wall clock, loop or recursion budget exhausted → `Timeout`
    /// - Abandoned-thread cap reached → `Timeout` (nothing is spawned)
    /// - Entry function throws → `Runtime` (message preserved)
    /// - Strict mode without an entry function → `MissingEntryPoint`
    /// - Token cancelled before or during the call → `Cancelled`
    pub async fn execute(
        &self,
        source: &str,
        record: &Record,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        let start = Instant::now();

        if cancel.is_cancelled() {
            return ExecutionResult::failure(
                SandboxErrorKind::Cancelled,
                "run cancelled before execution",
                String::new(),
                0,
            );
        }
        if !record.is_object() {
            return ExecutionResult::failure(
                SandboxErrorKind::InvalidRecord,
                format!("input record must be a JSON object, got {}", json_type(record)),
                String::new(),
                0,
            );
        }
        if source.len() > self.limits.max_source_bytes {
            return ExecutionResult::failure(
                SandboxErrorKind::Load,
                format!(
                    "source exceeds maximum size of {} bytes",
                    self.limits.max_source_bytes
                ),
                String::new(),
                0,
            );
        }
        if let Some(found) = IMPORT_PATTERN.find(&mask_non_code(source)) {
            return ExecutionResult::failure(
                SandboxErrorKind::NameNotAllowed,
                format!("module loading is not allowed: `{}`", found.as_str().trim()),
                String::new(),
                0,
            );
        }

        let abandoned = self.abandoned_threads();
        if abandoned >= self.limits.max_abandoned_threads {
            warn!(
                abandoned,
                limit = self.limits.max_abandoned_threads,
                "sandbox saturated by runaway executions, refusing to spawn"
            );
            return ExecutionResult::failure(
                SandboxErrorKind::Timeout,
                format!(
                    "sandbox saturated: {} timed-out executions are still running",
                    abandoned
                ),
                String::new(),
                elapsed_ms(start),
            );
        }

        let (tx, rx) = oneshot::channel();
        let limits = self.limits.clone();
        let source = source.to_string();
        let record = record.clone();
        let guard = ThreadGuard::new(self.live.clone(), self.abandoned.clone());
        let state = guard.state.clone();

        let spawned = std::thread::Builder::new()
            .name("refinery-sandbox".to_string())
            .stack_size(SANDBOX_STACK_BYTES)
            .spawn(move || {
                let _guard = guard;
                let outcome = run_program(&limits, &source, &record);
                // Receiver is gone when the caller timed out
                let _ = tx.send(outcome);
            });

        if let Err(e) = spawned {
            return ExecutionResult::failure(
                SandboxErrorKind::Runtime,
                format!("failed to start sandbox thread: {}", e),
                String::new(),
                elapsed_ms(start),
            );
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                self.abandon(&state);
                debug!(live = self.live_threads(), "sandbox execution cancelled");
                ExecutionResult::failure(
                    SandboxErrorKind::Cancelled,
                    "run cancelled during execution",
                    String::new(),
                    elapsed_ms(start),
                )
            }
            received = tokio::time::timeout(timeout, rx) => match received {
                Ok(Ok(outcome)) => {
                    let duration_ms = elapsed_ms(start);
                    match outcome.result {
                        Ok(output) => ExecutionResult::success(outcome.stdout, output, duration_ms),
                        Err(failure) => ExecutionResult::failure(
                            failure.kind,
                            failure.message,
                            outcome.stdout,
                            duration_ms,
                        ),
                    }
                }
                Ok(Err(_)) => ExecutionResult::failure(
                    SandboxErrorKind::Runtime,
                    "sandbox thread terminated unexpectedly",
                    String::new(),
                    elapsed_ms(start),
                ),
                Err(_) => {
                    self.abandon(&state);
                    warn!(
                        timeout_ms = timeout.as_millis() as u64,
                        live = self.live_threads(),
                        abandoned = self.abandoned_threads(),
                        "sandbox execution timed out, abandoning thread"
                    );
                    ExecutionResult::failure(
                        SandboxErrorKind::Timeout,
                        format!("execution exceeded {}ms", timeout.as_millis()),
                        String::new(),
                        elapsed_ms(start),
                    )
                }
            }
        }
    }
}

/// Blank out comments and string / template literal text, keeping quotes,
/// code inside `${...}` substitutions and line breaks in place.
fn mask_non_code(source: &str) -> String {
    let chars: Vec<char> = source.chars().collect();
    let mut out = String::with_capacity(source.len());
    // Brace depth at which each open `${` substitution started
    let mut substitutions: Vec<usize> = Vec::new();
    let mut depth = 0usize;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '/' if next == Some('/') => {
                while i < chars.len() && chars[i] != '\n' {
                    out.push(' ');
                    i += 1;
                }
            }
            '/' if next == Some('*') => {
                out.push_str("  ");
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    out.push(blank(chars[i]));
                    i += 1;
                }
                if i < chars.len() {
                    out.push_str("  ");
                    i += 2;
                }
            }
            '\'' | '"' => {
                out.push(c);
                i += 1;
                while i < chars.len() && chars[i] != c && chars[i] != '\n' {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        out.push(' ');
                        out.push(blank(chars[i + 1]));
                        i += 2;
                        continue;
                    }
                    out.push(blank(chars[i]));
                    i += 1;
                }
                if i < chars.len() {
                    out.push(chars[i]);
                    i += 1;
                }
            }
            '`' => {
                out.push(c);
                i = mask_template_text(&chars, i + 1, &mut out, &mut substitutions, depth);
            }
            '{' => {
                depth += 1;
                out.push(c);
                i += 1;
            }
            '}' if substitutions.last() == Some(&depth) => {
                substitutions.pop();
                out.push(c);
                i = mask_template_text(&chars, i + 1, &mut out, &mut substitutions, depth);
            }
            '}' => {
                depth = depth.saturating_sub(1);
                out.push(c);
                i += 1;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Mask template text from `i` up to the closing backtick or the next `${`.
fn mask_template_text(
    chars: &[char],
    mut i: usize,
    out: &mut String,
    substitutions: &mut Vec<usize>,
    depth: usize,
) -> usize {
    while i < chars.len() {
        match chars[i] {
            '\\' if i + 1 < chars.len() => {
                out.push(' ');
                out.push(blank(chars[i + 1]));
                i += 2;
            }
            '`' => {
                out.push('`');
                return i + 1;
            }
            '$' if chars.get(i + 1) == Some(&'{') => {
                out.push_str("${");
                substitutions.push(depth);
                return i + 2;
            }
            c => {
                out.push(blank(c));
                i += 1;
            }
        }
    }
    i
}

fn blank(c: char) -> char {
    if c == '\n' {
        '\n'
    } else {
        ' '
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Runs on the sandbox thread.
fn run_program(limits: &SandboxLimits, source: &str, record: &Record) -> ProgramOutcome {
    reset_captured(limits.max_output_bytes);
    let result = evaluate_program(limits, source, record);
    ProgramOutcome {
        stdout: take_captured(),
        result,
    }
}

fn evaluate_program(
    limits: &SandboxLimits,
    source: &str,
    record: &Record,
) -> Result<Record, SandboxFailure> {
    let mut context = Context::default();
    context
        .runtime_limits_mut()
        .set_loop_iteration_limit(limits.loop_iteration_limit);
    context
        .runtime_limits_mut()
        .set_recursion_limit(limits.recursion_limit);

    let input = install_harness(&mut context, limits, record).map_err(|e| {
        SandboxFailure::new(SandboxErrorKind::Load, format!("sandbox setup failed: {}", e))
    })?;

    context
        .eval(Source::from_bytes(source))
        .map_err(|e| classify_error(e, Phase::Load, &mut context))?;

    let entry = context
        .eval(Source::from_bytes(ENTRY_LOOKUP))
        .map_err(|e| classify_error(e, Phase::Load, &mut context))?;

    let Some(function) = entry.as_callable().cloned() else {
        if limits.require_entry_point {
            return Err(SandboxFailure::new(
                SandboxErrorKind::MissingEntryPoint,
                format!("program does not define {}", ENTRY_POINT),
            ));
        }
        return Ok(Value::String(captured_text()));
    };

    let arity = function
        .get(js_string!("length"), &mut context)
        .map_err(|e| classify_error(e, Phase::Load, &mut context))?
        .as_number()
        .unwrap_or(0.0);
    if arity > 1.0 {
        return Err(SandboxFailure::new(
            SandboxErrorKind::Load,
            format!("{} must take a single argument, declares {}", ENTRY_POINT, arity),
        ));
    }

    let returned = function
        .call(&JsValue::undefined(), &[input], &mut context)
        .map_err(|e| classify_error(e, Phase::Invoke, &mut context))?;

    to_record(&returned, &mut context)
        .map_err(|e| classify_error(e, Phase::Invoke, &mut context))
}

/// Bind `print`, build `console`, prune globals, then bind the input record.
fn install_harness(
    context: &mut Context,
    limits: &SandboxLimits,
    record: &Record,
) -> JsResult<JsValue> {
    context.register_global_callable(
        js_string!("print"),
        0,
        NativeFunction::from_fn_ptr(capture_print),
    )?;

    let mut allowed: Vec<&str> = limits.allowed_globals.iter().map(String::as_str).collect();
    allowed.extend(["print", "console"]);
    let allowed = serde_json::to_string(&allowed).unwrap_or_else(|_| "[]".to_string());

    let prelude = format!(
        r#"(function () {{
            const g = globalThis;
            g.console = {{ log: print, info: print, warn: print, error: print, debug: print }};
            const allowed = {allowed};
            for (const name of Object.getOwnPropertyNames(g)) {{
                if (!allowed.includes(name)) {{
                    try {{ delete g[name]; }} catch (e) {{}}
                }}
            }}
        }})();"#
    );
    context.eval(Source::from_bytes(prelude.as_str()))?;

    let input = JsValue::from_json(record, context)?;
    context.register_global_property(js_string!("input_data"), input.clone(), Attribute::all())?;
    Ok(input)
}

fn capture_print(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let mut parts = Vec::with_capacity(args.len());
    for arg in args {
        parts.push(render_value(arg, context)?);
    }
    let line = parts.join(" ");
    CAPTURED.with(|c| c.borrow_mut().push_line(&line));
    Ok(JsValue::undefined())
}

fn render_value(value: &JsValue, context: &mut Context) -> JsResult<String> {
    if let Some(text) = value.as_string() {
        return Ok(text.to_std_string_escaped());
    }
    if value.is_object() && !value.is_callable() {
        if let Ok(json) = value.to_json(context) {
            return Ok(json.to_string());
        }
    }
    Ok(value.to_string(context)?.to_std_string_escaped())
}

fn to_record(value: &JsValue, context: &mut Context) -> JsResult<Record> {
    if value.is_undefined() || value.is_callable() {
        return Ok(Value::Null);
    }
    value.to_json(context)
}

fn classify_error(err: JsError, phase: Phase, context: &mut Context) -> SandboxFailure {
    let message = match err.try_native(context) {
        Ok(native) => native.to_string(),
        Err(_) => err.to_string(),
    };

    let kind = if is_limit_error(&message) {
        SandboxErrorKind::Timeout
    } else if message.starts_with("ReferenceError") && message.contains("is not defined") {
        SandboxErrorKind::NameNotAllowed
    } else {
        match phase {
            Phase::Load => SandboxErrorKind::Load,
            Phase::Invoke => SandboxErrorKind::Runtime,
        }
    };
    SandboxFailure::new(kind, message)
}

fn is_limit_error(message: &str) -> bool {
    message.starts_with("RuntimeLimit")
        || message.contains("loop iteration limit")
        || message.contains("maximum number of recursive calls")
        || message.contains("call stack size exceeded")
}
