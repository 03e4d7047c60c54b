/// Result Aggregator - Language-Agnostic Scoring Logic
///
/// **Core Responsibility:**
/// Turn raw sandbox outcomes into verdicts, a weighted score and the
/// caller-facing `ExecutionResult`.
///
/// **Critical Properties:**
/// - Knows nothing about containers, jails or language runtimes
/// - Pure functions: (outcomes, test cases, caller privilege) → result
///
/// **Scoring Rules:**
/// - score = Σ(weight of passed cases) / Σ(all weights), in [0, 1]
/// - success = no blocking failure, nothing cancelled, every case passed
///
/// **Normalization Rules:**
/// - Trailing whitespace and newlines removed from both sides: YES
/// - Leading whitespace: preserved
/// - Case, internal whitespace, blank lines inside: preserved (exact match)
///
/// **Redaction:**
/// Hidden cases keep their verdict and timing, but actual/expected output
/// and stderr are withheld unless the caller can see hidden cases.
use crate::sandbox::{ExecOutcome, Termination};
use gradebox_common::types::{
    CaseVerdict, ExecutionResult, FailureKind, ResourceLimits, TestCase, TestCaseResult,
};
use lazy_static::lazy_static;
use regex::Regex;
use std::time::Duration;
use uuid::Uuid;

pub const TRUNCATION_MARKER: &str = "[output truncated]";
const HIDDEN_STDERR: &str = "details are hidden for this test case";

lazy_static! {
    static ref ANSI_ESCAPE: Regex =
        Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-_]")
            .expect("static regex");
}

/// What happened to one test case before judging.
#[derive(Debug, Clone)]
pub enum CaseRun {
    Finished(ExecOutcome),
    /// The isolation layer failed; detail was logged under this incident.
    Internal { incident_id: Uuid },
    NotRun,
}

/// A failure that stops the request before or instead of case-level results.
#[derive(Debug, Clone)]
pub enum BlockingFailure {
    Validation(Vec<String>),
    Security(Vec<String>),
    Compile { stdout: String, stderr: String, timed_out: bool },
    Internal { incident_id: Uuid },
}

impl BlockingFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            BlockingFailure::Validation(_) => FailureKind::ValidationError,
            BlockingFailure::Security(_) => FailureKind::SecurityViolation,
            BlockingFailure::Compile { .. } => FailureKind::CompileError,
            BlockingFailure::Internal { .. } => FailureKind::InternalError,
        }
    }

    /// Lower reports first.
    fn precedence(&self) -> u8 {
        match self {
            BlockingFailure::Validation(_) => 0,
            BlockingFailure::Security(_) => 1,
            BlockingFailure::Compile { .. } => 2,
            BlockingFailure::Internal { .. } => 3,
        }
    }

    fn message(&self) -> String {
        match self {
            BlockingFailure::Validation(errors) => {
                format!("invalid request: {}", errors.join("; "))
            }
            BlockingFailure::Security(violations) => format!(
                "submission rejected by security policy ({} violation{})",
                violations.len(),
                if violations.len() == 1 { "" } else { "s" }
            ),
            BlockingFailure::Compile { timed_out: true, .. } => {
                "compilation exceeded its time limit".to_string()
            }
            BlockingFailure::Compile { .. } => "compilation failed".to_string(),
            BlockingFailure::Internal { incident_id } => {
                format!("internal error, incident {}", incident_id)
            }
        }
    }
}

/// Remove trailing whitespace and newlines only.
pub fn normalize_output(output: &str) -> &str {
    output.trim_end()
}

/// Strip ANSI escapes and control characters other than `\n`, `\r`, `\t`,
/// then cut to `max_bytes` on a char boundary.
pub fn sanitize_output(raw: &str, max_bytes: usize) -> String {
    let stripped = ANSI_ESCAPE.replace_all(raw, "");
    let clean: String = stripped
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect();
    truncate_utf8(clean, max_bytes)
}

fn truncate_utf8(mut text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(TRUNCATION_MARKER);
    text
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

/// Judge a single case. The result is unredacted; `aggregate` redacts.
pub fn evaluate_case(case: &TestCase, run: &CaseRun, max_output_bytes: usize) -> TestCaseResult {
    let mut result = TestCaseResult {
        test_case_id: case.id.clone(),
        verdict: CaseVerdict::NotRun,
        passed: false,
        failure_kind: None,
        is_hidden: case.is_hidden,
        actual_output: None,
        expected_output: Some(case.expected_output.clone()),
        execution_time_ms: 0,
        peak_memory_kb: None,
        error: None,
    };

    let outcome = match run {
        CaseRun::NotRun => return result,
        CaseRun::Internal { incident_id } => {
            result.verdict = CaseVerdict::InternalError;
            result.failure_kind = Some(FailureKind::InternalError);
            result.error = Some(format!("internal error, incident {}", incident_id));
            return result;
        }
        CaseRun::Finished(outcome) => outcome,
    };

    result.execution_time_ms = millis(outcome.elapsed);
    result.peak_memory_kb = outcome.peak_memory_kb;
    result.actual_output = Some(sanitize_output(&outcome.stdout, max_output_bytes));
    let stderr = sanitize_output(&outcome.stderr, max_output_bytes);

    let (verdict, error) = match outcome.termination {
        Termination::Cancelled => (CaseVerdict::NotRun, Some("cancelled".to_string())),
        Termination::WallTimeExceeded => (
            CaseVerdict::Timeout,
            Some("wall-clock time limit exceeded".to_string()),
        ),
        Termination::CpuTimeExceeded => {
            (CaseVerdict::Timeout, Some("CPU time limit exceeded".to_string()))
        }
        Termination::MemoryExceeded => {
            (CaseVerdict::MemoryExceeded, Some("memory limit exceeded".to_string()))
        }
        Termination::OutputLimitExceeded => {
            (CaseVerdict::RuntimeError, Some("output limit exceeded".to_string()))
        }
        Termination::Signaled(signal) => (
            CaseVerdict::RuntimeError,
            Some(non_empty(stderr).unwrap_or_else(|| format!("terminated by signal {}", signal))),
        ),
        Termination::Exited if outcome.exit_code != Some(0) => (
            CaseVerdict::RuntimeError,
            Some(non_empty(stderr).unwrap_or_else(|| {
                format!("exited with status {}", outcome.exit_code.unwrap_or(-1))
            })),
        ),
        Termination::Exited => {
            if normalize_output(&outcome.stdout) == normalize_output(&case.expected_output) {
                (CaseVerdict::Passed, None)
            } else {
                (CaseVerdict::WrongAnswer, None)
            }
        }
    };

    result.passed = verdict == CaseVerdict::Passed;
    result.failure_kind = verdict.failure_kind();
    result.verdict = verdict;
    result.error = error;
    result
}

fn non_empty(text: String) -> Option<String> {
    (!text.trim().is_empty()).then_some(text)
}

/// Σ(weight · passed) / Σ(weight); zero when nothing carries weight.
pub fn weighted_score(test_cases: &[TestCase], results: &[TestCaseResult]) -> f64 {
    let total: f64 = test_cases.iter().map(|tc| tc.weight).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let earned: f64 = test_cases
        .iter()
        .zip(results)
        .filter(|(_, r)| r.passed)
        .map(|(tc, _)| tc.weight)
        .sum();
    (earned / total).clamp(0.0, 1.0)
}

fn redact(mut result: TestCaseResult) -> TestCaseResult {
    result.actual_output = None;
    result.expected_output = None;
    if result.verdict == CaseVerdict::RuntimeError && result.error.is_some() {
        result.error = Some(HIDDEN_STDERR.to_string());
    }
    result
}

/// Everything the aggregator needs about a finished request.
#[derive(Debug, Clone)]
pub struct Aggregation<'a> {
    pub request_id: Uuid,
    pub test_cases: &'a [TestCase],
    pub runs: Vec<CaseRun>,
    pub blocking: Vec<BlockingFailure>,
    pub security_violations: Vec<String>,
    pub can_see_hidden: bool,
    pub cancelled: bool,
    pub elapsed: Duration,
    pub peak_memory_kb: Option<u64>,
    pub effective_limits: Option<ResourceLimits>,
    pub max_output_bytes: usize,
}

pub fn aggregate(input: Aggregation<'_>) -> ExecutionResult {
    let max_output = input.max_output_bytes;
    let blocking = input.blocking.iter().min_by_key(|b| b.precedence());

    let evaluated: Vec<TestCaseResult> = input
        .test_cases
        .iter()
        .enumerate()
        .map(|(idx, case)| {
            let run = input.runs.get(idx).unwrap_or(&CaseRun::NotRun);
            evaluate_case(case, run, max_output)
        })
        .collect();

    let score = match blocking {
        Some(_) => 0.0,
        None => weighted_score(input.test_cases, &evaluated),
    };
    let passed_tests = evaluated.iter().filter(|r| r.passed).count();
    let total_tests = input.test_cases.len();

    let mut stdout = String::new();
    let mut stderr = String::new();
    match blocking {
        Some(BlockingFailure::Compile {
            stdout: out,
            stderr: err,
            ..
        }) => {
            stdout.push_str(out);
            stderr.push_str(err);
        }
        Some(_) => {}
        None => {
            for (case, run) in input.test_cases.iter().zip(&input.runs) {
                if case.is_hidden && !input.can_see_hidden {
                    continue;
                }
                if let CaseRun::Finished(outcome) = run {
                    stdout.push_str(&outcome.stdout);
                    stderr.push_str(&outcome.stderr);
                }
            }
        }
    }

    let test_results: Vec<TestCaseResult> = evaluated
        .into_iter()
        .map(|r| {
            if r.is_hidden && !input.can_see_hidden {
                redact(r)
            } else {
                r
            }
        })
        .collect();

    let any_internal = test_results
        .iter()
        .any(|r| r.verdict == CaseVerdict::InternalError);
    let failure_kind = blocking.map(|b| b.kind());
    let success = blocking.is_none()
        && !input.cancelled
        && total_tests > 0
        && passed_tests == total_tests;

    let message = match blocking {
        Some(b) => b.message(),
        None if input.cancelled => format!(
            "cancelled after {} of {} test cases",
            test_results
                .iter()
                .filter(|r| r.verdict != CaseVerdict::NotRun)
                .count(),
            total_tests
        ),
        None => format!("passed {} of {} test cases", passed_tests, total_tests),
    };

    ExecutionResult {
        request_id: input.request_id,
        success,
        failure_kind,
        retryable: failure_kind == Some(FailureKind::InternalError) || any_internal,
        cancelled: input.cancelled,
        message: Some(message),
        stdout: sanitize_output(&stdout, max_output),
        stderr: sanitize_output(&stderr, max_output),
        test_results,
        passed_tests,
        total_tests,
        score,
        execution_time_ms: millis(input.elapsed),
        peak_memory_kb: input.peak_memory_kb,
        security_violations: input.security_violations,
        effective_limits: input.effective_limits,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_case(id: &str, expected: &str, weight: f64, is_hidden: bool) -> TestCase {
        TestCase {
            id: id.to_string(),
            input: "input".to_string(),
            expected_output: expected.to_string(),
            is_hidden,
            weight,
        }
    }

    fn ran(stdout: &str) -> CaseRun {
        CaseRun::Finished(ExecOutcome::exited(0, stdout, ""))
    }

    fn aggregation<'a>(cases: &'a [TestCase], runs: Vec<CaseRun>) -> Aggregation<'a> {
        Aggregation {
            request_id: Uuid::new_v4(),
            test_cases: cases,
            runs,
            blocking: vec![],
            security_violations: vec![],
            can_see_hidden: false,
            cancelled: false,
            elapsed: Duration::from_millis(120),
            peak_memory_kb: Some(2048),
            effective_limits: None,
            max_output_bytes: 1024,
        }
    }

    #[test]
    fn test_normalize_output() {
        assert_eq!(normalize_output("hello\n"), "hello");
        assert_eq!(normalize_output("hello \t\r\n\n"), "hello");
        assert_eq!(normalize_output("  hello"), "  hello");
        assert_eq!(normalize_output("a\n\nb\n"), "a\n\nb");
        assert_eq!(normalize_output("   "), "");
    }

    #[test]
    fn test_exact_match_and_case_sensitivity() {
        let case = make_case("1", "8", 1.0, false);
        assert_eq!(evaluate_case(&case, &ran("8\n"), 64).verdict, CaseVerdict::Passed);
        assert_eq!(evaluate_case(&case, &ran(" 8"), 64).verdict, CaseVerdict::WrongAnswer);

        let case = make_case("2", "Hello", 1.0, false);
        assert_eq!(evaluate_case(&case, &ran("hello"), 64).verdict, CaseVerdict::WrongAnswer);
    }

    #[test]
    fn test_termination_mapping() {
        let case = make_case("1", "x", 1.0, false);
        let verdict = |t: Termination| {
            evaluate_case(&case, &CaseRun::Finished(ExecOutcome::terminated(t)), 64).verdict
        };
        assert_eq!(verdict(Termination::WallTimeExceeded), CaseVerdict::Timeout);
        assert_eq!(verdict(Termination::CpuTimeExceeded), CaseVerdict::Timeout);
        assert_eq!(verdict(Termination::MemoryExceeded), CaseVerdict::MemoryExceeded);
        assert_eq!(verdict(Termination::OutputLimitExceeded), CaseVerdict::RuntimeError);
        assert_eq!(verdict(Termination::Signaled(11)), CaseVerdict::RuntimeError);
        assert_eq!(verdict(Termination::Cancelled), CaseVerdict::NotRun);
    }

    #[test]
    fn test_runtime_error_carries_stderr() {
        let case = make_case("1", "x", 1.0, false);
        let run = CaseRun::Finished(ExecOutcome::exited(1, "", "ZeroDivisionError: division by zero\n"));
        let result = evaluate_case(&case, &run, 64);
        assert_eq!(result.verdict, CaseVerdict::RuntimeError);
        assert_eq!(result.failure_kind, Some(FailureKind::RuntimeError));
        assert!(result.error.unwrap().contains("ZeroDivisionError"));

        let silent = CaseRun::Finished(ExecOutcome::exited(3, "", ""));
        let result = evaluate_case(&case, &silent, 64);
        assert_eq!(result.error.as_deref(), Some("exited with status 3"));
    }

    #[test]
    fn test_weighted_score() {
        // one pass at weight 1, one fail at weight 3
        let cases = vec![make_case("1", "a", 1.0, false), make_case("2", "b", 3.0, false)];
        let result = aggregate(aggregation(&cases, vec![ran("a"), ran("wrong")]));
        assert!((result.score - 0.25).abs() < 1e-9);
        assert_eq!(result.passed_tests, 1);
        assert_eq!(result.total_tests, 2);
        assert!(!result.success);
        assert_eq!(result.failure_kind, None);
    }

    #[test]
    fn test_all_pass_is_success() {
        let cases = vec![make_case("1", "8", 1.0, false)];
        let result = aggregate(aggregation(&cases, vec![ran("8\n")]));
        assert!(result.success);
        assert_eq!(result.score, 1.0);
        assert_eq!(result.stdout, "8\n");
        assert_eq!(result.message.as_deref(), Some("passed 1 of 1 test cases"));
    }

    #[test]
    fn test_hidden_cases_are_redacted_for_candidates() {
        let cases = vec![
            make_case("visible", "1", 1.0, false),
            make_case("secret", "42", 1.0, true),
        ];
        let runs = vec![
            ran("1"),
            CaseRun::Finished(ExecOutcome::exited(1, "41", "assert secret == 42")),
        ];
        let result = aggregate(aggregation(&cases, runs.clone()));

        let hidden = &result.test_results[1];
        assert!(hidden.is_hidden);
        assert_eq!(hidden.verdict, CaseVerdict::RuntimeError);
        assert_eq!(hidden.actual_output, None);
        assert_eq!(hidden.expected_output, None);
        assert_eq!(hidden.error.as_deref(), Some(HIDDEN_STDERR));
        assert!(!result.stdout.contains("41"));
        assert!(!result.stderr.contains("secret"));
        let json = serde_json::to_string(&result).unwrap();
        assert!(!json.contains("\"42\""));

        let mut privileged = aggregation(&cases, runs);
        privileged.can_see_hidden = true;
        let result = aggregate(privileged);
        assert_eq!(result.test_results[1].expected_output.as_deref(), Some("42"));
        assert!(result.stderr.contains("secret"));
    }

    #[test]
    fn test_blocking_failure_precedence() {
        let cases = vec![make_case("1", "8", 1.0, false)];
        let mut input = aggregation(&cases, vec![]);
        input.blocking = vec![
            BlockingFailure::Internal { incident_id: Uuid::new_v4() },
            BlockingFailure::Compile {
                stdout: String::new(),
                stderr: "error: expected ';'".to_string(),
                timed_out: false,
            },
        ];
        let result = aggregate(input);
        assert_eq!(result.failure_kind, Some(FailureKind::CompileError));
        assert_eq!(result.score, 0.0);
        assert!(!result.retryable);
        assert!(result.stderr.contains("expected ';'"));
        assert_eq!(result.test_results[0].verdict, CaseVerdict::NotRun);

        let mut input = aggregation(&cases, vec![]);
        input.blocking = vec![
            BlockingFailure::Security(vec!["Line 1: process spawning is not allowed".to_string()]),
            BlockingFailure::Validation(vec!["source code is empty".to_string()]),
        ];
        assert_eq!(aggregate(input).failure_kind, Some(FailureKind::ValidationError));
    }

    #[test]
    fn test_internal_errors_are_generic_and_retryable() {
        let cases = vec![make_case("1", "8", 1.0, false)];
        let incident_id = Uuid::new_v4();
        let mut input = aggregation(&cases, vec![]);
        input.blocking = vec![BlockingFailure::Internal { incident_id }];
        let result = aggregate(input);
        assert_eq!(result.failure_kind, Some(FailureKind::InternalError));
        assert!(result.retryable);
        assert!(result.message.unwrap().contains(&incident_id.to_string()));
    }

    #[test]
    fn test_cancelled_requests_keep_finished_cases() {
        let cases = vec![make_case("1", "a", 1.0, false), make_case("2", "b", 1.0, false)];
        let mut input = aggregation(&cases, vec![ran("a"), CaseRun::NotRun]);
        input.cancelled = true;
        let result = aggregate(input);
        assert!(result.cancelled);
        assert!(!result.success);
        assert_eq!(result.test_results[0].verdict, CaseVerdict::Passed);
        assert_eq!(result.test_results[1].verdict, CaseVerdict::NotRun);
        assert_eq!(result.score, 0.5);
        assert_eq!(result.message.as_deref(), Some("cancelled after 1 of 2 test cases"));
    }

    #[test]
    fn test_sanitize_output() {
        assert_eq!(sanitize_output("\x1b[31mred\x1b[0m\n", 64), "red\n");
        assert_eq!(sanitize_output("a\x07b\x00c\td\r\n", 64), "abc\td\r\n");

        let truncated = sanitize_output("héllo world", 2);
        assert_eq!(truncated, format!("h\n{}", TRUNCATION_MARKER));
        assert_eq!(sanitize_output("short", 5), "short");
    }
}
