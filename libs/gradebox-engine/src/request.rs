// Structural validation of incoming requests. Runs before the scanner and
// never touches a sandbox.

use gradebox_common::config::EngineConfig;
use gradebox_common::types::{ExecutionRequest, TestCase};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy)]
pub struct RequestCaps {
    pub max_source_bytes: usize,
    pub max_test_cases: usize,
    pub max_input_bytes: usize,
}

impl From<&EngineConfig> for RequestCaps {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_source_bytes: config.max_source_bytes,
            max_test_cases: config.max_test_cases,
            max_input_bytes: config.max_input_bytes,
        }
    }
}

impl Default for RequestCaps {
    fn default() -> Self {
        RequestCaps::from(&EngineConfig::default())
    }
}

/// Problems with the source alone; shared with `validate`, which has no
/// test cases.
pub fn check_source(source_code: &str, caps: &RequestCaps) -> Vec<String> {
    let mut errors = Vec::new();
    if source_code.trim().is_empty() {
        errors.push("source code is empty".to_string());
    } else if source_code.len() > caps.max_source_bytes {
        errors.push(format!(
            "source code is {} bytes; the limit is {} bytes",
            source_code.len(),
            caps.max_source_bytes
        ));
    }
    if source_code.contains('\0') {
        errors.push("source code contains NUL bytes".to_string());
    }
    errors
}

/// Every structural problem with the request, in a stable order. Empty means
/// the request may proceed to scanning.
pub fn validate_request(request: &ExecutionRequest, caps: &RequestCaps) -> Vec<String> {
    let mut errors = check_source(&request.source_code, caps);

    if request.test_cases.is_empty() {
        errors.push("at least one test case is required".to_string());
    } else if request.test_cases.len() > caps.max_test_cases {
        errors.push(format!(
            "{} test cases submitted; the limit is {}",
            request.test_cases.len(),
            caps.max_test_cases
        ));
    }

    let mut seen = HashSet::new();
    for (idx, case) in request.test_cases.iter().enumerate() {
        check_case(idx, case, caps, &mut seen, &mut errors);
    }

    if let Some(limits) = &request.resource_limits {
        let zero = limits.zero_fields();
        if !zero.is_empty() {
            errors.push(format!(
                "resource limits must be at least 1: {}",
                zero.join(", ")
            ));
        }
    }

    errors
}

fn check_case<'a>(
    idx: usize,
    case: &'a TestCase,
    caps: &RequestCaps,
    seen: &mut HashSet<&'a str>,
    errors: &mut Vec<String>,
) {
    let label = format!("test case {}", idx + 1);

    if case.id.trim().is_empty() {
        errors.push(format!("{}: id is empty", label));
    } else if !seen.insert(case.id.as_str()) {
        errors.push(format!("{}: duplicate id '{}'", label, case.id));
    }

    if !case.weight.is_finite() || case.weight <= 0.0 {
        errors.push(format!("{}: weight must be a positive number", label));
    }

    if case.input.len() > caps.max_input_bytes {
        errors.push(format!(
            "{}: input is {} bytes; the limit is {} bytes",
            label,
            case.input.len(),
            caps.max_input_bytes
        ));
    }

    if case
        .input
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
    {
        errors.push(format!("{}: input contains control characters", label));
    }
}
