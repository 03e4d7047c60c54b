// Prometheus metrics for the worker, exposed on GET /metrics

use gradebox_common::types::ExecutionResult;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref EXECUTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gradebox_executions_total",
        "Completed execution requests by language and outcome",
        &["language", "outcome"]
    )
    .unwrap();
    pub static ref EXECUTION_DURATION: HistogramVec = register_histogram_vec!(
        "gradebox_execution_duration_seconds",
        "End-to-end execution time per request",
        &["language"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    )
    .unwrap();
    pub static ref SCANNER_REJECTIONS: IntCounterVec = register_int_counter_vec!(
        "gradebox_scanner_rejections_total",
        "Requests rejected by the static security scan",
        &["language"]
    )
    .unwrap();
    pub static ref LIVE_SANDBOXES: IntGauge = register_int_gauge!(
        "gradebox_live_sandboxes",
        "Sandboxes currently provisioned"
    )
    .unwrap();
    pub static ref IN_FLIGHT: IntGauge = register_int_gauge!(
        "gradebox_requests_in_flight",
        "Requests queued or running in the worker pool"
    )
    .unwrap();
}

/// Outcome label for one finished request.
pub fn outcome_label(result: &ExecutionResult) -> &'static str {
    if result.cancelled {
        "cancelled"
    } else if result.success {
        "passed"
    } else {
        match result.failure_kind {
            Some(kind) => kind.as_str(),
            None => "failed",
        }
    }
}

pub fn record_execution(language: &str, result: &ExecutionResult) {
    EXECUTIONS_TOTAL
        .with_label_values(&[language, outcome_label(result)])
        .inc();
    EXECUTION_DURATION
        .with_label_values(&[language])
        .observe(result.execution_time_ms as f64 / 1000.0);
    if !result.security_violations.is_empty() {
        SCANNER_REJECTIONS.with_label_values(&[language]).inc();
    }
}

pub fn set_pool_gauges(live_sandboxes: usize, in_flight: usize) {
    LIVE_SANDBOXES.set(live_sandboxes as i64);
    IN_FLIGHT.set(in_flight as i64);
}

/// Text exposition of every registered metric.
pub fn render() -> anyhow::Result<(String, String)> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok((encoder.format_type().to_string(), String::from_utf8(buffer)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gradebox_common::types::FailureKind;
    use uuid::Uuid;

    fn result() -> ExecutionResult {
        ExecutionResult {
            request_id: Uuid::new_v4(),
            success: false,
            failure_kind: None,
            retryable: false,
            cancelled: false,
            message: None,
            stdout: String::new(),
            stderr: String::new(),
            test_results: Vec::new(),
            passed_tests: 0,
            total_tests: 1,
            score: 0.0,
            execution_time_ms: 120,
            peak_memory_kb: None,
            security_violations: Vec::new(),
            effective_limits: None,
        }
    }

    #[test]
    fn test_outcome_labels() {
        let mut r = result();
        assert_eq!(outcome_label(&r), "failed");

        r.failure_kind = Some(FailureKind::Timeout);
        assert_eq!(outcome_label(&r), "timeout");

        r.cancelled = true;
        assert_eq!(outcome_label(&r), "cancelled");

        let mut ok = result();
        ok.success = true;
        assert_eq!(outcome_label(&ok), "passed");
    }

    #[test]
    fn test_render_includes_recorded_series() {
        let mut r = result();
        r.failure_kind = Some(FailureKind::SecurityViolation);
        r.security_violations = vec!["os.system".to_string()];
        record_execution("metrics-test-lang", &r);

        let (content_type, body) = render().unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(body.contains("gradebox_scanner_rejections_total{language=\"metrics-test-lang\"} 1"));
        assert!(body.contains("outcome=\"security_violation\""));
    }
}
