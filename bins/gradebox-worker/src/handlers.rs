// HTTP route handlers for the Gradebox worker

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use gradebox_common::types::{CallerRole, ExecutionRequest, ResourceLimits, SecurityLevel, TestCase};
use gradebox_engine::EngineError;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::AppState;

/// Header carrying the role established by the upstream auth layer.
pub const CALLER_ROLE_HEADER: &str = "x-caller-role";

#[derive(Debug, Deserialize)]
pub struct ExecuteBody {
    pub language: String,
    pub source_code: String,
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub resource_limits: Option<ResourceLimits>,
    #[serde(default)]
    pub security_level: Option<SecurityLevel>,
    #[serde(default)]
    pub request_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ValidateBody {
    pub language: String,
    pub source_code: String,
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": message.into()
        })),
    )
        .into_response()
}

fn caller_role(headers: &HeaderMap) -> Result<CallerRole, Response> {
    match headers.get(CALLER_ROLE_HEADER) {
        None => Ok(CallerRole::default()),
        Some(value) => value
            .to_str()
            .map_err(|_| "caller role header is not valid text".to_string())
            .and_then(CallerRole::from_str)
            .map_err(|e| json_error(StatusCode::BAD_REQUEST, e)),
    }
}

fn engine_error_response(err: EngineError) -> Response {
    match err {
        EngineError::Forbidden => json_error(StatusCode::FORBIDDEN, err.to_string()),
        EngineError::QueueFull | EngineError::ShuttingDown => {
            warn!(error = %err, "Execution refused");
            json_error(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
        EngineError::DuplicateRequest(_) => json_error(StatusCode::CONFLICT, err.to_string()),
        EngineError::Registry(ref e) if e.is_not_found() => {
            json_error(StatusCode::NOT_FOUND, err.to_string())
        }
        other => {
            let incident_id = Uuid::new_v4();
            error!(%incident_id, error = ?other, "Request failed");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("internal error, incident {}", incident_id),
            )
        }
    }
}

/// POST /execute - Run a submission against its test cases
///
/// Always 200 with a structured result once the request is accepted;
/// 503 when the queue is full or the worker is draining. A client that
/// disconnects cancels its request.
pub async fn execute(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<ExecuteBody>, JsonRejection>,
) -> Response {
    let caller = match caller_role(&headers) {
        Ok(role) => role,
        Err(response) => return response,
    };
    let Json(body) = match payload {
        Ok(body) => body,
        Err(rejection) => return json_error(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    let engine = state.pool.engine();
    let language = engine
        .registry()
        .resolve(&body.language)
        .map(|profile| profile.id.as_str())
        .unwrap_or("unknown");

    let request = ExecutionRequest {
        id: body.request_id.unwrap_or_else(Uuid::new_v4),
        language: body.language,
        source_code: body.source_code,
        test_cases: body.test_cases,
        resource_limits: body.resource_limits,
        security_level: body
            .security_level
            .unwrap_or_else(|| engine.default_security_level()),
    };

    info!(
        request_id = %request.id,
        language,
        test_cases = request.test_cases.len(),
        caller = ?caller,
        "Execution requested"
    );

    let outcome = state.pool.execute(request, caller).await;
    metrics::set_pool_gauges(engine.live_sandboxes(), state.pool.in_flight());
    match outcome {
        Ok(result) => {
            metrics::record_execution(language, &result);
            (StatusCode::OK, Json(result)).into_response()
        }
        Err(e) => engine_error_response(e),
    }
}

/// POST /executions/{id}/cancel - Cancel a queued or running request
pub async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> Response {
    let request_id = match Uuid::parse_str(&request_id) {
        Ok(id) => id,
        Err(_) => return json_error(StatusCode::BAD_REQUEST, "Invalid request ID format"),
    };

    if state.pool.cancel(&request_id) {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "request_id": request_id,
                "cancelled": true
            })),
        )
            .into_response()
    } else {
        json_error(
            StatusCode::NOT_FOUND,
            format!("request {} is not queued or running", request_id),
        )
    }
}

/// POST /validate - Compile or syntax-check without running tests
pub async fn validate(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ValidateBody>, JsonRejection>,
) -> Response {
    let Json(body) = match payload {
        Ok(body) => body,
        Err(rejection) => return json_error(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    let outcome = state
        .pool
        .engine()
        .validate(&body.source_code, &body.language)
        .await;
    (StatusCode::OK, Json(outcome)).into_response()
}

/// GET /languages - Supported languages, without image references
pub async fn list_languages(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.pool.engine().list_languages())
}

/// POST /admin/images/rebuild - Rebuild every sandbox image (admin)
pub async fn rebuild_images(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let caller = match caller_role(&headers) {
        Ok(role) => role,
        Err(response) => return response,
    };
    match state.pool.engine().rebuild_language_images(caller).await {
        Ok(images) => (StatusCode::OK, Json(images)).into_response(),
        Err(e) => engine_error_response(e),
    }
}

/// POST /admin/sandboxes/cleanup - Remove orphaned sandboxes (admin)
pub async fn cleanup_sandboxes(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let caller = match caller_role(&headers) {
        Ok(role) => role,
        Err(response) => return response,
    };
    match state.pool.engine().cleanup_orphaned_sandboxes(caller).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => engine_error_response(e),
    }
}

/// GET /health - Liveness plus current load
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let engine = state.pool.engine();
    let live_sandboxes = engine.live_sandboxes();
    let in_flight = state.pool.in_flight();
    metrics::set_pool_gauges(live_sandboxes, in_flight);
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "backend": engine.backend(),
            "live_sandboxes": live_sandboxes,
            "in_flight": in_flight
        })),
    )
}

/// GET /metrics - Prometheus text exposition
pub async fn export_metrics(State(state): State<Arc<AppState>>) -> Response {
    metrics::set_pool_gauges(state.pool.engine().live_sandboxes(), state.pool.in_flight());
    match metrics::render() {
        Ok((content_type, body)) => {
            (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics")
        }
    }
}
