// HTTP route handlers for the grader API

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use grader_common::{redis, CacheError, GradingRequest, Stage};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::metrics;
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub attempt_id: String,
    pub queue: String,
}

/// Query string the judge echoes back on each stage callback
#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    #[serde(rename = "type")]
    pub stage: String,
    pub id: String,
    /// Run lease; callbacks without one are trusted for ordering only
    #[serde(default)]
    pub lease: Option<String>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// POST /grade - Queue a submission grading request
pub async fn submit_grading(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GradingRequest>,
) -> Response {
    if request.attempt_id.trim().is_empty() {
        metrics::record_request_rejected("missing_attempt_id");
        return error_response(StatusCode::BAD_REQUEST, "attemptId must not be empty");
    }
    if request.criterion_data_list.is_empty() {
        metrics::record_request_rejected("no_criteria");
        return error_response(StatusCode::BAD_REQUEST, "criterionDataList must not be empty");
    }

    let mut conn = state.redis.clone();
    match redis::push_request(&mut conn, &request).await {
        Ok(()) => {
            metrics::record_request_submitted(&request.plugin);
            info!(
                attempt_id = %request.attempt_id,
                plugin = %request.plugin,
                criteria = request.criterion_data_list.len(),
                "Grading request queued"
            );
            (
                StatusCode::ACCEPTED,
                Json(SubmitResponse {
                    attempt_id: request.attempt_id.clone(),
                    queue: redis::queue_name(&request.plugin),
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!(attempt_id = %request.attempt_id, error = %e, "Failed to queue grading request");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to queue grading request")
        }
    }
}

/// GET /grade/:attempt_id - Stored submission outcome
pub async fn get_outcome(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
) -> Response {
    let mut conn = state.redis.clone();
    match redis::load_outcome(&mut conn, &attempt_id).await {
        Ok(Some(outcome)) => {
            metrics::record_lookup("outcome", "found");
            (StatusCode::OK, Json(outcome)).into_response()
        }
        Ok(None) => {
            metrics::record_lookup("outcome", "missing");
            error_response(StatusCode::NOT_FOUND, format!("no result for attempt {}", attempt_id))
        }
        Err(e) => {
            metrics::record_lookup("outcome", "error");
            error!(attempt_id = %attempt_id, error = %e, "Failed to load outcome");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to load result")
        }
    }
}

/// GET /progress/:attempt_id/:criterion - Test-runner progress of one criterion
pub async fn get_progress(
    State(state): State<Arc<AppState>>,
    Path((attempt_id, criterion)): Path<(String, String)>,
) -> Response {
    let run_id = redis::run_id(&attempt_id, &criterion);
    match state.grading.progress(&run_id).await {
        Ok(progress) => {
            metrics::record_lookup("progress", "found");
            (StatusCode::OK, Json(progress)).into_response()
        }
        Err(e) => {
            let (status, label) = cache_error_status(&e);
            metrics::record_lookup("progress", label);
            if status.is_server_error() {
                error!(run_id = %run_id, error = %e, "Failed to read grading progress");
            }
            error_response(status, e.to_string())
        }
    }
}

/// POST /api/v1/plugins/test-runner/callback?type=<stage>&id=<run id>&lease=<lease>
///
/// The judge reports a finished stage. For RUN the body carries the judge
/// results, and their count becomes the processed total.
pub async fn judge_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
    body: Bytes,
) -> Response {
    let Some(stage) = Stage::from_str(&query.stage) else {
        warn!(stage = %query.stage, run_id = %query.id, "Unknown callback type");
        metrics::record_callback("unknown", "rejected");
        return error_response(StatusCode::BAD_REQUEST, "Unknown callback type");
    };

    let reported = match stage {
        Stage::Run => match reported_results(&body) {
            Ok(count) => count,
            Err(e) => {
                metrics::record_callback(stage.as_str(), "rejected");
                return error_response(StatusCode::BAD_REQUEST, format!("invalid callback body: {}", e));
            }
        },
        Stage::Upload | Stage::Init => 0,
    };

    info!(stage = %stage, run_id = %query.id, reported, "Received judge callback");

    let acknowledged = state
        .grading
        .acknowledge(&query.id, stage, reported, query.lease.as_deref())
        .await;
    match acknowledged {
        Ok(progress) => {
            metrics::record_callback(stage.as_str(), "ok");
            (StatusCode::OK, Json(progress)).into_response()
        }
        Err(e) => {
            let (status, label) = cache_error_status(&e);
            metrics::record_callback(stage.as_str(), label);
            warn!(stage = %stage, run_id = %query.id, error = %e, "Failed to record judge callback");
            error_response(status, e.to_string())
        }
    }
}

/// GET /health - Liveness with uptime
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "uptimeSeconds": state.start_time.elapsed().as_secs(),
        })),
    )
}

/// GET /metrics - Prometheus text exposition
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut conn = state.redis.clone();
    metrics::update_queue_depths(&mut conn).await;
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics::render_metrics(),
    )
}

/// Number of judge results in a RUN callback body
///
/// The judge posts either a result list or a single result; an empty body
/// reports nothing.
fn reported_results(body: &[u8]) -> Result<usize, serde_json::Error> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(0);
    }
    Ok(match serde_json::from_slice::<Value>(body)? {
        Value::Array(results) => results.len(),
        Value::Null => 0,
        _ => 1,
    })
}

fn cache_error_status(e: &CacheError) -> (StatusCode, &'static str) {
    match e {
        CacheError::Missing { .. } => (StatusCode::NOT_FOUND, "missing"),
        CacheError::Superseded { .. } => (StatusCode::CONFLICT, "superseded"),
        CacheError::Corrupt { .. } | CacheError::Backend(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reported_results_counts() {
        assert_eq!(reported_results(b"").unwrap(), 0);
        assert_eq!(reported_results(b"  \n").unwrap(), 0);
        assert_eq!(reported_results(b"null").unwrap(), 0);
        assert_eq!(reported_results(br#"[{"status":"Accepted"},{"status":"Accepted"}]"#).unwrap(), 2);
        assert_eq!(reported_results(br#"{"status":"Accepted"}"#).unwrap(), 1);
        assert!(reported_results(b"not json").is_err());
    }

    #[test]
    fn test_callback_query_parsing() {
        let query: CallbackQuery =
            serde_json::from_value(json!({ "type": "run", "id": "attempt-1.unit-tests" })).unwrap();
        assert_eq!(Stage::from_str(&query.stage), Some(Stage::Run));
        assert_eq!(query.id, "attempt-1.unit-tests");
        assert_eq!(query.lease, None);

        let query: CallbackQuery = serde_json::from_value(
            json!({ "type": "upload", "id": "attempt-1.unit-tests", "lease": "l-1" }),
        )
        .unwrap();
        assert_eq!(query.lease.as_deref(), Some("l-1"));
    }

    #[tokio::test]
    async fn test_stale_lease_maps_to_conflict() {
        use grader_common::{CriterionData, GradingStateStore, MemoryCache};

        let store = GradingStateStore::new(Arc::new(MemoryCache::new()));
        let criterion = CriterionData {
            criterion_name: "tests".to_string(),
            levels: vec![],
            file_refs: vec![],
            configuration: Value::Null,
        };
        store.begin_run("a.t", &json!({}), &criterion, 1).await.unwrap();

        let err = store
            .acknowledge("a.t", Stage::Run, 1, Some("old-lease"))
            .await
            .unwrap_err();
        assert_eq!(cache_error_status(&err).0, StatusCode::CONFLICT);
    }

    #[test]
    fn test_cache_error_status() {
        let missing = CacheError::Missing { key: "test-runner:x".to_string() };
        assert_eq!(cache_error_status(&missing).0, StatusCode::NOT_FOUND);

        let superseded = CacheError::Superseded { run_id: "x".to_string() };
        assert_eq!(cache_error_status(&superseded).0, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_acknowledge_through_memory_cache() {
        use grader_common::{GradingStateStore, MemoryCache};

        let store = GradingStateStore::new(Arc::new(MemoryCache::new()));
        let err = store.acknowledge("nope", Stage::Run, 1, None).await.unwrap_err();
        assert_eq!(cache_error_status(&err).0, StatusCode::NOT_FOUND);
    }
}
