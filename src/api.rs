//! Request control API.
//!
//! A thin axum edge over the engine: submission, status, history, bulk
//! status, cancel, and results. Core logic never depends on the HTTP layer;
//! handlers only translate between wire shapes and engine calls. Error
//! bodies carry a stable `error` tag and never leak internals.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::error;

use crate::engine::{Engine, SubmissionRequest};
use crate::error::Error;
use crate::ratelimit::RateDecision;

/// Build the API router.
pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/api/v1/analysis", post(submit))
        .route("/api/v1/status/:request_id", get(status))
        .route("/api/v1/status/bulk", post(bulk_status))
        .route("/api/v1/history/:request_id", get(history))
        .route("/api/v1/cancel/:request_id", post(cancel))
        .route("/api/v1/results/:request_id", get(results))
        .with_state(engine)
}

/// Serve the API on the engine's configured bind address.
pub async fn serve(engine: Arc<Engine>) -> crate::error::Result<()> {
    let addr = engine.bind_addr().to_string();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Config(format!("cannot bind {}: {}", addr, e)))?;
    tracing::info!(%addr, "api listening");
    axum::serve(listener, router(engine))
        .await
        .map_err(|e| Error::Internal(e.to_string()))
}

fn error_response(error: &Error) -> Response {
    let status = match error {
        Error::Config(_) | Error::Serialization(_) => StatusCode::BAD_REQUEST,
        Error::NotFound { .. } => StatusCode::NOT_FOUND,
        Error::InvalidTransition { .. } => StatusCode::CONFLICT,
        Error::Provider { .. } if error.tag() == "rate_limited" => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let tag = if status == StatusCode::INTERNAL_SERVER_ERROR {
        // Internal details stay out of response bodies.
        error!(error = %error, "internal error");
        "internal_error"
    } else {
        error.tag()
    };
    (status, Json(json!({ "error": tag }))).into_response()
}

async fn submit(
    State(engine): State<Arc<Engine>>,
    Json(submission): Json<SubmissionRequest>,
) -> Response {
    match engine.limiter().check_and_consume("submit").await {
        Ok(RateDecision::Allowed) => {}
        Ok(RateDecision::Limited { retry_after_ms }) => {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                [("retry-after", format!("{}", retry_after_ms.div_ceil(1000)))],
                Json(json!({ "error": "rate_limited" })),
            )
                .into_response();
        }
        Err(e) => return error_response(&e),
    }

    match engine.submit(submission) {
        Ok(ack) => (StatusCode::ACCEPTED, Json(ack)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn status(
    State(engine): State<Arc<Engine>>,
    Path(request_id): Path<String>,
) -> Response {
    match engine.get_status(&request_id) {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct BulkStatusBody {
    request_ids: Vec<String>,
}

async fn bulk_status(
    State(engine): State<Arc<Engine>>,
    Json(body): Json<BulkStatusBody>,
) -> Response {
    match engine.bulk_status(&body.request_ids) {
        Ok(bulk) => (StatusCode::OK, Json(bulk)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn history(
    State(engine): State<Arc<Engine>>,
    Path(request_id): Path<String>,
) -> Response {
    match engine.get_history(&request_id) {
        Ok(entries) => (StatusCode::OK, Json(entries)).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn cancel(
    State(engine): State<Arc<Engine>>,
    Path(request_id): Path<String>,
) -> Response {
    match engine.cancel(&request_id) {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "request_id": request_id, "status": "cancelled" })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn results(
    State(engine): State<Arc<Engine>>,
    Path(request_id): Path<String>,
) -> Response {
    match engine.get_results(&request_id) {
        Ok(Some(output)) => (StatusCode::OK, Json(output.output)).into_response(),
        Ok(None) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "request_id": request_id,
                "status": "processing",
                "message": "results not yet available",
            })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::Result;
    use crate::provider::{NormalizedResponse, ProviderClient, ProviderQuery};
    use crate::store::Store;
    use async_trait::async_trait;
    use chrono::Utc;

    struct StubProvider;

    #[async_trait]
    impl ProviderClient for StubProvider {
        async fn query(&self, _query: ProviderQuery) -> Result<NormalizedResponse> {
            Ok(NormalizedResponse {
                provider: "stub".into(),
                model: "mock".into(),
                text: "## Section\nNarrative with 5.1 billion USD and 12% growth.\n\nMore."
                    .into(),
                cited_urls: vec![],
                input_tokens: 10,
                output_tokens: 10,
                latency_ms: 1,
                cost: 0.0,
                timestamp: Utc::now(),
            })
        }

        fn name(&self) -> &str {
            "stub"
        }
    }

    fn engine_with_rpm(max_rpm: u32) -> Arc<Engine> {
        let store = Arc::new(Store::in_memory().unwrap());
        let analysis: Arc<dyn ProviderClient> = Arc::new(StubProvider);
        let config = EngineConfig {
            rate_limit_max_rpm: max_rpm,
            ..EngineConfig::default()
        };
        Engine::assemble(config, store, vec![Arc::new(StubProvider)], analysis, None).unwrap()
    }

    fn submission_body(drug: &str) -> SubmissionRequest {
        SubmissionRequest {
            drug_names: vec![drug.to_string()],
            delivery_method: None,
            categories: None,
            priority: None,
            correlation_id: None,
            callback_url: None,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_submit_returns_202() {
        let engine = engine_with_rpm(0);
        let response = submit(State(engine), Json(submission_body("Apixaban"))).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_submit_validation_returns_400() {
        let engine = engine_with_rpm(0);
        let mut body = submission_body("Apixaban");
        body.drug_names.clear();
        let response = submit(State(engine), Json(body)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rate_limit_returns_429_with_retry_after() {
        let engine = engine_with_rpm(1);
        let first = submit(
            State(Arc::clone(&engine)),
            Json(submission_body("Apixaban")),
        )
        .await;
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        let second = submit(State(engine), Json(submission_body("Rivaroxaban"))).await;
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key("retry-after"));
    }

    #[tokio::test]
    async fn test_unknown_request_returns_404() {
        let engine = engine_with_rpm(0);
        let response = status(State(Arc::clone(&engine)), Path("req_missing".into())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = results(State(engine), Path("req_missing".into())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_results_while_processing_returns_202() {
        let engine = engine_with_rpm(0);
        let ack = engine.submit(submission_body("Apixaban")).unwrap();
        // Immediately after submission the output does not exist yet.
        let response = results(State(Arc::clone(&engine)), Path(ack.request_id.clone())).await;
        assert!(matches!(
            response.status(),
            StatusCode::ACCEPTED | StatusCode::OK
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_terminal_returns_409() {
        let engine = engine_with_rpm(0);
        let ack = engine.submit(submission_body("Apixaban")).unwrap();
        // Wait out processing, then cancel twice.
        for _ in 0..200 {
            let s = engine.get_status(&ack.request_id).unwrap();
            if s.status == "completed" || s.status == "failed" {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let response = cancel(State(engine), Path(ack.request_id)).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bulk_status_limit() {
        let engine = engine_with_rpm(0);
        let body = BulkStatusBody {
            request_ids: (0..101).map(|i| format!("req_{}", i)).collect(),
        };
        let response = bulk_status(State(engine), Json(body)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
