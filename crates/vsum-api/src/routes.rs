//! API routes.

use axum::middleware;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::limit::RequestBodyLimitLayer;

use crate::handlers::{cancel_job, get_job, get_my_status, get_queue, health, ready, submit_job};
use crate::metrics::metrics_middleware;
use crate::middleware::{cors_layer, request_id, request_logging, security_headers};
use crate::state::AppState;

/// Create the API router.
pub fn create_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let api_routes = Router::new()
        .route("/jobs", axum::routing::post(submit_job))
        .route("/jobs/status", get(get_my_status))
        .route("/jobs/:job_id", get(get_job).delete(cancel_job))
        .route("/queue", get(get_queue));

    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready));

    let metrics_routes = if let Some(handle) = metrics_handle {
        Router::new().route("/metrics", get(move || async move { handle.render() }))
    } else {
        Router::new()
    };

    Router::new()
        .nest("/api", api_routes)
        .merge(health_routes)
        .merge(metrics_routes)
        .layer(RequestBodyLimitLayer::new(state.config.max_body_size))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(security_headers))
        .layer(middleware::from_fn(request_id))
        .layer(middleware::from_fn(request_logging))
        .layer(cors_layer(&state.config.cors_origins))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use vsum_models::OutputFormat;
    use vsum_queue::{MemoryStore, QueueConfig};
    use vsum_stages::{
        ArtifactRef, DeliverySink, Renderer, ResolvedVideo, Resolver, StageContext, StageResult, StageSet,
        StructuredSummary, Summarizer, VideoMetadata,
    };
    use vsum_worker::{Coordinator, WorkerConfig};

    use crate::config::ApiConfig;

    const VIDEO: &str = "https://youtu.be/dQw4w9WgXcQ";

    struct Echo;

    #[async_trait]
    impl Resolver for Echo {
        async fn resolve(&self, _ctx: &StageContext, reference: &str) -> StageResult<ResolvedVideo> {
            Ok(ResolvedVideo {
                transcript: reference.to_string(),
                metadata: VideoMetadata::default(),
            })
        }
    }

    #[async_trait]
    impl Summarizer for Echo {
        async fn summarize(
            &self,
            _ctx: &StageContext,
            transcript: &str,
            _metadata: &VideoMetadata,
        ) -> StageResult<StructuredSummary> {
            Ok(StructuredSummary {
                overview: transcript.to_string(),
                ..StructuredSummary::default()
            })
        }
    }

    #[async_trait]
    impl Renderer for Echo {
        async fn render(
            &self,
            ctx: &StageContext,
            _summary: &StructuredSummary,
            format: OutputFormat,
        ) -> StageResult<ArtifactRef> {
            Ok(ArtifactRef::new(format!("mem://{}.{}", ctx.job_id, format)))
        }
    }

    #[async_trait]
    impl DeliverySink for Echo {
        async fn deliver(&self, _ctx: &StageContext, _user_id: &str, _artifact: &ArtifactRef) -> StageResult<()> {
            Ok(())
        }
    }

    /// Router over a coordinator whose dispatch loop is not started, so
    /// submitted jobs stay queued.
    fn app(queue: QueueConfig) -> Router {
        let echo = Arc::new(Echo);
        let stages = StageSet {
            resolver: echo.clone(),
            summarizer: echo.clone(),
            renderer: echo.clone(),
            delivery: echo,
        };
        let coordinator =
            Coordinator::builder(queue, WorkerConfig::default(), Arc::new(MemoryStore::new()), stages).build();
        create_router(AppState::new(ApiConfig::default(), coordinator), None)
    }

    fn submit(user: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/api/jobs")
            .header("content-type", "application/json");
        if let Some(user) = user {
            builder = builder.header("X-User-Id", user);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get(uri: &str, user: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("X-User-Id", user)
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = app(QueueConfig::in_memory())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn test_ready_with_memory_store() {
        let response = app(QueueConfig::in_memory())
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["checks"]["store"]["backend"], "memory");
    }

    #[tokio::test]
    async fn test_submit_requires_user_header() {
        let response = app(QueueConfig::in_memory())
            .oneshot(submit(None, json!({ "url": VIDEO })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_submit_rejects_bad_url_and_format() {
        let app = app(QueueConfig::in_memory());

        let response = app
            .clone()
            .oneshot(submit(Some("alice"), json!({ "url": "https://vimeo.com/1234" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(submit(Some("alice"), json!({ "url": VIDEO, "format": "odt" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_submit_status_and_cancel() {
        let app = app(QueueConfig::in_memory());

        let response = app
            .clone()
            .oneshot(submit(Some("alice"), json!({ "url": VIDEO, "format": "pdf" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = json_body(response).await;
        let job_id = body["job_id"].as_str().unwrap().to_string();
        assert_eq!(body["status"]["state"], "queued");
        assert_eq!(body["status"]["position"], 1);

        let response = app.clone().oneshot(get("/api/jobs/status", "alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["job_id"], job_id.as_str());

        // Someone else's job is invisible.
        let response = app
            .clone()
            .oneshot(get(&format!("/api/jobs/{job_id}"), "bob"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::DELETE)
                    .uri(format!("/api/jobs/{job_id}"))
                    .header("X-User-Id", "alice")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["cancelled"], true);

        let response = app.oneshot(get(&format!("/api/jobs/{job_id}"), "alice")).await.unwrap();
        assert_eq!(json_body(response).await["state"], "cancelled");
    }

    #[tokio::test]
    async fn test_rejections_map_to_status_codes() {
        let queue = QueueConfig {
            max_queue_size: 1,
            ..QueueConfig::in_memory()
        };
        let app = app(queue);

        let response = app
            .clone()
            .oneshot(submit(Some("alice"), json!({ "url": VIDEO })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let response = app
            .clone()
            .oneshot(submit(Some("alice"), json!({ "url": VIDEO })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(response).await["code"], "user_busy");

        let response = app
            .oneshot(submit(Some("bob"), json!({ "url": VIDEO })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["code"], "queue_full");
    }

    #[tokio::test]
    async fn test_status_without_jobs_is_not_found() {
        let response = app(QueueConfig::in_memory())
            .oneshot(get("/api/jobs/status", "nobody"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_queue_snapshot() {
        let app = app(QueueConfig::in_memory());
        app.clone()
            .oneshot(submit(Some("alice"), json!({ "url": VIDEO })))
            .await
            .unwrap();

        let response = app.oneshot(get("/api/queue", "alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["queued"], 1);
        assert_eq!(body["capacity"], 100);
        assert_eq!(body["workers"], 2);
    }
}
