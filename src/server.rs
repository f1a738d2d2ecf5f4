//! HTTP intake and query surface.
//!
//! Three endpoints: webhook event intake (the write path), run listing
//! (the read path), and a health probe. Signature verification is assumed
//! to have happened upstream at the gateway; this service trusts the
//! parsed event body.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::artifacts::FsArtifactStore;
use crate::config::SurveyorConfig;
use crate::deeppass::{DockerPlanExecutor, PlanExecutor};
use crate::errors::RunError;
use crate::models::{Run, WebhookEvent};
use crate::orchestrator::Orchestrator;
use crate::reconcile::{CommentSink, GitHubCommentSink};
use crate::store::{RunDb, StoreHandle};

/// How often the background sweep looks for runs stuck past the deadline.
const RECLAIM_SWEEP_SECS: u64 = 300;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: StoreHandle,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::InvalidEvent { detail } => ApiError::BadRequest(detail),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/events", post(post_event))
        .route("/api/runs", get(list_runs))
        .route("/health", get(health_check))
}

pub fn build_router(state: SharedState) -> Router {
    api_router().with_state(state)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

/// Webhook intake. 202 when a new run was admitted, 200 when the delivery
/// collapsed onto an existing run; the body reports which.
async fn post_event(
    State(state): State<SharedState>,
    Json(event): Json<WebhookEvent>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.orchestrator.clone().handle_event(event).await?;
    let status = if outcome.created {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)))
}

#[derive(Deserialize)]
struct RunsQuery {
    repository: Option<String>,
    pr: Option<i64>,
    limit: Option<usize>,
}

async fn list_runs(
    State(state): State<SharedState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<Run>>, ApiError> {
    let filter = match (query.repository, query.pr) {
        (Some(repository), Some(pr)) => Some((repository, pr)),
        (None, None) => None,
        _ => {
            return Err(ApiError::BadRequest(
                "repository and pr must be supplied together".to_string(),
            ));
        }
    };
    let limit = query.limit.unwrap_or(50).min(500);
    let runs = state
        .store
        .call(move |db| db.list_runs(filter, limit))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(runs))
}

// ── Server lifecycle ──────────────────────────────────────────────────

/// Start the surveyor service: store, artifact root, orchestrator wiring,
/// the startup reclaim sweep, and the HTTP listener.
pub async fn start_server(config: SurveyorConfig) -> Result<()> {
    let db = RunDb::new(&config.store.db_path).context("Failed to initialize run store")?;
    let store = StoreHandle::new(db);
    let artifacts = Arc::new(FsArtifactStore::new(config.artifacts.root.clone()));
    let executor: Arc<dyn PlanExecutor> =
        Arc::new(DockerPlanExecutor::new(config.deep_pass.clone()));
    let sink: Option<Arc<dyn CommentSink>> = match GitHubCommentSink::new(&config.github) {
        Ok(sink) => Some(Arc::new(sink)),
        Err(e) => {
            warn!(error = format!("{:#}", e), "Comment posting disabled");
            None
        }
    };

    let orchestrator = Orchestrator::new(config.clone(), store.clone(), artifacts, executor, sink);

    match orchestrator.reclaim_stale_runs().await {
        Ok(0) => {}
        Ok(count) => info!(count, "Reclaimed overdue runs at startup"),
        Err(e) => warn!(error = format!("{:#}", e), "Startup reclaim sweep failed"),
    }
    {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(RECLAIM_SWEEP_SECS));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = orchestrator.reclaim_stale_runs().await {
                    warn!(error = format!("{:#}", e), "Reclaim sweep failed");
                }
            }
        });
    }

    let state = Arc::new(AppState {
        orchestrator: orchestrator.clone(),
        store,
    });
    let mut app = build_router(state);
    if config.server.dev {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.server.dev { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    println!("surveyor running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    orchestrator.shutdown().await;
    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    println!("\nShutting down...");
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::deeppass::{PlanTaskSpec, TaskHandle, TaskPoll};
    use crate::models::AnalysisDepth;

    struct StubExecutor;

    #[async_trait::async_trait]
    impl PlanExecutor for StubExecutor {
        async fn launch(&self, _spec: &PlanTaskSpec) -> anyhow::Result<TaskHandle> {
            anyhow::bail!("no deep runs in these tests")
        }

        async fn poll(&self, _handle: &TaskHandle) -> anyhow::Result<TaskPoll> {
            anyhow::bail!("no deep runs in these tests")
        }

        async fn cancel(&self, _handle: &TaskHandle) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct TestApp {
        router: Router,
        store: StoreHandle,
        _dir: tempfile::TempDir,
    }

    fn test_app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SurveyorConfig::default();
        config.artifacts.root = dir.path().to_path_buf();
        let store = StoreHandle::new(RunDb::new_in_memory().unwrap());
        let artifacts = Arc::new(FsArtifactStore::new(dir.path()));
        let orchestrator = Orchestrator::new(
            config,
            store.clone(),
            artifacts,
            Arc::new(StubExecutor),
            None,
        );
        let state = Arc::new(AppState {
            orchestrator,
            store: store.clone(),
        });
        TestApp {
            router: build_router(state),
            store,
            _dir: dir,
        }
    }

    fn event_body() -> String {
        json!({
            "repository": "acme/payments",
            "pr_number": 42,
            "commit_sha": "aaa111",
            "changed_files_count": 3,
            "additions": 100,
            "labels": []
        })
        .to_string()
    }

    fn post_json(uri: &str, body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = test_app();
        let response = app
            .router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_event_intake_admits_then_collapses() {
        let app = test_app();

        let first = app
            .router
            .clone()
            .oneshot(post_json("/api/events", event_body()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        let body = body_json(first).await;
        assert_eq!(body["created"], json!(true));
        assert_eq!(body["run_type"], json!("fast"));

        let second = app
            .router
            .clone()
            .oneshot(post_json("/api/events", event_body()))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        let body = body_json(second).await;
        assert_eq!(body["created"], json!(false));
    }

    #[tokio::test]
    async fn test_invalid_event_returns_400() {
        let app = test_app();
        let bad = json!({
            "repository": "nopslash",
            "pr_number": 42,
            "commit_sha": "aaa111"
        })
        .to_string();

        let response = app
            .router
            .oneshot(post_json("/api/events", bad))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("repository"));
    }

    #[tokio::test]
    async fn test_non_hex_commit_sha_returns_400() {
        let app = test_app();
        let bad = json!({
            "repository": "acme/payments",
            "pr_number": 42,
            "commit_sha": "aéééééé"
        })
        .to_string();

        let response = app
            .router
            .oneshot(post_json("/api/events", bad))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("commit_sha"));
    }

    #[tokio::test]
    async fn test_list_runs_with_and_without_filter() {
        let app = test_app();
        app.store
            .call(|db| {
                db.create_if_absent(
                    &crate::models::RunIdentity::new("acme/payments", 42, "aaa"),
                    AnalysisDepth::Fast,
                )?;
                db.create_if_absent(
                    &crate::models::RunIdentity::new("acme/billing", 7, "bbb"),
                    AnalysisDepth::Deep,
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let all = app
            .router
            .clone()
            .oneshot(Request::builder().uri("/api/runs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(all.status(), StatusCode::OK);
        assert_eq!(body_json(all).await.as_array().unwrap().len(), 2);

        let filtered = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/runs?repository=acme/payments&pr=42")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let runs = body_json(filtered).await;
        assert_eq!(runs.as_array().unwrap().len(), 1);
        assert_eq!(runs[0]["owner_repo"], json!("acme/payments"));

        let half = app
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/runs?repository=acme/payments")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(half.status(), StatusCode::BAD_REQUEST);
    }
}
