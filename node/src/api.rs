//! # REST API
//!
//! The axum router in front of the orchestrator. Handlers share state
//! through axum's `State` extractor; every read hands out blocks the caller
//! owns, so a handler may redact them freely.
//!
//! ## Endpoints
//!
//! | Method | Path                     | Description                          |
//! |--------|--------------------------|--------------------------------------|
//! | GET    | `/health`                | Liveness probe                       |
//! | GET    | `/status`                | Ledger state, chain info, tier health |
//! | POST   | `/records`               | Append a record event                |
//! | GET    | `/records/:key`          | Current state of a record            |
//! | GET    | `/records/:key/history`  | Every block for a record             |
//! | GET    | `/blocks/:index`         | Block by index                       |
//! | GET    | `/chain/validate`        | Full integrity pass                  |

use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use deedchain::{Block, ChainInfo, Diagnostic, LedgerError, LedgerState, Orchestrator, TierHealth};

use crate::metrics::NodeMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared by every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub orchestrator: Orchestrator,
    pub metrics: Arc<NodeMetrics>,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/records", post(append_handler))
        .route("/records/:key", get(record_handler))
        .route("/records/:key/history", get(history_handler))
        .route("/blocks/:index", get(block_handler))
        .route("/chain/validate", get(validate_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response Types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub state: LedgerState,
    pub chain: Option<ChainInfo>,
    pub tiers: Vec<TierHealth>,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub key: String,
    pub count: usize,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Serialize)]
pub struct ValidationResponse {
    pub valid: bool,
    pub diagnostics: Vec<Diagnostic>,
}

/// Handler error: a status plus a message for the JSON body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        let status = match &e {
            LedgerError::NotActive(_) | LedgerError::AlreadyStarted(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            LedgerError::LocalStore(_)
            | LedgerError::Snapshot(_)
            | LedgerError::Chain(_)
            | LedgerError::Integrity(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`. Liveness only; ledger health is on `/status`.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let orch = &state.orchestrator;
    Json(StatusResponse {
        version: state.version.clone(),
        state: orch.state(),
        chain: orch.info().ok(),
        tiers: orch.health(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// `POST /records`. The body is the block payload and must be a JSON
/// object. Responds once the block is in the local snapshot.
async fn append_handler(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> ApiResult<(StatusCode, Json<Block>)> {
    if !payload.is_object() {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "record payload must be a JSON object",
        ));
    }

    let started = Instant::now();
    match state.orchestrator.append(payload).await {
        Ok(block) => {
            state
                .metrics
                .append_latency_seconds
                .observe(started.elapsed().as_secs_f64());
            state.metrics.appends_total.inc();
            state.metrics.chain_height.set((block.index + 1) as i64);
            Ok((StatusCode::CREATED, Json(block)))
        }
        Err(e) => {
            state.metrics.append_failures_total.inc();
            tracing::error!(error = %e, "append failed");
            Err(e.into())
        }
    }
}

async fn record_handler(
    Path(key): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Response> {
    match state.orchestrator.current_state(&key)? {
        Some(current) => Ok(Json(current).into_response()),
        None => Err(ApiError::not_found(format!("no record with key {key}"))),
    }
}

async fn history_handler(
    Path(key): Path<String>,
    State(state): State<AppState>,
) -> ApiResult<Json<HistoryResponse>> {
    let blocks = state.orchestrator.history_for_key(&key)?;
    Ok(Json(HistoryResponse {
        key,
        count: blocks.len(),
        blocks,
    }))
}

async fn block_handler(
    Path(index): Path<u64>,
    State(state): State<AppState>,
) -> ApiResult<Json<Block>> {
    state
        .orchestrator
        .get(index)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no block at index {index}")))
}

async fn validate_handler(State(state): State<AppState>) -> ApiResult<Json<ValidationResponse>> {
    let (valid, diagnostics) = state.orchestrator.validate()?;
    if !valid {
        tracing::error!(violations = diagnostics.len(), "chain failed validation");
    }
    Ok(Json(ValidationResponse { valid, diagnostics }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use deedchain::pointer::PointerRegistry;
    use deedchain::tiers::LocalStore;
    use deedchain::{OrchestratorConfig, SnapshotCodec, Tiers};
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;

    struct TestApp {
        _dir: tempfile::TempDir,
        router: Router,
        orchestrator: Orchestrator,
    }

    async fn test_app(restore: bool) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(
            OrchestratorConfig {
                difficulty: 1,
                ..OrchestratorConfig::default()
            },
            SnapshotCodec::from_secret(b"api tests"),
            Tiers::local_only(LocalStore::in_dir(dir.path())),
            PointerRegistry::empty(),
        );
        if restore {
            orchestrator.restore().await.unwrap();
        }
        let state = AppState {
            version: "0.1.0-test".into(),
            orchestrator: orchestrator.clone(),
            metrics: Arc::new(NodeMetrics::new().unwrap()),
        };
        TestApp {
            _dir: dir,
            router: create_router(state),
            orchestrator,
        }
    }

    async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    async fn get(router: &Router, path: &str) -> (StatusCode, Value) {
        send(router, Request::builder().uri(path).body(Body::empty()).unwrap()).await
    }

    async fn post_json(router: &Router, path: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        send(router, req).await
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let app = test_app(true).await;
        let (status, json) = get(&app.router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn status_reports_state_and_chain() {
        let app = test_app(true).await;
        let (status, json) = get(&app.router, "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["state"], "active");
        assert_eq!(json["chain"]["total_blocks"], 1);
        assert_eq!(json["tiers"][0]["tier"], "local");
    }

    #[tokio::test]
    async fn append_then_read_back() {
        let app = test_app(true).await;
        let (status, block) = post_json(
            &app.router,
            "/records",
            json!({"type": "add", "key": "PROP-1", "owner": "Meera"}),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(block["index"], 1);

        let (status, fetched) = get(&app.router, "/blocks/1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["hash"], block["hash"]);

        let (status, record) = get(&app.router, "/records/PROP-1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["fields"]["owner"], "Meera");

        let (status, history) = get(&app.router, "/records/PROP-1/history").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history["count"], 1);

        let (status, report) = get(&app.router, "/chain/validate").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["valid"], true);
        assert_eq!(report["diagnostics"], json!([]));
    }

    #[tokio::test]
    async fn non_object_payload_is_rejected() {
        let app = test_app(true).await;
        let (status, json) = post_json(&app.router, "/records", json!(["not", "an", "object"])).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(json["error"].as_str().unwrap().contains("object"));
        assert_eq!(app.orchestrator.info().unwrap().total_blocks, 1);
    }

    #[tokio::test]
    async fn missing_things_are_404() {
        let app = test_app(true).await;
        assert_eq!(get(&app.router, "/blocks/42").await.0, StatusCode::NOT_FOUND);
        assert_eq!(get(&app.router, "/records/NOPE").await.0, StatusCode::NOT_FOUND);
        let (status, history) = get(&app.router, "/records/NOPE/history").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history["count"], 0);
    }

    #[tokio::test]
    async fn requests_before_restore_are_unavailable() {
        let app = test_app(false).await;
        let (status, json) =
            post_json(&app.router, "/records", json!({"type": "add", "key": "K"})).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(json["error"].as_str().unwrap().contains("uninitialized"));
        assert_eq!(get(&app.router, "/blocks/0").await.0, StatusCode::SERVICE_UNAVAILABLE);

        let (status, json) = get(&app.router, "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["state"], "uninitialized");
        assert!(json["chain"].is_null());
    }

    #[tokio::test]
    async fn returned_blocks_can_be_masked_without_touching_the_ledger() {
        let app = test_app(true).await;
        post_json(
            &app.router,
            "/records",
            json!({"type": "add", "key": "PROP-2", "aadhar_no": "1111-2222-3333"}),
        )
        .await;

        let mut view = app.orchestrator.get(1).unwrap().unwrap();
        view.payload["aadhar_no"] = json!("XXXX-XXXX-3333");

        let (_, fetched) = get(&app.router, "/blocks/1").await;
        assert_eq!(fetched["payload"]["aadhar_no"], "1111-2222-3333");
        let (_, report) = get(&app.router, "/chain/validate").await;
        assert_eq!(report["valid"], true);
    }
}
