//! JSON HTTP surface
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/search` | Run literal queries |
//! | `POST` | `/search/log` | Derive queries from a log and run them |
//! | `GET`  | `/document/{id}` | Fetch one document |
//! | `GET`  | `/session` | Session state snapshot |
//! | `POST` | `/session/invalidate` | Force a fresh session |
//! | `GET`  | `/health` | Liveness and version |
//!
//! Per-query failures are reported in-band next to the query. Request-level
//! failures use the error body
//!
//! ```json
//! { "error": { "code": "invalid_request", "message": "log_text must not be empty" } }
//! ```

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::PortalError;
use crate::service::PortalAgent;
use crate::session::SessionStatus;
use crate::types::{Document, LogSearchReport, SearchReport};

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub queries: Vec<String>,
    #[serde(default)]
    pub max_per_query: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct LogSearchRequest {
    pub log_text: String,
    #[serde(default)]
    pub max_queries: Option<usize>,
    #[serde(default)]
    pub max_per_query: Option<usize>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Request-level failure rendered as `{"error": {...}}`
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl From<PortalError> for AppError {
    fn from(err: PortalError) -> Self {
        let status = match &err {
            PortalError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            PortalError::Authentication(_) => StatusCode::UNAUTHORIZED,
            PortalError::AuthenticationTimeout(_) | PortalError::LeaseTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            PortalError::Derivation(_) | PortalError::Browser(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", err);
        }
        Self {
            status,
            code: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "invalid_request".to_string(),
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, AppError>;

pub fn router(agent: Arc<PortalAgent>) -> Router {
    Router::new()
        .route("/search", post(handle_search))
        .route("/search/log", post(handle_search_log))
        .route("/document/{id}", get(handle_document))
        .route("/session", get(handle_session))
        .route("/session/invalidate", post(handle_invalidate))
        .route("/health", get(handle_health))
        .with_state(agent)
}

/// Serve until `shutdown` is cancelled, then close the browser
pub async fn serve(agent: Arc<PortalAgent>, bind: &str, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    let app = router(agent.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    agent.shutdown().await;
    Ok(())
}

async fn handle_search(
    State(agent): State<Arc<PortalAgent>>,
    body: Result<Json<SearchRequest>, JsonRejection>,
) -> ApiResult<SearchReport> {
    let Json(req) = body?;
    let report = agent.search(req.queries, req.max_per_query).await?;
    Ok(Json(report))
}

async fn handle_search_log(
    State(agent): State<Arc<PortalAgent>>,
    body: Result<Json<LogSearchRequest>, JsonRejection>,
) -> ApiResult<LogSearchReport> {
    let Json(req) = body?;
    let report = agent
        .search_from_log(&req.log_text, req.max_queries, req.max_per_query)
        .await?;
    Ok(Json(report))
}

async fn handle_document(State(agent): State<Arc<PortalAgent>>, Path(id): Path<String>) -> ApiResult<Document> {
    Ok(Json(agent.get_document(&id).await?))
}

async fn handle_session(State(agent): State<Arc<PortalAgent>>) -> Json<SessionStatus> {
    Json(agent.session_status())
}

async fn handle_invalidate(State(agent): State<Arc<PortalAgent>>) -> ApiResult<SessionStatus> {
    agent.invalidate_session().await?;
    Ok(Json(agent.session_status()))
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}
