//! HTTP server.
//!
//! Serves the JSON API under `/api` and falls back to static files from the
//! configured directory for every other path.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/api/health` | Capability flags and version |
//! | `POST` | `/api/chat` | Knowledge-base augmented chat completion |
//! | `POST` | `/api/upload` | Multipart upload (field `files`) to blob storage |
//! | `GET`  | `/api/blobs` | List blobs (`prefix`, `limit`) |
//! | `GET`  | `/api/blobs/{*name}` | Stream one blob |
//! | `POST` | `/api/agent` | Run a prompt on the hosted agent |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "messages must be an array" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `not_configured` (500),
//! `agent_run_failed` (500, with `detail`), `timeout` (504), `internal` (500).
//!
//! Non-success replies from the model endpoint are the exception: `/api/chat`
//! returns the upstream status and JSON body unchanged.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted. The knowledge-base
//! headers are exposed so browser clients can read them.
//!
//! # Static files
//!
//! Any path with a segment starting with `.` answers 404 before the file
//! system is consulted, so dotfiles such as `.env` are never served.

use axum::{
    body::Body,
    extract::{
        rejection::JsonRejection, DefaultBodyLimit, Multipart, Path, Query, Request, State,
    },
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::agent::{extract_prompt, run_agent, AgentOutcome, PollPolicy};
use crate::blobs::{list_blobs, resolve_limit, upload_many, PendingUpload};
use crate::chat::{run_chat, ChatOutcome};
use crate::config::Config;
use crate::error::GatewayError;
use crate::traits::Services;

const KB_USED_HEADER: HeaderName = HeaderName::from_static("x-knowledge-base-used");
const KB_DOC_COUNT_HEADER: HeaderName = HeaderName::from_static("x-knowledge-base-doc-count");

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    services: Services,
}

impl AppState {
    pub fn new(config: Config, services: Services) -> Self {
        Self {
            config: Arc::new(config),
            services,
        }
    }
}

/// Starts the HTTP server with the Azure adapters described by `config`.
///
/// Runs until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let services = Services::from_config(config)?;
    run_server_with_services(config.clone(), services).await
}

/// Starts the HTTP server with caller-supplied adapters.
///
/// Used by [`run_server`] and by embedders that provide their own
/// [`Services`] (for example, a different search backend).
pub async fn run_server_with_services(config: Config, services: Services) -> anyhow::Result<()> {
    let addr = config.server.address();
    let caps = config.capabilities();
    info!(
        model = caps.endpoint && caps.key,
        search = caps.search,
        blob = caps.blob,
        agent = caps.agent,
        static_dir = %config.server.static_dir.display(),
        "capabilities"
    );

    let app = build_router(AppState::new(config, services));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Build the full router: API routes, static fallback, tracing and CORS.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([KB_USED_HEADER, KB_DOC_COUNT_HEADER]);

    let upload_limit = DefaultBodyLimit::max(state.config.server.max_upload_bytes);
    let static_files = Router::new()
        .fallback_service(ServeDir::new(&state.config.server.static_dir))
        .layer(middleware::from_fn(reject_hidden_paths));

    Router::new()
        .route("/api/health", get(handle_health))
        .route("/api/chat", post(handle_chat))
        .route("/api/upload", post(handle_upload).layer(upload_limit))
        .route("/api/blobs", get(handle_list_blobs))
        .route("/api/blobs/{*name}", get(handle_download))
        .route("/api/agent", post(handle_agent))
        .fallback_service(static_files)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// True when any segment of `path` names a dotfile or dot-directory,
/// including percent-encoded leading dots.
fn is_hidden_path(path: &str) -> bool {
    path.split('/').any(|segment| {
        segment.starts_with('.')
            || segment
                .get(..3)
                .is_some_and(|head| head.eq_ignore_ascii_case("%2e"))
    })
}

async fn reject_hidden_paths(req: Request, next: Next) -> Response {
    if is_hidden_path(req.uri().path()) {
        return StatusCode::NOT_FOUND.into_response();
    }
    next.run(req).await
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<Value>,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
    detail: Option<Value>,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            detail: None,
        }
    }

    fn with_detail(mut self, detail: Option<Value>) -> Self {
        self.detail = detail;
        self
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                detail: self.detail,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", message)
}

fn not_configured(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "not_configured", message)
}

fn internal(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
}

fn timeout_error(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::GATEWAY_TIMEOUT, "timeout", message)
}

/// Map an adapter failure to a response. Upstream details are logged, never
/// returned to the client.
fn classify_gateway_error(action: &str, err: GatewayError) -> AppError {
    match err {
        GatewayError::NotFound(what) => not_found(format!("{} not found", what)),
        other => {
            error!(error = %other, "{} failed", action);
            internal(format!("{} failed", action))
        }
    }
}

const BLOB_NOT_CONFIGURED: &str = "Blob storage is not configured";

// ============ GET /api/health ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    ok: bool,
    endpoint_configured: bool,
    key_configured: bool,
    blob_configured: bool,
    search_configured: bool,
    agent_configured: bool,
    version: &'static str,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let caps = state.config.capabilities();
    Json(HealthResponse {
        ok: true,
        endpoint_configured: caps.endpoint,
        key_configured: caps.key,
        blob_configured: caps.blob,
        search_configured: caps.search,
        agent_configured: caps.agent,
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ POST /api/chat ============

/// Handler for `POST /api/chat`.
///
/// Validates `messages` before checking configuration, so a malformed request
/// is a 400 even on an unconfigured server.
async fn handle_chat(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Response, AppError> {
    let messages = match payload {
        Ok(Json(mut body)) => match body.get_mut("messages").map(Value::take) {
            Some(Value::Array(messages)) => messages,
            _ => return Err(bad_request("messages must be an array")),
        },
        Err(_) => return Err(bad_request("messages must be an array")),
    };

    let Some(model) = state.services.model.as_deref() else {
        return Err(not_configured("Missing Azure OpenAI configuration"));
    };

    let outcome = run_chat(
        model,
        state.services.search.as_deref(),
        messages,
        state.config.model.max_tokens,
    )
    .await
    .map_err(|e| {
        error!(error = %e, "chat completion failed");
        internal("Server error")
    })?;

    match outcome {
        ChatOutcome::Completed { body, meta } => {
            let used = if meta.kb_used { "true" } else { "false" };
            let headers = [
                (KB_USED_HEADER, HeaderValue::from_static(used)),
                (KB_DOC_COUNT_HEADER, HeaderValue::from(meta.kb_doc_count)),
            ];
            Ok((headers, Json(body)).into_response())
        }
        ChatOutcome::Rejected { status, body } => {
            warn!(status, "model endpoint rejected the request");
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            Ok((status, Json(body)).into_response())
        }
    }
}

// ============ POST /api/upload ============

#[derive(Serialize)]
struct UploadResponse {
    uploaded: usize,
    files: Vec<crate::models::UploadResult>,
}

/// Handler for `POST /api/upload`.
///
/// Every part named `files` is stored; other parts are ignored.
async fn handle_upload(
    State(state): State<AppState>,
    multipart: Result<Multipart, axum::extract::multipart::MultipartRejection>,
) -> Result<Json<UploadResponse>, AppError> {
    let Some(store) = state.services.blobs.as_deref() else {
        return Err(not_configured(BLOB_NOT_CONFIGURED));
    };
    let mut multipart = multipart.map_err(|e| bad_request(e.body_text()))?;

    let mut pending = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(e.body_text()))?
    {
        if field.name() != Some("files") {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().to_string();
        let content_type = field.content_type().map(str::to_string);
        let data = field.bytes().await.map_err(|e| bad_request(e.body_text()))?;
        pending.push(PendingUpload {
            file_name,
            content_type,
            data: data.to_vec(),
        });
    }

    let files = upload_many(store, pending)
        .await
        .map_err(|e| classify_gateway_error("Upload", e))?;

    Ok(Json(UploadResponse {
        uploaded: files.len(),
        files,
    }))
}

// ============ GET /api/blobs ============

#[derive(Deserialize)]
struct ListParams {
    prefix: Option<String>,
    limit: Option<String>,
}

async fn handle_list_blobs(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Response, AppError> {
    let Some(store) = state.services.blobs.as_deref() else {
        return Err(not_configured(BLOB_NOT_CONFIGURED));
    };
    let prefix = params.prefix.unwrap_or_default();
    let limit = resolve_limit(params.limit.as_deref());

    let listing = list_blobs(store, &prefix, limit)
        .await
        .map_err(|e| classify_gateway_error("List blobs", e))?;
    Ok(Json(listing).into_response())
}

// ============ GET /api/blobs/{*name} ============

/// Handler for `GET /api/blobs/{*name}`.
///
/// The blob's existence is confirmed before the response starts, so a
/// missing blob is always a clean 404.
async fn handle_download(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, AppError> {
    let Some(store) = state.services.blobs.as_deref() else {
        return Err(not_configured(BLOB_NOT_CONFIGURED));
    };

    let download = store
        .open(&name)
        .await
        .map_err(|e| classify_gateway_error("Download", e))?;

    let mut headers = HeaderMap::new();
    let content_type = download
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    if let Some(len) = download.content_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }

    Ok((headers, Body::from_stream(download.body)).into_response())
}

// ============ POST /api/agent ============

/// Handler for `POST /api/agent`.
///
/// The prompt is read from `prompt`, `message` or `text`, in that order.
async fn handle_agent(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let body = payload.map(|Json(v)| v).unwrap_or(Value::Null);
    let Some(prompt) = extract_prompt(&body) else {
        return Err(bad_request("prompt is required"));
    };

    let Some(agent) = state.services.agent.as_deref() else {
        return Err(not_configured("Agent is not configured"));
    };

    let policy = PollPolicy::from_config(&state.config.poll);
    let outcome = run_agent(agent, &prompt, &policy)
        .await
        .map_err(|e| classify_gateway_error("Agent run", e))?;

    match outcome {
        AgentOutcome::Finished { status, transcript } => Ok(Json(json!({
            "status": status,
            "messages": transcript,
        }))),
        AgentOutcome::Failed { last_error } => Err(AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "agent_run_failed",
            "Agent run failed",
        )
        .with_detail(last_error)),
        AgentOutcome::TimedOut { run_id, waited } => Err(timeout_error(format!(
            "Agent run {} did not finish within {}s",
            run_id,
            waited.as_secs()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn error_json(err: AppError) -> (StatusCode, Value) {
        let resp = err.into_response();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn error_body_omits_absent_detail() {
        let (status, body) = error_json(bad_request("prompt is required")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body,
            json!({"error": {"code": "bad_request", "message": "prompt is required"}})
        );
    }

    #[tokio::test]
    async fn error_body_carries_detail() {
        let err = AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "agent_run_failed",
            "Agent run failed",
        )
        .with_detail(Some(json!({"code": "server_error"})));
        let (_, body) = error_json(err).await;
        assert_eq!(body["error"]["detail"]["code"], "server_error");
    }

    #[tokio::test]
    async fn gateway_errors_hide_upstream_body() {
        let err = classify_gateway_error(
            "Download",
            GatewayError::Upstream {
                status: 403,
                body: "<AuthenticationFailed>signature mismatch".into(),
            },
        );
        let (status, body) = error_json(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["code"], "internal");
        assert!(!body.to_string().contains("signature"));
    }

    #[tokio::test]
    async fn missing_blob_is_not_found() {
        let err = classify_gateway_error("Download", GatewayError::NotFound("blob 'x'".into()));
        let (status, body) = error_json(err).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "not_found");
    }

    #[test]
    fn dot_segments_are_hidden() {
        assert!(is_hidden_path("/.env"));
        assert!(is_hidden_path("/.git/config"));
        assert!(is_hidden_path("/assets/.secret/key.pem"));
        assert!(is_hidden_path("/%2Eenv"));
        assert!(is_hidden_path("/%2e%2e/etc/passwd"));
        assert!(!is_hidden_path("/"));
        assert!(!is_hidden_path("/index.html"));
        assert!(!is_hidden_path("/js/app.min.js"));
    }
}
