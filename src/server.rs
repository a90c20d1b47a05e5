//! HTTP front end for the file-search proxy.
//!
//! # Endpoints
//!
//! | Method   | Path                 | Description |
//! |----------|----------------------|-------------|
//! | `GET`    | `/`, `/health`       | Health check |
//! | `POST`   | `/stores`            | Create a store |
//! | `GET`    | `/stores`            | List stores |
//! | `DELETE` | `/stores/{storeId}`  | Delete a store (`?force=true` for non-empty) |
//! | `POST`   | `/config`            | Set the active store |
//! | `POST`   | `/upload`            | Multipart upload into the active store |
//! | `POST`   | `/chat`              | Chat against a store |
//! | `GET`    | `/documents`         | List documents in the active store |
//! | `DELETE` | `/documents/{docId}` | Delete a document from the active store |
//! | `GET`    | `/files`             | List Files API files |
//! | `GET`    | `/files/{fileId}`    | Files API file metadata |
//! | `POST`   | `/files/chat`        | Chat over Files API files |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "storeId is required" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `payload_too_large`
//! (413), `rate_limited` (429), `internal` (500), `remote_error` (502).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{
        multipart::MultipartRejection, rejection::JsonRejection, ConnectInfo, DefaultBodyLimit,
        Multipart, Path, Query, Request, State,
    },
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::chat::{normalize_file_name, ChatService};
use crate::config::Config;
use crate::error::{ChatError, PersistenceError, RemoteError, UploadError};
use crate::ledger::Ledger;
use crate::orchestrator::{UploadOrchestrator, UploadedFile};
use crate::rate_limit::RateLimiter;
use crate::remote::{self, RemoteStore};
use crate::staging::{ScratchDir, TempSweeper};
use crate::waiter::OperationWaiter;

const MAX_DISPLAY_NAME_CHARS: usize = 512;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub ledger: Arc<Ledger>,
    pub remote: Arc<dyn RemoteStore>,
    pub scratch: Arc<ScratchDir>,
    orchestrator: Arc<UploadOrchestrator>,
    chat: Arc<ChatService>,
    limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Opens the scratch directory and ledger and wires the services.
    pub async fn build(config: &Config, remote: Arc<dyn RemoteStore>) -> anyhow::Result<Self> {
        let config = Arc::new(config.clone());

        let scratch = Arc::new(
            ScratchDir::open(config.storage.scratch_dir.clone()).with_context(|| {
                format!(
                    "Failed to create scratch directory: {}",
                    config.storage.scratch_dir.display()
                )
            })?,
        );
        let ledger = Arc::new(
            Ledger::load(
                config.storage.state_path.clone(),
                config.upload.persist_policy(),
            )
            .await,
        );

        let waiter = OperationWaiter::new(remote.clone(), config.upload.waiter_settings());
        let orchestrator = Arc::new(UploadOrchestrator::new(
            remote.clone(),
            ledger.clone(),
            scratch.clone(),
            waiter,
        ));
        let chat = Arc::new(ChatService::new(
            remote.clone(),
            config.remote.default_model.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.max_requests,
            config.rate_limit.window_secs,
        ));

        Ok(Self {
            config,
            ledger,
            remote,
            scratch,
            orchestrator,
            chat,
            limiter,
        })
    }
}

/// Starts the proxy with the remote backend named in `[remote].provider`.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let remote = remote::from_config(&config.remote)?;
    run_server_with_remote(config, remote).await
}

/// Starts the proxy against an explicit remote backend.
///
/// Runs the scratch sweeper alongside the HTTP server and stops it after a
/// graceful shutdown (Ctrl-C or SIGTERM).
pub async fn run_server_with_remote(
    config: &Config,
    remote: Arc<dyn RemoteStore>,
) -> anyhow::Result<()> {
    let state = AppState::build(config, remote).await?;

    let sweeper = TempSweeper::new(
        state.scratch.clone(),
        Duration::from_secs(config.sweep.max_age_secs),
        Duration::from_secs(config.sweep.interval_secs),
    )
    .start();

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;
    info!(addr = %config.server.bind, "File search proxy listening");

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    sweeper.stop().await;
    info!("Server stopped");
    served.context("HTTP server failed")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

/// Builds the router with CORS, request tracing, and rate limiting.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let upload_limit = DefaultBodyLimit::max(state.config.upload.body_limit());

    Router::new()
        .route("/", get(handle_health))
        .route("/health", get(handle_health))
        .route("/stores", get(handle_list_stores).post(handle_create_store))
        .route("/stores/{*store_id}", delete(handle_delete_store))
        .route("/config", post(handle_configure))
        .route("/upload", post(handle_upload).layer(upload_limit))
        .route("/chat", post(handle_chat))
        .route("/documents", get(handle_list_documents))
        .route("/documents/{doc_id}", delete(handle_delete_document))
        .route("/files", get(handle_list_files))
        .route("/files/chat", post(handle_files_chat))
        .route("/files/{file_id}", get(handle_get_file))
        .fallback(handle_not_found)
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
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
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
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

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", message)
}

fn payload_too_large(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", message)
}

/// Logs the cause and answers with a generic message.
fn internal(cause: impl std::fmt::Display) -> AppError {
    error!(error = %cause, "Internal error");
    AppError::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal",
        "Internal server error",
    )
}

impl From<RemoteError> for AppError {
    fn from(err: RemoteError) -> Self {
        match &err {
            RemoteError::Status { status: 404, .. } => not_found(err.to_string()),
            RemoteError::Status { status: 429, .. } => {
                AppError::new(StatusCode::BAD_GATEWAY, "remote_error", err.to_string())
            }
            RemoteError::Status { status, .. } if (400u16..500).contains(status) => {
                bad_request(err.to_string())
            }
            RemoteError::Io(_) => internal(&err),
            _ => {
                warn!(error = %err, "Remote call failed");
                AppError::new(StatusCode::BAD_GATEWAY, "remote_error", err.to_string())
            }
        }
    }
}

impl From<ChatError> for AppError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::Validation(message) => bad_request(message),
            ChatError::Remote(e) => e.into(),
        }
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        match err {
            UploadError::Validation(message) => bad_request(message),
            UploadError::RemoteCall(e) => e.into(),
            other => internal(other),
        }
    }
}

impl From<PersistenceError> for AppError {
    fn from(err: PersistenceError) -> Self {
        internal(err)
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

/// Extracts a required, non-blank string field.
fn required(value: Option<String>, field: &str) -> Result<String, AppError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| bad_request(format!("{} is required", field)))
}

async fn active_store(state: &AppState) -> Result<String, AppError> {
    state
        .ledger
        .active_store()
        .await
        .ok_or_else(|| bad_request("No store configured. Call POST /config first."))
}

// ============ Middleware ============

async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());

    if let Some(ip) = client {
        if !state.limiter.check(ip) {
            warn!(client = %ip, "Rate limit exceeded");
            return AppError::new(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "Too many requests, please try again later.",
            )
            .into_response();
        }
    }
    next.run(request).await
}

async fn handle_not_found(request: Request) -> AppError {
    not_found(format!("Endpoint not found: {}", request.uri().path()))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    configured: bool,
    version: &'static str,
    timestamp: String,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        configured: state.ledger.active_store().await.is_some(),
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now().to_rfc3339(),
    })
}

// ============ Stores ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateStoreBody {
    #[serde(default)]
    display_name: Option<String>,
}

async fn handle_create_store(
    State(state): State<AppState>,
    body: Result<Json<CreateStoreBody>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let Json(body) = body?;
    let display_name = required(body.display_name, "displayName")?;
    if display_name.chars().count() > MAX_DISPLAY_NAME_CHARS {
        return Err(bad_request(format!(
            "displayName must be {} characters or less",
            MAX_DISPLAY_NAME_CHARS
        )));
    }

    let store = state.remote.create_store(&display_name).await?;
    info!(store = %store.name, display_name = %display_name, "Store created");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "storeId": store.name,
            "displayName": display_name,
        })),
    ))
}

async fn handle_list_stores(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let stores = state.remote.list_stores().await?;
    Ok(Json(json!({
        "success": true,
        "count": stores.len(),
        "stores": stores,
    })))
}

#[derive(Deserialize)]
struct DeleteStoreQuery {
    #[serde(default)]
    force: Option<String>,
}

async fn handle_delete_store(
    State(state): State<AppState>,
    Path(store_id): Path<String>,
    Query(query): Query<DeleteStoreQuery>,
) -> Result<Json<Value>, AppError> {
    let store_id = store_id.trim_start_matches('/').to_string();
    if store_id.is_empty() {
        return Err(bad_request("storeId is required"));
    }
    let force = query.force.as_deref() == Some("true");

    state.remote.delete_store(&store_id, force).await?;
    let cleared = state.ledger.clear_active_store_if(&store_id).await?;
    info!(store = %store_id, force, cleared_active = cleared, "Store deleted");

    Ok(Json(json!({
        "success": true,
        "message": "Store deleted successfully",
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigBody {
    #[serde(default)]
    store_id: Option<String>,
}

async fn handle_configure(
    State(state): State<AppState>,
    body: Result<Json<ConfigBody>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(body) = body?;
    let store_id = required(body.store_id, "storeId")?;

    state.remote.get_store(&store_id).await?;
    state.ledger.set_active_store(&store_id).await?;
    info!(store = %store_id, "Active store configured");

    Ok(Json(json!({
        "success": true,
        "message": "Store configured successfully",
        "storeId": store_id,
    })))
}

// ============ POST /upload ============

async fn handle_upload(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Value>, AppError> {
    let store_id = active_store(&state).await?;
    let multipart = multipart.map_err(|e| bad_request(e.body_text()))?;

    let files = read_files(multipart, &state.config.upload).await?;
    if files.is_empty() {
        return Err(bad_request("No files provided"));
    }
    info!(
        count = files.len(),
        total_size = files.iter().map(|f| f.bytes.len()).sum::<usize>(),
        "Files received"
    );

    // Detached from the request: a client disconnect must not drop an
    // accepted upload before its ledger commit.
    let orchestrator = state.orchestrator.clone();
    let result = tokio::spawn(async move { orchestrator.ingest(&store_id, files).await })
        .await
        .map_err(internal)??;
    Ok(Json(json!({
        "success": true,
        "summary": result.summary,
        "results": result.results,
    })))
}

/// Reads every file part, enforcing the per-file size and file count limits.
async fn read_files(
    mut multipart: Multipart,
    limits: &crate::config::UploadConfig,
) -> Result<Vec<UploadedFile>, AppError> {
    let mut files = Vec::new();

    while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
        let Some(filename) = field.file_name().map(String::from) else {
            continue;
        };
        if files.len() == limits.max_files_per_request {
            return Err(bad_request(format!(
                "Too many files: at most {} per request",
                limits.max_files_per_request
            )));
        }
        let mime_type = field.content_type().map(String::from);

        let mut bytes = Vec::new();
        while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
            if bytes.len() + chunk.len() > limits.max_file_size {
                return Err(payload_too_large(format!(
                    "{} exceeds the {} byte file size limit",
                    filename, limits.max_file_size
                )));
            }
            bytes.extend_from_slice(&chunk);
        }

        files.push(UploadedFile {
            filename: if filename.trim().is_empty() {
                "unnamed".to_string()
            } else {
                filename
            },
            mime_type,
            bytes,
        });
    }

    Ok(files)
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        payload_too_large(err.body_text())
    } else {
        bad_request(err.body_text())
    }
}

// ============ Chat ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatBody {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    store_id: Option<String>,
    #[serde(default)]
    metadata_filter: Option<String>,
}

async fn handle_chat(
    State(state): State<AppState>,
    body: Result<Json<ChatBody>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(body) = body?;
    let prompt = body.prompt.unwrap_or_default();
    crate::chat::validate_prompt(&prompt)?;

    let store_id = match body.store_id.filter(|s| !s.trim().is_empty()) {
        Some(store_id) => store_id,
        None => state.ledger.active_store().await.ok_or_else(|| {
            bad_request("No store configured. Call POST /config first or provide storeId.")
        })?,
    };

    let answer = state
        .chat
        .ask_store(
            &store_id,
            &prompt,
            body.model.as_deref(),
            body.metadata_filter.as_deref(),
        )
        .await?;

    Ok(Json(json!({
        "success": true,
        "model": answer.model,
        "storeId": answer.store_id,
        "answer": answer.answer,
        "grounding": answer.grounding,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilesChatBody {
    #[serde(default)]
    file_id: Option<String>,
    #[serde(default)]
    file_ids: Option<Vec<String>>,
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

async fn handle_files_chat(
    State(state): State<AppState>,
    body: Result<Json<FilesChatBody>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(body) = body?;
    let ids = match (body.file_ids, body.file_id) {
        (Some(ids), _) => ids,
        (None, Some(id)) => vec![id],
        (None, None) => Vec::new(),
    };
    let prompt = body.prompt.unwrap_or_default();

    let answer = state
        .chat
        .ask_files(&ids, &prompt, body.model.as_deref())
        .await?;

    Ok(Json(json!({
        "success": true,
        "model": answer.model,
        "files": answer.files,
        "answer": answer.answer,
    })))
}

// ============ Documents ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentView {
    id: String,
    display_name: Option<String>,
    state: String,
    create_time: Option<String>,
}

async fn handle_list_documents(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let store_id = active_store(&state).await?;
    let documents: Vec<DocumentView> = state
        .remote
        .list_documents(&store_id)
        .await?
        .into_iter()
        .map(|d| DocumentView {
            id: d.name,
            display_name: d.display_name,
            state: d.state.unwrap_or_else(|| "UNKNOWN".to_string()),
            create_time: d.create_time,
        })
        .collect();

    Ok(Json(json!({
        "success": true,
        "count": documents.len(),
        "documents": documents,
    })))
}

async fn handle_delete_document(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let store_id = active_store(&state).await?;
    state.remote.delete_document(&store_id, &doc_id).await?;
    info!(store = %store_id, document = %doc_id, "Document deleted");

    Ok(Json(json!({
        "success": true,
        "message": "Document deleted successfully",
    })))
}

// ============ Files API ============

async fn handle_list_files(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let files = state.remote.list_files().await?;
    Ok(Json(json!({
        "success": true,
        "count": files.len(),
        "files": files,
    })))
}

async fn handle_get_file(
    State(state): State<AppState>,
    Path(file_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let name = normalize_file_name(&file_id).ok_or_else(|| {
        bad_request("fileId must be a Files API id like files/abc-123 (store document ids are not supported here)")
    })?;
    let file = state.remote.get_file(&name).await?;

    Ok(Json(json!({
        "success": true,
        "file": file,
    })))
}
