#![forbid(unsafe_code)]

//! Axum API in front of the download service.
//!
//! Handlers stay thin: they validate the request shape, call into
//! `DownloadService` or the stores, and map typed errors onto HTTP statuses.
//! Every error body is `{"error": "..."}`.

use std::{
    net::SocketAddr,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{
        Path as AxumPath, Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use mediadrop::config::{RuntimeOverrides, resolve_runtime_config};
use mediadrop::error::{ToolError, ValidationError};
use mediadrop::jobs::{DownloadRequest, DownloadService, InfoError, SubmitError, Submitted};
use mediadrop::logging;
use mediadrop::media_info::{MediaKind, VideoInfo};
use mediadrop::platform::Platform;
use mediadrop::settings::{Settings, SettingsError, SettingsPatch, SettingsStore};
use mediadrop::store::{
    DEFAULT_PAGE_SIZE, DownloadJob, JobStatus, JobStore, MAX_PAGE_SIZE, open_database,
};
use mime_guess::{MimeGuess, mime::Mime};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncSeekExt},
    signal,
};
use tokio_util::io::ReaderStream;

#[derive(Debug, Clone, Parser)]
#[command(name = "backend", about = "Serve the mediadrop HTTP API")]
struct BackendArgs {
    /// Directory holding the database.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Default download directory (used until the settings override it).
    #[arg(long)]
    download_dir: Option<PathBuf>,
    /// Static front-end to serve for non-API paths.
    #[arg(long)]
    www_root: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Env file to read instead of `./.env`.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            data_dir: self.data_dir,
            download_dir: self.download_dir,
            www_root: self.www_root,
            host: self.host,
            port: self.port,
            env_path: self.env_file,
        }
    }
}

#[derive(Clone)]
struct AppState {
    service: DownloadService,
    www_root: Option<Arc<PathBuf>>,
}

#[derive(Debug)]
struct ApiError {
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

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Store failures are logged in full; clients only get a summary.
    fn store(err: anyhow::Error) -> Self {
        tracing::error!(error = ?err, "store operation failed");
        Self::internal(format!("database error: {err}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        Self::bad_request(err.to_string())
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Invalid(err) => err.into(),
            SubmitError::Store(err) => Self::store(err),
        }
    }
}

impl From<SettingsError> for ApiError {
    fn from(err: SettingsError) -> Self {
        match err {
            SettingsError::Invalid(err) => err.into(),
            SettingsError::Store(err) => Self::store(err),
        }
    }
}

impl From<InfoError> for ApiError {
    fn from(err: InfoError) -> Self {
        match err {
            InfoError::Invalid(err) => err.into(),
            InfoError::Tool(err) => {
                let status = match &err {
                    ToolError::ExternalTool { .. } => StatusCode::BAD_GATEWAY,
                    ToolError::TimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
                    ToolError::Spawn { .. } | ToolError::Parse(_) | ToolError::Io { .. } => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                tracing::warn!(error = %err, %status, "metadata lookup failed");
                Self::new(status, err.to_string())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::new(rejection.status(), rejection.body_text())
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = BackendArgs::parse();
    let config = resolve_runtime_config(args.into_overrides())?;
    logging::init(config.log_level.as_deref());

    let conn = open_database(&config.database_path())
        .await
        .context("initializing database")?;
    let jobs = JobStore::new(conn.clone());
    let interrupted = jobs
        .fail_interrupted()
        .await
        .context("failing interrupted jobs")?;
    if interrupted > 0 {
        tracing::warn!(count = interrupted, "marked downloads from a previous run as failed");
    }

    let settings = SettingsStore::new(conn, Settings::defaults(config.download_dir.clone()));
    let service = DownloadService::new(
        jobs,
        Arc::new(settings),
        config.download_runner(),
        config.info_runner(),
    );
    let state = AppState {
        service: service.clone(),
        www_root: config.www_root.clone().map(Arc::new),
    };

    let addr = SocketAddr::new(config.host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(
        %addr,
        tool = %config.ytdlp,
        downloads = %config.download_dir.display(),
        "API server listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal(service))
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/info", post(video_info))
        .route("/api/download", post(start_download))
        .route("/api/history", get(history).delete(delete_history))
        .route(
            "/api/history/{id}",
            get(get_history_entry).delete(delete_history_entry),
        )
        .route("/api/settings", get(get_settings).put(update_settings))
        .route("/api/files/{id}", get(download_file))
        .fallback(static_fallback)
        .with_state(state)
}

async fn shutdown_signal(service: DownloadService) {
    if let Err(err) = signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to install Ctrl+C handler");
    }
    let active = service.active_jobs();
    if active > 0 {
        tracing::warn!(active, "shutting down with downloads still running");
    } else {
        tracing::info!("shutting down");
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "activeJobs": state.service.active_jobs(),
    }))
}

#[derive(Debug, Deserialize)]
struct InfoRequest {
    url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InfoResponse {
    title: String,
    thumbnail: String,
    duration: u64,
    uploader: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    platform: Platform,
    formats: Vec<InfoFormat>,
}

#[derive(Debug, Serialize)]
struct InfoFormat {
    id: String,
    label: String,
    quality: String,
    #[serde(rename = "type")]
    kind: MediaKind,
}

impl From<VideoInfo> for InfoResponse {
    fn from(info: VideoInfo) -> Self {
        let formats = info
            .formats
            .into_iter()
            .map(|format| InfoFormat {
                label: format.label(),
                id: format.format_id,
                quality: format.quality,
                kind: format.kind,
            })
            .collect();
        Self {
            title: info.title,
            thumbnail: info.thumbnail,
            duration: info.duration,
            uploader: info.uploader,
            description: info.description,
            platform: info.platform,
            formats,
        }
    }
}

async fn video_info(
    State(state): State<AppState>,
    payload: Result<Json<InfoRequest>, JsonRejection>,
) -> ApiResult<Json<InfoResponse>> {
    let Json(payload) = payload?;
    let info = state.service.fetch_info(payload.url.as_deref()).await?;
    Ok(Json(info.into()))
}

async fn start_download(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Submitted>)> {
    let Json(payload) = payload?;
    let submitted = state.service.submit(payload).await?;
    Ok((StatusCode::ACCEPTED, Json(submitted)))
}

#[derive(Debug, Default, Deserialize)]
struct HistoryQuery {
    id: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum HistoryResponse {
    Job(Box<DownloadJob>),
    Page {
        items: Vec<DownloadJob>,
        total: u64,
        limit: u32,
        offset: u32,
    },
}

async fn history(
    State(state): State<AppState>,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> ApiResult<Json<HistoryResponse>> {
    let Query(query) = query?;
    if let Some(id) = query.id.as_deref().filter(|id| !id.trim().is_empty()) {
        let job = find_job(&state, id).await?;
        return Ok(Json(HistoryResponse::Job(Box::new(job))));
    }

    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0);
    let jobs = state.service.jobs();
    let items = jobs.list(limit, offset).await.map_err(ApiError::store)?;
    let total = jobs.count().await.map_err(ApiError::store)?;
    Ok(Json(HistoryResponse::Page {
        items,
        total,
        limit,
        offset,
    }))
}

async fn get_history_entry(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<DownloadJob>> {
    Ok(Json(find_job(&state, &id).await?))
}

async fn find_job(state: &AppState, id: &str) -> ApiResult<DownloadJob> {
    state
        .service
        .jobs()
        .get(id)
        .await
        .map_err(ApiError::store)?
        .ok_or_else(|| ApiError::not_found("download not found"))
}

#[derive(Debug, Default, Deserialize)]
struct DeleteQuery {
    id: Option<String>,
}

async fn delete_history(
    State(state): State<AppState>,
    query: Result<Query<DeleteQuery>, QueryRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let Query(query) = query?;
    let id = query
        .id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("ID is required"))?;
    delete_job(&state, &id).await
}

async fn delete_history_entry(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<serde_json::Value>> {
    delete_job(&state, &id).await
}

async fn delete_job(state: &AppState, id: &str) -> ApiResult<Json<serde_json::Value>> {
    let deleted = state
        .service
        .jobs()
        .delete(id)
        .await
        .map_err(ApiError::store)?;
    if deleted {
        tracing::info!(job_id = %id, "history entry deleted");
    }
    Ok(Json(json!({ "deleted": deleted })))
}

async fn get_settings(State(state): State<AppState>) -> ApiResult<Json<Settings>> {
    let settings = state
        .service
        .settings()
        .get()
        .await
        .map_err(ApiError::store)?;
    Ok(Json(settings))
}

async fn update_settings(
    State(state): State<AppState>,
    payload: Result<Json<SettingsPatch>, JsonRejection>,
) -> ApiResult<Json<Settings>> {
    let Json(patch) = payload?;
    Ok(Json(state.service.settings().update(patch).await?))
}

/// Serves the file of a completed job.
async fn download_file(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let job = find_job(&state, &id).await?;
    let path = match (job.status, job.file_path) {
        (JobStatus::Completed, Some(path)) => PathBuf::from(path),
        _ => return Err(ApiError::not_found("file not available")),
    };

    let mut response = stream_file(path.clone(), None, Some(&headers)).await?;
    if let Some(name) = path.file_name().and_then(|name| name.to_str())
        && let Ok(value) = HeaderValue::from_str(&format!(
            "attachment; filename=\"{}\"",
            name.replace(['"', '\\'], "_")
        ))
    {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }
    let Some(root) = state.www_root.as_deref() else {
        return ApiError::not_found("not found").into_response();
    };

    match serve_www_path(root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    let metadata = tokio::fs::metadata(&target).await;

    match metadata {
        Ok(meta) if meta.is_dir() => {
            let index = root.join("index.html");
            stream_file(index, None, None).await
        }
        Ok(_) => stream_file(target, None, None).await,
        Err(_) => {
            if should_fallback_to_index(request_path) {
                let index = root.join("index.html");
                stream_file(index, None, None).await
            } else {
                Err(ApiError::not_found("file not found"))
            }
        }
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

/// Client-side routes have no extension; asset misses stay 404s.
fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    trimmed.is_empty() || Path::new(trimmed).extension().is_none()
}

fn header_value(value: String) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(&value).map_err(|err| ApiError::internal(err.to_string()))
}

async fn stream_file(
    path: PathBuf,
    mime: Option<Mime>,
    headers: Option<&HeaderMap>,
) -> ApiResult<Response> {
    let mut file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = metadata.len();

    let guessed = mime.or_else(|| MimeGuess::from_path(&path).first());
    let range = headers
        .and_then(|headers| headers.get(header::RANGE))
        .and_then(|value| parse_range_header(value, size));

    let mut response = match range {
        Some((start, _)) if start >= size => {
            let mut response = Response::new(Body::empty());
            *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
            response
                .headers_mut()
                .insert(header::CONTENT_RANGE, header_value(format!("bytes */{size}"))?);
            response
        }
        Some((start, end)) => {
            let end = end.min(size.saturating_sub(1));
            let length = end - start + 1;
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|err| ApiError::internal(err.to_string()))?;
            let body = Body::from_stream(ReaderStream::new(file.take(length)));
            let mut response = body.into_response();
            *response.status_mut() = StatusCode::PARTIAL_CONTENT;
            response.headers_mut().insert(
                header::CONTENT_RANGE,
                header_value(format!("bytes {start}-{end}/{size}"))?,
            );
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            response
        }
        None => {
            let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
            response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(size));
            response
        }
    };

    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(mime) = guessed
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }

    Ok(response)
}

/// Single `bytes=` ranges only, including open-ended and suffix forms.
fn parse_range_header(value: &HeaderValue, size: u64) -> Option<(u64, u64)> {
    let value = value.to_str().ok()?.trim();
    let range = value.strip_prefix("bytes=")?.trim();
    if range.is_empty() || range.contains(',') {
        return None;
    }
    let (start_str, end_str) = range.split_once('-')?;

    if start_str.is_empty() {
        // "-N" means the last N bytes.
        let suffix_len: u64 = end_str.parse().ok()?;
        if suffix_len == 0 {
            return None;
        }
        if suffix_len >= size {
            return Some((0, size.saturating_sub(1)));
        }
        return Some((size - suffix_len, size.saturating_sub(1)));
    }

    let start: u64 = start_str.parse().ok()?;
    let end = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().ok()?
    };
    if end < start {
        return None;
    }
    Some((start, end))
}
