use std::{collections::BTreeMap, path::Path as FsPath, sync::Arc};

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, RETRY_AFTER},
    },
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::{
    config::parse_bool,
    cookies::{CookieReconciler, CookieStatus},
    formats::{FormatsError, FormatsReport, list_formats},
    jobs::{JobState, JobView, MediaKind},
    manager::{JobError, JobManager, JobRequest, validate_url},
    normalizer::NormalizePolicy,
    tools::{CommandRunner, ToolError, ToolPaths, tool_available},
};

const QUEUE_FULL_RETRY_SECONDS: u64 = 30;

#[derive(Clone)]
pub struct AppState {
    pub manager: JobManager,
    pub cookies: CookieReconciler,
    pub runner: Arc<dyn CommandRunner>,
    pub tools: ToolPaths,
    pub formats_timeout: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/healthz", get(health))
        .route("/jobs", post(create_job))
        .route("/jobs/{id}", get(get_job))
        .route("/files/{reference}", get(serve_file))
        .route("/download", get(download))
        .route("/formats", get(fetch_formats))
        .route("/cookies/debug", get(cookies_debug))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_seconds: Option<u64>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
    pub retry_after_seconds: Option<u64>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: Some("INVALID_INPUT"),
            retry_after_seconds: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            code: Some("NOT_FOUND"),
            retry_after_seconds: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: None,
            retry_after_seconds: None,
        }
    }

    fn queue_full(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
            code: Some("QUEUE_FULL"),
            retry_after_seconds: Some(QUEUE_FULL_RETRY_SECONDS),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(error: JobError) -> Self {
        match error {
            JobError::InvalidInput(message) => ApiError::bad_request(message),
            JobError::NotFound => ApiError::not_found(error.to_string()),
            JobError::QueueFull => ApiError::queue_full(error.to_string()),
        }
    }
}

impl From<FormatsError> for ApiError {
    fn from(error: FormatsError) -> Self {
        match error {
            FormatsError::Failed(message) => ApiError::bad_request(message),
            FormatsError::Tool(ToolError::TimedOut { .. }) => {
                ApiError::bad_request(error.to_string())
            }
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
            code: self.code,
            retry_after_seconds: self.retry_after_seconds,
        });

        let mut response = (self.status, body).into_response();
        if let Some(seconds) = self.retry_after_seconds
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }

        response
    }
}

async fn index() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "media-worker",
        "endpoints": [
            "POST /jobs",
            "GET /jobs/{id}",
            "GET /files/{reference}",
            "GET /download?url=...&audio=0|1",
            "GET /formats?url=...",
            "GET /cookies/debug",
            "GET /healthz",
        ],
    }))
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct HealthReport {
    pub ok: bool,
    pub active_jobs: usize,
    pub ffmpeg: bool,
    pub ffprobe: bool,
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    let runner = state.runner.as_ref();
    let (ffmpeg, ffprobe) = tokio::join!(
        tool_available(runner, &state.tools.ffmpeg, "-version"),
        tool_available(runner, &state.tools.ffprobe, "-version"),
    );

    Json(HealthReport {
        ok: true,
        active_jobs: state.manager.active_count().await,
        ffmpeg,
        ffprobe,
    })
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    url: Option<String>,
    media_kind: Option<MediaKind>,
    /// Older spelling of `media_kind: "audio"`.
    audio: Option<bool>,
    normalize: Option<NormalizePolicy>,
    /// Older spelling of `normalize`: `true` is `always`, `false` is
    /// `probe_first`.
    force_transcode: Option<bool>,
    /// Base64 of a Netscape cookie store used for this job only.
    cookies_b64: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_id: String,
    pub status: JobState,
}

async fn create_job(
    State(state): State<AppState>,
    payload: Result<Json<CreateJobRequest>, JsonRejection>,
) -> Result<Json<CreateJobResponse>, ApiError> {
    let Json(payload) =
        payload.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;

    let cookies = decode_uploaded_cookies(payload.cookies_b64.as_deref())?;
    let media_kind = match (payload.media_kind, payload.audio) {
        (Some(kind), _) => kind,
        (None, Some(true)) => MediaKind::Audio,
        (None, _) => MediaKind::Video,
    };
    let normalize = payload.normalize.or(payload.force_transcode.map(|force| {
        if force {
            NormalizePolicy::Always
        } else {
            NormalizePolicy::ProbeFirst
        }
    }));
    let view = state
        .manager
        .create(JobRequest {
            url: payload.url.unwrap_or_default(),
            media_kind,
            normalize,
            cookies,
        })
        .await?;

    Ok(Json(CreateJobResponse {
        job_id: view.job_id,
        status: view.status,
    }))
}

fn decode_uploaded_cookies(encoded: Option<&str>) -> Result<Option<String>, ApiError> {
    let Some(encoded) = encoded.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(None);
    };
    let invalid = || ApiError::bad_request("invalid cookies_b64");

    let bytes = STANDARD.decode(encoded).map_err(|_| invalid())?;
    String::from_utf8(bytes).map(Some).map_err(|_| invalid())
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    Ok(Json(state.manager.get(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    url: Option<String>,
    audio: Option<String>,
}

/// Synchronous variant: runs the job through the same queue and slots, then
/// answers with the finished view.
async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Result<Json<JobView>, ApiError> {
    let audio = query
        .audio
        .as_deref()
        .and_then(parse_bool)
        .unwrap_or(false);
    let view = state
        .manager
        .create_and_wait(JobRequest {
            url: query.url.unwrap_or_default(),
            media_kind: if audio { MediaKind::Audio } else { MediaKind::Video },
            normalize: None,
            cookies: None,
        })
        .await?;
    Ok(Json(view))
}

async fn serve_file(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<Response, ApiError> {
    let not_ready = || ApiError::not_found("file not found or not ready");
    let path = state
        .manager
        .artifact(&reference)
        .await
        .map_err(|_| not_ready())?;

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(error) => {
            warn!("Artifact for {reference} could not be opened: {error}");
            return Err(not_ready());
        }
    };
    let metadata = file
        .metadata()
        .await
        .map_err(|error| ApiError::internal(format!("could not read file metadata: {error}")))?;

    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("download.bin")
        .to_string();

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&filename)),
    );
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::internal("could not build Content-Length"))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("could not build Content-Disposition"))?,
    );

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

#[derive(Debug, Deserialize)]
pub struct FormatsQuery {
    url: Option<String>,
}

async fn fetch_formats(
    State(state): State<AppState>,
    Query(query): Query<FormatsQuery>,
) -> Result<Json<FormatsReport>, ApiError> {
    let url = validate_url(query.url.as_deref().unwrap_or_default())?;

    let reconciler = state.cookies.clone();
    let lookup_url = url.clone();
    let cookies = tokio::task::spawn_blocking(move || reconciler.prepare(&lookup_url))
        .await
        .map_err(|error| ApiError::internal(format!("cookie preparation failed: {error}")))?;

    let report = list_formats(
        state.runner.as_ref(),
        &state.tools.yt_dlp,
        &url,
        cookies.as_ref().map(|bundle| bundle.path()),
        state.formats_timeout,
    )
    .await?;
    Ok(Json(report))
}

async fn cookies_debug(
    State(state): State<AppState>,
) -> Result<Json<BTreeMap<&'static str, CookieStatus>>, ApiError> {
    let reconciler = state.cookies.clone();
    let overview = tokio::task::spawn_blocking(move || reconciler.overview())
        .await
        .map_err(|error| ApiError::internal(format!("cookie overview failed: {error}")))?;
    Ok(Json(overview))
}

fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = FsPath::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() || matches!(character, '.' | '-' | '_') {
                character
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.trim_matches('_').is_empty() {
        "download.bin".to_string()
    } else {
        sanitized
    }
}
