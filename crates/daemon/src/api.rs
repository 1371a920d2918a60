//! HTTP API
//!
//! Maps job-management requests onto the [`JobRegistry`] and serves the
//! manifests and segments the encoders write.

use crate::jobs::Job;
use crate::registry::{JobError, JobRegistry};
use crate::validate::{validate, JobCreateRequest, ValidationError};
use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, Request, State},
    http::{header, HeaderValue, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use livesynth_config::LimitsConfig;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::path::{Component, Path as FsPath, PathBuf};
use thiserror::Error;
use tower_http::catch_panic::CatchPanicLayer;
use tower::ServiceExt;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::error;

/// State shared by all handlers
#[derive(Clone)]
pub struct ApiState {
    pub registry: JobRegistry,
    pub limits: LimitsConfig,
}

/// Errors returned to API clients
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Job(#[from] JobError),

    #[error("Invalid job configuration: {0}")]
    Validation(#[from] ValidationError),

    #[error("Invalid request body: {0}")]
    BadRequest(String),

    #[error("Job {id} is {status}; only completed or failed jobs can be deleted")]
    NotDeletable { id: String, status: String },

    #[error("{0} not found")]
    MediaNotFound(String),

    #[error("Invalid media path: {0}")]
    InvalidPath(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response JSON structure
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub retryable: bool,
}

/// Response to job actions that return no record
#[derive(Debug, Serialize, Deserialize)]
pub struct JobIdResponse {
    pub id: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Job(JobError::NotFound(_)) | ApiError::MediaNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            ApiError::Job(JobError::InvalidState { .. })
            | ApiError::Validation(_)
            | ApiError::BadRequest(_)
            | ApiError::NotDeletable { .. }
            | ApiError::InvalidPath(_) => StatusCode::BAD_REQUEST,
            ApiError::Job(JobError::CapacityExceeded { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Job(JobError::Launch { .. })
            | ApiError::Job(JobError::Termination { .. })
            | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Job(JobError::NotFound(_)) | ApiError::MediaNotFound(_) => "not_found",
            ApiError::Job(JobError::InvalidState { .. }) | ApiError::NotDeletable { .. } => {
                "invalid_state"
            }
            ApiError::Job(JobError::CapacityExceeded { .. }) => "capacity_exceeded",
            ApiError::Job(JobError::Launch { .. }) => "launch_failed",
            ApiError::Job(JobError::Termination { .. }) => "termination_failed",
            ApiError::Validation(_) => "validation_failed",
            ApiError::BadRequest(_) | ApiError::InvalidPath(_) => "bad_request",
            ApiError::Internal(_) => "internal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Job(e) => e.is_retryable(),
            ApiError::Validation(_) => true,
            _ => false,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        let body = Json(ErrorBody {
            error: self.kind().to_string(),
            message: self.to_string(),
            retryable: self.is_retryable(),
        });
        (status, body).into_response()
    }
}

/// Handler for POST /jobs
async fn create_job(
    State(state): State<ApiState>,
    body: Result<Json<JobCreateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let spec = validate(&request, &state.limits, &state.registry.settings().encoder)?;
    let job = state.registry.create(spec).await;
    Ok((StatusCode::CREATED, Json(job)))
}

/// Handler for GET /jobs
async fn list_jobs(State(state): State<ApiState>) -> Json<Vec<Job>> {
    Json(state.registry.list().await)
}

/// Handler for GET /jobs/:job_id
async fn get_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    state
        .registry
        .get(&job_id)
        .await
        .map(Json)
        .ok_or(ApiError::Job(JobError::NotFound(job_id)))
}

/// Handler for PUT /jobs/:job_id/start
async fn start_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobIdResponse>, ApiError> {
    state.registry.start(&job_id).await?;
    Ok(Json(JobIdResponse { id: job_id }))
}

/// Handler for PUT /jobs/:job_id/stop
async fn stop_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobIdResponse>, ApiError> {
    state.registry.stop(&job_id).await?;
    Ok(Json(JobIdResponse { id: job_id }))
}

/// Handler for DELETE /jobs/:job_id
///
/// Only jobs in a terminal status may be deleted.
async fn delete_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobIdResponse>, ApiError> {
    let job = state
        .registry
        .get(&job_id)
        .await
        .ok_or_else(|| ApiError::Job(JobError::NotFound(job_id.clone())))?;
    if !job.is_terminal() {
        return Err(ApiError::NotDeletable {
            id: job_id,
            status: job.status.to_string(),
        });
    }
    state.registry.delete(&job_id).await;
    Ok(Json(JobIdResponse { id: job_id }))
}

/// Handler for GET /media/:job_id/*file
///
/// Files are served by `ServeDir`, so conditional and range requests work
/// for players that fetch partial segments.
async fn serve_media(
    State(state): State<ApiState>,
    Path((job_id, file)): Path<(String, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    if state.registry.get(&job_id).await.is_none() {
        return Err(ApiError::Job(JobError::NotFound(job_id)));
    }
    let relative = sanitize_media_path(&file).ok_or_else(|| ApiError::InvalidPath(file.clone()))?;

    let (mut parts, body) = request.into_parts();
    parts.uri = media_file_uri(&parts.uri).ok_or_else(|| ApiError::InvalidPath(file.clone()))?;
    let request = Request::from_parts(parts, body);

    let response = match ServeDir::new(state.registry.output_dir(&job_id))
        .append_index_html_on_directories(false)
        .oneshot(request)
        .await
    {
        Ok(response) => response,
        Err(never) => match never {},
    };

    match response.status() {
        StatusCode::NOT_FOUND => return Err(ApiError::MediaNotFound(file)),
        StatusCode::INTERNAL_SERVER_ERROR => {
            return Err(ApiError::Internal(format!("reading {}", file)))
        }
        _ => {}
    }

    let success = response.status().is_success();
    let mut response = response.map(Body::new);
    let headers = response.headers_mut();
    if success {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(content_type_for(&relative)),
        );
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    Ok(response)
}

/// `/media/<job>/<file>` rewritten to `/<file>`, keeping its encoding.
fn media_file_uri(uri: &Uri) -> Option<Uri> {
    let (_, file) = uri.path().strip_prefix("/media/")?.split_once('/')?;
    format!("/{}", file).parse().ok()
}

/// Handler for GET /health
async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Relative media path with only normal components, or None.
fn sanitize_media_path(file: &str) -> Option<PathBuf> {
    let path = PathBuf::from(file);
    let valid = path.components().count() > 0
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    valid.then_some(path)
}

/// Content type of a manifest or segment file.
pub fn content_type_for(path: &FsPath) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("mpd") => "application/dash+xml",
        Some("m3u8") => "application/vnd.apple.mpegurl",
        Some("m4s") => "video/iso.segment",
        Some("mp4") => "video/mp4",
        Some("ts") => "video/mp2t",
        _ => "application/octet-stream",
    }
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = detail, "Request handler panicked");
    ApiError::Internal("request handler panicked".to_string()).into_response()
}

/// Creates the axum Router with all API routes
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", get(list_jobs).post(create_job))
        .route("/jobs/:job_id", get(get_job).delete(delete_job))
        .route("/jobs/:job_id/start", put(start_job))
        .route("/jobs/:job_id/stop", put(stop_job))
        .route("/media/:job_id/*file", get(serve_media))
        .with_state(state)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
