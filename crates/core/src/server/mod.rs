use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::downloads::{DownloadTask, StartOutcome};
use crate::jobs::{Job, SubmitResponse};
use crate::models::ModelInfo;
use crate::params::GenerationRequest;
use crate::services::Services;
use crate::storage::VideoRecord;
use crate::video::assembler::THUMBNAIL_FILE;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<Services>,
}

impl AppState {
    pub fn new(services: Services) -> Self {
        Self {
            inner: Arc::new(services),
        }
    }

    pub fn services(&self) -> &Services {
        &self.inner
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
    pub version: String,
    pub timestamp: f64,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Deserialize)]
pub struct ModelQuery {
    #[serde(alias = "repo_id")]
    pub model_id: String,
}

#[derive(Deserialize)]
pub struct DownloadRequest {
    #[serde(alias = "repo_id")]
    pub model_id: String,
    #[serde(default, alias = "hf_token")]
    pub token: Option<String>,
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/generate", post(generate))
        .route("/status/{job_id}", get(job_status))
        .route("/videos", get(list_videos))
        .route("/videos/{id}", get(get_video).delete(delete_video))
        .route("/videos/{id}/output.mp4", get(serve_container))
        .route("/videos/{id}/thumbnail.jpg", get(serve_thumbnail))
        .route("/models/local/status", get(local_model_status))
        .route(
            "/models/local/download",
            post(start_download).get(download_by_model),
        )
        .route("/models/local/download/{download_id}", get(download_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    Json(HealthResponse {
        status: "healthy".to_string(),
        message: "reelforge is running".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp,
    })
}

async fn generate(
    State(state): State<AppState>,
    Json(request): Json<GenerationRequest>,
) -> Result<Json<SubmitResponse>, AppError> {
    let jobs = state.services().jobs.clone();
    if request.has_prompt() {
        if let Some(problem) = jobs.credential_problem(&request) {
            return Err(AppError::BadRequest(problem.to_string()));
        }
    }
    let response = blocking(move || Ok(jobs.submit(request))).await?;
    Ok(Json(response))
}

async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, AppError> {
    state
        .services()
        .jobs
        .get_status(&job_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Job not found".to_string()))
}

async fn list_videos(State(state): State<AppState>) -> Result<Json<Vec<VideoRecord>>, AppError> {
    let videos = state.services().videos.clone();
    Ok(Json(blocking(move || videos.list_present()).await?))
}

async fn get_video(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<VideoRecord>, AppError> {
    let videos = state.services().videos.clone();
    blocking(move || videos.get(&id))
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Video not found".to_string()))
}

async fn delete_video(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let videos = state.services().videos.clone();
    let target = id.clone();
    if !blocking(move || videos.delete(&target)).await? {
        return Err(AppError::NotFound("Video not found".to_string()));
    }
    info!(video_id = %id, "video deleted via API");
    Ok(Json(serde_json::json!({ "deleted": id })))
}

async fn serve_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let videos = state.services().videos.clone();
    let lookup = id.clone();
    let path = blocking(move || {
        if videos.get(&lookup)?.is_none() {
            return Ok(None);
        }
        videos.ensure_container(&lookup).map(Some)
    })
    .await
    .map_err(|e| {
        warn!(video_id = %id, error = ?e, "container unavailable");
        AppError::NotFound("Video file unavailable".to_string())
    })?
    .ok_or_else(|| AppError::NotFound("Video not found".to_string()))?;

    file_response(path, "video/mp4", &format!("video_{id}.mp4")).await
}

async fn serve_thumbnail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let videos = state.services().videos.clone();
    let lookup = id.clone();
    let path = blocking(move || {
        if videos.get(&lookup)?.is_none() {
            return Ok(None);
        }
        let existing = videos.video_dir(&lookup).join(THUMBNAIL_FILE);
        if existing.is_file() {
            return Ok(Some(existing));
        }
        videos.ensure_thumbnail(&lookup).map(Some)
    })
    .await?
    .ok_or_else(|| AppError::NotFound("Video not found".to_string()))?;

    file_response(path, "image/jpeg", &format!("thumbnail_{id}.jpg")).await
}

async fn file_response(path: PathBuf, content_type: &'static str, filename: &str) -> Result<Response, AppError> {
    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        warn!(path = %path.display(), error = %e, "failed to read artifact");
        AppError::NotFound(format!("{filename} unavailable"))
    })?;
    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("inline; filename=\"{filename}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

async fn local_model_status(
    State(state): State<AppState>,
    Query(query): Query<ModelQuery>,
) -> Result<Json<ModelInfo>, AppError> {
    let model_id = query.model_id.trim().to_string();
    if model_id.is_empty() {
        return Err(AppError::BadRequest("model_id is required".to_string()));
    }
    let models = state.services().models.clone();
    Ok(Json(blocking(move || Ok(models.model_info(&model_id))).await?))
}

async fn start_download(
    State(state): State<AppState>,
    Json(request): Json<DownloadRequest>,
) -> Result<Json<StartOutcome>, AppError> {
    if request.model_id.trim().is_empty() {
        return Err(AppError::BadRequest("model_id is required".to_string()));
    }
    let token = request.token.filter(|token| !token.trim().is_empty());
    let outcome = state
        .services()
        .downloads
        .start(&request.model_id, token)
        .map_err(|e| AppError::Internal(format!("Download failed: {e:#}")))?;
    Ok(Json(outcome))
}

async fn download_status(
    State(state): State<AppState>,
    Path(download_id): Path<String>,
) -> Result<Json<DownloadTask>, AppError> {
    state
        .services()
        .downloads
        .get(&download_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Download not found".to_string()))
}

async fn download_by_model(
    State(state): State<AppState>,
    Query(query): Query<ModelQuery>,
) -> Result<Json<DownloadTask>, AppError> {
    state
        .services()
        .downloads
        .get_by_model(query.model_id.trim())
        .map(Json)
        .ok_or_else(|| AppError::NotFound("No download for this model".to_string()))
}

/// Runs synchronous store work off the async executor.
async fn blocking<T, F>(f: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Internal(format!("blocking task failed: {e}")))?
        .map_err(AppError::from)
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_support::{Behavior, ScriptedBackend};
    use crate::backends::{BackendKind, BackendSet};
    use crate::downloads::{DownloadStatus, DownloadTracker, SnapshotFetcher};
    use crate::jobs::JobManager;
    use crate::models::{ModelStore, COMPLETION_MARKER};
    use crate::storage::VideoStore;
    use crate::video::test_support::MemoryCodec;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    struct MarkerFetcher;

    impl SnapshotFetcher for MarkerFetcher {
        fn fetch(&self, _model_id: &str, _token: Option<&str>, dest: &std::path::Path) -> anyhow::Result<()> {
            std::fs::create_dir_all(dest)?;
            std::fs::write(dest.join("weights.onnx"), b"onnx")?;
            std::fs::write(dest.join(COMPLETION_MARKER), b"{}")?;
            Ok(())
        }
    }

    fn test_state(temp: &std::path::Path) -> AppState {
        let videos = VideoStore::open(&temp.join("videos"), Arc::new(MemoryCodec)).expect("store");
        let models = ModelStore::new(temp.join("models"));
        let backends = BackendSet {
            local: ScriptedBackend::new(BackendKind::Local, Behavior::Fail("not downloaded")),
            cloud: ScriptedBackend::new(BackendKind::Cloud, Behavior::Fail("offline")),
            placeholder: ScriptedBackend::new(BackendKind::Placeholder, Behavior::Frames(3)),
        };
        AppState::new(Services {
            data_dir: temp.to_path_buf(),
            jobs: JobManager::new(videos.clone(), backends, None),
            downloads: DownloadTracker::new(
                models.clone(),
                Arc::new(MarkerFetcher),
                Duration::from_millis(5),
            ),
            videos,
            models,
        })
    }

    async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, Vec<u8>, Option<String>) {
        let response = app_router(state.clone())
            .oneshot(request)
            .await
            .expect("router response");
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, body.to_vec(), content_type)
    }

    async fn get_json(state: &AppState, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder().uri(uri).body(Body::empty()).expect("request");
        let (status, body, _) = send(state, request).await;
        (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
    }

    async fn post_json(state: &AppState, uri: &str, payload: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(payload.to_string()))
            .expect("request");
        let (status, body, _) = send(state, request).await;
        (status, serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null))
    }

    async fn wait_for_job(state: &AppState, job_id: &str) -> serde_json::Value {
        for _ in 0..400 {
            let (status, job) = get_json(state, &format!("/status/{job_id}")).await;
            assert_eq!(status, StatusCode::OK);
            if job["status"] == "completed" || job["status"] == "failed" {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} did not finish");
    }

    #[tokio::test]
    async fn test_health_reports_healthy() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (status, body) = get_json(&test_state(temp.path()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_cloud_generation_without_token_is_bad_request() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = test_state(temp.path());
        let (status, body) = post_json(&state, "/generate", serde_json::json!({"prompt": "sea", "use_cloud": true})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Hugging Face token required for cloud generation");
    }

    #[tokio::test]
    async fn test_empty_prompt_is_reported_before_missing_token() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = test_state(temp.path());
        let (status, body) =
            post_json(&state, "/generate", serde_json::json!({"prompt": "  ", "use_cloud": true})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "failed");
        assert_eq!(body["error"], "Empty prompt");
        assert!(body.get("video_id").map_or(true, serde_json::Value::is_null));
    }

    #[tokio::test]
    async fn test_generated_video_is_listed_and_served() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = test_state(temp.path());
        let (status, submitted) = post_json(
            &state,
            "/generate",
            serde_json::json!({"prompt": "ocean sunrise", "num_frames": 3, "width": 64, "height": 64, "use_hf_api": false}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(submitted["status"], "pending");
        let job_id = submitted["job_id"].as_str().expect("job id").to_string();
        let video_id = submitted["video_id"].as_str().expect("video id").to_string();

        let job = wait_for_job(&state, &job_id).await;
        assert_eq!(job["status"], "completed", "{job}");
        assert_eq!(job["progress"], 100);

        let (_, listed) = get_json(&state, "/videos").await;
        assert_eq!(listed.as_array().expect("array").len(), 1);
        assert_eq!(listed[0]["frame_count"], 3);

        let request = Request::builder()
            .uri(format!("/videos/{video_id}/output.mp4"))
            .body(Body::empty())
            .expect("request");
        let (status, body, content_type) = send(&state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("video/mp4"));
        assert!(!body.is_empty());

        let request = Request::builder()
            .uri(format!("/videos/{video_id}/thumbnail.jpg"))
            .body(Body::empty())
            .expect("request");
        let (status, _, content_type) = send(&state, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("image/jpeg"));
    }

    #[tokio::test]
    async fn test_missing_local_model_job_fails_with_local_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = test_state(temp.path());
        let (_, submitted) = post_json(
            &state,
            "/generate",
            serde_json::json!({"prompt": "forest", "use_cloud": false, "local_model_key": "zeroscope-local"}),
        )
        .await;
        let job = wait_for_job(&state, submitted["job_id"].as_str().expect("job id")).await;
        assert_eq!(job["status"], "failed");
        assert_eq!(job["error"], "not downloaded");
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = test_state(temp.path());
        assert_eq!(get_json(&state, "/status/missing").await.0, StatusCode::NOT_FOUND);
        assert_eq!(get_json(&state, "/videos/missing").await.0, StatusCode::NOT_FOUND);
        assert_eq!(get_json(&state, "/videos/missing/output.mp4").await.0, StatusCode::NOT_FOUND);
        assert_eq!(get_json(&state, "/videos/missing/thumbnail.jpg").await.0, StatusCode::NOT_FOUND);
        assert_eq!(get_json(&state, "/models/local/download/none").await.0, StatusCode::NOT_FOUND);
        assert_eq!(
            get_json(&state, "/models/local/download?model_id=org/none").await.0,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_deleting_a_video_removes_it() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = test_state(temp.path());
        let (_, submitted) = post_json(
            &state,
            "/generate",
            serde_json::json!({"prompt": "rain", "num_frames": 2, "width": 32, "height": 32, "use_cloud": false}),
        )
        .await;
        wait_for_job(&state, submitted["job_id"].as_str().expect("job id")).await;
        let video_id = submitted["video_id"].as_str().expect("video id");

        let request = Request::builder()
            .method("DELETE")
            .uri(format!("/videos/{video_id}"))
            .body(Body::empty())
            .expect("request");
        assert_eq!(send(&state, request).await.0, StatusCode::OK);
        assert_eq!(get_json(&state, &format!("/videos/{video_id}")).await.0, StatusCode::NOT_FOUND);
        assert!(!state.services().videos.video_dir(video_id).exists());
    }

    #[tokio::test]
    async fn test_model_download_flow() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = test_state(temp.path());

        let (_, info) = get_json(&state, "/models/local/status?repo_id=org/model").await;
        assert_eq!(info["downloaded"], false);

        let (status, started) = post_json(
            &state,
            "/models/local/download",
            serde_json::json!({"repo_id": "org/model"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(started["status"], "started");
        let download_id = started["download_id"].as_str().expect("download id").to_string();

        let mut finished = false;
        for _ in 0..400 {
            let task = state.services().downloads.get(&download_id).expect("task");
            if task.status == DownloadStatus::Completed {
                finished = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(finished);

        let (_, task) = get_json(&state, &format!("/models/local/download/{download_id}")).await;
        assert_eq!(task["status"], "completed");
        assert_eq!(task["progress"], 100);
        let (_, latest) = get_json(&state, "/models/local/download?model_id=org/model").await;
        assert_eq!(latest["download_id"], download_id);

        let (_, info) = get_json(&state, "/models/local/status?model_id=org/model").await;
        assert_eq!(info["downloaded"], true);
        let (_, again) = post_json(
            &state,
            "/models/local/download",
            serde_json::json!({"model_id": "org/model"}),
        )
        .await;
        assert_eq!(again["status"], "already_downloaded");
    }

    #[tokio::test]
    async fn test_status_without_model_id_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = test_state(temp.path());
        let (status, _) = get_json(&state, "/models/local/status?model_id=%20").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
