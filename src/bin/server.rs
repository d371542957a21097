#![forbid(unsafe_code)]

//! HTTP API for tubeshelf.
//!
//! Bookmarks are plain rows in SQLite. Downloads never run inside a request:
//! handlers only enqueue work on the shared [`DownloadQueue`] and clients poll
//! the job endpoints for progress.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing::{info, warn};

use tubeshelf::{
    config::{Overrides, resolve_settings},
    fetcher::{MediaFetcher, MediaMetadata, YtDlp},
    jobs::JobStatusView,
    logging::init_logging,
    metadata::{
        DEFAULT_PAGE_SIZE, DownloadPatch, DownloadStatus, DuplicateVideo, EntityStatusStore,
        NewVideo, SortOrder, VideoDetails, VideoPage, VideoQuery, VideoRecord, VideoSort,
        VideoStore,
    },
    scheduler::DownloadQueue,
    storage::{BlobStore, ObjectBlobStore},
};

const DB_FILE: &str = "tubeshelf.db";
const STREAM_URL_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Parser)]
#[command(name = "tubeshelf-server", version, about = "Video bookmark API")]
struct ServerArgs {
    /// Directory holding the SQLite database.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory for in-progress downloads.
    #[arg(long)]
    work_dir: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Alternative to `./.env`.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl ServerArgs {
    fn into_overrides(self) -> Overrides {
        Overrides {
            data_dir: self.data_dir,
            work_dir: self.work_dir,
            port: self.port,
            host: self.host,
            env_path: self.env_file,
        }
    }
}

/// Shared state injected into every handler.
#[derive(Clone)]
struct AppState {
    videos: VideoStore,
    ytdlp: Arc<YtDlp>,
    blobs: Arc<dyn BlobStore>,
    queue: Arc<DownloadQueue>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{err:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateVideoRequest {
    #[serde(default)]
    url: String,
    #[serde(default)]
    download_video: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateVideoResponse {
    video: VideoRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    storage_key: Option<String>,
}

/// Raw listing parameters. Unparseable numbers fall back to defaults.
#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    search: Option<String>,
    sort: Option<String>,
    order: Option<String>,
    page: Option<String>,
    limit: Option<String>,
}

impl ListQuery {
    fn into_query(self) -> VideoQuery {
        let number = |value: Option<String>, default: u32| {
            value
                .and_then(|raw| raw.trim().parse::<u32>().ok())
                .unwrap_or(default)
        };
        VideoQuery {
            search: self.search,
            sort: self.sort.as_deref().map(VideoSort::parse).unwrap_or_default(),
            order: self.order.as_deref().map(SortOrder::parse).unwrap_or_default(),
            page: number(self.page, 1),
            limit: number(self.limit, DEFAULT_PAGE_SIZE),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    key: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    ytdlp_version: Option<String>,
    storage_configured: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let settings = resolve_settings(ServerArgs::parse().into_overrides())?;

    let videos = VideoStore::open(&settings.data_dir.join(DB_FILE))
        .await
        .context("opening video store")?;
    let blobs: Arc<dyn BlobStore> = Arc::new(ObjectBlobStore::from_settings(&settings.storage)?);
    if !blobs.is_configured() {
        warn!("object storage is not configured; downloads will be refused");
    }

    let ytdlp = Arc::new(YtDlp::new(&settings.ytdlp_path));
    match ytdlp.version().await {
        Ok(version) => info!(%version, "using yt-dlp"),
        Err(err) => warn!("yt-dlp is not usable: {err:#}"),
    }

    let queue = Arc::new(DownloadQueue::new(
        ytdlp.clone(),
        blobs.clone(),
        Arc::new(videos.clone()),
        settings.work_dir.clone(),
        settings.retention,
    ));
    queue.start()?;

    let state = AppState {
        videos,
        ytdlp,
        blobs,
        queue: queue.clone(),
    };

    let host: IpAddr = settings
        .host
        .parse()
        .with_context(|| format!("invalid listen host {:?}", settings.host))?;
    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("API server listening on http://{addr}");

    let served = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server");

    queue.stop().await;
    served
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/videos", get(list_videos).post(create_video))
        .route("/api/videos/stream", get(stream_video))
        .route(
            "/api/videos/{id}",
            get(get_video).patch(update_video).delete(delete_video),
        )
        .route("/api/videos/{id}/download", post(trigger_download))
        .route("/api/videos/{id}/job", get(get_video_job))
        .route("/api/jobs/{id}", get(get_job))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("failed to install Ctrl+C handler: {err}");
    }
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        ytdlp_version: state.ytdlp.version().await.ok(),
        storage_configured: state.blobs.is_configured(),
    })
}

async fn list_videos(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<VideoPage>> {
    Ok(Json(state.videos.list_videos(&query.into_query()).await?))
}

async fn get_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<VideoRecord>> {
    let video = state
        .videos
        .get_video(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("video not found"))?;
    Ok(Json(video))
}

async fn update_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
    Json(details): Json<VideoDetails>,
) -> ApiResult<Json<VideoRecord>> {
    if details.title.as_deref().is_some_and(|title| title.trim().is_empty()) {
        return Err(ApiError::bad_request("title must not be empty"));
    }
    let video = state
        .videos
        .update_details(&id, &details)
        .await?
        .ok_or_else(|| ApiError::not_found("video not found"))?;
    Ok(Json(video))
}

async fn create_video(
    State(state): State<AppState>,
    Json(payload): Json<CreateVideoRequest>,
) -> ApiResult<(StatusCode, Json<CreateVideoResponse>)> {
    let url = payload.url.trim();
    if url.is_empty() {
        return Err(ApiError::bad_request("url is required"));
    }
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err(ApiError::bad_request("url must be an http(s) link"));
    }

    let metadata = state
        .ytdlp
        .fetch_metadata(url)
        .await
        .map_err(|err| ApiError::internal(format!("{err:#}")))?;

    if let Some(existing) = state.videos.find_by_source_id(&metadata.id).await? {
        return Err(ApiError::conflict(format!(
            "this video is already saved as {}",
            existing.id
        )));
    }

    let status = if payload.download_video {
        DownloadStatus::Pending
    } else {
        DownloadStatus::None
    };
    // A concurrent request may have saved the same video since the check.
    let video = match state
        .videos
        .insert_video(&new_video(url, &metadata, status)?)
        .await
    {
        Ok(video) => video,
        Err(err) if err.is::<DuplicateVideo>() => {
            return Err(ApiError::conflict(format!("{err:#}")));
        }
        Err(err) => return Err(err.into()),
    };

    let job_id = payload
        .download_video
        .then(|| state.queue.enqueue(&video.id).job.id);
    info!(video = %video.id, source = %video.source_id, queued = job_id.is_some(), "saved video");

    Ok((StatusCode::CREATED, Json(CreateVideoResponse { video, job_id })))
}

fn new_video(url: &str, metadata: &MediaMetadata, status: DownloadStatus) -> Result<NewVideo> {
    Ok(NewVideo {
        source_id: metadata.id.clone(),
        url: url.to_string(),
        title: metadata.title.clone(),
        description: metadata.description.clone(),
        channel_name: metadata.channel.clone(),
        channel_id: metadata.channel_id.clone(),
        thumbnail_url: metadata.thumbnail.clone(),
        duration: metadata.duration.map(|seconds| seconds.round() as i64),
        upload_date: metadata.upload_date.clone(),
        view_count: metadata.view_count,
        raw_metadata: serde_json::to_value(metadata).context("encoding metadata")?,
        download_status: status,
    })
}

async fn delete_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let video = state
        .videos
        .get_video(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("video not found"))?;

    if let Some(job) = state.queue.active_job_for_entity(&id) {
        return Err(ApiError::conflict(format!(
            "download job {} is still {}",
            job.id,
            job.status.as_str()
        )));
    }

    if let Some(key) = video.storage_key.as_deref() {
        if state.blobs.is_configured() {
            if let Err(err) = state.blobs.delete(key).await {
                warn!(video = %id, key, "could not delete stored object: {err:#}");
            }
        }
    }

    state.videos.delete_video(&id).await?;
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn trigger_download(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<DownloadResponse>> {
    if !state.blobs.is_configured() {
        return Err(ApiError::bad_request(
            "object storage is not configured; set the S3_* variables or TUBESHELF_LOCAL_STORAGE",
        ));
    }

    let video = state
        .videos
        .get_video(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("video not found"))?;

    if video.download_status == DownloadStatus::Completed {
        return Ok(Json(DownloadResponse {
            status: "already_completed".to_string(),
            job_id: None,
            storage_key: video.storage_key,
        }));
    }

    if let Some(job) = state.queue.active_job_for_entity(&id) {
        return Ok(Json(DownloadResponse {
            status: job.status.as_str().to_string(),
            job_id: Some(job.id),
            storage_key: None,
        }));
    }

    state
        .videos
        .update_download(&id, DownloadPatch::pending())
        .await?;
    let job = state.queue.enqueue(&id).job;

    Ok(Json(DownloadResponse {
        status: job.status.as_str().to_string(),
        job_id: Some(job.id),
        storage_key: None,
    }))
}

async fn get_video_job(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<JobStatusView>> {
    let job = state
        .queue
        .active_job_for_entity(&id)
        .ok_or_else(|| ApiError::not_found("no active job for this video"))?;
    Ok(Json(JobStatusView::from(&job)))
}

async fn get_job(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<JobStatusView>> {
    let status = state
        .queue
        .job_status(&id)
        .ok_or_else(|| ApiError::not_found("job not found"))?;
    Ok(Json(status))
}

async fn stream_video(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> ApiResult<Response> {
    let key = query
        .key
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("key parameter is required"))?;

    if !state.blobs.is_configured() {
        return Err(ApiError::internal("object storage is not configured"));
    }

    let url = state.blobs.presigned_url(&key, STREAM_URL_TTL).await?;
    Ok(Redirect::temporary(&url).into_response())
}
