//! Bookmark persistence for tubeshelf.
//!
//! One `videos` table holds both the bookmark metadata and the download
//! lifecycle fields the background pipeline mutates. The pipeline only sees
//! the narrow [`EntityStatusStore`] view of it.

use std::path::Path;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use libsql::{Builder, Connection, Row, params};
use serde::{Deserialize, Serialize};

/// Coarse download lifecycle as seen from the bookmark. There is no
/// `uploading` here: a video only turns `completed` once the upload landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    #[default]
    None,
    Pending,
    Downloading,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "none" => Some(Self::None),
            "pending" => Some(Self::Pending),
            "downloading" => Some(Self::Downloading),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Row stored in the `videos` table, serialized as-is by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoRecord {
    pub id: String,
    pub source_id: String,
    pub url: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_count: Option<i64>,
    pub download_status: DownloadStatus,
    pub download_progress: Option<f64>,
    pub storage_key: Option<String>,
    pub storage_bucket: Option<String>,
    pub file_size: Option<i64>,
    pub mime_type: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields needed to create a bookmark. The id and timestamps are assigned by
/// the store.
#[derive(Debug, Clone, Default)]
pub struct NewVideo {
    pub source_id: String,
    pub url: String,
    pub title: String,
    pub description: Option<String>,
    pub channel_name: Option<String>,
    pub channel_id: Option<String>,
    pub thumbnail_url: Option<String>,
    pub duration: Option<i64>,
    pub upload_date: Option<String>,
    pub view_count: Option<i64>,
    pub raw_metadata: serde_json::Value,
    pub download_status: DownloadStatus,
}

/// What the pipeline needs to know about a video before downloading it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTarget {
    pub entity_id: String,
    pub source_id: String,
    pub url: String,
}

/// Where a finished download was stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub bucket: String,
    pub file_size: u64,
    pub mime_type: String,
}

/// Partial update of the download fields. `None` leaves a column untouched;
/// `progress: Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadPatch {
    pub status: Option<DownloadStatus>,
    pub progress: Option<Option<f64>>,
    pub location: Option<StoredObject>,
}

impl DownloadPatch {
    pub fn pending() -> Self {
        Self {
            status: Some(DownloadStatus::Pending),
            progress: Some(Some(0.0)),
            location: None,
        }
    }

    pub fn downloading() -> Self {
        Self {
            status: Some(DownloadStatus::Downloading),
            progress: Some(Some(0.0)),
            location: None,
        }
    }

    pub fn progress(percent: f64) -> Self {
        Self {
            progress: Some(Some(percent)),
            ..Self::default()
        }
    }

    pub fn completed(location: StoredObject) -> Self {
        Self {
            status: Some(DownloadStatus::Completed),
            progress: Some(Some(100.0)),
            location: Some(location),
        }
    }

    pub fn failed() -> Self {
        Self {
            status: Some(DownloadStatus::Failed),
            progress: Some(None),
            location: None,
        }
    }
}

/// Listing order for [`VideoStore::list_videos`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoSort {
    #[default]
    CreatedAt,
    Title,
    UploadDate,
}

impl VideoSort {
    /// Unknown names fall back to creation time.
    pub fn parse(value: &str) -> Self {
        match value {
            "title" => Self::Title,
            "uploadDate" => Self::UploadDate,
            _ => Self::CreatedAt,
        }
    }

    fn column(self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::Title => "title",
            Self::UploadDate => "upload_date",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("asc") {
            Self::Asc
        } else {
            Self::Desc
        }
    }

    fn keyword(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Filter and window for a bookmark listing. `page` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoQuery {
    /// Matched case-insensitively against title, description and channel.
    pub search: Option<String>,
    pub sort: VideoSort,
    pub order: SortOrder,
    pub page: u32,
    pub limit: u32,
}

impl Default for VideoQuery {
    fn default() -> Self {
        Self {
            search: None,
            sort: VideoSort::default(),
            order: SortOrder::default(),
            page: 1,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl VideoQuery {
    pub fn page(&self) -> u32 {
        self.page.max(1)
    }

    pub fn limit(&self) -> u32 {
        self.limit.clamp(1, MAX_PAGE_SIZE)
    }

    /// `%term%` with LIKE wildcards escaped, or `None` for an empty search.
    fn like_pattern(&self) -> Option<String> {
        let term = self.search.as_deref().map(str::trim).filter(|t| !t.is_empty())?;
        let mut pattern = String::with_capacity(term.len() + 2);
        pattern.push('%');
        for c in term.chars() {
            if matches!(c, '%' | '_' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push('%');
        Some(pattern)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoPage {
    pub videos: Vec<VideoRecord>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u64,
}

/// User-editable bookmark fields. `None` leaves the column as it is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VideoDetails {
    pub title: Option<String>,
    pub description: Option<String>,
}

/// Returned (inside `anyhow::Error`) when a bookmark for the same source
/// already exists.
#[derive(Debug, thiserror::Error)]
#[error("video {source_id} is already saved")]
pub struct DuplicateVideo {
    pub source_id: String,
}

/// Persisted view the download pipeline reads and writes.
#[async_trait]
pub trait EntityStatusStore: Send + Sync {
    async fn download_target(&self, entity_id: &str) -> Result<Option<DownloadTarget>>;

    /// Fails when the entity does not exist.
    async fn update_download(&self, entity_id: &str, patch: DownloadPatch) -> Result<()>;
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS videos (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL UNIQUE,
            url TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            channel_name TEXT,
            channel_id TEXT,
            thumbnail_url TEXT,
            duration INTEGER,
            upload_date TEXT,
            view_count INTEGER,
            raw_metadata TEXT NOT NULL DEFAULT 'null',
            download_status TEXT NOT NULL DEFAULT 'none',
            download_progress REAL,
            storage_key TEXT,
            storage_bucket TEXT,
            file_size INTEGER,
            mime_type TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_videos_created_at ON videos(created_at);
        "#,
    )
    .await?;
    Ok(())
}

// Column order must match `row_to_video`.
const VIDEO_COLUMNS: &str = r#"
    id, source_id, url, title, description, channel_name, channel_id,
    thumbnail_url, duration, upload_date, view_count, download_status,
    download_progress, storage_key, storage_bucket, file_size, mime_type,
    created_at, updated_at
"#;

/// Wrapper around the SQLite-compatible connection holding every bookmark.
#[derive(Clone)]
pub struct VideoStore {
    conn: Connection,
}

impl VideoStore {
    /// Opens (and if necessary creates) the SQLite DB and ensures the expected
    /// schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating data directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening video DB {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    pub async fn insert_video(&self, video: &NewVideo) -> Result<VideoRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let raw_metadata =
            serde_json::to_string(&video.raw_metadata).context("serializing raw metadata")?;

        self.conn
            .execute(
                r#"
                INSERT INTO videos (
                    id, source_id, url, title, description, channel_name, channel_id,
                    thumbnail_url, duration, upload_date, view_count, raw_metadata,
                    download_status, created_at, updated_at
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14
                )
                "#,
                params![
                    id.as_str(),
                    video.source_id.as_str(),
                    video.url.as_str(),
                    video.title.as_str(),
                    video.description.as_deref(),
                    video.channel_name.as_deref(),
                    video.channel_id.as_deref(),
                    video.thumbnail_url.as_deref(),
                    video.duration,
                    video.upload_date.as_deref(),
                    video.view_count,
                    raw_metadata,
                    video.download_status.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(|err| {
                if err.to_string().contains("UNIQUE constraint failed") {
                    anyhow::Error::new(DuplicateVideo {
                        source_id: video.source_id.clone(),
                    })
                } else {
                    anyhow::Error::new(err).context(format!("inserting video {}", video.source_id))
                }
            })?;

        self.get_video(&id)
            .await?
            .context("inserted video vanished")
    }

    pub async fn get_video(&self, id: &str) -> Result<Option<VideoRecord>> {
        self.fetch_one("id", id).await
    }

    pub async fn find_by_source_id(&self, source_id: &str) -> Result<Option<VideoRecord>> {
        self.fetch_one("source_id", source_id).await
    }

    /// One page of bookmarks matching `query`, plus the total match count.
    /// Ties are broken by insertion order in the same direction.
    pub async fn list_videos(&self, query: &VideoQuery) -> Result<VideoPage> {
        let page = query.page();
        let limit = query.limit();
        let pattern = query.like_pattern();
        let filter = "?1 IS NULL \
            OR title LIKE ?1 ESCAPE '\\' \
            OR description LIKE ?1 ESCAPE '\\' \
            OR channel_name LIKE ?1 ESCAPE '\\'";

        let mut rows = self
            .conn
            .query(
                &format!("SELECT COUNT(*) FROM videos WHERE {filter}"),
                params![pattern.as_deref()],
            )
            .await
            .context("counting videos")?;
        let total: i64 = match rows.next().await? {
            Some(row) => row.get(0)?,
            None => 0,
        };
        let total = u64::try_from(total).unwrap_or_default();

        let direction = query.order.keyword();
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {VIDEO_COLUMNS} FROM videos WHERE {filter} \
                 ORDER BY {} {direction}, rowid {direction} LIMIT ?2 OFFSET ?3",
                query.sort.column()
            ))
            .await?;

        let offset = i64::from(page - 1) * i64::from(limit);
        let mut rows = stmt
            .query(params![pattern.as_deref(), i64::from(limit), offset])
            .await
            .context("listing videos")?;
        let mut videos = Vec::new();
        while let Some(row) = rows.next().await? {
            videos.push(row_to_video(&row)?);
        }

        Ok(VideoPage {
            videos,
            total,
            page,
            limit,
            total_pages: total.div_ceil(u64::from(limit)),
        })
    }

    /// Returns `None` when the video does not exist.
    pub async fn update_details(
        &self,
        id: &str,
        details: &VideoDetails,
    ) -> Result<Option<VideoRecord>> {
        let affected = self
            .conn
            .execute(
                r#"
                UPDATE videos SET
                    title = COALESCE(?2, title),
                    description = COALESCE(?3, description),
                    updated_at = ?4
                WHERE id = ?1
                "#,
                params![
                    id,
                    details.title.as_deref(),
                    details.description.as_deref(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .with_context(|| format!("updating details of {id}"))?;

        if affected == 0 {
            return Ok(None);
        }
        self.get_video(id).await
    }

    /// Returns `false` when nothing was deleted.
    pub async fn delete_video(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM videos WHERE id = ?1", params![id])
            .await
            .with_context(|| format!("deleting video {id}"))?;
        Ok(affected > 0)
    }

    async fn fetch_one(&self, column: &str, value: &str) -> Result<Option<VideoRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {VIDEO_COLUMNS} FROM videos WHERE {column} = ?1"
            ))
            .await?;

        let mut rows = stmt.query([value]).await?;
        if let Some(row) = rows.next().await? {
            Ok(Some(row_to_video(&row)?))
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl EntityStatusStore for VideoStore {
    async fn download_target(&self, entity_id: &str) -> Result<Option<DownloadTarget>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, source_id, url FROM videos WHERE id = ?1")
            .await?;

        let mut rows = stmt.query([entity_id]).await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        Ok(Some(DownloadTarget {
            entity_id: row.get(0)?,
            source_id: row.get(1)?,
            url: row.get(2)?,
        }))
    }

    async fn update_download(&self, entity_id: &str, patch: DownloadPatch) -> Result<()> {
        let set_progress = patch.progress.is_some() as i64;
        let progress = patch.progress.flatten();
        let set_location = patch.location.is_some() as i64;
        let location = patch.location.as_ref();
        let file_size = location
            .map(|loc| i64::try_from(loc.file_size))
            .transpose()
            .context("file size does not fit in the database")?;

        let affected = self
            .conn
            .execute(
                r#"
                UPDATE videos SET
                    download_status = COALESCE(?2, download_status),
                    download_progress = CASE WHEN ?3 THEN ?4 ELSE download_progress END,
                    storage_key = CASE WHEN ?5 THEN ?6 ELSE storage_key END,
                    storage_bucket = CASE WHEN ?5 THEN ?7 ELSE storage_bucket END,
                    file_size = CASE WHEN ?5 THEN ?8 ELSE file_size END,
                    mime_type = CASE WHEN ?5 THEN ?9 ELSE mime_type END,
                    updated_at = ?10
                WHERE id = ?1
                "#,
                params![
                    entity_id,
                    patch.status.map(DownloadStatus::as_str),
                    set_progress,
                    progress,
                    set_location,
                    location.map(|loc| loc.key.as_str()),
                    location.map(|loc| loc.bucket.as_str()),
                    file_size,
                    location.map(|loc| loc.mime_type.as_str()),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .with_context(|| format!("updating download state of {entity_id}"))?;

        if affected == 0 {
            bail!("video {entity_id} not found");
        }
        Ok(())
    }
}

/// Converts a SQL row into a `VideoRecord`, tolerating unknown status strings
/// written by older builds.
fn row_to_video(row: &Row) -> Result<VideoRecord> {
    let status: String = row.get(11)?;
    Ok(VideoRecord {
        id: row.get(0)?,
        source_id: row.get(1)?,
        url: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        channel_name: row.get(5)?,
        channel_id: row.get(6)?,
        thumbnail_url: row.get(7)?,
        duration: row.get(8)?,
        upload_date: row.get(9)?,
        view_count: row.get(10)?,
        download_status: DownloadStatus::parse(&status).unwrap_or_default(),
        download_progress: row.get(12)?,
        storage_key: row.get(13)?,
        storage_bucket: row.get(14)?,
        file_size: row.get(15)?,
        mime_type: row.get(16)?,
        created_at: row.get(17)?,
        updated_at: row.get(18)?,
    })
}
