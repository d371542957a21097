#![forbid(unsafe_code)]

//! Media extraction through `yt-dlp`.
//!
//! Metadata lookups are a single buffered `--dump-json` call bounded by a
//! timeout. Media downloads stream stdout line by line so `[download] NN.N%`
//! progress can be forwarded while the process runs.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::Command,
    sync::mpsc::UnboundedSender,
};
use tracing::{debug, warn};

const METADATA_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const FORMAT_SELECTOR: &str = "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best";

/// Subset of yt-dlp's info JSON that bookmarks care about. Everything else is
/// kept in `extra` so the raw payload can be stored verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub upload_date: Option<String>,
    #[serde(default)]
    pub view_count: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch_metadata(&self, url: &str) -> Result<MediaMetadata>;

    /// Downloads `url` into `dest`, sending percentages (0..=100) as they are
    /// reported. The sender is dropped when the download ends.
    async fn fetch_media(&self, url: &str, dest: &Path, progress: UnboundedSender<f64>)
    -> Result<()>;
}

/// `yt-dlp` driven through `tokio::process`.
#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: PathBuf,
}

impl YtDlp {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.kill_on_drop(true);
        command
    }

    pub async fn is_available(&self) -> bool {
        self.version().await.is_ok()
    }

    pub async fn version(&self) -> Result<String> {
        let output = tokio::time::timeout(
            PROBE_TIMEOUT,
            self.command().arg("--version").stdin(Stdio::null()).output(),
        )
        .await
        .context("yt-dlp --version timed out")?
        .with_context(|| format!("running {} --version", self.binary.display()))?;

        if !output.status.success() {
            bail!("yt-dlp --version exited with {}", output.status);
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl MediaFetcher for YtDlp {
    async fn fetch_metadata(&self, url: &str) -> Result<MediaMetadata> {
        let mut command = self.command();
        command
            .arg("--dump-json")
            .arg("--no-download")
            .arg("--no-warnings")
            .arg(url)
            .stdin(Stdio::null());

        let output = tokio::time::timeout(METADATA_TIMEOUT, command.output())
            .await
            .with_context(|| format!("metadata lookup for {url} timed out"))?
            .with_context(|| format!("fetching metadata for {url}"))?;

        if !output.status.success() {
            bail!(
                "yt-dlp exited with {} for {}: {}",
                output.status,
                url,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        serde_json::from_slice(&output.stdout).context("deserializing metadata JSON")
    }

    async fn fetch_media(
        &self,
        url: &str,
        dest: &Path,
        progress: UnboundedSender<f64>,
    ) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let mut child = self
            .command()
            .arg("-f")
            .arg(FORMAT_SELECTOR)
            .arg("--merge-output-format")
            .arg("mp4")
            .arg("--newline")
            .arg("-o")
            .arg(dest)
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| anyhow!("Failed to spawn yt-dlp: {err}"))?;

        let stdout = child.stdout.take().context("yt-dlp stdout not captured")?;
        let mut stderr = child.stderr.take().context("yt-dlp stderr not captured")?;

        // Drain stderr concurrently so a chatty process never blocks on a
        // full pipe while we are reading stdout.
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Err(err) = stderr.read_to_string(&mut buf).await {
                warn!("could not read yt-dlp stderr: {err}");
            }
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await.context("reading yt-dlp output")? {
            if let Some(percent) = parse_progress_line(&line) {
                // A closed receiver only means nobody listens anymore.
                let _ = progress.send(percent);
            } else {
                debug!(target: "tubeshelf::ytdlp", "{line}");
            }
        }
        drop(progress);

        let status = child.wait().await.context("waiting for yt-dlp")?;
        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            let code = status
                .code()
                .map(|code| code.to_string())
                .unwrap_or_else(|| "signal".to_string());
            bail!("yt-dlp exited with code {code}: {}", stderr.trim());
        }
        Ok(())
    }
}

/// Extracts the percentage from lines such as `[download]  42.3% of 10MiB`.
pub fn parse_progress_line(line: &str) -> Option<f64> {
    let rest = line.trim_start().strip_prefix("[download]")?.trim_start();
    let (number, _) = rest.split_once('%')?;
    let percent: f64 = number.trim().parse().ok()?;
    percent.is_finite().then(|| percent.clamp(0.0, 100.0))
}
