//! Background download pipeline.
//!
//! [`DownloadQueue`] owns the job registry and one long-lived worker task.
//! Enqueueing only records a pending job and pokes the worker through a
//! [`Notify`]; the worker claims jobs strictly one at a time in FIFO order,
//! so no two downloads ever run concurrently.
//!
//! Per job: look the video up, make sure storage is usable, fetch into a
//! deterministic temp file while forwarding progress, upload, record the
//! outcome, and remove the temp file whatever happened.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::{
    sync::{Notify, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{
    config::RetentionSettings,
    error::JobError,
    fetcher::MediaFetcher,
    jobs::{Enqueued, Job, JobRegistry, JobStatusView},
    metadata::{DownloadPatch, DownloadTarget, EntityStatusStore, StoredObject},
    naming::{TEMP_FILE_PREFIX, VIDEO_EXTENSION, storage_key, temp_file_name},
    storage::BlobStore,
};

const DEFAULT_MIME_TYPE: &str = "video/mp4";
/// Persisted progress is only written on multiples of this.
const PROGRESS_STEP: u64 = 5;

struct Pipeline {
    registry: JobRegistry,
    fetcher: Arc<dyn MediaFetcher>,
    blobs: Arc<dyn BlobStore>,
    entities: Arc<dyn EntityStatusStore>,
    work_dir: PathBuf,
    wake: Notify,
}

pub struct DownloadQueue {
    pipeline: Arc<Pipeline>,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadQueue {
    pub fn new(
        fetcher: Arc<dyn MediaFetcher>,
        blobs: Arc<dyn BlobStore>,
        entities: Arc<dyn EntityStatusStore>,
        work_dir: PathBuf,
        retention: RetentionSettings,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            pipeline: Arc::new(Pipeline {
                registry: JobRegistry::new(retention),
                fetcher,
                blobs,
                entities,
                work_dir,
                wake: Notify::new(),
            }),
            shutdown,
            worker: Mutex::new(None),
        }
    }

    /// Sweeps temp files left by a previous process and spawns the worker.
    /// Starting an already running queue is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        std::fs::create_dir_all(&self.pipeline.work_dir).with_context(|| {
            format!("creating work dir {}", self.pipeline.work_dir.display())
        })?;
        let removed = sweep_orphans(&self.pipeline.work_dir);
        if removed > 0 {
            info!(removed, "removed leftover temp downloads");
        }

        self.shutdown.send_replace(false);
        let pipeline = self.pipeline.clone();
        let shutdown = self.shutdown.subscribe();
        *worker = Some(tokio::spawn(run_worker(pipeline, shutdown)));
        info!(work_dir = %self.pipeline.work_dir.display(), "download worker started");
        Ok(())
    }

    /// Asks the worker to exit and waits for it. A job already in flight runs
    /// to completion first; pending jobs stay pending.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!("download worker ended abnormally: {err}");
            }
            info!("download worker stopped");
        }
    }

    /// Returns the existing active job for `entity_id` instead of creating a
    /// duplicate.
    pub fn enqueue(&self, entity_id: &str) -> Enqueued {
        let enqueued = self.pipeline.registry.enqueue(entity_id);
        if enqueued.created {
            debug!(job = %enqueued.job.id, entity = entity_id, "queued download");
            self.pipeline.wake.notify_one();
        }
        enqueued
    }

    pub fn job_status(&self, job_id: &str) -> Option<JobStatusView> {
        self.pipeline
            .registry
            .get(job_id)
            .map(|job| JobStatusView::from(&job))
    }

    pub fn active_job_for_entity(&self, entity_id: &str) -> Option<Job> {
        self.pipeline.registry.find_active_by_entity(entity_id)
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.pipeline.registry
    }

    pub fn storage_configured(&self) -> bool {
        self.pipeline.blobs.is_configured()
    }
}

async fn run_worker(pipeline: Arc<Pipeline>, mut shutdown: watch::Receiver<bool>) {
    loop {
        while let Some(job) = pipeline.registry.next_pending() {
            if *shutdown.borrow() {
                return;
            }
            pipeline.run_job(job).await;
        }

        tokio::select! {
            _ = pipeline.wake.notified() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

impl Pipeline {
    async fn run_job(&self, job: Job) {
        info!(job = %job.id, entity = %job.entity_id, "starting download job");

        let target = match self.entities.download_target(&job.entity_id).await {
            Ok(Some(target)) => target,
            Ok(None) => return self.finish(&job, Err(JobError::NotFound)).await,
            Err(err) => return self.finish(&job, Err(JobError::Lookup(err))).await,
        };

        let temp_name = temp_file_name(&target.source_id);
        let temp_path = self.work_dir.join(&temp_name);
        let outcome = self.execute(&job, &target, &temp_path).await;
        remove_temp_files(&self.work_dir, &temp_name);
        self.finish(&job, outcome).await;
    }

    /// Everything between claim and the final record. Any error here ends the
    /// job.
    async fn execute(
        &self,
        job: &Job,
        target: &DownloadTarget,
        temp_path: &Path,
    ) -> Result<StoredObject, JobError> {
        if !self.blobs.is_configured() {
            return Err(JobError::Misconfigured(
                "object storage is not configured".to_string(),
            ));
        }
        let bucket = self.blobs.bucket().unwrap_or_default().to_string();

        self.registry.mark_downloading(&job.id);
        self.entities
            .update_download(&job.entity_id, DownloadPatch::downloading())
            .await
            .map_err(JobError::Persist)?;

        self.fetch(job, target, temp_path)
            .await
            .map_err(JobError::Fetch)?;

        self.registry.mark_uploading(&job.id);
        let key = storage_key(&target.source_id);
        let mime_type = mime_guess::from_path(temp_path)
            .first_raw()
            .unwrap_or(DEFAULT_MIME_TYPE);
        debug!(job = %job.id, key = %key, "uploading");
        let file_size = self
            .blobs
            .upload(&key, temp_path, mime_type)
            .await
            .map_err(JobError::Upload)?;

        let location = StoredObject {
            key,
            bucket,
            file_size,
            mime_type: mime_type.to_string(),
        };
        self.entities
            .update_download(&job.entity_id, DownloadPatch::completed(location.clone()))
            .await
            .map_err(JobError::Persist)?;
        Ok(location)
    }

    /// Runs the fetcher while draining its progress channel.
    async fn fetch(&self, job: &Job, target: &DownloadTarget, temp_path: &Path) -> Result<()> {
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let download = self
            .fetcher
            .fetch_media(&target.url, temp_path, progress_tx);

        let track = async {
            let mut last_written: Option<u64> = None;
            while let Some(percent) = progress_rx.recv().await {
                self.on_progress(job, percent, &mut last_written).await;
            }
        };

        let (result, ()) = tokio::join!(download, track);
        result
    }

    async fn on_progress(&self, job: &Job, percent: f64, last_written: &mut Option<u64>) {
        let Some(current) = self.registry.record_progress(&job.id, percent) else {
            return;
        };

        // Only exact multiples are written; a jump over one skips that write.
        let floored = current.floor() as u64;
        if floored % PROGRESS_STEP != 0 || *last_written == Some(floored) {
            return;
        }
        *last_written = Some(floored);
        self.persist_best_effort(job, DownloadPatch::progress(current), "progress")
            .await;
    }

    async fn finish(&self, job: &Job, outcome: Result<StoredObject, JobError>) {
        match outcome {
            Ok(location) => {
                self.registry.mark_completed(&job.id);
                info!(
                    job = %job.id,
                    entity = %job.entity_id,
                    key = %location.key,
                    bytes = location.file_size,
                    "download job completed"
                );
            }
            Err(err) => {
                let message = err.to_string();
                warn!(job = %job.id, entity = %job.entity_id, "download job failed: {message}");
                if err.touches_entity() {
                    self.persist_best_effort(job, DownloadPatch::failed(), "failure status")
                        .await;
                }
                self.registry.mark_failed(&job.id, message);
            }
        }
    }

    /// Writes that must never change the job outcome. Failures are logged
    /// and attached to the job.
    async fn persist_best_effort(&self, job: &Job, patch: DownloadPatch, what: &str) {
        if let Err(err) = self.entities.update_download(&job.entity_id, patch).await {
            warn!(job = %job.id, entity = %job.entity_id, "could not persist {what}: {err:#}");
            self.registry
                .push_warning(&job.id, format!("could not persist {what}: {err:#}"));
        }
    }
}

/// Removes the temp download together with every sibling yt-dlp derives
/// from it: `.part` files, per-format streams (`<stem>.f137.mp4`) and `.ytdl`
/// state files.
fn remove_temp_files(work_dir: &Path, temp_name: &str) {
    let stem = temp_name
        .strip_suffix(VIDEO_EXTENSION)
        .unwrap_or(temp_name);
    let removed = remove_matching(work_dir, |name| name.starts_with(stem));
    if removed > 0 {
        debug!(removed, stem, "removed temp files");
    }
}

/// Deletes `ytdl-*` files directly inside `work_dir`. Returns how many went.
fn sweep_orphans(work_dir: &Path) -> usize {
    remove_matching(work_dir, |name| name.starts_with(TEMP_FILE_PREFIX))
}

fn remove_matching(work_dir: &Path, matches: impl Fn(&str) -> bool) -> usize {
    let mut removed = 0;
    for entry in WalkDir::new(work_dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
    {
        if !entry.file_name().to_str().is_some_and(|name| matches(name)) {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %entry.path().display(), "could not remove temp file: {err}"),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{jobs::JobStatus, metadata::DownloadStatus};
    use anyhow::{anyhow, bail};
    use async_trait::async_trait;
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::sync::mpsc::UnboundedSender;

    #[derive(Debug, Clone, Default)]
    struct EntityRow {
        source_id: String,
        url: String,
        status: DownloadStatus,
        progress: Option<f64>,
        location: Option<StoredObject>,
    }

    /// In-memory entity store that records every patch it receives.
    #[derive(Default)]
    struct FakeEntities {
        rows: parking_lot::Mutex<HashMap<String, EntityRow>>,
        patches: parking_lot::Mutex<Vec<(String, DownloadPatch)>>,
        fail_progress_writes: AtomicBool,
        fail_status_writes: AtomicBool,
        fail_lookups: AtomicBool,
    }

    impl FakeEntities {
        fn with(ids: &[&str]) -> Arc<Self> {
            let fake = Self::default();
            for id in ids {
                fake.rows.lock().insert(
                    id.to_string(),
                    EntityRow {
                        source_id: format!("src-{id}"),
                        url: format!("https://youtu.be/{id}"),
                        ..EntityRow::default()
                    },
                );
            }
            Arc::new(fake)
        }

        fn row(&self, id: &str) -> EntityRow {
            self.rows.lock().get(id).cloned().expect("row exists")
        }

        fn patch_count(&self, id: &str) -> usize {
            self.patches.lock().iter().filter(|(e, _)| e == id).count()
        }

        fn progress_writes(&self, id: &str) -> Vec<f64> {
            self.patches
                .lock()
                .iter()
                .filter(|(e, patch)| e == id && patch.status.is_none())
                .filter_map(|(_, patch)| patch.progress.flatten())
                .collect()
        }
    }

    #[async_trait]
    impl EntityStatusStore for FakeEntities {
        async fn download_target(&self, entity_id: &str) -> Result<Option<DownloadTarget>> {
            if self.fail_lookups.load(Ordering::SeqCst) {
                bail!("database is locked");
            }
            Ok(self.rows.lock().get(entity_id).map(|row| DownloadTarget {
                entity_id: entity_id.to_string(),
                source_id: row.source_id.clone(),
                url: row.url.clone(),
            }))
        }

        async fn update_download(&self, entity_id: &str, patch: DownloadPatch) -> Result<()> {
            self.patches
                .lock()
                .push((entity_id.to_string(), patch.clone()));
            if patch.status.is_none() && self.fail_progress_writes.load(Ordering::SeqCst) {
                bail!("disk full");
            }
            if patch.status == Some(DownloadStatus::Failed)
                && self.fail_status_writes.load(Ordering::SeqCst)
            {
                bail!("db gone");
            }
            let mut rows = self.rows.lock();
            let row = rows
                .get_mut(entity_id)
                .ok_or_else(|| anyhow!("video {entity_id} not found"))?;
            if let Some(status) = patch.status {
                row.status = status;
            }
            if let Some(progress) = patch.progress {
                row.progress = progress;
            }
            if let Some(location) = patch.location {
                row.location = Some(location);
            }
            Ok(())
        }
    }

    /// Emits a fixed progress sequence, writes a small file, and records
    /// whether two fetches ever overlapped.
    struct FakeFetcher {
        steps: Vec<f64>,
        fail_with: Option<String>,
        delay: Duration,
        calls: AtomicUsize,
        running: AtomicBool,
        overlapped: AtomicBool,
        urls: parking_lot::Mutex<Vec<String>>,
        leave_partial: bool,
        leave_fragments: bool,
    }

    impl FakeFetcher {
        fn succeeding(steps: Vec<f64>) -> Self {
            Self {
                steps,
                fail_with: None,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                running: AtomicBool::new(false),
                overlapped: AtomicBool::new(false),
                urls: parking_lot::Mutex::new(Vec::new()),
                leave_partial: false,
                leave_fragments: false,
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                fail_with: Some(message.to_string()),
                leave_partial: true,
                ..Self::succeeding(vec![12.0])
            }
        }
    }

    #[async_trait]
    impl MediaFetcher for FakeFetcher {
        async fn fetch_metadata(&self, _url: &str) -> Result<crate::fetcher::MediaMetadata> {
            bail!("not used by the pipeline")
        }

        async fn fetch_media(
            &self,
            url: &str,
            dest: &Path,
            progress: UnboundedSender<f64>,
        ) -> Result<()> {
            if self.running.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().push(url.to_string());

            for step in &self.steps {
                let _ = progress.send(*step);
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            tokio::time::sleep(self.delay).await;

            let result = match &self.fail_with {
                Some(message) => {
                    if self.leave_partial {
                        let mut partial = dest.as_os_str().to_owned();
                        partial.push(".part");
                        tokio::fs::write(PathBuf::from(partial), b"half").await?;
                    }
                    if self.leave_fragments {
                        let stem = dest.with_extension("");
                        for suffix in ["f137.mp4", "f140.m4a.part", "f140.m4a.ytdl"] {
                            let mut fragment = stem.as_os_str().to_owned();
                            fragment.push(format!(".{suffix}"));
                            tokio::fs::write(PathBuf::from(fragment), b"frag").await?;
                        }
                    }
                    Err(anyhow!("yt-dlp exited with code 1: {message}"))
                }
                None => {
                    tokio::fs::write(dest, b"video-bytes").await?;
                    Ok(())
                }
            };
            self.running.store(false, Ordering::SeqCst);
            result
        }
    }

    #[derive(Default)]
    struct FakeBlobs {
        unconfigured: bool,
        fail_uploads: bool,
        uploads: parking_lot::Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl BlobStore for FakeBlobs {
        fn is_configured(&self) -> bool {
            !self.unconfigured
        }

        fn bucket(&self) -> Option<&str> {
            (!self.unconfigured).then_some("media")
        }

        async fn upload(&self, key: &str, source: &Path, content_type: &str) -> Result<u64> {
            if self.fail_uploads {
                bail!("connection reset");
            }
            let size = tokio::fs::metadata(source).await?.len();
            self.uploads
                .lock()
                .push((key.to_string(), content_type.to_string()));
            Ok(size)
        }

        async fn delete(&self, _key: &str) -> Result<()> {
            Ok(())
        }

        async fn presigned_url(&self, key: &str, _ttl: Duration) -> Result<String> {
            Ok(format!("https://signed.example/{key}"))
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        work_dir: PathBuf,
        queue: DownloadQueue,
        entities: Arc<FakeEntities>,
        fetcher: Arc<FakeFetcher>,
        blobs: Arc<FakeBlobs>,
    }

    fn harness(fetcher: FakeFetcher, blobs: FakeBlobs, entities: Arc<FakeEntities>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let work_dir = dir.path().join("work");
        let fetcher = Arc::new(fetcher);
        let blobs = Arc::new(blobs);
        let queue = DownloadQueue::new(
            fetcher.clone(),
            blobs.clone(),
            entities.clone(),
            work_dir.clone(),
            RetentionSettings::default(),
        );
        Harness {
            _dir: dir,
            work_dir,
            queue,
            entities,
            fetcher,
            blobs,
        }
    }

    async fn wait_terminal(queue: &DownloadQueue, job_id: &str) -> JobStatusView {
        for _ in 0..500 {
            if let Some(view) = queue.job_status(job_id) {
                if view.status.is_terminal() {
                    return view;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never finished");
    }

    fn ten_to_hundred() -> Vec<f64> {
        (1..=10).map(|n| f64::from(n) * 10.0).collect()
    }

    #[tokio::test]
    async fn successful_job_records_location_on_entity() {
        let h = harness(
            FakeFetcher::succeeding(ten_to_hundred()),
            FakeBlobs::default(),
            FakeEntities::with(&["e1"]),
        );
        h.queue.start().unwrap();

        let job = h.queue.enqueue("e1").job;
        let view = wait_terminal(&h.queue, &job.id).await;

        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.progress, 100.0);
        assert!(view.error.is_none());

        let row = h.entities.row("e1");
        assert_eq!(row.status, DownloadStatus::Completed);
        assert_eq!(row.progress, Some(100.0));
        let location = row.location.expect("location recorded");
        assert_eq!(location.key, "videos/src-e1/src-e1.mp4");
        assert_eq!(location.bucket, "media");
        assert_eq!(location.file_size, b"video-bytes".len() as u64);
        assert_eq!(location.mime_type, "video/mp4");

        assert_eq!(
            h.blobs.uploads.lock().clone(),
            vec![("videos/src-e1/src-e1.mp4".to_string(), "video/mp4".to_string())]
        );
        assert_eq!(h.fetcher.urls.lock().clone(), vec!["https://youtu.be/e1"]);
        assert!(!h.work_dir.join(temp_file_name("src-e1")).exists());

        let job = h.queue.registry().get(&job.id).unwrap();
        assert!(job.started_at.is_some() && job.completed_at.is_some());
        h.queue.stop().await;
    }

    #[tokio::test]
    async fn fetch_failure_fails_job_and_clears_entity_progress() {
        let h = harness(
            FakeFetcher::failing("ERROR: Video unavailable"),
            FakeBlobs::default(),
            FakeEntities::with(&["e2"]),
        );
        h.queue.start().unwrap();

        let job = h.queue.enqueue("e2").job;
        let view = wait_terminal(&h.queue, &job.id).await;

        assert_eq!(view.status, JobStatus::Failed);
        let error = view.error.expect("error message");
        assert!(error.contains("Video unavailable"), "{error}");

        let row = h.entities.row("e2");
        assert_eq!(row.status, DownloadStatus::Failed);
        assert_eq!(row.progress, None);
        assert!(row.location.is_none());

        let temp = h.work_dir.join(temp_file_name("src-e2"));
        assert!(!temp.exists());
        assert!(!h.work_dir.join(format!("{}.part", temp_file_name("src-e2"))).exists());
        h.queue.stop().await;
    }

    #[tokio::test]
    async fn upload_failure_fails_job() {
        let h = harness(
            FakeFetcher::succeeding(vec![100.0]),
            FakeBlobs {
                fail_uploads: true,
                ..FakeBlobs::default()
            },
            FakeEntities::with(&["e"]),
        );
        h.queue.start().unwrap();

        let job = h.queue.enqueue("e").job;
        let view = wait_terminal(&h.queue, &job.id).await;
        assert_eq!(view.status, JobStatus::Failed);
        assert!(view.error.unwrap().starts_with("upload failed"));
        assert_eq!(h.entities.row("e").status, DownloadStatus::Failed);
        assert!(!h.work_dir.join(temp_file_name("src-e")).exists());
        h.queue.stop().await;
    }

    #[tokio::test]
    async fn unconfigured_storage_fails_without_fetching() {
        let h = harness(
            FakeFetcher::succeeding(ten_to_hundred()),
            FakeBlobs {
                unconfigured: true,
                ..FakeBlobs::default()
            },
            FakeEntities::with(&["e3"]),
        );
        h.queue.start().unwrap();

        let job = h.queue.enqueue("e3").job;
        let view = wait_terminal(&h.queue, &job.id).await;

        assert_eq!(view.status, JobStatus::Failed);
        assert_eq!(view.error.as_deref(), Some("object storage is not configured"));
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 0);
        let row = h.entities.row("e3");
        assert_eq!(row.status, DownloadStatus::Failed);
        assert_eq!(row.progress, None);
        h.queue.stop().await;
    }

    #[tokio::test]
    async fn missing_entity_fails_without_touching_the_store() {
        let h = harness(
            FakeFetcher::succeeding(vec![100.0]),
            FakeBlobs::default(),
            FakeEntities::with(&[]),
        );
        h.queue.start().unwrap();

        let job = h.queue.enqueue("ghost").job;
        let view = wait_terminal(&h.queue, &job.id).await;

        assert_eq!(view.error.as_deref(), Some("entity not found"));
        assert_eq!(h.entities.patch_count("ghost"), 0);
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 0);
        h.queue.stop().await;
    }

    #[tokio::test]
    async fn lookup_errors_fail_the_job_with_the_cause() {
        let entities = FakeEntities::with(&["e"]);
        entities.fail_lookups.store(true, Ordering::SeqCst);
        let h = harness(FakeFetcher::succeeding(vec![]), FakeBlobs::default(), entities);
        h.queue.start().unwrap();

        let job = h.queue.enqueue("e").job;
        let view = wait_terminal(&h.queue, &job.id).await;
        assert!(view.error.unwrap().contains("database is locked"));
        assert_eq!(h.entities.row("e").status, DownloadStatus::Failed);
        h.queue.stop().await;
    }

    #[tokio::test]
    async fn back_to_back_enqueues_share_one_job() {
        let h = harness(
            FakeFetcher::succeeding(vec![100.0]),
            FakeBlobs::default(),
            FakeEntities::with(&["e4"]),
        );
        // Not started: nothing can claim the job between the two calls.
        let first = h.queue.enqueue("e4");
        let second = h.queue.enqueue("e4");
        assert!(first.created && !second.created);
        assert_eq!(first.job.id, second.job.id);
        assert_eq!(h.queue.registry().len(), 1);

        h.queue.start().unwrap();
        wait_terminal(&h.queue, &first.job.id).await;
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 1);
        h.queue.stop().await;
    }

    #[tokio::test]
    async fn progress_writes_are_throttled_and_deduplicated() {
        let steps = vec![1.0, 4.9, 5.0, 5.7, 3.0, 9.9, 12.0, 15.2, 40.0, 40.5, 73.0, 100.0];
        let h = harness(
            FakeFetcher::succeeding(steps),
            FakeBlobs::default(),
            FakeEntities::with(&["e"]),
        );
        h.queue.start().unwrap();

        let job = h.queue.enqueue("e").job;
        wait_terminal(&h.queue, &job.id).await;

        // 73 is skipped: it never lands on a multiple of five.
        assert_eq!(h.entities.progress_writes("e"), vec![5.0, 15.2, 40.0, 100.0]);
        h.queue.stop().await;
    }

    #[tokio::test]
    async fn progress_persist_failures_become_warnings() {
        let entities = FakeEntities::with(&["e"]);
        entities.fail_progress_writes.store(true, Ordering::SeqCst);
        let h = harness(
            FakeFetcher::succeeding(ten_to_hundred()),
            FakeBlobs::default(),
            entities,
        );
        h.queue.start().unwrap();

        let job = h.queue.enqueue("e").job;
        let view = wait_terminal(&h.queue, &job.id).await;

        assert_eq!(view.status, JobStatus::Completed);
        assert!(view.error.is_none());
        assert_eq!(view.warnings.len(), 10);
        assert!(view.warnings[0].contains("disk full"));
        assert_eq!(h.entities.row("e").status, DownloadStatus::Completed);
        h.queue.stop().await;
    }

    #[tokio::test]
    async fn observed_progress_never_decreases() {
        let steps = vec![10.0, 30.0, 20.0, 50.0, 45.0, 80.0, 100.0];
        let mut fetcher = FakeFetcher::succeeding(steps);
        fetcher.delay = Duration::from_millis(20);
        let h = harness(fetcher, FakeBlobs::default(), FakeEntities::with(&["e"]));
        h.queue.start().unwrap();

        let job = h.queue.enqueue("e").job;
        let mut last = 0.0;
        loop {
            let view = h.queue.job_status(&job.id).unwrap();
            assert!(view.progress >= last, "{} < {last}", view.progress);
            last = view.progress;
            if view.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        h.queue.stop().await;
    }

    #[tokio::test]
    async fn jobs_run_one_at_a_time_in_fifo_order() {
        let mut fetcher = FakeFetcher::succeeding(vec![50.0, 100.0]);
        fetcher.delay = Duration::from_millis(15);
        let h = harness(fetcher, FakeBlobs::default(), FakeEntities::with(&["a", "b", "c"]));

        let ids: Vec<String> = ["a", "b", "c"]
            .iter()
            .map(|e| h.queue.enqueue(e).job.id)
            .collect();
        assert!(h.queue.active_job_for_entity("b").is_some());
        h.queue.start().unwrap();

        for id in &ids {
            assert_eq!(wait_terminal(&h.queue, id).await.status, JobStatus::Completed);
        }
        assert!(!h.fetcher.overlapped.load(Ordering::SeqCst));
        assert_eq!(
            h.fetcher.urls.lock().clone(),
            vec!["https://youtu.be/a", "https://youtu.be/b", "https://youtu.be/c"]
        );
        assert!(h.queue.active_job_for_entity("b").is_none());
        h.queue.stop().await;
    }

    #[tokio::test]
    async fn stop_lets_the_running_job_finish() {
        let mut fetcher = FakeFetcher::succeeding(vec![100.0]);
        fetcher.delay = Duration::from_millis(50);
        let h = harness(fetcher, FakeBlobs::default(), FakeEntities::with(&["a", "b"]));
        h.queue.start().unwrap();

        let first = h.queue.enqueue("a").job.id;
        while h.fetcher.calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let second = h.queue.enqueue("b").job.id;
        h.queue.stop().await;

        assert_eq!(h.queue.job_status(&first).unwrap().status, JobStatus::Completed);
        assert_eq!(h.queue.job_status(&second).unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn failed_merge_leaves_no_format_fragments_behind() {
        let mut fetcher = FakeFetcher::failing("ERROR: Postprocessing: merge failed");
        fetcher.leave_fragments = true;
        let h = harness(fetcher, FakeBlobs::default(), FakeEntities::with(&["e", "other"]));
        h.queue.start().unwrap();
        // Another video's file shares the prefix but not the stem.
        std::fs::write(h.work_dir.join(temp_file_name("src-other")), b"x").unwrap();

        let job = h.queue.enqueue("e").job;
        let view = wait_terminal(&h.queue, &job.id).await;
        assert_eq!(view.status, JobStatus::Failed);

        let leftover: Vec<String> = std::fs::read_dir(&h.work_dir)
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(leftover, vec![temp_file_name("src-other")]);
        h.queue.stop().await;
    }

    #[tokio::test]
    async fn failure_status_write_errors_keep_the_original_cause() {
        let entities = FakeEntities::with(&["e"]);
        entities.fail_status_writes.store(true, Ordering::SeqCst);
        let h = harness(
            FakeFetcher::failing("ERROR: boom"),
            FakeBlobs::default(),
            entities,
        );
        h.queue.start().unwrap();

        let job = h.queue.enqueue("e").job;
        let view = wait_terminal(&h.queue, &job.id).await;

        assert_eq!(view.status, JobStatus::Failed);
        let error = view.error.expect("error message");
        assert!(error.starts_with("download failed"), "{error}");
        assert!(error.contains("boom"), "{error}");
        assert_eq!(view.warnings.len(), 1);
        assert!(view.warnings[0].contains("failure status"));
        assert!(view.warnings[0].contains("db gone"));
        // The rejected write never reached the row.
        assert_eq!(h.entities.row("e").status, DownloadStatus::Downloading);
        h.queue.stop().await;
    }

    #[tokio::test]
    async fn start_sweeps_leftover_temp_files() {
        let h = harness(
            FakeFetcher::succeeding(vec![]),
            FakeBlobs::default(),
            FakeEntities::with(&[]),
        );
        std::fs::create_dir_all(&h.work_dir).unwrap();
        std::fs::write(h.work_dir.join("ytdl-old.mp4"), b"x").unwrap();
        std::fs::write(h.work_dir.join("ytdl-old.mp4.part"), b"x").unwrap();
        std::fs::write(h.work_dir.join("keep.txt"), b"x").unwrap();

        h.queue.start().unwrap();
        assert!(!h.work_dir.join("ytdl-old.mp4").exists());
        assert!(!h.work_dir.join("ytdl-old.mp4.part").exists());
        assert!(h.work_dir.join("keep.txt").exists());
        h.queue.stop().await;
    }
}
