//! Background model downloads with heuristic progress.
//!
//! Progress while a transfer runs is estimated from elapsed sampling ticks,
//! not from transferred bytes: the sampler records the on-disk size it sees
//! and bumps the percentage by a fixed step, capped below 100 until the
//! transfer finishes. Treat it as an indication of liveness, not a measure.

pub mod hub;

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::{channel, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::backends::panic_message;
use crate::models::{self, ModelStore};

const PROGRESS_STEP: u8 = 5;
const PROGRESS_CAP: u8 = 95;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Downloading,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadErrorKind {
    Authentication,
    NotFound,
    Network,
    Permission,
    Unknown,
}

impl DownloadErrorKind {
    /// Walks the error chain for an HTTP status or I/O error kind.
    pub fn classify(error: &anyhow::Error) -> Self {
        for cause in error.chain() {
            if let Some(http) = cause.downcast_ref::<reqwest::Error>() {
                if let Some(status) = http.status() {
                    match status.as_u16() {
                        401 | 403 => return Self::Authentication,
                        404 => return Self::NotFound,
                        _ => {}
                    }
                }
                if http.is_connect() || http.is_timeout() || http.is_request() || http.is_body() {
                    return Self::Network;
                }
            }
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                use std::io::ErrorKind;
                match io.kind() {
                    ErrorKind::PermissionDenied | ErrorKind::ReadOnlyFilesystem => {
                        return Self::Permission
                    }
                    ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::TimedOut
                    | ErrorKind::UnexpectedEof => return Self::Network,
                    _ => {}
                }
            }
        }
        Self::Unknown
    }

    pub fn message(self, error: &anyhow::Error) -> String {
        match self {
            Self::Authentication => "Authentication failed – check the access token".to_string(),
            Self::NotFound => "Model not found on the hub".to_string(),
            Self::Network => "Network error while downloading".to_string(),
            Self::Permission => "Permission denied writing model files".to_string(),
            Self::Unknown => format!("{error:#}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DownloadTask {
    pub download_id: String,
    pub model_id: String,
    pub status: DownloadStatus,
    pub progress: u8,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub file_count: usize,
    pub message: String,
    pub error: Option<String>,
    pub error_kind: Option<DownloadErrorKind>,
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StartOutcome {
    Started { download_id: String },
    AlreadyDownloaded { model_id: String, path: PathBuf },
}

/// Transfers every file of a model repository into a local directory.
pub trait SnapshotFetcher: Send + Sync {
    fn fetch(&self, model_id: &str, token: Option<&str>, dest: &std::path::Path) -> Result<()>;
}

#[derive(Clone)]
pub struct DownloadTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    models: ModelStore,
    fetcher: Arc<dyn SnapshotFetcher>,
    sample_interval: Duration,
    tasks: Mutex<TaskTable>,
}

#[derive(Default)]
struct TaskTable {
    tasks: HashMap<String, DownloadTask>,
    next_sequence: u64,
}

impl fmt::Debug for DownloadTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadTracker")
            .field("models_dir", &self.inner.models.models_dir())
            .field("sample_interval", &self.inner.sample_interval)
            .finish_non_exhaustive()
    }
}

pub fn download_id_for(model_id: &str, unix_millis: i64) -> String {
    format!("{}-{unix_millis}", models::model_dir_name(model_id))
}

impl DownloadTracker {
    pub fn new(models: ModelStore, fetcher: Arc<dyn SnapshotFetcher>, sample_interval: Duration) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                models,
                fetcher,
                sample_interval: sample_interval.max(Duration::from_millis(1)),
                tasks: Mutex::new(TaskTable::default()),
            }),
        }
    }

    /// Starts a background transfer, or reports that the model is already
    /// on disk. Concurrent downloads of one model are not deduplicated.
    pub fn start(&self, model_id: &str, token: Option<String>) -> Result<StartOutcome> {
        let model_id = model_id.trim();
        if model_id.is_empty() {
            bail!("model_id is required");
        }
        if self.inner.models.is_downloaded(model_id) {
            return Ok(StartOutcome::AlreadyDownloaded {
                model_id: model_id.to_string(),
                path: self.inner.models.model_dir(model_id),
            });
        }

        let download_id = self.register(model_id)?;

        info!(download_id = %download_id, model_id, "model download started");
        let inner = Arc::clone(&self.inner);
        let worker_id = download_id.clone();
        let worker_model = model_id.to_string();
        let spawned = thread::Builder::new()
            .name(format!("download-{download_id}"))
            .spawn(move || inner.run(&worker_id, &worker_model, token.as_deref()));
        if let Err(e) = spawned {
            let error = anyhow!("failed to spawn download worker: {e}");
            self.inner.fail(&download_id, DownloadErrorKind::Unknown, format!("{error:#}"));
            return Err(error);
        }

        Ok(StartOutcome::Started { download_id })
    }

    /// Inserts a fresh `Downloading` task with an id unique in the table.
    fn register(&self, model_id: &str) -> Result<String> {
        let mut table = self.lock()?;
        let started_at = Utc::now();
        let mut millis = started_at.timestamp_millis();
        let mut download_id = download_id_for(model_id, millis);
        while table.tasks.contains_key(&download_id) {
            millis += 1;
            download_id = download_id_for(model_id, millis);
        }
        table.next_sequence += 1;
        let task = DownloadTask {
            download_id: download_id.clone(),
            model_id: model_id.to_string(),
            status: DownloadStatus::Downloading,
            progress: 0,
            downloaded_bytes: 0,
            total_bytes: 0,
            file_count: 0,
            message: "Starting download".to_string(),
            error: None,
            error_kind: None,
            started_at,
            sequence: table.next_sequence,
        };
        table.tasks.insert(download_id.clone(), task);
        Ok(download_id)
    }

    pub fn get(&self, download_id: &str) -> Option<DownloadTask> {
        self.lock().ok()?.tasks.get(download_id).cloned()
    }

    /// Most recently started task for `model_id`.
    pub fn get_by_model(&self, model_id: &str) -> Option<DownloadTask> {
        self.lock()
            .ok()?
            .tasks
            .values()
            .filter(|task| task.model_id == model_id)
            .max_by_key(|task| task.sequence)
            .cloned()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, TaskTable>> {
        self.inner.lock()
    }
}

impl TrackerInner {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, TaskTable>> {
        self.tasks
            .lock()
            .map_err(|_| anyhow!("download table lock poisoned"))
    }

    fn update(&self, download_id: &str, f: impl FnOnce(&mut DownloadTask)) {
        match self.lock() {
            Ok(mut table) => {
                if let Some(task) = table.tasks.get_mut(download_id) {
                    f(task);
                }
            }
            Err(e) => warn!(download_id, error = %e, "cannot update download task"),
        }
    }

    fn run(&self, download_id: &str, model_id: &str, token: Option<&str>) {
        let dest = self.models.model_dir(model_id);
        self.update(download_id, |task| {
            task.message = format!("Downloading {model_id}");
        });

        let (stop_tx, stop_rx) = channel::<()>();
        let dest_ref = dest.as_path();
        let outcome = thread::scope(|scope| {
            scope.spawn(move || self.sample(download_id, dest_ref, stop_rx));
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                self.fetcher.fetch(model_id, token, &dest)
            }))
            .unwrap_or_else(|panic| Err(anyhow!("download worker panicked: {}", panic_message(&panic))));
            let _ = stop_tx.send(());
            outcome
        });

        let outcome = outcome.and_then(|()| {
            let files = models::file_count(&dest);
            if files == 0 {
                bail!("no files were downloaded for {model_id}");
            }
            Ok(files)
        });

        match outcome {
            Ok(files) => {
                let bytes = models::dir_size(&dest);
                self.update(download_id, |task| {
                    task.status = DownloadStatus::Completed;
                    task.progress = 100;
                    task.downloaded_bytes = bytes;
                    task.total_bytes = bytes;
                    task.file_count = files;
                    task.message = format!("Downloaded {files} files");
                });
                info!(download_id, model_id, files, bytes, "model download completed");
            }
            Err(e) => {
                let kind = DownloadErrorKind::classify(&e);
                warn!(download_id, model_id, kind = ?kind, error = %format!("{e:#}"), "model download failed");
                self.fail(download_id, kind, kind.message(&e));
            }
        }
    }

    fn fail(&self, download_id: &str, kind: DownloadErrorKind, message: String) {
        self.update(download_id, |task| {
            task.status = DownloadStatus::Failed;
            task.error = Some(message.clone());
            task.error_kind = Some(kind);
            task.message = message;
        });
    }

    /// Records the on-disk size every interval and nudges progress forward.
    fn sample(&self, download_id: &str, dest: &std::path::Path, stop: std::sync::mpsc::Receiver<()>) {
        loop {
            match stop.recv_timeout(self.sample_interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    let size = models::dir_size(dest);
                    self.update(download_id, |task| {
                        if task.status != DownloadStatus::Downloading {
                            return;
                        }
                        task.downloaded_bytes = size;
                        task.total_bytes = task.total_bytes.max(size);
                        task.progress = task.progress.saturating_add(PROGRESS_STEP).min(PROGRESS_CAP);
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use std::time::Instant;

    struct FakeFetcher {
        delay: Duration,
        result: fn(&Path) -> Result<()>,
    }

    impl SnapshotFetcher for FakeFetcher {
        fn fetch(&self, _model_id: &str, _token: Option<&str>, dest: &Path) -> Result<()> {
            fs::create_dir_all(dest)?;
            fs::write(dest.join("weights.bin"), [0u8; 64])?;
            thread::sleep(self.delay);
            (self.result)(dest)
        }
    }

    fn write_marker(dest: &Path) -> Result<()> {
        fs::write(dest.join(models::COMPLETION_MARKER), b"{}")?;
        Ok(())
    }

    fn tracker(root: &Path, delay_ms: u64, result: fn(&Path) -> Result<()>) -> DownloadTracker {
        DownloadTracker::new(
            ModelStore::new(root),
            Arc::new(FakeFetcher {
                delay: Duration::from_millis(delay_ms),
                result,
            }),
            Duration::from_millis(10),
        )
    }

    fn wait_terminal(tracker: &DownloadTracker, id: &str) -> DownloadTask {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let task = tracker.get(id).expect("task exists");
            if task.status != DownloadStatus::Downloading {
                return task;
            }
            assert!(Instant::now() < deadline, "download did not finish");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn started_id(outcome: StartOutcome) -> String {
        match outcome {
            StartOutcome::Started { download_id } => download_id,
            other => panic!("expected start, got {other:?}"),
        }
    }

    #[test]
    fn test_task_left_without_worker_is_marked_failed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tracker = tracker(temp.path(), 0, write_marker);
        let id = tracker.register("org/model").expect("register");
        assert_eq!(tracker.get(&id).expect("task").status, DownloadStatus::Downloading);

        tracker.inner.fail(
            &id,
            DownloadErrorKind::Unknown,
            "failed to spawn download worker: out of threads".to_string(),
        );

        let task = tracker.get_by_model("org/model").expect("task");
        assert_eq!(task.download_id, id);
        assert_eq!(task.status, DownloadStatus::Failed);
        assert_eq!(task.error_kind, Some(DownloadErrorKind::Unknown));
        assert!(task.error.as_deref().unwrap_or_default().contains("out of threads"));
    }

    #[test]
    fn test_download_ids_flatten_model_ids() {
        assert_eq!(download_id_for("org/name", 1700), "org__name-1700");
    }

    #[test]
    fn test_successful_download_completes_with_counts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tracker = tracker(temp.path(), 0, write_marker);
        let id = started_id(tracker.start("org/model", None).expect("start"));

        let task = wait_terminal(&tracker, &id);
        assert_eq!(task.status, DownloadStatus::Completed);
        assert_eq!(task.progress, 100);
        assert_eq!(task.file_count, 2);
        assert_eq!(task.downloaded_bytes, 66);
        assert!(ModelStore::new(temp.path()).is_downloaded("org/model"));
    }

    #[test]
    fn test_already_downloaded_model_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = ModelStore::new(temp.path());
        fs::create_dir_all(store.model_dir("org/model")).expect("mkdir");
        write_marker(&store.model_dir("org/model")).expect("marker");

        let tracker = tracker(temp.path(), 0, write_marker);
        match tracker.start("org/model", None).expect("start") {
            StartOutcome::AlreadyDownloaded { model_id, path } => {
                assert_eq!(model_id, "org/model");
                assert_eq!(path, store.model_dir("org/model"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_progress_is_capped_and_monotonic_while_running() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tracker = tracker(temp.path(), 400, write_marker);
        let id = started_id(tracker.start("org/slow", None).expect("start"));

        let mut last = 0;
        loop {
            let task = tracker.get(&id).expect("task");
            if task.status != DownloadStatus::Downloading {
                assert_eq!(task.progress, 100);
                break;
            }
            assert!(task.progress >= last);
            assert!(task.progress <= PROGRESS_CAP);
            last = task.progress;
            thread::sleep(Duration::from_millis(3));
        }
        assert!(last > 0, "sampler never advanced progress");
    }

    #[test]
    fn test_permission_errors_are_classified() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tracker = tracker(temp.path(), 0, |_| {
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only").into())
        });
        let id = started_id(tracker.start("org/model", None).expect("start"));

        let task = wait_terminal(&tracker, &id);
        assert_eq!(task.status, DownloadStatus::Failed);
        assert_eq!(task.error_kind, Some(DownloadErrorKind::Permission));
        assert_eq!(task.error.as_deref(), Some("Permission denied writing model files"));
    }

    #[test]
    fn test_panicking_fetcher_becomes_a_failed_task() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tracker = tracker(temp.path(), 0, |_| panic!("boom"));
        let id = started_id(tracker.start("org/model", None).expect("start"));

        let task = wait_terminal(&tracker, &id);
        assert_eq!(task.status, DownloadStatus::Failed);
        assert_eq!(task.error_kind, Some(DownloadErrorKind::Unknown));
        assert!(task.error.expect("error").contains("boom"));
    }

    #[test]
    fn test_latest_task_wins_lookup_by_model() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tracker = tracker(temp.path(), 0, |_| Err(anyhow!("nope")));
        let first = started_id(tracker.start("org/model", None).expect("first"));
        let second = started_id(tracker.start("org/model", None).expect("second"));
        assert_ne!(first, second);

        wait_terminal(&tracker, &first);
        wait_terminal(&tracker, &second);
        let latest = tracker.get_by_model("org/model").expect("latest");
        assert_eq!(latest.download_id, second);
        assert!(tracker.get_by_model("org/other").is_none());
    }

    #[test]
    fn test_unknown_errors_keep_their_text() {
        let err = anyhow!("disk exploded");
        let kind = DownloadErrorKind::classify(&err);
        assert_eq!(kind, DownloadErrorKind::Unknown);
        assert_eq!(kind.message(&err), "disk exploded");
    }

    #[test]
    fn test_io_network_errors_are_network() {
        let err = anyhow::Error::new(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"))
            .context("while fetching");
        assert_eq!(DownloadErrorKind::classify(&err), DownloadErrorKind::Network);
    }
}
