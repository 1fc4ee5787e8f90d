//! In-memory job table and the per-job worker that drives generation from
//! request to stored video.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Instant;

use anyhow::{anyhow, bail, Result};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::backends::cloud::is_valid_token;
use crate::backends::{panic_message, run_fallback_chain, BackendKind, BackendOutput, BackendRequest, BackendSet};
use crate::params::GenerationRequest;
use crate::storage::{VideoRecord, VideoStore};
use crate::video::assembler;

pub const MSG_EMPTY_PROMPT: &str = "Empty prompt";
pub const MSG_TOKEN_REQUIRED: &str = "Hugging Face token required for cloud generation";
pub const MSG_TOKEN_INVALID: &str = "Invalid Hugging Face API token";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub video_id: Option<String>,
    pub error: Option<String>,
    pub elapsed_seconds: Option<f64>,
}

impl Job {
    fn failed_at_submit(job_id: String, error: String) -> Self {
        Self {
            job_id,
            status: JobStatus::Failed,
            progress: 0,
            message: "Failed".to_string(),
            video_id: None,
            error: Some(error),
            elapsed_seconds: Some(0.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SubmitResponse {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Job> for SubmitResponse {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            status: job.status,
            video_id: job.video_id.clone(),
            error: job.error.clone(),
        }
    }
}

/// Submits generation jobs and answers status polls.
///
/// Every accepted job gets its own OS thread; there is no worker pool and
/// no admission limit.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: VideoStore,
    backends: BackendSet,
    default_token: Option<String>,
    jobs: Mutex<HashMap<String, Job>>,
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("store", &self.inner.store)
            .field("default_token", &self.inner.default_token.as_ref().map(|_| "***"))
            .finish_non_exhaustive()
    }
}

impl JobManager {
    pub fn new(store: VideoStore, backends: BackendSet, default_token: Option<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                backends,
                default_token: default_token.filter(|token| !token.trim().is_empty()),
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &VideoStore {
        &self.inner.store
    }

    /// Token from the request, falling back to the configured default.
    pub fn resolve_token(&self, request: &GenerationRequest) -> Option<String> {
        request
            .token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .or_else(|| self.inner.default_token.clone())
    }

    /// Why a cloud-enabled request cannot be accepted, if it cannot.
    pub fn credential_problem(&self, request: &GenerationRequest) -> Option<&'static str> {
        if !request.use_cloud {
            return None;
        }
        match self.resolve_token(request) {
            None => Some(MSG_TOKEN_REQUIRED),
            Some(token) if !is_valid_token(&token) => Some(MSG_TOKEN_INVALID),
            Some(_) => None,
        }
    }

    /// Registers a job and dispatches its worker without waiting for it.
    /// Validation failures yield a job that is already `failed`.
    pub fn submit(&self, request: GenerationRequest) -> SubmitResponse {
        let submitted = Instant::now();
        let job_id = uuid::Uuid::new_v4().to_string();

        if !request.has_prompt() {
            return self.reject(Job::failed_at_submit(job_id, MSG_EMPTY_PROMPT.to_string()));
        }
        if let Some(problem) = self.credential_problem(&request) {
            return self.reject(Job::failed_at_submit(job_id, problem.to_string()));
        }

        let params = request.clamped();
        let record = match self.inner.store.create_entry(&params) {
            Ok(record) => record,
            Err(e) => {
                let message = format!("storage init failed: {e:#}");
                return self.reject(Job::failed_at_submit(job_id, message));
            }
        };

        let token = if params.backend.use_cloud {
            self.resolve_token(&request)
        } else {
            None
        };
        let backend_request = BackendRequest::from_params(&params, token);

        let job = Job {
            job_id: job_id.clone(),
            status: JobStatus::Pending,
            progress: 0,
            message: "Queued for processing".to_string(),
            video_id: Some(record.id.clone()),
            error: None,
            elapsed_seconds: None,
        };
        let response = SubmitResponse::from(&job);
        self.insert(job);
        info!(
            job_id = %job_id,
            video_id = %record.id,
            frames = params.num_frames,
            width = params.width,
            height = params.height,
            use_cloud = params.backend.use_cloud,
            local_model = ?params.backend.local_model,
            "job submitted"
        );

        let inner = Arc::clone(&self.inner);
        let worker_id = job_id.clone();
        let spawned = thread::Builder::new()
            .name(format!("job-{job_id}"))
            .spawn(move || inner.run(&worker_id, &record, &backend_request, submitted));
        if let Err(e) = spawned {
            error!(job_id = %job_id, error = %e, "failed to spawn job worker");
            self.inner.finish(&job_id, Err(anyhow!("failed to spawn job worker: {e}")), submitted);
            return self.get_status(&job_id).map_or(response, |job| SubmitResponse::from(&job));
        }

        response
    }

    pub fn get_status(&self, job_id: &str) -> Option<Job> {
        self.inner.lock().ok()?.get(job_id).cloned()
    }

    fn reject(&self, job: Job) -> SubmitResponse {
        warn!(job_id = %job.job_id, error = ?job.error, "job rejected at submission");
        let response = SubmitResponse::from(&job);
        self.insert(job);
        response
    }

    fn insert(&self, job: Job) {
        match self.inner.lock() {
            Ok(mut jobs) => {
                jobs.insert(job.job_id.clone(), job);
            }
            Err(e) => error!(job_id = %job.job_id, error = %e, "cannot record job"),
        }
    }
}

impl Inner {
    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Job>>> {
        self.jobs.lock().map_err(|_| anyhow!("job table lock poisoned"))
    }

    fn update(&self, job_id: &str, f: impl FnOnce(&mut Job)) {
        match self.lock() {
            Ok(mut jobs) => {
                if let Some(job) = jobs.get_mut(job_id) {
                    f(job);
                }
            }
            Err(e) => warn!(job_id, error = %e, "cannot update job"),
        }
    }

    /// Moves a running job forward. Progress never goes backwards.
    fn progress(&self, job_id: &str, progress: u8, message: &str) {
        self.update(job_id, |job| {
            job.status = JobStatus::Processing;
            job.progress = job.progress.max(progress.min(100));
            job.message = message.to_string();
        });
    }

    fn run(&self, job_id: &str, record: &VideoRecord, request: &BackendRequest, submitted: Instant) {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.execute(job_id, record, request)))
            .unwrap_or_else(|panic| Err(anyhow!("job worker panicked: {}", panic_message(&panic))));
        self.finish(job_id, outcome, submitted);
    }

    fn finish(&self, job_id: &str, outcome: Result<usize>, submitted: Instant) {
        let elapsed = submitted.elapsed().as_secs_f64();
        match outcome {
            Ok(frames) => {
                info!(job_id, frames, elapsed_seconds = elapsed, "job completed");
                self.update(job_id, |job| {
                    job.status = JobStatus::Completed;
                    job.progress = 100;
                    job.message = "Completed".to_string();
                    job.elapsed_seconds = Some(elapsed);
                });
            }
            Err(e) => {
                let error = format!("{e:#}");
                warn!(job_id, error = %error, elapsed_seconds = elapsed, "job failed");
                self.update(job_id, |job| {
                    job.status = JobStatus::Failed;
                    job.message = "Failed".to_string();
                    job.error = Some(error);
                    job.elapsed_seconds = Some(elapsed);
                });
            }
        }
    }

    /// Runs the backend chain and stores what it produced. Returns the number
    /// of frame images on disk.
    fn execute(&self, job_id: &str, record: &VideoRecord, request: &BackendRequest) -> Result<usize> {
        self.progress(job_id, 10, "Preparing request");
        let params = &record.params;
        let (kind, output) = run_fallback_chain(
            &self.backends,
            request,
            params.backend.use_cloud,
            &mut |progress, message| self.progress(job_id, progress, message),
        )?;
        info!(job_id, video_id = %record.id, backend = %kind, output = ?output, "generation finished");

        let store = &self.store;
        let dir = store.video_dir(&record.id);
        match output {
            BackendOutput::VideoBytes(bytes) => {
                self.progress(job_id, 60, "Downloading and saving video");
                let container = store.save_video_bytes(&record.id, &bytes)?;
                self.progress(job_id, 75, "Extracting frames");
                let extracted = assembler::extract(store.codec(), &container, &dir, params.fps)?;
                store.update_frame_count(&record.id, extracted)?;
                if extracted == 0 {
                    bail!("No frames generated");
                }
                Ok(extracted)
            }
            BackendOutput::Frames(frames) => {
                if kind == BackendKind::Cloud {
                    self.progress(job_id, 55, "Processing frames from API");
                }
                self.progress(job_id, 80, "Saving frames");
                match assembler::persist_frames(store.codec(), &dir, frames, params.fps) {
                    Ok(saved) => {
                        store.update_frame_count(&record.id, saved)?;
                        Ok(saved)
                    }
                    Err(e) => {
                        let on_disk = assembler::list_frame_files(&dir).len();
                        if on_disk > 0 {
                            if let Err(count_err) = store.update_frame_count(&record.id, on_disk) {
                                warn!(job_id, video_id = %record.id, error = %count_err, "failed to record partial frame count");
                            }
                        }
                        Err(e)
                    }
                }
            }
        }
    }
}
