use std::fmt;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use tracing::{debug, info, warn};

use super::{BackendKind, BackendOutput, BackendRequest, GenerationBackend};
use crate::frame::RawFrame;
use crate::models::{self, ModelStore};
use crate::pipeline_cache::PipelineCache;

pub const WIDTH_MAX: u32 = 1024;
pub const HEIGHT_MAX: u32 = 576;
const DIMENSION_MIN: u32 = 256;
pub const FRAMES_RANGE: (u32, u32) = (8, 48);
pub const STEPS_RANGE: (u32, u32) = (10, 60);

/// Arguments handed to a loaded pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    /// `None` when the pipeline should pick its own frame count.
    pub num_frames: Option<u32>,
    pub width: u32,
    pub height: u32,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
    pub seed: Option<u64>,
}

impl PipelineRequest {
    pub fn clamped(request: &BackendRequest) -> Self {
        Self {
            prompt: request.prompt.clone(),
            negative_prompt: request.negative_prompt.clone(),
            num_frames: Some(request.num_frames.clamp(FRAMES_RANGE.0, FRAMES_RANGE.1)),
            width: request.width.clamp(DIMENSION_MIN, WIDTH_MAX),
            height: request.height.clamp(DIMENSION_MIN, HEIGHT_MAX),
            num_inference_steps: request
                .num_inference_steps
                .clamp(STEPS_RANGE.0, STEPS_RANGE.1),
            guidance_scale: request.guidance_scale,
            seed: request.seed,
        }
    }
}

/// A pipeline rejected an optional argument it does not understand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedArgument(pub &'static str);

impl fmt::Display for UnsupportedArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipeline does not accept argument '{}'", self.0)
    }
}

impl std::error::Error for UnsupportedArgument {}

pub trait LocalPipeline: Send + Sync {
    fn generate(&self, request: &PipelineRequest) -> Result<Vec<RawFrame>>;
}

pub trait PipelineLoader: Send + Sync {
    fn device(&self) -> String;
    fn load(&self, model_id: &str, model_dir: &Path, device: &str)
        -> Result<Arc<dyn LocalPipeline>>;
}

pub struct LocalBackend {
    models: ModelStore,
    cache: Arc<PipelineCache>,
}

impl LocalBackend {
    pub fn new(models: ModelStore, cache: Arc<PipelineCache>) -> Self {
        Self { models, cache }
    }
}

impl GenerationBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn generate(&self, request: &BackendRequest) -> Result<BackendOutput> {
        let Some(selector) = request.local_model.as_deref() else {
            bail!("no local model selected");
        };
        let model_id = models::resolve_local_model(selector)?;
        if !self.models.is_downloaded(&model_id) {
            bail!(
                "Local model '{model_id}' is not downloaded. Trigger a download from the UI before using it."
            );
        }

        let device = self.cache.device();
        let pipeline =
            self.cache
                .get_or_load(&model_id, &device, &self.models.model_dir(&model_id))?;

        let pipeline_request = PipelineRequest::clamped(request);
        info!(
            backend = %BackendKind::Local,
            model_id = %model_id,
            device = %device,
            frames = ?pipeline_request.num_frames,
            width = pipeline_request.width,
            height = pipeline_request.height,
            steps = pipeline_request.num_inference_steps,
            "running local pipeline"
        );

        let frames = run_with_retry(pipeline.as_ref(), pipeline_request)?;
        debug!(frames = frames.len(), "local pipeline returned");
        Ok(BackendOutput::Frames(frames))
    }
}

/// Runs the pipeline, retrying once without the frame count when the
/// pipeline rejects that argument.
fn run_with_retry(pipeline: &dyn LocalPipeline, mut request: PipelineRequest) -> Result<Vec<RawFrame>> {
    match pipeline.generate(&request) {
        Err(e) if request.num_frames.is_some() && is_unsupported(&e, "num_frames") => {
            warn!("pipeline rejected num_frames, retrying without it");
            request.num_frames = None;
            pipeline.generate(&request)
        }
        other => other,
    }
}

fn is_unsupported(error: &anyhow::Error, argument: &str) -> bool {
    error
        .chain()
        .filter_map(|cause| cause.downcast_ref::<UnsupportedArgument>())
        .any(|unsupported| unsupported.0 == argument)
}
