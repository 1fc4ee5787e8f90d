//! Interchangeable generation backends and the fixed order they are tried in.

pub mod cloud;
mod glyphs;
pub mod local;
pub mod onnx;
pub mod placeholder;

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use tracing::{info, warn};

use crate::frame::RawFrame;
use crate::params::GenerationParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    Cloud,
    Placeholder,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Cloud => write!(f, "cloud"),
            Self::Placeholder => write!(f, "placeholder"),
        }
    }
}

/// Everything a backend needs for one generation. The token is only ever
/// forwarded to the cloud endpoint.
#[derive(Clone, Default)]
pub struct BackendRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub num_frames: u32,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
    pub seed: Option<u64>,
    pub local_model: Option<String>,
    pub model_repo: Option<String>,
    pub token: Option<String>,
}

impl BackendRequest {
    pub fn from_params(params: &GenerationParams, token: Option<String>) -> Self {
        Self {
            prompt: params.prompt.clone(),
            negative_prompt: params.negative_prompt.clone(),
            num_frames: params.num_frames,
            fps: params.fps,
            width: params.width,
            height: params.height,
            num_inference_steps: params.num_inference_steps,
            guidance_scale: params.guidance_scale,
            seed: params.seed,
            local_model: params.backend.local_model.clone(),
            model_repo: params.backend.model_repo.clone(),
            token,
        }
    }
}

impl fmt::Debug for BackendRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRequest")
            .field("prompt", &self.prompt)
            .field("num_frames", &self.num_frames)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("seed", &self.seed)
            .field("local_model", &self.local_model)
            .field("model_repo", &self.model_repo)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .finish_non_exhaustive()
    }
}

/// What a successful backend produced.
pub enum BackendOutput {
    Frames(Vec<RawFrame>),
    /// An already encoded container.
    VideoBytes(Vec<u8>),
}

impl fmt::Debug for BackendOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frames(frames) => write!(f, "Frames({})", frames.len()),
            Self::VideoBytes(bytes) => write!(f, "VideoBytes({} bytes)", bytes.len()),
        }
    }
}

pub trait GenerationBackend: Send + Sync {
    fn kind(&self) -> BackendKind;
    fn generate(&self, request: &BackendRequest) -> Result<BackendOutput>;
}

/// Outcome of one backend attempt.
#[derive(Debug)]
pub enum Attempt {
    Frames(Vec<RawFrame>),
    VideoBytes(Vec<u8>),
    Failed(anyhow::Error),
}

impl Attempt {
    fn run(backend: &dyn GenerationBackend, request: &BackendRequest) -> Self {
        let kind = backend.kind();
        let outcome = catch_unwind(AssertUnwindSafe(|| backend.generate(request)))
            .unwrap_or_else(|panic| Err(anyhow!("{kind} backend panicked: {}", panic_message(&panic))));
        match outcome {
            Ok(BackendOutput::Frames(frames)) if frames.is_empty() => {
                Self::Failed(anyhow!("{kind} backend returned no frames"))
            }
            Ok(BackendOutput::Frames(frames)) => Self::Frames(frames),
            Ok(BackendOutput::VideoBytes(bytes)) if bytes.is_empty() => {
                Self::Failed(anyhow!("{kind} backend returned an empty video"))
            }
            Ok(BackendOutput::VideoBytes(bytes)) => Self::VideoBytes(bytes),
            Err(e) => Self::Failed(e),
        }
    }
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[derive(Clone)]
pub struct BackendSet {
    pub local: Arc<dyn GenerationBackend>,
    pub cloud: Arc<dyn GenerationBackend>,
    pub placeholder: Arc<dyn GenerationBackend>,
}

pub const MSG_LOADING_LOCAL: &str = "Loading local model";
pub const MSG_CLOUD_FALLBACK: &str = "Local model unavailable, falling back to Hugging Face";
pub const MSG_CLOUD_PRIMARY: &str = "Contacting Hugging Face Inference API";
pub const MSG_PLACEHOLDER: &str = "Using placeholder local generator";

/// Walks Local, then Cloud, then Placeholder. Local runs only when a selector
/// was given; Cloud only when enabled; Placeholder only when Cloud is disabled
/// and Local either was not requested or did not fail.
///
/// `progress` receives `(percent, message)` before each attempt.
pub fn run_fallback_chain(
    backends: &BackendSet,
    request: &BackendRequest,
    use_cloud: bool,
    progress: &mut dyn FnMut(u8, &str),
) -> Result<(BackendKind, BackendOutput)> {
    let mut local_error: Option<anyhow::Error> = None;

    if let Some(selector) = request.local_model.as_deref() {
        progress(20, MSG_LOADING_LOCAL);
        match Attempt::run(backends.local.as_ref(), request) {
            Attempt::Frames(frames) => {
                info!(backend = %BackendKind::Local, frames = frames.len(), "local generation succeeded");
                return Ok((BackendKind::Local, BackendOutput::Frames(frames)));
            }
            Attempt::VideoBytes(bytes) => {
                return Ok((BackendKind::Local, BackendOutput::VideoBytes(bytes)));
            }
            Attempt::Failed(e) => {
                warn!(backend = %BackendKind::Local, selector, error = %format!("{e:#}"), "local generation failed");
                local_error = Some(e);
            }
        }
    }

    if use_cloud {
        let message = if local_error.is_some() {
            MSG_CLOUD_FALLBACK
        } else {
            MSG_CLOUD_PRIMARY
        };
        progress(30, message);
        return match Attempt::run(backends.cloud.as_ref(), request) {
            Attempt::Frames(frames) => Ok((BackendKind::Cloud, BackendOutput::Frames(frames))),
            Attempt::VideoBytes(bytes) => Ok((BackendKind::Cloud, BackendOutput::VideoBytes(bytes))),
            Attempt::Failed(e) => {
                warn!(backend = %BackendKind::Cloud, error = %format!("{e:#}"), "cloud generation failed");
                Err(e)
            }
        };
    }

    if let Some(e) = local_error {
        return Err(e);
    }

    progress(30, MSG_PLACEHOLDER);
    match Attempt::run(backends.placeholder.as_ref(), request) {
        Attempt::Frames(frames) => Ok((BackendKind::Placeholder, BackendOutput::Frames(frames))),
        Attempt::VideoBytes(bytes) => {
            Ok((BackendKind::Placeholder, BackendOutput::VideoBytes(bytes)))
        }
        Attempt::Failed(e) => bail!("placeholder generation failed: {e:#}"),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{Behavior, ScriptedBackend};
    use super::*;

    struct Harness {
        local: Arc<ScriptedBackend>,
        cloud: Arc<ScriptedBackend>,
        placeholder: Arc<ScriptedBackend>,
    }

    impl Harness {
        fn new(local: Behavior, cloud: Behavior) -> Self {
            Self {
                local: ScriptedBackend::new(BackendKind::Local, local),
                cloud: ScriptedBackend::new(BackendKind::Cloud, cloud),
                placeholder: ScriptedBackend::new(BackendKind::Placeholder, Behavior::Frames(2)),
            }
        }

        fn set(&self) -> BackendSet {
            BackendSet {
                local: self.local.clone(),
                cloud: self.cloud.clone(),
                placeholder: self.placeholder.clone(),
            }
        }

        fn run(&self, local_model: Option<&str>, use_cloud: bool) -> (Result<(BackendKind, BackendOutput)>, Vec<String>) {
            let request = BackendRequest {
                prompt: "p".to_string(),
                width: 16,
                height: 16,
                local_model: local_model.map(str::to_string),
                ..Default::default()
            };
            let mut messages = Vec::new();
            let result = run_fallback_chain(&self.set(), &request, use_cloud, &mut |_, m| {
                messages.push(m.to_string())
            });
            (result, messages)
        }
    }

    #[test]
    fn test_local_success_skips_everything_else() {
        let h = Harness::new(Behavior::Frames(3), Behavior::Frames(1));
        let (result, _) = h.run(Some("zeroscope-local"), true);
        let (kind, _) = result.expect("local");
        assert_eq!(kind, BackendKind::Local);
        assert_eq!(h.cloud.calls(), 0);
        assert_eq!(h.placeholder.calls(), 0);
    }

    #[test]
    fn test_local_failure_falls_back_to_cloud() {
        let h = Harness::new(Behavior::Fail("not downloaded"), Behavior::Bytes(vec![1, 2, 3]));
        let (result, messages) = h.run(Some("zeroscope-local"), true);
        let (kind, output) = result.expect("cloud");
        assert_eq!(kind, BackendKind::Cloud);
        assert!(matches!(output, BackendOutput::VideoBytes(_)));
        assert_eq!(messages, vec![MSG_LOADING_LOCAL, MSG_CLOUD_FALLBACK]);
    }

    #[test]
    fn test_cloud_only_uses_primary_message() {
        let h = Harness::new(Behavior::Frames(1), Behavior::Frames(2));
        let (_, messages) = h.run(None, true);
        assert_eq!(messages, vec![MSG_CLOUD_PRIMARY]);
        assert_eq!(h.local.calls(), 0);
    }

    #[test]
    fn test_cloud_failure_is_terminal() {
        let h = Harness::new(Behavior::Frames(1), Behavior::Fail("HF API error: 500"));
        let (result, _) = h.run(None, true);
        assert!(result.expect_err("cloud fails").to_string().contains("500"));
        assert_eq!(h.placeholder.calls(), 0);
    }

    #[test]
    fn test_local_failure_without_cloud_reports_local_error() {
        let h = Harness::new(Behavior::Fail("Local model 'x' is not downloaded"), Behavior::Frames(1));
        let (result, _) = h.run(Some("x/y"), false);
        let err = result.expect_err("local error");
        assert!(err.to_string().contains("not downloaded"));
        assert_eq!(h.placeholder.calls(), 0);
        assert_eq!(h.cloud.calls(), 0);
    }

    #[test]
    fn test_no_local_and_no_cloud_uses_placeholder() {
        let h = Harness::new(Behavior::Frames(1), Behavior::Frames(1));
        let (result, messages) = h.run(None, false);
        assert_eq!(result.expect("placeholder").0, BackendKind::Placeholder);
        assert_eq!(messages, vec![MSG_PLACEHOLDER]);
    }

    #[test]
    fn test_panicking_backend_counts_as_failure() {
        let h = Harness::new(Behavior::Panic, Behavior::Frames(1));
        let (result, _) = h.run(Some("x/y"), true);
        assert_eq!(result.expect("cloud").0, BackendKind::Cloud);
    }

    #[test]
    fn test_empty_output_counts_as_failure() {
        let h = Harness::new(Behavior::Frames(0), Behavior::Frames(1));
        let (result, _) = h.run(Some("x/y"), false);
        assert!(result.expect_err("empty").to_string().contains("no frames"));
    }

    #[test]
    fn test_debug_output_masks_token() {
        let request = BackendRequest {
            token: Some("hf_supersecret".to_string()),
            ..Default::default()
        };
        assert!(!format!("{request:?}").contains("supersecret"));
    }
}
