use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{BackendKind, BackendOutput, BackendRequest, GenerationBackend};
use crate::config::CloudConfig;

pub const TOKEN_PREFIX: &str = "hf_";
pub const DEFAULT_NEGATIVE_PROMPT: &str = "blurry, low quality, noisy";
const REQUESTED_MODEL_HEADER: &str = "X-Requested-Model";
const ACCEPTED_TYPES: &str = "video/mp4, application/octet-stream, application/json";
const HEIGHT_MAX: u32 = 576;
const WIDTH_MAX: u32 = 1024;
const STEPS_MAX: u32 = 50;
const FRAMES_MIN: u32 = 8;
const REQUEST_FPS: u32 = 8;
const ERROR_TEXT_LIMIT: usize = 200;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// The endpoint answered 404; the next endpoint may still serve the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloudNotFound;

impl fmt::Display for CloudNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HF API error: 404: Not Found")
    }
}

impl std::error::Error for CloudNotFound {}

pub fn is_valid_token(token: &str) -> bool {
    token.starts_with(TOKEN_PREFIX)
}

pub struct CloudBackend {
    router_base_url: String,
    default_model_repo: String,
    timeout: Duration,
}

impl CloudBackend {
    pub fn new(config: &CloudConfig) -> Self {
        Self {
            router_base_url: config.router_base_url.trim_end_matches('/').to_string(),
            default_model_repo: config.default_model_repo.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }

    fn models_url(&self, repo: &str) -> String {
        format!("{}/models/{repo}", self.router_base_url)
    }

    fn post(
        &self,
        client: &Client,
        url: &str,
        token: &str,
        repo: Option<&str>,
        payload: &Value,
    ) -> Result<Vec<u8>> {
        let mut builder = client
            .post(url)
            .header(AUTHORIZATION, format!("Bearer {token}"))
            .header(ACCEPT, ACCEPTED_TYPES)
            .json(payload);
        if let Some(repo) = repo {
            builder = builder.header(REQUESTED_MODEL_HEADER, repo);
        }

        let response = builder
            .send()
            .with_context(|| format!("HF API request to {url} failed"))?;
        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        debug!(url, status = status.as_u16(), content_type = %content_type, "HF API response");

        if status == StatusCode::OK
            && (content_type.starts_with("video") || content_type.starts_with("application/octet-stream"))
        {
            let bytes = response
                .bytes()
                .context("failed to read video bytes from HF API")?;
            return Ok(bytes.to_vec());
        }
        if status == StatusCode::NOT_FOUND {
            return Err(CloudNotFound.into());
        }

        let text = response.text().unwrap_or_default();
        if let Some(error) = json_error(&text) {
            bail!("HF API error: {}: {error}", status.as_u16());
        }
        let snippet: String = text.chars().take(ERROR_TEXT_LIMIT).collect();
        bail!("HF API error: {}: {snippet}", status.as_u16())
    }
}

fn json_error(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    match value.get("error")? {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

pub fn build_payload(request: &BackendRequest) -> Value {
    json!({
        "inputs": request.prompt,
        "parameters": {
            "negative_prompt": request
                .negative_prompt
                .as_deref()
                .filter(|negative| !negative.is_empty())
                .unwrap_or(DEFAULT_NEGATIVE_PROMPT),
            "height": request.height.min(HEIGHT_MAX),
            "width": request.width.min(WIDTH_MAX),
            "num_inference_steps": request.num_inference_steps.min(STEPS_MAX),
            "guidance_scale": request.guidance_scale,
            "num_frames": request.num_frames.max(FRAMES_MIN),
            "fps": REQUEST_FPS,
            "seed": request.seed,
        },
        "options": { "use_cache": true, "wait_for_model": true },
    })
}

fn is_not_found(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| cause.is::<CloudNotFound>())
}

impl GenerationBackend for CloudBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cloud
    }

    fn generate(&self, request: &BackendRequest) -> Result<BackendOutput> {
        let token = match request.token.as_deref() {
            Some(token) if is_valid_token(token) => token,
            _ => bail!("Invalid Hugging Face API token"),
        };
        let repo = request
            .model_repo
            .as_deref()
            .unwrap_or(&self.default_model_repo)
            .trim()
            .to_string();
        let payload = build_payload(request);

        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(self.timeout)
            .build()
            .context("failed to build HTTP client for HF API")?;

        info!(backend = %BackendKind::Cloud, repo = %repo, "requesting video from HF API");
        let bytes = match self.post(&client, &self.router_base_url, token, Some(&repo), &payload) {
            Err(e) if is_not_found(&e) => {
                debug!(repo = %repo, "router root returned 404, trying model endpoint");
                match self.post(&client, &self.models_url(&repo), token, None, &payload) {
                    Err(e) if is_not_found(&e) => {
                        bail!("HF API error: 404: Not Found (both router root and model endpoints)")
                    }
                    other => other?,
                }
            }
            other => other?,
        };

        Ok(BackendOutput::VideoBytes(bytes))
    }
}
