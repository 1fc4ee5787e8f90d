use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::SnapshotFetcher;
use crate::config::DownloadsConfig;
use crate::models::COMPLETION_MARKER;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct ModelListing {
    #[serde(default)]
    siblings: Vec<Sibling>,
}

#[derive(Debug, Clone, Deserialize)]
struct Sibling {
    rfilename: String,
    #[serde(default)]
    lfs: Option<LfsInfo>,
}

#[derive(Debug, Clone, Deserialize)]
struct LfsInfo {
    #[serde(default)]
    sha256: Option<String>,
}

/// Fetches a full repository snapshot from a Hugging Face compatible hub.
#[derive(Debug, Clone)]
pub struct HubFetcher {
    base_url: String,
    timeout: Duration,
}

impl HubFetcher {
    pub fn new(config: &DownloadsConfig) -> Self {
        Self {
            base_url: config.hub_base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
        }
    }

    fn listing_url(&self, model_id: &str) -> String {
        format!("{}/api/models/{model_id}?blobs=true", self.base_url)
    }

    fn file_url(&self, model_id: &str, file: &str) -> String {
        format!("{}/{model_id}/resolve/main/{file}", self.base_url)
    }

    fn download_file(
        &self,
        client: &Client,
        token: Option<&str>,
        url: &str,
        target: &Path,
        expected_sha256: Option<&str>,
    ) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let tmp_path = part_path(target);

        let mut response = authorized(client.get(url), token)
            .send()
            .with_context(|| format!("Failed to start download of {url}"))?
            .error_for_status()
            .with_context(|| format!("Download of {url} was rejected"))?;

        let mut tmp_file = fs::File::create(&tmp_path)
            .with_context(|| format!("Failed to create temp file: {}", tmp_path.display()))?;
        let written = response
            .copy_to(&mut tmp_file)
            .with_context(|| format!("Failed while downloading {url}"))
            .and_then(|_| {
                tmp_file
                    .sync_all()
                    .with_context(|| format!("Failed to flush temp file: {}", tmp_path.display()))
            });
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }

        if let Some(expected) = expected_sha256 {
            let actual = sha256_file(&tmp_path)?;
            if !actual.eq_ignore_ascii_case(expected) {
                let _ = fs::remove_file(&tmp_path);
                bail!("SHA256 mismatch for {url}: expected {expected}, got {actual}");
            }
        }

        fs::rename(&tmp_path, target).with_context(|| {
            format!("Failed to move {} to {}", tmp_path.display(), target.display())
        })?;
        Ok(())
    }
}

impl SnapshotFetcher for HubFetcher {
    fn fetch(&self, model_id: &str, token: Option<&str>, dest: &Path) -> Result<()> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(self.timeout)
            .build()
            .context("Failed to build HTTP client for model download")?;

        let listing: ModelListing = authorized(client.get(self.listing_url(model_id)), token)
            .send()
            .with_context(|| format!("Failed to list files of {model_id}"))?
            .error_for_status()
            .with_context(|| format!("Hub refused listing for {model_id}"))?
            .json()
            .with_context(|| format!("Malformed file listing for {model_id}"))?;

        let files = ordered_files(listing.siblings);
        if files.is_empty() {
            bail!("Model {model_id} has no files on the hub");
        }
        fs::create_dir_all(dest)
            .with_context(|| format!("Failed to create model directory: {}", dest.display()))?;

        info!(model_id, files = files.len(), dest = %dest.display(), "fetching model snapshot");
        for sibling in &files {
            let target = safe_join(dest, &sibling.rfilename)?;
            let expected = sibling.lfs.as_ref().and_then(|lfs| lfs.sha256.as_deref());
            debug!(model_id, file = %sibling.rfilename, "downloading file");
            self.download_file(
                &client,
                token,
                &self.file_url(model_id, &sibling.rfilename),
                &target,
                expected,
            )?;
        }
        Ok(())
    }
}

fn authorized(builder: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token.filter(|token| !token.is_empty()) {
        Some(token) => builder.header(AUTHORIZATION, format!("Bearer {token}")),
        None => builder,
    }
}

/// Completion marker goes last so a partial snapshot never looks complete.
fn ordered_files(mut siblings: Vec<Sibling>) -> Vec<Sibling> {
    siblings.sort_by_key(|sibling| sibling.rfilename == COMPLETION_MARKER);
    siblings
}

fn safe_join(root: &Path, relative: &str) -> Result<PathBuf> {
    let relative = Path::new(relative);
    let clean = relative
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if !clean {
        bail!("Refusing to write outside the model directory: {}", relative.display());
    }
    Ok(root.join(relative))
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    target.with_file_name(name)
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
