//! Process-wide service handles, built once at startup and shared by the
//! HTTP surface and the CLI.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::backends::cloud::CloudBackend;
use crate::backends::local::LocalBackend;
use crate::backends::onnx::OnnxLoader;
use crate::backends::placeholder::PlaceholderBackend;
use crate::backends::BackendSet;
use crate::config::AppConfig;
use crate::downloads::hub::HubFetcher;
use crate::downloads::DownloadTracker;
use crate::jobs::JobManager;
use crate::models::ModelStore;
use crate::pipeline_cache::PipelineCache;
use crate::storage::VideoStore;
use crate::video::FfmpegCodec;

#[derive(Debug, Clone)]
pub struct Services {
    pub data_dir: PathBuf,
    pub jobs: JobManager,
    pub downloads: DownloadTracker,
    pub videos: VideoStore,
    pub models: ModelStore,
}

impl Services {
    pub fn from_config(config: &AppConfig, data_dir: &Path) -> Result<Self> {
        let videos_dir = config.videos_dir(data_dir);
        let models_dir = config.models_dir(data_dir);

        let codec = Arc::new(FfmpegCodec::new(config.encoding.clone()));
        let videos = VideoStore::open(&videos_dir, codec)
            .with_context(|| format!("failed to open video store at {}", videos_dir.display()))?;
        let models = ModelStore::new(&models_dir);

        let cache = Arc::new(PipelineCache::new(Arc::new(OnnxLoader)));
        let backends = BackendSet {
            local: Arc::new(LocalBackend::new(models.clone(), Arc::clone(&cache))),
            cloud: Arc::new(CloudBackend::new(&config.cloud)),
            placeholder: Arc::new(PlaceholderBackend),
        };
        let jobs = JobManager::new(videos.clone(), backends, config.cloud.resolved_default_token());
        let downloads = DownloadTracker::new(
            models.clone(),
            Arc::new(HubFetcher::new(&config.downloads)),
            Duration::from_millis(config.downloads.sample_interval_ms),
        );

        info!(
            videos_dir = %videos_dir.display(),
            models_dir = %models_dir.display(),
            device = %cache.device(),
            "services initialized"
        );

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            jobs,
            downloads,
            videos,
            models,
        })
    }
}
