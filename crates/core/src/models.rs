//! Where local models live on disk and how selectors map to model ids.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use serde::Serialize;

/// Written last by a snapshot download; its presence means "downloaded".
pub const COMPLETION_MARKER: &str = "model_index.json";

/// Short selector keys accepted in place of a full model id.
pub const LOCAL_MODEL_KEYS: &[(&str, &str)] = &[
    ("zeroscope-local", "cerspense/zeroscope_v2_576w"),
    (
        "modelscope-local",
        "ali-vilab/modelscope-damo-text-to-video-synthesis",
    ),
];

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ModelInfo {
    pub model_id: String,
    pub downloaded: bool,
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ModelStore {
    models_dir: PathBuf,
}

impl ModelStore {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn model_dir(&self, model_id: &str) -> PathBuf {
        self.models_dir.join(model_dir_name(model_id))
    }

    pub fn is_downloaded(&self, model_id: &str) -> bool {
        self.model_dir(model_id).join(COMPLETION_MARKER).is_file()
    }

    pub fn model_info(&self, model_id: &str) -> ModelInfo {
        let path = self.model_dir(model_id);
        ModelInfo {
            model_id: model_id.to_string(),
            downloaded: self.is_downloaded(model_id),
            size_bytes: dir_size(&path),
            path,
        }
    }
}

pub fn model_dir_name(model_id: &str) -> String {
    model_id.replace('/', "__")
}

/// Maps a selector key to a model id. Anything containing `/` is already a
/// model id.
pub fn resolve_local_model(selector: &str) -> Result<String> {
    let selector = selector.trim();
    if selector.contains('/') {
        return Ok(selector.to_string());
    }
    match LOCAL_MODEL_KEYS.iter().find(|(key, _)| *key == selector) {
        Some((_, repo)) => Ok((*repo).to_string()),
        None => bail!("Unknown local model key: {selector}"),
    }
}

/// Total size of regular files below `path`; 0 when it does not exist.
pub fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| match entry.file_type() {
            Ok(kind) if kind.is_dir() => dir_size(&entry.path()),
            Ok(kind) if kind.is_file() => entry.metadata().map(|m| m.len()).unwrap_or(0),
            _ => 0,
        })
        .sum()
}

/// Number of regular files below `path`.
pub fn file_count(path: &Path) -> usize {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| match entry.file_type() {
            Ok(kind) if kind.is_dir() => file_count(&entry.path()),
            Ok(kind) if kind.is_file() => 1,
            _ => 0,
        })
        .sum()
}
