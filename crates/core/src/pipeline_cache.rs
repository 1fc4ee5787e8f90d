//! Loaded local pipelines, one per (model id, device).
//!
//! Entries are never evicted or revalidated; a model that changes on disk is
//! picked up only after a restart.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use tracing::{debug, info};

use crate::backends::local::{LocalPipeline, PipelineLoader};

type CacheKey = (String, String);

/// Per-key slot; its own lock serializes loads of one key without blocking
/// lookups of other keys.
type Slot = Arc<Mutex<Option<Arc<dyn LocalPipeline>>>>;

pub struct PipelineCache {
    loader: Arc<dyn PipelineLoader>,
    entries: Mutex<HashMap<CacheKey, Slot>>,
}

impl PipelineCache {
    pub fn new(loader: Arc<dyn PipelineLoader>) -> Self {
        Self {
            loader,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Execution device the loader will place new pipelines on.
    pub fn device(&self) -> String {
        self.loader.device()
    }

    /// Returns the cached pipeline for `(model_id, device)`, loading it from
    /// `model_dir` on a miss. Concurrent misses for the same key wait on that
    /// key's slot and never produce two instances.
    pub fn get_or_load(
        &self,
        model_id: &str,
        device: &str,
        model_dir: &Path,
    ) -> Result<Arc<dyn LocalPipeline>> {
        let key = (model_id.to_string(), device.to_string());
        let slot = Arc::clone(self.entries()?.entry(key).or_default());

        let mut slot = slot
            .lock()
            .map_err(|_| anyhow!("pipeline cache slot poisoned"))?;
        if let Some(pipeline) = slot.as_ref() {
            debug!(model_id, device, "pipeline cache hit");
            return Ok(Arc::clone(pipeline));
        }

        info!(model_id, device, dir = %model_dir.display(), "loading local pipeline");
        let pipeline = self.loader.load(model_id, model_dir, device)?;
        *slot = Some(Arc::clone(&pipeline));
        Ok(pipeline)
    }

    /// Number of loaded pipelines.
    pub fn len(&self) -> usize {
        let Ok(entries) = self.entries() else {
            return 0;
        };
        entries
            .values()
            .filter(|slot| slot.try_lock().map(|s| s.is_some()).unwrap_or(false))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<CacheKey, Slot>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("pipeline cache lock poisoned"))
    }
}
