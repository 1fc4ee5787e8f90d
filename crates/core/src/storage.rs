//! Durable index of generated videos plus their artifact directories.
//!
//! Each video owns `<root>/<video_id>/`. The index lives next to those
//! directories in `videos.db`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::params::GenerationParams;
use crate::video::assembler::{self, CONTAINER_FILE};
use crate::video::VideoCodec;

const DB_FILE: &str = "videos.db";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VideoRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub params: GenerationParams,
    pub frame_count: usize,
}

#[derive(Clone)]
pub struct VideoStore {
    root: PathBuf,
    db_path: PathBuf,
    codec: Arc<dyn VideoCodec>,
}

impl std::fmt::Debug for VideoStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl VideoStore {
    pub fn open(root: &Path, codec: Arc<dyn VideoCodec>) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("failed to create videos directory: {}", root.display()))?;
        let store = Self {
            root: root.to_path_buf(),
            db_path: root.join(DB_FILE),
            codec,
        };
        store.initialize_schema()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn codec(&self) -> &dyn VideoCodec {
        self.codec.as_ref()
    }

    pub fn video_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Inserts a record with frame count 0 and creates its directory.
    pub fn create_entry(&self, params: &GenerationParams) -> Result<VideoRecord> {
        let record = VideoRecord {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            params: params.clone(),
            frame_count: 0,
        };
        let params_json =
            serde_json::to_string(&record.params).context("failed to serialize video params")?;

        let dir = self.video_dir(&record.id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create video directory {}", dir.display()))?;

        let inserted = self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO videos (id, created_at, params_json, frame_count)
                 VALUES (?1, ?2, ?3, 0)",
                params![record.id, record.created_at.to_rfc3339(), params_json],
            )
            .with_context(|| format!("failed to insert video record {}", record.id))?;
            Ok(())
        });
        if let Err(e) = inserted {
            let _ = fs::remove_dir_all(&dir);
            return Err(e);
        }

        debug!(video_id = %record.id, "video record created");
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Result<Option<VideoRecord>> {
        self.with_connection(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, created_at, params_json, frame_count FROM videos WHERE id = ?1",
                    params![id],
                    read_row,
                )
                .optional()
                .with_context(|| format!("failed to read video record {id}"))?;
            row.map(decode_row).transpose()
        })
    }

    /// Records whose directory still holds a container or at least one frame
    /// image, newest first.
    pub fn list_present(&self) -> Result<Vec<VideoRecord>> {
        let rows = self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, created_at, params_json, frame_count
                 FROM videos
                 ORDER BY created_at DESC, id ASC",
            )?;
            let rows = stmt
                .query_map([], read_row)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("failed to list video records")?;
            Ok(rows)
        })?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.0.clone();
            match decode_row(row) {
                Ok(record) if self.has_artifacts(&record.id) => records.push(record),
                Ok(_) => {}
                Err(err) => warn!(video_id = %id, error = %format!("{err:#}"), "Skipping invalid video record"),
            }
        }
        Ok(records)
    }

    pub fn has_artifacts(&self, id: &str) -> bool {
        let dir = self.video_dir(id);
        dir.is_dir()
            && (dir.join(CONTAINER_FILE).is_file() || !assembler::list_frame_files(&dir).is_empty())
    }

    pub fn update_frame_count(&self, id: &str, frame_count: usize) -> Result<()> {
        let updated = self.with_connection(|conn| {
            conn.execute(
                "UPDATE videos SET frame_count = ?2 WHERE id = ?1",
                params![id, frame_count as i64],
            )
            .with_context(|| format!("failed to update frame count for {id}"))
        })?;
        if updated == 0 {
            bail!("video record {id} does not exist");
        }
        Ok(())
    }

    /// Removes the directory and then the record, so a failed removal
    /// leaves the record in place. Returns whether a record existed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let dir = self.video_dir(id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to remove video directory {}", dir.display()))
            }
        }

        let deleted = self.with_connection(|conn| {
            conn.execute("DELETE FROM videos WHERE id = ?1", params![id])
                .with_context(|| format!("failed to delete video record {id}"))
        })?;

        if deleted > 0 {
            info!(video_id = %id, "video deleted");
        }
        Ok(deleted > 0)
    }

    /// Writes an encoded container received from a backend as the video's
    /// container file and returns its path.
    pub fn save_video_bytes(&self, id: &str, bytes: &[u8]) -> Result<PathBuf> {
        let dir = self.video_dir(id);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create video directory {}", dir.display()))?;
        let path = dir.join(CONTAINER_FILE);
        fs::write(&path, bytes)
            .with_context(|| format!("failed to write downloaded video {}", path.display()))?;
        Ok(path)
    }

    /// Container path for `id`, rebuilt from frame images when missing.
    pub fn ensure_container(&self, id: &str) -> Result<PathBuf> {
        let fps = self.get(id)?.map_or(8, |record| record.params.fps);
        assembler::ensure_container(self.codec(), &self.video_dir(id), fps)
    }

    pub fn ensure_thumbnail(&self, id: &str) -> Result<PathBuf> {
        let dir = self.video_dir(id);
        if !dir.is_dir() {
            bail!("video directory {} does not exist", dir.display());
        }
        Ok(assembler::ensure_thumbnail(self.codec(), &dir))
    }

    fn initialize_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS videos (
                    id TEXT PRIMARY KEY,
                    created_at TEXT NOT NULL,
                    params_json TEXT NOT NULL,
                    frame_count INTEGER NOT NULL DEFAULT 0
                 );
                 CREATE INDEX IF NOT EXISTS idx_videos_created_at ON videos(created_at DESC);",
            )
            .with_context(|| {
                format!(
                    "failed to initialize video index schema: {}",
                    self.db_path.display()
                )
            })?;
            Ok(())
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("failed to open video index: {}", self.db_path.display()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("failed to set video index busy timeout")?;
        op(&conn)
    }
}

type RawRow = (String, String, String, i64);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode_row((id, created_at, params_json, frame_count): RawRow) -> Result<VideoRecord> {
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .with_context(|| format!("invalid RFC3339 timestamp: {created_at}"))?
        .with_timezone(&Utc);
    let params: GenerationParams =
        serde_json::from_str(&params_json).context("invalid params snapshot")?;
    Ok(VideoRecord {
        id,
        created_at,
        params,
        frame_count: usize::try_from(frame_count).unwrap_or(0),
    })
}
