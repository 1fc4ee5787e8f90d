//! Turning frame sequences into on-disk artifacts and back.
//!
//! A video directory holds `frame_0000.png…`, the assembled container and a
//! thumbnail. Frames are always canonical RGB images by the time they reach
//! the encoder.

use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{bail, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgb, RgbImage};
use tracing::{debug, warn};

use super::VideoCodec;
use crate::frame::{self, RawFrame};

pub const CONTAINER_FILE: &str = "output.mp4";
pub const THUMBNAIL_FILE: &str = "thumbnail.jpg";
pub const THUMBNAIL_MAX_WIDTH: u32 = 300;
pub const THUMBNAIL_MAX_HEIGHT: u32 = 200;
const THUMBNAIL_QUALITY: u8 = 85;
const PLACEHOLDER_GRAY: Rgb<u8> = Rgb([128, 128, 128]);
const MAX_SAVE_WORKERS: usize = 8;

pub fn frame_file_name(index: usize) -> String {
    format!("frame_{index:04}.png")
}

/// Frame images in `dir`, in sequence order.
pub fn list_frame_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("frame_") && name.ends_with(".png"))
        })
        .collect();
    files.sort();
    files
}

/// Normalizes every frame, dropping the ones that fail, and resizes the rest
/// to the dimensions of the first usable frame.
pub fn canonicalize(frames: Vec<RawFrame>) -> Vec<RgbImage> {
    let mut target: Option<(u32, u32)> = None;
    let mut out = Vec::with_capacity(frames.len());

    for (index, raw) in frames.into_iter().enumerate() {
        let image = match frame::normalize_owned(raw) {
            Ok(image) => image,
            Err(e) => {
                warn!(index, error = %format!("{e:#}"), "skipping frame that failed to normalize");
                continue;
            }
        };
        if image.width() == 0 || image.height() == 0 {
            warn!(index, "skipping empty frame");
            continue;
        }
        let (w, h) = *target.get_or_insert(image.dimensions());
        out.push(fit_exact(image, w, h));
    }

    out
}

fn fit_exact(image: RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        image
    } else {
        imageops::resize(&image, width, height, FilterType::Triangle)
    }
}

/// Encodes `frames` into a container at `output`. Returns the number of
/// frames written.
pub fn assemble(
    codec: &dyn VideoCodec,
    frames: Vec<RawFrame>,
    fps: u32,
    output: &Path,
) -> Result<usize> {
    let frames = canonicalize(frames);
    encode(codec, &frames, fps, output)
}

fn encode(codec: &dyn VideoCodec, frames: &[RgbImage], fps: u32, output: &Path) -> Result<usize> {
    let Some(first) = frames.first() else {
        bail!("no frames to assemble");
    };
    let (width, height) = first.dimensions();

    let mut sink = codec
        .open_sink(output, width, height, fps.max(1))
        .with_context(|| format!("failed to open encoder for {}", output.display()))?;
    for frame in frames {
        sink.write_frame(frame)?;
    }
    sink.finish()
        .with_context(|| format!("failed to finalize {}", output.display()))?;

    debug!(frames = frames.len(), width, height, fps, output = %output.display(), "container assembled");
    Ok(frames.len())
}

/// Rebuilds the container in `dir` from the frame images stored there.
pub fn assemble_from_dir(codec: &dyn VideoCodec, dir: &Path, fps: u32) -> Result<usize> {
    let mut target: Option<(u32, u32)> = None;
    let mut frames = Vec::new();
    for path in list_frame_files(dir) {
        match image::open(&path) {
            Ok(decoded) => {
                let image = decoded.to_rgb8();
                if image.width() == 0 || image.height() == 0 {
                    continue;
                }
                let (w, h) = *target.get_or_insert(image.dimensions());
                frames.push(fit_exact(image, w, h));
            }
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable frame image"),
        }
    }
    encode(codec, &frames, fps, &dir.join(CONTAINER_FILE))
}

/// Writes `frames` as numbered PNGs into `dir` on a small pool of scoped
/// threads. Failed writes are logged and skipped. Returns the saved count.
pub fn save_frames(dir: &Path, frames: &[RgbImage]) -> usize {
    if frames.is_empty() {
        return 0;
    }
    let workers = frames.len().min(MAX_SAVE_WORKERS);
    let next = AtomicUsize::new(0);
    let saved = AtomicUsize::new(0);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let index = next.fetch_add(1, Ordering::Relaxed);
                let Some(frame) = frames.get(index) else {
                    break;
                };
                let path = dir.join(frame_file_name(index));
                match frame.save_with_format(&path, ImageFormat::Png) {
                    Ok(()) => {
                        saved.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to save frame"),
                }
            });
        }
    });

    saved.into_inner()
}

/// Saves frames, the thumbnail and the container for a finished generation.
/// Returns the number of frame images on disk.
pub fn persist_frames(
    codec: &dyn VideoCodec,
    dir: &Path,
    frames: Vec<RawFrame>,
    fps: u32,
) -> Result<usize> {
    let frames = canonicalize(frames);
    if frames.is_empty() {
        bail!("No frames generated");
    }

    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create video directory {}", dir.display()))?;
    let saved = save_frames(dir, &frames);
    if saved == 0 {
        bail!("failed to save any frame to {}", dir.display());
    }

    write_thumbnail_or_placeholder(frames.first(), &dir.join(THUMBNAIL_FILE));
    encode(codec, &frames, fps, &dir.join(CONTAINER_FILE))?;
    Ok(saved)
}

/// Decodes `container`, keeping every `stride`-th frame, and saves the kept
/// frames into `dir`. Also regenerates the thumbnail.
pub fn extract(
    codec: &dyn VideoCodec,
    container: &Path,
    dir: &Path,
    target_fps: u32,
) -> Result<usize> {
    let source = codec
        .open_source(container)
        .with_context(|| format!("failed to open {}", container.display()))?;
    let stride = sampling_stride(source.info.fps, target_fps);
    debug!(source_fps = source.info.fps, target_fps, stride, "extracting frames");

    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create video directory {}", dir.display()))?;

    let mut saved = 0usize;
    let mut first: Option<RgbImage> = None;
    for (index, decoded) in source.frames.enumerate() {
        let frame = match decoded {
            Ok(frame) => frame,
            Err(e) => {
                warn!(index, error = %format!("{e:#}"), "stopping extraction at undecodable frame");
                break;
            }
        };
        if index % stride != 0 {
            continue;
        }
        let path = dir.join(frame_file_name(saved));
        if let Err(e) = frame.save_with_format(&path, ImageFormat::Png) {
            warn!(path = %path.display(), error = %e, "failed to save extracted frame");
            continue;
        }
        saved += 1;
        if first.is_none() {
            first = Some(frame);
        }
    }

    write_thumbnail_or_placeholder(first.as_ref(), &dir.join(THUMBNAIL_FILE));
    Ok(saved)
}

pub fn sampling_stride(source_fps: f64, target_fps: u32) -> usize {
    if !(source_fps.is_finite() && source_fps > 0.0) || target_fps == 0 {
        return 1;
    }
    let stride = (source_fps / f64::from(target_fps)).round();
    if stride < 1.0 {
        1
    } else {
        stride as usize
    }
}

/// Largest size that fits within the thumbnail box, never upscaling.
pub fn thumbnail_size(width: u32, height: u32) -> (u32, u32) {
    if width == 0 || height == 0 {
        return (THUMBNAIL_MAX_WIDTH, THUMBNAIL_MAX_HEIGHT);
    }
    let scale = (f64::from(THUMBNAIL_MAX_WIDTH) / f64::from(width))
        .min(f64::from(THUMBNAIL_MAX_HEIGHT) / f64::from(height))
        .min(1.0);
    let w = (f64::from(width) * scale).round().max(1.0) as u32;
    let h = (f64::from(height) * scale).round().max(1.0) as u32;
    (w, h)
}

pub fn write_thumbnail(frame: &RgbImage, path: &Path) -> Result<()> {
    let (w, h) = thumbnail_size(frame.width(), frame.height());
    let thumb = if (w, h) == frame.dimensions() {
        frame.clone()
    } else {
        imageops::resize(frame, w, h, FilterType::Triangle)
    };
    write_jpeg(&thumb, path)
}

fn write_jpeg(image: &RgbImage, path: &Path) -> Result<()> {
    let file = fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, THUMBNAIL_QUALITY)
        .encode_image(image)
        .with_context(|| format!("failed to encode {}", path.display()))?;
    Ok(())
}

fn placeholder_thumbnail() -> RgbImage {
    RgbImage::from_pixel(THUMBNAIL_MAX_WIDTH, THUMBNAIL_MAX_HEIGHT, PLACEHOLDER_GRAY)
}

/// Writes a thumbnail from `frame`, or a flat gray one when there is no frame
/// or the real one cannot be written.
pub fn write_thumbnail_or_placeholder(frame: Option<&RgbImage>, path: &Path) {
    if let Some(frame) = frame {
        match write_thumbnail(frame, path) {
            Ok(()) => return,
            Err(e) => warn!(error = %format!("{e:#}"), "thumbnail failed, writing placeholder"),
        }
    }
    if let Err(e) = write_jpeg(&placeholder_thumbnail(), path) {
        warn!(error = %format!("{e:#}"), path = %path.display(), "failed to write placeholder thumbnail");
    }
}

/// Regenerates the thumbnail in `dir` from the first frame image, or from the
/// first decodable container frame when no images exist.
pub fn ensure_thumbnail(codec: &dyn VideoCodec, dir: &Path) -> PathBuf {
    let path = dir.join(THUMBNAIL_FILE);
    let first = first_frame(codec, dir);
    write_thumbnail_or_placeholder(first.as_ref(), &path);
    path
}

fn first_frame(codec: &dyn VideoCodec, dir: &Path) -> Option<RgbImage> {
    if let Some(path) = list_frame_files(dir).first() {
        match image::open(path) {
            Ok(image) => return Some(image.to_rgb8()),
            Err(e) => warn!(path = %path.display(), error = %e, "unreadable first frame"),
        }
    }
    let container = dir.join(CONTAINER_FILE);
    if !container.is_file() {
        return None;
    }
    let mut source = codec.open_source(&container).ok()?;
    source.frames.next().and_then(Result::ok)
}

/// Makes sure the container in `dir` exists, rebuilding it from stored frames
/// when only images are present.
pub fn ensure_container(codec: &dyn VideoCodec, dir: &Path, fps: u32) -> Result<PathBuf> {
    let path = dir.join(CONTAINER_FILE);
    if path.is_file() {
        return Ok(path);
    }
    if list_frame_files(dir).is_empty() {
        bail!("no container or frame images in {}", dir.display());
    }
    assemble_from_dir(codec, dir, fps)?;
    Ok(path)
}
