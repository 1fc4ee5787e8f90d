//! Container encode/decode behind the [`VideoCodec`] seam, and the assembly
//! helpers that turn frame sequences into on-disk artifacts.

pub mod assembler;
pub mod decoder;
pub mod encoder;

use std::path::Path;

use anyhow::Result;
use image::RgbImage;

use crate::config::EncodingConfig;

/// Receives canonical frames of a fixed size and produces a container on `finish`.
pub trait FrameSink: Send {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// A decoded container: stream properties plus a lazy frame iterator.
pub struct DecodedSource {
    pub info: SourceInfo,
    pub frames: Box<dyn Iterator<Item = Result<RgbImage>> + Send>,
}

pub trait VideoCodec: Send + Sync {
    fn open_sink(&self, path: &Path, width: u32, height: u32, fps: u32)
        -> Result<Box<dyn FrameSink>>;
    fn open_source(&self, path: &Path) -> Result<DecodedSource>;
}

/// Production codec: `ffmpeg` for encoding, `ffprobe` + `ffmpeg` for decoding.
#[derive(Debug, Clone, Default)]
pub struct FfmpegCodec {
    encoding: EncodingConfig,
}

impl FfmpegCodec {
    pub fn new(encoding: EncodingConfig) -> Self {
        Self { encoding }
    }
}

impl VideoCodec for FfmpegCodec {
    fn open_sink(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        fps: u32,
    ) -> Result<Box<dyn FrameSink>> {
        let config = encoder::EncoderConfig {
            output_path: path.to_path_buf(),
            codec: self.encoding.codec.clone(),
            crf: self.encoding.crf,
            pixel_format: self.encoding.pixel_format.clone(),
            width,
            height,
            fps,
        };
        Ok(Box::new(encoder::VideoEncoder::new(&config)?))
    }

    fn open_source(&self, path: &Path) -> Result<DecodedSource> {
        let info = decoder::probe(path)?;
        let frames = decoder::VideoDecoder::new(path, &info)?;
        Ok(DecodedSource {
            info,
            frames: Box::new(frames),
        })
    }
}
