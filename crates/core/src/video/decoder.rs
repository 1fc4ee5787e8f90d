use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Stdio};
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use image::RgbImage;
use serde::Deserialize;
use tracing::{debug, warn};

use super::SourceInfo;
use crate::logging::FFMPEG_DECODE_TARGET;

/// Frame rate assumed when the container does not report one.
pub const DEFAULT_SOURCE_FPS: f64 = 8.0;

#[derive(Deserialize, Debug)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Deserialize, Debug)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    let rate = match s.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den <= 0.0 {
                return None;
            }
            num / den
        }
        None => s.trim().parse().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

pub(crate) fn parse_probe_json(json: &[u8]) -> Result<SourceInfo> {
    let probe: FfprobeOutput =
        serde_json::from_slice(json).context("failed to parse ffprobe JSON output")?;

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| anyhow!("container has no video stream"))?;

    let width = video.width.ok_or_else(|| anyhow!("video stream missing width"))?;
    let height = video
        .height
        .ok_or_else(|| anyhow!("video stream missing height"))?;
    if width == 0 || height == 0 {
        bail!("video stream reports empty dimensions {width}x{height}");
    }

    let fps = video
        .avg_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| video.r_frame_rate.as_deref().and_then(parse_frame_rate))
        .unwrap_or(DEFAULT_SOURCE_FPS);

    Ok(SourceInfo { width, height, fps })
}

pub fn probe(path: &Path) -> Result<SourceInfo> {
    let output = crate::runtime::command_for("ffprobe")
        .args(["-v", "quiet", "-print_format", "json", "-show_streams"])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffprobe, is FFmpeg installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        );
    }

    parse_probe_json(&output.stdout)
        .with_context(|| format!("failed to probe {}", path.display()))
}

/// Decodes a container to `rgb24` frames via an ffmpeg subprocess, one frame
/// per [`Iterator::next`]. Kills ffmpeg on [`Drop`].
pub struct VideoDecoder {
    child: Child,
    width: u32,
    height: u32,
    frame_size: usize,
    stderr_thread: Option<thread::JoinHandle<()>>,
    done: bool,
}

impl VideoDecoder {
    pub fn new(path: &Path, info: &SourceInfo) -> Result<Self> {
        let mut child = crate::runtime::command_for("ffmpeg")
            .arg("-nostdin")
            .arg("-i")
            .arg(path)
            .args([
                "-map", "0:v:0", "-f", "rawvideo", "-pix_fmt", "rgb24", "-v", "error", "pipe:1",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg, is it installed?")?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stderr"))?;
        let stderr_thread = thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                if !line.is_empty() {
                    debug!(target: FFMPEG_DECODE_TARGET, "{}", line);
                }
            }
        });

        Ok(Self {
            child,
            width: info.width,
            height: info.height,
            frame_size: info.width as usize * info.height as usize * 3,
            stderr_thread: Some(stderr_thread),
            done: false,
        })
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>> {
        let stdout = self
            .child
            .stdout
            .as_mut()
            .ok_or_else(|| anyhow!("ffmpeg stdout not available"))?;

        let mut buf = vec![0u8; self.frame_size];
        let mut total_read = 0;
        while total_read < self.frame_size {
            match stdout.read(&mut buf[total_read..]) {
                Ok(0) => {
                    if total_read > 0 {
                        warn!(
                            "partial frame at EOF ({total_read}/{} bytes), discarding",
                            self.frame_size
                        );
                    }
                    return Ok(None);
                }
                Ok(n) => total_read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("failed to read frame from ffmpeg stdout"),
            }
        }

        RgbImage::from_raw(self.width, self.height, buf)
            .map(Some)
            .ok_or_else(|| anyhow!("decoded frame buffer has the wrong size"))
    }
}

impl Iterator for VideoDecoder {
    type Item = Result<RgbImage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_fractional_and_plain_rates() {
        assert_eq!(parse_frame_rate("24/1"), Some(24.0));
        assert!((parse_frame_rate("24000/1001").expect("ntsc") - 23.976).abs() < 0.001);
        assert_eq!(parse_frame_rate("8"), Some(8.0));
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("garbage"), None);
    }

    #[test]
    fn test_probe_json_picks_first_video_stream() {
        let json = br#"{
            "streams": [
                {"codec_type": "audio"},
                {"codec_type": "video", "width": 320, "height": 240,
                 "r_frame_rate": "24/1", "avg_frame_rate": "12/1"}
            ]
        }"#;
        let info = parse_probe_json(json).expect("parse");
        assert_eq!((info.width, info.height), (320, 240));
        assert_eq!(info.fps, 12.0);
    }

    #[test]
    fn test_probe_json_defaults_missing_rate() {
        let json = br#"{"streams":[{"codec_type":"video","width":64,"height":64,"avg_frame_rate":"0/0"}]}"#;
        let info = parse_probe_json(json).expect("parse");
        assert_eq!(info.fps, DEFAULT_SOURCE_FPS);
    }

    #[test]
    fn test_probe_json_without_video_is_an_error() {
        let json = br#"{"streams":[{"codec_type":"audio"}]}"#;
        let err = parse_probe_json(json).expect_err("no video");
        assert!(err.to_string().contains("no video stream"));
    }

    #[test]
    #[ignore = "requires ffmpeg and ffprobe on PATH"]
    fn test_decodes_what_the_encoder_wrote() {
        use crate::video::encoder::{EncoderConfig, VideoEncoder};
        use crate::video::FrameSink;

        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = EncoderConfig {
            output_path: temp.path().join("roundtrip.mp4"),
            codec: "libx264".to_string(),
            crf: 18,
            pixel_format: "yuv420p".to_string(),
            width: 64,
            height: 48,
            fps: 8,
        };
        let mut encoder = VideoEncoder::new(&cfg).expect("encoder");
        let frame = RgbImage::from_pixel(64, 48, image::Rgb([10, 200, 10]));
        for _ in 0..6 {
            encoder.write_frame(&frame).expect("write");
        }
        encoder.finish().expect("finish");

        let info = probe(&cfg.output_path).expect("probe");
        assert_eq!((info.width, info.height), (64, 48));
        let decoded: Vec<RgbImage> = VideoDecoder::new(&cfg.output_path, &info)
            .expect("decoder")
            .collect::<Result<_>>()
            .expect("frames");
        assert_eq!(decoded.len(), 6);
    }
}
