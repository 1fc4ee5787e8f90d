//! `ffmpeg` encode subprocess fed with raw `rgb24` frames over stdin.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Stdio};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context, Result};
use image::RgbImage;
use tracing::debug;

use super::FrameSink;
use crate::logging::FFMPEG_ENCODE_TARGET;

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub output_path: PathBuf,
    /// Video codec (e.g. "libx264").
    pub codec: String,
    pub crf: u8,
    /// Output pixel format (e.g. "yuv420p").
    pub pixel_format: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl EncoderConfig {
    pub fn build_ffmpeg_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-nostdin".into(),
            "-y".into(),
            "-f".into(),
            "rawvideo".into(),
            "-pix_fmt".into(),
            "rgb24".into(),
            "-s".into(),
            format!("{}x{}", self.width, self.height),
            "-r".into(),
            self.fps.to_string(),
            "-i".into(),
            "pipe:0".into(),
            "-an".into(),
        ];

        // yuv420p needs even dimensions; pad by one pixel instead of failing.
        if self.width % 2 != 0 || self.height % 2 != 0 {
            args.extend(["-vf".into(), "pad=ceil(iw/2)*2:ceil(ih/2)*2".into()]);
        }

        args.extend([
            "-c:v".into(),
            self.codec.clone(),
            "-crf".into(),
            self.crf.to_string(),
            "-pix_fmt".into(),
            self.pixel_format.clone(),
            "-movflags".into(),
            "+faststart".into(),
            self.output_path.to_string_lossy().into_owned(),
        ]);

        args
    }

    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// Drains stderr on a background thread and kills ffmpeg on [`Drop`].
pub struct VideoEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr_thread: Option<JoinHandle<()>>,
    frame_size: usize,
    frames_written: usize,
}

impl VideoEncoder {
    pub fn new(config: &EncoderConfig) -> Result<Self> {
        let args = config.build_ffmpeg_args();

        debug!(
            cmd = %format!("ffmpeg {}", args.join(" ")),
            "launching ffmpeg encoder"
        );

        let mut child = crate::runtime::command_for("ffmpeg")
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to launch ffmpeg, is it installed?")?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stdin"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("failed to open ffmpeg stderr"))?;

        let stderr_thread = thread::spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) if !line.is_empty() => {
                        debug!(target: FFMPEG_ENCODE_TARGET, "{}", line);
                    }
                    Err(e) => {
                        debug!(target: FFMPEG_ENCODE_TARGET, "read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        });

        Ok(Self {
            child,
            stdin: Some(stdin),
            stderr_thread: Some(stderr_thread),
            frame_size: config.frame_size(),
            frames_written: 0,
        })
    }

    /// Frame data must be exactly `width * height * 3` bytes.
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        if data.len() != self.frame_size {
            bail!(
                "frame size mismatch: expected {} bytes, got {}",
                self.frame_size,
                data.len()
            );
        }

        self.stdin
            .as_mut()
            .ok_or_else(|| anyhow!("encoder stdin already closed"))?
            .write_all(data)
            .context("failed to write frame to ffmpeg stdin")?;
        self.frames_written += 1;
        Ok(())
    }
}

impl FrameSink for VideoEncoder {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        self.write_raw(frame.as_raw())
    }

    fn finish(&mut self) -> Result<()> {
        drop(self.stdin.take());

        let status = self.child.wait().context("failed to wait for ffmpeg")?;
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
        if !status.success() {
            bail!("ffmpeg encoder exited with status {status}");
        }

        debug!(frames = self.frames_written, "ffmpeg encoder finished");
        Ok(())
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        drop(self.stdin.take());
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}
