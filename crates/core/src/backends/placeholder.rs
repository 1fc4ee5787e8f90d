//! Deterministic fallback animator: the prompt rendered onto a dark card and
//! brought to life with gentle camera motion, flow and grain.

use std::f64::consts::{PI, TAU};

use anyhow::{bail, Result};
use image::{imageops, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use super::glyphs::{glyph, GLYPH_HEIGHT, GLYPH_WIDTH};
use super::{BackendKind, BackendOutput, BackendRequest, GenerationBackend};
use crate::frame::RawFrame;

const BACKGROUND: Rgb<u8> = Rgb([10, 10, 15]);
const TEXT_COLOR: Rgb<u8> = Rgb([139, 92, 246]);
const PROMPT_CHARS: usize = 60;

const CONTRAST: f32 = 1.08;
const BRIGHTNESS: f32 = 1.03;
const SATURATION: f32 = 1.02;
const SHARPEN_SIGMA: f32 = 1.0;
const SHARPEN_THRESHOLD: i32 = 2;

const NOISE_SCALE: f64 = 0.005;
const FLOW_STRENGTH: f64 = 0.6;
const GRAIN_SIGMA: f64 = 0.75;

#[derive(Debug, Default, Clone)]
pub struct PlaceholderBackend;

impl GenerationBackend for PlaceholderBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Placeholder
    }

    fn generate(&self, request: &BackendRequest) -> Result<BackendOutput> {
        if request.prompt.trim().is_empty() {
            bail!("Empty prompt");
        }
        let mut rng = match request.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let base = enhance(&render_base(request.width.max(1), request.height.max(1), &request.prompt));
        let frames = animate(&base, request.num_frames.max(1) as usize, &mut rng);
        debug!(
            backend = %BackendKind::Placeholder,
            frames = frames.len(),
            width = base.width(),
            height = base.height(),
            "placeholder frames synthesized"
        );
        Ok(BackendOutput::Frames(
            frames.into_iter().map(RawFrame::from).collect(),
        ))
    }
}

/// Dark card with the prompt centered, wrapped to the card width.
pub fn render_base(width: u32, height: u32, prompt: &str) -> RgbImage {
    let mut image = RgbImage::from_pixel(width, height, BACKGROUND);
    let text: String = prompt.trim().chars().take(PROMPT_CHARS).collect::<String>().to_uppercase();
    if text.is_empty() {
        return image;
    }

    let scale = (width.min(height) / 90).max(2);
    let advance = (GLYPH_WIDTH + 1) * scale;
    let line_height = (GLYPH_HEIGHT + 2) * scale;
    let per_line = (width / advance).max(1) as usize;
    let chars: Vec<char> = text.chars().collect();
    let lines: Vec<&[char]> = chars.chunks(per_line).collect();

    let block_height = lines.len() as u32 * line_height - 2 * scale;
    let mut y = height.saturating_sub(block_height) / 2;
    for line in lines {
        let line_width = line.len() as u32 * advance - scale;
        let mut x = width.saturating_sub(line_width) / 2;
        for &c in line {
            draw_glyph(&mut image, c, x, y, scale);
            x += advance;
        }
        y += line_height;
    }
    image
}

fn draw_glyph(image: &mut RgbImage, c: char, x0: u32, y0: u32, scale: u32) {
    for (row, bits) in glyph(c).iter().enumerate() {
        for col in 0..GLYPH_WIDTH {
            if bits & (1 << (GLYPH_WIDTH - 1 - col)) == 0 {
                continue;
            }
            for dy in 0..scale {
                for dx in 0..scale {
                    let x = x0 + col * scale + dx;
                    let y = y0 + row as u32 * scale + dy;
                    if x < image.width() && y < image.height() {
                        image.put_pixel(x, y, TEXT_COLOR);
                    }
                }
            }
        }
    }
}

fn luma(p: &Rgb<u8>) -> f32 {
    0.299 * f32::from(p[0]) + 0.587 * f32::from(p[1]) + 0.114 * f32::from(p[2])
}

fn to_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// Contrast, brightness, unsharp sharpening, then saturation.
pub fn enhance(base: &RgbImage) -> RgbImage {
    let pixel_count = (base.width() as usize * base.height() as usize).max(1);
    let mean = base.pixels().map(luma).sum::<f32>() / pixel_count as f32;

    let mut image = base.clone();
    for p in image.pixels_mut() {
        for c in p.0.iter_mut() {
            let contrasted = mean + (f32::from(*c) - mean) * CONTRAST;
            *c = to_u8(to_u8(contrasted) as f32 * BRIGHTNESS);
        }
    }

    let mut image = imageops::unsharpen(&image, SHARPEN_SIGMA, SHARPEN_THRESHOLD);
    for p in image.pixels_mut() {
        let gray = luma(p);
        for c in p.0.iter_mut() {
            *c = to_u8(gray + (f32::from(*c) - gray) * SATURATION);
        }
    }
    image
}

/// `BORDER_REFLECT` indexing: `fedcba|abcdef|fedcba`.
fn reflect(i: i64, n: i64) -> usize {
    if n <= 1 {
        return 0;
    }
    let period = 2 * n;
    let m = i.rem_euclid(period);
    (if m < n { m } else { period - 1 - m }) as usize
}

fn sample_bilinear(image: &RgbImage, x: f64, y: f64) -> [f64; 3] {
    let (w, h) = (i64::from(image.width()), i64::from(image.height()));
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (x0, y0) = (x0 as i64, y0 as i64);

    let px = |xi: i64, yi: i64| image.get_pixel(reflect(xi, w) as u32, reflect(yi, h) as u32);
    let (a, b, c, d) = (px(x0, y0), px(x0 + 1, y0), px(x0, y0 + 1), px(x0 + 1, y0 + 1));
    let mut out = [0.0; 3];
    for (k, value) in out.iter_mut().enumerate() {
        let top = f64::from(a[k]) * (1.0 - fx) + f64::from(b[k]) * fx;
        let bottom = f64::from(c[k]) * (1.0 - fx) + f64::from(d[k]) * fx;
        *value = top * (1.0 - fy) + bottom * fy;
    }
    out
}

/// Standard normal sample via Box-Muller.
fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos()
}

/// Per-frame camera parameters for `t` in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Camera {
    tx: f64,
    ty: f64,
    zoom: f64,
    angle_deg: f64,
}

impl Camera {
    fn at(t: f64) -> Self {
        Self {
            tx: 2.0 * (TAU * t).cos(),
            ty: 2.0 * (TAU * t).sin(),
            zoom: 1.0 + 0.01 * (TAU * t).sin(),
            angle_deg: 1.5 * (TAU * t + PI / 4.0).sin(),
        }
    }

    /// Maps an output position back to the source image: the inverse of
    /// scale-about-center, rotate, translate.
    fn source_of(&self, x: f64, y: f64, cx: f64, cy: f64) -> (f64, f64) {
        let theta = self.angle_deg.to_radians();
        let alpha = self.zoom * theta.cos();
        let beta = self.zoom * theta.sin();
        let dx = x - cx - self.tx;
        let dy = y - cy - self.ty;
        let det = alpha * alpha + beta * beta;
        let sx = (alpha * dx - beta * dy) / det;
        let sy = (beta * dx + alpha * dy) / det;
        (sx + cx, sy + cy)
    }
}

pub fn animate(base: &RgbImage, num_frames: usize, rng: &mut StdRng) -> Vec<RgbImage> {
    let (w, h) = base.dimensions();
    let (cx, cy) = (f64::from(w) / 2.0, f64::from(h) / 2.0);
    let phase = rng.gen::<f64>() * TAU;

    let disp: Vec<(f64, f64)> = (0..h)
        .flat_map(|y| (0..w).map(move |x| (f64::from(x), f64::from(y))))
        .map(|(x, y)| {
            let dx = (x * NOISE_SCALE + phase).sin() * (y * NOISE_SCALE * 1.3 + phase).cos();
            let dy = (x * NOISE_SCALE * 0.9 + phase).cos() * (y * NOISE_SCALE + phase).sin();
            (dx, dy)
        })
        .collect();

    (0..num_frames)
        .map(|i| {
            let t = i as f64 / (num_frames.saturating_sub(1)).max(1) as f64;
            let camera = Camera::at(t);
            let flow_x = FLOW_STRENGTH * (TAU * (t + 0.15)).sin();
            let flow_y = FLOW_STRENGTH * (TAU * (t + 0.3)).cos();
            let exposure = 1.0 + 0.03 * (TAU * (t + 0.1)).sin();
            let temperature = 1.0 + 0.02 * (TAU * (t + 0.2)).cos();
            let gains = [1.0, 0.995 + 0.01 * (2.0 - temperature), temperature];

            let mut frame = RgbImage::new(w, h);
            for (x, y, pixel) in frame.enumerate_pixels_mut() {
                let (dx, dy) = disp[(y * w + x) as usize];
                let fx = f64::from(x) + dx * flow_x;
                let fy = f64::from(y) + dy * flow_y;
                let (sx, sy) = camera.source_of(fx, fy, cx, cy);
                let rgb = sample_bilinear(base, sx, sy);
                for k in 0..3 {
                    let exposed = (rgb[k] * exposure).clamp(0.0, 255.0) * gains[k];
                    let grain = gaussian(rng) * GRAIN_SIGMA;
                    pixel[k] = (exposed + grain).round().clamp(0.0, 255.0) as u8;
                }
            }
            frame
        })
        .collect()
}
