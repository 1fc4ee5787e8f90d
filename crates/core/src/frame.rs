//! Frame payloads produced by generation backends and their reduction to the
//! canonical RGB image every downstream stage works with.
//!
//! Backends hand back whatever their runtime produces: decoded images, or
//! numeric tensors of rank 2 to 5 in either channel-first or channel-last
//! layout and any of several element types. [`normalize`] resolves all of them
//! into an [`RgbImage`] or fails with a diagnostic naming the source shape and
//! element type.

use std::fmt;

use anyhow::{bail, Result};
use half::f16;
use image::{DynamicImage, RgbImage};
use ndarray::{ArrayD, ArrayViewD, Axis, Ix3};

/// Canonical frame representation: 3 channels, 8 bits per channel, row-major HWC.
pub type CanonicalFrame = RgbImage;

/// One frame as emitted by a backend, before normalization.
#[derive(Debug, Clone)]
pub enum RawFrame {
    Image(DynamicImage),
    U8(ArrayD<u8>),
    U16(ArrayD<u16>),
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
    F16(ArrayD<f16>),
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
}

/// Apply `$body` to the array inside any tensor variant.
macro_rules! with_array {
    ($frame:expr, $arr:ident => $body:expr, image $img:ident => $img_body:expr) => {
        match $frame {
            RawFrame::Image($img) => $img_body,
            RawFrame::U8($arr) => $body,
            RawFrame::U16($arr) => $body,
            RawFrame::I32($arr) => $body,
            RawFrame::I64($arr) => $body,
            RawFrame::F16($arr) => $body,
            RawFrame::F32($arr) => $body,
            RawFrame::F64($arr) => $body,
        }
    };
}

impl RawFrame {
    pub fn dtype_name(&self) -> &'static str {
        match self {
            Self::Image(_) => "image",
            Self::U8(_) => "u8",
            Self::U16(_) => "u16",
            Self::I32(_) => "i32",
            Self::I64(_) => "i64",
            Self::F16(_) => "f16",
            Self::F32(_) => "f32",
            Self::F64(_) => "f64",
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        with_array!(self, arr => arr.shape().to_vec(),
            image img => vec![img.height() as usize, img.width() as usize, 3])
    }
}

impl From<RgbImage> for RawFrame {
    fn from(image: RgbImage) -> Self {
        Self::Image(DynamicImage::ImageRgb8(image))
    }
}

impl fmt::Display for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self.shape(), self.dtype_name())
    }
}

/// Element types a tensor frame may carry.
trait Sample: Copy {
    const KIND: SampleKind;
    fn to_f64(self) -> f64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SampleKind {
    Byte,
    Integer,
    Float,
}

macro_rules! impl_sample {
    ($ty:ty, $kind:expr, |$v:ident| $conv:expr) => {
        impl Sample for $ty {
            const KIND: SampleKind = $kind;
            fn to_f64(self) -> f64 {
                let $v = self;
                $conv
            }
        }
    };
}

impl_sample!(u8, SampleKind::Byte, |v| f64::from(v));
impl_sample!(u16, SampleKind::Integer, |v| f64::from(v));
impl_sample!(i32, SampleKind::Integer, |v| f64::from(v));
impl_sample!(i64, SampleKind::Integer, |v| v as f64);
impl_sample!(f16, SampleKind::Float, |v| v.to_f64());
impl_sample!(f32, SampleKind::Float, |v| f64::from(v));
impl_sample!(f64, SampleKind::Float, |v| v);

/// Reduce a raw frame to a canonical RGB image.
pub fn normalize(raw: &RawFrame) -> Result<CanonicalFrame> {
    let result = with_array!(raw, arr => normalize_array(arr.view()),
        image img => Ok(img.to_rgb8()));
    result.map_err(|err| {
        anyhow::anyhow!(
            "cannot convert frame of shape {:?} (dtype {}) to an RGB image: {err}",
            raw.shape(),
            raw.dtype_name()
        )
    })
}

/// Same as [`normalize`] but consumes the frame, avoiding a copy for RGB images.
pub fn normalize_owned(raw: RawFrame) -> Result<CanonicalFrame> {
    match raw {
        RawFrame::Image(DynamicImage::ImageRgb8(img)) => Ok(img),
        other => normalize(&other),
    }
}

fn normalize_array<T: Sample>(arr: ArrayViewD<'_, T>) -> Result<CanonicalFrame> {
    let hwc = reduce_to_hwc(arr)?.into_dimensionality::<Ix3>()?;
    let (height, width, channels) = (hwc.shape()[0], hwc.shape()[1], hwc.shape()[2]);
    if height == 0 || width == 0 {
        bail!("frame has an empty spatial axis");
    }
    let source_channel = |c: usize| match channels {
        1 => Ok(0),
        3 | 4 => Ok(c),
        other => Err(anyhow::anyhow!("unexpected channel count {other}")),
    };
    let channel_map = [source_channel(0)?, source_channel(1)?, source_channel(2)?];

    let mut values = Vec::with_capacity(height * width * 3);
    for y in 0..height {
        for x in 0..width {
            for &c in &channel_map {
                values.push(hwc[[y, x, c]].to_f64());
            }
        }
    }

    let to_byte = value_mapping(T::KIND, &values);
    let bytes: Vec<u8> = values.into_iter().map(to_byte).collect();

    let (w, h) = (u32::try_from(width)?, u32::try_from(height)?);
    RgbImage::from_raw(w, h, bytes)
        .ok_or_else(|| anyhow::anyhow!("pixel buffer does not match {width}x{height}"))
}

/// Squeeze singleton axes, collapse leading batch/time axes and move channels last.
fn reduce_to_hwc<T: Copy>(arr: ArrayViewD<'_, T>) -> Result<ArrayViewD<'_, T>> {
    let mut view = squeeze(arr);
    while view.ndim() > 3 {
        view = squeeze(view.index_axis_move(Axis(0), 0));
    }

    match view.ndim() {
        2 => Ok(view.insert_axis(Axis(2))),
        3 => {
            let shape = view.shape();
            let channel_first =
                matches!(shape[0], 1 | 3 | 4) && shape[0] < shape[1].min(shape[2]);
            if channel_first {
                Ok(view.permuted_axes(vec![1, 2, 0]))
            } else {
                Ok(view)
            }
        }
        rank => bail!("unsupported rank {rank} after removing singleton axes"),
    }
}

fn squeeze<T>(mut view: ArrayViewD<'_, T>) -> ArrayViewD<'_, T> {
    for axis in (0..view.ndim()).rev() {
        if view.len_of(Axis(axis)) == 1 {
            view = view.index_axis_move(Axis(axis), 0);
        }
    }
    view
}

/// Pick the 8-bit mapping for a sample buffer: bytes pass through, floats in
/// `[0, 1]` scale by 255, floats in `[-1, 1]` map affinely, everything else clips.
fn value_mapping(kind: SampleKind, values: &[f64]) -> fn(f64) -> u8 {
    fn clip(v: f64) -> u8 {
        v.clamp(0.0, 255.0) as u8
    }
    fn unit(v: f64) -> u8 {
        (v * 255.0) as u8
    }
    fn signed_unit(v: f64) -> u8 {
        ((v + 1.0) * 127.5) as u8
    }

    match kind {
        SampleKind::Byte | SampleKind::Integer => clip,
        SampleKind::Float => {
            let (min, max) = values
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                    (lo.min(*v), hi.max(*v))
                });
            if min >= 0.0 && max <= 1.0 {
                unit
            } else if min >= -1.0 && max <= 1.0 {
                signed_unit
            } else {
                clip
            }
        }
    }
}

/// Split a whole pipeline output into per-frame payloads.
///
/// 5-D outputs are `(batch, time, ...)`: the first batch is kept and time is
/// iterated. 4-D outputs are time-major unless the second axis looks like a
/// channel axis, in which case the tensor is a single batched image.
pub fn split_frames(raw: RawFrame) -> Result<Vec<RawFrame>> {
    macro_rules! split {
        ($arr:expr, $variant:path) => {
            split_array($arr)?.into_iter().map($variant).collect()
        };
    }

    let frames: Vec<RawFrame> = match raw {
        RawFrame::Image(img) => vec![RawFrame::Image(img)],
        RawFrame::U8(arr) => split!(arr, RawFrame::U8),
        RawFrame::U16(arr) => split!(arr, RawFrame::U16),
        RawFrame::I32(arr) => split!(arr, RawFrame::I32),
        RawFrame::I64(arr) => split!(arr, RawFrame::I64),
        RawFrame::F16(arr) => split!(arr, RawFrame::F16),
        RawFrame::F32(arr) => split!(arr, RawFrame::F32),
        RawFrame::F64(arr) => split!(arr, RawFrame::F64),
    };
    if frames.is_empty() {
        bail!("pipeline output contains no frames");
    }
    Ok(frames)
}

fn split_array<T: Clone>(arr: ArrayD<T>) -> Result<Vec<ArrayD<T>>> {
    let shape = arr.shape().to_vec();
    match shape.len() {
        5 => {
            let batch = arr.index_axis_move(Axis(0), 0);
            Ok(batch.outer_iter().map(|frame| frame.to_owned()).collect())
        }
        4 if matches!(shape[1], 1 | 3 | 4) && shape[1] < shape[2] => {
            Ok(vec![arr.index_axis_move(Axis(0), 0)])
        }
        4 => Ok(arr.outer_iter().map(|frame| frame.to_owned()).collect()),
        2 | 3 => Ok(vec![arr]),
        rank => bail!("unexpected pipeline output rank {rank} with shape {shape:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, IxDyn};

    fn gradient_hwc(h: usize, w: usize) -> ArrayD<u8> {
        Array::from_shape_fn(IxDyn(&[h, w, 3]), |idx| {
            (idx[0] * 31 + idx[1] * 7 + idx[2] * 50) as u8
        })
    }

    #[test]
    fn test_canonical_image_round_trips_unchanged() {
        let img = RgbImage::from_fn(5, 4, |x, y| image::Rgb([x as u8, y as u8, 9]));
        let out = normalize(&RawFrame::from(img.clone())).expect("normalize");
        assert_eq!(out, img);
        assert_eq!(normalize_owned(RawFrame::from(img.clone())).expect("owned"), img);
    }

    #[test]
    fn test_canonical_u8_array_keeps_every_pixel() {
        let arr = gradient_hwc(6, 8);
        let out = normalize(&RawFrame::U8(arr.clone())).expect("normalize");
        assert_eq!(out.dimensions(), (8, 6));
        for ((y, x, c), v) in arr
            .into_dimensionality::<ndarray::Ix3>()
            .expect("rank 3")
            .indexed_iter()
        {
            assert_eq!(out.get_pixel(x as u32, y as u32)[c], *v);
        }
    }

    #[test]
    fn test_channel_first_matches_channel_last() {
        let hwc = gradient_hwc(6, 8);
        let chw = hwc.clone().permuted_axes(vec![2, 0, 1]).as_standard_layout().to_owned();
        assert_eq!(chw.shape(), &[3, 6, 8]);

        let a = normalize(&RawFrame::U8(hwc)).expect("hwc");
        let b = normalize(&RawFrame::U8(chw)).expect("chw");
        assert_eq!(a, b);
    }

    #[test]
    fn test_signed_and_unit_float_ranges_agree() {
        let unit = [
            0.0f32, 0.25, 0.5, 0.75, 1.0, 0.5, 0.125, 0.375, 0.625, 0.875, 0.0, 1.0,
        ];
        let signed: Vec<f32> = unit.iter().map(|v| v * 2.0 - 1.0).collect();

        let unit_arr = ArrayD::from_shape_vec(IxDyn(&[2, 2, 3]), unit.to_vec()).expect("shape");
        let signed_arr = ArrayD::from_shape_vec(IxDyn(&[2, 2, 3]), signed).expect("shape");

        let a = normalize(&RawFrame::F32(unit_arr)).expect("unit");
        let b = normalize(&RawFrame::F32(signed_arr)).expect("signed");
        assert_eq!(a, b);
        assert_eq!(a.get_pixel(0, 0).0, [0, 63, 127]);
        assert_eq!(a.get_pixel(1, 0).0, [191, 255, 127]);
    }

    fn per_channel<T: Copy>(values: [T; 3]) -> ArrayD<T> {
        Array::from_shape_fn(IxDyn(&[2, 2, 3]), |idx| values[idx[2]])
    }

    #[test]
    fn test_out_of_range_floats_and_wide_ints_are_clipped() {
        let out = normalize(&RawFrame::F64(per_channel([-20.0f64, 128.4, 900.0]))).expect("floats");
        assert_eq!(out.get_pixel(0, 0).0, [0, 128, 255]);

        let out = normalize(&RawFrame::I64(per_channel([-5i64, 77, 4000]))).expect("ints");
        assert_eq!(out.get_pixel(1, 1).0, [0, 77, 255]);
    }

    #[test]
    fn test_half_precision_is_accepted() {
        let values = [f16::from_f32(0.0), f16::from_f32(0.5), f16::from_f32(1.0)];
        let out = normalize(&RawFrame::F16(per_channel(values))).expect("f16");
        assert_eq!(out.get_pixel(0, 1).0, [0, 127, 255]);
    }

    #[test]
    fn test_grayscale_is_replicated_to_three_channels() {
        let arr = ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![10u8, 20, 30, 40]).expect("shape");
        let out = normalize(&RawFrame::U8(arr)).expect("gray");
        assert_eq!(out.get_pixel(1, 1).0, [40, 40, 40]);
    }

    #[test]
    fn test_alpha_channel_is_dropped() {
        let arr = Array::from_shape_fn(IxDyn(&[2, 3, 4]), |idx| (idx[2] * 60) as u8);
        let out = normalize(&RawFrame::U8(arr)).expect("rgba");
        assert_eq!(out.dimensions(), (3, 2));
        assert_eq!(out.get_pixel(0, 0).0, [0, 60, 120]);
    }

    #[test]
    fn test_leading_batch_and_time_axes_take_first_element() {
        let mut arr = ArrayD::<u8>::zeros(IxDyn(&[2, 3, 4, 5, 3]));
        arr.index_axis_mut(Axis(0), 0)
            .index_axis_move(Axis(0), 0)
            .fill(200);
        let out = normalize(&RawFrame::U8(arr)).expect("rank 5");
        assert_eq!(out.dimensions(), (5, 4));
        assert!(out.pixels().all(|p| p.0 == [200, 200, 200]));
    }

    #[test]
    fn test_singleton_axes_are_stripped_everywhere() {
        let arr = Array::from_shape_fn(IxDyn(&[1, 1, 3, 1, 4, 5]), |idx| idx[4] as u8);
        let out = normalize(&RawFrame::U8(arr)).expect("singletons");
        assert_eq!(out.dimensions(), (5, 4));
        assert_eq!(out.get_pixel(0, 2).0, [2, 2, 2]);
    }

    #[test]
    fn test_malformed_channel_count_reports_shape_and_dtype() {
        let arr = ArrayD::<f32>::zeros(IxDyn(&[4, 4, 7]));
        let err = normalize(&RawFrame::F32(arr)).expect_err("seven channels");
        let message = format!("{err:#}");
        assert!(message.contains("[4, 4, 7]"), "{message}");
        assert!(message.contains("f32"), "{message}");
    }

    #[test]
    fn test_rank_one_is_rejected() {
        let arr = ArrayD::<u8>::zeros(IxDyn(&[12]));
        assert!(normalize(&RawFrame::U8(arr)).is_err());
    }

    #[test]
    fn test_split_five_d_iterates_time_of_first_batch() {
        let arr = ArrayD::<f32>::zeros(IxDyn(&[2, 6, 8, 8, 3]));
        let frames = split_frames(RawFrame::F32(arr)).expect("split");
        assert_eq!(frames.len(), 6);
        assert_eq!(frames[0].shape(), vec![8, 8, 3]);
    }

    #[test]
    fn test_split_four_d_distinguishes_time_from_channels() {
        let time_major = ArrayD::<u8>::zeros(IxDyn(&[5, 16, 16, 3]));
        assert_eq!(split_frames(RawFrame::U8(time_major)).expect("time").len(), 5);

        let batched_chw = ArrayD::<u8>::zeros(IxDyn(&[2, 3, 16, 16]));
        let frames = split_frames(RawFrame::U8(batched_chw)).expect("chw");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].shape(), vec![3, 16, 16]);
    }

    #[test]
    fn test_split_rejects_rank_six() {
        let arr = ArrayD::<u8>::zeros(IxDyn(&[1, 1, 1, 2, 2, 3]));
        assert!(split_frames(RawFrame::U8(arr)).is_err());
    }
}
