//! ONNX text-to-video exports executed with `ort`.
//!
//! A model directory holds `model_index.json` and one `.onnx` graph
//! (`pipeline.onnx` preferred). Known scalar inputs are fed only when the
//! graph declares them.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use half::f16;
use ndarray::{Array1, Array2};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    tensor::TensorElementType,
    value::{DynValue, Tensor, ValueType},
};
use tracing::{debug, info, warn};

use super::local::{LocalPipeline, PipelineLoader, PipelineRequest, UnsupportedArgument};
use crate::frame::{self, RawFrame};

pub const PREFERRED_GRAPH: &str = "pipeline.onnx";

const INPUT_IDS: &str = "input_ids";
const NEGATIVE_INPUT_IDS: &str = "negative_input_ids";
const HEIGHT: &str = "height";
const WIDTH: &str = "width";
const STEPS: &str = "num_inference_steps";
const NUM_FRAMES: &str = "num_frames";
const SEED: &str = "seed";
const GUIDANCE: &str = "guidance_scale";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputKind {
    F32,
    F16,
    U8,
}

/// Picks `pipeline.onnx` when present, otherwise the first `.onnx` file by name.
pub fn find_graph(model_dir: &Path) -> Result<PathBuf> {
    let preferred = model_dir.join(PREFERRED_GRAPH);
    if preferred.is_file() {
        return Ok(preferred);
    }
    let mut graphs: Vec<PathBuf> = fs::read_dir(model_dir)
        .with_context(|| format!("failed to read model directory {}", model_dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("onnx"))
        })
        .collect();
    graphs.sort();
    graphs
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("no .onnx graph in {}", model_dir.display()))
}

/// Prompt text as a `[1, n]` byte-id tensor.
fn text_ids(text: &str) -> Array2<i64> {
    let ids: Vec<i64> = text.bytes().map(i64::from).collect();
    let len = ids.len();
    Array2::from_shape_vec((1, len), ids).unwrap_or_else(|_| Array2::zeros((1, 0)))
}

fn scalar_i64(value: i64) -> Result<DynValue> {
    Ok(Tensor::from_array(Array1::from_vec(vec![value]))?.into_dyn())
}

#[derive(Debug, Default, Clone)]
pub struct OnnxLoader;

impl OnnxLoader {
    fn cuda_available() -> bool {
        CUDAExecutionProvider::default()
            .is_available()
            .unwrap_or(false)
    }
}

impl PipelineLoader for OnnxLoader {
    fn device(&self) -> String {
        if Self::cuda_available() {
            "cuda".to_string()
        } else {
            "cpu".to_string()
        }
    }

    fn load(&self, model_id: &str, model_dir: &Path, device: &str) -> Result<Arc<dyn LocalPipeline>> {
        let graph = find_graph(model_dir)?;
        let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
        let builder = if device == "cuda" {
            builder.with_execution_providers([CUDAExecutionProvider::default().build()])?
        } else {
            builder
        };
        let session = builder
            .commit_from_file(&graph)
            .with_context(|| format!("Failed to load ONNX model: {}", graph.display()))?;

        let input_names: Vec<String> = session
            .inputs()
            .iter()
            .map(|input| input.name().to_string())
            .collect();
        let output = session
            .outputs()
            .first()
            .ok_or_else(|| anyhow!("graph {} declares no outputs", graph.display()))?;
        let output_name = output.name().to_string();
        let output_kind = match output.dtype() {
            ValueType::Tensor { ty, .. } => match *ty {
                TensorElementType::Float32 => OutputKind::F32,
                TensorElementType::Float16 => OutputKind::F16,
                TensorElementType::Uint8 => OutputKind::U8,
                other => bail!("unsupported output element type {other:?} in {}", graph.display()),
            },
            other => bail!("graph output is not a tensor: {other:?}"),
        };

        info!(
            model_id,
            device,
            graph = %graph.display(),
            inputs = ?input_names,
            output = %output_name,
            "ONNX pipeline loaded"
        );

        Ok(Arc::new(OnnxPipeline {
            session: Mutex::new(session),
            input_names,
            output_name,
            output_kind,
        }))
    }
}

pub struct OnnxPipeline {
    session: Mutex<Session>,
    input_names: Vec<String>,
    output_name: String,
    output_kind: OutputKind,
}

impl OnnxPipeline {
    fn accepts(&self, name: &str) -> bool {
        self.input_names.iter().any(|input| input == name)
    }

    fn build_inputs(&self, request: &PipelineRequest) -> Result<Vec<(String, DynValue)>> {
        if request.num_frames.is_some() && !self.accepts(NUM_FRAMES) {
            return Err(UnsupportedArgument("num_frames").into());
        }

        let seed = request
            .seed
            .map_or_else(|| i64::from(rand::random::<u32>()), |seed| seed as i64);
        let mut inputs: Vec<(String, DynValue)> = Vec::new();
        for name in &self.input_names {
            let value = match name.as_str() {
                INPUT_IDS => Tensor::from_array(text_ids(&request.prompt))?.into_dyn(),
                NEGATIVE_INPUT_IDS => {
                    let negative = request.negative_prompt.as_deref().unwrap_or_default();
                    Tensor::from_array(text_ids(negative))?.into_dyn()
                }
                HEIGHT => scalar_i64(i64::from(request.height))?,
                WIDTH => scalar_i64(i64::from(request.width))?,
                STEPS => scalar_i64(i64::from(request.num_inference_steps))?,
                NUM_FRAMES => match request.num_frames {
                    Some(n) => scalar_i64(i64::from(n))?,
                    None => continue,
                },
                SEED => scalar_i64(seed)?,
                GUIDANCE => {
                    Tensor::from_array(Array1::from_vec(vec![request.guidance_scale]))?.into_dyn()
                }
                other => {
                    warn!(input = other, "leaving unrecognised graph input unset");
                    continue;
                }
            };
            inputs.push((name.clone(), value));
        }
        Ok(inputs)
    }
}

impl LocalPipeline for OnnxPipeline {
    fn generate(&self, request: &PipelineRequest) -> Result<Vec<RawFrame>> {
        let inputs = self.build_inputs(request)?;
        let mut session = self
            .session
            .lock()
            .map_err(|_| anyhow!("ONNX session lock poisoned"))?;

        let started = std::time::Instant::now();
        let outputs = session.run(inputs).context("ONNX pipeline run failed")?;
        let output = &outputs[self.output_name.as_str()];
        let raw = match self.output_kind {
            OutputKind::F32 => RawFrame::F32(output.try_extract_array::<f32>()?.to_owned()),
            OutputKind::F16 => RawFrame::F16(output.try_extract_array::<f16>()?.to_owned()),
            OutputKind::U8 => RawFrame::U8(output.try_extract_array::<u8>()?.to_owned()),
        };
        debug!(
            shape = ?raw.shape(),
            dtype = raw.dtype_name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ONNX pipeline output"
        );

        frame::split_frames(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preferred_graph_wins() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.onnx"), b"x").expect("write");
        fs::write(temp.path().join(PREFERRED_GRAPH), b"x").expect("write");
        assert_eq!(
            find_graph(temp.path()).expect("graph"),
            temp.path().join(PREFERRED_GRAPH)
        );
    }

    #[test]
    fn test_first_graph_by_name_otherwise() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("z.onnx"), b"x").expect("write");
        fs::write(temp.path().join("b.ONNX"), b"x").expect("write");
        fs::write(temp.path().join("model_index.json"), b"{}").expect("write");
        assert_eq!(
            find_graph(temp.path()).expect("graph"),
            temp.path().join("b.ONNX")
        );
    }

    #[test]
    fn test_directory_without_graph_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(find_graph(temp.path()).is_err());
    }

    #[test]
    fn test_prompt_ids_are_utf8_bytes() {
        let ids = text_ids("hé");
        assert_eq!(ids.shape(), &[1, 3]);
        assert_eq!(ids.row(0).to_vec(), vec![104, 195, 169]);
        assert_eq!(text_ids("").shape(), &[1, 0]);
    }
}
