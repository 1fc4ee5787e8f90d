//! Generation request fields, their defaults and the clamping rules applied
//! before any work is scheduled.

use serde::{Deserialize, Serialize};

pub const WIDTH_RANGE: (i64, i64) = (128, 1920);
pub const HEIGHT_RANGE: (i64, i64) = (128, 1080);
pub const FRAME_RANGE: (i64, i64) = (1, 120);
pub const FPS_RANGE: (i64, i64) = (1, 60);
pub const STEPS_RANGE: (i64, i64) = (1, 1000);
const DIMENSION_ALIGN: i64 = 8;

/// A generation request as received from a caller. Numeric fields are signed
/// so out-of-range input can be clamped instead of rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationRequest {
    pub prompt: String,
    pub num_frames: i64,
    pub fps: i64,
    pub width: i64,
    pub height: i64,
    #[serde(alias = "use_hf_api")]
    pub use_cloud: bool,
    #[serde(alias = "hf_token", skip_serializing)]
    pub token: Option<String>,
    #[serde(alias = "hf_model_repo")]
    pub model_repo: Option<String>,
    #[serde(alias = "local_model_key")]
    pub local_model: Option<String>,
    pub negative_prompt: Option<String>,
    pub num_inference_steps: i64,
    pub guidance_scale: f32,
    pub seed: Option<i64>,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            num_frames: 24,
            fps: 8,
            width: 512,
            height: 512,
            use_cloud: true,
            token: None,
            model_repo: None,
            local_model: None,
            negative_prompt: None,
            num_inference_steps: 50,
            guidance_scale: 7.5,
            seed: None,
        }
    }
}

/// Which backends a job may use. Local is tried first when both are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendSelection {
    pub local_model: Option<String>,
    pub use_cloud: bool,
    pub model_repo: Option<String>,
}

/// Clamped parameters, persisted with the video record. Credentials are never
/// part of this type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationParams {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub num_frames: u32,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
    pub seed: Option<u64>,
    pub backend: BackendSelection,
}

impl GenerationRequest {
    pub fn has_prompt(&self) -> bool {
        !self.prompt.trim().is_empty()
    }

    pub fn clamped(&self) -> GenerationParams {
        GenerationParams {
            prompt: self.prompt.clone(),
            negative_prompt: self
                .negative_prompt
                .clone()
                .filter(|negative| !negative.trim().is_empty()),
            num_frames: clamp_count(self.num_frames, FRAME_RANGE),
            fps: clamp_count(self.fps, FPS_RANGE),
            width: clamp_dimension(self.width, WIDTH_RANGE),
            height: clamp_dimension(self.height, HEIGHT_RANGE),
            num_inference_steps: clamp_count(self.num_inference_steps, STEPS_RANGE),
            guidance_scale: self.guidance_scale,
            seed: self.seed.map(|seed| seed.max(0) as u64),
            backend: BackendSelection {
                local_model: self
                    .local_model
                    .clone()
                    .filter(|selector| !selector.trim().is_empty()),
                use_cloud: self.use_cloud,
                model_repo: self
                    .model_repo
                    .clone()
                    .filter(|repo| !repo.trim().is_empty()),
            },
        }
    }
}

/// Bound to `range`, then round down to a multiple of 8.
pub fn clamp_dimension(value: i64, (lo, hi): (i64, i64)) -> u32 {
    let aligned = value.clamp(lo, hi) / DIMENSION_ALIGN * DIMENSION_ALIGN;
    aligned as u32
}

pub fn clamp_count(value: i64, (lo, hi): (i64, i64)) -> u32 {
    value.clamp(lo, hi) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let params = GenerationRequest {
            prompt: "ocean".to_string(),
            ..Default::default()
        }
        .clamped();

        assert_eq!(params.num_frames, 24);
        assert_eq!(params.fps, 8);
        assert_eq!((params.width, params.height), (512, 512));
        assert_eq!(params.num_inference_steps, 50);
        assert!((params.guidance_scale - 7.5).abs() < f32::EPSILON);
        assert!(params.backend.use_cloud);
    }

    #[test]
    fn test_dimensions_are_bounded_and_aligned() {
        for value in [-50, 0, 7, 127, 128, 129, 135, 513, 1079, 1080, 1921, 5000, i64::MAX] {
            let w = clamp_dimension(value, WIDTH_RANGE);
            let h = clamp_dimension(value, HEIGHT_RANGE);
            assert_eq!(w % 8, 0, "width {w} from {value}");
            assert_eq!(h % 8, 0, "height {h} from {value}");
            assert!((128..=1920).contains(&w), "width {w} from {value}");
            assert!((128..=1080).contains(&h), "height {h} from {value}");
        }
        assert_eq!(clamp_dimension(519, WIDTH_RANGE), 512);
        assert_eq!(clamp_dimension(4000, HEIGHT_RANGE), 1080);
    }

    #[test]
    fn test_counts_are_bounded() {
        for value in [i64::MIN, -1, 0, 1, 30, 60, 61, 120, 121, 10_000] {
            let frames = clamp_count(value, FRAME_RANGE);
            let fps = clamp_count(value, FPS_RANGE);
            assert!((1..=120).contains(&frames));
            assert!((1..=60).contains(&fps));
        }
    }

    #[test]
    fn test_negative_steps_and_seed_are_clamped_not_rejected() {
        let request: GenerationRequest =
            serde_json::from_str(r#"{"prompt":"p","num_inference_steps":-5,"seed":-42}"#)
                .expect("parse");
        let params = request.clamped();
        assert_eq!(params.num_inference_steps, 1);
        assert_eq!(params.seed, Some(0));

        let big = GenerationRequest {
            prompt: "p".to_string(),
            num_inference_steps: 1_000_000,
            seed: Some(7),
            ..Default::default()
        }
        .clamped();
        assert_eq!(big.num_inference_steps, 1000);
        assert_eq!(big.seed, Some(7));
    }

    #[test]
    fn test_whitespace_prompt_is_not_a_prompt() {
        let request = GenerationRequest {
            prompt: " \t\n".to_string(),
            ..Default::default()
        };
        assert!(!request.has_prompt());
    }

    #[test]
    fn test_legacy_field_names_are_accepted() {
        let request: GenerationRequest = serde_json::from_str(
            r#"{"prompt":"p","use_hf_api":false,"local_model_key":"zeroscope-local","hf_token":"hf_x"}"#,
        )
        .expect("parse");
        assert!(!request.use_cloud);
        assert_eq!(request.local_model.as_deref(), Some("zeroscope-local"));
        assert_eq!(request.token.as_deref(), Some("hf_x"));
    }

    #[test]
    fn test_token_is_never_serialized() {
        let request = GenerationRequest {
            prompt: "p".to_string(),
            token: Some("hf_secret_value".to_string()),
            ..Default::default()
        };
        let encoded = serde_json::to_string(&request).expect("encode");
        assert!(!encoded.contains("hf_secret_value"));
    }

    #[test]
    fn test_blank_optional_strings_collapse_to_none() {
        let params = GenerationRequest {
            prompt: "p".to_string(),
            negative_prompt: Some("  ".to_string()),
            local_model: Some(String::new()),
            ..Default::default()
        }
        .clamped();
        assert_eq!(params.negative_prompt, None);
        assert_eq!(params.backend.local_model, None);
    }
}
