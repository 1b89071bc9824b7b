//! Shared request/result/status types.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::GenerateError;
use crate::strategy::OffloadStrategy;

// Request parameter bounds. Dimensions must additionally be multiples of 8
// (latent-space constraint of the diffusion backend).
pub const MIN_DIMENSION: u32 = 256;
pub const MAX_DIMENSION: u32 = 2048;
pub const DIMENSION_MULTIPLE: u32 = 8;
pub const MIN_STEPS: u32 = 1;
pub const MAX_STEPS: u32 = 100;
pub const MIN_GUIDANCE: f32 = 0.0;
pub const MAX_GUIDANCE: f32 = 30.0;
pub const DEFAULT_DIMENSION: u32 = 1024;

/// A single image-generation request. `steps` and `guidance` left unset are
/// resolved from per-model defaults at generation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    pub steps: Option<u32>,
    pub guidance: Option<f32>,
    pub width: u32,
    pub height: u32,
    pub seed: Option<u64>,
    /// Explicit output path; absent means a timestamped file in the
    /// configured output directory.
    pub output: Option<PathBuf>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        GenerateRequest {
            prompt: prompt.into(),
            steps: None,
            guidance: None,
            width: DEFAULT_DIMENSION,
            height: DEFAULT_DIMENSION,
            seed: None,
            output: None,
        }
    }

    /// Reject malformed parameters before any device access.
    pub fn validate(&self) -> Result<(), GenerateError> {
        if self.prompt.trim().is_empty() {
            return Err(GenerateError::InvalidRequest(
                "prompt cannot be empty".to_string(),
            ));
        }

        for (name, value) in [("width", self.width), ("height", self.height)] {
            if value % DIMENSION_MULTIPLE != 0 {
                return Err(GenerateError::InvalidRequest(format!(
                    "{name} must be a multiple of {DIMENSION_MULTIPLE} (got {value})"
                )));
            }
            if !(MIN_DIMENSION..=MAX_DIMENSION).contains(&value) {
                return Err(GenerateError::InvalidRequest(format!(
                    "{name} must be between {MIN_DIMENSION} and {MAX_DIMENSION} (got {value})"
                )));
            }
        }

        if let Some(steps) = self.steps {
            if !(MIN_STEPS..=MAX_STEPS).contains(&steps) {
                return Err(GenerateError::InvalidRequest(format!(
                    "steps must be between {MIN_STEPS} and {MAX_STEPS} (got {steps})"
                )));
            }
        }

        if let Some(guidance) = self.guidance {
            if !(MIN_GUIDANCE..=MAX_GUIDANCE).contains(&guidance) {
                return Err(GenerateError::InvalidRequest(format!(
                    "guidance must be between {MIN_GUIDANCE} and {MAX_GUIDANCE} (got {guidance})"
                )));
            }
        }

        Ok(())
    }
}

/// The result of a successful generation. Immutable once produced; the same
/// fields (plus prompt and timestamp) land in the sidecar record.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutcome {
    pub image_path: PathBuf,
    pub sidecar_path: PathBuf,
    /// The seed actually used. Resolved, never left implicit.
    pub seed: u64,
    pub steps: u32,
    pub guidance: f32,
    pub width: u32,
    pub height: u32,
    pub model: String,
    pub duration_seconds: f64,
}

/// Point-in-time view of the lifecycle state, readable without touching the
/// exclusivity gate.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratorStatus {
    pub loaded: bool,
    /// Model currently resident, if any.
    pub model: Option<String>,
    /// Model the next load will construct (differs from `model` after a
    /// switch).
    pub next_model: String,
    pub strategy: Option<OffloadStrategy>,
    pub timeout_seconds: u64,
    /// None when unloaded or eviction is disarmed.
    pub seconds_until_unload: Option<f64>,
    /// Unix seconds of the last successful access, if any.
    pub last_access_unix: Option<u64>,
    pub vram_used_gb: Option<f64>,
    pub vram_total_gb: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_request_is_valid() {
        let req = GenerateRequest::new("a lighthouse at dusk");
        assert!(req.validate().is_ok());
        assert_eq!(req.width, 1024);
        assert_eq!(req.height, 1024);
    }

    #[test]
    fn empty_prompt_rejected() {
        let req = GenerateRequest::new("   ");
        assert!(matches!(
            req.validate(),
            Err(GenerateError::InvalidRequest(_))
        ));
    }

    #[test]
    fn non_multiple_of_8_width_rejected() {
        let mut req = GenerateRequest::new("test");
        req.width = 1023;
        let err = req.validate().unwrap_err();
        match err {
            GenerateError::InvalidRequest(msg) => assert!(msg.contains("multiple of 8")),
            other => panic!("expected InvalidRequest, got {other:?}"),
        }
    }

    #[test]
    fn non_multiple_of_8_height_rejected() {
        let mut req = GenerateRequest::new("test");
        req.height = 500;
        assert!(req.validate().is_err());
    }

    #[test]
    fn dimension_range_enforced() {
        let mut req = GenerateRequest::new("test");
        req.width = 128; // multiple of 8 but below the floor
        assert!(req.validate().is_err());

        req.width = 1024;
        req.height = 4096;
        assert!(req.validate().is_err());
    }

    #[test]
    fn boundary_dimensions_accepted() {
        let mut req = GenerateRequest::new("test");
        req.width = MIN_DIMENSION;
        req.height = MAX_DIMENSION;
        assert!(req.validate().is_ok());
    }

    #[test]
    fn steps_bounds_enforced() {
        let mut req = GenerateRequest::new("test");
        req.steps = Some(0);
        assert!(req.validate().is_err());
        req.steps = Some(101);
        assert!(req.validate().is_err());
        req.steps = Some(50);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn guidance_bounds_enforced() {
        let mut req = GenerateRequest::new("test");
        req.guidance = Some(-0.5);
        assert!(req.validate().is_err());
        req.guidance = Some(31.0);
        assert!(req.validate().is_err());
        req.guidance = Some(7.5);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn unset_steps_and_guidance_are_fine() {
        let req = GenerateRequest::new("defaults resolved later");
        assert!(req.steps.is_none());
        assert!(req.guidance.is_none());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn request_round_trips_through_serde() {
        let mut req = GenerateRequest::new("round trip");
        req.seed = Some(42);
        req.steps = Some(28);
        let json = serde_json::to_string(&req).unwrap();
        let back: GenerateRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.prompt, "round trip");
        assert_eq!(back.seed, Some(42));
        assert_eq!(back.steps, Some(28));
    }
}
