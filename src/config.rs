//! Runtime configuration, read once from the environment at startup.

use std::env;
use std::path::PathBuf;

use crate::strategy::TierThresholds;

pub const DEFAULT_UNLOAD_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_STEPS: u32 = 50;
pub const DEFAULT_GUIDANCE: f32 = 7.5;
pub const DEFAULT_MODEL_ID: &str = "black-forest-labs/FLUX.2-dev";
pub const DEFAULT_WORKER_CMD: &str = "flux-render-worker";

/// Model presets for easy switching. Either a preset name or a full model id
/// is accepted wherever a model is selected.
pub const MODEL_PRESETS: &[(&str, &str)] = &[
    ("flux1-dev", "black-forest-labs/FLUX.1-dev"),
    ("flux2-dev", "black-forest-labs/FLUX.2-dev"),
];

#[derive(Debug, Clone)]
pub struct Config {
    /// Seconds of inactivity before the pipeline is released. 0 disables
    /// idle eviction.
    pub unload_timeout_secs: u64,
    /// Directory for generated images and their sidecar records.
    pub output_dir: PathBuf,
    /// Optional weight-cache directory, forwarded to the render worker.
    pub model_cache: Option<PathBuf>,
    /// Model loaded on the first generation request.
    pub model_id: String,
    pub default_steps: u32,
    pub default_guidance: f32,
    /// Command used to spawn the sidecar render worker.
    pub worker_cmd: String,
    pub thresholds: TierThresholds,
}

impl Config {
    pub fn from_env() -> Self {
        let unload_timeout_secs = parse_env("FLUX_UNLOAD_TIMEOUT", DEFAULT_UNLOAD_TIMEOUT_SECS);

        let output_dir = env::var("FLUX_OUTPUT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_output_dir());

        let model_cache = env::var("FLUX_MODEL_CACHE").ok().map(PathBuf::from);

        let model_id = env::var("FLUX_MODEL_ID")
            .map(|raw| resolve_model_preset(&raw))
            .unwrap_or_else(|_| DEFAULT_MODEL_ID.to_string());

        Config {
            unload_timeout_secs,
            output_dir,
            model_cache,
            model_id,
            default_steps: parse_env("FLUX_DEFAULT_STEPS", DEFAULT_STEPS),
            default_guidance: parse_env("FLUX_DEFAULT_GUIDANCE", DEFAULT_GUIDANCE),
            worker_cmd: env::var("FLUX_WORKER_CMD")
                .unwrap_or_else(|_| DEFAULT_WORKER_CMD.to_string()),
            thresholds: TierThresholds::from_env(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            unload_timeout_secs: DEFAULT_UNLOAD_TIMEOUT_SECS,
            output_dir: default_output_dir(),
            model_cache: None,
            model_id: DEFAULT_MODEL_ID.to_string(),
            default_steps: DEFAULT_STEPS,
            default_guidance: DEFAULT_GUIDANCE,
            worker_cmd: DEFAULT_WORKER_CMD.to_string(),
            thresholds: TierThresholds::default(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("flux_output")
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Resolve a preset name to a full model id. Unknown names pass through
/// unchanged so callers can use arbitrary model ids directly.
pub fn resolve_model_preset(name: &str) -> String {
    MODEL_PRESETS
        .iter()
        .find(|(preset, _)| *preset == name)
        .map(|(_, id)| (*id).to_string())
        .unwrap_or_else(|| name.to_string())
}

/// Per-model smart defaults: (steps, guidance). FLUX.1 converges in far
/// fewer steps than FLUX.2 and wants a lower guidance scale.
pub fn model_defaults(model_id: &str) -> Option<(u32, f32)> {
    match model_id {
        "black-forest-labs/FLUX.1-dev" => Some((28, 3.5)),
        "black-forest-labs/FLUX.2-dev" => Some((50, 7.5)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_resolution() {
        assert_eq!(
            resolve_model_preset("flux1-dev"),
            "black-forest-labs/FLUX.1-dev"
        );
        assert_eq!(
            resolve_model_preset("flux2-dev"),
            "black-forest-labs/FLUX.2-dev"
        );
        // Full ids and unknown names pass through
        assert_eq!(
            resolve_model_preset("black-forest-labs/FLUX.1-dev"),
            "black-forest-labs/FLUX.1-dev"
        );
        assert_eq!(resolve_model_preset("my-org/custom"), "my-org/custom");
    }

    #[test]
    fn model_defaults_cover_known_presets() {
        assert_eq!(model_defaults("black-forest-labs/FLUX.1-dev"), Some((28, 3.5)));
        assert_eq!(model_defaults("black-forest-labs/FLUX.2-dev"), Some((50, 7.5)));
        assert_eq!(model_defaults("my-org/custom"), None);
    }

    #[test]
    fn default_config_is_sane() {
        let config = Config::default();
        assert_eq!(config.unload_timeout_secs, 300);
        assert_eq!(config.model_id, DEFAULT_MODEL_ID);
        assert!(config.default_steps >= 1 && config.default_steps <= 100);
        assert!(config.output_dir.ends_with("flux_output"));
    }
}
