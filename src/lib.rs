//! Local FLUX image generation with lazy loading and idle auto-unload.
//!
//! The library owns the pipeline lifecycle; the `flux` CLI and the
//! `flux_mcp_server` binaries are thin front-ends over it. The diffusion
//! pipeline itself lives in a sidecar render worker reached through the
//! [`pipeline::DiffusionBackend`] trait.

pub mod artifact;
pub mod config;
pub mod error;
pub mod generator;
pub mod ipc;
pub mod logger;
pub mod mcp;
pub mod models;
pub mod pipeline;
pub mod strategy;
pub mod vram;
pub mod worker;

// Deterministic in-process backend for tests and GPU-less E2E runs
#[cfg(any(test, feature = "mock"))]
pub mod pipeline_mock;

use std::sync::Arc;

use config::Config;
use pipeline::DiffusionBackend;

/// The backend the binaries wire into the generator.
#[cfg(not(feature = "mock"))]
pub fn default_backend(config: &Config) -> Arc<dyn DiffusionBackend> {
    Arc::new(worker::WorkerBackend::new(
        config.worker_cmd.clone(),
        config.model_cache.clone(),
    ))
}

/// Mock implementation for E2E runs without a GPU.
#[cfg(feature = "mock")]
pub fn default_backend(_config: &Config) -> Arc<dyn DiffusionBackend> {
    Arc::new(pipeline_mock::MockPipeline::new())
}
