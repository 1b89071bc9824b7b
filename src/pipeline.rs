//! The seam between the lifecycle manager and the diffusion backend.
//!
//! The backend performs no locking of its own; exclusivity is entirely the
//! caller's responsibility.

use crate::error::GenerateError;
use crate::strategy::OffloadStrategy;

/// Handle to a constructed pipeline. Owned by the lifecycle manager and
/// surrendered back to the backend on release.
#[derive(Debug, Clone)]
pub struct LoadedPipeline {
    pub model_id: String,
    pub strategy: OffloadStrategy,
}

/// Fully-resolved parameters for one render. All defaults have been applied
/// by the time the backend sees this.
#[derive(Debug, Clone)]
pub struct RenderParams {
    pub prompt: String,
    pub steps: u32,
    pub guidance: f32,
    pub width: u32,
    pub height: u32,
    pub seed: u64,
}

/// An encoded image produced by the backend.
#[derive(Debug, Clone)]
pub struct RenderedImage {
    pub png_bytes: Vec<u8>,
}

/// The opaque render capability.
pub trait DiffusionBackend: Send + Sync {
    /// Construct the pipeline for a model under the given offload strategy.
    ///
    /// Fails with `ResourceExhausted` when device memory is insufficient even
    /// under the selected strategy, and with `ResourceUnavailable` when the
    /// model weights cannot be fetched or verified.
    fn construct(
        &self,
        model_id: &str,
        strategy: &OffloadStrategy,
    ) -> Result<LoadedPipeline, GenerateError>;

    /// Render one image. May fail with `ResourceExhausted` mid-render or
    /// `ExecutionFailure` for any other backend error.
    fn render(
        &self,
        pipeline: &LoadedPipeline,
        params: &RenderParams,
    ) -> Result<RenderedImage, GenerateError>;

    /// Free all device and host memory held by the pipeline and clear the
    /// device cache. Idempotent: releasing an already-released pipeline is a
    /// no-op.
    fn release(&self, pipeline: LoadedPipeline);
}
