//! Deterministic in-process render backend.
//!
//! Stands in for the sidecar worker in tests and GPU-less end-to-end runs
//! (`--features mock`). Identical (prompt, seed, dimensions) always produce
//! identical PNG bytes.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::Cursor;
use std::time::Duration;

use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

use crate::error::GenerateError;
use crate::pipeline::{DiffusionBackend, LoadedPipeline, RenderParams, RenderedImage};
use crate::strategy::OffloadStrategy;

pub struct MockPipeline {
    /// Simulated render time, so concurrency behavior is observable.
    render_delay: Duration,
}

impl MockPipeline {
    pub fn new() -> Self {
        MockPipeline {
            render_delay: Duration::ZERO,
        }
    }

    pub fn with_render_delay(render_delay: Duration) -> Self {
        MockPipeline { render_delay }
    }
}

impl Default for MockPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl DiffusionBackend for MockPipeline {
    fn construct(
        &self,
        model_id: &str,
        strategy: &OffloadStrategy,
    ) -> Result<LoadedPipeline, GenerateError> {
        Ok(LoadedPipeline {
            model_id: model_id.to_string(),
            strategy: strategy.clone(),
        })
    }

    fn render(
        &self,
        _pipeline: &LoadedPipeline,
        params: &RenderParams,
    ) -> Result<RenderedImage, GenerateError> {
        if !self.render_delay.is_zero() {
            std::thread::sleep(self.render_delay);
        }

        let mut hasher = DefaultHasher::new();
        params.prompt.hash(&mut hasher);
        let prompt_hash = hasher.finish();

        let seed = params.seed ^ prompt_hash;
        let img = RgbImage::from_fn(params.width, params.height, |x, y| {
            Rgb(mix_pixel(seed, x, y))
        });

        let mut png_bytes = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)
            .map_err(|e| GenerateError::ExecutionFailure(format!("png encode failed: {e}")))?;

        Ok(RenderedImage { png_bytes })
    }

    fn release(&self, _pipeline: LoadedPipeline) {}
}

// 64-bit finalizer (murmur3 style) keyed by seed and pixel position.
fn mix_pixel(seed: u64, x: u32, y: u32) -> [u8; 3] {
    let mut h = seed ^ (u64::from(x) << 32) ^ u64::from(y);
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    [(h & 0xff) as u8, ((h >> 8) & 0xff) as u8, ((h >> 16) & 0xff) as u8]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::cpu_fallback;

    fn params(prompt: &str, seed: u64) -> RenderParams {
        RenderParams {
            prompt: prompt.to_string(),
            steps: 4,
            guidance: 3.5,
            width: 64,
            height: 64,
            seed,
        }
    }

    #[test]
    fn identical_requests_produce_identical_bytes() {
        let backend = MockPipeline::new();
        let pipeline = backend.construct("m", &cpu_fallback()).unwrap();
        let a = backend.render(&pipeline, &params("a cat", 42)).unwrap();
        let b = backend.render(&pipeline, &params("a cat", 42)).unwrap();
        assert_eq!(a.png_bytes, b.png_bytes);
    }

    #[test]
    fn seed_changes_the_image() {
        let backend = MockPipeline::new();
        let pipeline = backend.construct("m", &cpu_fallback()).unwrap();
        let a = backend.render(&pipeline, &params("a cat", 42)).unwrap();
        let b = backend.render(&pipeline, &params("a cat", 43)).unwrap();
        assert_ne!(a.png_bytes, b.png_bytes);
    }

    #[test]
    fn prompt_changes_the_image() {
        let backend = MockPipeline::new();
        let pipeline = backend.construct("m", &cpu_fallback()).unwrap();
        let a = backend.render(&pipeline, &params("a cat", 42)).unwrap();
        let b = backend.render(&pipeline, &params("a dog", 42)).unwrap();
        assert_ne!(a.png_bytes, b.png_bytes);
    }

    #[test]
    fn output_decodes_to_requested_dimensions() {
        let backend = MockPipeline::new();
        let pipeline = backend.construct("m", &cpu_fallback()).unwrap();
        let mut p = params("dims", 7);
        p.width = 128;
        p.height = 96;
        let rendered = backend.render(&pipeline, &p).unwrap();
        let decoded = image::load_from_memory(&rendered.png_bytes).unwrap();
        assert_eq!(decoded.width(), 128);
        assert_eq!(decoded.height(), 96);
    }
}
