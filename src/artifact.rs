//! Artifact persistence: the image file plus its JSON sidecar.
//!
//! The sidecar carries everything needed to reproduce a request (not the
//! pixel-identical output, which also depends on backend and hardware
//! determinism outside this system's control).

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::GenerateError;
use crate::log_info;

pub const THUMBNAIL_MAX_DIM: u32 = 512;

/// Reproducibility record persisted next to every generated image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarRecord {
    pub prompt: String,
    pub seed: u64,
    pub steps: u32,
    pub guidance: f32,
    pub width: u32,
    pub height: u32,
    pub model: String,
    pub duration_seconds: f64,
    pub timestamp: String,
}

/// `20260807_153012_1234567.png`
pub fn timestamped_filename(seed: u64) -> String {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    format!("{stamp}_{seed}.png")
}

/// Write the image and its sidecar. Returns (image_path, sidecar_path).
pub fn save_artifact(
    png_bytes: &[u8],
    explicit_path: Option<&Path>,
    output_dir: &Path,
    record: &SidecarRecord,
) -> Result<(PathBuf, PathBuf), GenerateError> {
    let image_path = match explicit_path {
        Some(p) => p.to_path_buf(),
        None => output_dir.join(timestamped_filename(record.seed)),
    };

    if let Some(parent) = image_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&image_path, png_bytes)?;

    let sidecar_path = image_path.with_extension("json");
    let json = serde_json::to_string_pretty(record)
        .map_err(|e| GenerateError::ExecutionFailure(format!("sidecar encode failed: {e}")))?;
    fs::write(&sidecar_path, json)?;

    log_info!(
        "Saved image to {} ({} bytes) with sidecar {}",
        image_path.display(),
        png_bytes.len(),
        sidecar_path.display()
    );

    Ok((image_path, sidecar_path))
}

/// Downscale the image to at most 512px per side and return it as base64 PNG
/// for instant preview in tool responses.
pub fn thumbnail_base64(png_bytes: &[u8]) -> Result<String, GenerateError> {
    let decoded = image::load_from_memory(png_bytes)
        .map_err(|e| GenerateError::ExecutionFailure(format!("image decode failed: {e}")))?;

    let thumb = decoded.thumbnail(THUMBNAIL_MAX_DIM, THUMBNAIL_MAX_DIM);

    let mut buf = Vec::new();
    thumb
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| GenerateError::ExecutionFailure(format!("thumbnail encode failed: {e}")))?;

    Ok(general_purpose::STANDARD.encode(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("flux_gen_artifact_{tag}_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn record() -> SidecarRecord {
        SidecarRecord {
            prompt: "a lighthouse at dusk".to_string(),
            seed: 1234,
            steps: 28,
            guidance: 3.5,
            width: 1024,
            height: 768,
            model: "black-forest-labs/FLUX.1-dev".to_string(),
            duration_seconds: 41.7,
            timestamp: "2026-08-07T15:30:12".to_string(),
        }
    }

    #[test]
    fn filename_carries_seed() {
        let name = timestamped_filename(987654);
        assert!(name.ends_with("_987654.png"));
        assert!(name.len() > "_987654.png".len());
    }

    #[test]
    fn sidecar_round_trips() {
        let dir = scratch_dir("roundtrip");
        let (image_path, sidecar_path) =
            save_artifact(b"not-a-real-png", None, &dir, &record()).unwrap();

        assert!(image_path.exists());
        assert_eq!(sidecar_path.extension().unwrap(), "json");

        let loaded: SidecarRecord =
            serde_json::from_str(&fs::read_to_string(&sidecar_path).unwrap()).unwrap();
        assert_eq!(loaded.prompt, "a lighthouse at dusk");
        assert_eq!(loaded.seed, 1234);
        assert_eq!(loaded.width, 1024);
        assert_eq!(loaded.height, 768);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn explicit_output_path_is_respected() {
        let dir = scratch_dir("explicit");
        let wanted = dir.join("nested").join("final.png");
        let (image_path, sidecar_path) =
            save_artifact(b"bytes", Some(&wanted), &dir, &record()).unwrap();

        assert_eq!(image_path, wanted);
        assert_eq!(sidecar_path, wanted.with_extension("json"));
        assert!(wanted.exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn thumbnail_shrinks_large_images() {
        // 1024x512 test image, encoded through the same codec path the
        // backend uses.
        let img = image::RgbImage::from_fn(1024, 512, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        let mut png = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let b64 = thumbnail_base64(&png).unwrap();
        let bytes = general_purpose::STANDARD.decode(b64).unwrap();
        let thumb = image::load_from_memory(&bytes).unwrap();
        assert!(thumb.width() <= THUMBNAIL_MAX_DIM);
        assert!(thumb.height() <= THUMBNAIL_MAX_DIM);
        // Aspect ratio preserved (2:1)
        assert_eq!(thumb.width(), thumb.height() * 2);
    }

    #[test]
    fn thumbnail_rejects_garbage_bytes() {
        assert!(matches!(
            thumbnail_base64(b"garbage"),
            Err(GenerateError::ExecutionFailure(_))
        ));
    }
}
