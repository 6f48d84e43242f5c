use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgba, Rgba32FImage, RgbaImage};

use crate::protocol::FramebufferFormat;

/// Encodes a final-quality frame to disk: OpenEXR for float buffers, PNG for
/// 8 bit ones. Returns the path and its size in bytes.
pub fn write_frame_image(
    dir: &Path,
    sample: u32,
    width: u32,
    height: u32,
    format: FramebufferFormat,
    pixels: Vec<u8>,
) -> Result<(PathBuf, u64)> {
    let expected = width as usize * height as usize * format.bytes_per_pixel();
    if pixels.len() != expected {
        bail!(
            "framebuffer holds {} bytes, expected {expected} for {width}x{height} {format:?}",
            pixels.len()
        );
    }

    let (image, ext, image_format) = match format {
        FramebufferFormat::Srgba => {
            let img: RgbaImage = ImageBuffer::<Rgba<u8>, _>::from_raw(width, height, pixels)
                .context("pixel buffer does not fit the image size")?;
            (DynamicImage::ImageRgba8(img), "png", ImageFormat::Png)
        }
        FramebufferFormat::Rgba32f => {
            let floats: Vec<f32> = pixels
                .chunks_exact(4)
                .map(bytemuck::pod_read_unaligned::<f32>)
                .collect();
            let img: Rgba32FImage = ImageBuffer::<Rgba<f32>, _>::from_raw(width, height, floats)
                .context("pixel buffer does not fit the image size")?;
            (DynamicImage::ImageRgba32F(img), "exr", ImageFormat::OpenExr)
        }
    };

    // The engine stores rows bottom-up.
    let image = image.flipv();

    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create framebuffer dir {}", dir.display()))?;
    let path = dir.join(format!("frame-{}-{sample:04}.{ext}", std::process::id()));
    image
        .save_with_format(&path, image_format)
        .with_context(|| format!("failed to write {}", path.display()))?;
    let size = std::fs::metadata(&path)?.len();
    Ok((path, size))
}

/// Resident set size of this process in MiB, 0 where unavailable.
pub fn memory_usage_mib() -> f32 {
    let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
        return 0.0;
    };
    let resident_pages: u64 = statm
        .split_whitespace()
        .nth(1)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    (resident_pages * 4096) as f32 / (1024.0 * 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_png_for_srgba() {
        let dir = tempfile::tempdir().unwrap();
        let pixels = vec![255u8; 2 * 3 * 4];
        let (path, size) =
            write_frame_image(dir.path(), 1, 2, 3, FramebufferFormat::Srgba, pixels).unwrap();
        assert_eq!(path.extension().unwrap(), "png");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size);
        let decoded = image::open(&path).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (2, 3));
    }

    #[test]
    fn writes_exr_for_float_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let floats = vec![0.5f32; 4 * 4 * 4];
        let pixels = bytemuck::cast_slice::<f32, u8>(&floats).to_vec();
        let (path, size) =
            write_frame_image(dir.path(), 7, 4, 4, FramebufferFormat::Rgba32f, pixels).unwrap();
        assert!(path.to_string_lossy().ends_with("-0007.exr"));
        assert!(size > 0);
    }

    #[test]
    fn rejects_mismatched_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_frame_image(dir.path(), 1, 2, 2, FramebufferFormat::Srgba, vec![0; 3]).unwrap_err();
        assert!(err.to_string().contains("expected 16"));
    }
}
