//! Persisting result images.

use std::path::PathBuf;

use image::ImageFormat;
use segtile_pipeline::scale::{self, ResizeFilter};
use segtile_pipeline::{Dimensions, GrayImage};

/// A finished inference result on its way to disk.
#[derive(Debug, Clone)]
pub struct ResultImage {
    pub output_path: PathBuf,
    /// Size of the source image; the result is resized to it on write.
    pub original: Dimensions,
    /// Result at inference resolution.
    pub probability_image: GrayImage,
}

/// A failed write, with the path it was meant for.
#[derive(Debug, thiserror::Error)]
#[error("failed to write {}: {source}", path.display())]
pub struct WriteError {
    pub path: PathBuf,
    #[source]
    pub source: image::ImageError,
}

/// Resize a result to its original size and write it as an 8-bit PNG.
///
/// Returns the written path.
///
/// # Errors
///
/// Returns [`WriteError`] if encoding or writing fails.
pub fn write_result(result: ResultImage, filter: ResizeFilter) -> Result<PathBuf, WriteError> {
    let ResultImage {
        output_path,
        original,
        probability_image,
    } = result;
    let restored = scale::restore(probability_image, original, filter);
    match restored.save_with_format(&output_path, ImageFormat::Png) {
        Ok(()) => Ok(output_path),
        Err(source) => Err(WriteError {
            path: output_path,
            source,
        }),
    }
}
