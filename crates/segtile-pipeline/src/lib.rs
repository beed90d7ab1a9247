//! segtile-pipeline: tiled semantic-segmentation inference (sans-IO).
//!
//! Runs a fixed-input-size scoring model over images of any size:
//! plan tiles -> forward pass per tile -> gain adjustment -> reduction to
//! one channel -> stitch each tile's core region into the result.
//!
//! This crate has **no I/O dependencies** -- it operates on in-memory
//! images and returns structured data. Disk access and the threaded
//! reader/inference/writer pipeline live in `segtile-io`.

pub mod anno;
pub mod gains;
pub mod infer;
pub mod kernel;
pub mod label;
pub mod model;
pub mod scale;
pub mod stitch;
pub mod tiling;
pub mod types;

pub use anno::AnnoClasses;
pub use gains::{ClassGains, GainSpec};
pub use infer::{ImageInference, InferenceAdapter, InferenceError, InferenceScratch, Reduction};
pub use kernel::{KernelClass, KernelModel};
pub use label::{LabelError, LabelImage};
pub use model::{ClassScores, ModelError, ScoringModel};
pub use scale::ResizeFilter;
pub use stitch::StitchError;
pub use tiling::{PlannedTile, TilingError, TilingParameters};
pub use types::{AnnoClass, ConfigError, Dimensions, GrayImage, IGNORE_LABEL, Rect, Rgba, RgbaImage};

/// Segment one image in a single call.
///
/// Allocates a result buffer of the image's size and runs
/// [`InferenceAdapter::infer_image`] into it. Long-running callers that
/// process many images should keep their own [`InferenceScratch`] and
/// call the adapter directly.
///
/// # Errors
///
/// Returns the adapter's [`InferenceError`]s.
pub fn segment<M: ScoringModel + ?Sized>(
    image: &GrayImage,
    model: &M,
    gains: &ClassGains,
    reduction: Reduction,
    tiling: &TilingParameters,
) -> Result<GrayImage, InferenceError> {
    let adapter = InferenceAdapter::new(model, gains, reduction)?;
    let mut result = GrayImage::new(image.width(), image.height());
    adapter.infer_image(image, tiling, &mut InferenceScratch::new(), &mut result)?;
    Ok(result)
}
