//! Reading one unit of work from disk.
//!
//! Decode problems are captured inside the returned [`DecodedSample`]
//! instead of being raised, so one bad file never takes down a reader
//! thread. The consumer decides what an error means for the run.

use segtile_pipeline::label::{check_label_size, validate_label_image};
use segtile_pipeline::scale::{self, ResizeFilter};
use segtile_pipeline::{AnnoClasses, Dimensions, GrayImage, LabelError};
use serde::{Deserialize, Serialize};

use crate::discover::ImagePaths;

/// Why a sample could not be used.
#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    /// The image file could not be opened or decoded.
    #[error("failed to decode image: {0}")]
    Image(#[source] image::ImageError),

    /// The label mask could not be opened or decoded.
    #[error("failed to decode label mask: {0}")]
    LabelImage(#[source] image::ImageError),

    /// The mask has the wrong size or an unknown color.
    #[error(transparent)]
    Label(#[from] LabelError),

    /// Labels were required but the image has none.
    #[error("no ground truth available")]
    MissingLabel,
}

/// A decoded image ready for inference.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    /// Single-channel input, already downscaled if the bundle asks for it.
    pub image: GrayImage,
    /// Size of the image on disk, before downscaling.
    pub original: Dimensions,
}

/// The result of reading one [`ImagePaths`].
#[derive(Debug)]
pub struct DecodedSample {
    pub paths: ImagePaths,
    pub decoded: Result<DecodedImage, SampleError>,
}

/// How readers decode samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadOptions {
    /// Inputs are divided by this factor after decode.
    pub downscaling_factor: f64,
    /// Treat a missing label mask as a sample error.
    pub require_labels: bool,
    pub filter: ResizeFilter,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            downscaling_factor: 1.0,
            require_labels: false,
            filter: ResizeFilter::default(),
        }
    }
}

/// Decode `paths`, validating its label mask if it has one.
#[must_use]
pub fn read_sample(paths: ImagePaths, classes: &AnnoClasses, options: &ReadOptions) -> DecodedSample {
    let decoded = decode(&paths, classes, options);
    DecodedSample { paths, decoded }
}

fn decode(
    paths: &ImagePaths,
    classes: &AnnoClasses,
    options: &ReadOptions,
) -> Result<DecodedImage, SampleError> {
    let image = image::open(&paths.image).map_err(SampleError::Image)?.to_luma8();
    let original = Dimensions::of(&image);

    match &paths.label {
        Some(label_path) => {
            let label = image::open(label_path)
                .map_err(SampleError::LabelImage)?
                .to_rgba8();
            check_label_size(original, &label)?;
            validate_label_image(&label, classes)?;
        }
        None if options.require_labels => return Err(SampleError::MissingLabel),
        None => {}
    }

    let (image, _) = scale::downscale(image, options.downscaling_factor, options.filter);
    Ok(DecodedImage { image, original })
}
