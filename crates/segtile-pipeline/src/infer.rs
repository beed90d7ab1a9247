//! Inference adapter.
//!
//! Wraps a [`ScoringModel`] with the per-class gains and the reduction
//! from class scores to a single 8-bit channel, and drives the tiling
//! planner and stitcher over a whole image.

use serde::{Deserialize, Serialize};

use crate::anno::AnnoClasses;
use crate::gains::ClassGains;
use crate::model::{ClassScores, ModelError, ScoringModel};
use crate::stitch::{StitchError, stitch};
use crate::tiling::{PlannedTile, TilingError, TilingParameters, plan};
use crate::types::{ConfigError, Dimensions, GrayImage};

/// How gain-adjusted class scores become one output byte per pixel.
///
/// The same reduction is applied to every tile, so tile boundaries are
/// invisible in the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reduction {
    /// Softmax probability of `class`, scaled to `0..=255`.
    Probability { class: u16 },
    /// Index of the highest-scoring class (lowest index wins ties),
    /// saturated to 255.
    Decision,
}

impl Default for Reduction {
    fn default() -> Self {
        Self::Probability { class: 1 }
    }
}

impl Reduction {
    /// Check that the reduction refers to an existing class.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ReductionClassOutOfRange`] if a probability
    /// reduction names a class `>= class_count`.
    pub fn validate(self, class_count: usize) -> Result<(), ConfigError> {
        match self {
            Self::Probability { class } if usize::from(class) >= class_count => {
                Err(ConfigError::ReductionClassOutOfRange {
                    index: class,
                    class_count,
                })
            }
            _ => Ok(()),
        }
    }

    /// Reduce one pixel's gain-adjusted scores.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn reduce(self, adjusted: &[f32]) -> u8 {
        match self {
            Self::Decision => u8::try_from(arg_max(adjusted)).unwrap_or(u8::MAX),
            Self::Probability { class } => {
                let max = adjusted.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let total: f32 = adjusted.iter().map(|s| (s - max).exp()).sum();
                let chosen = adjusted
                    .get(usize::from(class))
                    .map_or(0.0, |s| (s - max).exp());
                let probability = if total > 0.0 { chosen / total } else { 0.0 };
                (probability * 255.0).round().clamp(0.0, 255.0) as u8
            }
        }
    }
}

/// Index of the largest value; the first one wins ties.
fn arg_max(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = i;
        }
    }
    best
}

/// Errors from running inference on one image.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error(transparent)]
    Tiling(#[from] TilingError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Stitch(#[from] StitchError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The model and the gain vector disagree on the class count.
    #[error("model scores {model} classes but {gains} gains were supplied")]
    ClassCountMismatch { model: usize, gains: usize },

    /// The model and the bundle's class definitions disagree.
    #[error("model scores {model} classes but {classes} anno classes are defined")]
    ClassDefinitionMismatch { model: usize, classes: usize },

    /// The result buffer does not match the input image.
    #[error("result buffer is {result}, input image is {input}")]
    ResultSizeMismatch {
        input: Dimensions,
        result: Dimensions,
    },
}

/// Buffers reused across tiles and images by one inference worker.
///
/// Owned exclusively by that worker; sized lazily on first use.
#[derive(Debug, Default)]
pub struct InferenceScratch {
    tile_input: GrayImage,
    tile_output: GrayImage,
    scores: ClassScores,
    adjusted: Vec<f32>,
}

impl InferenceScratch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Copy `rect` of `image` into `buffer`, reallocating only on size change.
fn copy_region(image: &GrayImage, planned: &PlannedTile, buffer: &mut GrayImage) {
    let tile = planned.tile;
    if Dimensions::of(buffer) != tile.dimensions() {
        *buffer = GrayImage::new(tile.width, tile.height);
    }
    let stride = image.width() as usize;
    let row_len = tile.width as usize;
    let source: &[u8] = image;
    let destination: &mut [u8] = buffer;
    for (row, chunk) in destination.chunks_exact_mut(row_len).enumerate() {
        let start = (tile.y as usize + row) * stride + tile.x as usize;
        chunk.copy_from_slice(&source[start..start + row_len]);
    }
}

/// Summary of one image's inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInference {
    /// Number of tiles the image was split into.
    pub tiles: usize,
}

/// A scoring model together with the gains and reduction applied to its
/// output.
pub struct InferenceAdapter<'a, M: ScoringModel + ?Sized> {
    model: &'a M,
    gains: &'a ClassGains,
    reduction: Reduction,
}

impl<'a, M: ScoringModel + ?Sized> InferenceAdapter<'a, M> {
    /// Create an adapter.
    ///
    /// # Errors
    ///
    /// Returns [`InferenceError::ClassCountMismatch`] if the gains do not
    /// cover exactly the model's classes, and [`InferenceError::Config`]
    /// if the reduction names a missing class.
    pub fn new(
        model: &'a M,
        gains: &'a ClassGains,
        reduction: Reduction,
    ) -> Result<Self, InferenceError> {
        if model.class_count() != gains.len() {
            return Err(InferenceError::ClassCountMismatch {
                model: model.class_count(),
                gains: gains.len(),
            });
        }
        reduction.validate(model.class_count())?;
        Ok(Self {
            model,
            gains,
            reduction,
        })
    }

    /// Create an adapter after checking the model against the run's class
    /// definitions.
    ///
    /// # Errors
    ///
    /// As [`Self::new`]; also fails when the model scores a different
    /// number of classes than `classes` defines.
    pub fn for_classes(
        model: &'a M,
        classes: &AnnoClasses,
        gains: &'a ClassGains,
        reduction: Reduction,
    ) -> Result<Self, InferenceError> {
        if model.class_count() != classes.len() {
            return Err(InferenceError::ClassDefinitionMismatch {
                model: model.class_count(),
                classes: classes.len(),
            });
        }
        Self::new(model, gains, reduction)
    }

    #[must_use]
    pub fn model(&self) -> &M {
        self.model
    }

    /// Run the model on one tile and reduce its scores.
    ///
    /// Returns the reduced tile, which lives in `scratch` until the next
    /// call.
    ///
    /// # Errors
    ///
    /// Returns [`InferenceError::Model`] if the forward pass fails.
    pub fn infer_tile<'s>(
        &self,
        tile: &GrayImage,
        scratch: &'s mut InferenceScratch,
    ) -> Result<&'s GrayImage, InferenceError> {
        let dimensions = Dimensions::of(tile);
        let class_count = self.model.class_count();
        scratch.scores.reset(dimensions, class_count);
        self.model.forward(tile, &mut scratch.scores)?;

        if Dimensions::of(&scratch.tile_output) != dimensions {
            scratch.tile_output = GrayImage::new(dimensions.width, dimensions.height);
        }
        scratch.adjusted.resize(class_count, 0.0);

        let gains = self.gains.as_slice();
        let output: &mut [u8] = &mut scratch.tile_output;
        for (pixel, value) in output.iter_mut().enumerate() {
            for (class, adjusted) in scratch.adjusted.iter_mut().enumerate() {
                *adjusted = scratch.scores.plane(class)[pixel] + gains[class];
            }
            *value = self.reduction.reduce(&scratch.adjusted);
        }
        Ok(&scratch.tile_output)
    }

    /// Run inference over a whole image of any size.
    ///
    /// The image is split with [`plan`] using the model's required input
    /// dimension, every tile is inferred, and each tile's core region is
    /// stitched into `result`, which must already have the image's size.
    ///
    /// # Errors
    ///
    /// Returns [`InferenceError::ResultSizeMismatch`] for a wrongly sized
    /// `result`, and tiling, model or stitch errors as they occur.
    pub fn infer_image(
        &self,
        image: &GrayImage,
        tiling: &TilingParameters,
        scratch: &mut InferenceScratch,
        result: &mut GrayImage,
    ) -> Result<ImageInference, InferenceError> {
        let input = Dimensions::of(image);
        if Dimensions::of(result) != input {
            return Err(InferenceError::ResultSizeMismatch {
                input,
                result: Dimensions::of(result),
            });
        }

        let tiles = plan(input, tiling, self.model.required_input_dimension())?;
        let mut tile_input = std::mem::take(&mut scratch.tile_input);
        let outcome = tiles.iter().try_for_each(|planned| {
            copy_region(image, planned, &mut tile_input);
            let output = self.infer_tile(&tile_input, scratch)?;
            stitch(output, planned, result)?;
            Ok::<(), InferenceError>(())
        });
        scratch.tile_input = tile_input;
        outcome?;

        Ok(ImageInference { tiles: tiles.len() })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::cast_possible_truncation)]
mod tests {
    use super::*;

    /// Two-class model whose scores are fixed constants for every pixel.
    struct ConstantModel {
        scores: [f32; 2],
        min: u32,
    }

    impl ScoringModel for ConstantModel {
        fn required_input_dimension(&self) -> u32 {
            self.min
        }

        fn class_count(&self) -> usize {
            2
        }

        fn forward(&self, tile: &GrayImage, scores: &mut ClassScores) -> Result<(), ModelError> {
            let input = Dimensions::of(tile);
            if input.width < self.min || input.height < self.min {
                return Err(ModelError::InputTooSmall {
                    input,
                    required: self.min,
                });
            }
            for (class, &score) in self.scores.iter().enumerate() {
                scores.plane_mut(class).fill(score);
            }
            Ok(())
        }
    }

    /// Scores class 1 by intensity with a border artifact: the outermost
    /// ring of every tile gets a constant score instead.
    struct BorderArtifactModel;

    impl ScoringModel for BorderArtifactModel {
        fn required_input_dimension(&self) -> u32 {
            4
        }

        fn class_count(&self) -> usize {
            2
        }

        fn forward(&self, tile: &GrayImage, scores: &mut ClassScores) -> Result<(), ModelError> {
            let (w, h) = tile.dimensions();
            for (x, y, p) in tile.enumerate_pixels() {
                let border = x == 0 || y == 0 || x == w - 1 || y == h - 1;
                let value = if border { 0.0 } else { f32::from(p.0[0]) };
                scores.set(0, x, y, 0.0);
                scores.set(1, x, y, value);
            }
            Ok(())
        }
    }

    #[test]
    fn decision_follows_gain_adjusted_arg_max() {
        let cases = [
            ([1.0, 2.0], [0.0, 0.0], 1),
            ([1.0, 2.0], [1.5, 0.0], 0),
            ([3.0, -1.0], [0.0, 4.5], 1),
            ([0.0, 0.0], [0.0, 0.0], 0),
        ];
        for (scores, gains, expected) in cases {
            let model = ConstantModel { scores, min: 1 };
            let gains = ClassGains::parse([format!("0:{}", gains[0]), format!("1:{}", gains[1])], 2)
                .unwrap();
            let adapter = InferenceAdapter::new(&model, &gains, Reduction::Decision).unwrap();
            let tile = GrayImage::new(1, 1);
            let mut scratch = InferenceScratch::new();
            let out = adapter.infer_tile(&tile, &mut scratch).unwrap();
            assert_eq!(
                out.get_pixel(0, 0).0[0],
                expected,
                "scores {scores:?} gains {gains:?}"
            );
        }
    }

    #[test]
    fn probability_is_softmax_of_adjusted_scores() {
        let model = ConstantModel {
            scores: [0.0, 0.0],
            min: 1,
        };
        let even = ClassGains::zero(2);
        let adapter = InferenceAdapter::new(&model, &even, Reduction::default()).unwrap();
        let mut scratch = InferenceScratch::new();
        let out = adapter.infer_tile(&GrayImage::new(2, 2), &mut scratch).unwrap();
        assert_eq!(out.get_pixel(1, 1).0[0], 128);

        let biased = ClassGains::parse(["1:10"], 2).unwrap();
        let adapter = InferenceAdapter::new(&model, &biased, Reduction::default()).unwrap();
        let out = adapter.infer_tile(&GrayImage::new(2, 2), &mut scratch).unwrap();
        assert_eq!(out.get_pixel(0, 0).0[0], 255);
    }

    #[test]
    fn reduce_handles_extreme_scores() {
        let reduction = Reduction::Probability { class: 0 };
        assert_eq!(reduction.reduce(&[1000.0, -1000.0]), 255);
        assert_eq!(reduction.reduce(&[-1000.0, 1000.0]), 0);
        assert_eq!(Reduction::Decision.reduce(&[0.0; 300]), 0);
    }

    #[test]
    fn decision_saturates_above_255_classes() {
        let mut scores = vec![0.0_f32; 300];
        scores[299] = 1.0;
        assert_eq!(Reduction::Decision.reduce(&scores), 255);
    }

    #[test]
    fn mismatched_gains_are_rejected() {
        let model = ConstantModel {
            scores: [0.0, 0.0],
            min: 1,
        };
        let gains = ClassGains::zero(3);
        assert!(matches!(
            InferenceAdapter::new(&model, &gains, Reduction::Decision),
            Err(InferenceError::ClassCountMismatch { .. })
        ));
    }

    #[test]
    fn reduction_class_is_validated() {
        assert!(Reduction::Probability { class: 2 }.validate(2).is_err());
        assert!(Reduction::Probability { class: 1 }.validate(2).is_ok());
        assert!(Reduction::Decision.validate(2).is_ok());
    }

    #[test]
    fn tiled_result_matches_single_pass_away_from_image_border() {
        let image = GrayImage::from_fn(90, 70, |x, y| image::Luma([((x * 3 + y * 5) % 251) as u8]));
        let model = BorderArtifactModel;
        let gains = ClassGains::zero(2);
        let adapter = InferenceAdapter::new(&model, &gains, Reduction::Decision).unwrap();
        let mut scratch = InferenceScratch::new();

        let mut whole = GrayImage::new(90, 70);
        adapter
            .infer_image(&image, &TilingParameters::new(90, 70, 0), &mut scratch, &mut whole)
            .unwrap();

        let mut tiled = GrayImage::new(90, 70);
        let summary = adapter
            .infer_image(&image, &TilingParameters::new(24, 24, 4), &mut scratch, &mut tiled)
            .unwrap();
        assert!(summary.tiles > 1);

        // The margin hides every tile's artifact ring.
        assert_eq!(tiled, whole);
    }

    #[test]
    fn artifacts_appear_without_margin() {
        let image = GrayImage::from_pixel(40, 40, image::Luma([200]));
        let model = BorderArtifactModel;
        let gains = ClassGains::zero(2);
        let adapter = InferenceAdapter::new(&model, &gains, Reduction::Decision).unwrap();
        let mut scratch = InferenceScratch::new();

        let mut whole = GrayImage::new(40, 40);
        adapter
            .infer_image(&image, &TilingParameters::new(40, 40, 0), &mut scratch, &mut whole)
            .unwrap();
        let mut tiled = GrayImage::new(40, 40);
        adapter
            .infer_image(&image, &TilingParameters::new(20, 20, 0), &mut scratch, &mut tiled)
            .unwrap();
        assert_ne!(tiled, whole);
    }

    #[test]
    fn model_failure_is_surfaced() {
        let model = ConstantModel {
            scores: [0.0, 0.0],
            min: 16,
        };
        let gains = ClassGains::zero(2);
        let adapter = InferenceAdapter::new(&model, &gains, Reduction::Decision).unwrap();
        let mut scratch = InferenceScratch::new();
        let err = adapter
            .infer_tile(&GrayImage::new(8, 8), &mut scratch)
            .unwrap_err();
        assert!(matches!(err, InferenceError::Model(ModelError::InputTooSmall { .. })));

        let mut result = GrayImage::new(8, 8);
        let err = adapter
            .infer_image(
                &GrayImage::new(8, 8),
                &TilingParameters::new(64, 64, 16),
                &mut scratch,
                &mut result,
            )
            .unwrap_err();
        assert!(matches!(err, InferenceError::Tiling(TilingError::ImageTooSmall { .. })));
    }

    #[test]
    fn wrong_result_size_is_rejected() {
        let model = ConstantModel {
            scores: [0.0, 0.0],
            min: 1,
        };
        let gains = ClassGains::zero(2);
        let adapter = InferenceAdapter::new(&model, &gains, Reduction::Decision).unwrap();
        let err = adapter.infer_image(
            &GrayImage::new(8, 8),
            &TilingParameters::default(),
            &mut InferenceScratch::new(),
            &mut GrayImage::new(8, 9),
        );
        assert!(matches!(err, Err(InferenceError::ResultSizeMismatch { .. })));
    }
}
