//! The scoring-model seam.
//!
//! A [`ScoringModel`] is a black-box forward pass over a fixed set of
//! pre-loaded weights: a single-channel tile goes in, per-pixel class
//! scores come out. Everything above it (gains, reduction, tiling and
//! stitching) lives in [`crate::infer`].

use crate::types::{Dimensions, GrayImage};

/// Per-pixel class scores for one tile.
///
/// Stored planar: all pixels of class 0, then class 1, and so on, each
/// plane row-major. The buffer is reused across tiles; [`Self::reset`]
/// only reallocates when it must grow.
#[derive(Debug, Clone, Default)]
pub struct ClassScores {
    dimensions: Dimensions,
    class_count: usize,
    data: Vec<f32>,
}

impl ClassScores {
    /// Resize to `dimensions` x `class_count` and zero every score.
    pub fn reset(&mut self, dimensions: Dimensions, class_count: usize) {
        let len = plane_len(dimensions) * class_count;
        self.dimensions = dimensions;
        self.class_count = class_count;
        self.data.clear();
        self.data.resize(len, 0.0);
    }

    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    #[must_use]
    pub const fn class_count(&self) -> usize {
        self.class_count
    }

    /// Scores of one class, row-major.
    #[must_use]
    pub fn plane(&self, class: usize) -> &[f32] {
        let len = plane_len(self.dimensions);
        &self.data[class * len..(class + 1) * len]
    }

    /// Mutable scores of one class, row-major.
    pub fn plane_mut(&mut self, class: usize) -> &mut [f32] {
        let len = plane_len(self.dimensions);
        &mut self.data[class * len..(class + 1) * len]
    }

    /// Score of `class` at pixel `(x, y)`.
    #[must_use]
    pub fn get(&self, class: usize, x: u32, y: u32) -> f32 {
        self.plane(class)[pixel_offset(self.dimensions, x, y)]
    }

    /// Set the score of `class` at pixel `(x, y)`.
    pub fn set(&mut self, class: usize, x: u32, y: u32, score: f32) {
        let offset = pixel_offset(self.dimensions, x, y);
        self.plane_mut(class)[offset] = score;
    }

    /// Capacity of the underlying buffer, in scores.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }
}

const fn plane_len(dimensions: Dimensions) -> usize {
    dimensions.width as usize * dimensions.height as usize
}

const fn pixel_offset(dimensions: Dimensions, x: u32, y: u32) -> usize {
    y as usize * dimensions.width as usize + x as usize
}

/// Failures reported by a model's forward pass.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    /// The tile is smaller than the model accepts.
    #[error("input {input} is smaller than the required minimum dimension {required}")]
    InputTooSmall { input: Dimensions, required: u32 },

    /// The serialized weights could not be loaded.
    #[error("invalid model weights: {0}")]
    InvalidWeights(String),

    /// Any other model-specific failure.
    #[error("model forward pass failed: {0}")]
    Forward(String),
}

/// A per-pixel classifier with a fixed minimum input size.
///
/// Implementations must be shareable across threads; the pipeline calls
/// [`Self::forward`] from a single inference thread per run but the model
/// is constructed up front and handed out by reference.
pub trait ScoringModel: Send + Sync {
    /// The smallest tile edge, in pixels, the model can process.
    fn required_input_dimension(&self) -> u32;

    /// Number of classes the model scores.
    fn class_count(&self) -> usize;

    /// Whether the forward pass runs on an accelerator.
    ///
    /// Accelerated models default to smaller tiles.
    fn is_accelerated(&self) -> bool {
        false
    }

    /// Score every pixel of `tile`.
    ///
    /// `scores` has already been reset to the tile's dimensions and
    /// [`Self::class_count`] classes.
    ///
    /// # Errors
    ///
    /// Returns a [`ModelError`] if the tile is unusable or the forward
    /// pass fails.
    fn forward(&self, tile: &GrayImage, scores: &mut ClassScores) -> Result<(), ModelError>;
}
