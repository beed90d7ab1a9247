//! Built-in correlation-kernel scoring model.
//!
//! Each class is scored by a `k x k` correlation over the tile's
//! normalized intensity (`pixel / 255`) plus a bias. Samples outside the
//! tile are clamped to the nearest edge pixel, so output near tile
//! borders differs from what the same pixel would get deep inside a
//! larger image. That is exactly the artifact the tiling margin hides.
//!
//! Weights are a JSON document:
//!
//! ```json
//! { "kernel_size": 3, "classes": [ { "weights": [0, 0, 0, 0, 1, 0, 0, 0, 0], "bias": 0.0 } ] }
//! ```

use serde::{Deserialize, Serialize};

use crate::model::{ClassScores, ModelError, ScoringModel};
use crate::types::{Dimensions, GrayImage};

/// Weights of one class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelClass {
    /// Row-major `kernel_size * kernel_size` correlation weights.
    pub weights: Vec<f32>,
    pub bias: f32,
}

/// A per-class correlation model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelModel {
    kernel_size: u32,
    classes: Vec<KernelClass>,
}

impl KernelModel {
    /// Build a model, validating the weight shapes.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidWeights`] if `kernel_size` is even or
    /// zero, fewer than two classes are given, or a class has the wrong
    /// number of weights.
    pub fn new(kernel_size: u32, classes: Vec<KernelClass>) -> Result<Self, ModelError> {
        if kernel_size == 0 || kernel_size % 2 == 0 {
            return Err(ModelError::InvalidWeights(format!(
                "kernel size must be odd and positive, got {kernel_size}"
            )));
        }
        if classes.len() < 2 {
            return Err(ModelError::InvalidWeights(format!(
                "at least 2 classes are required, got {}",
                classes.len()
            )));
        }
        let expected = usize::try_from(kernel_size)
            .ok()
            .and_then(|k| k.checked_mul(k))
            .ok_or_else(|| {
                ModelError::InvalidWeights(format!("kernel size {kernel_size} is too large"))
            })?;
        if let Some((i, class)) = classes
            .iter()
            .enumerate()
            .find(|(_, c)| c.weights.len() != expected)
        {
            return Err(ModelError::InvalidWeights(format!(
                "class {i} has {} weights, expected {expected}",
                class.weights.len()
            )));
        }
        Ok(Self {
            kernel_size,
            classes,
        })
    }

    /// Deserialize from the weights section of a model bundle.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidWeights`] for malformed JSON or
    /// inconsistent shapes.
    pub fn from_json(bytes: &[u8]) -> Result<Self, ModelError> {
        let model: Self =
            serde_json::from_slice(bytes).map_err(|e| ModelError::InvalidWeights(e.to_string()))?;
        Self::new(model.kernel_size, model.classes)
    }

    /// Serialize to the bundle weights format.
    ///
    /// # Errors
    ///
    /// Propagates `serde_json` failures.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    #[must_use]
    pub const fn kernel_size(&self) -> u32 {
        self.kernel_size
    }
}

impl ScoringModel for KernelModel {
    fn required_input_dimension(&self) -> u32 {
        self.kernel_size
    }

    fn class_count(&self) -> usize {
        self.classes.len()
    }

    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    fn forward(&self, tile: &GrayImage, scores: &mut ClassScores) -> Result<(), ModelError> {
        let input = Dimensions::of(tile);
        if input.width < self.kernel_size || input.height < self.kernel_size {
            return Err(ModelError::InputTooSmall {
                input,
                required: self.kernel_size,
            });
        }
        if scores.dimensions() != input || scores.class_count() != self.classes.len() {
            scores.reset(input, self.classes.len());
        }

        let radius = (self.kernel_size / 2) as i64;
        let max_x = i64::from(input.width) - 1;
        let max_y = i64::from(input.height) - 1;
        let k = self.kernel_size as usize;
        let pixels = tile.as_raw();
        let width = input.width as usize;

        for (class_index, class) in self.classes.iter().enumerate() {
            let plane = scores.plane_mut(class_index);
            for y in 0..i64::from(input.height) {
                for x in 0..i64::from(input.width) {
                    let mut sum = class.bias;
                    for ky in 0..k {
                        let sy = (y + ky as i64 - radius).clamp(0, max_y) as usize;
                        let row = &pixels[sy * width..(sy + 1) * width];
                        let weights = &class.weights[ky * k..(ky + 1) * k];
                        for (kx, weight) in weights.iter().enumerate() {
                            let sx = (x + kx as i64 - radius).clamp(0, max_x) as usize;
                            sum += weight * f32::from(row[sx]) / 255.0;
                        }
                    }
                    plane[y as usize * width + x as usize] = sum;
                }
            }
        }
        Ok(())
    }
}
