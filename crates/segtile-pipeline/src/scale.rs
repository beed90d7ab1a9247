//! Resizing between source and inference resolution.
//!
//! A model bundle may ask for inputs to be downscaled by a constant factor
//! before tiling. Readers apply [`downscale`] right after decode; writers
//! apply [`restore`] to bring results back to the source size.

use std::fmt;

use image::imageops::FilterType;
use serde::{Deserialize, Serialize};

use crate::types::{Dimensions, GrayImage};

/// Resampling filter used when resizing.
///
/// Ordered from fastest/lowest-quality to slowest/highest-quality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResizeFilter {
    /// Nearest-neighbor: fastest, blocky artifacts.
    Nearest,
    /// Bilinear interpolation: fast, decent quality.
    #[default]
    Triangle,
    /// Bicubic (Catmull-Rom): moderate speed, good quality.
    CatmullRom,
    /// Lanczos with 3 lobes: slowest, sharpest.
    Lanczos3,
}

impl ResizeFilter {
    /// Convert to the `image` crate's `FilterType`.
    const fn to_image_filter(self) -> FilterType {
        match self {
            Self::Nearest => FilterType::Nearest,
            Self::Triangle => FilterType::Triangle,
            Self::CatmullRom => FilterType::CatmullRom,
            Self::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

impl fmt::Display for ResizeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nearest => f.write_str("Nearest"),
            Self::Triangle => f.write_str("Triangle"),
            Self::CatmullRom => f.write_str("CatmullRom"),
            Self::Lanczos3 => f.write_str("Lanczos3"),
        }
    }
}

/// Size an image of `original` dimensions has after dividing by
/// `factor`. Each axis is rounded and kept at least one pixel.
///
/// Factors that are not finite or not positive leave the size unchanged.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn scaled_dimensions(original: Dimensions, factor: f64) -> Dimensions {
    if !factor.is_finite() || factor <= 0.0 {
        return original;
    }
    let scale = |v: u32| ((f64::from(v) / factor).round() as u32).max(1);
    Dimensions::new(scale(original.width), scale(original.height))
}

/// Downscale a decoded image by `factor`.
///
/// Returns the (possibly unchanged) image and whether resizing was
/// actually applied. A factor of exactly 1.0 never resizes.
#[must_use]
pub fn downscale(image: GrayImage, factor: f64, filter: ResizeFilter) -> (GrayImage, bool) {
    let target = scaled_dimensions(Dimensions::of(&image), factor);
    if target == Dimensions::of(&image) {
        return (image, false);
    }
    let resized = image::imageops::resize(
        &image,
        target.width,
        target.height,
        filter.to_image_filter(),
    );
    (resized, true)
}

/// Resize a result back to `original` dimensions.
///
/// Returns the input untouched when it already has that size.
#[must_use]
pub fn restore(image: GrayImage, original: Dimensions, filter: ResizeFilter) -> GrayImage {
    if Dimensions::of(&image) == original {
        return image;
    }
    image::imageops::resize(
        &image,
        original.width,
        original.height,
        filter.to_image_filter(),
    )
}
