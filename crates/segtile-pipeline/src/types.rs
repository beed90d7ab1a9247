//! Shared types for the segtile inference pipeline.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Re-export `GrayImage` so downstream crates can reference input tiles
/// and result images without depending on `image` directly.
pub use image::GrayImage;

/// Re-export `RgbaImage` so downstream crates can hand label masks to
/// [`crate::label::decode_label_image`] without depending on `image`.
pub use image::RgbaImage;

/// Label value marking pixels that belong to no class.
///
/// Distinct from every real class index, which are dense from 0.
pub const IGNORE_LABEL: u16 = u16::MAX;

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Create new dimensions.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Dimensions of an image buffer.
    #[must_use]
    pub fn of(image: &GrayImage) -> Self {
        Self::new(image.width(), image.height())
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// An axis-aligned pixel rectangle.
///
/// Used both for tiles (the full extent handed to the model) and for
/// core regions (the authoritative part of a tile's output).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rect {
    /// Left edge, inclusive.
    pub x: u32,
    /// Top edge, inclusive.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Rect {
    /// Create a new rectangle.
    #[must_use]
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Right edge, exclusive.
    #[must_use]
    pub const fn right(self) -> u32 {
        self.x + self.width
    }

    /// Bottom edge, exclusive.
    #[must_use]
    pub const fn bottom(self) -> u32 {
        self.y + self.height
    }

    /// Size of the rectangle.
    #[must_use]
    pub const fn dimensions(self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }

    /// Returns `true` if `other` lies entirely inside `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }
}

/// An 8-bit RGBA color key identifying a class in label masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgba {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
    pub alpha: u8,
}

impl Rgba {
    /// The reserved color marking unlabeled pixels.
    pub const IGNORE: Self = Self::new(0, 0, 0, 0);

    #[must_use]
    pub const fn new(red: u8, green: u8, blue: u8, alpha: u8) -> Self {
        Self {
            red,
            green,
            blue,
            alpha,
        }
    }

    /// Returns `true` for the reserved ignore color.
    #[must_use]
    pub const fn is_ignore(self) -> bool {
        self.red == 0 && self.green == 0 && self.blue == 0 && self.alpha == 0
    }
}

impl From<image::Rgba<u8>> for Rgba {
    fn from(pixel: image::Rgba<u8>) -> Self {
        let [red, green, blue, alpha] = pixel.0;
        Self::new(red, green, blue, alpha)
    }
}

impl fmt::Display for Rgba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "r = {}, g = {}, b = {}, alpha = {}",
            self.red, self.green, self.blue, self.alpha
        )
    }
}

/// One annotation class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnoClass {
    /// Dense, 0-based class index.
    pub index: u16,
    /// Color key used in label masks.
    pub color: Rgba,
    /// Human-readable class name.
    pub name: String,
}

/// Errors raised while validating run configuration.
///
/// All of these are reported before any worker thread starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The class-definition document is not valid JSON for the schema.
    #[error("error parsing anno classes json: {0}")]
    AnnoClassesJson(#[from] serde_json::Error),

    /// The reserved ignore color was assigned to a class.
    #[error(
        "unexpected anno classes json content - rgba (0, 0, 0, 0) is reserved for pixels to be ignored (class {name:?})"
    )]
    ReservedColor {
        /// Name of the offending class.
        name: String,
    },

    /// Two classes share the same color key.
    #[error("classes {first:?} and {second:?} share the color {color}")]
    DuplicateColor {
        first: String,
        second: String,
        color: Rgba,
    },

    /// Fewer than two classes were defined.
    #[error("at least 2 anno classes are required, got {0}")]
    TooFewClasses(usize),

    /// More classes than fit below the ignore sentinel.
    #[error("too many anno classes: {0}")]
    TooManyClasses(usize),

    /// A gain specification is not of the form `index:value`.
    #[error("the gains must be supplied in the format index:gain (e.g., 1:-0.5), got {0:?}")]
    GainFormat(String),

    /// A gain was given for a class that does not exist.
    #[error("can't define class-specific value for index {index} when there are only {class_count} classes")]
    GainIndexOutOfRange {
        /// Requested class index.
        index: usize,
        /// Number of defined classes.
        class_count: usize,
    },

    /// Tiling parameters are inconsistent with the model.
    #[error("invalid tiling parameters: {0}")]
    InvalidTiling(String),

    /// The reduction policy names a class that does not exist.
    #[error("reduction class {index} is out of range for {class_count} classes")]
    ReductionClassOutOfRange { index: u16, class_count: usize },
}
