//! Decoding RGBA label masks into class-index maps.

use image::{ImageBuffer, Luma};

use crate::anno::AnnoClasses;
use crate::types::{Dimensions, Rgba, RgbaImage};

/// A single-channel map of class indices; unlabeled pixels hold
/// [`crate::IGNORE_LABEL`].
pub type LabelImage = ImageBuffer<Luma<u16>, Vec<u16>>;

/// Errors from decoding a label mask.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LabelError {
    /// A pixel's color matches no class.
    #[error("unknown class: {color} at ({x}, {y})")]
    UnknownColor { color: Rgba, x: u32, y: u32 },

    /// The mask and the image differ in size.
    #[error("label image size mismatch: image is {image}, label is {label}")]
    SizeMismatch { image: Dimensions, label: Dimensions },
}

/// Check that a mask matches its image's size.
///
/// # Errors
///
/// Returns [`LabelError::SizeMismatch`] unless both dimensions agree.
pub fn check_label_size(image: Dimensions, label: &RgbaImage) -> Result<(), LabelError> {
    let label = Dimensions::new(label.width(), label.height());
    if image == label {
        Ok(())
    } else {
        Err(LabelError::SizeMismatch { image, label })
    }
}

fn class_at(
    classes: &AnnoClasses,
    x: u32,
    y: u32,
    pixel: &image::Rgba<u8>,
) -> Result<u16, LabelError> {
    let color = Rgba::from(*pixel);
    classes
        .index_of(color)
        .ok_or(LabelError::UnknownColor { color, x, y })
}

/// Map every mask pixel to its class index.
///
/// # Errors
///
/// Returns [`LabelError::UnknownColor`] for the first pixel whose color is
/// neither the ignore color nor a class color.
pub fn decode_label_image(
    label: &RgbaImage,
    classes: &AnnoClasses,
) -> Result<LabelImage, LabelError> {
    let mut decoded = LabelImage::new(label.width(), label.height());
    for (x, y, pixel) in label.enumerate_pixels() {
        decoded.put_pixel(x, y, Luma([class_at(classes, x, y, pixel)?]));
    }
    Ok(decoded)
}

/// Check every mask pixel against the classes without building the
/// index map.
///
/// # Errors
///
/// Same as [`decode_label_image`].
pub fn validate_label_image(label: &RgbaImage, classes: &AnnoClasses) -> Result<(), LabelError> {
    label
        .enumerate_pixels()
        .try_for_each(|(x, y, pixel)| class_at(classes, x, y, pixel).map(drop))
}
