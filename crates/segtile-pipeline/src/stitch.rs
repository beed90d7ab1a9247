//! Tile stitcher.
//!
//! Copies the core region of each tile's output into the full-resolution
//! result. There is no blending: core regions partition the image, so
//! every result pixel is written by exactly one tile and stitching order
//! does not matter.

use crate::tiling::PlannedTile;
use crate::types::{Dimensions, GrayImage, Rect};

/// Errors from copying a tile into the result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StitchError {
    /// The tile output does not have the planned tile size.
    #[error("tile output is {actual}, planned tile is {expected}")]
    TileSizeMismatch {
        expected: Dimensions,
        actual: Dimensions,
    },

    /// The core region falls outside the tile or the result image.
    #[error("core region {core:?} does not fit tile {tile:?} in a {result} result")]
    OutOfBounds {
        core: Rect,
        tile: Rect,
        result: Dimensions,
    },
}

/// Copy `planned.core` from `tile_output` into `result`.
///
/// `tile_output` holds the output for the whole of `planned.tile`; the
/// core region is read at its offset inside the tile and written at its
/// position in the full image.
///
/// # Errors
///
/// Returns [`StitchError::TileSizeMismatch`] if `tile_output` is not the
/// size of `planned.tile`, and [`StitchError::OutOfBounds`] if the core
/// region does not lie inside both the tile and `result`.
pub fn stitch(
    tile_output: &GrayImage,
    planned: &PlannedTile,
    result: &mut GrayImage,
) -> Result<(), StitchError> {
    let actual = Dimensions::of(tile_output);
    if actual != planned.tile.dimensions() {
        return Err(StitchError::TileSizeMismatch {
            expected: planned.tile.dimensions(),
            actual,
        });
    }

    let result_dimensions = Dimensions::of(result);
    let result_bounds = Rect::new(0, 0, result_dimensions.width, result_dimensions.height);
    if !planned.tile.contains(planned.core) || !result_bounds.contains(planned.core) {
        return Err(StitchError::OutOfBounds {
            core: planned.core,
            tile: planned.tile,
            result: result_dimensions,
        });
    }

    let source = planned.core_in_tile();
    let tile_stride = actual.width as usize;
    let result_stride = result_dimensions.width as usize;
    let row_len = planned.core.width as usize;
    let tile_pixels: &[u8] = tile_output;
    let result_pixels: &mut [u8] = result;

    for row in 0..planned.core.height as usize {
        let src = (source.y as usize + row) * tile_stride + source.x as usize;
        let dst = (planned.core.y as usize + row) * result_stride + planned.core.x as usize;
        result_pixels[dst..dst + row_len].copy_from_slice(&tile_pixels[src..src + row_len]);
    }
    Ok(())
}
