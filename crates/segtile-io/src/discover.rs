//! Finding input images on disk.
//!
//! Walks a directory tree for `.jpeg`, `.jpg` and `.png` files, skipping
//! label masks and previously written results, and pairs each image with
//! its sibling mask (`<image>_mask.png`) when one exists.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

/// Suffix appended to an image's file name to find its label mask.
pub const MASK_SUFFIX: &str = "_mask.png";

/// Suffix of legacy result files, never treated as inputs.
pub const RESULT_SUFFIX: &str = "_result.png";

/// Suffix appended to an image's file name for its probability map.
pub const OUTPUT_SUFFIX: &str = "_probability_map.png";

const IMAGE_EXTENSIONS: [&str; 3] = [".jpeg", ".jpg", ".png"];

/// One unit of work: an image and, optionally, its label mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePaths {
    pub image: PathBuf,
    pub label: Option<PathBuf>,
}

impl ImagePaths {
    /// Paths for an image without a mask.
    #[must_use]
    pub const fn unlabeled(image: PathBuf) -> Self {
        Self { image, label: None }
    }

    /// Where this image's result is written.
    #[must_use]
    pub fn output_path(&self) -> PathBuf {
        append_to_file_name(&self.image, OUTPUT_SUFFIX)
    }
}

/// `path` with `suffix` appended to its full file name.
fn append_to_file_name(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Where the label mask for `image` would be.
#[must_use]
pub fn mask_path_for(image: &Path) -> PathBuf {
    append_to_file_name(image, MASK_SUFFIX)
}

/// Whether a file name looks like an input image.
fn is_input_image(name: &str) -> bool {
    if [MASK_SUFFIX, RESULT_SUFFIX, OUTPUT_SUFFIX]
        .iter()
        .any(|suffix| name.ends_with(suffix))
    {
        return false;
    }
    IMAGE_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// Errors from scanning the input directory.
#[derive(Debug, thiserror::Error)]
pub enum DiscoverError {
    #[error("failed to scan {}: {source}", path.display())]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("input directory {} does not exist or is not a directory", .0.display())]
    NotADirectory(PathBuf),
}

/// Recursively collect the images under `root`, sorted by path.
///
/// When `require_labels` is set, images without a mask are skipped with a
/// warning.
///
/// # Errors
///
/// Returns [`DiscoverError::NotADirectory`] if `root` is not a directory,
/// and [`DiscoverError::Walk`] if part of the tree cannot be read.
pub fn find_image_files(root: &Path, require_labels: bool) -> Result<Vec<ImagePaths>, DiscoverError> {
    if !root.is_dir() {
        return Err(DiscoverError::NotADirectory(root.to_path_buf()));
    }

    let mut found = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|source| DiscoverError::Walk {
            path: root.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if !is_input_image(name) {
            continue;
        }

        let image = entry.into_path();
        let mask = mask_path_for(&image);
        let label = mask.is_file().then_some(mask);
        if require_labels && label.is_none() {
            warn!(image = %image.display(), "unable to open label mask, skipping");
            continue;
        }
        debug!(image = %image.display(), labeled = label.is_some(), "added file");
        found.push(ImagePaths { image, label });
    }

    found.sort_by(|a, b| a.image.cmp(&b.image));
    Ok(found)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::fs;

    use super::*;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, b"").unwrap();
    }

    #[test]
    fn input_name_filter() {
        assert!(is_input_image("a.png"));
        assert!(is_input_image("a.jpg"));
        assert!(is_input_image("a.jpeg"));
        assert!(!is_input_image("a.bmp"));
        assert!(!is_input_image("a.png_mask.png"));
        assert!(!is_input_image("a_result.png"));
        assert!(!is_input_image("a.jpg_probability_map.png"));
    }

    #[test]
    fn output_and_mask_paths_append_to_full_name() {
        let paths = ImagePaths::unlabeled(PathBuf::from("/data/set/img.jpg"));
        assert_eq!(
            paths.output_path(),
            PathBuf::from("/data/set/img.jpg_probability_map.png")
        );
        assert_eq!(
            mask_path_for(&paths.image),
            PathBuf::from("/data/set/img.jpg_mask.png")
        );
    }

    #[test]
    fn finds_images_recursively_and_pairs_masks() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("b.png"));
        touch(&root.join("b.png_mask.png"));
        touch(&root.join("nested/deeper/a.jpg"));
        touch(&root.join("nested/c.jpeg"));
        touch(&root.join("nested/c.jpeg_probability_map.png"));
        touch(&root.join("notes.txt"));
        touch(&root.join("old_result.png"));

        let files = find_image_files(root, false).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|f| f.image.strip_prefix(root).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            names,
            vec![
                PathBuf::from("b.png"),
                PathBuf::from("nested/c.jpeg"),
                PathBuf::from("nested/deeper/a.jpg"),
            ]
        );
        assert_eq!(files[0].label, Some(root.join("b.png_mask.png")));
        assert_eq!(files[1].label, None);
    }

    #[test]
    fn require_labels_skips_unlabeled_images() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("x.png"));
        touch(&dir.path().join("y.png"));
        touch(&dir.path().join("y.png_mask.png"));

        let files = find_image_files(dir.path(), true).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].image.ends_with("y.png"));
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = find_image_files(&dir.path().join("nope"), false).unwrap_err();
        assert!(matches!(err, DiscoverError::NotADirectory(_)));
    }
}
