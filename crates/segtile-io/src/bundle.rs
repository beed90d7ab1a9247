//! Model bundle files.
//!
//! A bundle is one binary artifact holding, in order:
//!
//! | field              | encoding                                  |
//! |--------------------|-------------------------------------------|
//! | class definitions  | `u64` LE byte length, UTF-8 JSON (may be empty) |
//! | downscaling factor | `f64` LE                                  |
//! | model weights      | `u64` LE byte length, raw bytes           |
//!
//! The class JSON is parsed by [`segtile_pipeline::AnnoClasses::parse`];
//! the weights are opaque here and handed to the model loader.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

/// Upper bound on a single length-prefixed section.
const MAX_SECTION_LEN: u64 = 1 << 32;

/// The deserialized contents of a model bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelBundle {
    /// Class-definition JSON; empty selects the built-in classes.
    pub anno_classes_json: String,
    /// Inputs are divided by this factor before tiling.
    pub downscaling_factor: f64,
    /// Serialized model weights.
    pub weights: Vec<u8>,
}

/// Errors from reading or writing a bundle.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("failed to read model bundle: {0}")]
    Io(#[from] io::Error),

    #[error("model bundle is truncated in the {0} section")]
    Truncated(&'static str),

    #[error("model bundle {section} section is {len} bytes, above the {MAX_SECTION_LEN} byte limit")]
    SectionTooLarge { section: &'static str, len: u64 },

    #[error("model bundle class definitions are not UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("model bundle downscaling factor {0} must be finite and positive")]
    InvalidDownscalingFactor(f64),
}

fn read_exact_or<R: Read>(reader: &mut R, buf: &mut [u8], section: &'static str) -> Result<(), BundleError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => BundleError::Truncated(section),
        _ => BundleError::Io(e),
    })
}

fn read_section<R: Read>(reader: &mut R, section: &'static str) -> Result<Vec<u8>, BundleError> {
    let mut len = [0_u8; 8];
    read_exact_or(reader, &mut len, section)?;
    let len = u64::from_le_bytes(len);
    if len > MAX_SECTION_LEN {
        return Err(BundleError::SectionTooLarge { section, len });
    }
    let mut bytes = Vec::new();
    reader.take(len).read_to_end(&mut bytes)?;
    if bytes.len() as u64 != len {
        return Err(BundleError::Truncated(section));
    }
    Ok(bytes)
}

fn write_section<W: Write>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(&(bytes.len() as u64).to_le_bytes())?;
    writer.write_all(bytes)
}

impl ModelBundle {
    /// Read a bundle from a byte stream.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError`] for I/O failures, truncated or oversized
    /// sections, non-UTF-8 class JSON, or an unusable downscaling factor.
    pub fn read_from<R: Read>(mut reader: R) -> Result<Self, BundleError> {
        let anno_classes_json = String::from_utf8(read_section(&mut reader, "class definitions")?)?;

        let mut factor = [0_u8; 8];
        read_exact_or(&mut reader, &mut factor, "downscaling factor")?;
        let downscaling_factor = f64::from_le_bytes(factor);
        if !downscaling_factor.is_finite() || downscaling_factor <= 0.0 {
            return Err(BundleError::InvalidDownscalingFactor(downscaling_factor));
        }

        let weights = read_section(&mut reader, "weights")?;
        Ok(Self {
            anno_classes_json,
            downscaling_factor,
            weights,
        })
    }

    /// Read a bundle file.
    ///
    /// # Errors
    ///
    /// As [`Self::read_from`], plus failure to open `path`.
    pub fn load(path: &Path) -> Result<Self, BundleError> {
        Self::read_from(BufReader::new(File::open(path)?))
    }

    /// Write the bundle to a byte stream.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<(), BundleError> {
        write_section(&mut writer, self.anno_classes_json.as_bytes())?;
        writer.write_all(&self.downscaling_factor.to_le_bytes())?;
        write_section(&mut writer, &self.weights)?;
        writer.flush()?;
        Ok(())
    }

    /// Write the bundle to a file, replacing it if it exists.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures.
    pub fn save(&self, path: &Path) -> Result<(), BundleError> {
        self.write_to(BufWriter::new(File::create(path)?))
    }
}
