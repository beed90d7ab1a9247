//! segtile-io: disk access and the threaded inference pipeline.
//!
//! Finds images on disk, reads model bundles, and runs the
//! reader -> inference -> writer pipeline over bounded [`Pipe`]s, using
//! the sans-IO core in `segtile-pipeline` for the actual inference.

pub mod bundle;
pub mod discover;
pub mod pipe;
pub mod report;
pub mod runner;
pub mod sample;
pub mod writer;

pub use bundle::{BundleError, ModelBundle};
pub use discover::{DiscoverError, ImagePaths, find_image_files};
pub use pipe::{CancelToken, Closed, Pipe};
pub use report::RunReport;
pub use runner::{RunConfig, RunError, run};
pub use sample::{DecodedImage, DecodedSample, ReadOptions, SampleError, read_sample};
pub use writer::{ResultImage, WriteError, write_result};
