//! Run report: counts and timings for one pipeline run.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Images pushed through inference.
    pub images_processed: usize,
    /// Write acknowledgements observed before shutdown.
    pub images_written: usize,
    /// Tiles run through the model, across all images.
    pub tiles: usize,
    /// Wall-clock time from the first dequeued sample to the last
    /// result handed to the writers (seconds).
    #[serde(with = "duration_serde")]
    pub inference_duration: Duration,
    /// Wall-clock time of the whole run, including draining writers
    /// (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "All {} images processed in {:.3} seconds!",
            self.images_processed,
            self.inference_duration.as_secs_f64()
        )?;
        writeln!(f, "Tiles inferred: {}", self.tiles)?;
        write!(
            f,
            "All {} result images written ({:.3} seconds total)",
            self.images_written,
            self.total_duration.as_secs_f64()
        )
    }
}
