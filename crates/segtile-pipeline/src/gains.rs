//! Per-class additive score gains.
//!
//! Gains shift the precision/recall trade-off at inference time without
//! retraining: `gain[c]` is added to class `c`'s score at every pixel
//! before the scores are reduced to a single channel.

use crate::types::ConfigError;

/// One class-specific gain parsed from an `index:value` specification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainSpec {
    pub index: usize,
    pub value: f32,
}

impl std::str::FromStr for GainSpec {
    type Err = ConfigError;

    /// Parse `index:value`, e.g. `1:-0.5`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let format_error = || ConfigError::GainFormat(s.to_owned());

        let (index, value) = s.split_once(':').ok_or_else(format_error)?;
        if index.is_empty() || value.is_empty() {
            return Err(format_error());
        }
        let index = index.trim().parse().map_err(|_| format_error())?;
        let value: f32 = value.trim().parse().map_err(|_| format_error())?;
        if !value.is_finite() {
            return Err(format_error());
        }
        Ok(Self { index, value })
    }
}

/// Additive bias for every class, exactly one entry per class.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassGains(Vec<f32>);

impl ClassGains {
    /// All-zero gains for `class_count` classes.
    #[must_use]
    pub fn zero(class_count: usize) -> Self {
        Self(vec![0.0; class_count])
    }

    /// Build gains from parsed specifications.
    ///
    /// Classes without a specification get zero bias. When the same index
    /// appears more than once, the last value wins.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::GainIndexOutOfRange`] if a specification
    /// names an index `>= class_count`.
    pub fn from_specs(
        specs: impl IntoIterator<Item = GainSpec>,
        class_count: usize,
    ) -> Result<Self, ConfigError> {
        let mut gains = Self::zero(class_count);
        for spec in specs {
            let slot = gains.0.get_mut(spec.index).ok_or(
                ConfigError::GainIndexOutOfRange {
                    index: spec.index,
                    class_count,
                },
            )?;
            *slot = spec.value;
        }
        Ok(gains)
    }

    /// Parse command-line gain strings and build gains from them.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::GainFormat`] for malformed strings and the
    /// errors of [`Self::from_specs`].
    pub fn parse<S: AsRef<str>>(
        specs: impl IntoIterator<Item = S>,
        class_count: usize,
    ) -> Result<Self, ConfigError> {
        let specs = specs
            .into_iter()
            .map(|s| s.as_ref().parse::<GainSpec>())
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_specs(specs, class_count)
    }

    /// All gains in class order.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Number of classes covered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for ClassGains {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, gain) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{i}:{gain}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn parses_negative_gain() {
        let spec: GainSpec = "1:-0.5".parse().unwrap();
        assert_eq!(spec.index, 1);
        assert_eq!(spec.value, -0.5);
    }

    #[test]
    fn rejects_malformed_specs() {
        for bad in ["", "1", ":0.5", "1:", "a:1", "1:b", "1:inf", "-1:0.5"] {
            assert!(
                matches!(bad.parse::<GainSpec>(), Err(ConfigError::GainFormat(_))),
                "expected format error for {bad:?}"
            );
        }
    }

    #[test]
    fn absent_gains_default_to_zero() {
        let gains = ClassGains::parse(["2:1.5"], 4).unwrap();
        assert_eq!(gains.as_slice(), &[0.0, 0.0, 1.5, 0.0]);
    }

    #[test]
    fn later_spec_overrides_earlier() {
        let gains = ClassGains::parse(["0:1", "0:2"], 2).unwrap();
        assert_eq!(gains.as_slice(), &[2.0, 0.0]);
    }

    #[test]
    fn index_out_of_range_is_rejected() {
        let err = ClassGains::parse(["2:1.0"], 2).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::GainIndexOutOfRange {
                index: 2,
                class_count: 2
            }
        ));
    }

    #[test]
    fn index_beyond_u16_is_out_of_range() {
        let err = ClassGains::parse(["70000:1"], 2).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::GainIndexOutOfRange {
                index: 70_000,
                class_count: 2
            }
        ));
    }

    #[test]
    fn display_lists_every_class() {
        let gains = ClassGains::parse(["1:-0.5"], 3).unwrap();
        assert_eq!(gains.to_string(), "0:0 1:-0.5 2:0");
    }
}
