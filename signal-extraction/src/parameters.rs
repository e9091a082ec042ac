//! Defines the parameters of the spline extractor and of the two-gain coordinator.
use crate::pulse_detection::Real;
use cherenkov_common::RawSample;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Extraction range {first}..={last} does not fit in {num_samples} samples")]
    RangeOutOfBounds {
        first: usize,
        last: usize,
        num_samples: usize,
    },
    #[error("Extraction range {first}..={last} spans fewer than two samples")]
    RangeTooShort { first: usize, last: usize },
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Determines how the charge of a pulse is computed.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractionPolicy {
    /// The height of the spline's maximum.
    #[default]
    Amplitude,
    /// The integral over a fixed window, starting at the arrival time.
    IntegralFixedWindow,
    /// The integral from the arrival time to the falling edge's crossing of the same threshold.
    IntegralDynamic,
    /// The integral from the rise time before, to the fall time after, the arrival time.
    IntegralRiseFall,
}

/// Determines how the leading-edge threshold of the arrival time is given.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeadingEdge {
    /// The leading-edge height is a fraction of the peak height.
    #[default]
    Relative,
    /// The leading-edge height is in calibrated counts.
    Absolute,
}

/// Encapsulates the parameters of [SplineExtractor](crate::SplineExtractor).
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SplineParameters {
    /// Determines how the charge is computed.
    #[clap(long, default_value = "amplitude")]
    pub policy: ExtractionPolicy,

    /// Samples integrated before the arrival time, by the rise-fall policy.
    #[clap(long, default_value = "1.5")]
    pub rise_time: Real,

    /// Samples integrated after the arrival time, by the rise-fall policy.
    #[clap(long, default_value = "4.5")]
    pub fall_time: Real,

    /// Width, in samples, of the fixed integration window.
    #[clap(long, default_value = "6")]
    pub integration_window: Real,

    /// Whether the leading-edge height is relative to the peak or absolute.
    #[clap(long, default_value = "relative")]
    pub leading_edge: LeadingEdge,

    /// Height at which the arrival time is taken on the rising edge.
    #[clap(long, default_value = "0.5")]
    pub leading_edge_height: Real,

    /// Noise of one calibrated sample, which scales the charge uncertainty.
    #[clap(long, default_value = "1")]
    pub noise_per_sample: Real,

    /// A waveform with more saturated samples than this is not extracted.
    #[clap(long, default_value = "1")]
    pub max_saturated: usize,
}

impl Default for SplineParameters {
    fn default() -> Self {
        Self {
            policy: ExtractionPolicy::Amplitude,
            rise_time: 1.5,
            fall_time: 4.5,
            integration_window: 6.0,
            leading_edge: LeadingEdge::Relative,
            leading_edge_height: 0.5,
            noise_per_sample: 1.0,
            max_saturated: 1,
        }
    }
}

impl SplineParameters {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.rise_time >= 0.0 && self.fall_time >= 0.0) {
            return Err(ConfigError::InvalidParameter(
                "rise and fall times must not be negative".to_owned(),
            ));
        }
        if !(self.integration_window > 0.0) {
            return Err(ConfigError::InvalidParameter(
                "integration window must be positive".to_owned(),
            ));
        }
        match self.leading_edge {
            LeadingEdge::Relative
                if !(self.leading_edge_height > 0.0 && self.leading_edge_height <= 1.0) =>
            {
                return Err(ConfigError::InvalidParameter(format!(
                    "relative leading edge height must be in (0, 1], got {}",
                    self.leading_edge_height
                )));
            }
            LeadingEdge::Absolute if !(self.leading_edge_height > 0.0) => {
                return Err(ConfigError::InvalidParameter(format!(
                    "absolute leading edge height must be positive, got {}",
                    self.leading_edge_height
                )));
            }
            _ => {}
        }
        if !(self.noise_per_sample >= 0.0) {
            return Err(ConfigError::InvalidParameter(
                "noise per sample must not be negative".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Encapsulates the parameters of [ExtractionCoordinator](crate::ExtractionCoordinator).
///
/// Each channel's samples consist of `num_hi_samples` high-gain samples followed by
/// `num_lo_samples` low-gain samples.
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ExtractionParameters {
    #[clap(flatten)]
    pub spline: SplineParameters,

    /// Number of high-gain samples per channel.
    #[clap(long, default_value = "30")]
    pub num_hi_samples: usize,

    /// Number of low-gain samples per channel, zero if the digitiser has no low-gain branch.
    #[clap(long, default_value = "0")]
    pub num_lo_samples: usize,

    /// First high-gain sample extracted from.
    #[clap(long, default_value = "0")]
    pub hi_first: usize,

    /// Last high-gain sample extracted from, inclusive.
    #[clap(long, default_value = "29")]
    pub hi_last: usize,

    /// First low-gain sample extracted from, counted from the start of the low-gain samples.
    #[clap(long, default_value = "0")]
    pub lo_first: usize,

    /// Last low-gain sample extracted from, inclusive.
    #[clap(long, default_value = "29")]
    pub lo_last: usize,

    /// Raw samples at or above this value are saturated.
    #[clap(long, default_value = "4095")]
    pub saturation_limit: RawSample,

    /// The low-gain branch is only extracted if the high-gain maximum exceeds this.
    #[clap(long, default_value = "120")]
    pub lo_gain_switch: Real,

    /// Shift, in samples, of the low-gain window start relative to the high-gain arrival time.
    #[clap(long, default_value = "-1", allow_hyphen_values = true)]
    pub lo_gain_start_shift: Real,

    /// Delay of the low-gain branch, subtracted from its arrival times.
    #[clap(long, default_value = "1.7")]
    pub lo_gain_offset: Real,

    /// Factor by which rise and fall times are stretched for the low-gain branch.
    #[clap(long, default_value = "1.5")]
    pub lo_gain_stretch: Real,

    /// High-gain results are discarded if more samples than this are saturated.
    #[clap(long, default_value = "8")]
    pub max_saturated_hi: usize,

    /// Low-gain results are discarded if more samples than this are saturated.
    #[clap(long, default_value = "6")]
    pub max_saturated_lo: usize,
}

impl Default for ExtractionParameters {
    fn default() -> Self {
        Self {
            spline: SplineParameters::default(),
            num_hi_samples: 30,
            num_lo_samples: 0,
            hi_first: 0,
            hi_last: 29,
            lo_first: 0,
            lo_last: 29,
            saturation_limit: 4095,
            lo_gain_switch: 120.0,
            lo_gain_start_shift: -1.0,
            lo_gain_offset: 1.7,
            lo_gain_stretch: 1.5,
            max_saturated_hi: 8,
            max_saturated_lo: 6,
        }
    }
}

fn check_range(first: usize, last: usize, num_samples: usize) -> Result<(), ConfigError> {
    if first > last || last >= num_samples {
        return Err(ConfigError::RangeOutOfBounds {
            first,
            last,
            num_samples,
        });
    }
    if last == first {
        return Err(ConfigError::RangeTooShort { first, last });
    }
    Ok(())
}

impl ExtractionParameters {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.spline.validate()?;
        check_range(self.hi_first, self.hi_last, self.num_hi_samples)?;
        if self.num_lo_samples > 0 {
            check_range(self.lo_first, self.lo_last, self.num_lo_samples)?;
        }
        if !(self.lo_gain_stretch > 0.0) {
            return Err(ConfigError::InvalidParameter(
                "low-gain stretch must be positive".to_owned(),
            ));
        }
        Ok(())
    }

    /// Total number of samples per channel.
    pub fn num_samples(&self) -> usize {
        self.num_hi_samples + self.num_lo_samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_agree_with_command_line() {
        let parsed = ExtractionParameters::parse_from(["extraction"]);
        let default = ExtractionParameters::default();
        assert_eq!(parsed.spline.policy, default.spline.policy);
        assert_eq!(parsed.spline.rise_time, default.spline.rise_time);
        assert_eq!(parsed.spline.fall_time, default.spline.fall_time);
        assert_eq!(parsed.spline.integration_window, default.spline.integration_window);
        assert_eq!(parsed.spline.max_saturated, default.spline.max_saturated);
        assert_eq!(parsed.spline.leading_edge, default.spline.leading_edge);
        assert_eq!(parsed.hi_last, default.hi_last);
        assert_eq!(parsed.saturation_limit, default.saturation_limit);
        assert_eq!(parsed.lo_gain_start_shift, default.lo_gain_start_shift);
        assert_eq!(parsed.lo_gain_offset, default.lo_gain_offset);
        assert!(default.validate().is_ok());
    }

    #[test]
    fn invalid_ranges_are_rejected() {
        let parameters = ExtractionParameters {
            hi_last: 30,
            ..Default::default()
        };
        assert!(matches!(
            parameters.validate(),
            Err(ConfigError::RangeOutOfBounds { last: 30, .. })
        ));

        let parameters = ExtractionParameters {
            hi_first: 4,
            hi_last: 4,
            ..Default::default()
        };
        assert_eq!(
            parameters.validate(),
            Err(ConfigError::RangeTooShort { first: 4, last: 4 })
        );

        let parameters = ExtractionParameters {
            num_lo_samples: 10,
            ..Default::default()
        };
        assert!(parameters.validate().is_err());
    }

    #[test]
    fn invalid_spline_parameters_are_rejected() {
        for spline in [
            SplineParameters {
                leading_edge_height: 0.0,
                ..Default::default()
            },
            SplineParameters {
                leading_edge_height: 20.0,
                ..Default::default()
            },
            SplineParameters {
                leading_edge: LeadingEdge::Absolute,
                leading_edge_height: 0.0,
                ..Default::default()
            },
            SplineParameters {
                integration_window: -1.0,
                ..Default::default()
            },
            SplineParameters {
                rise_time: Real::NAN,
                ..Default::default()
            },
        ] {
            assert!(spline.validate().is_err());
        }
    }

    #[test]
    fn absolute_leading_edge_may_exceed_one() {
        let spline = SplineParameters {
            leading_edge: LeadingEdge::Absolute,
            leading_edge_height: 20.0,
            ..Default::default()
        };
        assert!(spline.validate().is_ok());
    }

    #[test]
    fn reads_from_json() {
        let parameters: ExtractionParameters = serde_json::from_str(
            r#"{ "num-lo-samples": 20, "lo-last": 19, "spline": { "policy": "integral-rise-fall" } }"#,
        )
        .unwrap();
        assert_eq!(parameters.spline.policy, ExtractionPolicy::IntegralRiseFall);
        assert_eq!(parameters.spline.rise_time, 1.5);
        assert_eq!(parameters.num_samples(), 50);
        assert!(parameters.validate().is_ok());
    }
}
