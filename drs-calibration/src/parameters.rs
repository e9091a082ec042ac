//! Defines the parameters of waveform calibration.
use crate::CalibrationError;
use cherenkov_common::{Channel, Real};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

/// Determines how spikes are removed from calibrated waveforms.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpikeRemoval {
    /// Spikes are left in place.
    #[default]
    Off,
    /// Single and double spikes exceeding the spike threshold are replaced by their neighbours' mean.
    Simple,
    /// As simple, but a lower threshold applies where previous events' start cells are read out.
    History,
}

/// Encapsulates the parameters of [WaveformCalibrationApplier](crate::WaveformCalibrationApplier).
#[derive(Debug, Clone, Parser, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CalibrationParameters {
    /// Determines how spikes are removed.
    #[clap(long, default_value = "off")]
    pub spike_removal: SpikeRemoval,

    /// A sample exceeding both neighbours by more than this is a spike.
    #[clap(long, default_value = "25")]
    pub spike_threshold: Real,

    /// Spike threshold at positions where previous events' start cells are read out.
    #[clap(long, default_value = "10")]
    pub history_spike_threshold: Real,

    /// Number of previous events' start cells retained per channel.
    #[clap(long, default_value = "10")]
    pub history_depth: usize,

    /// Width, in samples, of the sliding average applied after calibration. Must be odd, 1 disables smoothing.
    #[clap(long, default_value = "1")]
    pub smoothing_window: usize,

    /// Channels which are not gain-normalised, e.g. time-marker channels.
    #[clap(long, value_delimiter = ',')]
    pub reference_channels: Vec<Channel>,

    /// Number of consecutive channels sharing one row of the time calibration.
    #[clap(long, default_value = "9")]
    pub channels_per_row: usize,
}

impl Default for CalibrationParameters {
    fn default() -> Self {
        Self {
            spike_removal: SpikeRemoval::Off,
            spike_threshold: 25.0,
            history_spike_threshold: 10.0,
            history_depth: 10,
            smoothing_window: 1,
            reference_channels: Vec::new(),
            channels_per_row: 9,
        }
    }
}

impl CalibrationParameters {
    pub fn validate(&self) -> Result<(), CalibrationError> {
        if self.smoothing_window == 0 || self.smoothing_window % 2 == 0 {
            return Err(CalibrationError::InvalidParameter(format!(
                "smoothing window must be odd, got {}",
                self.smoothing_window
            )));
        }
        if !(self.spike_threshold > 0.0 && self.history_spike_threshold > 0.0) {
            return Err(CalibrationError::InvalidParameter(
                "spike thresholds must be positive".to_owned(),
            ));
        }
        if self.channels_per_row == 0 {
            return Err(CalibrationError::InvalidParameter(
                "channels per row must be positive".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn is_reference_channel(&self, channel: Channel) -> bool {
        self.reference_channels.contains(&channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_agree_with_command_line() {
        let parsed = CalibrationParameters::parse_from(["calibration"]);
        let default = CalibrationParameters::default();
        assert_eq!(parsed.spike_removal, default.spike_removal);
        assert_eq!(parsed.spike_threshold, default.spike_threshold);
        assert_eq!(parsed.history_spike_threshold, default.history_spike_threshold);
        assert_eq!(parsed.history_depth, default.history_depth);
        assert_eq!(parsed.smoothing_window, default.smoothing_window);
        assert_eq!(parsed.channels_per_row, default.channels_per_row);
        assert!(parsed.reference_channels.is_empty());
    }

    #[test]
    fn even_smoothing_window_is_rejected() {
        let parameters = CalibrationParameters {
            smoothing_window: 4,
            ..Default::default()
        };
        assert!(parameters.validate().is_err());
        assert!(CalibrationParameters::default().validate().is_ok());
    }

    #[test]
    fn reads_from_json() {
        let parameters: CalibrationParameters = serde_json::from_str(
            r#"{ "spike-removal": "history", "smoothing-window": 3, "reference-channels": [8, 17] }"#,
        )
        .unwrap();
        assert_eq!(parameters.spike_removal, SpikeRemoval::History);
        assert_eq!(parameters.smoothing_window, 3);
        assert!(parameters.is_reference_channel(17));
        assert_eq!(parameters.history_depth, 10);
    }
}
