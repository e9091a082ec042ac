//! Applies a finalized [WaveformCalibrationTable] to raw waveforms.
use crate::{
    CalibrationError, CalibrationParameters, CalibrationStage, SpikeRemoval, StartCellHistory,
    WaveformCalibrationTable,
    filters::{remove_spikes, smooth},
    ring_address::{logical_position, physical_cell},
};
use cherenkov_common::{CalibratedWaveform, Channel, RawWaveform, Real};

/// Removes the additive pedestal structure from raw waveforms, and normalises the gain of
/// non-reference channels.
#[derive(Debug, Clone, Copy)]
pub struct WaveformCalibrationApplier<'a> {
    table: &'a WaveformCalibrationTable,
    parameters: &'a CalibrationParameters,
}

impl<'a> WaveformCalibrationApplier<'a> {
    /// Fails if the baseline stage of `table` is not finalized, or if `parameters` are invalid.
    pub fn new(
        table: &'a WaveformCalibrationTable,
        parameters: &'a CalibrationParameters,
    ) -> Result<Self, CalibrationError> {
        if !table.is_finalized(CalibrationStage::Baseline) {
            return Err(CalibrationError::StageNotFinalized(
                CalibrationStage::Baseline,
            ));
        }
        parameters.validate()?;
        Ok(Self { table, parameters })
    }

    pub fn table(&self) -> &'a WaveformCalibrationTable {
        self.table
    }

    /// The trigger-offset correction of an event of `channel`, scaled like the channel's
    /// calibrated samples.
    pub fn trigger_offsets(&self, channel: Channel, start_cell: i32, len: usize) -> Vec<Real> {
        let normalise = !self.parameters.is_reference_channel(channel);
        self.table.trigger_offsets_for(channel, start_cell, len, normalise)
    }

    /// Creates an empty start-cell history of the configured depth.
    pub fn new_history(&self) -> StartCellHistory {
        StartCellHistory::new(self.parameters.history_depth)
    }

    /// Calibrates one raw waveform.
    /// # Parameters
    /// - channel: the channel which recorded the waveform.
    /// - raw: raw samples, start cell and clock flag of the event.
    /// - history: start cells of this channel's previous events. The event's own start cell
    ///   is appended, so calls for one channel must be made in event order.
    #[tracing::instrument(skip_all, level = "trace", fields(channel = channel, start_cell = raw.start_cell))]
    pub fn calibrate(
        &self,
        channel: Channel,
        raw: &RawWaveform,
        history: &mut StartCellHistory,
    ) -> Result<CalibratedWaveform, CalibrationError> {
        self.table.check_channel(channel)?;
        let ring_size = self.table.ring_size();
        if raw.len() > ring_size.get() {
            return Err(CalibrationError::WaveformTooLong {
                len: raw.len(),
                ring_size: ring_size.get(),
            });
        }

        let start = i64::from(raw.start_cell);
        let ab = raw.ab_parity();
        let normalise = !self.parameters.is_reference_channel(channel);
        let mut samples = raw
            .samples
            .iter()
            .enumerate()
            .map(|(i, &value)| {
                let cell = physical_cell(start, i as i64, ring_size);
                let value = Real::from(value) - self.table.pedestal(channel, cell, i, ab);
                if normalise {
                    value * self.table.gain_factor(channel, cell)
                } else {
                    value
                }
            })
            .collect::<Vec<_>>();

        match self.parameters.spike_removal {
            SpikeRemoval::Off => {}
            SpikeRemoval::Simple => {
                let threshold = self.parameters.spike_threshold;
                remove_spikes(&mut samples, threshold, &[], threshold);
            }
            SpikeRemoval::History => {
                let sensitive = history
                    .iter()
                    .map(|previous| logical_position(start, previous.into(), ring_size))
                    .filter(|&position| position < samples.len())
                    .collect::<Vec<_>>();
                remove_spikes(
                    &mut samples,
                    self.parameters.spike_threshold,
                    &sensitive,
                    self.parameters.history_spike_threshold,
                );
            }
        }
        history.push(raw.start_cell);

        if self.parameters.smoothing_window > 1 {
            samples = smooth(&samples, self.parameters.smoothing_window);
        }

        Ok(CalibratedWaveform {
            samples,
            start_cell: raw.start_cell,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RingBufferCalibrator;
    use assert_approx_eq::assert_approx_eq;
    use std::num::NonZeroUsize;

    const RING: usize = 16;

    /// Cell `c` of channel 0 has pedestal `100 + c`, cell 5 of channel 0 responds at half gain.
    fn table() -> WaveformCalibrationTable {
        let ring = NonZeroUsize::new(RING).unwrap();
        let mut calibrator = RingBufferCalibrator::new(2, ring);
        for start in 0..RING as i64 {
            for channel in 0..2 {
                let samples = (0..RING as i64)
                    .map(|i| 100 + physical_cell(start, i, ring) as i16)
                    .collect();
                calibrator
                    .accumulate(
                        CalibrationStage::Baseline,
                        channel,
                        &RawWaveform::new(samples, start as i32, false),
                    )
                    .unwrap();
            }
        }
        calibrator.finalize(CalibrationStage::Baseline).unwrap();
        for start in 0..RING as i64 {
            let samples = (0..RING as i64)
                .map(|i| {
                    let cell = physical_cell(start, i, ring);
                    100 + cell as i16 + if cell == 5 { 20 } else { 40 }
                })
                .collect();
            calibrator
                .accumulate(
                    CalibrationStage::Gain,
                    0,
                    &RawWaveform::new(samples, start as i32, false),
                )
                .unwrap();
        }
        calibrator.finalize(CalibrationStage::Gain).unwrap();
        calibrator.finish()
    }

    #[test]
    fn unfinalized_baseline_is_rejected() {
        let table = WaveformCalibrationTable::new(1, NonZeroUsize::new(RING).unwrap());
        let parameters = CalibrationParameters::default();
        assert!(matches!(
            WaveformCalibrationApplier::new(&table, &parameters),
            Err(CalibrationError::StageNotFinalized(CalibrationStage::Baseline))
        ));
    }

    #[test]
    fn pedestal_is_subtracted_per_physical_cell() {
        let table = table();
        let parameters = CalibrationParameters::default();
        let applier = WaveformCalibrationApplier::new(&table, &parameters).unwrap();
        let mut history = applier.new_history();
        let ring = NonZeroUsize::new(RING).unwrap();

        let raw = RawWaveform::new(
            (0..10)
                .map(|i| 100 + physical_cell(12, i, ring) as i16)
                .collect(),
            12,
            false,
        );
        let calibrated = applier.calibrate(1, &raw, &mut history).unwrap();
        assert_eq!(calibrated.start_cell, 12);
        for value in calibrated.samples {
            assert_approx_eq!(value, 0.0);
        }
        assert_eq!(history.iter().collect::<Vec<_>>(), vec![12]);
    }

    #[test]
    fn gain_is_normalised_except_for_reference_channels() {
        let table = table();
        let raw = RawWaveform::new(vec![100 + 5 + 20, 100 + 6 + 40], 5, false);
        // Mean gain is (20 + 15 * 40) / 16 = 38.75.
        let parameters = CalibrationParameters::default();
        let applier = WaveformCalibrationApplier::new(&table, &parameters).unwrap();
        let calibrated = applier
            .calibrate(0, &raw, &mut applier.new_history())
            .unwrap();
        assert_approx_eq!(calibrated.samples[0], 38.75);
        assert_approx_eq!(calibrated.samples[1], 38.75);

        let parameters = CalibrationParameters {
            reference_channels: vec![0],
            ..Default::default()
        };
        let applier = WaveformCalibrationApplier::new(&table, &parameters).unwrap();
        let calibrated = applier
            .calibrate(0, &raw, &mut applier.new_history())
            .unwrap();
        assert_approx_eq!(calibrated.samples[0], 20.0);
        assert_approx_eq!(calibrated.samples[1], 40.0);
    }

    #[test]
    fn history_lowers_spike_threshold_at_previous_start_cells() {
        let table = table();
        let ring = NonZeroUsize::new(RING).unwrap();
        let parameters = CalibrationParameters {
            spike_removal: SpikeRemoval::History,
            ..Default::default()
        };
        let applier = WaveformCalibrationApplier::new(&table, &parameters).unwrap();
        let mut history = applier.new_history();
        history.push(7);

        // Small spikes on channel 1 at positions 3 (cell 7) and 6 (cell 10).
        let raw = RawWaveform::new(
            (0..10)
                .map(|i| {
                    let spike = if i == 3 || i == 6 { 15 } else { 0 };
                    100 + physical_cell(4, i, ring) as i16 + spike
                })
                .collect(),
            4,
            false,
        );
        let calibrated = applier.calibrate(1, &raw, &mut history).unwrap();
        assert_approx_eq!(calibrated.samples[3], 0.0);
        assert_approx_eq!(calibrated.samples[6], 15.0);
        assert_eq!(history.iter().collect::<Vec<_>>(), vec![4, 7]);
    }

    #[test]
    fn rejects_unknown_channels_and_long_waveforms() {
        let table = table();
        let parameters = CalibrationParameters::default();
        let applier = WaveformCalibrationApplier::new(&table, &parameters).unwrap();
        let mut history = applier.new_history();
        assert!(matches!(
            applier.calibrate(2, &RawWaveform::new(vec![0; 4], 0, false), &mut history),
            Err(CalibrationError::ChannelOutOfRange { .. })
        ));
        assert!(matches!(
            applier.calibrate(0, &RawWaveform::new(vec![0; RING + 1], 0, false), &mut history),
            Err(CalibrationError::WaveformTooLong { .. })
        ));
        assert!(history.is_empty());
    }
}
