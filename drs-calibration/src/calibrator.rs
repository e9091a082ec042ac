//! Builds a [WaveformCalibrationTable] from calibration-run waveforms.
use crate::{
    CalibrationError, CalibrationStage, TimeOffsetTable, WaveformCalibrationTable,
    ring_address::cells,
};
use cherenkov_common::{Channel, RawWaveform, Real};
use ndarray::{Array2, Axis};
use std::num::NonZeroUsize;
use tracing::{debug, info};

/// Running sums of one stage.
#[derive(Debug, Clone)]
struct StageAccumulator {
    sums: Array2<Real>,
    counts: Array2<u64>,
    /// Number of waveforms added.
    events: u64,
}

impl StageAccumulator {
    fn new(num_channels: usize, ring_size: NonZeroUsize) -> Self {
        Self {
            sums: Array2::zeros((num_channels, ring_size.get())),
            counts: Array2::zeros((num_channels, ring_size.get())),
            events: 0,
        }
    }

    fn add(&mut self, channel: Channel, index: usize, value: Real) {
        if let (Some(sum), Some(count)) = (
            self.sums.get_mut((channel, index)),
            self.counts.get_mut((channel, index)),
        ) {
            *sum += value;
            *count += 1;
        }
    }

    /// Divides every sum by its count. Entries which were never accumulated are left at zero.
    fn means(&self, stage: CalibrationStage) -> Result<Array2<Real>, CalibrationError> {
        let mut means = Array2::zeros(self.sums.raw_dim());
        for (((channel, cell), mean), (&sum, &count)) in means
            .indexed_iter_mut()
            .zip(self.sums.iter().zip(self.counts.iter()))
        {
            if count == 0 {
                continue;
            }
            let value = sum / count as Real;
            if !value.is_finite() {
                return Err(CalibrationError::NonFiniteCorrection {
                    stage,
                    channel,
                    cell,
                });
            }
            *mean = value;
        }
        Ok(means)
    }
}

/// Three-stage accumulator of ring-buffer corrections.
///
/// Waveforms of a baseline run are accumulated and finalized first; only then may the gain
/// and trigger-offset stages accumulate, because both subtract the finalized baseline.
#[derive(Debug, Clone)]
pub struct RingBufferCalibrator {
    table: WaveformCalibrationTable,
    baseline: StageAccumulator,
    gain: StageAccumulator,
    trigger_offset: StageAccumulator,
    /// Raw sums of the baseline run split by clock parity, `[channel, parity]`.
    parity_sums: Array2<Real>,
    parity_counts: Array2<u64>,
    /// Sums of the clock-parity sign seen by each cell during the baseline run, `[channel, cell]`.
    parity_signs: Array2<Real>,
}

impl RingBufferCalibrator {
    pub fn new(num_channels: usize, ring_size: NonZeroUsize) -> Self {
        Self {
            table: WaveformCalibrationTable::new(num_channels, ring_size),
            baseline: StageAccumulator::new(num_channels, ring_size),
            gain: StageAccumulator::new(num_channels, ring_size),
            trigger_offset: StageAccumulator::new(num_channels, ring_size),
            parity_sums: Array2::zeros((num_channels, 2)),
            parity_counts: Array2::zeros((num_channels, 2)),
            parity_signs: Array2::zeros((num_channels, ring_size.get())),
        }
    }

    /// The table under construction.
    pub fn table(&self) -> &WaveformCalibrationTable {
        &self.table
    }

    fn accumulator(&self, stage: CalibrationStage) -> &StageAccumulator {
        match stage {
            CalibrationStage::Baseline => &self.baseline,
            CalibrationStage::Gain => &self.gain,
            CalibrationStage::TriggerOffset => &self.trigger_offset,
        }
    }

    fn check_prerequisite(&self, stage: CalibrationStage) -> Result<(), CalibrationError> {
        match stage.prerequisite() {
            Some(requires) if !self.table.is_finalized(requires) => {
                Err(CalibrationError::PrerequisiteNotFinalized { stage, requires })
            }
            _ => Ok(()),
        }
    }

    /// Adds one calibration-run waveform of `channel` to `stage`.
    /// # Parameters
    /// - stage: the stage being accumulated, its prerequisite must already be finalized.
    /// - channel: the channel which recorded the waveform.
    /// - waveform: raw samples and start cell of the event.
    #[tracing::instrument(skip_all, level = "trace", fields(%stage, channel = channel, start_cell = waveform.start_cell))]
    pub fn accumulate(
        &mut self,
        stage: CalibrationStage,
        channel: Channel,
        waveform: &RawWaveform,
    ) -> Result<(), CalibrationError> {
        self.table.check_channel(channel)?;
        if self.table.is_finalized(stage) {
            return Err(CalibrationError::StageAlreadyFinalized(stage));
        }
        self.check_prerequisite(stage)?;

        let ring_size = self.table.ring_size();
        if waveform.len() > ring_size.get() {
            return Err(CalibrationError::WaveformTooLong {
                len: waveform.len(),
                ring_size: ring_size.get(),
            });
        }

        let ab = waveform.ab_parity();
        let visited = cells(waveform.start_cell.into(), waveform.len(), ring_size);
        for (i, (cell, &raw)) in visited.zip(&waveform.samples).enumerate() {
            let raw = Real::from(raw);
            match stage {
                CalibrationStage::Baseline => {
                    self.baseline.add(channel, cell, raw);
                    let parity = (i + ab) % 2;
                    if let (Some(sum), Some(count)) = (
                        self.parity_sums.get_mut((channel, parity)),
                        self.parity_counts.get_mut((channel, parity)),
                    ) {
                        *sum += raw;
                        *count += 1;
                    }
                    if let Some(sign) = self.parity_signs.get_mut((channel, cell)) {
                        *sign += if parity == 0 { 1.0 } else { -1.0 };
                    }
                }
                CalibrationStage::Gain => {
                    let value = raw - self.table.pedestal(channel, cell, i, ab);
                    self.gain.add(channel, cell, value);
                }
                CalibrationStage::TriggerOffset => {
                    let value = raw - self.table.pedestal(channel, cell, i, ab);
                    self.trigger_offset.add(channel, i, value);
                }
            }
        }
        match stage {
            CalibrationStage::Baseline => self.baseline.events += 1,
            CalibrationStage::Gain => self.gain.events += 1,
            CalibrationStage::TriggerOffset => self.trigger_offset.events += 1,
        }
        Ok(())
    }

    /// Turns the running sums of `stage` into the stage's corrections.
    ///
    /// Nothing is written to the table unless every correction is finite.
    #[tracing::instrument(skip_all, fields(%stage, events))]
    pub fn finalize(&mut self, stage: CalibrationStage) -> Result<(), CalibrationError> {
        if self.table.is_finalized(stage) {
            return Err(CalibrationError::StageAlreadyFinalized(stage));
        }
        self.check_prerequisite(stage)?;

        let accumulator = self.accumulator(stage);
        tracing::Span::current().record("events", accumulator.events);
        if accumulator.events == 0 {
            return Err(CalibrationError::NoEventsAccumulated(stage));
        }
        let events = accumulator.events;
        let mut values = accumulator.means(stage)?;

        match stage {
            CalibrationStage::Baseline => {
                let ab_offsets = self.ab_offsets()?;
                debug!("AB offsets: {ab_offsets:?}");
                self.remove_clock_offset(&mut values, &ab_offsets);
                self.table.set_ab_offsets(ab_offsets);
            }
            CalibrationStage::Gain => {
                let mean_gains = self.mean_gains(&values);
                debug!("Mean gains: {mean_gains:?}");
                self.table.set_mean_gains(mean_gains);
            }
            CalibrationStage::TriggerOffset => {}
        }
        self.table.install_stage(stage, values, events);
        info!("Finalized {stage} stage from {events} waveforms");
        Ok(())
    }

    fn ab_offsets(&self) -> Result<Vec<Real>, CalibrationError> {
        self.parity_sums
            .axis_iter(Axis(0))
            .zip(self.parity_counts.axis_iter(Axis(0)))
            .enumerate()
            .map(|(channel, (sums, counts))| {
                let mean = |parity: usize| -> Option<Real> {
                    let count = *counts.get(parity)?;
                    (count > 0).then(|| sums.get(parity).copied().unwrap_or_default() / count as Real)
                };
                let offset = Option::zip(mean(0), mean(1))
                    .map(|(even, odd)| (even - odd) / 2.0)
                    .unwrap_or_default();
                if offset.is_finite() {
                    Ok(offset)
                } else {
                    Err(CalibrationError::NonFiniteCorrection {
                        stage: CalibrationStage::Baseline,
                        channel,
                        cell: 0,
                    })
                }
            })
            .collect()
    }

    /// Takes out of each cell's mean the clock offset it saw on average, which is not zero when
    /// clock parity and start cell are correlated.
    fn remove_clock_offset(&self, baseline: &mut Array2<Real>, ab_offsets: &[Real]) {
        for (((channel, _), value), (&sign, &count)) in baseline
            .indexed_iter_mut()
            .zip(self.parity_signs.iter().zip(self.baseline.counts.iter()))
        {
            if count > 0 {
                let ab = ab_offsets.get(channel).copied().unwrap_or_default();
                *value -= ab * sign / count as Real;
            }
        }
    }

    /// Mean gain of each channel over the cells which saw a gain signal.
    fn mean_gains(&self, gains: &Array2<Real>) -> Vec<Real> {
        gains
            .axis_iter(Axis(0))
            .zip(self.gain.counts.axis_iter(Axis(0)))
            .map(|(gains, counts)| {
                let (sum, num) = gains
                    .iter()
                    .zip(counts.iter())
                    .filter(|&(_, &count)| count > 0)
                    .fold((0.0, 0usize), |(sum, num), (&gain, _)| (sum + gain, num + 1));
                if num == 0 { 0.0 } else { sum / num as Real }
            })
            .collect()
    }

    /// Attaches the result of a [TimeCalibrator](crate::TimeCalibrator) to the table.
    pub fn attach_time_offsets(
        &mut self,
        time_offsets: TimeOffsetTable,
    ) -> Result<(), CalibrationError> {
        if time_offsets.ring_size() != self.table.ring_size() {
            return Err(CalibrationError::RingSizeMismatch {
                expected: self.table.ring_size().get(),
                found: time_offsets.ring_size().get(),
            });
        }
        self.table.set_time_offsets(time_offsets);
        Ok(())
    }

    /// Ends the build phase and hands out the finished, read-only table.
    pub fn finish(self) -> WaveformCalibrationTable {
        self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring_address::physical_cell;
    use assert_approx_eq::assert_approx_eq;

    const RING: usize = 8;

    fn calibrator() -> RingBufferCalibrator {
        RingBufferCalibrator::new(2, NonZeroUsize::new(RING).unwrap())
    }

    #[test]
    fn gain_before_baseline_is_rejected() {
        let mut calibrator = calibrator();
        let waveform = RawWaveform::new(vec![100; 4], 0, false);
        assert!(matches!(
            calibrator.accumulate(CalibrationStage::Gain, 0, &waveform),
            Err(CalibrationError::PrerequisiteNotFinalized {
                stage: CalibrationStage::Gain,
                requires: CalibrationStage::Baseline
            })
        ));
        assert!(matches!(
            calibrator.accumulate(CalibrationStage::TriggerOffset, 0, &waveform),
            Err(CalibrationError::PrerequisiteNotFinalized { .. })
        ));
        assert!(matches!(
            calibrator.finalize(CalibrationStage::Gain),
            Err(CalibrationError::PrerequisiteNotFinalized { .. })
        ));
        assert!(!calibrator.table().is_finalized(CalibrationStage::Gain));
    }

    #[test]
    fn baseline_is_addressed_by_physical_cell() {
        let mut calibrator = calibrator();
        // Cell c always holds 10*c, whatever the start cell.
        for start in [0, 3, 6] {
            let samples = (0..RING as i64)
                .map(|i| (10 * physical_cell(start, i, NonZeroUsize::new(RING).unwrap())) as i16)
                .collect();
            calibrator
                .accumulate(
                    CalibrationStage::Baseline,
                    1,
                    &RawWaveform::new(samples, start as i32, false),
                )
                .unwrap();
        }
        calibrator.finalize(CalibrationStage::Baseline).unwrap();
        let table = calibrator.finish();
        assert_eq!(table.reference_count(CalibrationStage::Baseline), 3);
        for cell in 0..RING {
            assert_approx_eq!(table.baseline(1, cell), 10.0 * cell as Real);
            assert_eq!(table.baseline(0, cell), 0.0);
        }
    }

    #[test]
    fn cells_without_entries_stay_zero() {
        let mut calibrator = calibrator();
        calibrator
            .accumulate(
                CalibrationStage::Baseline,
                0,
                &RawWaveform::new(vec![50, 52], 6, false),
            )
            .unwrap();
        calibrator.finalize(CalibrationStage::Baseline).unwrap();
        let table = calibrator.table();
        assert_approx_eq!(table.baseline(0, 6), 50.0);
        assert_approx_eq!(table.baseline(0, 7), 52.0);
        for cell in 0..6 {
            assert_eq!(table.baseline(0, cell), 0.0);
            assert!(table.baseline(0, cell).is_finite());
        }
    }

    #[test]
    fn empty_stage_cannot_be_finalized() {
        let mut calibrator = calibrator();
        assert!(matches!(
            calibrator.finalize(CalibrationStage::Baseline),
            Err(CalibrationError::NoEventsAccumulated(CalibrationStage::Baseline))
        ));
        assert!(!calibrator.table().is_finalized(CalibrationStage::Baseline));
    }

    #[test]
    fn finalized_stage_is_closed() {
        let mut calibrator = calibrator();
        let waveform = RawWaveform::new(vec![1; RING], 0, false);
        calibrator
            .accumulate(CalibrationStage::Baseline, 0, &waveform)
            .unwrap();
        calibrator.finalize(CalibrationStage::Baseline).unwrap();
        assert!(matches!(
            calibrator.accumulate(CalibrationStage::Baseline, 0, &waveform),
            Err(CalibrationError::StageAlreadyFinalized(CalibrationStage::Baseline))
        ));
        assert!(matches!(
            calibrator.finalize(CalibrationStage::Baseline),
            Err(CalibrationError::StageAlreadyFinalized(CalibrationStage::Baseline))
        ));
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let mut calibrator = calibrator();
        assert!(matches!(
            calibrator.accumulate(
                CalibrationStage::Baseline,
                2,
                &RawWaveform::new(vec![0; 4], 0, false)
            ),
            Err(CalibrationError::ChannelOutOfRange { channel: 2, .. })
        ));
        assert!(matches!(
            calibrator.accumulate(
                CalibrationStage::Baseline,
                0,
                &RawWaveform::new(vec![0; RING + 1], 0, false)
            ),
            Err(CalibrationError::WaveformTooLong { .. })
        ));
    }

    #[test]
    fn ab_offset_is_learned_from_clock_parity() {
        let mut calibrator = calibrator();
        for (start, ab) in [(0, false), (1, true), (5, false), (2, true)] {
            let samples = (0..RING)
                .map(|i| if (i + usize::from(ab)) % 2 == 0 { 103 } else { 97 })
                .collect();
            calibrator
                .accumulate(
                    CalibrationStage::Baseline,
                    0,
                    &RawWaveform::new(samples, start, ab),
                )
                .unwrap();
        }
        calibrator.finalize(CalibrationStage::Baseline).unwrap();
        assert_approx_eq!(calibrator.table().ab_offset(0), 3.0);
        assert_eq!(calibrator.table().ab_offset(1), 0.0);
    }

    #[test]
    fn clock_offset_correlated_with_start_cell_is_not_counted_twice() {
        let mut calibrator = calibrator();
        // Odd start cells always come with the odd clock phase, so even cells read 103 and odd
        // cells 97 in every event.
        for start in 0..RING as i32 {
            let ab = start % 2 == 1;
            let samples = (0..RING)
                .map(|i| if (i + usize::from(ab)) % 2 == 0 { 103 } else { 97 })
                .collect();
            calibrator
                .accumulate(
                    CalibrationStage::Baseline,
                    0,
                    &RawWaveform::new(samples, start, ab),
                )
                .unwrap();
        }
        calibrator.finalize(CalibrationStage::Baseline).unwrap();
        let table = calibrator.finish();
        assert_approx_eq!(table.ab_offset(0), 3.0);
        for cell in 0..RING {
            assert_approx_eq!(table.baseline(0, cell), 100.0);
        }
        for start in [0, 3] {
            let ab = start % 2 == 1;
            for i in 0..4 {
                let cell = physical_cell(start, i as i64, NonZeroUsize::new(RING).unwrap());
                let expected = if cell % 2 == 0 { 103.0 } else { 97.0 };
                assert_approx_eq!(table.pedestal(0, cell, i, usize::from(ab)), expected);
            }
        }
    }

    #[test]
    fn gain_and_trigger_offset_subtract_baseline() {
        let mut calibrator = calibrator();
        let ring = NonZeroUsize::new(RING).unwrap();
        for start in 0..RING as i32 {
            calibrator
                .accumulate(
                    CalibrationStage::Baseline,
                    0,
                    &RawWaveform::new(vec![100; RING], start, false),
                )
                .unwrap();
        }
        calibrator.finalize(CalibrationStage::Baseline).unwrap();

        // Cell 3 responds twice as strongly as the others.
        for start in 0..RING as i64 {
            let samples = (0..RING as i64)
                .map(|i| if physical_cell(start, i, ring) == 3 { 140 } else { 120 })
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

        // Position 0 of the read-out window sits 4 counts high.
        for start in [1, 4, 7] {
            let mut samples = vec![100; 4];
            samples[0] = 104;
            calibrator
                .accumulate(
                    CalibrationStage::TriggerOffset,
                    0,
                    &RawWaveform::new(samples, start, false),
                )
                .unwrap();
        }
        calibrator.finalize(CalibrationStage::TriggerOffset).unwrap();

        let table = calibrator.finish();
        assert_approx_eq!(table.correction(CalibrationStage::Gain, 0, 3), 40.0);
        assert_approx_eq!(table.correction(CalibrationStage::Gain, 0, 4), 20.0);
        assert_approx_eq!(table.gain_factor(0, 3), 22.5 / 40.0);
        assert_approx_eq!(table.gain_factor(0, 4), 22.5 / 20.0);
        assert_approx_eq!(table.trigger_offset(0, 0), 4.0);
        assert_approx_eq!(table.trigger_offset(0, 1), 0.0);
        assert_eq!(table.trigger_offset(0, 5), 0.0);
    }
}
