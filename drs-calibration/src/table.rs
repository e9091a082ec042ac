//! The per-channel, per-cell corrections learned from calibration runs.
use crate::{CalibrationError, TimeOffsetTable, ring_address::cells};
use cherenkov_common::{CellIndex, Channel, Real};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use strum::{Display, EnumIter};

/// The three ordered stages of a ring-buffer calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum CalibrationStage {
    /// Pedestal of each physical cell, addressed relative to each event's start cell.
    Baseline,
    /// Response of each physical cell to a known signal, after baseline subtraction.
    Gain,
    /// Residual offset at each absolute position of the read-out window, after baseline subtraction.
    TriggerOffset,
}

impl CalibrationStage {
    /// The stage which must be finalized before this one may accumulate.
    pub fn prerequisite(self) -> Option<CalibrationStage> {
        match self {
            Self::Baseline => None,
            Self::Gain | Self::TriggerOffset => Some(Self::Baseline),
        }
    }
}

/// The corrections of one stage, for every channel and cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct StageCorrection {
    values: Array2<Real>,
    /// Number of waveforms the stage was averaged over.
    reference_count: u64,
    finalized: bool,
}

impl StageCorrection {
    fn new(num_channels: usize, ring_size: NonZeroUsize) -> Self {
        Self {
            values: Array2::zeros((num_channels, ring_size.get())),
            reference_count: 0,
            finalized: false,
        }
    }

    fn get(&self, channel: Channel, index: usize) -> Real {
        if self.finalized {
            self.values.get((channel, index)).copied().unwrap_or_default()
        } else {
            Real::default()
        }
    }
}

/// Learned corrections of a ring-buffer digitiser.
///
/// A stage which has not been finalized contributes a zero correction. Once built, the table
/// is only ever read, see [RingBufferCalibrator::finish](crate::RingBufferCalibrator::finish).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WaveformCalibrationTable {
    num_channels: usize,
    ring_size: NonZeroUsize,
    baseline: StageCorrection,
    gain: StageCorrection,
    trigger_offset: StageCorrection,
    /// Half the difference between even and odd clock-parity pedestals, per channel.
    ab_offsets: Vec<Real>,
    /// Mean of the finalized gain over all cells, per channel.
    mean_gains: Vec<Real>,
    time_offsets: Option<TimeOffsetTable>,
}

impl WaveformCalibrationTable {
    /// Creates an empty table, in which no stage is finalized.
    pub fn new(num_channels: usize, ring_size: NonZeroUsize) -> Self {
        Self {
            num_channels,
            ring_size,
            baseline: StageCorrection::new(num_channels, ring_size),
            gain: StageCorrection::new(num_channels, ring_size),
            trigger_offset: StageCorrection::new(num_channels, ring_size),
            ab_offsets: vec![Real::default(); num_channels],
            mean_gains: vec![Real::default(); num_channels],
            time_offsets: None,
        }
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn ring_size(&self) -> NonZeroUsize {
        self.ring_size
    }

    fn stage(&self, stage: CalibrationStage) -> &StageCorrection {
        match stage {
            CalibrationStage::Baseline => &self.baseline,
            CalibrationStage::Gain => &self.gain,
            CalibrationStage::TriggerOffset => &self.trigger_offset,
        }
    }

    pub fn is_finalized(&self, stage: CalibrationStage) -> bool {
        self.stage(stage).finalized
    }

    /// The number of waveforms the stage was averaged over, zero if not finalized.
    pub fn reference_count(&self, stage: CalibrationStage) -> u64 {
        self.stage(stage).reference_count
    }

    /// Fails unless `channel` has an entry in this table.
    pub fn check_channel(&self, channel: Channel) -> Result<(), CalibrationError> {
        if channel < self.num_channels {
            Ok(())
        } else {
            Err(CalibrationError::ChannelOutOfRange {
                channel,
                num_channels: self.num_channels,
            })
        }
    }

    /// The raw correction of `stage` at `index`, a physical cell for the baseline and gain stages
    /// and a sample index for the trigger-offset stage.
    pub fn correction(&self, stage: CalibrationStage, channel: Channel, index: usize) -> Real {
        self.stage(stage).get(channel, index)
    }

    pub fn baseline(&self, channel: Channel, cell: CellIndex) -> Real {
        self.correction(CalibrationStage::Baseline, channel, cell)
    }

    pub fn ab_offset(&self, channel: Channel) -> Real {
        self.ab_offsets.get(channel).copied().unwrap_or_default()
    }

    /// The additive pedestal of sample `sample_index`, stored in `cell`, including the
    /// alternating clock offset.
    pub fn pedestal(
        &self,
        channel: Channel,
        cell: CellIndex,
        sample_index: usize,
        ab_parity: usize,
    ) -> Real {
        let sign = if (sample_index + ab_parity) % 2 == 0 {
            1.0
        } else {
            -1.0
        };
        self.baseline(channel, cell) + sign * self.ab_offset(channel)
    }

    /// Factor normalising the response of `cell` to the mean response of the channel.
    ///
    /// This is one when the gain stage is not finalized, or when the cell never saw a gain signal.
    pub fn gain_factor(&self, channel: Channel, cell: CellIndex) -> Real {
        let gain = self.correction(CalibrationStage::Gain, channel, cell);
        let mean = self.mean_gains.get(channel).copied().unwrap_or_default();
        if gain == 0.0 || mean == 0.0 {
            1.0
        } else {
            mean / gain
        }
    }

    /// The trigger-offset correction at absolute position `sample_index` of the read-out window.
    pub fn trigger_offset(&self, channel: Channel, sample_index: usize) -> Real {
        self.correction(CalibrationStage::TriggerOffset, channel, sample_index)
    }

    /// The trigger-offset correction of an event.
    ///
    /// When `normalise` is set each sample's correction is scaled by the gain factor of its
    /// cell, matching waveforms whose gain has been normalised.
    pub fn trigger_offsets_for(
        &self,
        channel: Channel,
        start_cell: i32,
        len: usize,
        normalise: bool,
    ) -> Vec<Real> {
        cells(start_cell.into(), len, self.ring_size)
            .enumerate()
            .map(|(i, cell)| {
                let offset = self.trigger_offset(channel, i);
                if normalise {
                    offset * self.gain_factor(channel, cell)
                } else {
                    offset
                }
            })
            .collect()
    }

    pub fn time_offsets(&self) -> Option<&TimeOffsetTable> {
        self.time_offsets.as_ref()
    }

    pub(crate) fn install_stage(
        &mut self,
        stage: CalibrationStage,
        values: Array2<Real>,
        reference_count: u64,
    ) {
        let correction = match stage {
            CalibrationStage::Baseline => &mut self.baseline,
            CalibrationStage::Gain => &mut self.gain,
            CalibrationStage::TriggerOffset => &mut self.trigger_offset,
        };
        *correction = StageCorrection {
            values,
            reference_count,
            finalized: true,
        };
    }

    pub(crate) fn set_ab_offsets(&mut self, ab_offsets: Vec<Real>) {
        self.ab_offsets = ab_offsets;
    }

    pub(crate) fn set_mean_gains(&mut self, mean_gains: Vec<Real>) {
        self.mean_gains = mean_gains;
    }

    pub(crate) fn set_time_offsets(&mut self, time_offsets: TimeOffsetTable) {
        self.time_offsets = Some(time_offsets);
    }
}
