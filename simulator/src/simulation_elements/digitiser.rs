use super::{
    noise::{Noise, NoiseSource},
    utils::{FloatRandomDistribution, JsonValueError, NumConstant},
};
use cherenkov_common::{RawSample, RawWaveform};
use drs_calibration::ring_address::{logical_position, physical_cell};
use ndarray::Array2;
use rand::Rng;
use serde::Deserialize;
use std::num::NonZeroUsize;
use tracing::{debug, instrument};

/// The imperfections of a switched-capacitor-array digitiser.
///
/// Per-cell quantities are drawn once, when the digitiser is built, and stay fixed for all
/// events simulated with it.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct DigitiserTemplate {
    /// Pedestal of each physical cell.
    pedestal: FloatRandomDistribution,
    /// Response of each physical cell to one unit of light.
    gain: FloatRandomDistribution,
    /// Added on even clock phases and subtracted on odd ones.
    ab_offset: NumConstant<f64>,
    /// Offset of each position of the read-out window.
    trigger_offset: FloatRandomDistribution,
    /// How late each physical cell samples, in samples.
    cell_delay: FloatRandomDistribution,
    /// Height of the double spike where the previous event's start cell is read out.
    spike_height: NumConstant<f64>,
    noise: NoiseSource,
    saturation_limit: NumConstant<RawSample>,
    lo_gain: Option<LoGainTemplate>,
}

/// The attenuated, delayed copy of the signal recorded after the high-gain samples.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct LoGainTemplate {
    ratio: NumConstant<f64>,
    delay: NumConstant<f64>,
}

#[derive(Debug, Clone, Copy)]
struct LoGain {
    ratio: f64,
    delay: f64,
}

pub(crate) struct Digitiser<'a> {
    ring_size: NonZeroUsize,
    num_hi_samples: usize,
    num_lo_samples: usize,
    /// `[channel, cell]`
    pedestals: Array2<f64>,
    /// `[channel, cell]`
    gains: Array2<f64>,
    /// `[channel, position]`
    trigger_offsets: Array2<f64>,
    cell_delays: Vec<f64>,
    ab_offset: f64,
    spike_height: f64,
    saturation_limit: RawSample,
    lo_gain: Option<LoGain>,
    noise: &'a NoiseSource,
}

fn draw(
    distribution: &FloatRandomDistribution,
    shape: (usize, usize),
    rng: &mut impl Rng,
) -> Result<Array2<f64>, JsonValueError> {
    let values = (0..shape.0 * shape.1)
        .map(|_| distribution.sample(rng, 0))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Array2::from_shape_vec(shape, values).unwrap_or_else(|_| Array2::zeros(shape)))
}

impl<'a> Digitiser<'a> {
    #[instrument(skip_all, level = "debug", err(level = "error"))]
    pub(crate) fn new(
        template: &'a DigitiserTemplate,
        num_channels: usize,
        ring_size: NonZeroUsize,
        num_hi_samples: usize,
        num_lo_samples: usize,
        rng: &mut impl Rng,
    ) -> Result<Self, JsonValueError> {
        let num_samples = num_hi_samples + num_lo_samples;
        let cells = (num_channels, ring_size.get());
        let digitiser = Self {
            ring_size,
            num_hi_samples,
            num_lo_samples,
            pedestals: draw(&template.pedestal, cells, rng)?,
            gains: draw(&template.gain, cells, rng)?,
            trigger_offsets: draw(&template.trigger_offset, (num_channels, num_samples), rng)?,
            cell_delays: (0..ring_size.get())
                .map(|_| template.cell_delay.sample(rng, 0))
                .collect::<Result<_, _>>()?,
            ab_offset: template.ab_offset.value()?,
            spike_height: template.spike_height.value()?,
            saturation_limit: template.saturation_limit.value()?,
            lo_gain: template
                .lo_gain
                .as_ref()
                .map(|lo_gain| {
                    Ok::<_, JsonValueError>(LoGain {
                        ratio: lo_gain.ratio.value()?,
                        delay: lo_gain.delay.value()?,
                    })
                })
                .transpose()?,
            noise: &template.noise,
        };
        debug!(
            "Built digitiser of {num_channels} channels and {} cells",
            ring_size.get()
        );
        Ok(digitiser)
    }

    pub(crate) fn ring_size(&self) -> NonZeroUsize {
        self.ring_size
    }

    pub(crate) fn num_channels(&self) -> usize {
        self.pedestals.nrows()
    }

    pub(crate) fn pedestal(&self, channel: usize, cell: usize) -> f64 {
        self.pedestals.get((channel, cell)).copied().unwrap_or_default()
    }

    pub(crate) fn gain(&self, channel: usize, cell: usize) -> f64 {
        self.gains.get((channel, cell)).copied().unwrap_or_default()
    }

    pub(crate) fn cell_delay(&self, cell: usize) -> f64 {
        self.cell_delays.get(cell).copied().unwrap_or_default()
    }

    /// Reads out one channel of one event.
    /// # Parameters
    /// - signal: the light reaching the channel, as a function of the time since the start of
    ///   the read-out.
    /// - previous_start: start cell of the channel's previous event, whose cells carry a spike.
    pub(crate) fn read_out(
        &self,
        channel: usize,
        start_cell: i32,
        ab_flag: bool,
        previous_start: Option<i32>,
        signal: impl Fn(f64) -> f64,
        rng: &mut impl Rng,
        event_index: usize,
    ) -> Result<RawWaveform, JsonValueError> {
        let start = i64::from(start_cell);
        let spike = previous_start
            .map(|previous| logical_position(start, previous.into(), self.ring_size));
        let mut noise = Noise::new(self.noise)?;
        let samples = (0..self.num_hi_samples + self.num_lo_samples)
            .map(|i| {
                let cell = physical_cell(start, i as i64, self.ring_size);
                let time = i as f64 - self.cell_delay(cell);
                let light = if i < self.num_hi_samples {
                    signal(time)
                } else {
                    self.lo_gain
                        .map(|LoGain { ratio, delay }| {
                            ratio * signal(time - self.num_hi_samples as f64 - delay)
                        })
                        .unwrap_or_default()
                };
                let ab_sign = if (i + usize::from(ab_flag)) % 2 == 0 {
                    1.0
                } else {
                    -1.0
                };
                let mut value = self.pedestal(channel, cell)
                    + self.gain(channel, cell) * light
                    + self
                        .trigger_offsets
                        .get((channel, i))
                        .copied()
                        .unwrap_or_default()
                    + ab_sign * self.ab_offset;
                if spike.is_some_and(|position| i == position || i == position + 1) {
                    value += self.spike_height;
                }
                let value = noise.noisify(value, rng, event_index)?;
                Ok(value.round().clamp(0.0, f64::from(self.saturation_limit)) as RawSample)
            })
            .collect::<Result<Vec<_>, JsonValueError>>()?;
        Ok(RawWaveform::new(samples, start_cell, ab_flag))
    }
}
