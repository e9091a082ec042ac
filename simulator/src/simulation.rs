use crate::simulation_elements::{
    digitiser::{Digitiser, DigitiserTemplate},
    pulses::{PulseEvent, PulseTemplate},
    utils::{JsonValueError, NumConstant},
};
use cherenkov_common::spanned::{SpanWrapper, Spanned};
use drs_calibration::{
    CalibrationError, CalibrationParameters, CalibrationStage, Polarity, RingBufferCalibrator,
    TimeCalibrator, WaveformCalibrationApplier, WaveformCalibrationTable,
};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use serde::{Deserialize, Serialize};
use signal_extraction::{
    BatchSummary, ConfigError, EventProcessor, ExtractionCoordinator, ExtractionParameters,
    RawEvent,
};
use std::{f64::consts::TAU, num::NonZeroUsize};
use thiserror::Error;
use tracing::{info, instrument};

///
/// This struct is created from the configuration JSON file.
///
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct Simulation {
    /// Number of physical cells of each channel's ring buffer.
    pub(crate) ring_size: NumConstant<usize>,
    pub(crate) num_channels: NumConstant<usize>,
    pub(crate) digitiser: DigitiserTemplate,
    pub(crate) calibration_runs: CalibrationRuns,
    /// Number of physics events to simulate.
    pub(crate) num_events: NumConstant<usize>,
    pub(crate) pulses: Vec<PulseTemplate>,
}

/// The runs from which the digitiser's calibration is learned.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct CalibrationRuns {
    pub(crate) baseline_events: NumConstant<usize>,
    pub(crate) gain_events: NumConstant<usize>,
    /// Uniform light level of the gain run.
    pub(crate) gain_signal: NumConstant<f64>,
    pub(crate) trigger_offset_events: NumConstant<usize>,
    pub(crate) marker_events: NumConstant<usize>,
    /// Period, in samples, of the sinusoidal time marker.
    pub(crate) marker_period: NumConstant<f64>,
    pub(crate) marker_amplitude: NumConstant<f64>,
}

#[derive(Debug, Error)]
pub(crate) enum SimulationError {
    #[error("Json value error: {0}")]
    JsonValue(#[from] JsonValueError),
    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),
    #[error("Extraction config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Ring size must be positive")]
    EmptyRing,
    #[error("No pulse templates are defined")]
    NoPulseTemplates,
    #[error("Marker period must be positive, got {0}")]
    MarkerPeriod(f64),
}

/// The light reaching every channel during one kind of run.
#[derive(Debug, Clone, Copy)]
enum Light<'a> {
    Dark,
    Uniform(f64),
    Marker { period: f64, amplitude: f64 },
    Pulses(&'a [PulseTemplate]),
}

/// What was injected into one channel of a physics event.
#[derive(Default, Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct PulseTruth {
    pub(crate) peak_time: f64,
    pub(crate) peak_height: f64,
}

pub(crate) struct SimulatedEvent {
    pub(crate) raw: RawEvent,
    pub(crate) truth: Vec<PulseTruth>,
}

/// Start cell and clock phase of one event.
#[derive(Debug, Clone, Copy)]
struct Trigger {
    event_number: u64,
    start_cell: i32,
    ab_flag: bool,
    previous_start: Option<i32>,
}

/// Agreement of extracted high-gain features with the injected pulses.
#[derive(Default, Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct Comparison {
    pub(crate) num_compared: usize,
    pub(crate) num_fallback: usize,
    /// Mean of extracted charge over injected height, near one for the amplitude policy.
    pub(crate) mean_charge_ratio: f64,
    /// Mean and spread of the extracted peak time, less the injected one.
    pub(crate) mean_peak_time_residual: f64,
    pub(crate) rms_peak_time_residual: f64,
}

impl Simulation {
    pub(crate) fn ring_size(&self) -> Result<NonZeroUsize, SimulationError> {
        NonZeroUsize::new(self.ring_size.value()?).ok_or(SimulationError::EmptyRing)
    }

    #[instrument(skip_all, level = "debug", err(level = "error"))]
    pub(crate) fn build_digitiser(
        &self,
        extraction: &ExtractionParameters,
        rng: &mut impl Rng,
    ) -> Result<Digitiser<'_>, SimulationError> {
        Ok(Digitiser::new(
            &self.digitiser,
            self.num_channels.value()?,
            self.ring_size()?,
            extraction.num_hi_samples,
            extraction.num_lo_samples,
            rng,
        )?)
    }

    /// Draws start cells and clock phases in event order, so that each event knows the start
    /// cell of its predecessor.
    fn triggers(ring_size: NonZeroUsize, num_events: usize, rng: &mut impl Rng) -> Vec<Trigger> {
        let mut previous_start = None;
        (0..num_events)
            .map(|event| {
                let start_cell = rng.random_range(0..ring_size.get()) as i32;
                let trigger = Trigger {
                    event_number: event as u64,
                    start_cell,
                    ab_flag: rng.random(),
                    previous_start,
                };
                previous_start = Some(start_cell);
                trigger
            })
            .collect()
    }

    /// Reads out every channel of one event.
    fn generate_event(
        digitiser: &Digitiser,
        trigger: Trigger,
        light: Light,
        rng: &mut StdRng,
    ) -> Result<SimulatedEvent, SimulationError> {
        let index = trigger.event_number as usize;
        let mut channels = Vec::with_capacity(digitiser.num_channels());
        let mut truth = Vec::with_capacity(digitiser.num_channels());
        for channel in 0..digitiser.num_channels() {
            let read_out = |signal: &dyn Fn(f64) -> f64, rng: &mut StdRng| {
                digitiser.read_out(
                    channel,
                    trigger.start_cell,
                    trigger.ab_flag,
                    trigger.previous_start,
                    signal,
                    rng,
                    index,
                )
            };
            let waveform = match light {
                Light::Dark => read_out(&|_| 0.0, rng)?,
                Light::Uniform(level) => read_out(&|_| level, rng)?,
                Light::Marker { period, amplitude } => {
                    let phase = rng.random_range(0.0..period);
                    read_out(&|t| amplitude * f64::sin(TAU * (t + phase) / period), rng)?
                }
                Light::Pulses(templates) => {
                    let template = templates
                        .get(rng.random_range(0..templates.len().max(1)))
                        .ok_or(SimulationError::NoPulseTemplates)?;
                    let pulse = PulseEvent::sample(template, rng, index)?;
                    truth.push(PulseTruth {
                        peak_time: pulse.time(),
                        peak_height: pulse.intensity(),
                    });
                    read_out(&|t| pulse.get_value_at(t), rng)?
                }
            };
            channels.push(waveform);
        }
        Ok(SimulatedEvent {
            raw: RawEvent {
                event_number: trigger.event_number,
                channels,
            },
            truth,
        })
    }

    /// Simulates `num_events` events, reading out the channels of different events in parallel.
    #[instrument(skip_all, level = "debug", fields(num_events = num_events), err(level = "error"))]
    fn generate_events(
        digitiser: &Digitiser,
        light: Light,
        num_events: usize,
        rng: &mut impl Rng,
    ) -> Result<Vec<SimulatedEvent>, SimulationError> {
        let seed: u64 = rng.random();
        Self::triggers(digitiser.ring_size(), num_events, rng)
            .into_iter()
            .map(SpanWrapper::new_with_current)
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(|span_wrapper| {
                let span = span_wrapper.span().clone();
                let trigger = span_wrapper.into_inner();
                span.in_scope(|| {
                    let mut rng = StdRng::seed_from_u64(
                        seed ^ trigger.event_number.wrapping_mul(0x9E37_79B9_7F4A_7C15),
                    );
                    Self::generate_event(digitiser, trigger, light, &mut rng)
                })
            })
            .collect()
    }

    /// Simulates the calibration runs and learns the digitiser's calibration from them.
    #[instrument(skip_all, err(level = "error"))]
    pub(crate) fn calibrate(
        &self,
        digitiser: &Digitiser,
        parameters: &CalibrationParameters,
        polarity: Polarity,
        rng: &mut impl Rng,
    ) -> Result<WaveformCalibrationTable, SimulationError> {
        parameters.validate()?;
        let runs = &self.calibration_runs;
        let num_channels = digitiser.num_channels();
        let mut calibrator = RingBufferCalibrator::new(num_channels, digitiser.ring_size());

        for (stage, num_events, light) in [
            (
                CalibrationStage::Baseline,
                runs.baseline_events.value()?,
                Light::Dark,
            ),
            (
                CalibrationStage::Gain,
                runs.gain_events.value()?,
                Light::Uniform(runs.gain_signal.value()?),
            ),
            (
                CalibrationStage::TriggerOffset,
                runs.trigger_offset_events.value()?,
                Light::Dark,
            ),
        ] {
            for event in Self::generate_events(digitiser, light, num_events, rng)? {
                for (channel, waveform) in event.raw.channels.iter().enumerate() {
                    calibrator.accumulate(stage, channel, waveform)?;
                }
            }
            calibrator.finalize(stage)?;
        }

        let num_rows = num_channels.div_ceil(parameters.channels_per_row);
        let mut time_calibrator = TimeCalibrator::new(num_rows, digitiser.ring_size());
        {
            let applier = WaveformCalibrationApplier::new(calibrator.table(), parameters)?;
            let marker_channels = (0..num_rows)
                .map(|row| {
                    let first = row * parameters.channels_per_row;
                    parameters
                        .reference_channels
                        .iter()
                        .copied()
                        .find(|&channel| channel / parameters.channels_per_row == row)
                        .unwrap_or(first)
                })
                .collect::<Vec<_>>();
            let mut histories = marker_channels
                .iter()
                .map(|_| applier.new_history())
                .collect::<Vec<_>>();
            let sign = match polarity {
                Polarity::Positive => 1.0,
                Polarity::Negative => -1.0,
            };
            let period = runs.marker_period.value()?;
            if !(period > 0.0) {
                return Err(SimulationError::MarkerPeriod(period));
            }
            let light = Light::Marker {
                period,
                amplitude: sign * runs.marker_amplitude.value()?,
            };
            for event in Self::generate_events(digitiser, light, runs.marker_events.value()?, rng)? {
                for (row, (&channel, history)) in
                    marker_channels.iter().zip(histories.iter_mut()).enumerate()
                {
                    let Some(waveform) = event.raw.channels.get(channel) else {
                        continue;
                    };
                    let calibrated = applier.calibrate(channel, waveform, history)?;
                    time_calibrator.accumulate(
                        row,
                        waveform.start_cell,
                        &calibrated.samples,
                        polarity,
                    )?;
                }
            }
        }
        calibrator.attach_time_offsets(time_calibrator.finalize(parameters.channels_per_row)?)?;
        Ok(calibrator.finish())
    }

    /// Simulates physics events and extracts them with `table`.
    #[instrument(skip_all, err(level = "error"))]
    pub(crate) fn process(
        &self,
        digitiser: &Digitiser,
        table: &WaveformCalibrationTable,
        calibration: &CalibrationParameters,
        extraction: ExtractionParameters,
        seed: u64,
        rng: &mut impl Rng,
    ) -> Result<(BatchSummary, Vec<Vec<PulseTruth>>), SimulationError> {
        if self.pulses.is_empty() {
            return Err(SimulationError::NoPulseTemplates);
        }
        let coordinator = ExtractionCoordinator::new(extraction)?;
        let events = Self::generate_events(
            digitiser,
            Light::Pulses(&self.pulses),
            self.num_events.value()?,
            rng,
        )?;
        let (raw, truth): (Vec<_>, Vec<_>) = events
            .into_iter()
            .map(|event| (event.raw, event.truth))
            .unzip();
        let mut processor = EventProcessor::new(table, calibration, &coordinator, seed)?;
        let summary = processor.process_events(&raw);
        Ok((summary, truth))
    }
}

/// Compares each channel's extracted high-gain features with the pulse injected into it.
pub(crate) fn compare(summary: &BatchSummary, truth: &[Vec<PulseTruth>]) -> Comparison {
    let mut comparison = Comparison::default();
    let mut ratio_sum = 0.0;
    let mut residuals = Vec::new();
    for event in &summary.events {
        let Some(injected) = truth.get(event.event_number as usize) else {
            continue;
        };
        for (result, injected) in event.channels.iter().zip(injected) {
            let (Some(charge), Some(arrival)) = (&result.signal.hi_gain, &result.time.hi_gain)
            else {
                continue;
            };
            if arrival.fallback {
                comparison.num_fallback += 1;
                continue;
            }
            let Some(slope) = arrival.slope else {
                continue;
            };
            comparison.num_compared += 1;
            if injected.peak_height != 0.0 {
                ratio_sum += charge.value / injected.peak_height;
            }
            residuals.push(arrival.time + slope - injected.peak_time);
        }
    }
    if comparison.num_compared > 0 {
        let n = comparison.num_compared as f64;
        comparison.mean_charge_ratio = ratio_sum / n;
        comparison.mean_peak_time_residual = residuals.iter().sum::<f64>() / n;
        comparison.rms_peak_time_residual =
            (residuals.iter().map(|r| r * r).sum::<f64>() / n).sqrt();
    }
    info!(
        "Compared {} channels: mean charge ratio {:.3}, peak time residual {:.3} ± {:.3}",
        comparison.num_compared,
        comparison.mean_charge_ratio,
        comparison.mean_peak_time_residual,
        comparison.rms_peak_time_residual
    );
    comparison
}
