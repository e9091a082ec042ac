//! Calibrates and extracts whole events, channel by channel.
use crate::{
    channels::{ArrivalTime, EventError, ExtractedSignal, ExtractedTime, ExtractionCoordinator},
    pulse_detection::{CubicSpline, Real},
};
use cherenkov_common::{
    Channel, RawWaveform,
    spanned::{SpanWrapper, Spanned},
};
use drs_calibration::{
    CalibrationError, CalibrationParameters, StartCellHistory, TimeOffsetTable,
    WaveformCalibrationApplier, WaveformCalibrationTable,
};
use rand::{SeedableRng, rngs::StdRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// The raw waveforms of every channel of one event.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RawEvent {
    pub event_number: u64,
    pub channels: Vec<RawWaveform>,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChannelResult {
    pub signal: ExtractedSignal,
    pub time: ExtractedTime,
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EventResult {
    pub event_number: u64,
    pub channels: Vec<ChannelResult>,
}

/// Outcome of [EventProcessor::process_events].
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BatchSummary {
    pub processed: usize,
    pub skipped: usize,
    pub events: Vec<EventResult>,
}

/// Seed of the random source of one channel of one event, so that results do not depend on
/// which worker thread handles the channel.
fn channel_seed(seed: u64, event_number: u64, channel: Channel) -> u64 {
    seed ^ event_number.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (channel as u64).wrapping_add(1).wrapping_mul(0xC2B2_AE3D_27D4_EB4F)
}

/// Removes the cell-dependent delays of the ring buffer from `arrival`.
/// # Parameters
/// - position: the read-out position `arrival.time` corresponds to.
fn correct_arrival_time(
    arrival: &mut ArrivalTime,
    offsets: &TimeOffsetTable,
    channel: Channel,
    start_cell: i32,
    position: Real,
) {
    let offset = offsets.offset(channel, start_cell, position);
    if let Some(slope) = &mut arrival.slope {
        if position - *slope >= 0.0 {
            *slope += offsets.offset(channel, start_cell, position - *slope) - offset;
        }
    }
    arrival.time -= offset + offsets.delay(channel);
}

/// Runs calibration and extraction over the events of one run.
///
/// The processor owns the spike-removal history of every channel, so events must be given to
/// it in read-out order.
pub struct EventProcessor<'a> {
    applier: WaveformCalibrationApplier<'a>,
    coordinator: &'a ExtractionCoordinator,
    histories: Vec<StartCellHistory>,
    seed: u64,
}

impl<'a> EventProcessor<'a> {
    /// # Parameters
    /// - table: the finalized calibration table.
    /// - calibration: parameters of the waveform calibration.
    /// - coordinator: the configured extraction.
    /// - seed: seed of the arrival-time fallback.
    pub fn new(
        table: &'a WaveformCalibrationTable,
        calibration: &'a CalibrationParameters,
        coordinator: &'a ExtractionCoordinator,
        seed: u64,
    ) -> Result<Self, CalibrationError> {
        let applier = WaveformCalibrationApplier::new(table, calibration)?;
        let num_samples = coordinator.parameters().num_samples();
        if num_samples > table.ring_size().get() {
            return Err(CalibrationError::WaveformTooLong {
                len: num_samples,
                ring_size: table.ring_size().get(),
            });
        }
        let histories = (0..table.num_channels())
            .map(|_| applier.new_history())
            .collect();
        Ok(Self {
            applier,
            coordinator,
            histories,
            seed,
        })
    }

    /// Checks the shape of `event` before any channel's history is touched.
    fn validate(&self, event: &RawEvent) -> Result<(), EventError> {
        let expected = self.histories.len();
        if event.channels.len() != expected {
            return Err(EventError::ChannelCountMismatch {
                expected,
                found: event.channels.len(),
            });
        }
        let num_samples = self.coordinator.parameters().num_samples();
        if let Some((channel, raw)) = event
            .channels
            .iter()
            .enumerate()
            .find(|(_, raw)| raw.len() != num_samples)
        {
            return Err(EventError::SampleCountMismatch {
                channel,
                expected: num_samples,
                found: raw.len(),
            });
        }
        Ok(())
    }

    /// Calibrates and extracts every channel of `event`, in parallel.
    #[tracing::instrument(skip_all, fields(event_number = event.event_number))]
    pub fn process_event(&mut self, event: &RawEvent) -> Result<EventResult, EventError> {
        self.validate(event)?;
        let applier = &self.applier;
        let coordinator = self.coordinator;
        let seed = self.seed;

        let channels = event
            .channels
            .iter()
            .zip(self.histories.iter_mut())
            .enumerate()
            .map(SpanWrapper::new_with_current)
            .collect::<Vec<_>>()
            .into_par_iter()
            .map_init(CubicSpline::default, |spline, item| {
                let span = item.span().clone();
                let (channel, (raw, history)) = item.into_inner();
                span.in_scope(|| {
                    let mut rng = StdRng::seed_from_u64(channel_seed(
                        seed,
                        event.event_number,
                        channel,
                    ));
                    process_channel(applier, coordinator, channel, raw, history, spline, &mut rng)
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(EventResult {
            event_number: event.event_number,
            channels,
        })
    }

    /// Processes `events` in order, skipping those which are rejected.
    #[tracing::instrument(skip_all, fields(num_events = events.len()))]
    pub fn process_events(&mut self, events: &[RawEvent]) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for event in events {
            match self.process_event(event) {
                Ok(result) => {
                    summary.processed += 1;
                    summary.events.push(result);
                }
                Err(e) => {
                    warn!("Skipping event {}: {e}", event.event_number);
                    summary.skipped += 1;
                }
            }
        }
        info!(
            "Processed {} events, skipped {}",
            summary.processed, summary.skipped
        );
        summary
    }
}

/// Calibrates one channel, removes its trigger offset, extracts it and corrects its times.
fn process_channel(
    applier: &WaveformCalibrationApplier,
    coordinator: &ExtractionCoordinator,
    channel: Channel,
    raw: &RawWaveform,
    history: &mut StartCellHistory,
    spline: &mut CubicSpline,
    rng: &mut StdRng,
) -> Result<ChannelResult, EventError> {
    let table = applier.table();
    let mut calibrated = applier.calibrate(channel, raw, history)?;
    for (value, offset) in calibrated
        .samples
        .iter_mut()
        .zip(applier.trigger_offsets(channel, raw.start_cell, raw.len()))
    {
        *value -= offset;
    }

    let (signal, mut time) =
        coordinator.extract_channel(channel, &raw.samples, &calibrated.samples, spline, rng)?;

    if let Some(offsets) = table.time_offsets() {
        let parameters = coordinator.parameters();
        if let Some(arrival) = &mut time.hi_gain {
            let position = arrival.time;
            correct_arrival_time(arrival, offsets, channel, raw.start_cell, position);
        }
        if let Some(arrival) = &mut time.lo_gain {
            let position =
                arrival.time + parameters.lo_gain_offset + parameters.num_hi_samples as Real;
            correct_arrival_time(arrival, offsets, channel, raw.start_cell, position);
        }
    }
    Ok(ChannelResult { signal, time })
}
