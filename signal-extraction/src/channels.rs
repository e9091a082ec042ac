//! Extracts the charge and arrival time of each channel from its high- and low-gain samples.
use crate::{
    parameters::{ConfigError, ExtractionParameters},
    pulse_detection::{CubicSpline, PulseFeatures, Real, SplineExtractor},
};
use cherenkov_common::{Channel, RawSample};
use drs_calibration::CalibrationError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

/// Errors which reject a whole event. Processing continues with the next one.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("Channel {channel} has {found} samples, expected {expected}")]
    SampleCountMismatch {
        channel: Channel,
        expected: usize,
        found: usize,
    },
    #[error("Event has {found} channels, expected {expected}")]
    ChannelCountMismatch { expected: usize, found: usize },
    #[error("Calibration: {0}")]
    Calibration(#[from] CalibrationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Charge {
    pub value: Real,
    pub uncertainty: Real,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ArrivalTime {
    /// In samples, from the first sample of the branch's read-out.
    pub time: Real,
    /// Time from the arrival to the peak, if known.
    pub slope: Option<Real>,
    /// Set when no arrival time could be measured and `time` was drawn at random from the
    /// extraction range, so that the channel still carries a time.
    pub fallback: bool,
}

/// Charges of one channel. [None] marks an invalid result.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExtractedSignal {
    pub hi_gain: Option<Charge>,
    pub lo_gain: Option<Charge>,
    pub num_saturated_hi: usize,
    pub num_saturated_lo: usize,
}

/// Arrival times of one channel. [None] marks an invalid result.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExtractedTime {
    pub hi_gain: Option<ArrivalTime>,
    pub lo_gain: Option<ArrivalTime>,
    pub num_saturated_hi: usize,
    pub num_saturated_lo: usize,
}

/// Counts the saturated samples, and finds the first of them.
fn count_saturated(raw: &[RawSample], limit: RawSample) -> (usize, Option<usize>) {
    let count = raw.iter().filter(|&&value| value >= limit).count();
    (count, raw.iter().position(|&value| value >= limit))
}

/// Where the raw signal last rises through `level` before `first_saturated`, linearly
/// interpolated between the two bracketing samples.
fn saturation_time(raw: &[RawSample], first_saturated: usize, level: Real) -> Real {
    (0..first_saturated)
        .rev()
        .find_map(|i| {
            let before = Real::from(*raw.get(i)?);
            let after = Real::from(*raw.get(i + 1)?);
            (before <= level && after > level)
                .then(|| i as Real + (level - before) / (after - before))
        })
        .unwrap_or_default()
}

/// The outcome of extracting one branch, times relative to the start of its range.
#[derive(Default)]
struct BranchResult {
    charge: Option<Charge>,
    time: Option<ArrivalTime>,
    num_saturated: usize,
}

impl BranchResult {
    fn invalidate(&mut self) {
        self.charge = None;
        self.time = None;
    }

    fn shift(&mut self, offset: Real) {
        if let Some(time) = &mut self.time {
            time.time += offset;
        }
    }
}

/// Runs the spline extractor over the high-gain samples, and over the low-gain samples if
/// the high-gain branch is close to saturation, and merges the results.
#[derive(Debug, Clone)]
pub struct ExtractionCoordinator {
    parameters: ExtractionParameters,
    hi_gain: SplineExtractor,
    lo_gain: SplineExtractor,
}

impl ExtractionCoordinator {
    pub fn new(parameters: ExtractionParameters) -> Result<Self, ConfigError> {
        parameters.validate()?;
        let hi_gain = SplineExtractor::new(&parameters.spline);
        let lo_gain = hi_gain.stretched(parameters.lo_gain_stretch);
        Ok(Self {
            parameters,
            hi_gain,
            lo_gain,
        })
    }

    pub fn parameters(&self) -> &ExtractionParameters {
        &self.parameters
    }

    /// Extracts one branch from the range `[first, last]` of the channel's samples.
    ///
    /// With more saturated samples than the extractor accepts the spline is not used, the time
    /// is taken where the raw signal crosses half its maximum instead.
    fn extract_branch(
        &self,
        extractor: &SplineExtractor,
        (first, last): (usize, usize),
        raw: &[RawSample],
        calibrated: &[Real],
        spline: &mut CubicSpline,
        rng: &mut impl Rng,
    ) -> BranchResult {
        let (Some(raw), Some(calibrated)) = (raw.get(first..=last), calibrated.get(first..=last))
        else {
            return BranchResult::default();
        };
        let range = raw.len() as Real;
        let (num_saturated, first_saturated) =
            count_saturated(raw, self.parameters.saturation_limit);

        let mut result = BranchResult {
            num_saturated,
            ..Default::default()
        };
        if num_saturated <= extractor.max_saturated() {
            match extractor.extract(spline, calibrated, num_saturated) {
                Ok(PulseFeatures {
                    charge,
                    charge_uncertainty,
                    arrival_time,
                    time_slope,
                    ..
                }) => {
                    result.charge = Some(Charge {
                        value: charge,
                        uncertainty: charge_uncertainty,
                    });
                    result.time = Some(match arrival_time {
                        Some(time) if time >= -1.0 && time < range => ArrivalTime {
                            time,
                            slope: time_slope,
                            fallback: false,
                        },
                        _ => ArrivalTime {
                            time: rng.random_range(0.0..range),
                            slope: None,
                            fallback: true,
                        },
                    });
                }
                Err(failure) => trace!("{failure}"),
            }
        } else {
            let max_content = raw.iter().copied().max().map(Real::from).unwrap_or_default();
            result.time = Some(ArrivalTime {
                time: saturation_time(raw, first_saturated.unwrap_or_default(), max_content / 2.0),
                slope: None,
                fallback: false,
            });
        }
        result
    }

    /// Extracts the charges and arrival times of one channel.
    /// # Parameters
    /// - channel: the channel, used to report errors.
    /// - raw: the raw samples, used to detect saturation.
    /// - calibrated: the calibrated samples.
    /// - spline: scratch spline owned by the calling worker.
    /// - rng: source of the arrival times of channels in which none could be measured.
    #[tracing::instrument(skip_all, level = "debug", fields(channel = channel, num_saturated_hi, num_saturated_lo))]
    pub fn extract_channel(
        &self,
        channel: Channel,
        raw: &[RawSample],
        calibrated: &[Real],
        spline: &mut CubicSpline,
        rng: &mut impl Rng,
    ) -> Result<(ExtractedSignal, ExtractedTime), EventError> {
        let parameters = &self.parameters;
        let expected = parameters.num_samples();
        for found in [raw.len(), calibrated.len()] {
            if found != expected {
                return Err(EventError::SampleCountMismatch {
                    channel,
                    expected,
                    found,
                });
            }
        }

        let num_hi = parameters.num_hi_samples;
        let hi_range = (parameters.hi_first, parameters.hi_last);
        let max_content = raw
            .get(parameters.hi_first..=parameters.hi_last)
            .and_then(|range| range.iter().copied().max())
            .map(Real::from)
            .unwrap_or_default();

        let mut hi = self.extract_branch(&self.hi_gain, hi_range, raw, calibrated, spline, rng);
        hi.shift(parameters.hi_first as Real);
        if hi.num_saturated > 0 && max_content <= parameters.lo_gain_switch {
            hi.invalidate();
        }
        if hi.num_saturated > parameters.max_saturated_hi {
            hi.invalidate();
        }

        let mut lo = BranchResult::default();
        if parameters.num_lo_samples > 0 && max_content > parameters.lo_gain_switch {
            let earliest = num_hi + parameters.lo_first;
            let last = num_hi + parameters.lo_last;
            let hi_time = hi
                .time
                .map(|time| time.time)
                .unwrap_or(parameters.hi_first as Real - 1.0);
            let first = (hi_time + num_hi as Real + parameters.lo_gain_start_shift).floor();
            let first = (first.max(0.0) as usize).clamp(earliest, last);

            lo = self.extract_branch(&self.lo_gain, (first, last), raw, calibrated, spline, rng);
            lo.shift((first - num_hi) as Real - parameters.lo_gain_offset);
            if lo.num_saturated > parameters.max_saturated_lo {
                lo.invalidate();
            }
            if lo.charge.is_some_and(|charge| charge.value <= 0.0) {
                lo.charge = None;
            }
        }

        let span = tracing::Span::current();
        span.record("num_saturated_hi", hi.num_saturated);
        span.record("num_saturated_lo", lo.num_saturated);
        Ok((
            ExtractedSignal {
                hi_gain: hi.charge,
                lo_gain: lo.charge,
                num_saturated_hi: hi.num_saturated,
                num_saturated_lo: lo.num_saturated,
            },
            ExtractedTime {
                hi_gain: hi.time,
                lo_gain: lo.time,
                num_saturated_hi: hi.num_saturated,
                num_saturated_lo: lo.num_saturated,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::SplineParameters;
    use assert_approx_eq::assert_approx_eq;
    use rand::{SeedableRng, rngs::StdRng};

    const PEDESTAL: Real = 100.0;

    fn gaussian(len: usize, height: Real, centre: Real, sigma: Real) -> Vec<Real> {
        (0..len)
            .map(|i| {
                let z = (i as Real - centre) / sigma;
                height * (-0.5 * z * z).exp()
            })
            .collect()
    }

    fn raw_from(calibrated: &[Real]) -> Vec<RawSample> {
        calibrated
            .iter()
            .map(|value| (value + PEDESTAL).round().min(4095.0) as RawSample)
            .collect()
    }

    fn extract(
        coordinator: &ExtractionCoordinator,
        raw: &[RawSample],
        calibrated: &[Real],
    ) -> (ExtractedSignal, ExtractedTime) {
        coordinator
            .extract_channel(
                0,
                raw,
                calibrated,
                &mut CubicSpline::default(),
                &mut StdRng::seed_from_u64(7),
            )
            .unwrap()
    }

    fn half_width() -> Real {
        3.0 * (2.0 * Real::ln(2.0)).sqrt()
    }

    #[test]
    fn hi_gain_times_are_relative_to_the_read_out() {
        let calibrated = gaussian(30, 50.0, 17.3, 3.0);
        let raw = raw_from(&calibrated);
        let coordinator = ExtractionCoordinator::new(ExtractionParameters {
            hi_first: 5,
            ..Default::default()
        })
        .unwrap();
        let (signal, time) = extract(&coordinator, &raw, &calibrated);

        let charge = signal.hi_gain.unwrap();
        assert_approx_eq!(charge.value, 50.0, 0.25);
        assert_eq!(signal.lo_gain, None);
        assert_eq!(signal.num_saturated_hi, 0);

        let arrival = time.hi_gain.unwrap();
        assert!(!arrival.fallback);
        assert_approx_eq!(arrival.time, 17.3 - half_width(), 0.05);
        assert_approx_eq!(arrival.slope.unwrap(), half_width(), 0.05);
        assert_eq!(time.lo_gain, None);
    }

    #[test]
    fn mismatched_sample_counts_reject_the_event() {
        let coordinator = ExtractionCoordinator::new(ExtractionParameters::default()).unwrap();
        let calibrated = vec![0.0; 29];
        let raw = vec![0; 29];
        let result = coordinator.extract_channel(
            3,
            &raw,
            &calibrated,
            &mut CubicSpline::default(),
            &mut StdRng::seed_from_u64(0),
        );
        assert!(matches!(
            result,
            Err(EventError::SampleCountMismatch {
                channel: 3,
                expected: 30,
                found: 29
            })
        ));
    }

    #[test]
    fn missing_arrival_time_falls_back_to_a_reproducible_random_time() {
        let mut calibrated = vec![30.0, 35.0, 40.0, 38.0, 36.0];
        calibrated.extend((0..25).map(|i| 34.0 - i as Real));
        let raw = raw_from(&calibrated);
        let coordinator = ExtractionCoordinator::new(ExtractionParameters::default()).unwrap();

        let (signal, time) = extract(&coordinator, &raw, &calibrated);
        assert!(signal.hi_gain.is_some());
        let arrival = time.hi_gain.unwrap();
        assert!(arrival.fallback);
        assert_eq!(arrival.slope, None);
        assert!((0.0..30.0).contains(&arrival.time));

        let (_, again) = extract(&coordinator, &raw, &calibrated);
        assert_eq!(again.hi_gain.unwrap().time, arrival.time);
    }

    #[test]
    fn saturated_hi_gain_is_timed_on_the_raw_signal() {
        let mut raw = vec![100; 30];
        raw[13] = 1000;
        raw[14] = 3000;
        raw[15] = 4095;
        raw[16] = 4095;
        raw[17] = 4095;
        raw[18] = 2000;
        let calibrated = raw
            .iter()
            .map(|&value| Real::from(value) - PEDESTAL)
            .collect::<Vec<_>>();
        let coordinator = ExtractionCoordinator::new(ExtractionParameters::default()).unwrap();
        let (signal, time) = extract(&coordinator, &raw, &calibrated);

        assert_eq!(signal.hi_gain, None);
        assert_eq!(signal.num_saturated_hi, 3);
        assert_eq!(time.num_saturated_hi, 3);
        let arrival = time.hi_gain.unwrap();
        assert!(!arrival.fallback);
        assert_approx_eq!(arrival.time, 13.0 + (2047.5 - 1000.0) / 2000.0);
    }

    #[test]
    fn configured_saturation_limit_selects_the_timing_path() {
        let coordinator = |max_saturated| {
            ExtractionCoordinator::new(ExtractionParameters {
                spline: SplineParameters {
                    max_saturated,
                    ..Default::default()
                },
                ..Default::default()
            })
            .unwrap()
        };
        let pulse = |num_saturated: usize| {
            let mut raw = vec![100; 30];
            raw[13] = 1000;
            for value in &mut raw[14..14 + num_saturated] {
                *value = 4095;
            }
            raw[14 + num_saturated] = 2000;
            let calibrated = raw
                .iter()
                .map(|&value| Real::from(value) - PEDESTAL)
                .collect::<Vec<_>>();
            (raw, calibrated)
        };

        // A single saturated sample is already too many.
        let (raw, calibrated) = pulse(1);
        let (signal, time) = extract(&coordinator(0), &raw, &calibrated);
        assert_eq!(signal.hi_gain, None);
        assert_eq!(signal.num_saturated_hi, 1);
        let arrival = time.hi_gain.unwrap();
        assert!(!arrival.fallback);
        assert_eq!(arrival.slope, None);
        assert_approx_eq!(arrival.time, 13.0 + (2047.5 - 1000.0) / 3095.0);

        // Two saturated samples are still extracted from the spline.
        let (raw, calibrated) = pulse(2);
        let (signal, time) = extract(&coordinator(3), &raw, &calibrated);
        assert!(signal.hi_gain.is_some());
        assert_eq!(signal.num_saturated_hi, 2);
        assert!(time.hi_gain.unwrap().slope.is_some());
    }

    #[test]
    fn heavy_saturation_invalidates_hi_gain() {
        let mut raw = vec![100; 30];
        for value in &mut raw[10..19] {
            *value = 4095;
        }
        let calibrated = raw
            .iter()
            .map(|&value| Real::from(value) - PEDESTAL)
            .collect::<Vec<_>>();
        let coordinator = ExtractionCoordinator::new(ExtractionParameters::default()).unwrap();
        let (signal, time) = extract(&coordinator, &raw, &calibrated);
        assert_eq!(signal.hi_gain, None);
        assert_eq!(time.hi_gain, None);
        assert_eq!(signal.num_saturated_hi, 9);
    }

    #[test]
    fn saturation_below_the_switch_invalidates_the_channel() {
        let calibrated = gaussian(30, 110.0, 15.0, 3.0);
        let raw = calibrated
            .iter()
            .map(|value| value.round() as RawSample)
            .collect::<Vec<_>>();
        let coordinator = ExtractionCoordinator::new(ExtractionParameters {
            saturation_limit: 100,
            ..Default::default()
        })
        .unwrap();
        let (signal, time) = extract(&coordinator, &raw, &calibrated);
        assert_eq!(signal.hi_gain, None);
        assert_eq!(time.hi_gain, None);
        assert_eq!(signal.num_saturated_hi, 3);
    }

    #[test]
    fn lo_gain_window_follows_the_hi_gain_arrival() {
        let hi = gaussian(30, 2000.0, 17.3, 3.0);
        let lo = gaussian(30, 200.0, 17.3 + 1.7, 3.0);
        let calibrated = hi.iter().chain(lo.iter()).copied().collect::<Vec<_>>();
        let raw = raw_from(&calibrated);
        let coordinator = ExtractionCoordinator::new(ExtractionParameters {
            num_lo_samples: 30,
            spline: SplineParameters {
                noise_per_sample: 2.0,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        let (signal, time) = extract(&coordinator, &raw, &calibrated);

        assert_approx_eq!(signal.hi_gain.unwrap().value, 2000.0, 10.0);
        let lo_charge = signal.lo_gain.unwrap();
        assert_approx_eq!(lo_charge.value, 200.0, 1.0);
        assert_approx_eq!(lo_charge.uncertainty, 2.0);

        let hi_time = time.hi_gain.unwrap().time;
        let lo_time = time.lo_gain.unwrap();
        assert!(!lo_time.fallback);
        assert_approx_eq!(lo_time.time, hi_time, 0.05);
    }

    #[test]
    fn lo_gain_is_skipped_below_the_switch() {
        let hi = gaussian(30, 100.0, 17.3, 3.0);
        let lo = gaussian(30, 10.0, 19.0, 3.0);
        let calibrated = hi.iter().chain(lo.iter()).copied().collect::<Vec<_>>();
        // Raw maximum stays at or below the switch.
        let raw = calibrated
            .iter()
            .map(|value| value.round() as RawSample)
            .collect::<Vec<_>>();
        let coordinator = ExtractionCoordinator::new(ExtractionParameters {
            num_lo_samples: 30,
            ..Default::default()
        })
        .unwrap();
        let (signal, time) = extract(&coordinator, &raw, &calibrated);
        assert!(signal.hi_gain.is_some());
        assert_eq!(signal.lo_gain, None);
        assert_eq!(time.lo_gain, None);
    }

    #[test]
    fn saturation_time_walks_back_from_the_first_saturated_sample() {
        let raw = [0, 10, 50, 90, 100, 100];
        assert_approx_eq!(saturation_time(&raw, 4, 50.0), 2.0);
        assert_approx_eq!(saturation_time(&raw, 4, 70.0), 2.5);
        assert_eq!(saturation_time(&raw, 0, 50.0), 0.0);
        assert_eq!(count_saturated(&raw, 100), (2, Some(4)));
    }
}
