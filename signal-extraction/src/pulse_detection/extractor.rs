//! Reads the charge and arrival time of a single pulse off a cubic spline.
use super::{CubicSpline, Direction, Real, SplineError};
use crate::parameters::{ExtractionPolicy, LeadingEdge, SplineParameters};
use thiserror::Error;

/// Reasons for which a waveform yields no pulse features.
#[derive(Debug, Error, PartialEq)]
pub enum ExtractionFailure {
    #[error("{0} samples are saturated")]
    Saturated(usize),
    #[error("The largest sample is at the edge of the extraction range")]
    NoInteriorMaximum,
    #[error("Extracted features are not finite")]
    NonFinite,
    #[error("Spline: {0}")]
    Spline(#[from] SplineError),
}

/// Features of the pulse found in one extraction range.
///
/// All times are in samples, relative to the first sample of the range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseFeatures {
    pub charge: Real,
    pub charge_uncertainty: Real,
    /// Where the rising edge crosses the leading-edge height, if it does so within the range.
    pub arrival_time: Option<Real>,
    /// Time from the arrival to the peak.
    pub time_slope: Option<Real>,
    pub peak_time: Real,
    pub peak_height: Real,
    /// Whether any sample of the range was saturated.
    pub saturated: bool,
}

/// Extracts [PulseFeatures] from calibrated samples, according to an [ExtractionPolicy].
#[derive(Debug, Clone)]
pub struct SplineExtractor {
    policy: ExtractionPolicy,
    rise_time: Real,
    fall_time: Real,
    integration_window: Real,
    leading_edge: LeadingEdge,
    leading_edge_height: Real,
    noise_per_sample: Real,
    max_saturated: usize,
}

impl SplineExtractor {
    pub fn new(parameters: &SplineParameters) -> Self {
        Self {
            policy: parameters.policy,
            rise_time: parameters.rise_time,
            fall_time: parameters.fall_time,
            integration_window: parameters.integration_window,
            leading_edge: parameters.leading_edge,
            leading_edge_height: parameters.leading_edge_height,
            noise_per_sample: parameters.noise_per_sample,
            max_saturated: parameters.max_saturated,
        }
    }

    /// A copy of this extractor whose rise and fall times are multiplied by `factor`.
    pub fn stretched(&self, factor: Real) -> Self {
        Self {
            rise_time: self.rise_time * factor,
            fall_time: self.fall_time * factor,
            ..self.clone()
        }
    }

    pub fn policy(&self) -> ExtractionPolicy {
        self.policy
    }

    /// The most saturated samples a range may hold and still be extracted.
    pub fn max_saturated(&self) -> usize {
        self.max_saturated
    }

    /// The height at which the rising edge of a pulse peaking at `peak_height` is timed.
    fn threshold(&self, peak_height: Real) -> Real {
        match self.leading_edge {
            LeadingEdge::Relative => self.leading_edge_height * peak_height,
            LeadingEdge::Absolute => self.leading_edge_height,
        }
    }

    /// Integrates the spline over `[from, to]`, clamped to the samples, returning the charge
    /// and the effective number of samples integrated.
    fn integrate(spline: &CubicSpline, from: Real, to: Real) -> (Real, Real) {
        let last = spline.len().saturating_sub(1) as Real;
        let from = from.clamp(0.0, last);
        let to = to.clamp(from, last);
        (spline.integral(from, to), (to - from).max(1.0))
    }

    /// Extracts the features of the pulse in `samples`.
    /// # Parameters
    /// - spline: scratch spline, refitted to `samples`.
    /// - samples: calibrated samples of the extraction range.
    /// - num_saturated: number of saturated raw samples in the range.
    #[tracing::instrument(skip_all, level = "trace", fields(num_samples = samples.len(), num_saturated = num_saturated))]
    pub fn extract(
        &self,
        spline: &mut CubicSpline,
        samples: &[Real],
        num_saturated: usize,
    ) -> Result<PulseFeatures, ExtractionFailure> {
        if num_saturated > self.max_saturated {
            return Err(ExtractionFailure::Saturated(num_saturated));
        }
        spline.rebuild(samples)?;

        let (max_index, _) = samples.iter().copied().enumerate().fold(
            (0, Real::NEG_INFINITY),
            |best, (i, value)| if value > best.1 { (i, value) } else { best },
        );
        if max_index == 0 || max_index + 1 == samples.len() {
            return Err(ExtractionFailure::NoInteriorMaximum);
        }

        let (peak_time, peak_height) = spline.maximum_around(max_index);
        let threshold = self.threshold(peak_height);
        let arrival_time = spline.search_crossing(peak_time, threshold, Direction::Down);
        let anchor = arrival_time.unwrap_or_default();

        let (charge, effective_samples) = match self.policy {
            ExtractionPolicy::Amplitude => (peak_height, 1.0),
            ExtractionPolicy::IntegralFixedWindow => {
                Self::integrate(spline, anchor, anchor + self.integration_window)
            }
            ExtractionPolicy::IntegralDynamic => {
                let end = spline
                    .search_crossing(peak_time, threshold, Direction::Up)
                    .unwrap_or((samples.len() - 1) as Real);
                Self::integrate(spline, anchor, end)
            }
            ExtractionPolicy::IntegralRiseFall => Self::integrate(
                spline,
                anchor - self.rise_time,
                anchor + self.fall_time,
            ),
        };

        let features = PulseFeatures {
            charge,
            charge_uncertainty: self.noise_per_sample * effective_samples.sqrt(),
            arrival_time,
            time_slope: arrival_time.map(|arrival| peak_time - arrival),
            peak_time,
            peak_height,
            saturated: num_saturated > 0,
        };
        let finite = [
            features.charge,
            features.charge_uncertainty,
            features.peak_time,
            features.peak_height,
        ]
        .into_iter()
        .chain(features.arrival_time)
        .all(Real::is_finite);
        if !finite {
            return Err(ExtractionFailure::NonFinite);
        }
        Ok(features)
    }
}
