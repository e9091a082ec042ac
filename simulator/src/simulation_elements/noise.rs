use super::utils::{Interval, JsonValueError, NumConstant, NumExpression};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::Deserialize;
use std::collections::VecDeque;

/// Electronic noise added to every sample of a read-out.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct NoiseSource {
    attributes: NoiseAttributes,
    /// Length of the moving average window to apply to the noise.
    /// If no smoothing is required, set this to
    /// ```json
    /// "smoothing-window-length": { "const": 1 }
    /// ```
    smoothing_window_length: NumConstant<usize>,
}

impl NoiseSource {
    pub(crate) fn sample(
        &self,
        rng: &mut impl Rng,
        event_index: usize,
    ) -> Result<f64, JsonValueError> {
        match &self.attributes {
            NoiseAttributes::Uniform(Interval { min, max }) => {
                let (min, max) = (min.value(event_index)?, max.value(event_index)?);
                Ok((max - min) * rng.random::<f64>() + min)
            }
            NoiseAttributes::Gaussian { mean, sd } => {
                Ok(Normal::new(mean.value(event_index)?, sd.value(event_index)?)?.sample(rng))
            }
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "noise-type")]
pub(crate) enum NoiseAttributes {
    Uniform(Interval<NumExpression>),
    Gaussian {
        mean: NumExpression,
        sd: NumExpression,
    },
}

/// The noise of one read-out, smoothed over consecutive samples.
pub(crate) struct Noise<'a> {
    source: &'a NoiseSource,
    window_len: usize,
    prev: VecDeque<f64>,
}

impl<'a> Noise<'a> {
    pub(crate) fn new(source: &'a NoiseSource) -> Result<Self, JsonValueError> {
        Ok(Self {
            source,
            window_len: source.smoothing_window_length.value()?.max(1),
            prev: Default::default(),
        })
    }

    pub(crate) fn noisify(
        &mut self,
        value: f64,
        rng: &mut impl Rng,
        event_index: usize,
    ) -> Result<f64, JsonValueError> {
        if self.prev.len() == self.window_len {
            self.prev.pop_front();
        }
        self.prev.push_back(self.source.sample(rng, event_index)?);
        Ok(value + self.prev.iter().sum::<f64>() / self.prev.len() as f64)
    }
}
