use super::utils::{FloatRandomDistribution, JsonValueError};
use rand::Rng;
use serde::Deserialize;

/// The shape of the light pulses seen by the camera, times are in samples from the start of the
/// read-out.
#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "kebab-case", rename_all_fields = "kebab-case", tag = "pulse-type")]
pub(crate) enum PulseTemplate {
    Gaussian {
        height: FloatRandomDistribution,
        peak_time: FloatRandomDistribution,
        sd: FloatRandomDistribution,
    },
    BackToBackExp {
        peak_height: FloatRandomDistribution,
        peak_time: FloatRandomDistribution,
        spread: FloatRandomDistribution,
        falling: FloatRandomDistribution,
        rising: FloatRandomDistribution,
    },
}

#[derive(Debug, Clone)]
pub(crate) enum PulseEvent {
    Gaussian {
        start: f64,
        stop: f64,
        mean: f64,
        sd: f64,
        peak_amplitude: f64,
    },
    BackToBackExp {
        start: f64,
        stop: f64,
        peak_time: f64,
        falling: f64,
        rising: f64,
        normalising_factor: f64,
        rising_spread: f64,
        falling_spread: f64,
        frac_1_sqrt_2_spread: f64,
    },
}

impl PulseEvent {
    pub(crate) fn sample(
        template: &PulseTemplate,
        rng: &mut impl Rng,
        event_index: usize,
    ) -> Result<Self, JsonValueError> {
        match template {
            PulseTemplate::Gaussian {
                height,
                peak_time,
                sd,
            } => {
                let mean = peak_time.sample(rng, event_index)?;
                let sd = sd.sample(rng, event_index)?;
                let peak_amplitude = height.sample(rng, event_index)?;
                let distance_to_value_of_one = sd * (2.0 * peak_amplitude.ln()).max(0.0).sqrt();
                Ok(Self::Gaussian {
                    start: mean - distance_to_value_of_one,
                    stop: mean + distance_to_value_of_one,
                    mean,
                    sd,
                    peak_amplitude,
                })
            }
            PulseTemplate::BackToBackExp {
                peak_height,
                peak_time,
                spread,
                falling,
                rising,
            } => {
                let rising = rising.sample(rng, event_index)?;
                let falling = falling.sample(rng, event_index)?;
                let peak_height = peak_height.sample(rng, event_index)?;
                let spread = spread.sample(rng, event_index)?;
                let peak_time = peak_time.sample(rng, event_index)?;

                let rising_spread = rising * spread.powi(2);
                let falling_spread = falling * spread.powi(2);
                let frac_1_sqrt_2_spread = std::f64::consts::FRAC_1_SQRT_2 / spread;

                let normalising_factor = {
                    let rising_erfc = libm::erfc(rising_spread * frac_1_sqrt_2_spread);
                    let rising_exp = if rising_erfc == 0.0 {
                        0.0
                    } else {
                        f64::exp(0.5 * rising * rising_spread)
                    };
                    let falling_erfc = libm::erfc(falling_spread * frac_1_sqrt_2_spread);
                    let falling_exp = if falling_erfc == 0.0 {
                        0.0
                    } else {
                        f64::exp(0.5 * falling * falling_spread)
                    };

                    peak_height / (rising_exp * rising_erfc + falling_exp * falling_erfc)
                };

                let start = peak_time - 0.5 * rising_spread - normalising_factor.ln() / rising;
                let stop = peak_time + 0.5 * falling_spread + normalising_factor.ln() / falling;

                Ok(Self::BackToBackExp {
                    start,
                    stop,
                    peak_time,
                    falling,
                    rising,
                    normalising_factor,
                    rising_spread,
                    falling_spread,
                    frac_1_sqrt_2_spread,
                })
            }
        }
    }

    pub(crate) fn get_start(&self) -> f64 {
        match self {
            Self::Gaussian { start, .. } => *start,
            Self::BackToBackExp { start, .. } => *start,
        }
    }

    pub(crate) fn get_end(&self) -> f64 {
        match self {
            Self::Gaussian { stop, .. } => *stop,
            Self::BackToBackExp { stop, .. } => *stop,
        }
    }

    /// The time of the pulse's peak.
    pub(crate) fn time(&self) -> f64 {
        match self {
            Self::Gaussian { mean, .. } => *mean,
            Self::BackToBackExp { peak_time, .. } => *peak_time,
        }
    }

    /// The height of the pulse at [Self::time].
    pub(crate) fn intensity(&self) -> f64 {
        match self {
            Self::Gaussian { peak_amplitude, .. } => *peak_amplitude,
            Self::BackToBackExp { .. } => self.get_value_at(self.time()),
        }
    }

    pub(crate) fn get_value_at(&self, time: f64) -> f64 {
        if self.get_start() > time || time > self.get_end() {
            return Default::default();
        }

        match *self {
            Self::Gaussian {
                mean,
                sd,
                peak_amplitude,
                ..
            } => peak_amplitude * f64::exp(-0.5 * f64::powi((time - mean) / sd, 2)),
            Self::BackToBackExp {
                peak_time,
                falling,
                rising,
                normalising_factor,
                rising_spread,
                falling_spread,
                frac_1_sqrt_2_spread,
                ..
            } => {
                let time_shift = time - peak_time;

                let rising_erfc = libm::erfc((rising_spread + time_shift) * frac_1_sqrt_2_spread);
                let rising_exp = (rising_erfc != 0.0)   //  Guard against NaN
                    .then(|| f64::exp(rising * (0.5 * rising_spread + time_shift)))
                    .unwrap_or_default();

                let falling_erfc =
                    libm::erfc((falling_spread - time_shift) * frac_1_sqrt_2_spread);
                let falling_exp = (falling_erfc != 0.0)   //  Guard against NaN
                    .then(|| f64::exp(falling * (0.5 * falling_spread - time_shift)))
                    .unwrap_or_default();

                normalising_factor * (rising_exp * rising_erfc + falling_exp * falling_erfc)
            }
        }
    }
}
