use crate::{RawSample, Real};
use serde::{Deserialize, Serialize};

/// The samples read out of one channel for one event.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RawWaveform {
    /// Raw digitiser counts, in read-out order.
    pub samples: Vec<RawSample>,
    /// The physical cell which produced `samples[0]`.
    pub start_cell: i32,
    /// State of the digitiser's alternating clock bit at the start of the read-out.
    pub ab_flag: bool,
}

impl RawWaveform {
    pub fn new(samples: Vec<RawSample>, start_cell: i32, ab_flag: bool) -> Self {
        Self {
            samples,
            start_cell,
            ab_flag,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Returns `0` or `1`, the parity offset of the alternating clock.
    pub fn ab_parity(&self) -> usize {
        usize::from(self.ab_flag)
    }
}

/// Pedestal-subtracted, and possibly gain-normalised, samples of one channel for one event.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CalibratedWaveform {
    pub samples: Vec<Real>,
    pub start_cell: i32,
}

impl CalibratedWaveform {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
