//! Continuous-time pulse models built from discretely sampled waveforms, and the features read off them.
mod extractor;
mod roots;
mod spline;

pub use cherenkov_common::Real;
pub use extractor::{ExtractionFailure, PulseFeatures, SplineExtractor};
pub use spline::{CubicSpline, Direction, SplineError};
