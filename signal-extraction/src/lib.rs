//! # Signal Extraction
//!
//! Turns raw ring-buffer waveforms into the charge and arrival time of each channel:
//! * [EventProcessor] calibrates every channel of an event with a finalized
//!   [WaveformCalibrationTable](drs_calibration::WaveformCalibrationTable), channels in parallel.
//! * [ExtractionCoordinator] runs the high-gain extraction and, for large pulses, the low-gain
//!   extraction in a window placed after the high-gain arrival time.
//! * [SplineExtractor] fits a [CubicSpline] to the samples of one range and reads the peak,
//!   the leading-edge arrival time and the charge off it.
//!
//! Channels in which no arrival time can be measured still carry one, drawn from a seeded
//! random source and flagged with [ArrivalTime::fallback].
mod channels;
mod parameters;
mod processing;
pub mod pulse_detection;

pub use channels::{
    ArrivalTime, Charge, EventError, ExtractedSignal, ExtractedTime, ExtractionCoordinator,
};
pub use parameters::{
    ConfigError, ExtractionParameters, ExtractionPolicy, LeadingEdge, SplineParameters,
};
pub use processing::{BatchSummary, ChannelResult, EventProcessor, EventResult, RawEvent};
pub use pulse_detection::{
    CubicSpline, Direction, ExtractionFailure, PulseFeatures, SplineError, SplineExtractor,
};
