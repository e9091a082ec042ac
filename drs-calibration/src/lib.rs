//! # DRS Calibration
//!
//! Learns and applies the per-cell corrections of a switched-capacitor-array (ring buffer) digitiser.
//!
//! * [RingBufferCalibrator] accumulates calibration-run waveforms into a [WaveformCalibrationTable],
//!   stage by stage (baseline, gain, trigger offset).
//! * [TimeCalibrator] accumulates time-marker waveforms into a [TimeOffsetTable].
//! * [WaveformCalibrationApplier] turns every subsequent [RawWaveform] into a [CalibratedWaveform].
//!
//! The table is built once and is read-only afterwards: [RingBufferCalibrator::finish] consumes the
//! builder and hands out the finished table, which can then be shared between threads.
//!
//! [RawWaveform]: cherenkov_common::RawWaveform
//! [CalibratedWaveform]: cherenkov_common::CalibratedWaveform
mod applier;
mod calibrator;
mod error;
pub mod filters;
mod history;
mod parameters;
pub mod ring_address;
mod table;
mod time_calibrator;

pub use applier::WaveformCalibrationApplier;
pub use calibrator::RingBufferCalibrator;
pub use error::CalibrationError;
pub use history::StartCellHistory;
pub use parameters::{CalibrationParameters, SpikeRemoval};
pub use table::{CalibrationStage, WaveformCalibrationTable};
pub use time_calibrator::{Polarity, TimeCalibrator, TimeOffsetTable, find_edges};
