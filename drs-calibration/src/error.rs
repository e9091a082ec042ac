use crate::CalibrationStage;
use cherenkov_common::{CellIndex, Channel};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("The {stage} stage cannot be used before the {requires} stage is finalized")]
    PrerequisiteNotFinalized {
        stage: CalibrationStage,
        requires: CalibrationStage,
    },
    #[error("The {0} stage is already finalized")]
    StageAlreadyFinalized(CalibrationStage),
    #[error("The {0} stage is not finalized")]
    StageNotFinalized(CalibrationStage),
    #[error("The {0} stage has no accumulated events")]
    NoEventsAccumulated(CalibrationStage),
    #[error("Channel {channel} out of range, the table holds {num_channels} channels")]
    ChannelOutOfRange {
        channel: Channel,
        num_channels: usize,
    },
    #[error("Row {row} out of range, the time calibration holds {num_rows} rows")]
    RowOutOfRange { row: usize, num_rows: usize },
    #[error("Waveform of {len} samples does not fit a ring of {ring_size} cells")]
    WaveformTooLong { len: usize, ring_size: usize },
    #[error("Ring size mismatch: expected {expected} cells, found {found}")]
    RingSizeMismatch { expected: usize, found: usize },
    #[error("Non-finite correction in the {stage} stage, channel {channel}, cell {cell}")]
    NonFiniteCorrection {
        stage: CalibrationStage,
        channel: Channel,
        cell: CellIndex,
    },
    #[error("Non-finite time offset in row {row}, cell {cell}")]
    NonFiniteTimeOffset { row: usize, cell: CellIndex },
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}
