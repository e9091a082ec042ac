//! Learns the relative timing of the physical cells from time-marker waveforms.
//!
//! The cells of the ring do not sample at exactly uniform intervals. A periodic marker signal
//! recorded on a reference channel of each chip reveals the deviation: each edge of the marker
//! arrives earlier or later than a uniform grid fitted through all its edges, by an amount
//! characteristic of the cell at which it was observed. The deviations are averaged per
//! (row, cell) over many events into a [TimeOffsetTable].
use crate::{CalibrationError, ring_address::physical_cell};
use cherenkov_common::{CellIndex, Channel, Real};
use clap::ValueEnum;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use tracing::{debug, info};

/// Minimum number of marker edges for an event to take part in the calibration.
const MIN_EDGES: usize = 3;

/// Defines the polarity of the marker signal.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Polarity {
    /// Marker pulses register as positive signals, their rising edges are used.
    #[default]
    Positive,
    /// Marker pulses register as negative signals, their falling edges are used.
    Negative,
}

impl Polarity {
    fn sign(self) -> Real {
        match self {
            Polarity::Positive => 1.0,
            Polarity::Negative => -1.0,
        }
    }
}

/// Returns the fractional sample positions at which the marker crosses its mean level
/// in the direction given by `polarity`, using linear interpolation between samples.
pub fn find_edges(samples: &[Real], polarity: Polarity) -> Vec<Real> {
    if samples.is_empty() {
        return Vec::new();
    }
    let sign = polarity.sign();
    let mean = samples.iter().sum::<Real>() / samples.len() as Real;
    samples
        .windows(2)
        .enumerate()
        .filter_map(|(i, pair)| {
            let (a, b) = (sign * (pair[0] - mean), sign * (pair[1] - mean));
            (a <= 0.0 && b > 0.0).then(|| i as Real + a / (a - b))
        })
        .collect()
}

/// Accumulates marker-edge deviations per (row, physical cell).
#[derive(Debug, Clone)]
pub struct TimeCalibrator {
    ring_size: NonZeroUsize,
    sums: Array2<Real>,
    counts: Array2<u64>,
    events: u64,
}

impl TimeCalibrator {
    /// # Parameters
    /// - num_rows: number of independently calibrated rows, e.g. one per chip.
    /// - ring_size: number of physical cells of each row.
    pub fn new(num_rows: usize, ring_size: NonZeroUsize) -> Self {
        Self {
            ring_size,
            sums: Array2::zeros((num_rows, ring_size.get())),
            counts: Array2::zeros((num_rows, ring_size.get())),
            events: 0,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.sums.nrows()
    }

    /// Adds the marker waveform of one event to `row`.
    ///
    /// Returns the number of edges used, zero when the waveform holds too few edges to fit a grid.
    /// # Parameters
    /// - row: the row the marker channel belongs to.
    /// - start_cell: the physical cell of the first sample.
    /// - samples: calibrated marker samples.
    /// - polarity: polarity of the marker signal; for negative markers the deviations are
    ///   taken from the inverted signal.
    #[tracing::instrument(skip_all, level = "trace", fields(row = row, start_cell = start_cell, num_edges))]
    pub fn accumulate(
        &mut self,
        row: usize,
        start_cell: i32,
        samples: &[Real],
        polarity: Polarity,
    ) -> Result<usize, CalibrationError> {
        if row >= self.num_rows() {
            return Err(CalibrationError::RowOutOfRange {
                row,
                num_rows: self.num_rows(),
            });
        }
        if samples.len() > self.ring_size.get() {
            return Err(CalibrationError::WaveformTooLong {
                len: samples.len(),
                ring_size: self.ring_size.get(),
            });
        }

        let edges = find_edges(samples, polarity);
        tracing::Span::current().record("num_edges", edges.len());
        if edges.len() < MIN_EDGES {
            return Ok(0);
        }

        // Least-squares fit of edge position against edge number.
        let n = edges.len() as Real;
        let mean_index = (n - 1.0) / 2.0;
        let mean_position = edges.iter().sum::<Real>() / n;
        let (covariance, variance) = edges.iter().enumerate().fold(
            (0.0, 0.0),
            |(covariance, variance), (j, &position)| {
                let dx = j as Real - mean_index;
                (
                    covariance + dx * (position - mean_position),
                    variance + dx * dx,
                )
            },
        );
        let period = covariance / variance;

        for (j, &position) in edges.iter().enumerate() {
            let ideal = mean_position + period * (j as Real - mean_index);
            let cell = physical_cell(
                start_cell.into(),
                position.round() as i64,
                self.ring_size,
            );
            if let (Some(sum), Some(count)) = (
                self.sums.get_mut((row, cell)),
                self.counts.get_mut((row, cell)),
            ) {
                *sum += position - ideal;
                *count += 1;
            }
        }
        self.events += 1;
        Ok(edges.len())
    }

    /// Averages the accumulated deviations into a [TimeOffsetTable].
    /// # Parameters
    /// - channels_per_row: number of consecutive channels read out by one row.
    #[tracing::instrument(skip_all, fields(events = self.events))]
    pub fn finalize(&self, channels_per_row: usize) -> Result<TimeOffsetTable, CalibrationError> {
        if self.events == 0 {
            return Err(CalibrationError::InvalidParameter(
                "no marker events were accumulated".to_owned(),
            ));
        }
        let mut offsets = Array2::zeros(self.sums.raw_dim());
        for (((row, cell), offset), (&sum, &count)) in offsets
            .indexed_iter_mut()
            .zip(self.sums.iter().zip(self.counts.iter()))
        {
            if count == 0 {
                continue;
            }
            let value = sum / count as Real;
            if !value.is_finite() {
                return Err(CalibrationError::NonFiniteTimeOffset { row, cell });
            }
            *offset = value;
        }
        let mut table = TimeOffsetTable::new(offsets, channels_per_row)?;
        table.reference_count = self.events;
        info!(
            "Finalized time calibration of {} rows from {} events",
            table.num_rows(),
            self.events
        );
        Ok(table)
    }
}

/// Per-cell time offsets of each row plus a delay per channel, in sample units.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TimeOffsetTable {
    offsets: Array2<Real>,
    delays: Vec<Real>,
    channels_per_row: usize,
    reference_count: u64,
}

impl TimeOffsetTable {
    /// Creates a table from `offsets`, indexed `[row, physical cell]`.
    pub fn new(offsets: Array2<Real>, channels_per_row: usize) -> Result<Self, CalibrationError> {
        if channels_per_row == 0 {
            return Err(CalibrationError::InvalidParameter(
                "channels per row must be positive".to_owned(),
            ));
        }
        if offsets.ncols() == 0 {
            return Err(CalibrationError::InvalidParameter(
                "time offsets must cover at least one cell".to_owned(),
            ));
        }
        Ok(Self {
            offsets,
            delays: Vec::new(),
            channels_per_row,
            reference_count: 0,
        })
    }

    pub fn ring_size(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.offsets.ncols()).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn num_rows(&self) -> usize {
        self.offsets.nrows()
    }

    /// Number of marker events the offsets were averaged over.
    pub fn reference_count(&self) -> u64 {
        self.reference_count
    }

    pub fn row_of(&self, channel: Channel) -> usize {
        channel / self.channels_per_row
    }

    /// Sets the delay of each channel, indexed by channel.
    pub fn set_delays(&mut self, delays: Vec<Real>) {
        debug!("Setting {} channel delays", delays.len());
        self.delays = delays;
    }

    /// The delay of `channel`, zero if none was set.
    pub fn delay(&self, channel: Channel) -> Real {
        self.delays.get(channel).copied().unwrap_or_default()
    }

    fn cell_offset(&self, row: usize, cell: CellIndex) -> Real {
        self.offsets.get((row, cell)).copied().unwrap_or_default()
    }

    /// The offset, relative to the first sample, of a time measured on `channel` in an event
    /// starting at `start_cell`. Times between samples interpolate linearly.
    pub fn offset(&self, channel: Channel, start_cell: i32, time: Real) -> Real {
        if !time.is_finite() {
            return 0.0;
        }
        let row = self.row_of(channel);
        let ring_size = self.ring_size();
        let start = i64::from(start_cell);
        let position = time.floor();
        let fraction = time - position;
        let position = position as i64;

        let lower = self.cell_offset(row, physical_cell(start, position, ring_size));
        let upper = self.cell_offset(row, physical_cell(start, position + 1, ring_size));
        let origin = self.cell_offset(row, physical_cell(start, 0, ring_size));
        lower + (upper - lower) * fraction - origin
    }
}
