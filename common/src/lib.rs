//! Types and helpers shared by every component of the DRS waveform pipeline.
pub mod spanned;
mod tracer;
mod waveform;

pub use tracer::{TracerError, init_tracer};
pub use waveform::{CalibratedWaveform, RawWaveform};

#[doc(hidden)]
pub use git_version;

/// Floating-point type used for calibrated samples, times and charges.
pub type Real = f64;
/// A raw digitiser count as read out of the switched-capacitor array.
pub type RawSample = i16;
/// Index of a logical read-out channel.
pub type Channel = usize;
/// Index of a physical storage cell of the ring buffer.
pub type CellIndex = usize;

/// Version string of the calling binary, taken from `git describe` when available.
#[macro_export]
macro_rules! version {
    () => {
        $crate::git_version::git_version!(
            args = ["--tags", "--always", "--dirty=-modified"],
            fallback = "unknown"
        )
    };
}
