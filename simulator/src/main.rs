//! # Simulator
//!
//! Simulates a DRS ring-buffer digitiser reading out a Cherenkov camera, and runs the
//! calibration and extraction pipeline on the simulated data:
//! * `calibrate` simulates the calibration runs and writes the learned calibration table.
//! * `process` simulates physics events, extracts them with a previously written table, and
//!   writes the extracted features together with the injected pulses.
//! * `run` does both in one go and reports how well the injected pulses were recovered.
//!
//! The digitiser's imperfections are drawn from the seed alone, so `process` must be given
//! the seed that `calibrate` was run with.
mod simulation;
mod simulation_elements;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use cherenkov_common::init_tracer;
use drs_calibration::{CalibrationParameters, Polarity, WaveformCalibrationTable};
use miette::IntoDiagnostic;
use rand::{SeedableRng, rngs::StdRng};
use serde::Serialize;
use signal_extraction::{BatchSummary, ExtractionParameters};
use simulation::{Comparison, PulseTruth, Simulation, compare};
use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};
use tracing::info;

/// [clap] derived struct to handle command line parameters.
#[derive(Debug, Parser)]
#[clap(author, version = cherenkov_common::version!(), about)]
struct Cli {
    /// Path to the JSON file describing the digitiser and the runs to simulate
    #[clap(long)]
    config: PathBuf,

    /// Seed of every random draw, taken from the clock if omitted
    #[clap(long)]
    seed: Option<u64>,

    /// Polarity of the simulated time marker
    #[clap(long, default_value = "positive")]
    marker_polarity: Polarity,

    #[clap(flatten)]
    calibration: CalibrationParameters,

    #[clap(flatten)]
    extraction: ExtractionParameters,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Simulates the calibration runs and writes the calibration table
    Calibrate {
        /// File the calibration table is written to
        #[clap(long)]
        output: PathBuf,
    },
    /// Simulates and extracts physics events with an existing calibration table
    Process {
        /// File the calibration table is read from
        #[clap(long)]
        table: PathBuf,

        /// File the extracted features are written to
        #[clap(long)]
        output: PathBuf,
    },
    /// Calibrates, then simulates and extracts physics events
    Run {
        /// File the extracted features are written to, if given
        #[clap(long)]
        output: Option<PathBuf>,
    },
}

/// The contents of the file written by the `process` and `run` modes.
#[derive(Serialize)]
#[serde(rename_all = "kebab-case")]
struct Output {
    created: DateTime<Utc>,
    seed: u64,
    comparison: Comparison,
    truth: Vec<Vec<PulseTruth>>,
    summary: BatchSummary,
}

/// Independent random streams derived from the one seed.
const DIGITISER_STREAM: u64 = 0;
const CALIBRATION_STREAM: u64 = 1;
const PHYSICS_STREAM: u64 = 2;

fn stream(seed: u64, stream: u64) -> StdRng {
    StdRng::seed_from_u64(seed.wrapping_add(stream))
}

fn write_json(path: &Path, value: &impl Serialize) -> miette::Result<()> {
    let writer = BufWriter::new(File::create(path).into_diagnostic()?);
    serde_json::to_writer_pretty(writer, value).into_diagnostic()?;
    info!("Written {}", path.display());
    Ok(())
}

fn main() -> miette::Result<()> {
    let args = Cli::parse();

    init_tracer().into_diagnostic()?;

    let simulation: Simulation = serde_json::from_reader(BufReader::new(
        File::open(&args.config).into_diagnostic()?,
    ))
    .into_diagnostic()?;

    let seed = args
        .seed
        .unwrap_or_else(|| Utc::now().timestamp_subsec_nanos().into());
    info!("Simulating with seed {seed}");

    let digitiser = simulation
        .build_digitiser(&args.extraction, &mut stream(seed, DIGITISER_STREAM))
        .into_diagnostic()?;

    let calibrate = || {
        simulation.calibrate(
            &digitiser,
            &args.calibration,
            args.marker_polarity,
            &mut stream(seed, CALIBRATION_STREAM),
        )
    };
    let process = |table: &WaveformCalibrationTable| -> miette::Result<Output> {
        let (summary, truth) = simulation
            .process(
                &digitiser,
                table,
                &args.calibration,
                args.extraction.clone(),
                seed,
                &mut stream(seed, PHYSICS_STREAM),
            )
            .into_diagnostic()?;
        Ok(Output {
            created: Utc::now(),
            seed,
            comparison: compare(&summary, &truth),
            truth,
            summary,
        })
    };

    match &args.mode {
        Mode::Calibrate { output } => {
            let table = calibrate().into_diagnostic()?;
            write_json(output, &table)?;
        }
        Mode::Process { table, output } => {
            let table: WaveformCalibrationTable = serde_json::from_reader(BufReader::new(
                File::open(table).into_diagnostic()?,
            ))
            .into_diagnostic()?;
            write_json(output, &process(&table)?)?;
        }
        Mode::Run { output } => {
            let table = calibrate().into_diagnostic()?;
            let result = process(&table)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&result.comparison).into_diagnostic()?
            );
            if let Some(output) = output {
                write_json(output, &result)?;
            }
        }
    }
    Ok(())
}
