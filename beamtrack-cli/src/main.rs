//! beamtrack CLI
//!
//! Correlation, prealignment, alignment and track reconstruction of beam
//! telescope runs from per-device hit tables.
#![allow(
    clippy::uninlined_format_args,
    clippy::cast_precision_loss,
    clippy::too_many_lines
)]

use beamtrack_algorithms::{
    correlate_all, find_correlation_breaks, AlignmentEstimator, PrealignmentEstimator,
    Reconstructor, TrackFinder, TrackFitter,
};
use beamtrack_core::{Axis, EventHits, FittedTrack, Geometry, Setup};
use beamtrack_io::{load_setup, GeometryRecord, HitTableReader, RunConfig, TrackTableWriter};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    BeamtrackIo(#[from] beamtrack_io::Error),

    #[error("Core error: {0}")]
    Core(#[from] beamtrack_core::Error),

    #[error("{0}")]
    Usage(String),
}

/// Track reconstruction and alignment for beam telescopes.
#[derive(Parser)]
#[command(name = "beamtrack")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Inputs shared by every subcommand.
#[derive(Args)]
struct RunArgs {
    /// Setup file (JSON)
    #[arg(short, long)]
    setup: PathBuf,

    /// Run configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Hit tables, one per device in setup order (.csv or .bhit)
    #[arg(required = true)]
    hits: Vec<PathBuf>,
}

/// Tracking options overriding the run configuration.
#[derive(Args)]
struct TrackingArgs {
    /// Starting geometry file; the nominal setup geometry if absent
    #[arg(short, long)]
    geometry: Option<PathBuf>,

    /// Minimum devices per track (finder and fitter)
    #[arg(long)]
    min_devices: Option<usize>,

    /// Maximum transverse distance when matching hits to a candidate
    #[arg(long)]
    max_distance: Option<f64>,

    /// Residual cut for outlier removal
    #[arg(long)]
    residual_cut: Option<f64>,

    /// Devices always used in the fit
    #[arg(long, value_delimiter = ',')]
    include: Vec<usize>,

    /// Devices never used in the fit
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<usize>,

    /// Events per processing chunk
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Worker threads
    #[arg(short, long)]
    workers: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show setup and hit-table summary
    Info {
        #[command(flatten)]
        run: RunArgs,

        /// Report event-number desynchronisation against the reference device
        /// with this hit-matching tolerance
        #[arg(long)]
        check_breaks: Option<f64>,

        /// Minimum length of a reported desynchronised run
        #[arg(long, default_value = "10")]
        min_run: usize,
    },

    /// Correlate every device with the reference device and report ridge positions
    Correlate {
        #[command(flatten)]
        run: RunArgs,

        /// Reference device
        #[arg(long)]
        reference: Option<usize>,

        /// Limit the number of correlated events
        #[arg(long)]
        max_events: Option<usize>,
    },

    /// Estimate initial offsets from hit correlations
    Prealign {
        #[command(flatten)]
        run: RunArgs,

        /// Output geometry file
        #[arg(short, long)]
        output: PathBuf,

        /// Reference device
        #[arg(long)]
        reference: Option<usize>,

        /// Starting geometry file; the nominal setup geometry if absent
        #[arg(short, long)]
        geometry: Option<PathBuf>,
    },

    /// Refine the geometry iteratively from track residuals
    Align {
        #[command(flatten)]
        run: RunArgs,

        #[command(flatten)]
        tracking: TrackingArgs,

        /// Output geometry file
        #[arg(short, long)]
        output: PathBuf,

        /// Also write the final tracks to this file
        #[arg(long)]
        tracks: Option<PathBuf>,

        /// Convergence threshold on the movement metric
        #[arg(long)]
        threshold: Option<f64>,

        /// Damping factor in (0, 1]
        #[arg(long)]
        damping: Option<f64>,

        /// Maximum iterations
        #[arg(long)]
        max_iterations: Option<usize>,

        /// Also fit the out-of-plane tilts
        #[arg(long)]
        tilt: bool,

        /// Also fit the z positions
        #[arg(long)]
        z: bool,
    },

    /// Reconstruct tracks with a fixed geometry
    Track {
        #[command(flatten)]
        run: RunArgs,

        #[command(flatten)]
        tracking: TrackingArgs,

        /// Output track table (.csv, or .h5 with the hdf5 feature)
        #[arg(short, long)]
        output: PathBuf,

        /// Maximum number of tracks
        #[arg(long)]
        max_tracks: Option<usize>,
    },
}

fn main() {
    let cli = Cli::parse();
    let filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    if let Err(err) = run(cli.command) {
        log::error!("{err}");
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Info {
            run,
            check_breaks,
            min_run,
        } => {
            let (setup, config, events) = load_run(&run)?;
            print_info(&setup, &events);

            if let Some(tolerance) = check_breaks {
                let geometry = setup.nominal_geometry();
                let reference = config.correlation.reference_device;
                for device in (0..setup.len()).filter(|&d| d != reference) {
                    let breaks = find_correlation_breaks(
                        &events, &geometry, reference, device, tolerance, min_run,
                    )?;
                    for b in &breaks {
                        println!(
                            "  device {}: no correlation in events {}..={} ({} events)",
                            device, b.first_event, b.last_event, b.events
                        );
                    }
                    if breaks.is_empty() {
                        println!("  device {}: correlated", device);
                    }
                }
            }
        }

        Commands::Correlate {
            run,
            reference,
            max_events,
        } => {
            let (setup, mut config, events) = load_run(&run)?;
            if let Some(reference) = reference {
                config.correlation.reference_device = reference;
            }
            if max_events.is_some() {
                config.correlation.max_events = max_events;
            }
            config.validate()?;

            let start = Instant::now();
            let correlations = correlate_all(&events, &setup, &config.correlation)?;
            log::info!("correlated {} devices in {:.2?}", correlations.len(), start.elapsed());

            let estimator = PrealignmentEstimator::new(config.prealignment.clone())?;
            let reference_spec = setup.device(config.correlation.reference_device)?;
            for correlation in &correlations {
                let spec = setup.device(correlation.device)?;
                for axis in Axis::ALL {
                    let pitch = match axis {
                        Axis::X => spec.pitch_x.min(reference_spec.pitch_x),
                        Axis::Y => spec.pitch_y.min(reference_spec.pitch_y),
                    };
                    match estimator.estimate_axis(correlation.axis(axis), pitch) {
                        Ok(estimate) => println!(
                            "device {} {:?}: peak {:.4} sigma {:.4} significance {:.1}{}",
                            correlation.device,
                            axis,
                            estimate.offset,
                            estimate.sigma,
                            estimate.significance,
                            estimate
                                .slope
                                .map(|s| format!(" slope {:.4}", s))
                                .unwrap_or_default()
                        ),
                        Err(warning) => println!("device {} {:?}: {}", correlation.device, axis, warning),
                    }
                }
            }
        }

        Commands::Prealign {
            run,
            output,
            reference,
            geometry,
        } => {
            let (setup, mut config, events) = load_run(&run)?;
            if let Some(reference) = reference {
                config.correlation.reference_device = reference;
            }
            config.validate()?;
            let initial = initial_geometry(geometry.as_deref(), &setup)?;

            let correlations = correlate_all(&events, &setup, &config.correlation)?;
            let outcome = PrealignmentEstimator::new(config.prealignment.clone())?
                .prealign(&correlations, &setup, &initial)?;
            for warning in &outcome.warnings {
                log::warn!("{warning}");
            }

            let mut record = GeometryRecord::from_geometry(&outcome.geometry, Some(&setup));
            record.warnings = outcome.warnings.iter().map(ToString::to_string).collect();
            record.save(&output)?;
            log::info!("wrote prealigned geometry to {}", output.display());
        }

        Commands::Align {
            run,
            tracking,
            output,
            tracks,
            threshold,
            damping,
            max_iterations,
            tilt,
            z,
        } => {
            let (setup, mut config, events) = load_run(&run)?;
            apply_tracking(&mut config, &tracking, &events)?;
            if let Some(threshold) = threshold {
                config.alignment.convergence_threshold = threshold;
            }
            if let Some(damping) = damping {
                config.alignment.damping = damping;
            }
            if let Some(iterations) = max_iterations {
                config.alignment.max_iterations = iterations;
            }
            config.alignment.align_tilt |= tilt;
            config.alignment.align_z |= z;
            config.validate()?;

            let initial = initial_geometry(tracking.geometry.as_deref(), &setup)?;
            let reconstructor = build_reconstructor(&config, &setup)?;
            let estimator = AlignmentEstimator::new(config.alignment.clone(), reconstructor)?;

            let start = Instant::now();
            let outcome = estimator.run(&events, &initial)?;
            log::info!(
                "alignment {:?} after {} iterations (movement {:.3e}) in {:.2?}",
                outcome.status,
                outcome.iterations,
                outcome.final_movement,
                start.elapsed()
            );
            for summary in &outcome.history {
                log::debug!(
                    "iteration {}: movement {:.3e}, {} good tracks, mean chi2/dof {:.3}",
                    summary.iteration,
                    summary.movement,
                    summary.good_tracks,
                    summary.mean_reduced_chi2
                );
            }
            for warning in &outcome.warnings {
                log::warn!("{warning}");
            }

            GeometryRecord::from_alignment(&outcome, Some(&setup)).save(&output)?;
            log::info!("wrote aligned geometry to {}", output.display());

            if let Some(path) = tracks {
                write_tracks(&path, setup.len(), &outcome.tracks)?;
            }
        }

        Commands::Track {
            run,
            tracking,
            output,
            max_tracks,
        } => {
            let (setup, mut config, events) = load_run(&run)?;
            apply_tracking(&mut config, &tracking, &events)?;
            if max_tracks.is_some() {
                config.processing.max_tracks = max_tracks;
            }
            config.validate()?;

            let geometry = initial_geometry(tracking.geometry.as_deref(), &setup)?;
            let reconstructor = build_reconstructor(&config, &setup)?;

            let start = Instant::now();
            let reconstruction = reconstructor.reconstruct(&events, &geometry)?;
            let stats = &reconstruction.stats;
            log::info!(
                "{} events: {} candidates, {} good, {} rejected, {} degenerate in {:.2?}",
                stats.events_processed,
                stats.candidates,
                stats.good,
                stats.rejected,
                stats.degenerate,
                start.elapsed()
            );
            log::info!(
                "{} events without candidates, {} truncated, {:.2} tracks per event",
                stats.events_without_candidates,
                stats.truncated_events,
                stats.mean_tracks_per_event()
            );

            write_tracks(&output, setup.len(), &reconstruction.tracks)?;
        }
    }

    Ok(())
}

/// Loads the setup, the run configuration and all hit tables.
fn load_run(args: &RunArgs) -> Result<(Setup, RunConfig, Vec<EventHits>)> {
    let setup = load_setup(&args.setup)?;
    let config = match &args.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    log::debug!("setup with {} devices from {}", setup.len(), args.setup.display());

    let start = Instant::now();
    let events = HitTableReader::new(setup.clone()).read_run(&args.hits)?;
    log::info!("loaded {} events in {:.2?}", events.len(), start.elapsed());
    Ok((setup, config, events))
}

fn initial_geometry(path: Option<&Path>, setup: &Setup) -> Result<Geometry> {
    let geometry = match path {
        Some(path) => GeometryRecord::load(path)?.geometry(),
        None => setup.nominal_geometry(),
    };
    geometry.check_devices(setup.len())?;
    Ok(geometry)
}

/// Applies command-line tracking overrides and resolves an automatic chunk size.
fn apply_tracking(config: &mut RunConfig, args: &TrackingArgs, events: &[EventHits]) -> Result<()> {
    if let Some(min_devices) = args.min_devices {
        config.finder.min_devices = min_devices;
        config.fit.min_devices = min_devices;
    }
    if let Some(distance) = args.max_distance {
        config.finder.max_distance = distance;
    }
    if let Some(cut) = args.residual_cut {
        config.fit.residual_cut = Some(cut);
    }
    if !args.include.is_empty() {
        config.fit.included_devices.clone_from(&args.include);
    }
    if !args.exclude.is_empty() {
        config.fit.excluded_devices.clone_from(&args.exclude);
    }
    if args.workers.is_some() {
        config.processing.workers = args.workers;
    }

    if let Some(chunk_size) = args.chunk_size {
        config.processing.chunk_size = chunk_size;
    } else if let Some(sizing) = &config.chunking {
        let workers = config.processing.workers.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        });
        config.processing.chunk_size = sizing.chunk_size(events, workers)?;
    }
    Ok(())
}

fn build_reconstructor(config: &RunConfig, setup: &Setup) -> Result<Reconstructor> {
    let finder = TrackFinder::new(config.finder.clone())?;
    let fitter = TrackFitter::for_setup(config.fit.clone(), setup)?;
    Ok(Reconstructor::new(finder, fitter, config.processing.clone())?)
}

fn print_info(setup: &Setup, events: &[EventHits]) {
    println!("Devices: {}", setup.len());
    for (device, spec) in setup.devices.iter().enumerate() {
        let hits: usize = events.iter().map(|e| e.device_hits(device).len()).sum();
        let seen = events
            .iter()
            .filter(|e| !e.device_hits(device).is_empty())
            .count();
        println!(
            "  {:>2} {:<12} z={:<10.3} pitch {}x{}  {}x{} pixels  {} hits in {} events",
            device,
            spec.name,
            spec.z_position,
            spec.pitch_x,
            spec.pitch_y,
            spec.columns,
            spec.rows,
            hits,
            seen
        );
    }

    let complete = events
        .iter()
        .filter(|e| e.devices_with_hits() == setup.len())
        .count();
    println!("Events: {}", events.len());
    if let (Some(first), Some(last)) = (events.first(), events.last()) {
        println!("  event numbers {}..={}", first.event_number, last.event_number);
    }
    println!(
        "  with hits on every device: {} ({:.1}%)",
        complete,
        100.0 * complete as f64 / events.len().max(1) as f64
    );
}

fn write_tracks(path: &Path, devices: usize, tracks: &[FittedTrack]) -> Result<()> {
    let format = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map_or_else(|| "csv".to_string(), |ext| ext.to_lowercase());

    match format.as_str() {
        "h5" | "hdf5" => write_tracks_hdf5(path, devices, tracks)?,
        "csv" => {
            let mut writer = TrackTableWriter::create(path, devices)?;
            writer.write_tracks(tracks)?;
            writer.flush()?;
        }
        other => {
            return Err(CliError::Usage(format!(
                "unsupported track table extension '{other}' (expected csv or h5)"
            )))
        }
    }
    log::info!("wrote {} tracks to {}", tracks.len(), path.display());
    Ok(())
}

#[cfg(feature = "hdf5")]
fn write_tracks_hdf5(path: &Path, devices: usize, tracks: &[FittedTrack]) -> Result<()> {
    let options = beamtrack_io::TrackWriteOptions::default();
    let mut sink = beamtrack_io::Hdf5TrackSink::create(path, devices, &options)?;
    sink.write_tracks(tracks)?;
    Ok(())
}

#[cfg(not(feature = "hdf5"))]
fn write_tracks_hdf5(path: &Path, _devices: usize, _tracks: &[FittedTrack]) -> Result<()> {
    Err(CliError::Usage(format!(
        "{}: HDF5 output requires the hdf5 feature",
        path.display()
    )))
}
