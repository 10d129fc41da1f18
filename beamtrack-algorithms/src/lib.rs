//! beamtrack-algorithms: Reconstruction and alignment algorithms.
//!
//! This crate provides the processing stages of a telescope run:
//! - **Correlation** - coarse hit-pair histograms against a reference device
//! - **Prealignment** - per-device offsets from the correlation peaks
//! - **Track finding** - nearest-neighbour candidate building in global coordinates
//! - **Track fitting** - weighted straight-line fits with outlier removal
//! - **Alignment** - iterative geometry refinement from unbiased residuals
//!
#![warn(missing_docs)]

mod alignment;
mod correlation;
mod event_check;
mod finder;
mod fitter;
mod prealignment;
mod processing;

pub use alignment::{
    estimate_correction, AlignmentConfig, AlignmentEstimator, AlignmentOutcome, AlignmentStatus,
    IterationResult, IterationSummary, ResidualSample,
};
pub use correlation::{correlate_all, correlate_devices, CorrelationConfig, DeviceCorrelation};
pub use event_check::{find_correlation_breaks, CorrelationBreak};
pub use finder::{EventCandidates, FinderConfig, FinderOutput, TrackFinder};
pub use fitter::{FitConfig, TrackFitter};
pub use prealignment::{
    AxisEstimate, DeviceEstimate, PrealignmentConfig, PrealignmentEstimator, PrealignmentOutcome,
};
pub use processing::{reconstruct, ProcessingConfig, Reconstruction, Reconstructor, TrackStatistics};

// Re-export the core types every stage works on
pub use beamtrack_core::{AlignmentWarning, EventHits, FittedTrack, Geometry, Setup};
