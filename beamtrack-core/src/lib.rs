//! beamtrack-core: Core types for beam telescope track reconstruction.
//!
//! This crate provides the data model shared by the track finder, the track
//! fitter and the alignment loop: hits, device descriptions, device geometry,
//! per-event hit sets, correlation histograms, track candidates and fitted
//! tracks.
//!

pub mod error;
pub mod event;
pub mod geometry;
pub mod histogram;
pub mod hit;
pub mod setup;
pub mod track;
pub mod warning;

pub use error::{Error, Result};
pub use event::{merge_device_streams, validate_stream, EventHits};
pub use geometry::{cmp_f64, DeviceCorrection, DeviceGeometry, Geometry, GeometryCorrection};
pub use histogram::{Axis, Binning, CorrelationHistogram, Projection};
pub use hit::Hit;
pub use setup::{DeviceSpec, Setup};
pub use track::{
    DeviceFit, DeviceRole, FitTermination, FittedTrack, HitQuality, LineParameters,
    TrackCandidate, TrackStatus,
};
pub use warning::AlignmentWarning;
