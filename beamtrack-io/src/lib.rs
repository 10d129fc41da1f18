//! beamtrack-io: File I/O for beamtrack.
//!
//! This crate provides hit-table readers (CSV and memory-mapped binary),
//! track-table writers, setup/geometry/run-configuration files, and
//! memory-budgeted chunk sizing.
//!

pub mod chunks;
pub mod config;
mod error;
pub mod geometry;
#[cfg(feature = "hdf5")]
pub mod hdf5;
mod reader;
mod writer;

pub use chunks::ChunkSizing;
pub use config::RunConfig;
pub use error::{Error, Result};
pub use geometry::{load_setup, save_setup, DeviceRecord, GeometryRecord};
#[cfg(feature = "hdf5")]
pub use hdf5::{Hdf5TrackSink, TrackWriteOptions};
pub use reader::{
    HitTableReader, MappedFileReader, MappedHitTable, BINARY_EXTENSION, HIT_RECORD_BYTES,
    HIT_TABLE_MAGIC,
};
pub use writer::{HitTableWriter, TrackTableWriter};
