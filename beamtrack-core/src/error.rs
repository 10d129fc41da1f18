//! Error types for beamtrack-core.

use thiserror::Error;

/// Result type alias for beamtrack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for beamtrack operations.
///
/// Only structural failures live here. Per-event and per-candidate outcomes
/// (degenerate fits, rejected tracks, unconverged alignment) are reported
/// through status fields on the produced records instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Event numbers within one device stream went backwards.
    #[error("non-monotonic event number on device {device}: {previous} followed by {current}")]
    NonMonotonicEvent {
        device: usize,
        previous: i64,
        current: i64,
    },

    /// A hit was found in the stream of a different device.
    #[error("hit of device {found} found in the stream of device {expected}")]
    DeviceMismatch { expected: usize, found: usize },

    /// A device id outside the configured setup.
    #[error("unknown device id {device} (setup has {devices} devices)")]
    UnknownDevice { device: usize, devices: usize },

    /// Malformed hit record.
    #[error("invalid hit record: {0}")]
    InvalidHit(String),

    /// Geometry does not match the number of devices it is used with.
    #[error("geometry describes {found} devices, expected {expected}")]
    GeometryMismatch { expected: usize, found: usize },

    /// Configuration error.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Worker pool could not be created.
    #[error("worker pool error: {0}")]
    WorkerPool(String),
}

impl Error {
    /// Returns true for the input-error family (malformed or inconsistent hit data).
    #[must_use]
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Error::NonMonotonicEvent { .. }
                | Error::DeviceMismatch { .. }
                | Error::UnknownDevice { .. }
                | Error::InvalidHit(_)
        )
    }
}
