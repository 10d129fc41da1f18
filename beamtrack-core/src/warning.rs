//! Non-fatal geometry warnings attached to prealignment and alignment output.

use crate::histogram::Axis;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A device whose geometry could not be estimated and fell back to a default.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AlignmentWarning {
    /// No event-matched hit pairs between the device and the reference.
    EmptyCorrelation { device: usize, axis: Axis },
    /// The correlation peak is flat or not separated from a secondary peak.
    WeakPeak {
        device: usize,
        axis: Axis,
        significance: f64,
    },
    /// Too few tracks used the device to estimate a correction.
    InsufficientTracks {
        device: usize,
        found: usize,
        required: usize,
    },
    /// The correction system for the device was singular.
    SingularCorrection { device: usize },
}

impl AlignmentWarning {
    /// Device the warning refers to.
    #[must_use]
    pub fn device(&self) -> usize {
        match self {
            AlignmentWarning::EmptyCorrelation { device, .. }
            | AlignmentWarning::WeakPeak { device, .. }
            | AlignmentWarning::InsufficientTracks { device, .. }
            | AlignmentWarning::SingularCorrection { device } => *device,
        }
    }
}

impl fmt::Display for AlignmentWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlignmentWarning::EmptyCorrelation { device, axis } => {
                write!(f, "device {device}: no correlated hits on {axis:?}, using fallback offset")
            }
            AlignmentWarning::WeakPeak {
                device,
                axis,
                significance,
            } => write!(
                f,
                "device {device}: correlation peak on {axis:?} not separated (significance {significance:.2}), using fallback offset"
            ),
            AlignmentWarning::InsufficientTracks {
                device,
                found,
                required,
            } => write!(
                f,
                "device {device}: {found} usable tracks, {required} required, geometry unchanged"
            ),
            AlignmentWarning::SingularCorrection { device } => {
                write!(f, "device {device}: singular correction system, geometry unchanged")
            }
        }
    }
}
