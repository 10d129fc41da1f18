//! Track candidates and fitted tracks.

use crate::hit::Hit;
use nalgebra::{Vector2, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A tentative assignment of at most one hit per device for one event.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrackCandidate {
    /// Event number.
    pub event_number: i64,
    /// Selected hit per device (indexed by device id), `None` if the device has no hit.
    pub hits: Vec<Option<Hit>>,
    /// Index of the selected hit within the event's device hit list.
    pub hit_indices: Vec<Option<usize>>,
    /// Device the candidate was seeded from.
    pub seed_device: usize,
    /// Sum of transverse distances between the seed and the other selected hits.
    pub aggregate_distance: f64,
}

impl TrackCandidate {
    /// Creates an empty candidate for `devices` devices.
    #[must_use]
    pub fn new(event_number: i64, devices: usize, seed_device: usize) -> Self {
        Self {
            event_number,
            hits: vec![None; devices],
            hit_indices: vec![None; devices],
            seed_device,
            aggregate_distance: 0.0,
        }
    }

    /// Builds a candidate from an explicit hit list (one optional hit per device).
    ///
    /// Hit indices are set to 0 for present hits; the seed is the first device with a hit.
    #[must_use]
    pub fn from_hits(event_number: i64, hits: Vec<Option<Hit>>) -> Self {
        let hit_indices = hits.iter().map(|h| h.map(|_| 0)).collect();
        let seed_device = hits.iter().position(Option::is_some).unwrap_or(0);
        Self {
            event_number,
            hits,
            hit_indices,
            seed_device,
            aggregate_distance: 0.0,
        }
    }

    /// Number of devices the candidate spans.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.hits.len()
    }

    /// Number of devices with a selected hit.
    #[must_use]
    pub fn hit_count(&self) -> usize {
        self.hits.iter().filter(|h| h.is_some()).count()
    }

    /// Selected hit of a device.
    #[must_use]
    pub fn hit(&self, device: usize) -> Option<&Hit> {
        self.hits.get(device).and_then(Option::as_ref)
    }

    /// Returns true if the device has a selected hit.
    #[must_use]
    pub fn has_hit(&self, device: usize) -> bool {
        self.hit(device).is_some()
    }
}

/// Overall outcome of fitting one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TrackStatus {
    /// Fit succeeded and every used residual is within the cut.
    Good,
    /// The candidate could not satisfy the minimum device count after refinement.
    Rejected,
    /// Fewer than two usable devices or no spread in z: fit parameters are NaN.
    Degenerate,
}

impl TrackStatus {
    /// Short label for tables.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TrackStatus::Good => "good",
            TrackStatus::Rejected => "rejected",
            TrackStatus::Degenerate => "degenerate",
        }
    }
}

/// Why the outlier-rejecting refit loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FitTermination {
    /// No used residual exceeds the cut (or no cut is configured).
    WithinCut,
    /// Dropping another device would go below the minimum device count.
    DeviceFloor,
    /// The candidate had fewer fit devices than required before any refit.
    InsufficientDevices,
    /// The line could not be determined.
    Degenerate,
}

impl FitTermination {
    /// Short label for tables.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FitTermination::WithinCut => "within_cut",
            FitTermination::DeviceFloor => "device_floor",
            FitTermination::InsufficientDevices => "insufficient_devices",
            FitTermination::Degenerate => "degenerate",
        }
    }
}

/// Role of a device in a fitted track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DeviceRole {
    /// The device's hit constrained the fit.
    Fitted,
    /// The device has a hit but it only receives an extrapolated residual.
    Extrapolated,
    /// The device has no hit in this track.
    NoHit,
}

impl DeviceRole {
    /// Short label for tables.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceRole::Fitted => "fitted",
            DeviceRole::Extrapolated => "extrapolated",
            DeviceRole::NoHit => "none",
        }
    }
}

/// How close a device's hit is to the fitted intercept, in units of resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum HitQuality {
    /// Within 1 sigma on both axes.
    OneSigma,
    /// Within 2 sigma.
    TwoSigma,
    /// Within 3 sigma.
    ThreeSigma,
    /// Further away, or no hit.
    Outside,
}

impl HitQuality {
    /// Classifies a residual given the device resolution.
    #[must_use]
    pub fn classify(residual: &Vector2<f64>, resolution: &Vector2<f64>) -> Self {
        let pull = (residual.x / resolution.x)
            .abs()
            .max((residual.y / resolution.y).abs());
        if pull <= 1.0 {
            HitQuality::OneSigma
        } else if pull <= 2.0 {
            HitQuality::TwoSigma
        } else if pull <= 3.0 {
            HitQuality::ThreeSigma
        } else {
            HitQuality::Outside
        }
    }

    /// Numeric level (1, 2, 3; 0 for outside).
    #[must_use]
    pub fn level(self) -> u8 {
        match self {
            HitQuality::OneSigma => 1,
            HitQuality::TwoSigma => 2,
            HitQuality::ThreeSigma => 3,
            HitQuality::Outside => 0,
        }
    }
}

/// Per-device result of a track fit.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceFit {
    /// Role of the device.
    pub role: DeviceRole,
    /// Fitted intercept in the global frame (NaN for degenerate fits or parallel planes).
    pub intercept: Vector3<f64>,
    /// Fitted intercept in the device's local frame.
    pub local_intercept: Vector2<f64>,
    /// Local residual (hit - intercept), if the device has a hit.
    pub residual: Option<Vector2<f64>>,
    /// Hit quality relative to the device resolution.
    pub quality: HitQuality,
}

impl DeviceFit {
    /// Entry for a device that could not be evaluated.
    #[must_use]
    pub fn undefined(role: DeviceRole) -> Self {
        Self {
            role,
            intercept: Vector3::repeat(f64::NAN),
            local_intercept: Vector2::repeat(f64::NAN),
            residual: match role {
                DeviceRole::NoHit => None,
                _ => Some(Vector2::repeat(f64::NAN)),
            },
            quality: HitQuality::Outside,
        }
    }

    /// True if the hit constrained the fit.
    #[must_use]
    pub fn used_in_fit(&self) -> bool {
        self.role == DeviceRole::Fitted
    }

    /// True if the device has a hit.
    #[must_use]
    pub fn has_hit(&self) -> bool {
        self.role != DeviceRole::NoHit
    }
}

/// Straight-line fit parameters: `point(z) = offset + direction * (z - offset.z) / direction.z`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LineParameters {
    /// Reference point of the line (at z = 0).
    pub offset: Vector3<f64>,
    /// Unit direction vector, pointing downstream.
    pub direction: Vector3<f64>,
}

impl LineParameters {
    /// Line parameters of a degenerate fit.
    #[must_use]
    pub fn nan() -> Self {
        Self {
            offset: Vector3::repeat(f64::NAN),
            direction: Vector3::repeat(f64::NAN),
        }
    }

    /// Builds a line from `x = x0 + sx * z`, `y = y0 + sy * z`.
    #[must_use]
    pub fn from_slopes(x0: f64, sx: f64, y0: f64, sy: f64) -> Self {
        Self {
            offset: Vector3::new(x0, y0, 0.0),
            direction: Vector3::new(sx, sy, 1.0).normalize(),
        }
    }

    /// Transverse slopes (dx/dz, dy/dz).
    #[must_use]
    pub fn slopes(&self) -> Vector2<f64> {
        Vector2::new(
            self.direction.x / self.direction.z,
            self.direction.y / self.direction.z,
        )
    }

    /// Point on the line at a given z.
    #[must_use]
    pub fn at_z(&self, z: f64) -> Vector3<f64> {
        let slopes = self.slopes();
        Vector3::new(
            self.offset.x + slopes.x * z,
            self.offset.y + slopes.y * z,
            z,
        )
    }

    /// True when all parameters are finite.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.offset.iter().chain(self.direction.iter()).all(|v| v.is_finite())
    }
}

/// The result of fitting one track candidate. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FittedTrack {
    /// Event number.
    pub event_number: i64,
    /// Fitted line.
    pub line: LineParameters,
    /// Per-device results, indexed by device id.
    pub devices: Vec<DeviceFit>,
    /// Sum of squared weighted residuals of the used devices.
    pub chi2: f64,
    /// Degrees of freedom: two measurements per used device minus the four
    /// line parameters, at least 1.
    pub dof: usize,
    /// Track status.
    pub status: TrackStatus,
    /// Why the refit loop stopped.
    pub termination: FitTermination,
    /// Devices dropped as outliers, in drop order.
    pub dropped: Vec<usize>,
    /// False when another track of the same event passes too close.
    pub isolated: bool,
    /// The candidate the track was fitted from.
    pub candidate: TrackCandidate,
}

impl FittedTrack {
    /// `chi2 / dof`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn reduced_chi2(&self) -> f64 {
        self.chi2 / self.dof.max(1) as f64
    }

    /// True for tracks with status [`TrackStatus::Good`].
    #[must_use]
    pub fn is_good(&self) -> bool {
        self.status == TrackStatus::Good
    }

    /// Number of devices whose hit constrained the fit.
    #[must_use]
    pub fn used_devices(&self) -> usize {
        self.devices.iter().filter(|d| d.used_in_fit()).count()
    }

    /// Result for one device.
    #[must_use]
    pub fn device(&self, device: usize) -> Option<&DeviceFit> {
        self.devices.get(device)
    }
}
