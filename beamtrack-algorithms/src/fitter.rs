//! Straight-line track fitting with iterative outlier rejection.
//!
//! The line is parameterised as `x = x0 + sx * z`, `y = y0 + sy * z` and fitted
//! per axis by weighted least squares on the global hit positions. Residuals
//! are evaluated in each device's local frame at the intersection of the line
//! with the device plane, so rotated devices see their own transverse axes.

use beamtrack_core::{
    DeviceFit, DeviceRole, Error, FitTermination, FittedTrack, Geometry, HitQuality,
    LineParameters, Result, Setup, TrackCandidate, TrackStatus,
};
use nalgebra::{Vector2, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Minimum z spread (length units) below which a fit is degenerate.
const MIN_Z_SPREAD: f64 = 1e-9;

/// Track fitter configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FitConfig {
    /// Minimum number of devices that must constrain the fit.
    pub min_devices: usize,
    /// Residual norm above which the worst device is dropped and the track refitted.
    /// The cut is inclusive: a residual equal to the cut is kept.
    pub residual_cut: Option<f64>,
    /// Devices that never constrain the fit but receive extrapolated residuals.
    pub excluded_devices: Vec<usize>,
    /// Devices that are never dropped as outliers.
    pub included_devices: Vec<usize>,
    /// Weight devices by their intrinsic resolution.
    pub use_resolution: bool,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            min_devices: 2,
            residual_cut: None,
            excluded_devices: Vec::new(),
            included_devices: Vec::new(),
            use_resolution: true,
        }
    }
}

impl FitConfig {
    /// Creates a fit configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the minimum number of fitted devices.
    #[must_use]
    pub fn with_min_devices(mut self, min_devices: usize) -> Self {
        self.min_devices = min_devices;
        self
    }

    /// Sets the residual cut.
    #[must_use]
    pub fn with_residual_cut(mut self, cut: f64) -> Self {
        self.residual_cut = Some(cut);
        self
    }

    /// Sets the devices excluded from the fit.
    #[must_use]
    pub fn with_excluded_devices(mut self, devices: Vec<usize>) -> Self {
        self.excluded_devices = devices;
        self
    }

    /// Sets the devices that are never dropped.
    #[must_use]
    pub fn with_included_devices(mut self, devices: Vec<usize>) -> Self {
        self.included_devices = devices;
        self
    }

    /// Enables or disables resolution weighting.
    #[must_use]
    pub fn with_resolution_weights(mut self, enabled: bool) -> Self {
        self.use_resolution = enabled;
        self
    }

    /// Checks the configuration for impossible values.
    ///
    /// # Errors
    /// Returns [`Error::ConfigError`] when `min_devices < 2`, the cut is not
    /// positive, or a device is both included and excluded.
    pub fn validate(&self) -> Result<()> {
        if self.min_devices < 2 {
            return Err(Error::ConfigError(
                "a straight-line fit needs at least 2 devices".to_string(),
            ));
        }
        if let Some(cut) = self.residual_cut {
            if cut.is_nan() || cut <= 0.0 {
                return Err(Error::ConfigError(format!(
                    "residual cut must be positive, got {cut}"
                )));
            }
        }
        if let Some(device) = self
            .included_devices
            .iter()
            .find(|d| self.excluded_devices.contains(d))
        {
            return Err(Error::ConfigError(format!(
                "device {device} is both included in and excluded from the fit"
            )));
        }
        Ok(())
    }
}

/// Fits straight lines through track candidates.
#[derive(Debug, Clone)]
pub struct TrackFitter {
    config: FitConfig,
    resolutions: Vec<Vector2<f64>>,
}

impl TrackFitter {
    /// Creates a fitter with unit weights for every device.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(config: FitConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            resolutions: Vec::new(),
        })
    }

    /// Creates a fitter weighting devices by the setup's resolutions.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn for_setup(config: FitConfig, setup: &Setup) -> Result<Self> {
        let resolutions = setup.devices.iter().map(|d| d.resolution()).collect();
        Ok(Self::new(config)?.with_resolutions(resolutions))
    }

    /// Sets the per-device resolution (x, y).
    #[must_use]
    pub fn with_resolutions(mut self, resolutions: Vec<Vector2<f64>>) -> Self {
        self.resolutions = resolutions;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    fn resolution(&self, device: usize) -> Vector2<f64> {
        match self.resolutions.get(device) {
            Some(r) if r.x > 0.0 && r.y > 0.0 => *r,
            _ => Vector2::new(1.0, 1.0),
        }
    }

    fn weight(&self, device: usize) -> Vector2<f64> {
        if self.config.use_resolution {
            let r = self.resolution(device);
            Vector2::new(1.0 / (r.x * r.x), 1.0 / (r.y * r.y))
        } else {
            Vector2::new(1.0, 1.0)
        }
    }

    /// Fits a candidate under a geometry.
    ///
    /// Devices with a hit that are not excluded start in the fit. While the
    /// worst fitted residual exceeds the cut and dropping it keeps at least
    /// `min_devices`, that device is dropped and the line refitted. The loop
    /// runs at most once per device.
    #[must_use]
    pub fn fit(&self, candidate: &TrackCandidate, geometry: &Geometry) -> FittedTrack {
        self.fit_excluding(candidate, geometry, None)
    }

    /// Residual of `device` with respect to the line fitted without it.
    ///
    /// Returns `None` if the device has no hit, the remaining devices cannot be
    /// fitted, or they still carry residuals above the cut.
    #[must_use]
    pub fn unbiased_residual(
        &self,
        candidate: &TrackCandidate,
        geometry: &Geometry,
        device: usize,
    ) -> Option<Vector2<f64>> {
        candidate.hit(device)?;
        let track = self.fit_excluding(candidate, geometry, Some(device));
        // The remaining devices may fall below `min_devices`; only the line matters here.
        let usable = track.status == TrackStatus::Good
            || (track.status == TrackStatus::Rejected
                && track.termination == FitTermination::InsufficientDevices);
        if !usable {
            return None;
        }
        track
            .device(device)
            .and_then(|d| d.residual)
            .filter(|r| r.x.is_finite() && r.y.is_finite())
    }

    fn fit_excluding(
        &self,
        candidate: &TrackCandidate,
        geometry: &Geometry,
        extra_excluded: Option<usize>,
    ) -> FittedTrack {
        let devices = candidate.device_count().min(geometry.len());
        let mut used: Vec<usize> = (0..devices)
            .filter(|&d| {
                candidate.has_hit(d)
                    && !self.config.excluded_devices.contains(&d)
                    && extra_excluded != Some(d)
            })
            .collect();
        let mut dropped = Vec::new();
        let floor = self.config.min_devices.max(2);

        if used.len() < 2 {
            return Self::degenerate(candidate, &used, dropped);
        }

        // Bounded: every pass either terminates or removes one device.
        let max_passes = used.len();
        let mut termination = FitTermination::WithinCut;
        let mut fit = None;
        for _ in 0..max_passes {
            let Some(current) = self.fit_line(candidate, geometry, &used) else {
                return Self::degenerate(candidate, &used, dropped);
            };

            let Some(cut) = self.config.residual_cut else {
                fit = Some(current);
                break;
            };

            let worst = used
                .iter()
                .filter(|d| !self.config.included_devices.contains(d))
                .filter_map(|&d| {
                    residual(candidate, geometry, &current, d).map(|r| (d, r.norm()))
                })
                .filter(|(_, norm)| *norm > cut)
                .max_by(|a, b| a.1.total_cmp(&b.1).then(b.0.cmp(&a.0)));

            let any_above = used.iter().any(|&d| {
                residual(candidate, geometry, &current, d).is_some_and(|r| r.norm() > cut)
            });

            match worst {
                None if !any_above => {
                    fit = Some(current);
                    break;
                }
                None => {
                    termination = FitTermination::DeviceFloor;
                    fit = Some(current);
                    break;
                }
                Some(_) if used.len() <= floor => {
                    termination = FitTermination::DeviceFloor;
                    fit = Some(current);
                    break;
                }
                Some((device, _)) => {
                    used.retain(|&d| d != device);
                    dropped.push(device);
                }
            }
        }

        let Some(line) = fit else {
            return Self::degenerate(candidate, &used, dropped);
        };

        let status = if termination == FitTermination::DeviceFloor {
            TrackStatus::Rejected
        } else if used.len() < self.config.min_devices {
            termination = FitTermination::InsufficientDevices;
            TrackStatus::Rejected
        } else {
            TrackStatus::Good
        };

        self.evaluate(candidate, geometry, line, &used, dropped, status, termination)
    }

    /// Weighted least squares per axis over the used devices.
    fn fit_line(
        &self,
        candidate: &TrackCandidate,
        geometry: &Geometry,
        used: &[usize],
    ) -> Option<LineParameters> {
        let mut sums = [[0.0_f64; 5]; 2];
        let mut z_min = f64::INFINITY;
        let mut z_max = f64::NEG_INFINITY;

        for &d in used {
            let hit = candidate.hit(d)?;
            let global = geometry.get(d)?.local_to_global(&hit.position);
            let w = self.weight(d);
            z_min = z_min.min(global.z);
            z_max = z_max.max(global.z);
            for (axis, s) in sums.iter_mut().enumerate() {
                let v = global[axis];
                let wa = w[axis];
                s[0] += wa;
                s[1] += wa * global.z;
                s[2] += wa * global.z * global.z;
                s[3] += wa * v;
                s[4] += wa * global.z * v;
            }
        }

        if z_max - z_min <= MIN_Z_SPREAD || !z_min.is_finite() || !z_max.is_finite() {
            return None;
        }

        let mut params = [(0.0, 0.0); 2];
        for (axis, s) in sums.iter().enumerate() {
            let det = s[0] * s[2] - s[1] * s[1];
            if det == 0.0 || !det.is_finite() {
                return None;
            }
            let slope = (s[0] * s[4] - s[1] * s[3]) / det;
            let intercept = (s[3] - slope * s[1]) / s[0];
            params[axis] = (intercept, slope);
        }

        let line = LineParameters::from_slopes(params[0].0, params[0].1, params[1].0, params[1].1);
        line.is_finite().then_some(line)
    }

    #[allow(clippy::too_many_arguments)]
    fn evaluate(
        &self,
        candidate: &TrackCandidate,
        geometry: &Geometry,
        line: LineParameters,
        used: &[usize],
        dropped: Vec<usize>,
        status: TrackStatus,
        termination: FitTermination,
    ) -> FittedTrack {
        let devices = candidate.device_count();
        let mut fits = Vec::with_capacity(devices);
        let mut chi2 = 0.0;

        for d in 0..devices {
            let role = role_of(candidate, used, d);
            let Some(placement) = geometry.get(d) else {
                fits.push(DeviceFit::undefined(role));
                continue;
            };
            let Some(intercept) = placement.intersect(&line.offset, &line.direction) else {
                fits.push(DeviceFit::undefined(role));
                continue;
            };
            let local_intercept = placement.global_to_local(&intercept).xy();
            let residual = candidate.hit(d).map(|hit| hit.local_xy() - local_intercept);
            let resolution = self.resolution(d);
            let quality = residual.map_or(HitQuality::Outside, |r| {
                HitQuality::classify(&r, &resolution)
            });

            if role == DeviceRole::Fitted {
                if let Some(r) = residual {
                    let w = self.weight(d);
                    chi2 += w.x * r.x * r.x + w.y * r.y * r.y;
                }
            }

            fits.push(DeviceFit {
                role,
                intercept,
                local_intercept,
                residual,
                quality,
            });
        }

        FittedTrack {
            event_number: candidate.event_number,
            line,
            devices: fits,
            chi2,
            dof: (2 * used.len()).saturating_sub(4).max(1),
            status,
            termination,
            dropped,
            isolated: true,
            candidate: candidate.clone(),
        }
    }

    fn degenerate(candidate: &TrackCandidate, used: &[usize], dropped: Vec<usize>) -> FittedTrack {
        let devices = (0..candidate.device_count())
            .map(|d| DeviceFit::undefined(role_of(candidate, used, d)))
            .collect();
        FittedTrack {
            event_number: candidate.event_number,
            line: LineParameters::nan(),
            devices,
            chi2: f64::NAN,
            dof: (2 * used.len()).saturating_sub(4).max(1),
            status: TrackStatus::Degenerate,
            termination: FitTermination::Degenerate,
            dropped,
            isolated: true,
            candidate: candidate.clone(),
        }
    }
}

fn role_of(candidate: &TrackCandidate, used: &[usize], device: usize) -> DeviceRole {
    if used.contains(&device) {
        DeviceRole::Fitted
    } else if candidate.has_hit(device) {
        DeviceRole::Extrapolated
    } else {
        DeviceRole::NoHit
    }
}

/// Local residual of a device's hit with respect to a line.
fn residual(
    candidate: &TrackCandidate,
    geometry: &Geometry,
    line: &LineParameters,
    device: usize,
) -> Option<Vector2<f64>> {
    let hit = candidate.hit(device)?;
    let placement = geometry.get(device)?;
    let intercept: Vector3<f64> = placement.intersect(&line.offset, &line.direction)?;
    Some(hit.local_xy() - placement.global_to_local(&intercept).xy())
}
