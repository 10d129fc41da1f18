//! Iterative geometry refinement from track residuals.
//!
//! Each iteration reconstructs tracks under one geometry snapshot, collects
//! per-device residuals of good tracks, and solves a small linear model per
//! device:
//!
//! ```text
//! dx = cx + tx * dz + y * dgamma + x * sx
//! dy = cy + ty * dz - x * dgamma + y * sy
//! ```
//!
//! where `(x, y)` is the local hit position and `(tx, ty)` the local track
//! slope. `c` is a translation in the local frame, `dz` a shift along the
//! beam, `dgamma` an in-plane rotation and `s` the scale errors caused by
//! wrong tilts. Only the enabled terms enter the model. Corrections are damped
//! and applied to produce the next geometry; the previous snapshot is never
//! modified.

use crate::fitter::TrackFitter;
use crate::processing::{Reconstruction, Reconstructor, TrackStatistics};
use beamtrack_core::{
    AlignmentWarning, DeviceCorrection, DeviceGeometry, Error, EventHits, FittedTrack, Geometry,
    GeometryCorrection, Result,
};
use nalgebra::{DMatrix, DVector, Vector2, Vector3};
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// MAD to Gaussian sigma.
const MAD_SCALE: f64 = 1.4826;

/// Alignment configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct AlignmentConfig {
    /// Iteration limit.
    pub max_iterations: usize,
    /// Movement below which the alignment is converged.
    pub convergence_threshold: f64,
    /// Fraction of the estimated correction applied per iteration.
    pub damping: f64,
    /// Minimum residual samples for a device to be corrected.
    pub min_tracks: usize,
    /// Number of leading events used per iteration (`None` for all).
    pub max_events: Option<usize>,
    /// Devices never moved. Defaults to the first and last device in z.
    pub fixed_devices: Option<Vec<usize>>,
    /// Estimate the in-plane rotation.
    pub align_rotation: bool,
    /// Estimate the tilts about x and y.
    pub align_tilt: bool,
    /// Estimate the z position.
    pub align_z: bool,
    /// Drop residuals further than this many robust sigmas from the median.
    pub robust_cut: Option<f64>,
    /// Use residuals with respect to tracks fitted without the device.
    pub unbiased_residuals: bool,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            convergence_threshold: 1e-4,
            damping: 1.0,
            min_tracks: 10,
            max_events: None,
            fixed_devices: None,
            align_rotation: true,
            align_tilt: false,
            align_z: false,
            robust_cut: None,
            unbiased_residuals: true,
        }
    }
}

impl AlignmentConfig {
    /// Creates an alignment configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the iteration limit.
    #[must_use]
    pub fn with_max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = iterations;
        self
    }

    /// Sets the convergence threshold.
    #[must_use]
    pub fn with_convergence_threshold(mut self, threshold: f64) -> Self {
        self.convergence_threshold = threshold;
        self
    }

    /// Sets the damping factor.
    #[must_use]
    pub fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }

    /// Sets the minimum number of residual samples per device.
    #[must_use]
    pub fn with_min_tracks(mut self, min_tracks: usize) -> Self {
        self.min_tracks = min_tracks;
        self
    }

    /// Limits the events used per iteration.
    #[must_use]
    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = Some(max_events);
        self
    }

    /// Sets the devices that are never moved.
    #[must_use]
    pub fn with_fixed_devices(mut self, devices: Vec<usize>) -> Self {
        self.fixed_devices = Some(devices);
        self
    }

    /// Enables or disables the in-plane rotation.
    #[must_use]
    pub fn with_rotation(mut self, enabled: bool) -> Self {
        self.align_rotation = enabled;
        self
    }

    /// Enables or disables the tilt estimate.
    #[must_use]
    pub fn with_tilt(mut self, enabled: bool) -> Self {
        self.align_tilt = enabled;
        self
    }

    /// Enables or disables the z estimate.
    #[must_use]
    pub fn with_z(mut self, enabled: bool) -> Self {
        self.align_z = enabled;
        self
    }

    /// Enables robust residual trimming.
    #[must_use]
    pub fn with_robust_cut(mut self, sigmas: f64) -> Self {
        self.robust_cut = Some(sigmas);
        self
    }

    /// Checks the configuration.
    ///
    /// # Errors
    /// Returns [`Error::ConfigError`] for damping outside (0, 1], a zero
    /// iteration limit, a negative threshold, or a non-positive robust cut.
    pub fn validate(&self) -> Result<()> {
        if !(self.damping > 0.0 && self.damping <= 1.0) {
            return Err(Error::ConfigError(format!(
                "damping must be in (0, 1], got {}",
                self.damping
            )));
        }
        if self.max_iterations == 0 {
            return Err(Error::ConfigError(
                "at least one iteration is required".to_string(),
            ));
        }
        if self.convergence_threshold.is_nan() || self.convergence_threshold < 0.0 {
            return Err(Error::ConfigError(format!(
                "convergence threshold must be non-negative, got {}",
                self.convergence_threshold
            )));
        }
        if self.min_tracks == 0 {
            return Err(Error::ConfigError("min_tracks must be at least 1".to_string()));
        }
        if let Some(cut) = self.robust_cut {
            if cut.is_nan() || cut <= 0.0 {
                return Err(Error::ConfigError(format!(
                    "robust cut must be positive, got {cut}"
                )));
            }
        }
        Ok(())
    }
}

/// Terminal state of an alignment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AlignmentStatus {
    /// Movement fell below the convergence threshold.
    Converged,
    /// The iteration limit was reached first; the geometry is usable but unconverged.
    MaxIterationsReached,
    /// The run was cancelled between iterations.
    Cancelled,
}

impl AlignmentStatus {
    /// True for [`AlignmentStatus::Converged`].
    #[must_use]
    pub fn is_converged(self) -> bool {
        self == AlignmentStatus::Converged
    }
}

/// One residual observation of a device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResidualSample {
    /// Local hit position.
    pub position: Vector2<f64>,
    /// Local track slope (dx/dz, dy/dz).
    pub slope: Vector2<f64>,
    /// Local residual (hit - prediction).
    pub residual: Vector2<f64>,
}

/// Output of one iteration.
#[derive(Debug, Clone)]
pub struct IterationResult {
    /// Tracks reconstructed under the input geometry.
    pub reconstruction: Reconstruction,
    /// Damped correction to apply.
    pub correction: GeometryCorrection,
    /// Movement metric of the damped correction.
    pub movement: f64,
    /// Residual samples used per device.
    pub samples: Vec<usize>,
    /// Devices left unchanged.
    pub warnings: Vec<AlignmentWarning>,
}

/// Per-iteration record kept in the outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IterationSummary {
    /// Iteration number, starting at 1.
    pub iteration: usize,
    /// Movement metric of the applied correction.
    pub movement: f64,
    /// Good tracks used.
    pub good_tracks: usize,
    /// Mean reduced chi-square of the good tracks.
    pub mean_reduced_chi2: f64,
}

/// Final state of an alignment run.
#[derive(Debug, Clone)]
pub struct AlignmentOutcome {
    /// Final geometry.
    pub geometry: Geometry,
    /// Tracks recomputed under the final geometry.
    pub tracks: Vec<FittedTrack>,
    /// Counters of the final reconstruction.
    pub stats: TrackStatistics,
    /// Terminal state.
    pub status: AlignmentStatus,
    /// Completed iterations.
    pub iterations: usize,
    /// Movement of the last completed iteration.
    pub final_movement: f64,
    /// Iteration history.
    pub history: Vec<IterationSummary>,
    /// Warnings of the last completed iteration.
    pub warnings: Vec<AlignmentWarning>,
}

/// Drives the alignment loop.
pub struct AlignmentEstimator {
    config: AlignmentConfig,
    reconstructor: Reconstructor,
}

impl AlignmentEstimator {
    /// Creates an estimator around a reconstructor.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(config: AlignmentConfig, reconstructor: Reconstructor) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            reconstructor,
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &AlignmentConfig {
        &self.config
    }

    /// Runs the alignment to a terminal state.
    ///
    /// # Errors
    /// Returns an error if the geometry does not match the events.
    pub fn run(&self, events: &[EventHits], initial: &Geometry) -> Result<AlignmentOutcome> {
        self.run_with_cancel(events, initial, &AtomicBool::new(false))
    }

    /// Runs the alignment, checking `cancel` before every iteration.
    ///
    /// A cancelled run returns the geometry of the last completed iteration.
    ///
    /// # Errors
    /// Returns an error if the geometry does not match the events.
    pub fn run_with_cancel(
        &self,
        events: &[EventHits],
        initial: &Geometry,
        cancel: &AtomicBool,
    ) -> Result<AlignmentOutcome> {
        let sample = self.sample(events);
        for event in sample {
            initial.check_devices(event.device_count())?;
        }

        let mut geometry = initial.clone();
        let mut status = AlignmentStatus::MaxIterationsReached;
        let mut history = Vec::new();
        let mut warnings = Vec::new();
        let mut iterations = 0;
        let mut final_movement = f64::NAN;

        for iteration in 1..=self.config.max_iterations {
            if cancel.load(Ordering::Relaxed) {
                log::info!("alignment cancelled before iteration {iteration}");
                status = AlignmentStatus::Cancelled;
                break;
            }

            let result = self.iterate(sample, &geometry)?;
            geometry = geometry.corrected(&result.correction);
            iterations = iteration;
            final_movement = result.movement;
            warnings = result.warnings;

            let summary = summarize(iteration, result.movement, &result.reconstruction);
            log::debug!(
                "iteration {iteration}: movement {:.3e}, {} good tracks, mean chi2/dof {:.3}",
                summary.movement,
                summary.good_tracks,
                summary.mean_reduced_chi2
            );
            history.push(summary);

            if result.movement < self.config.convergence_threshold {
                status = AlignmentStatus::Converged;
                break;
            }
        }

        match status {
            AlignmentStatus::Converged => {
                log::info!("alignment converged after {iterations} iterations");
            }
            AlignmentStatus::MaxIterationsReached => log::warn!(
                "alignment not converged after {iterations} iterations (movement {final_movement:.3e})"
            ),
            AlignmentStatus::Cancelled => {}
        }

        let reconstruction = self.reconstructor.reconstruct(sample, &geometry)?;
        Ok(AlignmentOutcome {
            geometry,
            tracks: reconstruction.tracks,
            stats: reconstruction.stats,
            status,
            iterations,
            final_movement,
            history,
            warnings,
        })
    }

    fn sample<'a>(&self, events: &'a [EventHits]) -> &'a [EventHits] {
        let n = self.config.max_events.unwrap_or(events.len()).min(events.len());
        &events[..n]
    }

    /// Devices that are never moved under a geometry.
    #[must_use]
    pub fn fixed_devices(&self, geometry: &Geometry) -> Vec<usize> {
        if let Some(fixed) = &self.config.fixed_devices {
            return fixed.clone();
        }
        let order = geometry.z_order();
        match (order.first(), order.last()) {
            (Some(&first), Some(&last)) if first != last => vec![first, last],
            (Some(&first), _) => vec![first],
            _ => Vec::new(),
        }
    }

    /// One alignment step: reconstruct under `geometry` and estimate the correction.
    ///
    /// This is a pure function of its inputs; the caller applies the correction.
    ///
    /// # Errors
    /// Returns an error if the geometry does not match the events.
    pub fn iterate(&self, events: &[EventHits], geometry: &Geometry) -> Result<IterationResult> {
        let reconstruction = self.reconstructor.reconstruct(events, geometry)?;
        let fixed = self.fixed_devices(geometry);
        let samples = collect_samples(
            &reconstruction.tracks,
            geometry,
            self.reconstructor.fitter(),
            &fixed,
            self.config.unbiased_residuals,
        );

        let mut correction = GeometryCorrection::zero(geometry.len());
        let mut warnings = Vec::new();
        for (device, device_samples) in samples.iter().enumerate() {
            if fixed.contains(&device) {
                continue;
            }
            if device_samples.len() < self.config.min_tracks {
                let warning = AlignmentWarning::InsufficientTracks {
                    device,
                    found: device_samples.len(),
                    required: self.config.min_tracks,
                };
                log::warn!("{warning}");
                warnings.push(warning);
                continue;
            }
            match estimate_correction(geometry.device(device), device_samples, &self.config) {
                Some(delta) => correction.devices[device] = delta.scaled(self.config.damping),
                None => {
                    let warning = AlignmentWarning::SingularCorrection { device };
                    log::warn!("{warning}");
                    warnings.push(warning);
                }
            }
        }

        let movement = correction.movement();
        Ok(IterationResult {
            reconstruction,
            correction,
            movement,
            samples: samples.iter().map(Vec::len).collect(),
            warnings,
        })
    }
}

#[allow(clippy::cast_precision_loss)]
fn summarize(iteration: usize, movement: f64, reconstruction: &Reconstruction) -> IterationSummary {
    let (count, sum) = reconstruction
        .good_tracks()
        .map(FittedTrack::reduced_chi2)
        .filter(|c| c.is_finite())
        .fold((0usize, 0.0), |(n, s), c| (n + 1, s + c));
    IterationSummary {
        iteration,
        movement,
        good_tracks: reconstruction.good_tracks().count(),
        mean_reduced_chi2: if count > 0 { sum / count as f64 } else { f64::NAN },
    }
}

/// Residual samples per device from the good tracks.
///
/// Fitted devices contribute their unbiased residual when enabled; devices
/// excluded by configuration contribute their extrapolated residual; devices
/// dropped as outliers and fixed devices contribute nothing.
fn collect_samples(
    tracks: &[FittedTrack],
    geometry: &Geometry,
    fitter: &TrackFitter,
    fixed: &[usize],
    unbiased: bool,
) -> Vec<Vec<ResidualSample>> {
    let mut samples = vec![Vec::new(); geometry.len()];
    for track in tracks.iter().filter(|t| t.is_good()) {
        for (device, fit) in track.devices.iter().enumerate().take(geometry.len()) {
            if fixed.contains(&device) || !fit.has_hit() || track.dropped.contains(&device) {
                continue;
            }
            let Some(hit) = track.candidate.hit(device) else {
                continue;
            };
            let residual = if fit.used_in_fit() && unbiased {
                fitter.unbiased_residual(&track.candidate, geometry, device)
            } else {
                fit.residual
            };
            let Some(residual) = residual.filter(|r| r.x.is_finite() && r.y.is_finite()) else {
                continue;
            };
            let placement = geometry.device(device);
            let local_direction: Vector3<f64> =
                placement.rotation_matrix().inverse() * track.line.direction;
            if local_direction.z.abs() <= f64::EPSILON {
                continue;
            }
            samples[device].push(ResidualSample {
                position: hit.local_xy(),
                slope: local_direction.xy() / local_direction.z,
                residual,
            });
        }
    }
    samples
}

/// Undamped correction of one device from its residual samples.
///
/// Returns `None` when the linear system is singular (for example all hits at
/// the same position with rotation enabled).
#[must_use]
pub fn estimate_correction(
    placement: &DeviceGeometry,
    samples: &[ResidualSample],
    config: &AlignmentConfig,
) -> Option<DeviceCorrection> {
    let trimmed;
    let samples = match config.robust_cut {
        Some(cut) => {
            trimmed = trim_outliers(samples, cut);
            trimmed.as_slice()
        }
        None => samples,
    };
    if samples.is_empty() {
        return None;
    }

    // Column layout: cx, cy, then the enabled terms.
    let z_col = config.align_z.then_some(2);
    let gamma_col = config.align_rotation.then(|| 2 + usize::from(config.align_z));
    let tilt_cols = config.align_tilt.then(|| {
        let base = 2 + usize::from(config.align_z) + usize::from(config.align_rotation);
        (base, base + 1)
    });
    let params = 2
        + usize::from(config.align_z)
        + usize::from(config.align_rotation)
        + 2 * usize::from(config.align_tilt);

    let rows = 2 * samples.len();
    let mut a = DMatrix::<f64>::zeros(rows, params);
    let mut b = DVector::<f64>::zeros(rows);
    for (i, sample) in samples.iter().enumerate() {
        let (rx, ry) = (2 * i, 2 * i + 1);
        let p = sample.position;
        a[(rx, 0)] = 1.0;
        a[(ry, 1)] = 1.0;
        if let Some(c) = z_col {
            a[(rx, c)] = sample.slope.x;
            a[(ry, c)] = sample.slope.y;
        }
        if let Some(c) = gamma_col {
            a[(rx, c)] = p.y;
            a[(ry, c)] = -p.x;
        }
        if let Some((sx, sy)) = tilt_cols {
            a[(rx, sx)] = p.x;
            a[(ry, sy)] = p.y;
        }
        b[rx] = sample.residual.x;
        b[ry] = sample.residual.y;
    }

    let normal = a.transpose() * &a;
    let rhs = a.transpose() * &b;
    let solution = normal.cholesky()?.solve(&rhs);
    if solution.iter().any(|v| !v.is_finite()) {
        return None;
    }

    // The residual is R^T (t_model - t_true): move the device against it.
    let local_shift = Vector3::new(solution[0], solution[1], 0.0);
    let shift = placement.rotation_matrix() * local_shift;
    let mut translation = Vector3::new(-shift.x, -shift.y, 0.0);
    if let Some(c) = z_col {
        translation.z = solution[c];
    }

    let mut rotation = Vector3::zeros();
    if let Some(c) = gamma_col {
        rotation.z = solution[c];
    }
    if let Some((sx, sy)) = tilt_cols {
        rotation.x = tilt_from_scale(placement.rotation.x, solution[sy]) - placement.rotation.x;
        rotation.y = tilt_from_scale(placement.rotation.y, solution[sx]) - placement.rotation.y;
    }

    Some(DeviceCorrection {
        translation,
        rotation,
    })
}

/// Tilt angle that explains a relative scale error `scale` on top of `current`.
///
/// The sign of the tilt is not observable; the current sign is kept.
fn tilt_from_scale(current: f64, scale: f64) -> f64 {
    let denominator = 1.0 + scale;
    if denominator <= 0.0 {
        return current;
    }
    let cosine = (current.cos() / denominator).clamp(-1.0, 1.0);
    let angle = cosine.acos();
    if current < 0.0 {
        -angle
    } else {
        angle
    }
}

fn median(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

/// Drops samples further than `cut` robust sigmas (MAD based) from the median on either axis.
///
/// An axis with zero MAD is not trimmed.
fn trim_outliers(samples: &[ResidualSample], cut: f64) -> Vec<ResidualSample> {
    if samples.is_empty() {
        return Vec::new();
    }
    let mut limits = [(0.0, f64::INFINITY); 2];
    for (axis, limit) in limits.iter_mut().enumerate() {
        let mut values: Vec<f64> = samples.iter().map(|s| s.residual[axis]).collect();
        let center = median(&mut values);
        let mut deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
        let mad = median(&mut deviations);
        if mad > 0.0 {
            *limit = (center, cut * MAD_SCALE * mad);
        }
    }
    samples
        .iter()
        .filter(|s| {
            limits
                .iter()
                .enumerate()
                .all(|(axis, (center, width))| (s.residual[axis] - center).abs() <= *width)
        })
        .copied()
        .collect()
}
