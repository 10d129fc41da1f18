//! Coarse offsets from correlation histograms.
//!
//! The histogram is projected onto `device - reference`. The peak is the
//! sliding window of `window_pitches` pitches with the largest content; its
//! significance is the window excess over the mean background per bin,
//! divided by the Poisson error of that background. The offset is the
//! background-subtracted centroid of the peak region. Histograms that are
//! empty, flat, or carry a competing secondary peak fall back to a
//! configured offset and produce a warning.

use crate::correlation::DeviceCorrelation;
use beamtrack_core::{
    AlignmentWarning, Axis, CorrelationHistogram, DeviceGeometry, Error, Geometry, Projection,
    Result, Setup,
};
use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Prealignment configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PrealignmentConfig {
    /// Width of the peak search window, in pitches.
    pub window_pitches: f64,
    /// Minimum peak significance; weaker peaks fall back.
    pub min_peak_significance: f64,
    /// Maximum excess of a secondary peak relative to the main one.
    pub max_secondary_ratio: f64,
    /// Also fit the ridge slope (reported, not applied).
    pub fit_slope: bool,
    /// Minimum entries in a reference bin for it to contribute a ridge point.
    pub min_row_entries: u32,
    /// Fallback device offsets (x, y) keyed by device id.
    pub fallback_offsets: BTreeMap<usize, [f64; 2]>,
}

impl Default for PrealignmentConfig {
    fn default() -> Self {
        Self {
            window_pitches: 3.0,
            min_peak_significance: 5.0,
            max_secondary_ratio: 0.5,
            fit_slope: false,
            min_row_entries: 3,
            fallback_offsets: BTreeMap::new(),
        }
    }
}

impl PrealignmentConfig {
    /// Creates a prealignment configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the peak window width in pitches.
    #[must_use]
    pub fn with_window_pitches(mut self, pitches: f64) -> Self {
        self.window_pitches = pitches;
        self
    }

    /// Sets the minimum peak significance.
    #[must_use]
    pub fn with_min_peak_significance(mut self, significance: f64) -> Self {
        self.min_peak_significance = significance;
        self
    }

    /// Enables the ridge slope fit.
    #[must_use]
    pub fn with_fit_slope(mut self, enabled: bool) -> Self {
        self.fit_slope = enabled;
        self
    }

    /// Sets the fallback offset of a device.
    #[must_use]
    pub fn with_fallback_offset(mut self, device: usize, x: f64, y: f64) -> Self {
        self.fallback_offsets.insert(device, [x, y]);
        self
    }

    /// Checks the configuration.
    ///
    /// # Errors
    /// Returns [`Error::ConfigError`] for non-positive window or ratio values.
    pub fn validate(&self) -> Result<()> {
        if self.window_pitches.is_nan() || self.window_pitches <= 0.0 {
            return Err(Error::ConfigError(format!(
                "peak window must be positive, got {} pitches",
                self.window_pitches
            )));
        }
        if self.max_secondary_ratio.is_nan() || self.max_secondary_ratio <= 0.0 {
            return Err(Error::ConfigError(format!(
                "secondary peak ratio must be positive, got {}",
                self.max_secondary_ratio
            )));
        }
        if self.min_peak_significance.is_nan() {
            return Err(Error::ConfigError("peak significance is NaN".to_string()));
        }
        Ok(())
    }
}

/// Peak estimate of one correlation axis.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AxisEstimate {
    /// Axis of the estimate.
    pub axis: Axis,
    /// Peak of `device - reference` in local coordinates.
    pub offset: f64,
    /// RMS width of the peak.
    pub sigma: f64,
    /// Peak significance.
    pub significance: f64,
    /// Slope of device versus reference coordinate, if fitted.
    pub slope: Option<f64>,
}

/// Estimates of one device.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceEstimate {
    /// Device id.
    pub device: usize,
    /// Estimates for x and y; `None` where the fallback was used.
    pub axes: [Option<AxisEstimate>; 2],
}

/// Result of a prealignment pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PrealignmentOutcome {
    /// Initial geometry for the alignment.
    pub geometry: Geometry,
    /// Per-device estimates.
    pub estimates: Vec<DeviceEstimate>,
    /// Devices that fell back to a default offset.
    pub warnings: Vec<AlignmentWarning>,
}

/// Peak window found on a projection.
struct Peak {
    start: usize,
    width: usize,
    sum: f64,
}

/// Estimates initial device offsets from correlation histograms.
#[derive(Debug, Clone)]
pub struct PrealignmentEstimator {
    config: PrealignmentConfig,
}

impl PrealignmentEstimator {
    /// Creates an estimator.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(config: PrealignmentConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Locates the correlation ridge of one histogram.
    ///
    /// `pitch` sets the peak window width. Returns a warning instead of an
    /// estimate when the histogram is empty or the peak is not separated.
    ///
    /// # Errors
    /// Returns the [`AlignmentWarning`] describing why no estimate was made.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn estimate_axis(
        &self,
        histogram: &CorrelationHistogram,
        pitch: f64,
    ) -> std::result::Result<AxisEstimate, AlignmentWarning> {
        let device = histogram.device;
        let axis = histogram.axis;
        if histogram.is_empty() {
            return Err(AlignmentWarning::EmptyCorrelation { device, axis });
        }

        let projection = histogram.difference_projection();
        let bins = projection.counts.len();
        let window = ((self.config.window_pitches * pitch / projection.binning.width()).round()
            as usize)
            .clamp(1, bins);

        let Some(main) = best_window(&projection.counts, window, None) else {
            return Err(AlignmentWarning::EmptyCorrelation { device, axis });
        };

        // Peak region: the window plus one window on either side.
        let region_start = main.start.saturating_sub(main.width);
        let region_end = (main.start + 2 * main.width).min(bins);

        let (outside_sum, outside_bins) = projection
            .counts
            .iter()
            .enumerate()
            .filter(|(k, _)| *k < region_start || *k >= region_end)
            .fold((0.0, 0usize), |(s, n), (_, c)| (s + c, n + 1));
        let background = if outside_bins > 0 {
            outside_sum / outside_bins as f64
        } else {
            0.0
        };

        let expected = background * main.width as f64;
        let excess = main.sum - expected;
        let significance = excess / expected.max(1.0).sqrt();

        let secondary = best_window(&projection.counts, window, Some((region_start, region_end)));
        let bimodal = secondary.is_some_and(|s| {
            s.sum - expected > self.config.max_secondary_ratio * excess
        });

        if bimodal || significance < self.config.min_peak_significance {
            return Err(AlignmentWarning::WeakPeak {
                device,
                axis,
                significance,
            });
        }

        let (offset, sigma) = centroid(&projection, region_start, region_end, background);
        let mut estimate = AxisEstimate {
            axis,
            offset,
            sigma,
            significance,
            slope: None,
        };

        if self.config.fit_slope {
            let band = (self.config.window_pitches * pitch).max(projection.binning.width());
            if let Some((intercept, slope)) = self.fit_ridge(histogram, offset, band) {
                estimate.offset = intercept;
                estimate.slope = Some(slope);
            }
        }

        Ok(estimate)
    }

    /// Fits `device = intercept + slope * reference` through per-row ridge points.
    fn fit_ridge(
        &self,
        histogram: &CorrelationHistogram,
        offset: f64,
        band: f64,
    ) -> Option<(f64, f64)> {
        let mut points = Vec::new();
        for i in 0..histogram.reference_binning.bins {
            let r = histogram.reference_binning.center(i);
            let (mut weight, mut sum) = (0.0, 0.0);
            for (j, &count) in histogram.row(i).iter().enumerate() {
                let d = histogram.device_binning.center(j);
                if (d - r - offset).abs() <= band {
                    weight += f64::from(count);
                    sum += f64::from(count) * d;
                }
            }
            if weight >= f64::from(self.config.min_row_entries) && weight > 0.0 {
                points.push((r, sum / weight, weight));
            }
        }

        let (intercept, slope) = weighted_line(&points)?;
        let rms = {
            let (sw, s2) = points.iter().fold((0.0, 0.0), |(sw, s2), &(x, y, w)| {
                let res = y - intercept - slope * x;
                (sw + w, s2 + w * res * res)
            });
            (s2 / sw).sqrt()
        };
        if rms > 0.0 {
            points.retain(|&(x, y, _)| (y - intercept - slope * x).abs() <= 3.0 * rms);
        }
        weighted_line(&points)
    }

    /// Builds an initial geometry from per-device correlations.
    ///
    /// The reference device keeps its placement. Every other device gets
    /// `offset = reference_offset - peak` per axis; z positions and rotations
    /// are kept from `initial`.
    ///
    /// # Errors
    /// Returns an error if `initial` does not match the setup or a correlation
    /// refers to an unknown device.
    pub fn prealign(
        &self,
        correlations: &[DeviceCorrelation],
        setup: &Setup,
        initial: &Geometry,
    ) -> Result<PrealignmentOutcome> {
        initial.check_devices(setup.len())?;
        let mut geometry = initial.clone();
        let mut estimates = Vec::with_capacity(correlations.len());
        let mut warnings = Vec::new();

        for correlation in correlations {
            let device = correlation.device;
            let spec = setup.device(device)?;
            let reference = correlation.axis(Axis::X).reference;
            let reference_spec = setup.device(reference)?;
            let reference_offset = initial.device(reference).offset;
            let current: DeviceGeometry = *initial.device(device);

            let mut offset = current.offset;
            let mut axes = [None, None];
            for axis in Axis::ALL {
                let pitch = match axis {
                    Axis::X => spec.pitch_x.min(reference_spec.pitch_x),
                    Axis::Y => spec.pitch_y.min(reference_spec.pitch_y),
                };
                let k = axis.index();
                match self.estimate_axis(correlation.axis(axis), pitch) {
                    Ok(estimate) => {
                        offset[k] = reference_offset[k] - estimate.offset;
                        log::debug!(
                            "device {device} {axis:?}: peak {:.4} (sigma {:.4}, significance {:.1})",
                            estimate.offset,
                            estimate.sigma,
                            estimate.significance
                        );
                        axes[k] = Some(estimate);
                    }
                    Err(warning) => {
                        log::warn!("{warning}");
                        if let Some(fallback) = self.config.fallback_offsets.get(&device) {
                            offset[k] = fallback[k];
                        }
                        warnings.push(warning);
                    }
                }
            }

            geometry = geometry.with_device(
                device,
                DeviceGeometry { offset, ..current },
            );
            estimates.push(DeviceEstimate { device, axes });
        }

        log::info!(
            "prealigned {} devices ({} fallbacks)",
            estimates.len(),
            warnings.len()
        );
        Ok(PrealignmentOutcome {
            geometry,
            estimates,
            warnings,
        })
    }
}

/// Window of `width` bins with the largest sum, skipping windows that overlap `exclude`.
fn best_window(counts: &[f64], width: usize, exclude: Option<(usize, usize)>) -> Option<Peak> {
    if width == 0 || counts.len() < width {
        return None;
    }
    let mut best: Option<Peak> = None;
    let mut sum: f64 = counts[..width].iter().sum();
    for start in 0..=(counts.len() - width) {
        if start > 0 {
            sum += counts[start + width - 1] - counts[start - 1];
        }
        let overlaps = exclude.is_some_and(|(lo, hi)| start < hi && start + width > lo);
        if overlaps {
            continue;
        }
        if best.as_ref().is_none_or(|b| sum > b.sum) {
            best = Some(Peak { start, width, sum });
        }
    }
    best
}

/// Background-subtracted centroid and RMS of a projection region.
fn centroid(projection: &Projection, start: usize, end: usize, background: f64) -> (f64, f64) {
    let (mut w, mut m1, mut m2) = (0.0, 0.0, 0.0);
    for k in start..end {
        let weight = (projection.counts[k] - background).max(0.0);
        let x = projection.binning.center(k);
        w += weight;
        m1 += weight * x;
        m2 += weight * x * x;
    }
    if w <= 0.0 {
        let mid = projection.binning.center((start + end) / 2);
        return (mid, 0.0);
    }
    let mean = m1 / w;
    let variance = (m2 / w - mean * mean).max(0.0);
    (mean, variance.sqrt())
}

/// Weighted least-squares line `y = a + b x` through `(x, y, weight)` points.
fn weighted_line(points: &[(f64, f64, f64)]) -> Option<(f64, f64)> {
    if points.len() < 3 {
        return None;
    }
    let (mut s, mut sx, mut sxx, mut sy, mut sxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for &(x, y, w) in points {
        s += w;
        sx += w * x;
        sxx += w * x * x;
        sy += w * y;
        sxy += w * x * y;
    }
    let det = s * sxx - sx * sx;
    if det.abs() <= f64::EPSILON * s * sxx.max(1.0) {
        return None;
    }
    let b = (s * sxy - sx * sy) / det;
    let a = (sy - b * sx) / s;
    Some((a, b))
}
