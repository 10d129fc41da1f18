//! Coarse spatial correlation between a reference device and the others.
//!
//! For every event in the sample, every hit of the reference device is paired
//! with every hit of the other device and the local coordinates are filled
//! into one histogram per axis. No geometry is assumed beyond shared event
//! numbers.

use beamtrack_core::{Axis, Binning, CorrelationHistogram, Error, EventHits, Result, Setup};
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Correlation configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CorrelationConfig {
    /// Device all others are correlated against.
    pub reference_device: usize,
    /// Number of leading events used (`None` for all).
    pub max_events: Option<usize>,
    /// Pixels merged into one histogram bin.
    pub pixels_per_bin: u32,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            reference_device: 0,
            max_events: Some(100_000),
            pixels_per_bin: 1,
        }
    }
}

impl CorrelationConfig {
    /// Creates a correlation configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the reference device.
    #[must_use]
    pub fn with_reference_device(mut self, device: usize) -> Self {
        self.reference_device = device;
        self
    }

    /// Sets the event sample size.
    #[must_use]
    pub fn with_max_events(mut self, max_events: Option<usize>) -> Self {
        self.max_events = max_events;
        self
    }

    /// Sets the number of pixels per bin.
    #[must_use]
    pub fn with_pixels_per_bin(mut self, pixels: u32) -> Self {
        self.pixels_per_bin = pixels;
        self
    }

    /// Checks the configuration.
    ///
    /// # Errors
    /// Returns [`Error::ConfigError`] for a zero bin size or sample size.
    pub fn validate(&self) -> Result<()> {
        if self.pixels_per_bin == 0 {
            return Err(Error::ConfigError("pixels per bin must be at least 1".to_string()));
        }
        if self.max_events == Some(0) {
            return Err(Error::ConfigError("correlation sample is empty".to_string()));
        }
        Ok(())
    }
}

/// Correlation histograms of one device against the reference, one per axis.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceCorrelation {
    /// Correlated device.
    pub device: usize,
    /// Histograms for x and y.
    pub histograms: [CorrelationHistogram; 2],
}

impl DeviceCorrelation {
    /// Histogram of one axis.
    #[must_use]
    pub fn axis(&self, axis: Axis) -> &CorrelationHistogram {
        &self.histograms[axis.index()]
    }
}

fn binning(setup: &Setup, device: usize, axis: Axis, pixels_per_bin: u32) -> Result<Binning> {
    let spec = setup.device(device)?;
    let extent = spec.extent();
    let pixels = match axis {
        Axis::X => spec.columns,
        Axis::Y => spec.rows,
    };
    let half = 0.5 * axis.of(&extent);
    let bins = pixels.div_ceil(pixels_per_bin).max(1) as usize;
    Ok(Binning::new(-half, half, bins))
}

/// Correlates one device against the reference device.
///
/// An empty histogram means no event-matched hit pair was found; callers
/// treat that as "alignment impossible" for the device.
///
/// # Errors
/// Returns an error for devices outside the setup or an invalid configuration.
pub fn correlate_devices(
    events: &[EventHits],
    setup: &Setup,
    device: usize,
    config: &CorrelationConfig,
) -> Result<DeviceCorrelation> {
    config.validate()?;
    let reference = config.reference_device;
    let histogram = |axis: Axis| -> Result<CorrelationHistogram> {
        Ok(CorrelationHistogram::new(
            reference,
            device,
            axis,
            binning(setup, reference, axis, config.pixels_per_bin)?,
            binning(setup, device, axis, config.pixels_per_bin)?,
        ))
    };
    let mut hx = histogram(Axis::X)?;
    let mut hy = histogram(Axis::Y)?;

    let sample = config.max_events.unwrap_or(events.len()).min(events.len());
    for event in &events[..sample] {
        let reference_hits = event.device_hits(reference);
        let device_hits = event.device_hits(device);
        if reference_hits.is_empty() || device_hits.is_empty() {
            continue;
        }
        for r in reference_hits {
            for d in device_hits {
                hx.fill(r.position.x, d.position.x);
                hy.fill(r.position.y, d.position.y);
            }
        }
        hx.add_event();
        hy.add_event();
    }

    if hx.is_empty() {
        log::warn!("no correlated hits between device {reference} and device {device}");
    } else {
        log::debug!(
            "device {device}: {} correlated pairs in {} events",
            hx.entries(),
            hx.events()
        );
    }

    Ok(DeviceCorrelation {
        device,
        histograms: [hx, hy],
    })
}

/// Correlates every non-reference device against the reference device.
///
/// Devices are processed in parallel; the output is in device order.
///
/// # Errors
/// Returns an error if the reference device is outside the setup.
pub fn correlate_all(
    events: &[EventHits],
    setup: &Setup,
    config: &CorrelationConfig,
) -> Result<Vec<DeviceCorrelation>> {
    setup.device(config.reference_device)?;
    (0..setup.len())
        .into_par_iter()
        .filter(|&d| d != config.reference_device)
        .map(|d| correlate_devices(events, setup, d, config))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamtrack_core::{DeviceSpec, Hit};

    fn setup() -> Setup {
        Setup::new(vec![
            DeviceSpec::new("a", 1.0, 1.0, 20, 10),
            DeviceSpec::new("b", 1.0, 1.0, 20, 10).with_z_position(10.0),
        ])
        .unwrap()
    }

    #[test]
    fn test_correlation_fills_matched_events() {
        let setup = setup();
        let mut events = Vec::new();
        for e in 0..5 {
            let mut event = EventHits::new(e, 2);
            let x = f64::from(i32::try_from(e).unwrap()) - 2.0;
            event
                .push(Hit::from_local(e, 0, x, 0.0, setup.device(0).unwrap()))
                .unwrap();
            if e != 4 {
                event
                    .push(Hit::from_local(e, 1, x + 1.0, 0.0, setup.device(1).unwrap()))
                    .unwrap();
            }
            events.push(event);
        }

        let correlation = correlate_devices(&events, &setup, 1, &CorrelationConfig::default()).unwrap();
        let hx = correlation.axis(Axis::X);
        assert_eq!(hx.entries(), 4);
        assert_eq!(hx.events(), 4);
        assert_eq!(hx.reference_binning.bins, 20);
        assert_eq!(correlation.axis(Axis::Y).reference_binning.bins, 10);
    }

    #[test]
    fn test_no_overlap_gives_empty_histogram() {
        let setup = setup();
        let mut first = EventHits::new(0, 2);
        first
            .push(Hit::from_local(0, 0, 0.0, 0.0, setup.device(0).unwrap()))
            .unwrap();
        let mut second = EventHits::new(1, 2);
        second
            .push(Hit::from_local(1, 1, 0.0, 0.0, setup.device(1).unwrap()))
            .unwrap();
        let all = correlate_all(&[first, second], &setup, &CorrelationConfig::default()).unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].axis(Axis::X).is_empty());
    }

    #[test]
    fn test_unknown_device() {
        let config = CorrelationConfig::default().with_reference_device(5);
        assert!(correlate_all(&[], &setup(), &config).is_err());
    }
}
