//! Clustered hit records.

use crate::setup::DeviceSpec;
use nalgebra::{Vector2, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A reconstructed particle-interaction position on one device for one event.
///
/// `column`/`row` are cluster centroids in pixel units. `position` is the
/// hit position in the device's local frame (z = 0 on the sensor plane); it
/// is derived from the pixel coordinates unless a calibrated position was
/// supplied by the clusterizer.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Hit {
    /// Event (trigger) number.
    pub event_number: i64,
    /// Device index in the setup.
    pub device: usize,
    /// Centroid column (pixel units).
    pub column: f64,
    /// Centroid row (pixel units).
    pub row: f64,
    /// Cluster charge, if the clusterizer provides one.
    pub charge: Option<f32>,
    /// Local position (x, y, z).
    pub position: Vector3<f64>,
}

impl Hit {
    /// Creates a hit whose local position is derived from the pixel centroid.
    #[must_use]
    pub fn from_pixel(
        event_number: i64,
        device: usize,
        column: f64,
        row: f64,
        charge: Option<f32>,
        spec: &DeviceSpec,
    ) -> Self {
        let local = spec.pixel_to_local(column, row);
        Self {
            event_number,
            device,
            column,
            row,
            charge,
            position: Vector3::new(local.x, local.y, 0.0),
        }
    }

    /// Creates a hit directly from a local position (calibrated input or synthetic data).
    #[must_use]
    pub fn from_local(event_number: i64, device: usize, x: f64, y: f64, spec: &DeviceSpec) -> Self {
        let (column, row) = spec.local_to_pixel(x, y);
        Self {
            event_number,
            device,
            column,
            row,
            charge: None,
            position: Vector3::new(x, y, 0.0),
        }
    }

    /// Overrides the local position with a calibrated one.
    #[must_use]
    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Vector3::new(x, y, 0.0);
        self
    }

    /// Local transverse position.
    #[inline]
    #[must_use]
    pub fn local_xy(&self) -> Vector2<f64> {
        self.position.xy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_pixel_hit_position() {
        let spec = DeviceSpec::new("m26", 0.0184, 0.0184, 1152, 576);
        let hit = Hit::from_pixel(7, 0, 576.0, 288.0, Some(12.0), &spec);
        // Pixel centre of the middle column/row is half a pitch off the sensor centre.
        assert_relative_eq!(hit.position.x, 0.5 * 0.0184, epsilon = 1e-12);
        assert_relative_eq!(hit.position.y, 0.5 * 0.0184, epsilon = 1e-12);
        assert_relative_eq!(hit.position.z, 0.0);
        assert_eq!(hit.charge, Some(12.0));
    }

    #[test]
    fn test_local_hit_round_trip() {
        let spec = DeviceSpec::new("fe", 0.25, 0.05, 80, 336);
        let hit = Hit::from_local(1, 2, 1.3, -2.2, &spec);
        let again = Hit::from_pixel(1, 2, hit.column, hit.row, None, &spec);
        assert_relative_eq!(again.position, hit.position, epsilon = 1e-9);
    }
}
