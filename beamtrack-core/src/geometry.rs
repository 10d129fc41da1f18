//! Device geometry: offsets, z positions, and rotations.
//!
//! A device's local frame has its origin at the sensor centre with the sensor
//! plane at local z = 0. The global position of a local point is
//! `R * local + t`, where `t = (offset_x, offset_y, z_position)` and
//! `R = Rz(gamma) * Ry(beta) * Rx(alpha)`.
//!
//! Geometry values are replaced, never mutated, between alignment iterations:
//! [`Geometry::corrected`] returns a new set.

use crate::error::{Error, Result};
use nalgebra::{Rotation3, Vector2, Vector3};
use std::cmp::Ordering;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const PARALLEL_EPSILON: f64 = 1e-12;

/// Placement of one device in the global frame.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceGeometry {
    /// Transverse translation (x, y).
    pub offset: Vector2<f64>,
    /// Position along the beam axis.
    pub z_position: f64,
    /// Rotation angles (alpha about x, beta about y, gamma about z) in radians.
    pub rotation: Vector3<f64>,
}

impl Default for DeviceGeometry {
    fn default() -> Self {
        Self::at_z(0.0)
    }
}

impl DeviceGeometry {
    /// Unrotated device at the given z with no transverse offset.
    #[must_use]
    pub fn at_z(z_position: f64) -> Self {
        Self {
            offset: Vector2::zeros(),
            z_position,
            rotation: Vector3::zeros(),
        }
    }

    /// Sets the transverse offset.
    #[must_use]
    pub fn with_offset(mut self, x: f64, y: f64) -> Self {
        self.offset = Vector2::new(x, y);
        self
    }

    /// Sets the rotation angles (radians).
    #[must_use]
    pub fn with_rotation(mut self, alpha: f64, beta: f64, gamma: f64) -> Self {
        self.rotation = Vector3::new(alpha, beta, gamma);
        self
    }

    /// Full translation vector (x, y, z).
    #[inline]
    #[must_use]
    pub fn translation(&self) -> Vector3<f64> {
        Vector3::new(self.offset.x, self.offset.y, self.z_position)
    }

    /// Rotation matrix local → global.
    #[inline]
    #[must_use]
    pub fn rotation_matrix(&self) -> Rotation3<f64> {
        Rotation3::from_euler_angles(self.rotation.x, self.rotation.y, self.rotation.z)
    }

    /// Plane normal in the global frame.
    #[must_use]
    pub fn normal(&self) -> Vector3<f64> {
        self.rotation_matrix() * Vector3::z()
    }

    /// Transforms a local point to the global frame.
    #[must_use]
    pub fn local_to_global(&self, local: &Vector3<f64>) -> Vector3<f64> {
        self.rotation_matrix() * local + self.translation()
    }

    /// Transforms a global point to the local frame.
    #[must_use]
    pub fn global_to_local(&self, global: &Vector3<f64>) -> Vector3<f64> {
        self.rotation_matrix().inverse() * (global - self.translation())
    }

    /// Intersection of a straight line with the device plane, in global coordinates.
    ///
    /// Returns `None` when the line runs parallel to the plane.
    #[must_use]
    pub fn intersect(&self, origin: &Vector3<f64>, direction: &Vector3<f64>) -> Option<Vector3<f64>> {
        let normal = self.normal();
        let denom = normal.dot(direction);
        if denom.abs() < PARALLEL_EPSILON {
            return None;
        }
        let s = normal.dot(&(self.translation() - origin)) / denom;
        Some(origin + direction * s)
    }

    /// Applies an additive correction, returning the new placement.
    #[must_use]
    pub fn corrected(&self, correction: &DeviceCorrection) -> Self {
        Self {
            offset: self.offset + correction.translation.xy(),
            z_position: self.z_position + correction.translation.z,
            rotation: self.rotation + correction.rotation,
        }
    }
}

/// An immutable snapshot of all device placements, indexed by device id.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Geometry {
    devices: Vec<DeviceGeometry>,
}

impl Geometry {
    /// Creates a geometry from per-device placements.
    #[must_use]
    pub fn new(devices: Vec<DeviceGeometry>) -> Self {
        Self { devices }
    }

    /// Geometry of `n` unrotated devices at the given z positions.
    #[must_use]
    pub fn from_z_positions(z_positions: &[f64]) -> Self {
        Self::new(z_positions.iter().map(|&z| DeviceGeometry::at_z(z)).collect())
    }

    /// Number of devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Returns true if no device is described.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Placement of a device.
    ///
    /// # Panics
    /// Panics if `device` is out of range; callers check the geometry against
    /// the setup with [`Geometry::check_devices`] first.
    #[must_use]
    pub fn device(&self, device: usize) -> &DeviceGeometry {
        &self.devices[device]
    }

    /// Placement of a device, if present.
    #[must_use]
    pub fn get(&self, device: usize) -> Option<&DeviceGeometry> {
        self.devices.get(device)
    }

    /// Iterates over placements in device order.
    pub fn iter(&self) -> impl Iterator<Item = &DeviceGeometry> {
        self.devices.iter()
    }

    /// Ensures the geometry describes exactly `expected` devices.
    ///
    /// # Errors
    /// Returns [`Error::GeometryMismatch`] otherwise.
    pub fn check_devices(&self, expected: usize) -> Result<()> {
        if self.devices.len() == expected {
            Ok(())
        } else {
            Err(Error::GeometryMismatch {
                expected,
                found: self.devices.len(),
            })
        }
    }

    /// Device ids sorted by z position (ties broken by device id).
    #[must_use]
    pub fn z_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.devices.len()).collect();
        order.sort_by(|&a, &b| {
            self.devices[a]
                .z_position
                .total_cmp(&self.devices[b].z_position)
                .then(a.cmp(&b))
        });
        order
    }

    /// Returns a copy with one device replaced.
    #[must_use]
    pub fn with_device(&self, device: usize, placement: DeviceGeometry) -> Self {
        let mut devices = self.devices.clone();
        if let Some(slot) = devices.get_mut(device) {
            *slot = placement;
        }
        Self { devices }
    }

    /// Returns the geometry after applying a correction.
    ///
    /// Devices without a correction entry keep their placement.
    #[must_use]
    pub fn corrected(&self, correction: &GeometryCorrection) -> Self {
        Self {
            devices: self
                .devices
                .iter()
                .enumerate()
                .map(|(i, device)| match correction.devices.get(i) {
                    Some(delta) => device.corrected(delta),
                    None => *device,
                })
                .collect(),
        }
    }

    /// Local → global for a device.
    #[must_use]
    pub fn local_to_global(&self, device: usize, local: &Vector3<f64>) -> Vector3<f64> {
        self.devices[device].local_to_global(local)
    }
}

/// Additive correction for one device.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceCorrection {
    /// Change of (offset_x, offset_y, z_position).
    pub translation: Vector3<f64>,
    /// Change of (alpha, beta, gamma).
    pub rotation: Vector3<f64>,
}

impl DeviceCorrection {
    /// Sum of absolute components (length units and radians added as-is).
    #[must_use]
    pub fn movement(&self) -> f64 {
        self.translation.abs().sum() + self.rotation.abs().sum()
    }

    /// Correction scaled by a damping factor.
    #[must_use]
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            translation: self.translation * factor,
            rotation: self.rotation * factor,
        }
    }
}

/// Correction for a full geometry, indexed by device id.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GeometryCorrection {
    /// Per-device corrections.
    pub devices: Vec<DeviceCorrection>,
}

impl GeometryCorrection {
    /// A zero correction for `n` devices.
    #[must_use]
    pub fn zero(n: usize) -> Self {
        Self {
            devices: vec![DeviceCorrection::default(); n],
        }
    }

    /// Total movement metric: sum of absolute corrections across devices.
    #[must_use]
    pub fn movement(&self) -> f64 {
        self.devices.iter().map(DeviceCorrection::movement).sum()
    }
}

/// Compares two floats with `NaN` ordered last.
#[must_use]
pub fn cmp_f64(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (false, false) => a.total_cmp(&b),
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (true, true) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_transform_round_trip() {
        let device = DeviceGeometry::at_z(42.0)
            .with_offset(1.5, -0.25)
            .with_rotation(0.01, -0.02, 0.3);
        let local = Vector3::new(3.0, -4.0, 0.0);
        let global = device.local_to_global(&local);
        let back = device.global_to_local(&global);
        assert_relative_eq!(back, local, epsilon = 1e-12);
    }

    #[test]
    fn test_intersect_unrotated_plane() {
        let device = DeviceGeometry::at_z(10.0).with_offset(1.0, 2.0);
        let origin = Vector3::new(0.0, 0.0, 0.0);
        let direction = Vector3::new(0.1, -0.2, 1.0);
        let hit = device.intersect(&origin, &direction).unwrap();
        assert_relative_eq!(hit, Vector3::new(1.0, -2.0, 10.0), epsilon = 1e-12);

        let local = device.global_to_local(&hit);
        assert_relative_eq!(local, Vector3::new(0.0, -4.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_intersect_parallel_line() {
        let device = DeviceGeometry::at_z(10.0);
        let origin = Vector3::zeros();
        assert!(device.intersect(&origin, &Vector3::x()).is_none());
    }

    #[test]
    fn test_gamma_rotates_in_plane() {
        let device = DeviceGeometry::at_z(0.0).with_rotation(0.0, 0.0, std::f64::consts::FRAC_PI_2);
        let global = device.local_to_global(&Vector3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(global, Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_corrected_returns_new_geometry() {
        let geometry = Geometry::from_z_positions(&[0.0, 10.0]);
        let mut correction = GeometryCorrection::zero(2);
        correction.devices[1].translation = Vector3::new(0.5, -0.5, 1.0);
        let next = geometry.corrected(&correction);

        assert_relative_eq!(geometry.device(1).offset.x, 0.0);
        assert_relative_eq!(next.device(1).offset.x, 0.5);
        assert_relative_eq!(next.device(1).z_position, 11.0);
        assert_relative_eq!(correction.movement(), 2.0);
    }

    #[test]
    fn test_z_order_is_stable() {
        let geometry = Geometry::from_z_positions(&[20.0, 0.0, 20.0, 10.0]);
        assert_eq!(geometry.z_order(), vec![1, 3, 0, 2]);
    }
}
