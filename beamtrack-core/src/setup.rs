//! Static description of the telescope: one entry per device.

use crate::error::{Error, Result};
use crate::geometry::{DeviceGeometry, Geometry};
use nalgebra::Vector2;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Static properties of one device (DUT or telescope plane).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceSpec {
    /// Human-readable name.
    pub name: String,
    /// Pixel pitch along the column direction (length units).
    pub pitch_x: f64,
    /// Pixel pitch along the row direction (length units).
    pub pitch_y: f64,
    /// Number of columns.
    pub columns: u32,
    /// Number of rows.
    pub rows: u32,
    /// Nominal position along the beam axis.
    #[cfg_attr(feature = "serde", serde(default))]
    pub z_position: f64,
    /// Intrinsic resolution along x. Defaults to `pitch_x / sqrt(12)`.
    #[cfg_attr(feature = "serde", serde(default))]
    pub resolution_x: Option<f64>,
    /// Intrinsic resolution along y. Defaults to `pitch_y / sqrt(12)`.
    #[cfg_attr(feature = "serde", serde(default))]
    pub resolution_y: Option<f64>,
}

impl DeviceSpec {
    /// Creates a device description at z = 0 with binary-resolution defaults.
    #[must_use]
    pub fn new(name: impl Into<String>, pitch_x: f64, pitch_y: f64, columns: u32, rows: u32) -> Self {
        Self {
            name: name.into(),
            pitch_x,
            pitch_y,
            columns,
            rows,
            z_position: 0.0,
            resolution_x: None,
            resolution_y: None,
        }
    }

    /// Sets the nominal z position.
    #[must_use]
    pub fn with_z_position(mut self, z: f64) -> Self {
        self.z_position = z;
        self
    }

    /// Sets the intrinsic resolution.
    #[must_use]
    pub fn with_resolution(mut self, x: f64, y: f64) -> Self {
        self.resolution_x = Some(x);
        self.resolution_y = Some(y);
        self
    }

    /// Effective resolution (x, y), falling back to `pitch / sqrt(12)`.
    #[must_use]
    pub fn resolution(&self) -> Vector2<f64> {
        let sqrt12 = 12.0_f64.sqrt();
        Vector2::new(
            self.resolution_x.unwrap_or(self.pitch_x / sqrt12),
            self.resolution_y.unwrap_or(self.pitch_y / sqrt12),
        )
    }

    /// Sensor extent (width, height) in length units.
    #[must_use]
    pub fn extent(&self) -> Vector2<f64> {
        Vector2::new(
            f64::from(self.columns) * self.pitch_x,
            f64::from(self.rows) * self.pitch_y,
        )
    }

    /// Converts a pixel centroid to the local frame (origin at the sensor centre).
    #[must_use]
    pub fn pixel_to_local(&self, column: f64, row: f64) -> Vector2<f64> {
        Vector2::new(
            (column + 0.5 - 0.5 * f64::from(self.columns)) * self.pitch_x,
            (row + 0.5 - 0.5 * f64::from(self.rows)) * self.pitch_y,
        )
    }

    /// Converts a local position back to a (fractional) pixel centroid.
    #[must_use]
    pub fn local_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            x / self.pitch_x + 0.5 * f64::from(self.columns) - 0.5,
            y / self.pitch_y + 0.5 * f64::from(self.rows) - 0.5,
        )
    }

    fn validate(&self, index: usize) -> Result<()> {
        if !(self.pitch_x > 0.0 && self.pitch_y > 0.0) {
            return Err(Error::ConfigError(format!(
                "device {index} ({}) has a non-positive pitch",
                self.name
            )));
        }
        if self.columns == 0 || self.rows == 0 {
            return Err(Error::ConfigError(format!(
                "device {index} ({}) has no pixels",
                self.name
            )));
        }
        Ok(())
    }
}

/// The full telescope description.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Setup {
    /// Devices, indexed by device id.
    pub devices: Vec<DeviceSpec>,
}

impl Setup {
    /// Creates a setup from device descriptions.
    ///
    /// # Errors
    /// Returns an error if the setup is empty or a device has invalid dimensions.
    pub fn new(devices: Vec<DeviceSpec>) -> Result<Self> {
        let setup = Self { devices };
        setup.validate()?;
        Ok(setup)
    }

    /// Validates every device.
    ///
    /// # Errors
    /// Returns an error if the setup is empty or a device has invalid dimensions.
    pub fn validate(&self) -> Result<()> {
        if self.devices.is_empty() {
            return Err(Error::ConfigError("setup has no devices".to_string()));
        }
        for (index, device) in self.devices.iter().enumerate() {
            device.validate(index)?;
        }
        Ok(())
    }

    /// Number of devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Returns true if the setup has no devices.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Looks up a device by id.
    ///
    /// # Errors
    /// Returns [`Error::UnknownDevice`] for ids outside the setup.
    pub fn device(&self, device: usize) -> Result<&DeviceSpec> {
        self.devices.get(device).ok_or(Error::UnknownDevice {
            device,
            devices: self.devices.len(),
        })
    }

    /// Geometry with nominal z positions and no offsets or rotations.
    #[must_use]
    pub fn nominal_geometry(&self) -> Geometry {
        Geometry::new(
            self.devices
                .iter()
                .map(|d| DeviceGeometry::at_z(d.z_position))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_resolution() {
        let spec = DeviceSpec::new("fe", 0.25, 0.05, 80, 336);
        let res = spec.resolution();
        assert!((res.x - 0.25 / 12.0_f64.sqrt()).abs() < 1e-12);
        let spec = spec.with_resolution(0.01, 0.02);
        assert!((spec.resolution().y - 0.02).abs() < f64::EPSILON);
    }

    #[test]
    fn test_setup_validation() {
        assert!(Setup::new(Vec::new()).is_err());
        assert!(Setup::new(vec![DeviceSpec::new("bad", 0.0, 0.1, 10, 10)]).is_err());
        let setup = Setup::new(vec![
            DeviceSpec::new("a", 0.1, 0.1, 10, 10),
            DeviceSpec::new("b", 0.1, 0.1, 10, 10).with_z_position(25.0),
        ])
        .unwrap();
        assert!(matches!(
            setup.device(5),
            Err(Error::UnknownDevice { device: 5, devices: 2 })
        ));
        let geometry = setup.nominal_geometry();
        assert!((geometry.device(1).z_position - 25.0).abs() < f64::EPSILON);
    }
}
