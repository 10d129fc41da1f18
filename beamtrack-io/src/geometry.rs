//! Setup and geometry files.

use crate::{Error, Result};
use beamtrack_algorithms::{AlignmentOutcome, AlignmentStatus};
use beamtrack_core::{DeviceGeometry, Geometry, Setup};
use nalgebra::{Vector2, Vector3};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Placement of one device as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Device name from the setup, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Translation (x, y, z).
    pub translation: [f64; 3],
    /// Rotation angles (alpha, beta, gamma) in radians.
    #[serde(default)]
    pub rotation: [f64; 3],
}

/// A geometry file: device placements plus how they were obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeometryRecord {
    /// Placements in device order.
    pub devices: Vec<DeviceRecord>,
    /// Alignment iterations that produced the geometry.
    #[serde(default)]
    pub iterations: usize,
    /// Movement metric of the last iteration.
    #[serde(default)]
    pub final_movement: Option<f64>,
    /// True if the alignment converged.
    #[serde(default)]
    pub converged: bool,
    /// Terminal alignment state, if the geometry came from an alignment run.
    #[serde(default)]
    pub status: Option<AlignmentStatus>,
    /// Warnings raised while producing the geometry.
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl GeometryRecord {
    /// Record of a plain geometry.
    #[must_use]
    pub fn from_geometry(geometry: &Geometry, setup: Option<&Setup>) -> Self {
        let devices = geometry
            .iter()
            .enumerate()
            .map(|(i, placement)| DeviceRecord {
                name: setup.and_then(|s| s.devices.get(i)).map(|d| d.name.clone()),
                translation: placement.translation().into(),
                rotation: placement.rotation.into(),
            })
            .collect();
        Self {
            devices,
            iterations: 0,
            final_movement: None,
            converged: false,
            status: None,
            warnings: Vec::new(),
        }
    }

    /// Record of an alignment result.
    #[must_use]
    pub fn from_alignment(outcome: &AlignmentOutcome, setup: Option<&Setup>) -> Self {
        Self {
            iterations: outcome.iterations,
            final_movement: Some(outcome.final_movement).filter(|m| m.is_finite()),
            converged: outcome.status.is_converged(),
            status: Some(outcome.status),
            warnings: outcome.warnings.iter().map(ToString::to_string).collect(),
            ..Self::from_geometry(&outcome.geometry, setup)
        }
    }

    /// The stored geometry.
    #[must_use]
    pub fn geometry(&self) -> Geometry {
        Geometry::new(
            self.devices
                .iter()
                .map(|d| DeviceGeometry {
                    offset: Vector2::new(d.translation[0], d.translation[1]),
                    z_position: d.translation[2],
                    rotation: Vector3::from(d.rotation),
                })
                .collect(),
        )
    }

    /// Loads a geometry file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or holds no devices.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let record: Self = load_json(path.as_ref())?;
        if record.devices.is_empty() {
            return Err(Error::InvalidFormat(format!(
                "{}: geometry without devices",
                path.as_ref().display()
            )));
        }
        Ok(record)
    }

    /// Writes the record as pretty-printed JSON.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        save_json(path.as_ref(), self)
    }
}

/// Loads and validates a setup file.
///
/// # Errors
/// Returns an error if the file cannot be read or parsed, or a device is invalid.
pub fn load_setup<P: AsRef<Path>>(path: P) -> Result<Setup> {
    let setup: Setup = load_json(path.as_ref())?;
    setup.validate()?;
    Ok(setup)
}

/// Writes a setup file.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn save_setup<P: AsRef<Path>>(path: P, setup: &Setup) -> Result<()> {
    save_json(path.as_ref(), setup)
}

fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamtrack_core::DeviceSpec;
    use tempfile::NamedTempFile;

    #[test]
    fn test_geometry_record_keeps_placements() {
        let geometry = Geometry::new(vec![
            DeviceGeometry::at_z(0.0),
            DeviceGeometry::at_z(150.0)
                .with_offset(0.25, -0.125)
                .with_rotation(0.0, 0.5, 0.001),
        ]);
        let record = GeometryRecord::from_geometry(&geometry, None);
        assert_eq!(record.devices[1].translation, [0.25, -0.125, 150.0]);
        assert_eq!(record.geometry(), geometry);

        let file = NamedTempFile::new().unwrap();
        record.save(file.path()).unwrap();
        let loaded = GeometryRecord::load(file.path()).unwrap();
        assert_eq!(loaded.geometry(), geometry);
        assert!(!loaded.converged);
    }

    #[test]
    fn test_setup_file() {
        let setup = Setup::new(vec![
            DeviceSpec::new("m26_0", 0.0184, 0.0184, 1152, 576),
            DeviceSpec::new("dut", 0.05, 0.25, 80, 336)
                .with_z_position(300.0)
                .with_resolution(0.015, 0.07),
        ])
        .unwrap();
        let file = NamedTempFile::new().unwrap();
        save_setup(file.path(), &setup).unwrap();
        assert_eq!(load_setup(file.path()).unwrap(), setup);
    }

    #[test]
    fn test_empty_geometry_rejected() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), r#"{"devices": []}"#).unwrap();
        assert!(GeometryRecord::load(file.path()).is_err());
    }
}
