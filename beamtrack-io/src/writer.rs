//! Track-table and hit-table writers.

use crate::reader::HIT_TABLE_MAGIC;
use crate::{Error, Result};
use beamtrack_core::{FittedTrack, Hit};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Columns written once per track.
const TRACK_COLUMNS: [&str; 10] = [
    "event_number",
    "status",
    "termination",
    "chi2",
    "dof",
    "isolated",
    "offset_x",
    "offset_y",
    "slope_x",
    "slope_y",
];

/// Columns written once per device, prefixed with `d{device}_`.
const DEVICE_COLUMNS: [&str; 6] = ["role", "x", "y", "res_x", "res_y", "quality"];

/// CSV writer for fitted tracks: one row per track, one column group per device.
///
/// Device intercepts are global; residuals are local and left empty for
/// devices without a hit.
pub struct TrackTableWriter {
    writer: csv::Writer<File>,
    devices: usize,
    rows: usize,
}

impl TrackTableWriter {
    /// Creates the file and writes the header.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P, devices: usize) -> Result<Self> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(Self::header(devices))?;
        Ok(Self {
            writer,
            devices,
            rows: 0,
        })
    }

    /// Column names for a table with `devices` devices.
    #[must_use]
    pub fn header(devices: usize) -> Vec<String> {
        let mut header: Vec<String> = TRACK_COLUMNS.iter().map(ToString::to_string).collect();
        for device in 0..devices {
            header.extend(DEVICE_COLUMNS.iter().map(|c| format!("d{device}_{c}")));
        }
        header
    }

    /// Appends one track.
    ///
    /// # Errors
    /// Returns an error if the track has a different number of devices than
    /// the table, or the write fails.
    pub fn write_track(&mut self, track: &FittedTrack) -> Result<()> {
        if track.devices.len() != self.devices {
            return Err(Error::InvalidFormat(format!(
                "track of event {} has {} devices, table has {}",
                track.event_number,
                track.devices.len(),
                self.devices
            )));
        }

        let slopes = track.line.slopes();
        let mut record = vec![
            track.event_number.to_string(),
            track.status.as_str().to_string(),
            track.termination.as_str().to_string(),
            track.chi2.to_string(),
            track.dof.to_string(),
            track.isolated.to_string(),
            track.line.offset.x.to_string(),
            track.line.offset.y.to_string(),
            slopes.x.to_string(),
            slopes.y.to_string(),
        ];
        for fit in &track.devices {
            let (res_x, res_y) = match fit.residual {
                Some(r) => (r.x.to_string(), r.y.to_string()),
                None => (String::new(), String::new()),
            };
            record.extend([
                fit.role.as_str().to_string(),
                fit.intercept.x.to_string(),
                fit.intercept.y.to_string(),
                res_x,
                res_y,
                fit.quality.level().to_string(),
            ]);
        }
        self.writer.write_record(&record)?;
        self.rows += 1;
        Ok(())
    }

    /// Appends tracks in order.
    ///
    /// # Errors
    /// Returns an error if any track cannot be written.
    pub fn write_tracks(&mut self, tracks: &[FittedTrack]) -> Result<()> {
        for track in tracks {
            self.write_track(track)?;
        }
        Ok(())
    }

    /// Rows written so far.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Flushes the writer.
    ///
    /// # Errors
    /// Returns an error if the flush fails.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Writer for binary hit tables readable by [`crate::MappedHitTable`].
///
/// Format: the 8-byte magic, then per hit i64 (event) + f64 (column) +
/// f64 (row) + f32 (charge, NaN when absent), little-endian.
pub struct HitTableWriter {
    writer: BufWriter<File>,
}

impl HitTableWriter {
    /// Creates the file and writes the magic.
    ///
    /// # Errors
    /// Returns an error if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&HIT_TABLE_MAGIC)?;
        Ok(Self { writer })
    }

    /// Appends hits. Calibrated positions are not stored.
    ///
    /// # Errors
    /// Returns an error if the write fails.
    pub fn write_hits(&mut self, hits: &[Hit]) -> Result<()> {
        for hit in hits {
            self.writer.write_all(&hit.event_number.to_le_bytes())?;
            self.writer.write_all(&hit.column.to_le_bytes())?;
            self.writer.write_all(&hit.row.to_le_bytes())?;
            self.writer
                .write_all(&hit.charge.unwrap_or(f32::NAN).to_le_bytes())?;
        }
        Ok(())
    }

    /// Flushes the writer.
    ///
    /// # Errors
    /// Returns an error if the flush fails.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{MappedHitTable, HIT_RECORD_BYTES};
    use beamtrack_core::{DeviceSpec, Hit};
    use tempfile::{Builder, NamedTempFile};

    #[test]
    fn test_header_layout() {
        let header = TrackTableWriter::header(2);
        assert_eq!(header.len(), TRACK_COLUMNS.len() + 2 * DEVICE_COLUMNS.len());
        assert_eq!(header[0], "event_number");
        assert_eq!(header[10], "d0_role");
        assert_eq!(header[21], "d1_quality");
    }

    #[test]
    fn test_binary_hit_table() {
        let spec = DeviceSpec::new("m26", 0.0184, 0.0184, 1152, 576);
        let hits = vec![
            Hit::from_pixel(3, 0, 10.0, 20.0, Some(7.0), &spec),
            Hit::from_pixel(4, 0, 11.5, 21.0, None, &spec),
        ];
        let file = Builder::new().suffix(".bhit").tempfile().unwrap();
        let mut writer = HitTableWriter::create(file.path()).unwrap();
        writer.write_hits(&hits).unwrap();
        writer.flush().unwrap();

        let size = std::fs::metadata(file.path()).unwrap().len();
        assert_eq!(size, (HIT_TABLE_MAGIC.len() + 2 * HIT_RECORD_BYTES) as u64);

        let table = MappedHitTable::open(file.path()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.hits(0, &spec).unwrap(), hits);
    }

    #[test]
    fn test_track_table_header_written() {
        let file = NamedTempFile::new().unwrap();
        let mut writer = TrackTableWriter::create(file.path(), 3).unwrap();
        assert_eq!(writer.rows(), 0);
        writer.flush().unwrap();
        let content = std::fs::read_to_string(file.path()).unwrap();
        assert!(content.starts_with("event_number,status,termination"));
        assert!(content.contains("d2_quality"));
    }
}
