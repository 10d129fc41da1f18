//! Hit-table readers.
//!
//! Two per-device formats are supported:
//! - CSV with the columns `event_number,column,row,charge[,x,y]`
//! - a fixed-width little-endian binary table read through a memory map

use crate::{Error, Result};
use beamtrack_core::{merge_device_streams, validate_stream, DeviceSpec, EventHits, Hit, Setup};
use memmap2::Mmap;
use rayon::prelude::*;
use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Leading bytes of a binary hit table.
pub const HIT_TABLE_MAGIC: [u8; 8] = *b"BTHITS01";

/// Bytes per binary hit record: i64 event, f64 column, f64 row, f32 charge.
pub const HIT_RECORD_BYTES: usize = 28;

/// File extension selecting the binary hit-table format.
pub const BINARY_EXTENSION: &str = "bhit";

/// A memory-mapped file reader.
pub struct MappedFileReader {
    mmap: Mmap,
    path: PathBuf,
}

impl MappedFileReader {
    /// Opens a file for memory-mapped reading.
    ///
    /// # Errors
    /// Returns an error if the file cannot be opened or memory-mapped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)?;
        // SAFETY: The file is opened read-only and we assume it is not modified concurrently.
        // This is the standard safety contract for memory mapping.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self {
            mmap,
            path: path.as_ref().to_path_buf(),
        })
    }

    /// Returns the file contents as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap[..]
    }

    /// Returns the file size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Returns true if the file is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Path of the mapped file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A binary hit table of one device.
pub struct MappedHitTable {
    reader: MappedFileReader,
}

impl MappedHitTable {
    /// Maps a binary hit table and checks its header and size.
    ///
    /// # Errors
    /// Returns an error if the file cannot be mapped, the magic is wrong, or
    /// the body is not a whole number of records.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = MappedFileReader::open(path)?;
        let bytes = reader.as_bytes();
        if bytes.len() < HIT_TABLE_MAGIC.len() || bytes[..HIT_TABLE_MAGIC.len()] != HIT_TABLE_MAGIC {
            return Err(Error::InvalidFormat(format!(
                "{}: not a binary hit table",
                reader.path().display()
            )));
        }
        let body = bytes.len() - HIT_TABLE_MAGIC.len();
        if body % HIT_RECORD_BYTES != 0 {
            return Err(Error::InvalidFormat(format!(
                "{}: size {} is not a multiple of {HIT_RECORD_BYTES} bytes",
                reader.path().display(),
                body
            )));
        }
        Ok(Self { reader })
    }

    /// Number of hit records.
    #[must_use]
    pub fn len(&self) -> usize {
        (self.reader.len() - HIT_TABLE_MAGIC.len()) / HIT_RECORD_BYTES
    }

    /// Returns true if the table holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decodes all hits of the table as hits of `device`.
    ///
    /// # Errors
    /// Returns an error for non-finite pixel coordinates or decreasing event numbers.
    pub fn hits(&self, device: usize, spec: &DeviceSpec) -> Result<Vec<Hit>> {
        let body = &self.reader.as_bytes()[HIT_TABLE_MAGIC.len()..];
        let hits: Vec<Hit> = body
            .par_chunks_exact(HIT_RECORD_BYTES)
            .map(|record| decode_record(record, device, spec))
            .collect::<Result<_>>()?;
        validate_stream(device, &hits)?;
        Ok(hits)
    }
}

fn field<const N: usize>(record: &[u8], at: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&record[at..at + N]);
    out
}

fn decode_record(record: &[u8], device: usize, spec: &DeviceSpec) -> Result<Hit> {
    let event_number = i64::from_le_bytes(field(record, 0));
    let column = f64::from_le_bytes(field(record, 8));
    let row = f64::from_le_bytes(field(record, 16));
    let charge = f32::from_le_bytes(field(record, 24));
    check_pixel(event_number, column, row)?;
    let charge = (!charge.is_nan()).then_some(charge);
    Ok(Hit::from_pixel(event_number, device, column, row, charge, spec))
}

fn check_pixel(event_number: i64, column: f64, row: f64) -> Result<()> {
    if column.is_finite() && row.is_finite() {
        Ok(())
    } else {
        Err(beamtrack_core::Error::InvalidHit(format!(
            "event {event_number}: non-finite pixel ({column}, {row})"
        ))
        .into())
    }
}

/// One CSV row.
#[derive(Debug, Deserialize)]
struct HitRecord {
    event_number: i64,
    column: f64,
    row: f64,
    #[serde(default)]
    charge: Option<f32>,
    #[serde(default)]
    x: Option<f64>,
    #[serde(default)]
    y: Option<f64>,
}

/// Reads per-device hit tables for a setup.
pub struct HitTableReader {
    setup: Setup,
}

impl HitTableReader {
    /// Creates a reader for the devices of `setup`.
    #[must_use]
    pub fn new(setup: Setup) -> Self {
        Self { setup }
    }

    /// Returns the setup.
    #[must_use]
    pub fn setup(&self) -> &Setup {
        &self.setup
    }

    /// Reads the hit table of one device.
    ///
    /// Files with the `bhit` extension are read as binary tables, everything
    /// else as CSV. Calibrated `x`/`y` columns override the pixel-derived
    /// local position.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, a row is malformed, or
    /// event numbers decrease.
    pub fn read_device<P: AsRef<Path>>(&self, path: P, device: usize) -> Result<Vec<Hit>> {
        let path = path.as_ref();
        let spec = self.setup.device(device)?;
        let hits = if path.extension().is_some_and(|e| e == BINARY_EXTENSION) {
            MappedHitTable::open(path)?.hits(device, spec)?
        } else {
            read_csv(path, device, spec)?
        };
        log::debug!("{}: {} hits for device {device}", path.display(), hits.len());
        Ok(hits)
    }

    /// Reads one table per device (in device order) and merges them into events.
    ///
    /// # Errors
    /// Returns an error if the number of tables differs from the number of
    /// devices or any table fails to read.
    pub fn read_run<P: AsRef<Path> + Sync>(&self, paths: &[P]) -> Result<Vec<EventHits>> {
        if paths.len() != self.setup.len() {
            return Err(Error::InvalidFormat(format!(
                "{} hit tables given for {} devices",
                paths.len(),
                self.setup.len()
            )));
        }
        let streams: Vec<Vec<Hit>> = paths
            .par_iter()
            .enumerate()
            .map(|(device, path)| self.read_device(path, device))
            .collect::<Result<_>>()?;
        let events = merge_device_streams(&streams)?;
        log::info!(
            "read {} hits in {} events from {} devices",
            streams.iter().map(Vec::len).sum::<usize>(),
            events.len(),
            streams.len()
        );
        Ok(events)
    }
}

fn read_csv(path: &Path, device: usize, spec: &DeviceSpec) -> Result<Vec<Hit>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)?;
    let mut hits = Vec::new();
    for record in reader.deserialize::<HitRecord>() {
        let record = record?;
        check_pixel(record.event_number, record.column, record.row)?;
        let mut hit = Hit::from_pixel(
            record.event_number,
            device,
            record.column,
            record.row,
            record.charge,
            spec,
        );
        if let (Some(x), Some(y)) = (record.x, record.y) {
            hit = hit.with_position(x, y);
        }
        hits.push(hit);
    }
    validate_stream(device, &hits)?;
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{Builder, NamedTempFile};

    fn setup() -> Setup {
        Setup::new(vec![
            DeviceSpec::new("a", 0.02, 0.02, 100, 100),
            DeviceSpec::new("b", 0.02, 0.02, 100, 100).with_z_position(10.0),
        ])
        .unwrap()
    }

    fn csv_file(content: &str) -> NamedTempFile {
        let mut file = Builder::new().suffix(".csv").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_mapped_file_reader() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&[1, 2, 3, 4]).unwrap();
        let reader = MappedFileReader::open(file.path()).unwrap();
        assert_eq!(reader.len(), 4);
        assert_eq!(reader.as_bytes(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_csv_with_and_without_positions() {
        let reader = HitTableReader::new(setup());
        let plain = csv_file("event_number,column,row,charge\n0,49.5,49.5,12\n2,10,20,\n");
        let hits = reader.read_device(plain.path(), 0).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].charge, Some(12.0));
        assert_eq!(hits[1].charge, None);
        assert!(hits[0].position.x.abs() < 1e-12);

        let calibrated = csv_file("event_number,column,row,charge,x,y\n1,0,0,,0.25,-0.5\n");
        let hits = reader.read_device(calibrated.path(), 1).unwrap();
        assert_eq!(hits[0].device, 1);
        assert!((hits[0].position.x - 0.25).abs() < 1e-12);
        assert!((hits[0].position.y + 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_csv_rejects_decreasing_events() {
        let reader = HitTableReader::new(setup());
        let file = csv_file("event_number,column,row,charge\n5,1,1,1\n3,1,1,1\n");
        let err = reader.read_device(file.path(), 0).unwrap_err();
        assert!(matches!(
            err,
            Error::CoreError(beamtrack_core::Error::NonMonotonicEvent { .. })
        ));
    }

    #[test]
    fn test_binary_table_rejects_bad_header() {
        let mut file = Builder::new().suffix(".bhit").tempfile().unwrap();
        file.write_all(b"NOTATABLE").unwrap();
        assert!(MappedHitTable::open(file.path()).is_err());
    }

    #[test]
    fn test_read_run_needs_one_table_per_device() {
        let reader = HitTableReader::new(setup());
        let file = csv_file("event_number,column,row,charge\n");
        assert!(reader.read_run(&[file.path()]).is_err());
    }
}
