//! HDF5 track tables.
//!
//! Layout: `/entry/tracks` holds one extendable column dataset per track
//! field; `/entry/tracks/device_{d}` holds the per-device columns. Missing
//! residuals are stored as NaN.

use crate::{Error, Result};
use beamtrack_core::{DeviceRole, FittedTrack, TrackStatus};
use hdf5::types::{H5Type, VarLenUnicode};
use hdf5::{Dataset, File, Group};
use ndarray::{s, ArrayView1};
use std::path::Path;
use std::str::FromStr;

const FORMAT_VERSION: &str = "0.1";

/// Track write configuration.
#[derive(Clone, Debug)]
pub struct TrackWriteOptions {
    /// Chunk length of the extendable datasets.
    pub chunk_tracks: usize,
    /// Deflate level, if any.
    pub compression: Option<u8>,
    /// Enable the shuffle filter.
    pub shuffle: bool,
}

impl Default for TrackWriteOptions {
    fn default() -> Self {
        Self {
            chunk_tracks: 10_000,
            compression: Some(1),
            shuffle: true,
        }
    }
}

struct DeviceColumns {
    role: Dataset,
    x: Dataset,
    y: Dataset,
    res_x: Dataset,
    res_y: Dataset,
    quality: Dataset,
}

/// Streaming writer for fitted tracks.
pub struct Hdf5TrackSink {
    _file: File,
    event_number: Dataset,
    status: Dataset,
    chi2: Dataset,
    dof: Dataset,
    isolated: Dataset,
    line: [Dataset; 4],
    devices: Vec<DeviceColumns>,
    track_count: usize,
}

impl Hdf5TrackSink {
    /// Create a new streaming track sink for `devices` devices.
    ///
    /// # Errors
    /// Returns an error if the HDF5 file or datasets cannot be created.
    pub fn create<P: AsRef<Path>>(path: P, devices: usize, options: &TrackWriteOptions) -> Result<Self> {
        let file = File::create(path)?;
        set_attr_str(&file, "beamtrack_format_version", FORMAT_VERSION)?;

        let entry = file.create_group("entry")?;
        set_attr_str(&entry, "NX_class", "NXentry")?;
        let tracks = entry.create_group("tracks")?;
        set_attr_str(&tracks, "NX_class", "NXdata")?;
        tracks
            .new_attr::<u32>()
            .create("devices")?
            .write_scalar(&u32::try_from(devices).map_err(|_| {
                Error::InvalidFormat(format!("{devices} devices exceed u32 range"))
            })?)?;

        let float_column = |group: &Group, name: &str| -> Result<Dataset> {
            create_extendable_dataset::<f64>(group, name, options)
        };

        let event_number = create_extendable_dataset::<i64>(&tracks, "event_number", options)?;
        let status = create_extendable_dataset::<u8>(&tracks, "status", options)?;
        let chi2 = float_column(&tracks, "chi2")?;
        let dof = create_extendable_dataset::<u32>(&tracks, "dof", options)?;
        let isolated = create_extendable_dataset::<u8>(&tracks, "isolated", options)?;
        let line = [
            float_column(&tracks, "offset_x")?,
            float_column(&tracks, "offset_y")?,
            float_column(&tracks, "slope_x")?,
            float_column(&tracks, "slope_y")?,
        ];
        set_attr_str(&line[0], "units", "mm")?;
        set_attr_str(&line[1], "units", "mm")?;
        set_attr_str(&line[2], "units", "1")?;
        set_attr_str(&line[3], "units", "1")?;

        let mut device_columns = Vec::with_capacity(devices);
        for device in 0..devices {
            let group = tracks.create_group(&format!("device_{device}"))?;
            let columns = DeviceColumns {
                role: create_extendable_dataset::<u8>(&group, "role", options)?,
                x: float_column(&group, "x")?,
                y: float_column(&group, "y")?,
                res_x: float_column(&group, "res_x")?,
                res_y: float_column(&group, "res_y")?,
                quality: create_extendable_dataset::<u8>(&group, "quality", options)?,
            };
            for ds in [&columns.x, &columns.y, &columns.res_x, &columns.res_y] {
                set_attr_str(ds, "units", "mm")?;
            }
            device_columns.push(columns);
        }

        Ok(Self {
            _file: file,
            event_number,
            status,
            chi2,
            dof,
            isolated,
            line,
            devices: device_columns,
            track_count: 0,
        })
    }

    /// Number of tracks written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.track_count
    }

    /// Returns true if no track was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.track_count == 0
    }

    /// Append tracks.
    ///
    /// # Errors
    /// Returns an error if a track has a different number of devices or HDF5 I/O fails.
    pub fn write_tracks(&mut self, tracks: &[FittedTrack]) -> Result<()> {
        if tracks.is_empty() {
            return Ok(());
        }
        if let Some(track) = tracks.iter().find(|t| t.devices.len() != self.devices.len()) {
            return Err(Error::InvalidFormat(format!(
                "track of event {} has {} devices, table has {}",
                track.event_number,
                track.devices.len(),
                self.devices.len()
            )));
        }

        let start = self.track_count;
        let event_number: Vec<i64> = tracks.iter().map(|t| t.event_number).collect();
        let status: Vec<u8> = tracks.iter().map(|t| status_code(t.status)).collect();
        let dof = tracks
            .iter()
            .map(|t| {
                u32::try_from(t.dof)
                    .map_err(|_| Error::InvalidFormat("dof exceeds u32 range".to_string()))
            })
            .collect::<Result<Vec<u32>>>()?;
        let isolated: Vec<u8> = tracks.iter().map(|t| u8::from(t.isolated)).collect();

        append_slice(&self.event_number, start, &event_number)?;
        append_slice(&self.status, start, &status)?;
        append_slice(&self.chi2, start, &column(tracks, |t| t.chi2))?;
        append_slice(&self.dof, start, &dof)?;
        append_slice(&self.isolated, start, &isolated)?;
        append_slice(&self.line[0], start, &column(tracks, |t| t.line.offset.x))?;
        append_slice(&self.line[1], start, &column(tracks, |t| t.line.offset.y))?;
        append_slice(&self.line[2], start, &column(tracks, |t| t.line.slopes().x))?;
        append_slice(&self.line[3], start, &column(tracks, |t| t.line.slopes().y))?;

        for (device, columns) in self.devices.iter().enumerate() {
            let fits: Vec<_> = tracks.iter().map(|t| t.devices[device]).collect();
            let role: Vec<u8> = fits.iter().map(|f| role_code(f.role)).collect();
            let quality: Vec<u8> = fits.iter().map(|f| f.quality.level()).collect();
            let x: Vec<f64> = fits.iter().map(|f| f.intercept.x).collect();
            let y: Vec<f64> = fits.iter().map(|f| f.intercept.y).collect();
            let res_x: Vec<f64> = fits
                .iter()
                .map(|f| f.residual.map_or(f64::NAN, |r| r.x))
                .collect();
            let res_y: Vec<f64> = fits
                .iter()
                .map(|f| f.residual.map_or(f64::NAN, |r| r.y))
                .collect();
            append_slice(&columns.role, start, &role)?;
            append_slice(&columns.x, start, &x)?;
            append_slice(&columns.y, start, &y)?;
            append_slice(&columns.res_x, start, &res_x)?;
            append_slice(&columns.res_y, start, &res_y)?;
            append_slice(&columns.quality, start, &quality)?;
        }

        self.track_count += tracks.len();
        Ok(())
    }
}

/// Track columns read back from a file.
#[derive(Debug, Clone, Default)]
pub struct TrackColumns {
    /// Event number per track.
    pub event_number: Vec<i64>,
    /// Status code per track (0 good, 1 rejected, 2 degenerate).
    pub status: Vec<u8>,
    /// Chi-square per track.
    pub chi2: Vec<f64>,
    /// Local x residual per device and track (NaN without hit).
    pub res_x: Vec<Vec<f64>>,
    /// Local y residual per device and track (NaN without hit).
    pub res_y: Vec<Vec<f64>>,
}

/// Read the track-level columns and residuals of a track file.
///
/// # Errors
/// Returns an error if the file or a dataset is missing.
pub fn read_tracks_hdf5<P: AsRef<Path>>(path: P) -> Result<TrackColumns> {
    let file = File::open(path)?;
    let tracks = file.group("entry/tracks")?;
    let devices = tracks.attr("devices")?.read_scalar::<u32>()?;
    let mut columns = TrackColumns {
        event_number: read_dataset_vec(&tracks, "event_number")?,
        status: read_dataset_vec(&tracks, "status")?,
        chi2: read_dataset_vec(&tracks, "chi2")?,
        ..TrackColumns::default()
    };
    for device in 0..devices {
        let group = tracks.group(&format!("device_{device}"))?;
        columns.res_x.push(read_dataset_vec(&group, "res_x")?);
        columns.res_y.push(read_dataset_vec(&group, "res_y")?);
    }
    Ok(columns)
}

fn column(tracks: &[FittedTrack], value: impl Fn(&FittedTrack) -> f64) -> Vec<f64> {
    tracks.iter().map(value).collect()
}

fn status_code(status: TrackStatus) -> u8 {
    match status {
        TrackStatus::Good => 0,
        TrackStatus::Rejected => 1,
        TrackStatus::Degenerate => 2,
    }
}

fn role_code(role: DeviceRole) -> u8 {
    match role {
        DeviceRole::Fitted => 0,
        DeviceRole::Extrapolated => 1,
        DeviceRole::NoHit => 2,
    }
}

fn create_extendable_dataset<T: H5Type>(
    group: &Group,
    name: &str,
    options: &TrackWriteOptions,
) -> Result<Dataset> {
    let mut builder = group
        .new_dataset::<T>()
        .shape((0..,))
        .chunk((options.chunk_tracks.max(1),));

    if let Some(level) = options.compression {
        builder = builder.deflate(level);
    }

    if options.shuffle {
        builder = builder.shuffle();
    }

    Ok(builder.create(name)?)
}

fn append_slice<T: H5Type>(dataset: &Dataset, offset: usize, data: &[T]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    let new_len = offset + data.len();
    dataset.resize((new_len,))?;
    let view = ArrayView1::from(data);
    dataset.write_slice(view, s![offset..new_len])?;
    Ok(())
}

fn set_attr_str(location: &hdf5::Location, name: &str, value: &str) -> Result<()> {
    let value = VarLenUnicode::from_str(value)
        .map_err(|e| Error::InvalidFormat(format!("invalid utf-8 attribute: {e}")))?;
    location
        .new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

fn read_dataset_vec<T: H5Type>(group: &Group, name: &str) -> Result<Vec<T>> {
    let dataset = group.dataset(name)?;
    Ok(dataset.read_raw::<T>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamtrack_core::{
        DeviceFit, FitTermination, HitQuality, LineParameters, TrackCandidate,
    };
    use nalgebra::{Vector2, Vector3};
    use tempfile::NamedTempFile;

    fn track(event_number: i64, residual: Option<f64>) -> FittedTrack {
        let fit = |role, r: Option<f64>| DeviceFit {
            role,
            intercept: Vector3::new(0.1, 0.2, 0.0),
            local_intercept: Vector2::new(0.1, 0.2),
            residual: r.map(|v| Vector2::new(v, -v)),
            quality: HitQuality::OneSigma,
        };
        FittedTrack {
            event_number,
            line: LineParameters::from_slopes(0.1, 0.001, 0.2, -0.002),
            devices: vec![
                fit(DeviceRole::Fitted, Some(0.0)),
                fit(
                    if residual.is_some() { DeviceRole::Fitted } else { DeviceRole::NoHit },
                    residual,
                ),
            ],
            chi2: 1.5,
            dof: 1,
            status: TrackStatus::Good,
            termination: FitTermination::WithinCut,
            dropped: Vec::new(),
            isolated: true,
            candidate: TrackCandidate::new(event_number, 2, 0),
        }
    }

    #[test]
    fn test_hdf5_track_sink_multi_batch() {
        let file = NamedTempFile::new().unwrap();
        let options = TrackWriteOptions {
            chunk_tracks: 2,
            compression: None,
            shuffle: false,
        };
        let mut sink = Hdf5TrackSink::create(file.path(), 2, &options).unwrap();
        sink.write_tracks(&[track(1, Some(0.01)), track(1, None)]).unwrap();
        sink.write_tracks(&[track(4, Some(0.02))]).unwrap();
        assert_eq!(sink.len(), 3);
        drop(sink);

        let data = read_tracks_hdf5(file.path()).unwrap();
        assert_eq!(data.event_number, vec![1, 1, 4]);
        assert_eq!(data.status, vec![0, 0, 0]);
        assert_eq!(data.res_x.len(), 2);
        assert!((data.res_x[1][0] - 0.01).abs() < 1e-12);
        assert!(data.res_x[1][1].is_nan());
        assert!((data.res_y[1][2] + 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_hdf5_track_sink_rejects_device_mismatch() {
        let file = NamedTempFile::new().unwrap();
        let mut sink = Hdf5TrackSink::create(file.path(), 3, &TrackWriteOptions::default()).unwrap();
        assert!(sink.write_tracks(&[track(0, None)]).is_err());
        assert!(sink.is_empty());
    }
}
