//! Chunk-parallel track reconstruction.
//!
//! Events are split into fixed-size chunks; each chunk runs the finder and the
//! fitter independently on a dedicated rayon pool. Chunk outputs are collected
//! in chunk order and merged by concatenation, so the result does not depend
//! on the number of workers.

use crate::finder::TrackFinder;
use crate::fitter::TrackFitter;
use beamtrack_core::{Error, EventHits, FittedTrack, Geometry, Result, TrackStatus};
use rayon::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Processing configuration for the map phase.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ProcessingConfig {
    /// Events per chunk.
    pub chunk_size: usize,
    /// Worker threads (`None` uses rayon's default).
    pub workers: Option<usize>,
    /// Keep at most this many tracks (event-ordered prefix).
    pub max_tracks: Option<usize>,
    /// Tracks of the same event closer than this on `isolation_device` are not isolated.
    pub min_track_distance: Option<f64>,
    /// Device whose intercepts are compared for track isolation.
    pub isolation_device: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 10_000,
            workers: None,
            max_tracks: None,
            min_track_distance: None,
            isolation_device: 0,
        }
    }
}

impl ProcessingConfig {
    /// Creates a processing configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the chunk size.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Sets the number of worker threads.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Caps the number of output tracks.
    #[must_use]
    pub fn with_max_tracks(mut self, max_tracks: usize) -> Self {
        self.max_tracks = Some(max_tracks);
        self
    }

    /// Enables the track isolation flag.
    #[must_use]
    pub fn with_min_track_distance(mut self, distance: f64, device: usize) -> Self {
        self.min_track_distance = Some(distance);
        self.isolation_device = device;
        self
    }

    /// Checks the configuration for impossible values.
    ///
    /// # Errors
    /// Returns [`Error::ConfigError`] for a zero chunk size or worker count.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::ConfigError("chunk size must be at least 1".to_string()));
        }
        if self.workers == Some(0) {
            return Err(Error::ConfigError("worker count must be at least 1".to_string()));
        }
        if let Some(distance) = self.min_track_distance {
            if distance.is_nan() || distance < 0.0 {
                return Err(Error::ConfigError(format!(
                    "minimum track distance must be non-negative, got {distance}"
                )));
            }
        }
        Ok(())
    }
}

/// Counters collected over a reconstruction pass.
///
/// Candidate and status counts cover every fitted track, including the ones
/// cut by `max_tracks`; those are counted in `dropped_by_limit`.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TrackStatistics {
    /// Events processed.
    pub events_processed: usize,
    /// Events without any candidate.
    pub events_without_candidates: usize,
    /// Events whose candidates were cut at the per-event cap.
    pub truncated_events: usize,
    /// Candidates fitted.
    pub candidates: usize,
    /// Tracks with status good.
    pub good: usize,
    /// Tracks with status rejected.
    pub rejected: usize,
    /// Tracks with a degenerate fit.
    pub degenerate: usize,
    /// `tracks_per_event[n]` is the number of events with `n` candidates.
    pub tracks_per_event: Vec<usize>,
    /// Fitted tracks removed from the output by the `max_tracks` limit.
    pub dropped_by_limit: usize,
}

impl TrackStatistics {
    fn record_event(&mut self, tracks: &[FittedTrack], truncated: bool) {
        self.events_processed += 1;
        if tracks.is_empty() {
            self.events_without_candidates += 1;
        }
        if truncated {
            self.truncated_events += 1;
        }
        if self.tracks_per_event.len() <= tracks.len() {
            self.tracks_per_event.resize(tracks.len() + 1, 0);
        }
        self.tracks_per_event[tracks.len()] += 1;
        for track in tracks {
            self.candidates += 1;
            match track.status {
                TrackStatus::Good => self.good += 1,
                TrackStatus::Rejected => self.rejected += 1,
                TrackStatus::Degenerate => self.degenerate += 1,
            }
        }
    }

    /// Adds the counters of another chunk.
    pub fn merge(&mut self, other: &TrackStatistics) {
        self.events_processed += other.events_processed;
        self.events_without_candidates += other.events_without_candidates;
        self.truncated_events += other.truncated_events;
        self.candidates += other.candidates;
        self.good += other.good;
        self.rejected += other.rejected;
        self.degenerate += other.degenerate;
        self.dropped_by_limit += other.dropped_by_limit;
        if self.tracks_per_event.len() < other.tracks_per_event.len() {
            self.tracks_per_event.resize(other.tracks_per_event.len(), 0);
        }
        for (a, b) in self.tracks_per_event.iter_mut().zip(&other.tracks_per_event) {
            *a += b;
        }
    }

    /// Mean number of candidates per processed event.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn mean_tracks_per_event(&self) -> f64 {
        if self.events_processed == 0 {
            0.0
        } else {
            self.candidates as f64 / self.events_processed as f64
        }
    }
}

/// Fitted tracks of a reconstruction pass, in event order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconstruction {
    /// Fitted tracks, including rejected and degenerate ones.
    pub tracks: Vec<FittedTrack>,
    /// Counters.
    pub stats: TrackStatistics,
}

impl Reconstruction {
    /// Tracks with status good.
    pub fn good_tracks(&self) -> impl Iterator<Item = &FittedTrack> {
        self.tracks.iter().filter(|t| t.is_good())
    }
}

/// Runs the finder and fitter over events on a worker pool.
pub struct Reconstructor {
    finder: TrackFinder,
    fitter: TrackFitter,
    config: ProcessingConfig,
    pool: rayon::ThreadPool,
}

impl Reconstructor {
    /// Creates a reconstructor with its own thread pool.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the pool cannot be built.
    pub fn new(finder: TrackFinder, fitter: TrackFitter, config: ProcessingConfig) -> Result<Self> {
        config.validate()?;
        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(workers) = config.workers {
            builder = builder.num_threads(workers);
        }
        let pool = builder
            .build()
            .map_err(|e| Error::WorkerPool(e.to_string()))?;
        Ok(Self {
            finder,
            fitter,
            config,
            pool,
        })
    }

    /// The track finder.
    #[must_use]
    pub fn finder(&self) -> &TrackFinder {
        &self.finder
    }

    /// The track fitter.
    #[must_use]
    pub fn fitter(&self) -> &TrackFitter {
        &self.fitter
    }

    /// The processing configuration.
    #[must_use]
    pub fn config(&self) -> &ProcessingConfig {
        &self.config
    }

    /// Reconstructs tracks in `events` under one geometry snapshot.
    ///
    /// # Errors
    /// Returns [`Error::GeometryMismatch`] if an event has a different number
    /// of devices than the geometry.
    pub fn reconstruct(&self, events: &[EventHits], geometry: &Geometry) -> Result<Reconstruction> {
        for event in events {
            geometry.check_devices(event.device_count())?;
        }

        let chunks: Vec<Reconstruction> = self.pool.install(|| {
            events
                .par_chunks(self.config.chunk_size)
                .map(|chunk| self.process_chunk(chunk, geometry))
                .collect()
        });

        let mut merged = Reconstruction::default();
        for mut chunk in chunks {
            merged.tracks.append(&mut chunk.tracks);
            merged.stats.merge(&chunk.stats);
        }

        if let Some(max_tracks) = self.config.max_tracks {
            if merged.tracks.len() > max_tracks {
                merged.stats.dropped_by_limit = merged.tracks.len() - max_tracks;
                merged.tracks.truncate(max_tracks);
                log::info!(
                    "track limit {max_tracks} reached, {} tracks dropped",
                    merged.stats.dropped_by_limit
                );
            }
        }

        log::debug!(
            "reconstructed {} tracks ({} good) in {} events",
            merged.tracks.len(),
            merged.stats.good,
            merged.stats.events_processed
        );
        Ok(merged)
    }

    fn process_chunk(&self, events: &[EventHits], geometry: &Geometry) -> Reconstruction {
        let mut output = Reconstruction::default();
        for event in events {
            let found = self.finder.find_event(event, geometry);
            let mut tracks: Vec<FittedTrack> = found
                .candidates
                .iter()
                .map(|candidate| self.fitter.fit(candidate, geometry))
                .collect();
            if let Some(distance) = self.config.min_track_distance {
                mark_isolation(&mut tracks, self.config.isolation_device, distance);
            }
            output.stats.record_event(&tracks, found.truncated);
            output.tracks.append(&mut tracks);
        }
        output
    }
}

/// Reconstructs tracks with a one-off worker pool.
///
/// # Errors
/// Returns an error if the configuration is invalid, the pool cannot be
/// built, or the geometry does not match the events.
pub fn reconstruct(
    events: &[EventHits],
    geometry: &Geometry,
    finder: &TrackFinder,
    fitter: &TrackFitter,
    config: &ProcessingConfig,
) -> Result<Reconstruction> {
    Reconstructor::new(finder.clone(), fitter.clone(), config.clone())?.reconstruct(events, geometry)
}

/// Clears `isolated` on tracks whose intercepts on `device` are closer than `min_distance`.
fn mark_isolation(tracks: &mut [FittedTrack], device: usize, min_distance: f64) {
    let intercepts: Vec<_> = tracks
        .iter()
        .map(|t| t.device(device).map(|d| d.intercept.xy()))
        .collect();
    for i in 0..tracks.len() {
        for j in (i + 1)..tracks.len() {
            if let (Some(a), Some(b)) = (intercepts[i], intercepts[j]) {
                if (a - b).norm() < min_distance {
                    tracks[i].isolated = false;
                    tracks[j].isolated = false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finder::FinderConfig;
    use crate::fitter::FitConfig;
    use beamtrack_core::{DeviceSpec, Hit};

    fn events(n: i64) -> Vec<EventHits> {
        let spec = DeviceSpec::new("plane", 0.1, 0.1, 100, 100);
        (0..n)
            .map(|e| {
                let mut event = EventHits::new(e, 3);
                #[allow(clippy::cast_precision_loss)]
                let x = (e % 7) as f64 * 0.5;
                for device in 0..3 {
                    event.push(Hit::from_local(e, device, x, 0.0, &spec)).unwrap();
                    if e % 2 == 0 {
                        event.push(Hit::from_local(e, device, x + 0.3, 0.0, &spec)).unwrap();
                    }
                }
                event
            })
            .collect()
    }

    fn reconstructor(config: ProcessingConfig) -> Reconstructor {
        Reconstructor::new(
            TrackFinder::new(FinderConfig::default().with_max_distance(0.1)).unwrap(),
            TrackFitter::new(FitConfig::default()).unwrap(),
            config,
        )
        .unwrap()
    }

    #[test]
    fn test_result_independent_of_workers() {
        let geometry = Geometry::from_z_positions(&[0.0, 10.0, 20.0]);
        let events = events(50);
        let serial = reconstructor(ProcessingConfig::default().with_workers(1).with_chunk_size(50))
            .reconstruct(&events, &geometry)
            .unwrap();
        let parallel = reconstructor(ProcessingConfig::default().with_workers(4).with_chunk_size(3))
            .reconstruct(&events, &geometry)
            .unwrap();
        assert_eq!(serial, parallel);
        assert_eq!(serial.tracks.len(), 75);
        assert_eq!(serial.stats.tracks_per_event, vec![0, 25, 25]);
        let numbers: Vec<i64> = serial.tracks.iter().map(|t| t.event_number).collect();
        let mut sorted = numbers.clone();
        sorted.sort_unstable();
        assert_eq!(numbers, sorted);
    }

    #[test]
    fn test_max_tracks_and_isolation() {
        let geometry = Geometry::from_z_positions(&[0.0, 10.0, 20.0]);
        let events = events(4);
        let result = reconstructor(
            ProcessingConfig::default()
                .with_max_tracks(3)
                .with_min_track_distance(0.5, 1),
        )
        .reconstruct(&events, &geometry)
        .unwrap();
        assert_eq!(result.tracks.len(), 3);
        assert!(!result.tracks[0].isolated);
        assert!(!result.tracks[1].isolated);
        assert!(result.tracks[2].isolated);
    }

    #[test]
    fn test_geometry_mismatch_is_an_error() {
        let geometry = Geometry::from_z_positions(&[0.0, 10.0]);
        let err = reconstructor(ProcessingConfig::default())
            .reconstruct(&events(2), &geometry)
            .unwrap_err();
        assert!(matches!(err, Error::GeometryMismatch { expected: 3, found: 2 }));
    }

    #[test]
    fn test_validate() {
        assert!(ProcessingConfig::default().with_chunk_size(0).validate().is_err());
        assert!(ProcessingConfig::default().with_workers(0).validate().is_err());
    }
}
