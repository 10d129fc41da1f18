//! Track candidate search.
//!
//! Hits are projected to the global frame and compared in the transverse
//! plane. Each seed hit is extended greedily with the closest hit of every
//! other device within the matching distance. Competing candidates are
//! resolved in a fixed total order so the output is reproducible:
//! aggregate distance, then hit count (more first), then seed device, then
//! seed hit index.

use beamtrack_core::{cmp_f64, Error, EventHits, Geometry, Result, TrackCandidate};
use nalgebra::Vector2;
use std::cmp::Ordering;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Track finder configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FinderConfig {
    /// Minimum number of devices with a hit for a candidate to be kept.
    pub min_devices: usize,
    /// Maximum transverse distance between a seed and a matched hit.
    pub max_distance: f64,
    /// Device whose hits seed candidates first.
    pub reference_device: usize,
    /// Also seed from every other device (after the reference device).
    pub seed_all_devices: bool,
    /// Devices that must carry a hit in every candidate.
    pub required_devices: Vec<usize>,
    /// Devices ignored by the search.
    pub ignored_devices: Vec<usize>,
    /// Maximum number of candidates kept per event.
    pub max_candidates_per_event: Option<usize>,
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            min_devices: 2,
            max_distance: 1.0,
            reference_device: 0,
            seed_all_devices: false,
            required_devices: Vec::new(),
            ignored_devices: Vec::new(),
            max_candidates_per_event: Some(100),
        }
    }
}

impl FinderConfig {
    /// Creates a finder configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the minimum device count.
    #[must_use]
    pub fn with_min_devices(mut self, min_devices: usize) -> Self {
        self.min_devices = min_devices;
        self
    }

    /// Sets the maximum transverse matching distance.
    #[must_use]
    pub fn with_max_distance(mut self, distance: f64) -> Self {
        self.max_distance = distance;
        self
    }

    /// Sets the seed reference device.
    #[must_use]
    pub fn with_reference_device(mut self, device: usize) -> Self {
        self.reference_device = device;
        self
    }

    /// Seeds from every device, not just the reference.
    #[must_use]
    pub fn with_seed_all_devices(mut self, enabled: bool) -> Self {
        self.seed_all_devices = enabled;
        self
    }

    /// Sets the devices that must have a hit.
    #[must_use]
    pub fn with_required_devices(mut self, devices: Vec<usize>) -> Self {
        self.required_devices = devices;
        self
    }

    /// Sets the devices ignored by the search.
    #[must_use]
    pub fn with_ignored_devices(mut self, devices: Vec<usize>) -> Self {
        self.ignored_devices = devices;
        self
    }

    /// Sets the per-event candidate cap (`None` for no cap).
    #[must_use]
    pub fn with_max_candidates_per_event(mut self, cap: Option<usize>) -> Self {
        self.max_candidates_per_event = cap;
        self
    }

    /// Checks the configuration for impossible values.
    ///
    /// # Errors
    /// Returns [`Error::ConfigError`] for a non-positive distance, a minimum
    /// below 2, a zero cap, or conflicting device lists.
    pub fn validate(&self) -> Result<()> {
        if self.min_devices < 2 {
            return Err(Error::ConfigError(
                "track candidates need at least 2 devices".to_string(),
            ));
        }
        if self.max_distance.is_nan() || self.max_distance <= 0.0 {
            return Err(Error::ConfigError(format!(
                "maximum matching distance must be positive, got {}",
                self.max_distance
            )));
        }
        if self.max_candidates_per_event == Some(0) {
            return Err(Error::ConfigError(
                "candidate cap must be at least 1".to_string(),
            ));
        }
        if self.ignored_devices.contains(&self.reference_device) {
            return Err(Error::ConfigError(format!(
                "reference device {} is ignored",
                self.reference_device
            )));
        }
        if let Some(device) = self
            .required_devices
            .iter()
            .find(|d| self.ignored_devices.contains(d))
        {
            return Err(Error::ConfigError(format!(
                "device {device} is both required and ignored"
            )));
        }
        Ok(())
    }
}

/// Candidates found in one or more events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinderOutput {
    /// Candidates in event order, ranked within each event.
    pub candidates: Vec<TrackCandidate>,
    /// Number of events processed.
    pub events_processed: usize,
    /// Number of events that produced no candidate.
    pub events_without_candidates: usize,
    /// Number of events whose candidate list was cut at the cap.
    pub truncated_events: usize,
}

/// Candidates of one event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventCandidates {
    /// Accepted candidates, ranked.
    pub candidates: Vec<TrackCandidate>,
    /// True if candidates were dropped at the per-event cap.
    pub truncated: bool,
}

/// Finds track candidates in events.
#[derive(Debug, Clone)]
pub struct TrackFinder {
    config: FinderConfig,
}

/// Transverse global positions of one event's hits.
struct ProjectedEvent {
    positions: Vec<Vec<Vector2<f64>>>,
}

impl ProjectedEvent {
    fn new(event: &EventHits, geometry: &Geometry) -> Self {
        let positions = event
            .hits
            .iter()
            .enumerate()
            .map(|(device, hits)| match geometry.get(device) {
                Some(placement) => hits
                    .iter()
                    .map(|hit| placement.local_to_global(&hit.position).xy())
                    .collect(),
                None => Vec::new(),
            })
            .collect();
        Self { positions }
    }

    fn position(&self, device: usize, index: usize) -> Vector2<f64> {
        self.positions[device][index]
    }

    /// Closest hit of `device` to `target`, skipping `taken` hits.
    ///
    /// The hit must lie within `max_distance` of every position in `selected`
    /// (the seed included).
    fn closest(
        &self,
        device: usize,
        target: &Vector2<f64>,
        selected: &[Vector2<f64>],
        max_distance: f64,
        taken: &[Vec<bool>],
    ) -> Option<(usize, f64)> {
        let mut best: Option<(usize, f64)> = None;
        for (index, position) in self.positions[device].iter().enumerate() {
            if taken[device][index] {
                continue;
            }
            if selected.iter().any(|s| (position - s).norm() > max_distance) {
                continue;
            }
            let distance = (position - target).norm();
            // Strict comparison keeps the lowest index on ties.
            if best.is_none_or(|(_, d)| distance < d) {
                best = Some((index, distance));
            }
        }
        best
    }
}

impl TrackFinder {
    /// Creates a finder.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(config: FinderConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &FinderConfig {
        &self.config
    }

    fn seed_devices(&self, devices: usize) -> Vec<usize> {
        let mut seeds = Vec::new();
        if self.config.reference_device < devices {
            seeds.push(self.config.reference_device);
        }
        if self.config.seed_all_devices {
            seeds.extend(
                (0..devices)
                    .filter(|d| *d != self.config.reference_device && !self.is_ignored(*d)),
            );
        }
        seeds
    }

    fn is_ignored(&self, device: usize) -> bool {
        self.config.ignored_devices.contains(&device)
    }

    fn is_acceptable(&self, candidate: &TrackCandidate) -> bool {
        candidate.hit_count() >= self.config.min_devices
            && self
                .config
                .required_devices
                .iter()
                .all(|&d| candidate.has_hit(d))
    }

    /// Finds the candidates of a single event.
    #[must_use]
    pub fn find_event(&self, event: &EventHits, geometry: &Geometry) -> EventCandidates {
        let devices = event.device_count().min(geometry.len());
        if event.devices_with_hits() < self.config.min_devices {
            return EventCandidates::default();
        }

        let projected = ProjectedEvent::new(event, geometry);
        let none_taken: Vec<Vec<bool>> = event.hits.iter().map(|h| vec![false; h.len()]).collect();

        let mut candidates = Vec::new();
        for seed_device in self.seed_devices(devices) {
            for seed_index in 0..event.device_hits(seed_device).len() {
                let candidate =
                    self.extend(event, &projected, devices, seed_device, seed_index, &none_taken);
                if self.is_acceptable(&candidate) {
                    candidates.push(candidate);
                }
            }
        }

        let mut ranked = remove_contained(candidates);
        ranked.sort_by(rank);

        // Greedy acceptance: a hit is consumed by at most one candidate.
        let mut taken = none_taken;
        let mut accepted = Vec::new();
        for candidate in ranked {
            let Some(candidate) = self.reassign(event, &projected, candidate, &taken) else {
                continue;
            };
            for (device, index) in candidate.hit_indices.iter().enumerate() {
                if let Some(index) = index {
                    taken[device][*index] = true;
                }
            }
            accepted.push(candidate);
        }

        let mut truncated = false;
        if let Some(cap) = self.config.max_candidates_per_event {
            if accepted.len() > cap {
                accepted.truncate(cap);
                truncated = true;
            }
        }

        EventCandidates {
            candidates: accepted,
            truncated,
        }
    }

    /// Finds candidates in a sequence of events.
    #[must_use]
    pub fn find(&self, events: &[EventHits], geometry: &Geometry) -> FinderOutput {
        let mut output = FinderOutput::default();
        for event in events {
            let found = self.find_event(event, geometry);
            output.events_processed += 1;
            if found.candidates.is_empty() {
                output.events_without_candidates += 1;
            }
            if found.truncated {
                output.truncated_events += 1;
            }
            output.candidates.extend(found.candidates);
        }
        output
    }

    fn extend(
        &self,
        event: &EventHits,
        projected: &ProjectedEvent,
        devices: usize,
        seed_device: usize,
        seed_index: usize,
        taken: &[Vec<bool>],
    ) -> TrackCandidate {
        let mut candidate = TrackCandidate::new(event.event_number, devices, seed_device);
        candidate.hits[seed_device] = Some(event.hits[seed_device][seed_index]);
        candidate.hit_indices[seed_device] = Some(seed_index);

        let seed = projected.position(seed_device, seed_index);
        let mut selected = vec![seed];
        for device in 0..devices {
            if device == seed_device || self.is_ignored(device) {
                continue;
            }
            if let Some((index, distance)) =
                projected.closest(device, &seed, &selected, self.config.max_distance, taken)
            {
                candidate.hits[device] = Some(event.hits[device][index]);
                candidate.hit_indices[device] = Some(index);
                candidate.aggregate_distance += distance;
                selected.push(projected.position(device, index));
            }
        }
        candidate
    }

    /// Replaces consumed hits of a losing candidate with the closest free hit.
    ///
    /// Returns `None` if the seed hit is consumed or the candidate no longer
    /// satisfies the device constraints.
    fn reassign(
        &self,
        event: &EventHits,
        projected: &ProjectedEvent,
        mut candidate: TrackCandidate,
        taken: &[Vec<bool>],
    ) -> Option<TrackCandidate> {
        let seed_device = candidate.seed_device;
        let seed_index = candidate.hit_indices[seed_device]?;
        if taken[seed_device][seed_index] {
            return None;
        }
        let seed = projected.position(seed_device, seed_index);

        // Replacements must stay within the distance limit of every kept hit.
        let mut selected: Vec<Vector2<f64>> = candidate
            .hit_indices
            .iter()
            .enumerate()
            .filter_map(|(device, index)| {
                index
                    .filter(|&i| !taken[device][i])
                    .map(|i| projected.position(device, i))
            })
            .collect();

        let mut changed = false;
        for device in 0..candidate.device_count() {
            let Some(index) = candidate.hit_indices[device] else {
                continue;
            };
            if !taken[device][index] {
                continue;
            }
            changed = true;
            match projected.closest(device, &seed, &selected, self.config.max_distance, taken) {
                Some((replacement, _)) => {
                    candidate.hits[device] = Some(event.hits[device][replacement]);
                    candidate.hit_indices[device] = Some(replacement);
                    selected.push(projected.position(device, replacement));
                }
                None => {
                    candidate.hits[device] = None;
                    candidate.hit_indices[device] = None;
                }
            }
        }

        if changed {
            candidate.aggregate_distance = candidate
                .hit_indices
                .iter()
                .enumerate()
                .filter(|(device, _)| *device != seed_device)
                .filter_map(|(device, index)| {
                    index.map(|i| (projected.position(device, i) - seed).norm())
                })
                .sum();
        }

        self.is_acceptable(&candidate).then_some(candidate)
    }
}

/// Ranking order of competing candidates.
fn rank(a: &TrackCandidate, b: &TrackCandidate) -> Ordering {
    cmp_f64(a.aggregate_distance, b.aggregate_distance)
        .then(b.hit_count().cmp(&a.hit_count()))
        .then(a.seed_device.cmp(&b.seed_device))
        .then(a.hit_indices[a.seed_device].cmp(&b.hit_indices[b.seed_device]))
}

/// Drops candidates whose hit set duplicates or is contained in another candidate's.
///
/// Of two identical candidates the one found first (seed order) survives.
fn remove_contained(candidates: Vec<TrackCandidate>) -> Vec<TrackCandidate> {
    let contains = |outer: &TrackCandidate, inner: &TrackCandidate| {
        inner
            .hit_indices
            .iter()
            .zip(&outer.hit_indices)
            .all(|(i, o)| i.is_none() || i == o)
    };

    let mut keep = vec![true; candidates.len()];
    for i in 0..candidates.len() {
        for j in 0..candidates.len() {
            if i == j || !keep[j] {
                continue;
            }
            let (a, b) = (&candidates[i], &candidates[j]);
            if contains(b, a) && (a.hit_count() < b.hit_count() || j < i) {
                keep[i] = false;
                break;
            }
        }
    }

    candidates
        .into_iter()
        .zip(keep)
        .filter_map(|(c, k)| k.then_some(c))
        .collect()
}
