//! Per-event hit sets built from per-device hit streams.

use crate::error::{Error, Result};
use crate::hit::Hit;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// All hits of one event, grouped by device.
///
/// `hits[d][i]` is hit `i` of device `d`; hit indices are stable and used as
/// the final tie-breaker in track finding.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EventHits {
    /// Event number.
    pub event_number: i64,
    /// Hits per device.
    pub hits: Vec<Vec<Hit>>,
}

impl EventHits {
    /// Creates an empty event for `devices` devices.
    #[must_use]
    pub fn new(event_number: i64, devices: usize) -> Self {
        Self {
            event_number,
            hits: vec![Vec::new(); devices],
        }
    }

    /// Number of devices the event was built for.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.hits.len()
    }

    /// Hits of one device (empty for unknown devices).
    #[must_use]
    pub fn device_hits(&self, device: usize) -> &[Hit] {
        self.hits.get(device).map_or(&[], Vec::as_slice)
    }

    /// Total number of hits across devices.
    #[must_use]
    pub fn total_hits(&self) -> usize {
        self.hits.iter().map(Vec::len).sum()
    }

    /// Number of devices with at least one hit.
    #[must_use]
    pub fn devices_with_hits(&self) -> usize {
        self.hits.iter().filter(|h| !h.is_empty()).count()
    }

    /// Adds a hit to its device.
    ///
    /// # Errors
    /// Returns [`Error::UnknownDevice`] if the hit's device is out of range.
    pub fn push(&mut self, hit: Hit) -> Result<()> {
        let devices = self.hits.len();
        let slot = self.hits.get_mut(hit.device).ok_or(Error::UnknownDevice {
            device: hit.device,
            devices,
        })?;
        slot.push(hit);
        Ok(())
    }
}

/// Checks one device stream: every hit belongs to `device` and event numbers never decrease.
///
/// # Errors
/// Returns [`Error::DeviceMismatch`] or [`Error::NonMonotonicEvent`].
pub fn validate_stream(device: usize, hits: &[Hit]) -> Result<()> {
    let mut previous: Option<i64> = None;
    for hit in hits {
        if hit.device != device {
            return Err(Error::DeviceMismatch {
                expected: device,
                found: hit.device,
            });
        }
        if !(hit.position.x.is_finite() && hit.position.y.is_finite()) {
            return Err(Error::InvalidHit(format!(
                "non-finite position on device {device} in event {}",
                hit.event_number
            )));
        }
        if let Some(prev) = previous {
            if hit.event_number < prev {
                return Err(Error::NonMonotonicEvent {
                    device,
                    previous: prev,
                    current: hit.event_number,
                });
            }
        }
        previous = Some(hit.event_number);
    }
    Ok(())
}

/// Merges per-device hit streams (indexed by device id) into events.
///
/// Streams are merged with a k-way cursor walk, so the output is ordered by
/// event number and each device's hits keep their stream order. Events that
/// only some devices saw are kept.
///
/// # Errors
/// Returns an input error if any stream fails [`validate_stream`].
pub fn merge_device_streams(streams: &[Vec<Hit>]) -> Result<Vec<EventHits>> {
    for (device, hits) in streams.iter().enumerate() {
        validate_stream(device, hits)?;
    }

    let devices = streams.len();
    let mut cursors = vec![0usize; devices];
    let mut events = Vec::new();

    loop {
        let next_event = streams
            .iter()
            .zip(&cursors)
            .filter_map(|(hits, &cursor)| hits.get(cursor).map(|h| h.event_number))
            .min();
        let Some(event_number) = next_event else {
            break;
        };

        let mut event = EventHits::new(event_number, devices);
        for (device, hits) in streams.iter().enumerate() {
            let cursor = &mut cursors[device];
            while let Some(hit) = hits.get(*cursor) {
                if hit.event_number != event_number {
                    break;
                }
                event.hits[device].push(*hit);
                *cursor += 1;
            }
        }
        events.push(event);
    }

    Ok(events)
}
