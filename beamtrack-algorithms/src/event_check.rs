//! Detection of event-number desynchronisation between two devices.
//!
//! A device that lost or gained triggers keeps producing hits, but they no
//! longer line up with the reference device. Such stretches show up as runs
//! of consecutive events in which both devices have hits yet no pair is
//! within a tolerance in the global transverse plane.

use beamtrack_core::{Error, EventHits, Geometry, Result};

/// A run of consecutive events without a correlated hit pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationBreak {
    /// First event number of the run.
    pub first_event: i64,
    /// Last event number of the run.
    pub last_event: i64,
    /// Number of checked events in the run.
    pub events: usize,
}

/// Finds runs of at least `min_run` uncorrelated events between `reference` and `device`.
///
/// Only events in which both devices have hits are checked; others neither
/// extend nor interrupt a run.
///
/// # Errors
/// Returns an error if a device is outside the geometry, the tolerance is not
/// positive, or `min_run` is zero.
pub fn find_correlation_breaks(
    events: &[EventHits],
    geometry: &Geometry,
    reference: usize,
    device: usize,
    tolerance: f64,
    min_run: usize,
) -> Result<Vec<CorrelationBreak>> {
    for d in [reference, device] {
        if geometry.get(d).is_none() {
            return Err(Error::UnknownDevice {
                device: d,
                devices: geometry.len(),
            });
        }
    }
    if tolerance.is_nan() || tolerance <= 0.0 || min_run == 0 {
        return Err(Error::ConfigError(format!(
            "invalid correlation check parameters: tolerance {tolerance}, run {min_run}"
        )));
    }

    let reference_placement = geometry.device(reference);
    let device_placement = geometry.device(device);
    let mut breaks = Vec::new();
    let mut run: Option<CorrelationBreak> = None;

    for event in events {
        let reference_hits = event.device_hits(reference);
        let device_hits = event.device_hits(device);
        if reference_hits.is_empty() || device_hits.is_empty() {
            continue;
        }

        let correlated = reference_hits.iter().any(|r| {
            let a = reference_placement.local_to_global(&r.position).xy();
            device_hits.iter().any(|d| {
                let b = device_placement.local_to_global(&d.position).xy();
                (a - b).norm() <= tolerance
            })
        });

        if correlated {
            if let Some(finished) = run.take() {
                if finished.events >= min_run {
                    breaks.push(finished);
                }
            }
        } else {
            let current = run.get_or_insert(CorrelationBreak {
                first_event: event.event_number,
                last_event: event.event_number,
                events: 0,
            });
            current.last_event = event.event_number;
            current.events += 1;
        }
    }

    if let Some(finished) = run {
        if finished.events >= min_run {
            breaks.push(finished);
        }
    }

    if !breaks.is_empty() {
        log::warn!(
            "device {device}: {} event ranges uncorrelated with device {reference}",
            breaks.len()
        );
    }
    Ok(breaks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use beamtrack_core::{DeviceSpec, Hit};

    #[test]
    fn test_detects_shifted_stretch() {
        let spec = DeviceSpec::new("plane", 0.1, 0.1, 100, 100);
        let geometry = Geometry::from_z_positions(&[0.0, 10.0]);
        let positions: Vec<f64> = (0..20).map(|i| f64::from(i) * 0.2 - 2.0).collect();
        let events: Vec<EventHits> = (0..20_i64)
            .map(|e| {
                let idx = usize::try_from(e).unwrap();
                let mut event = EventHits::new(e, 2);
                event
                    .push(Hit::from_local(e, 0, positions[idx], 0.0, &spec))
                    .unwrap();
                // Events 8..14 carry the next event's hit on device 1.
                let source = if (8..14).contains(&idx) { idx + 1 } else { idx };
                event
                    .push(Hit::from_local(e, 1, positions[source], 0.0, &spec))
                    .unwrap();
                event
            })
            .collect();

        let breaks = find_correlation_breaks(&events, &geometry, 0, 1, 0.05, 3).unwrap();
        assert_eq!(
            breaks,
            vec![CorrelationBreak {
                first_event: 8,
                last_event: 13,
                events: 6
            }]
        );
        assert!(find_correlation_breaks(&events, &geometry, 0, 1, 0.05, 7)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_rejects_bad_parameters() {
        let geometry = Geometry::from_z_positions(&[0.0, 10.0]);
        assert!(find_correlation_breaks(&[], &geometry, 0, 3, 0.1, 1).is_err());
        assert!(find_correlation_breaks(&[], &geometry, 0, 1, 0.0, 1).is_err());
    }
}
