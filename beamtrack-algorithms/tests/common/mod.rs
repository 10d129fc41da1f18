//! Synthetic telescope data for integration tests.
#![allow(dead_code)]

use beamtrack_core::{DeviceSpec, EventHits, Geometry, Hit, Setup};
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

/// Devices with a 20 um pitch and a 10 mm x 10 mm active area.
pub fn telescope(z_positions: &[f64]) -> Setup {
    let devices = z_positions
        .iter()
        .enumerate()
        .map(|(i, &z)| DeviceSpec::new(format!("plane{i}"), 0.02, 0.02, 500, 500).with_z_position(z))
        .collect();
    Setup::new(devices).unwrap()
}

/// Straight-line events seen through the `truth` geometry.
///
/// Track origins are uniform in [-3, 3] mm at z = 0 and slopes uniform in
/// [-5, 5] mrad. Hits are smeared with Gaussian noise of width `noise` (mm).
pub fn simulate(
    setup: &Setup,
    truth: &Geometry,
    events: usize,
    tracks_per_event: usize,
    noise: f64,
    seed: u64,
) -> Vec<EventHits> {
    let mut rng = StdRng::seed_from_u64(seed);
    let smear = Normal::new(0.0, noise).unwrap();
    let mut output = Vec::with_capacity(events);

    for e in 0..events {
        let event_number = i64::try_from(e).unwrap();
        let mut event = EventHits::new(event_number, setup.len());
        for _ in 0..tracks_per_event {
            let origin = Vector3::new(rng.gen_range(-3.0..3.0), rng.gen_range(-3.0..3.0), 0.0);
            let direction = Vector3::new(rng.gen_range(-0.005..0.005), rng.gen_range(-0.005..0.005), 1.0);
            for device in 0..setup.len() {
                let placement = truth.device(device);
                let Some(global) = placement.intersect(&origin, &direction) else {
                    continue;
                };
                let local = placement.global_to_local(&global);
                let (dx, dy) = if noise > 0.0 {
                    (smear.sample(&mut rng), smear.sample(&mut rng))
                } else {
                    (0.0, 0.0)
                };
                let spec = setup.device(device).unwrap();
                event
                    .push(Hit::from_local(event_number, device, local.x + dx, local.y + dy, spec))
                    .unwrap();
            }
        }
        output.push(event);
    }
    output
}
