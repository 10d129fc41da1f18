#![allow(clippy::float_cmp)]
mod common;

use approx::assert_relative_eq;
use beamtrack_algorithms::{
    FinderConfig, FitConfig, ProcessingConfig, Reconstructor, TrackFinder, TrackFitter,
};
use beamtrack_core::{
    DeviceRole, DeviceSpec, EventHits, FitTermination, Geometry, Hit, TrackStatus,
};

fn plane() -> DeviceSpec {
    DeviceSpec::new("plane", 0.1, 0.1, 200, 200)
}

fn event_with(event_number: i64, hits: &[Option<(f64, f64)>]) -> EventHits {
    let spec = plane();
    let mut event = EventHits::new(event_number, hits.len());
    for (device, hit) in hits.iter().enumerate() {
        if let Some((x, y)) = hit {
            event
                .push(Hit::from_local(event_number, device, *x, *y, &spec))
                .unwrap();
        }
    }
    event
}

#[test]
fn test_straight_track_along_z() {
    let geometry = Geometry::from_z_positions(&[0.0, 10.0, 20.0]);
    let event = event_with(0, &[Some((0.0, 0.0)); 3]);

    let finder = TrackFinder::new(FinderConfig::default()).unwrap();
    let candidates = finder.find_event(&event, &geometry).candidates;
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].hit_count(), 3);

    let fitter = TrackFitter::new(FitConfig::default()).unwrap();
    let track = fitter.fit(&candidates[0], &geometry);
    assert_eq!(track.status, TrackStatus::Good);
    assert_relative_eq!(track.chi2, 0.0, epsilon = 1e-12);
    for fit in &track.devices {
        assert!(fit.used_in_fit());
        let residual = fit.residual.unwrap();
        assert_relative_eq!(residual.norm(), 0.0, epsilon = 1e-12);
    }
}

#[test]
fn test_outlier_dropped_by_refit() {
    let geometry = Geometry::from_z_positions(&[0.0, 10.0, 20.0]);
    let event = event_with(0, &[Some((0.0, 0.0)), Some((5.0, 5.0)), Some((0.0, 0.0))]);

    let finder = TrackFinder::new(FinderConfig::default().with_max_distance(10.0)).unwrap();
    let candidates = finder.find_event(&event, &geometry).candidates;
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].hit_count(), 3);

    let fitter = TrackFitter::new(FitConfig::default().with_residual_cut(4.0)).unwrap();
    let track = fitter.fit(&candidates[0], &geometry);
    assert_eq!(track.status, TrackStatus::Good);
    assert_eq!(track.termination, FitTermination::WithinCut);
    assert_eq!(track.used_devices(), 2);
    assert_eq!(track.dropped, vec![1]);

    let middle = track.device(1).unwrap();
    assert!(!middle.used_in_fit());
    assert_eq!(middle.role, DeviceRole::Extrapolated);
    let residual = middle.residual.unwrap();
    assert_relative_eq!(residual.x, 5.0, epsilon = 1e-9);
    assert_relative_eq!(residual.y, 5.0, epsilon = 1e-9);
}

#[test]
fn test_events_below_min_devices_yield_nothing() {
    let geometry = Geometry::from_z_positions(&[0.0, 10.0, 20.0, 30.0]);
    let events = vec![
        event_with(0, &[Some((0.0, 0.0)), None, None, Some((0.0, 0.0))]),
        event_with(1, &[Some((0.0, 0.0)), None, None, None]),
        event_with(2, &[None, Some((1.0, 1.0)), Some((1.0, 1.0)), None]),
    ];

    let finder = TrackFinder::new(
        FinderConfig::default()
            .with_min_devices(3)
            .with_seed_all_devices(true),
    )
    .unwrap();
    let output = finder.find(&events, &geometry);
    assert_eq!(output.events_processed, 3);
    assert_eq!(output.events_without_candidates, 3);
    assert!(output.candidates.is_empty());
}

#[test]
fn test_fit_is_idempotent() {
    let setup = common::telescope(&[0.0, 20.0, 40.0, 60.0, 80.0]);
    let truth = setup.nominal_geometry();
    let events = common::simulate(&setup, &truth, 20, 1, 0.004, 7);

    let finder = TrackFinder::new(FinderConfig::default()).unwrap();
    let fitter = TrackFitter::for_setup(FitConfig::default(), &setup).unwrap();
    for candidate in finder.find(&events, &truth).candidates {
        let first = fitter.fit(&candidate, &truth);
        let second = fitter.fit(&candidate, &truth);
        assert_eq!(first, second);
    }
}

#[test]
fn test_residuals_at_cut_are_retained() {
    let geometry = Geometry::from_z_positions(&[0.0, 10.0, 20.0]);
    let event = event_with(0, &[Some((0.0, 0.0)), Some((0.3, -0.2)), Some((0.0, 0.0))]);
    let finder = TrackFinder::new(FinderConfig::default()).unwrap();
    let candidate = finder.find_event(&event, &geometry).candidates.remove(0);

    let unconstrained = TrackFitter::new(FitConfig::default().with_min_devices(3))
        .unwrap()
        .fit(&candidate, &geometry);
    let largest = unconstrained
        .devices
        .iter()
        .filter_map(|d| d.residual)
        .map(|r| r.norm())
        .fold(0.0, f64::max);
    assert!(largest > 0.0);

    let at_cut = TrackFitter::new(FitConfig::default().with_min_devices(3).with_residual_cut(largest))
        .unwrap()
        .fit(&candidate, &geometry);
    assert_eq!(at_cut.status, TrackStatus::Good);
    assert_eq!(at_cut.used_devices(), 3);
    assert!(at_cut.dropped.is_empty());

    let below_cut = TrackFitter::new(
        FitConfig::default()
            .with_min_devices(3)
            .with_residual_cut(largest * 0.999),
    )
    .unwrap()
    .fit(&candidate, &geometry);
    assert_eq!(below_cut.status, TrackStatus::Rejected);
    assert_eq!(below_cut.termination, FitTermination::DeviceFloor);
}

#[test]
fn test_reconstruction_independent_of_chunking() {
    let setup = common::telescope(&[0.0, 20.0, 40.0, 60.0]);
    let truth = setup.nominal_geometry();
    let events = common::simulate(&setup, &truth, 300, 2, 0.003, 11);

    let finder = TrackFinder::new(FinderConfig::default().with_max_distance(0.6)).unwrap();
    let fitter = TrackFitter::for_setup(FitConfig::default().with_residual_cut(0.05), &setup).unwrap();

    let serial = Reconstructor::new(
        finder.clone(),
        fitter.clone(),
        ProcessingConfig::default().with_workers(1),
    )
    .unwrap()
    .reconstruct(&events, &truth)
    .unwrap();
    let parallel = Reconstructor::new(
        finder,
        fitter,
        ProcessingConfig::default().with_workers(4).with_chunk_size(7),
    )
    .unwrap()
    .reconstruct(&events, &truth)
    .unwrap();

    assert_eq!(serial, parallel);
    assert_eq!(serial.stats.events_processed, 300);
    assert!(serial.stats.good > 500);

    let mut previous = i64::MIN;
    for track in &serial.tracks {
        assert!(track.event_number >= previous);
        previous = track.event_number;
    }
}

#[test]
fn test_track_limit_keeps_event_order_prefix() {
    let setup = common::telescope(&[0.0, 20.0, 40.0]);
    let truth = setup.nominal_geometry();
    let events = common::simulate(&setup, &truth, 40, 1, 0.0, 3);

    let reconstructor = Reconstructor::new(
        TrackFinder::new(FinderConfig::default()).unwrap(),
        TrackFitter::new(FitConfig::default()).unwrap(),
        ProcessingConfig::default().with_chunk_size(6).with_max_tracks(10),
    )
    .unwrap();
    let output = reconstructor.reconstruct(&events, &truth).unwrap();
    assert_eq!(output.tracks.len(), 10);
    assert_eq!(output.stats.candidates, 40);
    assert_eq!(output.stats.dropped_by_limit, 30);
    let numbers: Vec<i64> = output.tracks.iter().map(|t| t.event_number).collect();
    assert_eq!(numbers, (0..10).collect::<Vec<_>>());
}

#[test]
fn test_geometry_mismatch_is_an_input_error() {
    let geometry = Geometry::from_z_positions(&[0.0, 10.0]);
    let events = vec![event_with(0, &[Some((0.0, 0.0)); 3])];
    let reconstructor = Reconstructor::new(
        TrackFinder::new(FinderConfig::default()).unwrap(),
        TrackFitter::new(FitConfig::default()).unwrap(),
        ProcessingConfig::default(),
    )
    .unwrap();
    let err = reconstructor.reconstruct(&events, &geometry).unwrap_err();
    assert!(err.is_input_error());
}
