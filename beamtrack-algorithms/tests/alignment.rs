#![allow(clippy::cast_precision_loss, clippy::float_cmp)]
mod common;

use beamtrack_algorithms::{
    correlate_all, AlignmentConfig, AlignmentEstimator, AlignmentStatus, CorrelationConfig,
    FinderConfig, FitConfig, PrealignmentConfig, PrealignmentEstimator, ProcessingConfig,
    Reconstructor, TrackFinder, TrackFitter,
};
use beamtrack_core::{AlignmentWarning, DeviceGeometry, Geometry, Setup};
use std::sync::atomic::AtomicBool;

fn truth(setup: &Setup) -> Geometry {
    setup
        .nominal_geometry()
        .with_device(
            1,
            DeviceGeometry::at_z(10.0)
                .with_offset(0.3, -0.2)
                .with_rotation(0.0, 0.0, 0.004),
        )
        .with_device(
            2,
            DeviceGeometry::at_z(20.0)
                .with_offset(-0.25, 0.15)
                .with_rotation(0.0, 0.0, -0.003),
        )
}

fn estimator(setup: &Setup, config: AlignmentConfig) -> AlignmentEstimator {
    let reconstructor = Reconstructor::new(
        TrackFinder::new(FinderConfig::default().with_min_devices(4)).unwrap(),
        TrackFitter::for_setup(FitConfig::default(), setup).unwrap(),
        ProcessingConfig::default().with_chunk_size(128),
    )
    .unwrap();
    AlignmentEstimator::new(config, reconstructor).unwrap()
}

fn max_deviation(a: &Geometry, b: &Geometry) -> (f64, f64) {
    a.iter().zip(b.iter()).fold((0.0_f64, 0.0_f64), |(t, r), (x, y)| {
        (
            t.max((x.translation() - y.translation()).amax()),
            r.max((x.rotation - y.rotation).amax()),
        )
    })
}

/// `truth` expressed in the frame defined by the placements of `first` and
/// `last` in `start`.
///
/// Straight tracks cannot observe a transverse shift that is linear in z, so
/// an error on the fixed devices carries over as such a shift.
fn in_fixed_frame(truth: &Geometry, start: &Geometry, first: usize, last: usize) -> Geometry {
    let e0 = start.device(first).offset - truth.device(first).offset;
    let e1 = start.device(last).offset - truth.device(last).offset;
    let z0 = truth.device(first).z_position;
    let z1 = truth.device(last).z_position;
    Geometry::new(
        truth
            .iter()
            .map(|placement| {
                let f = (placement.z_position - z0) / (z1 - z0);
                DeviceGeometry {
                    offset: placement.offset + e0 + (e1 - e0) * f,
                    ..*placement
                }
            })
            .collect(),
    )
}

#[test]
fn test_round_trip_noise_free() {
    let setup = common::telescope(&[0.0, 10.0, 20.0, 30.0]);
    let truth = truth(&setup);
    let events = common::simulate(&setup, &truth, 400, 1, 0.0, 42);

    let config = AlignmentConfig::default()
        .with_max_iterations(100)
        .with_convergence_threshold(1e-10);
    let outcome = estimator(&setup, config)
        .run(&events, &setup.nominal_geometry())
        .unwrap();

    assert_eq!(outcome.status, AlignmentStatus::Converged);
    assert!(outcome.warnings.is_empty());
    let (translation, rotation) = max_deviation(&outcome.geometry, &truth);
    assert!(translation < 1e-6, "translation off by {translation}");
    assert!(rotation < 1e-6, "rotation off by {rotation}");

    assert_eq!(outcome.stats.good, 400);
    for track in &outcome.tracks {
        for fit in &track.devices {
            assert!(fit.residual.unwrap().norm() < 1e-6);
        }
    }
}

#[test]
fn test_noisy_convergence_with_damping() {
    let setup = common::telescope(&[0.0, 10.0, 20.0, 30.0]);
    let truth = truth(&setup);
    let events = common::simulate(&setup, &truth, 3000, 1, 0.005, 5);

    let config = AlignmentConfig::default()
        .with_max_iterations(60)
        .with_damping(0.5)
        .with_convergence_threshold(1e-3);
    let outcome = estimator(&setup, config)
        .run(&events, &setup.nominal_geometry())
        .unwrap();

    assert!(outcome.status.is_converged());
    assert!(outcome.history.len() >= 3);

    let movements: Vec<f64> = outcome.history.iter().map(|h| h.movement).collect();
    let third = movements.len() / 3;
    let early: f64 = movements[..third.max(1)].iter().sum::<f64>() / third.max(1) as f64;
    let late: f64 =
        movements[movements.len() - third.max(1)..].iter().sum::<f64>() / third.max(1) as f64;
    assert!(late < early);
    assert!(movements[movements.len() - 1] < movements[0]);

    let (translation, rotation) = max_deviation(&outcome.geometry, &truth);
    assert!(translation < 0.005, "translation off by {translation}");
    assert!(rotation < 1e-3, "rotation off by {rotation}");
}

#[test]
fn test_iteration_limit_is_flagged() {
    let setup = common::telescope(&[0.0, 10.0, 20.0, 30.0]);
    let truth = truth(&setup);
    let events = common::simulate(&setup, &truth, 200, 1, 0.0, 8);
    let initial = setup.nominal_geometry();

    let config = AlignmentConfig::default()
        .with_max_iterations(2)
        .with_convergence_threshold(1e-12);
    let outcome = estimator(&setup, config).run(&events, &initial).unwrap();

    assert_eq!(outcome.status, AlignmentStatus::MaxIterationsReached);
    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.history.len(), 2);
    assert!(outcome.final_movement > 0.0);
    assert_ne!(outcome.geometry, initial);
    assert!(!outcome.tracks.is_empty());
}

#[test]
fn test_cancelled_run_keeps_initial_geometry() {
    let setup = common::telescope(&[0.0, 10.0, 20.0, 30.0]);
    let truth = truth(&setup);
    let events = common::simulate(&setup, &truth, 50, 1, 0.0, 9);
    let initial = setup.nominal_geometry();

    let cancel = AtomicBool::new(true);
    let outcome = estimator(&setup, AlignmentConfig::default())
        .run_with_cancel(&events, &initial, &cancel)
        .unwrap();

    assert_eq!(outcome.status, AlignmentStatus::Cancelled);
    assert_eq!(outcome.iterations, 0);
    assert!(outcome.history.is_empty());
    assert_eq!(outcome.geometry, initial);
    assert_eq!(outcome.tracks.len(), 50);
}

#[test]
fn test_insufficient_tracks_leave_devices_unchanged() {
    let setup = common::telescope(&[0.0, 10.0, 20.0, 30.0]);
    let truth = truth(&setup);
    let events = common::simulate(&setup, &truth, 30, 1, 0.0, 10);
    let initial = setup.nominal_geometry();

    let config = AlignmentConfig::default().with_min_tracks(100);
    let outcome = estimator(&setup, config).run(&events, &initial).unwrap();

    assert_eq!(outcome.geometry, initial);
    assert_eq!(outcome.iterations, 1);
    assert_eq!(
        outcome.warnings,
        vec![
            AlignmentWarning::InsufficientTracks {
                device: 1,
                found: 30,
                required: 100
            },
            AlignmentWarning::InsufficientTracks {
                device: 2,
                found: 30,
                required: 100
            },
        ]
    );
}

#[test]
fn test_iterate_does_not_touch_input_geometry() {
    let setup = common::telescope(&[0.0, 10.0, 20.0, 30.0]);
    let truth = truth(&setup);
    let events = common::simulate(&setup, &truth, 100, 1, 0.0, 12);
    let geometry = setup.nominal_geometry();
    let snapshot = geometry.clone();

    let estimator = estimator(&setup, AlignmentConfig::default());
    let first = estimator.iterate(&events, &geometry).unwrap();
    let second = estimator.iterate(&events, &geometry).unwrap();

    assert_eq!(geometry, snapshot);
    assert_eq!(first.correction, second.correction);
    assert_eq!(first.samples, vec![0, 100, 100, 0]);
    // Fixed devices receive no correction.
    assert_eq!(first.correction.devices[0].movement(), 0.0);
    assert_eq!(first.correction.devices[3].movement(), 0.0);
    assert!(first.movement > 0.1);
}

#[test]
fn test_correlation_prealignment_alignment_chain() {
    let setup = common::telescope(&[0.0, 10.0, 20.0, 30.0]);
    let truth = truth(&setup);
    let events = common::simulate(&setup, &truth, 1000, 1, 0.0, 21);
    let nominal = setup.nominal_geometry();

    let correlations = correlate_all(&events, &setup, &CorrelationConfig::default()).unwrap();
    assert_eq!(correlations.len(), 3);

    // Track slopes spread the ridge over several pixels on the downstream devices.
    let prealigned = PrealignmentEstimator::new(PrealignmentConfig::default().with_window_pitches(10.0))
        .unwrap()
        .prealign(&correlations, &setup, &nominal)
        .unwrap();
    assert!(prealigned.warnings.is_empty());
    for device in 1..3 {
        let estimate = prealigned.geometry.device(device).offset;
        let expected = truth.device(device).offset;
        assert!((estimate - expected).amax() < 0.03, "device {device}: {estimate:?}");
    }

    let config = AlignmentConfig::default()
        .with_max_iterations(100)
        .with_convergence_threshold(1e-10);
    let estimator = estimator(&setup, config);
    assert_eq!(estimator.fixed_devices(&prealigned.geometry), vec![0, 3]);
    let outcome = estimator.run(&events, &prealigned.geometry).unwrap();
    assert_eq!(outcome.status, AlignmentStatus::Converged);

    // The prealigned placement of the last device is only bin-precise and stays fixed.
    let expected = in_fixed_frame(&truth, &prealigned.geometry, 0, 3);
    assert_eq!(*outcome.geometry.device(3), *prealigned.geometry.device(3));
    let (translation, rotation) = max_deviation(&outcome.geometry, &expected);
    assert!(translation < 1e-6, "translation off by {translation}");
    assert!(rotation < 1e-6, "rotation off by {rotation}");
}

#[test]
fn test_fixed_device_error_shears_frame() {
    let setup = common::telescope(&[0.0, 10.0, 20.0, 30.0]);
    let truth = truth(&setup);
    let events = common::simulate(&setup, &truth, 400, 1, 0.0, 8);

    // Last device misplaced by a known amount; the first device exact.
    let start = setup
        .nominal_geometry()
        .with_device(3, DeviceGeometry::at_z(30.0).with_offset(0.006, -0.003));
    let config = AlignmentConfig::default()
        .with_max_iterations(100)
        .with_convergence_threshold(1e-10);
    let outcome = estimator(&setup, config).run(&events, &start).unwrap();
    assert_eq!(outcome.status, AlignmentStatus::Converged);

    let expected = in_fixed_frame(&truth, &start, 0, 3);
    assert!((expected.device(1).offset.x - 0.302).abs() < 1e-12);
    assert!((expected.device(2).offset.y - 0.148).abs() < 1e-12);
    let (translation, rotation) = max_deviation(&outcome.geometry, &expected);
    assert!(translation < 1e-6, "translation off by {translation}");
    assert!(rotation < 1e-6, "rotation off by {rotation}");
}
