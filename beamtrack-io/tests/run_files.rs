use beamtrack_algorithms::{
    FinderConfig, FitConfig, ProcessingConfig, Reconstructor, TrackFinder, TrackFitter,
};
use beamtrack_core::{DeviceSpec, Hit, Setup};
use beamtrack_io::{
    load_setup, save_setup, GeometryRecord, HitTableReader, HitTableWriter, TrackTableWriter,
};
use std::fmt::Write as _;
use tempfile::TempDir;

fn setup() -> Setup {
    Setup::new(
        (0..3)
            .map(|i| {
                DeviceSpec::new(format!("plane{i}"), 0.02, 0.02, 200, 200)
                    .with_z_position(f64::from(i) * 10.0)
            })
            .collect(),
    )
    .unwrap()
}

#[test]
fn test_mixed_tables_to_track_csv() {
    let dir = TempDir::new().unwrap();
    let setup = setup();
    let setup_path = dir.path().join("setup.json");
    save_setup(&setup_path, &setup).unwrap();
    let setup = load_setup(&setup_path).unwrap();

    // Straight tracks along z through pixel (100 + e, 80).
    let mut paths = Vec::new();
    for device in 0..2 {
        let mut csv = String::from("event_number,column,row,charge\n");
        for e in 0..10 {
            writeln!(csv, "{e},{},80,5", 100 + e).unwrap();
        }
        let path = dir.path().join(format!("plane{device}.csv"));
        std::fs::write(&path, csv).unwrap();
        paths.push(path);
    }
    let reader = HitTableReader::new(setup.clone());
    let reference = reader.read_device(&paths[0], 0).unwrap();
    let binary = dir.path().join("plane2.bhit");
    let mut writer = HitTableWriter::create(&binary).unwrap();
    let copies: Vec<Hit> = reference.iter().map(|h| Hit { device: 2, ..*h }).collect();
    writer.write_hits(&copies).unwrap();
    writer.flush().unwrap();
    drop(writer);
    paths.push(binary);

    let events = reader.read_run(&paths).unwrap();
    assert_eq!(events.len(), 10);
    assert!(events.iter().all(|e| e.devices_with_hits() == 3));

    let geometry = GeometryRecord::from_geometry(&setup.nominal_geometry(), Some(&setup));
    let geometry_path = dir.path().join("geometry.json");
    geometry.save(&geometry_path).unwrap();
    let geometry = GeometryRecord::load(&geometry_path).unwrap();
    assert_eq!(geometry.devices[2].name.as_deref(), Some("plane2"));

    let reconstructor = Reconstructor::new(
        TrackFinder::new(FinderConfig::default().with_min_devices(3)).unwrap(),
        TrackFitter::for_setup(FitConfig::default(), &setup).unwrap(),
        ProcessingConfig::default().with_chunk_size(4),
    )
    .unwrap();
    let output = reconstructor.reconstruct(&events, &geometry.geometry()).unwrap();
    assert_eq!(output.stats.good, 10);

    let table = dir.path().join("tracks.csv");
    let mut tracks = TrackTableWriter::create(&table, setup.len()).unwrap();
    tracks.write_tracks(&output.tracks).unwrap();
    tracks.flush().unwrap();
    assert_eq!(tracks.rows(), 10);

    let mut csv = csv::Reader::from_path(&table).unwrap();
    let headers = csv.headers().unwrap().clone();
    assert_eq!(headers.len(), 10 + 3 * 6);
    let rows: Vec<csv::StringRecord> = csv.records().map(Result::unwrap).collect();
    assert_eq!(rows.len(), 10);
    assert_eq!(&rows[3][0], "3");
    assert_eq!(&rows[3][1], "good");
    assert_eq!(&rows[3][10], "fitted");
}
