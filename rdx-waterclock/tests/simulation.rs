//! Drives whole simulated days through the engine, starting from program
//! files written by hand the way an operator would.

use chrono::NaiveDate;
use chrono_tz::Tz;
use std::fs;
use std::path::Path;
use waterclock::prelude::*;

fn write_program(dir: &Path, id: u32, body: &str) {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join(format!("program_{id}.json")), body).unwrap();
}

fn config(root: &Path) -> WaterclockConfig {
    WaterclockConfig {
        programs_dir: root.join("programs"),
        event_log: root.join("events.db3"),
        stations: vec![
            Station::new(1, "front lawn"),
            Station::new(2, "back lawn"),
            Station::new(3, "drip line"),
        ],
        ..Default::default()
    }
}

fn seed_programs(programs: &Path) {
    write_program(
        programs,
        0,
        r#"{
            "program_id": 0,
            "name": "lawns",
            "trigger": "EVEN_DAY",
            "time_of_day": "06:00:00",
            "station_blocks": [
                { "station_id": 1, "duration": 600 },
                { "station_id": 2, "duration": 900 }
            ]
        }"#,
    );
    write_program(
        programs,
        1,
        r#"{
            "program_id": 1,
            "name": "drip",
            "trigger": "DAY_OF_WEEK",
            "days_of_week": [0, 2, 4],
            "time_of_day": "19:30:00",
            "station_blocks": [
                { "station_id": 3, "duration": 1800 }
            ]
        }"#,
    );
    write_program(programs, 2, "{ \"program_id\": 2, \"name\": ");
}

#[test]
fn one_week_of_watering() {
    let root = tempfile::tempdir().unwrap();
    let config = config(root.path());
    seed_programs(&config.programs_dir);

    let mut engine = WaterclockEngine::from_config(config).unwrap();
    assert_eq!(engine.startup().unwrap(), 2);
    assert_eq!(engine.registry().load_failures().len(), 1);

    // Monday 2024-01-01 is day 1 (odd).
    let mut clock = SimClock::starting_at(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), Tz::UTC);
    let mut starts = Vec::new();
    for _ in 0..7 * 24 * 3600 {
        let now = clock.now();
        let report = engine.tick(&now).unwrap();
        let running = engine.registry().programs().filter(|p| p.is_running()).count();
        assert!(running <= 1);
        if let Some(id) = report.started {
            starts.push((now.day, id));
        }
        clock.tick();
    }

    // Lawns on days 2, 4 and 6; drip on Monday, Wednesday and Friday.
    assert_eq!(
        starts,
        vec![
            (1, ProgramId(1)),
            (2, ProgramId(0)),
            (3, ProgramId(1)),
            (4, ProgramId(0)),
            (5, ProgramId(1)),
            (6, ProgramId(0)),
        ]
    );

    let lawn_events = engine.event_log().program_events(ProgramId(0)).unwrap();
    assert_eq!(lawn_events.len(), 6);
    let durations: Vec<i64> = lawn_events
        .chunks(2)
        .map(|pair| pair[1].epoch - pair[0].epoch)
        .collect();
    assert_eq!(durations, vec![1500, 1500, 1500]);
    assert_eq!(
        engine.event_log().station_events(StationId(3)).unwrap().len(),
        6
    );
}

#[test]
fn interrupted_run_keeps_only_persisted_events() {
    let root = tempfile::tempdir().unwrap();
    let config = config(root.path());
    seed_programs(&config.programs_dir);

    let mut engine = WaterclockEngine::from_config(config.clone()).unwrap();
    engine.startup().unwrap();
    let mut clock = SimClock::starting_at(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), Tz::UTC);

    // Run through the lawn program and commit.
    let summary = engine.run_simulated(&mut clock, 7 * 3600).unwrap();
    assert_eq!((summary.starts, summary.stops), (1, 1));
    engine.event_log_mut().persist().unwrap();

    // Start it again the next even day, then "crash" without persisting.
    let mut clock = SimClock::starting_at(NaiveDate::from_ymd_opt(2024, 1, 4).unwrap(), Tz::UTC);
    clock.advance(6 * 3600);
    let report = engine.tick(&clock.now()).unwrap();
    assert_eq!(report.started, Some(ProgramId(0)));
    assert!(report.changed);
    drop(engine);

    let reopened = EventLog::open(&config.event_log).unwrap();
    let events = reopened.program_events(ProgramId(0)).unwrap();
    assert_eq!(
        events.iter().map(|e| e.event).collect::<Vec<_>>(),
        vec![EventType::Start, EventType::Stop]
    );
}

#[test]
fn edited_programs_are_written_back_on_shutdown() {
    let root = tempfile::tempdir().unwrap();
    let config = config(root.path());
    seed_programs(&config.programs_dir);

    let mut engine = WaterclockEngine::from_config(config.clone()).unwrap();
    engine.startup().unwrap();
    assert!(!engine.registry().dirty());

    engine
        .registry_mut()
        .get_mut(ProgramId(1))
        .unwrap()
        .set_name("drip (beds)");
    let added = engine.registry_mut().add(
        Program::new(
            "hedges",
            TriggerPattern::OddDay,
            chrono::NaiveTime::from_hms_opt(21, 0, 0).unwrap(),
        )
        .with_block(2, 120),
    );
    // Slot 2 only holds a corrupt file, so it is free.
    assert_eq!(added, ProgramId(2));
    engine.shutdown().unwrap();

    let mut registry = ProgramRegistry::new(&config.programs_dir).unwrap();
    assert_eq!(registry.load_all().unwrap(), 3);
    assert_eq!(registry[ProgramId(1)].name(), "drip (beds)");
    assert_eq!(registry[ProgramId(2)].name(), "hedges");
    assert!(registry.load_failures().is_empty());
}
