use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use heatwatch::store::{HourObservation, Position, TimeSeriesStore};
use std::fs;

fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 1, day)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

fn obs(indoor: f64) -> HourObservation {
    HourObservation {
        indoor_temp: Some(indoor),
        outdoor_temp: Some(2.0),
        position: Position::Closed,
        price: Some(1.5),
        solar_production: 0.4,
    }
}

#[test]
fn same_hour_overwrites() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = TimeSeriesStore::open(dir.path().join("h.json"), 30, chrono_tz::UTC);

    store.upsert_hour_at(at(5, 10, 5), &obs(20.0)).unwrap();
    let record = store.upsert_hour_at(at(5, 10, 55), &obs(21.0)).unwrap();

    assert_eq!(store.len(), 1);
    assert_eq!(record.timestamp, at(5, 10, 0));
    assert_eq!(store.records()[0].indoor_temp, Some(21.0));
}

#[test]
fn repeated_dst_hour_shares_one_bucket() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = TimeSeriesStore::open(
        dir.path().join("h.json"),
        30,
        chrono_tz::Europe::Stockholm,
    );
    let day = NaiveDate::from_ymd_opt(2025, 10, 26).unwrap();

    // 02:30 occurs twice on this day in Stockholm
    store
        .upsert_hour_at(day.and_hms_opt(2, 30, 0).unwrap(), &obs(20.0))
        .unwrap();
    store
        .upsert_hour_at(day.and_hms_opt(2, 30, 0).unwrap(), &obs(19.0))
        .unwrap();

    assert_eq!(store.len(), 1);
    assert_eq!(store.records()[0].timestamp, day.and_hms_opt(2, 0, 0).unwrap());
    assert_eq!(store.records()[0].indoor_temp, Some(19.0));
}

#[test]
fn out_of_order_inserts_stay_sorted() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = TimeSeriesStore::open(dir.path().join("h.json"), 30, chrono_tz::UTC);

    store.upsert_hour_at(at(5, 12, 0), &obs(1.0)).unwrap();
    store.upsert_hour_at(at(5, 10, 0), &obs(2.0)).unwrap();
    store.upsert_hour_at(at(5, 11, 0), &obs(3.0)).unwrap();

    let hours: Vec<_> = store.records().iter().map(|r| r.timestamp).collect();
    assert_eq!(hours, vec![at(5, 10, 0), at(5, 11, 0), at(5, 12, 0)]);
}

#[test]
fn trims_to_capacity_oldest_first() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = TimeSeriesStore::open(dir.path().join("h.json"), 1, chrono_tz::UTC);

    let start = at(5, 0, 0);
    for h in 0..25 {
        store
            .upsert_hour_at(start + TimeDelta::hours(h), &obs(h as f64))
            .unwrap();
    }
    assert_eq!(store.len(), 24);
    assert_eq!(store.records()[0].timestamp, start + TimeDelta::hours(1));
}

#[test]
fn reload_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("h.json");
    let observations = [
        (at(6, 8, 0), obs(19.5)),
        (
            at(6, 9, 30),
            HourObservation {
                indoor_temp: None,
                outdoor_temp: Some(-4.75),
                position: Position::Open,
                price: Some(0.0312),
                solar_production: -1.25,
            },
        ),
        (
            at(6, 10, 0),
            HourObservation {
                indoor_temp: Some(21.125),
                outdoor_temp: None,
                position: Position::Closed,
                price: None,
                solar_production: 2.6,
            },
        ),
        (
            at(7, 0, 15),
            HourObservation {
                indoor_temp: Some(18.0),
                outdoor_temp: Some(0.1),
                position: Position::Open,
                price: Some(3.5),
                solar_production: 0.0,
            },
        ),
    ];
    let original = {
        let mut store = TimeSeriesStore::open(&path, 30, chrono_tz::UTC);
        for (when, o) in &observations {
            store.upsert_hour_at(*when, o).unwrap();
        }
        store.records().to_vec()
    };
    assert!(path.exists());
    let raw = fs::read_to_string(&path).unwrap();
    assert!(raw.contains("hourly_records"));
    assert!(!raw.contains("energy_saved"));

    let reopened = TimeSeriesStore::open(&path, 30, chrono_tz::UTC);
    assert_eq!(reopened.records(), original.as_slice());
    assert_eq!(reopened.records()[1].indoor_temp, None);
    assert_eq!(reopened.records()[1].device_position, Position::Open);
    assert_eq!(reopened.records()[3].timestamp, at(7, 0, 0));
}

#[test]
fn corrupt_file_gives_empty_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("h.json");
    fs::write(&path, "{ not json").unwrap();

    let mut store = TimeSeriesStore::open(&path, 30, chrono_tz::UTC);
    assert!(store.is_empty());

    // Next write replaces the corrupt file
    store.upsert_hour_at(at(7, 1, 0), &obs(18.0)).unwrap();
    let reopened = TimeSeriesStore::open(&path, 30, chrono_tz::UTC);
    assert_eq!(reopened.len(), 1);
}

#[test]
fn loaded_records_drop_derived_fields() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("h.json");
    fs::write(
        &path,
        r#"{"hourly_records":[{
            "timestamp":"2025-01-08T03:00:00",
            "indoor_temp":20.0,
            "outdoor_temp":1.0,
            "device_position":"open",
            "electricity_price":0.8,
            "energy_saved":99.0,
            "optimal_state":"on"
        }]}"#,
    )
    .unwrap();

    let store = TimeSeriesStore::open(&path, 30, chrono_tz::UTC);
    let record = &store.records()[0];
    assert_eq!(record.device_position, Position::Open);
    assert_eq!(record.energy_saved, None);
    assert_eq!(record.optimal_state, None);
    assert_eq!(record.solar_production, 0.0);
}

#[test]
fn records_since_cutoff() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = TimeSeriesStore::open(dir.path().join("h.json"), 30, chrono_tz::UTC);
    for day in 1..=4 {
        store.upsert_hour_at(at(day, 12, 0), &obs(20.0)).unwrap();
    }
    let recent = store.get_records_since(at(3, 0, 0));
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].timestamp, at(3, 12, 0));
}

#[test]
fn get_records_includes_current_hour() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = TimeSeriesStore::open(
        dir.path().join("h.json"),
        30,
        chrono_tz::Europe::Stockholm,
    );
    let record = store.upsert_hour(&obs(21.0)).unwrap();
    assert_eq!(record.timestamp, store.current_bucket().unwrap());
    assert_eq!(store.get_records(0).len(), 1);
    // Records from long ago fall outside the window
    store.upsert_hour_at(at(1, 0, 0), &obs(10.0)).unwrap();
    assert_eq!(store.get_records(7).len(), 1);
}

#[test]
fn unwritable_path_reports_store_error() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("file");
    fs::write(&blocker, "x").unwrap();
    // Parent is a regular file
    let mut store = TimeSeriesStore::open(blocker.join("h.json"), 30, chrono_tz::UTC);
    let err = store.upsert_hour_at(at(9, 9, 0), &obs(20.0)).unwrap_err();
    assert!(matches!(err, heatwatch::HeatwatchError::Store { .. }));
}
