use chrono::{DurationRound, TimeDelta, Utc};
use heatwatch::collector::{Collector, CycleOutcome};
use heatwatch::config::Config;
use heatwatch::detector::Transition;
use heatwatch::prices::PriceFetcher;
use heatwatch::registry::{DeviceRegistry, HeatState};
use heatwatch::store::{Position, TimeSeriesStore};
use heatwatch::weather::WeatherFetcher;
use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, broadcast};

struct Harness {
    collector: Arc<Collector>,
    registry: DeviceRegistry,
    store: Arc<Mutex<TimeSeriesStore>>,
    updates: broadcast::Receiver<String>,
    _dir: tempfile::TempDir,
}

fn harness(device_addr: &str, service_url: &str, device_timeout: Duration) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    for device in &mut config.devices {
        if device.ip.is_some() {
            device.ip = Some(device_addr.to_string());
        }
    }
    config.prices.base_url = service_url.to_string();
    config.weather.base_url = service_url.to_string();

    let tz = config.tz().unwrap();
    let registry = DeviceRegistry::from_seeds(&config.devices);
    let store = Arc::new(Mutex::new(TimeSeriesStore::open(
        dir.path().join("history.json"),
        config.store.max_days,
        tz,
    )));
    let service_timeout = Duration::from_secs(5);
    let weather = Arc::new(WeatherFetcher::new(&config.weather, service_timeout).unwrap());
    let prices = Arc::new(PriceFetcher::new(&config.prices, service_timeout).unwrap());
    let (tx, rx) = broadcast::channel(8);
    let collector = Arc::new(
        Collector::new(
            config.collector.clone(),
            registry.clone(),
            device_timeout,
            weather,
            prices,
            store.clone(),
            tx,
        )
        .unwrap(),
    );
    Harness {
        collector,
        registry,
        store,
        updates: rx,
        _dir: dir,
    }
}

async fn meter_mock(server: &mut ServerGuard, total: f64) -> Mock {
    server
        .mock("GET", "/rpc/Shelly.GetStatus")
        .with_status(200)
        .with_body(json!({"em:0": {"total_act_power": total}}).to_string())
        .create_async()
        .await
}

async fn service_mocks(server: &mut ServerGuard) -> Vec<Mock> {
    let now = Utc::now();
    let hour = now.duration_trunc(TimeDelta::hours(1)).unwrap();
    let prices = json!([
        {"SEK_per_kWh": 1.25, "time_start": hour.to_rfc3339(),
         "time_end": (hour + TimeDelta::hours(1)).to_rfc3339()}
    ]);
    let forecast = json!({
        "timeSeries": [
            {"validTime": now.to_rfc3339(),
             "parameters": [{"name": "t", "values": [4.5]}]}
        ]
    });
    vec![
        server
            .mock("GET", "/status")
            .with_status(200)
            .with_body(json!({"tmp": {"value": 21.5, "is_valid": true}}).to_string())
            .create_async()
            .await,
        server
            .mock("GET", Matcher::Regex(r"^/\d{4}/\d{2}-\d{2}_SE3\.json$".to_string()))
            .with_status(200)
            .with_body(prices.to_string())
            .create_async()
            .await,
        server
            .mock("GET", Matcher::Regex(r"^/category/pmp3g/".to_string()))
            .with_status(200)
            .with_body(forecast.to_string())
            .create_async()
            .await,
    ]
}

#[tokio::test]
async fn power_step_is_recorded_as_heater_on() {
    let mut server = Server::new_async().await;
    let _services = service_mocks(&mut server).await;
    let mut h = harness(&server.host_with_port(), &server.url(), Duration::from_secs(5));

    let low = meter_mock(&mut server, 500.0).await;
    let CycleOutcome::Completed(first) = h.collector.run_cycle().await else {
        panic!("first cycle skipped");
    };
    low.remove_async().await;
    assert!(first.sensor_ok && first.meter_ok);
    assert_eq!(first.transition, None);
    assert_eq!(first.heat_source_state, Some(HeatState::Off));

    let high = meter_mock(&mut server, 3000.0).await;
    let CycleOutcome::Completed(second) = h.collector.run_cycle().await else {
        panic!("second cycle skipped");
    };
    high.remove_async().await;

    assert_eq!(second.transition, Some(Transition::TurnedOn));
    assert_eq!(second.heat_source_state, Some(HeatState::On));
    assert_eq!(second.indoor_temp, Some(21.5));
    assert_eq!(second.outdoor_temp, Some(4.5));
    assert_eq!(second.price, Some(1.25));
    assert_eq!(second.total_power_w, Some(3000.0));

    let record = second.record.as_ref().unwrap();
    assert_eq!(record.device_position, Position::Open);
    assert_eq!(record.solar_production, 3.0);
    assert!(second.store_error.is_none());

    assert_eq!(
        h.registry.get("heater").await.unwrap().heat_state(),
        Some(HeatState::On)
    );
    // Both cycles fall into the same hour bucket unless the clock rolled over
    assert!(h.store.lock().await.len() <= 2);
    assert_eq!(h.collector.counters(), (2, 0));

    let first_event = h.updates.recv().await.unwrap();
    let event: serde_json::Value = serde_json::from_str(&first_event).unwrap();
    assert_eq!(event["meter_ok"], true);
}

#[tokio::test]
async fn meter_failure_skips_detection_but_still_records() {
    let mut server = Server::new_async().await;
    let _services = service_mocks(&mut server).await;
    let h = harness(&server.host_with_port(), &server.url(), Duration::from_secs(5));

    let low = meter_mock(&mut server, 500.0).await;
    h.collector.run_cycle().await;
    low.remove_async().await;

    let broken = server
        .mock("GET", "/rpc/Shelly.GetStatus")
        .with_status(500)
        .create_async()
        .await;
    let CycleOutcome::Completed(report) = h.collector.run_cycle().await else {
        panic!("cycle skipped");
    };
    broken.assert_async().await;

    assert!(!report.meter_ok);
    assert_eq!(report.transition, None);
    // Previous reading is kept
    assert_eq!(report.total_power_w, Some(500.0));
    assert!(report.record.is_some());
}

#[tokio::test]
async fn overlapping_cycle_is_skipped() {
    // Accepts connections but never answers
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hold = tokio::spawn(async move {
        let mut open = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            open.push(socket);
        }
    });

    let h = harness(
        &addr.to_string(),
        "http://127.0.0.1:1",
        Duration::from_millis(500),
    );

    let slow = tokio::spawn({
        let collector = h.collector.clone();
        async move { collector.run_cycle().await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.collector.is_running());
    assert!(matches!(h.collector.run_cycle().await, CycleOutcome::Skipped));

    let CycleOutcome::Completed(report) = slow.await.unwrap() else {
        panic!("first cycle skipped");
    };
    assert!(!report.sensor_ok);
    assert!(!report.meter_ok);
    assert_eq!(report.outdoor_temp, None);
    assert_eq!(report.price, None);
    assert!(!h.collector.is_running());
    assert_eq!(h.collector.counters(), (1, 1));
    hold.abort();
}

#[tokio::test]
async fn started_collector_stops_cleanly() {
    let h = harness("127.0.0.1:1", "http://127.0.0.1:1", Duration::from_millis(200));
    let handle = h.collector.clone().start();
    tokio::time::sleep(Duration::from_millis(300)).await;
    handle.stop().await.unwrap();
    assert!(!h.collector.is_running());
    assert!(h.collector.counters().0 >= 1);
}
