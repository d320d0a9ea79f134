use super::*;
use crate::config::Config;
use crate::controller::MessagePublisher;
use axum::body::Body;
use axum::http::Request;
use http_body_util::BodyExt as _;
use std::sync::Mutex as StdMutex;
use tower::ServiceExt;

#[derive(Default)]
struct RecordingPublisher {
    sent: StdMutex<Vec<(String, String)>>,
}

#[async_trait::async_trait]
impl MessagePublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: String) -> crate::error::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }
}

struct Fixture {
    router: Router,
    publisher: Arc<RecordingPublisher>,
    config_path: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.store.path = dir.path().join("history.json").display().to_string();
    config.mqtt.enabled = false;
    config.mqtt.password = Some("secret".to_string());
    let publisher = Arc::new(RecordingPublisher::default());
    let config_path = dir.path().join("heatwatch.yaml");
    let ctx = AppContext::with_publisher(config, publisher.clone())
        .unwrap()
        .with_config_path(&config_path);
    Fixture {
        router: build_router(AppState { ctx: Arc::new(ctx) }),
        publisher,
        config_path,
        _dir: dir,
    }
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

fn get_req(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_ok() {
    let router = axum::Router::new().route("/api/health", get(health));
    let response = router.oneshot(get_req("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn version_reports_build_version() {
    let fx = fixture();
    let (status, body) = send(&fx.router, get_req("/api/version")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "heatwatch");
    assert!(body["version"].as_str().unwrap().starts_with(env!("CARGO_PKG_VERSION")));
}

#[tokio::test]
async fn devices_listed_by_id() {
    let fx = fixture();
    let (status, body) = send(&fx.router, get_req("/api/devices")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["heater"]["type"], "shelly-cover");
    assert_eq!(body["device1"]["threshold"], 100.0);

    let (status, body) = send(&fx.router, get_req("/api/devices/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn switch_state_is_recorded_and_published() {
    let fx = fixture();
    let (status, body) = send(
        &fx.router,
        post_json("/api/devices/device1/state", json!({"state": "on"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["recorded"], true);
    assert_eq!(body["channels"][0]["channel"], "mqtt:home/device1/set");

    let (_, device) = send(&fx.router, get_req("/api/devices/device1")).await;
    assert_eq!(device["state"], "on");

    let sent = fx.publisher.sent.lock().unwrap().clone();
    assert_eq!(sent, vec![("home/device1/set".to_string(), "on".to_string())]);
}

#[tokio::test]
async fn sensor_state_change_is_rejected() {
    let fx = fixture();
    let (status, _) = send(
        &fx.router,
        post_json("/api/devices/indoor/state", json!({"state": "on"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &fx.router,
        post_json("/api/devices/device1/state", json!({"state": "maybe"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn device_create_update_delete() {
    let fx = fixture();
    let (status, body) = send(
        &fx.router,
        post_json("/api/devices", json!({"id": "lamp", "name": "Lamp"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "created");
    assert_eq!(body["device"]["mqtt_topic"], "home/device6");

    let (status, body) = send(
        &fx.router,
        post_json("/api/devices", json!({"id": "lamp", "threshold": 55})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "updated");
    let sent = fx.publisher.sent.lock().unwrap().clone();
    assert_eq!(sent, vec![("home/device6/threshold".to_string(), "55".to_string())]);

    let (status, _) = send(
        &fx.router,
        post_json("/api/devices", json!({"id": "ghost"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let req = Request::builder()
        .method("DELETE")
        .uri("/api/devices/lamp")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&fx.router, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "deleted");
    let (status, _) = send(&fx.router, get_req("/api/devices/lamp")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn history_write_then_read_with_savings() {
    let fx = fixture();
    let (status, record) = send(
        &fx.router,
        post_json(
            "/api/history",
            json!({
                "indoor_temp": 20.0,
                "outdoor_temp": 5.0,
                "device_position": "off",
                "electricity_price": 3.5
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["device_position"], "closed");
    assert_eq!(record["optimal_state"], "off");
    assert_eq!(record["energy_saved"], 5.25);

    let (status, body) = send(&fx.router, get_req("/api/history?days=1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["days"], 1);
    assert_eq!(body["records"].as_array().unwrap().len(), 1);
    assert_eq!(body["total_energy_saved"], 5.25);
}

#[tokio::test]
async fn history_rejects_malformed_body() {
    let fx = fixture();
    let (status, body) = send(
        &fx.router,
        post_json("/api/history", json!({"device_position": "sideways"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("Invalid observation"));
}

#[tokio::test]
async fn meter_endpoint_and_window_reset() {
    let fx = fixture();
    let (status, body) = send(&fx.router, get_req("/api/meter")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["type"], "meter");
    assert_eq!(body["power_window"], json!([]));

    let (status, body) = send(&fx.router, post_json("/api/meter/reset-window", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn meter_history_reset() {
    let fx = fixture();
    let (status, body) = send(&fx.router, post_json("/api/meter/reset-history", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (_, meter) = send(&fx.router, get_req("/api/meter")).await;
    assert_eq!(meter["history"], json!([]));
}

#[tokio::test]
async fn meter_address_change_fetches_device_config() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/rpc/Shelly.GetConfig")
        .with_status(200)
        .with_body(r#"{"sys": {"device": {"name": "Main panel"}}}"#)
        .expect(1)
        .create_async()
        .await;

    let fx = fixture();
    let (status, body) = send(
        &fx.router,
        post_json("/api/devices", json!({"id": "em3", "ip": server.host_with_port()})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "updated");
    assert_eq!(body["device"]["device_config"]["sys"]["device"]["name"], "Main panel");
    mock.assert_async().await;
}

#[tokio::test]
async fn mqtt_update_saves_and_applies_settings() {
    let fx = fixture();
    let (status, body) = send(
        &fx.router,
        post_json(
            "/api/mqtt/update",
            json!({"host": "broker.lan", "port": 8883, "username": "heat", "tls": true}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["mqtt"]["broker"], "broker.lan:8883");
    assert_eq!(body["mqtt"]["connected"], false);

    let saved = Config::from_file(&fx.config_path).unwrap();
    assert_eq!(saved.mqtt.host, "broker.lan");
    assert_eq!(saved.mqtt.port, 8883);
    assert!(saved.mqtt.tls);
    assert_eq!(saved.mqtt.password.as_deref(), Some("secret"));
    assert!(!saved.mqtt.enabled);

    let (_, status_body) = send(&fx.router, get_req("/api/mqtt/status")).await;
    assert_eq!(status_body["broker"], "broker.lan:8883");
    assert_eq!(status_body["username"], "heat");

    let (_, config) = send(&fx.router, get_req("/api/config")).await;
    assert_eq!(config["mqtt"]["host"], "broker.lan");
    assert!(config["mqtt"].get("password").is_none());
}

#[tokio::test]
async fn mqtt_update_rejects_invalid_settings() {
    let fx = fixture();
    let (status, body) = send(
        &fx.router,
        post_json("/api/mqtt/update", json!({"enabled": true, "host": ""})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
    assert!(!fx.config_path.exists());

    let (status, _) = send(
        &fx.router,
        post_json("/api/mqtt/update", json!({"port": "not a port"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, status_body) = send(&fx.router, get_req("/api/mqtt/status")).await;
    assert_eq!(status_body["broker"], "localhost:1883");
}

#[test]
fn upstream_failures_map_to_bad_gateway() {
    for err in [
        HeatwatchError::network("down"),
        HeatwatchError::timeout("slow"),
        HeatwatchError::mqtt("offline"),
    ] {
        assert_eq!(error_response(&err).0, StatusCode::BAD_GATEWAY);
    }
    assert_eq!(
        error_response(&HeatwatchError::store("disk")).0,
        StatusCode::INTERNAL_SERVER_ERROR
    );
}

#[tokio::test]
async fn config_hides_mqtt_password() {
    let fx = fixture();
    let (status, body) = send(&fx.router, get_req("/api/config")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["collector"]["meter_id"], "em3");
    assert!(body["mqtt"].get("password").is_none());

    let (status, schema) = send(&fx.router, get_req("/api/config/schema")).await;
    assert_eq!(status, StatusCode::OK);
    let props = schema["properties"].as_object().unwrap();
    assert!(props.contains_key("savings"));
    assert!(props.contains_key("collector"));
}

#[tokio::test]
async fn mqtt_status_reports_disabled_bridge() {
    let fx = fixture();
    let (status, body) = send(&fx.router, get_req("/api/mqtt/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["connected"], false);
    assert_eq!(body["enabled"], false);
    assert_eq!(body["broker"], "localhost:1883");
}

#[tokio::test]
async fn weather_rejects_bad_location() {
    let fx = fixture();
    let (status, body) = send(&fx.router, get_req("/api/current-weather?location=north")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn openapi_lists_device_routes() {
    let fx = fixture();
    let (status, body) = send(&fx.router, get_req("/openapi.json")).await;
    assert_eq!(status, StatusCode::OK);
    let paths = body["paths"].as_object().unwrap();
    assert!(paths.contains_key("/api/devices/{id}/state"));
    assert!(paths.contains_key("/api/history"));
    assert!(paths.contains_key("/api/mqtt/update"));
    assert!(paths.contains_key("/api/meter/reset-history"));
}
