//! Axum-based HTTP server with OpenAPI (utoipa) and Swagger UI

use crate::app::AppContext;
use crate::error::HeatwatchError;
use crate::mqtt::MqttUpdate;
use crate::registry::{DeviceState, DeviceUpsert, HeatState};
use crate::store::HourObservation;
use crate::weather::Coordinates;
use axum::response::Redirect;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, get_service, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio_stream::StreamExt;
use tower_http::services::ServeDir;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{IntoParams, OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

const DEFAULT_HISTORY_DAYS: u32 = 7;

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<AppContext>,
}

#[derive(Deserialize, ToSchema)]
pub struct StateBody {
    /// `on` or `off`
    pub state: String,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct HistoryParams {
    pub days: Option<u32>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct LocationParams {
    /// `lon,lat`; defaults to the configured location
    pub location: Option<String>,
}

fn error_response(err: &HeatwatchError) -> (StatusCode, Json<Value>) {
    let status = match err {
        HeatwatchError::NotFound { .. } => StatusCode::NOT_FOUND,
        HeatwatchError::Validation { .. } | HeatwatchError::Serialization { .. } => {
            StatusCode::BAD_REQUEST
        }
        e if e.is_transient() => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": err.to_string()})))
}

fn resolve_location(
    state: &AppState,
    params: &LocationParams,
) -> Result<Coordinates, (StatusCode, Json<Value>)> {
    match params.location.as_deref() {
        None | Some("") => Ok(state.ctx.weather.default_coords()),
        Some(raw) => raw.parse::<Coordinates>().map_err(|e| error_response(&e)),
    }
}

#[utoipa::path(get, path = "/api/health", responses(
    (status = 200, description = "Service is healthy")
))]
async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[utoipa::path(get, path = "/api/version", responses((status = 200)))]
async fn version(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = (chrono::Utc::now() - state.ctx.started_at).num_seconds();
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("APP_VERSION"),
        "uptime_secs": uptime,
    }))
}

#[utoipa::path(get, path = "/api/prices", responses(
    (status = 200, description = "Price curve for today and tomorrow, empty when unavailable")
))]
async fn prices(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.ctx.get_price_curve().await)
}

#[utoipa::path(get, path = "/api/weather", params(LocationParams), responses(
    (status = 200, description = "Point forecast"),
    (status = 500, description = "Forecast unavailable")
))]
async fn weather(
    State(state): State<AppState>,
    Query(params): Query<LocationParams>,
) -> impl IntoResponse {
    let coords = match resolve_location(&state, &params) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match state.ctx.weather.forecast_at(coords).await {
        Some(forecast) => (
            StatusCode::OK,
            Json(serde_json::to_value(forecast).unwrap_or(Value::Null)),
        ),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Could not fetch weather data"})),
        ),
    }
}

#[utoipa::path(get, path = "/api/current-weather", params(LocationParams), responses(
    (status = 200, description = "Temperature closest to now"),
    (status = 500, description = "Forecast unavailable")
))]
async fn current_weather(
    State(state): State<AppState>,
    Query(params): Query<LocationParams>,
) -> impl IntoResponse {
    let coords = match resolve_location(&state, &params) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match state.ctx.weather.current_at(coords).await {
        Some(current) => (
            StatusCode::OK,
            Json(serde_json::to_value(current).unwrap_or(Value::Null)),
        ),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Could not fetch weather data"})),
        ),
    }
}

#[utoipa::path(get, path = "/api/devices", responses((status = 200)))]
async fn list_devices(State(state): State<AppState>) -> impl IntoResponse {
    let devices: BTreeMap<String, DeviceState> = state
        .ctx
        .list_devices()
        .await
        .into_iter()
        .map(|d| (d.id.clone(), d))
        .collect();
    Json(devices)
}

#[utoipa::path(post, path = "/api/devices", responses(
    (status = 200, description = "Device created or updated"),
    (status = 400, description = "Invalid device ID")
))]
async fn upsert_device(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let req: DeviceUpsert = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("Invalid device request: {}", e)})),
            );
        }
    };
    match state.ctx.upsert_device(req).await {
        Ok(outcome) => {
            let status = if outcome.created { "created" } else { "updated" };
            (
                StatusCode::OK,
                Json(json!({"status": status, "device": outcome.device})),
            )
        }
        Err(e) => error_response(&e),
    }
}

#[utoipa::path(get, path = "/api/devices/{id}", responses(
    (status = 200), (status = 404, description = "Device not found")
))]
async fn get_device(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.ctx.get_device(&id).await {
        Some(device) => (
            StatusCode::OK,
            Json(serde_json::to_value(device).unwrap_or(Value::Null)),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Device not found"})),
        ),
    }
}

#[utoipa::path(delete, path = "/api/devices/{id}", responses(
    (status = 200), (status = 404, description = "Device not found")
))]
async fn delete_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.ctx.remove_device(&id).await {
        Ok(device) => (
            StatusCode::OK,
            Json(json!({"status": "deleted", "device": device})),
        ),
        Err(e) => error_response(&e),
    }
}

#[utoipa::path(post, path = "/api/devices/{id}/state", request_body = StateBody, responses(
    (status = 200, description = "Delivery report"),
    (status = 400, description = "Unsupported state or device type"),
    (status = 404, description = "Device not found")
))]
async fn set_device_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<StateBody>,
) -> impl IntoResponse {
    let target = match body.state.parse::<HeatState>() {
        Ok(s) => s,
        Err(e) => return error_response(&e),
    };
    match state.ctx.set_device_state(&id, target).await {
        Ok(report) => (
            StatusCode::OK,
            Json(serde_json::to_value(report).unwrap_or(Value::Null)),
        ),
        Err(e) => error_response(&e),
    }
}

#[utoipa::path(post, path = "/api/devices/{id}/stop", responses(
    (status = 200, description = "Delivery report"),
    (status = 400, description = "Device is not a cover"),
    (status = 404, description = "Device not found")
))]
async fn stop_device(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.ctx.stop_device(&id).await {
        Ok(report) => (
            StatusCode::OK,
            Json(serde_json::to_value(report).unwrap_or(Value::Null)),
        ),
        Err(e) => error_response(&e),
    }
}

#[utoipa::path(get, path = "/api/history", params(HistoryParams), responses(
    (status = 200, description = "Hourly records with savings estimates")
))]
async fn get_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    let days = params.days.unwrap_or(DEFAULT_HISTORY_DAYS);
    let records = state.ctx.get_history(days).await;
    let total = crate::savings::total_saved(&records);
    Json(json!({
        "days": days,
        "total_energy_saved": total,
        "records": records,
    }))
}

#[utoipa::path(post, path = "/api/history", responses(
    (status = 200, description = "Stored record for the current hour"),
    (status = 400, description = "Malformed observation")
))]
async fn post_history(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let obs: HourObservation = match serde_json::from_value(body) {
        Ok(o) => o,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("Invalid observation: {}", e)})),
            );
        }
    };
    match state.ctx.record_hour(&obs).await {
        Ok(record) => (
            StatusCode::OK,
            Json(serde_json::to_value(record).unwrap_or(Value::Null)),
        ),
        Err(e) => error_response(&e),
    }
}

#[utoipa::path(get, path = "/api/meter", responses(
    (status = 200, description = "Meter entry with latest reading and power window"),
    (status = 404, description = "Meter not registered")
))]
async fn get_meter(State(state): State<AppState>) -> impl IntoResponse {
    let id = &state.ctx.config.collector.meter_id;
    match state.ctx.get_device(id).await {
        Some(device) => (
            StatusCode::OK,
            Json(serde_json::to_value(device).unwrap_or(Value::Null)),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Meter not registered"})),
        ),
    }
}

#[utoipa::path(post, path = "/api/meter/reset-window", responses((status = 200)))]
async fn reset_meter_window(State(state): State<AppState>) -> impl IntoResponse {
    let id = state.ctx.config.collector.meter_id.clone();
    match state.ctx.reset_power_window(&id).await {
        Ok(()) => (StatusCode::OK, Json(json!({"ok": true}))),
        Err(e) => error_response(&e),
    }
}

#[utoipa::path(post, path = "/api/meter/reset-history", responses((status = 200)))]
async fn reset_meter_history(State(state): State<AppState>) -> impl IntoResponse {
    let id = state.ctx.config.collector.meter_id.clone();
    match state.ctx.reset_power_history(&id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"success": true, "message": "History data reset"})),
        ),
        Err(e) => error_response(&e),
    }
}

#[utoipa::path(get, path = "/api/mqtt/status", responses((status = 200)))]
async fn mqtt_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.ctx.mqtt_status())
}

#[utoipa::path(post, path = "/api/mqtt/update", request_body = MqttUpdate, responses(
    (status = 200, description = "Settings saved, reconnecting"),
    (status = 400, description = "Invalid broker settings")
))]
async fn update_mqtt(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let update: MqttUpdate = match serde_json::from_value(body) {
        Ok(u) => u,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("Invalid MQTT settings: {}", e)})),
            );
        }
    };
    match state.ctx.update_mqtt(update).await {
        Ok(status) => (
            StatusCode::OK,
            Json(json!({
                "status": "success",
                "message": "MQTT configuration updated",
                "mqtt": status,
            })),
        ),
        Err(e) => error_response(&e),
    }
}

#[utoipa::path(get, path = "/api/config", responses((status = 200)))]
async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    let mut config = state.ctx.config.clone();
    config.mqtt = state.ctx.mqtt.config();
    config.mqtt.password = None;
    Json(serde_json::to_value(&config).unwrap_or(json!({"error": "serialization"})))
}

#[utoipa::path(get, path = "/api/config/schema", responses((status = 200)))]
async fn get_config_schema() -> impl IntoResponse {
    let schema = schemars::schema_for!(crate::config::Config);
    Json(serde_json::to_value(&schema).unwrap_or(json!({"error": "schema"})))
}

#[utoipa::path(get, path = "/api/events", responses(
    (status = 200, description = "One `cycle` event per collection cycle")
))]
async fn events(State(state): State<AppState>) -> impl IntoResponse {
    let rx = state.ctx.subscribe_updates();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(payload) => Some(Ok::<Event, std::convert::Infallible>(
            Event::default().event("cycle").data(payload),
        )),
        Err(_) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health, version, prices, weather, current_weather,
        list_devices, upsert_device, get_device, delete_device,
        set_device_state, stop_device,
        get_history, post_history, get_meter, reset_meter_window, reset_meter_history,
        mqtt_status, update_mqtt, get_config, get_config_schema, events,
    ),
    components(schemas(StateBody, MqttUpdate)),
    tags((name = "heatwatch", description = "Heatwatch API"))
)]
pub struct ApiDoc;

pub fn build_router(state: AppState) -> Router {
    let openapi = ApiDoc::openapi();
    let static_dir = state.ctx.config.web.static_dir.clone();

    let mut router = Router::new()
        .route("/api/health", get(health))
        .route("/api/version", get(version))
        .route("/api/prices", get(prices))
        .route("/api/weather", get(weather))
        .route("/api/current-weather", get(current_weather))
        .route("/api/devices", get(list_devices).post(upsert_device))
        .route("/api/devices/{id}", get(get_device).delete(delete_device))
        .route("/api/devices/{id}/state", post(set_device_state))
        .route("/api/devices/{id}/stop", post(stop_device))
        .route("/api/history", get(get_history).post(post_history))
        .route("/api/meter", get(get_meter))
        .route("/api/meter/reset-window", post(reset_meter_window))
        .route("/api/meter/reset-history", post(reset_meter_history))
        .route("/api/mqtt/status", get(mqtt_status))
        .route("/api/mqtt/update", post(update_mqtt))
        .route("/api/config", get(get_config))
        .route("/api/config/schema", get(get_config_schema))
        .route("/api/events", get(events));

    if let Some(dir) = static_dir {
        router = router
            .route("/", get(|| async { Redirect::to("/ui/index.html") }))
            .nest_service(
                "/ui",
                get_service(ServeDir::new(dir).append_index_html_on_directories(true))
                    .handle_error(|_| async { StatusCode::INTERNAL_SERVER_ERROR }),
            );
    }

    router
        .merge(SwaggerUi::new("/docs").url("/openapi.json", openapi))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until `shutdown` resolves
pub async fn serve<F>(ctx: Arc<AppContext>, host: &str, port: u16, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = build_router(AppState { ctx });
    let logger = crate::logging::get_logger("web");

    let addr = match host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port),
        Err(_) => {
            logger.warn(&format!(
                "Invalid host '{}'; falling back to 127.0.0.1",
                host
            ));
            ([127, 0, 0, 1], port).into()
        }
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    logger.info(&format!(
        "Web server listening at http://{}:{} (API /api, docs /docs)",
        local_addr.ip(),
        local_addr.port()
    ));

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
#[path = "web_tests.rs"]
mod tests;
