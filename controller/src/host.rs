use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::Mutex, time::MissedTickBehavior};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use bedjet_common::{
    config::{is_mac_likely_valid, normalize_mac},
    protocol::FAN_STEP_MAX,
    types::MINUTES_PER_DAY,
    ControllerState, EntrySpec, Mode, RuntimeConfig, ScheduleEntryView, ScheduleError,
    ScheduleImport,
};

use crate::{
    appliance::{AdHocCommand, Appliance},
    clock::{monotonic_ms, ZonedClock},
    engine::{EngineError, ScheduleEngine},
    link::DeviceLink,
    radio::RadioTransport,
    store::{FileStore, Store},
};

const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_ENTRY_TEMP_F: f32 = 90.0;
const AD_HOC_MAX_RUN_HOURS: i64 = 11;

#[derive(Clone)]
struct AppState {
    runtime: Arc<Mutex<RuntimeConfig>>,
    clock: Arc<ZonedClock>,
    appliance: Arc<Appliance>,
    engine: Arc<ScheduleEngine>,
    store: Arc<dyn Store>,
}

impl AppState {
    fn link(&self) -> &Arc<DeviceLink> {
        self.appliance.link()
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct OkBody {
    ok: bool,
}

#[derive(Debug, Serialize)]
struct EntryResponse {
    ok: bool,
    entry: ScheduleEntryView,
}

#[derive(Debug, Serialize)]
struct ImportResponse {
    ok: bool,
    count: usize,
}

#[derive(Debug, Serialize)]
struct PauseResponse {
    ok: bool,
    paused: bool,
}

#[derive(Debug, Deserialize)]
struct TimezoneUpdate {
    timezone: String,
}

#[derive(Debug, Serialize)]
struct TimeStatus {
    #[serde(rename = "timeValid")]
    time_valid: bool,
    timezone: String,
    #[serde(rename = "nowEpoch")]
    now_epoch: i64,
    #[serde(rename = "localTime")]
    local_time: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeviceView {
    mac: String,
    name: String,
    #[serde(rename = "macValid")]
    mac_valid: bool,
}

#[derive(Debug, Deserialize)]
struct DeviceUpdate {
    mac: String,
    #[serde(default)]
    name: Option<String>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store: Arc<dyn Store> = Arc::new(FileStore::from_env());
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    if let Ok(mac) = std::env::var("BEDJET_MAC") {
        runtime.device.mac = mac;
    }
    runtime.sanitize();
    if !is_mac_likely_valid(&runtime.device.mac) {
        warn!(
            mac = %runtime.device.mac,
            "no valid appliance address configured; relying on scan matches"
        );
    }

    let mut schedule = store.load_schedule().await.unwrap_or_else(|err| {
        warn!("failed to load schedule from store: {err:#}");
        Default::default()
    });
    schedule.normalize();

    let clock = Arc::new(ZonedClock::new(runtime.tz()));
    let radio = open_radio().await?;
    let link = Arc::new(DeviceLink::new(
        radio,
        Default::default(),
        clock.clone(),
        runtime.link.clone(),
        &runtime.device.mac,
    ));
    let appliance = Arc::new(Appliance::new(link.clone(), runtime.automation.clone()));
    let engine = Arc::new(ScheduleEngine::new(
        appliance.clone(),
        clock.clone(),
        store.clone(),
        schedule,
        runtime.schedules_paused,
    ));

    let tick_period = Duration::from_millis(runtime.automation.tick_interval_ms);
    let liveness_period = Duration::from_millis(runtime.link.liveness_interval_ms);

    let app_state = AppState {
        runtime: Arc::new(Mutex::new(runtime)),
        clock,
        appliance,
        engine,
        store,
    };

    spawn_schedule_loop(app_state.engine.clone(), tick_period);
    spawn_liveness_loop(link.clone(), liveness_period);

    let app = Router::new()
        .route("/api/state", get(handle_get_state))
        .route("/api/ble/connect", post(handle_ble_connect))
        .route("/api/ble/disconnect", post(handle_ble_disconnect))
        .route("/api/cmd/button", post(handle_cmd_button))
        .route("/api/schedule/add", post(handle_schedule_add))
        .route("/api/schedule/update", post(handle_schedule_update))
        .route("/api/schedule/deleteOne", post(handle_schedule_delete))
        .route("/api/schedule/runOne", post(handle_schedule_run))
        .route("/api/schedule/export", get(handle_schedule_export))
        .route("/api/schedule/import", post(handle_schedule_import))
        .route("/api/schedule/pause", post(handle_schedule_pause))
        .route("/api/time", get(handle_get_time))
        .route("/api/timezone", axum::routing::put(handle_put_timezone))
        .route(
            "/api/device",
            get(handle_get_device).put(handle_put_device),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let port = std::env::var("BEDJET_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(DEFAULT_HTTP_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    link.disconnect().await;
    info!("controller stopped");
    Ok(())
}

#[cfg(feature = "ble")]
async fn open_radio() -> anyhow::Result<Arc<dyn RadioTransport>> {
    let radio = crate::ble::BtleRadio::first_adapter()
        .await
        .context("failed to open bluetooth adapter")?;
    Ok(Arc::new(radio))
}

#[cfg(not(feature = "ble"))]
async fn open_radio() -> anyhow::Result<Arc<dyn RadioTransport>> {
    warn!("built without the `ble` feature; appliance commands will fail");
    Ok(Arc::new(crate::radio::NoRadio))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn spawn_schedule_loop(engine: Arc<ScheduleEngine>, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let outcome = engine.tick().await;
            debug!(?outcome, "schedule tick");
        }
    });
}

fn spawn_liveness_loop(link: Arc<DeviceLink>, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            link.check_liveness().await;
        }
    });
}

async fn handle_get_state(State(state): State<AppState>) -> impl IntoResponse {
    let device_name = state.runtime.lock().await.device.name.clone();
    let timezone = state.clock.timezone();
    let now_local = state.clock.now_local();

    let now_ms = monotonic_ms();
    let snapshot = state.link().telemetry().snapshot();
    let status = snapshot.and_then(|snapshot| snapshot.status());
    let status_age_ms = snapshot.map(|snapshot| snapshot.age_ms(now_ms));
    let status_summary = match (status, status_age_ms) {
        (Some(status), Some(age_ms)) => status.summary(age_ms),
        _ => "No status yet".to_string(),
    };

    let link = state.link();
    Json(ControllerState {
        time: now_local.map(|now| now.format("%Y-%m-%d %H:%M:%S").to_string()),
        time_valid: now_local.is_some(),
        timezone: timezone.name().to_string(),
        device_name,
        device_mac: link.target(),
        link_state: link.state().as_str(),
        ble_connected: link.is_linked(),
        status,
        status_summary,
        status_age_ms,
        active_schedule_id: state.engine.active_entry_id(),
        schedules_paused: state.engine.is_paused(),
        schedule: state
            .engine
            .list_entries()
            .iter()
            .map(ScheduleEntryView::from)
            .collect(),
    })
}

async fn handle_ble_connect(State(state): State<AppState>) -> impl IntoResponse {
    match state.link().ensure_connected().await {
        Ok(()) => Json(OkBody { ok: true }).into_response(),
        Err(err) => {
            warn!("manual connect failed: {err}");
            error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string())
        }
    }
}

async fn handle_ble_disconnect(State(state): State<AppState>) -> impl IntoResponse {
    state.link().disconnect().await;
    Json(OkBody { ok: true })
}

async fn handle_cmd_button(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let command = match ad_hoc_from_params(&params) {
        Ok(command) => command,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
    };

    match state.appliance.send_ad_hoc(command).await {
        Ok(()) => Json(OkBody { ok: true }).into_response(),
        Err(err) => {
            warn!("ad-hoc command failed: {err}");
            error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string())
        }
    }
}

async fn handle_schedule_add(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let spec = match entry_spec_from_params(&params) {
        Ok(spec) => spec,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
    };

    match state.engine.add_entry(spec).await {
        Ok(entry) => entry_response(&entry),
        Err(err) => engine_error_response(&err),
    }
}

async fn handle_schedule_update(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let id = match id_from_params(&params) {
        Ok(id) => id,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
    };
    let spec = match entry_spec_from_params(&params) {
        Ok(spec) => spec,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
    };

    match state.engine.update_entry(id, spec).await {
        Ok(entry) => entry_response(&entry),
        Err(err) => engine_error_response(&err),
    }
}

async fn handle_schedule_delete(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let id = match id_from_params(&params) {
        Ok(id) => id,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
    };

    match state.engine.delete_entry(id).await {
        Ok(_) => Json(OkBody { ok: true }).into_response(),
        Err(err) => engine_error_response(&err),
    }
}

async fn handle_schedule_run(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let id = match id_from_params(&params) {
        Ok(id) => id,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
    };

    match state.engine.run_entry_now(id).await {
        Ok(entry) => entry_response(&entry),
        Err(err) => engine_error_response(&err),
    }
}

async fn handle_schedule_export(State(state): State<AppState>) -> impl IntoResponse {
    let device = state.runtime.lock().await.device.clone();
    let exported = state
        .clock
        .now_local()
        .map(|now| now.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default();

    Json(
        state
            .engine
            .export_schedule(exported, &device.name, &device.mac),
    )
}

async fn handle_schedule_import(State(state): State<AppState>, body: String) -> impl IntoResponse {
    if body.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "empty body");
    }
    let import = match serde_json::from_str::<ScheduleImport>(&body) {
        Ok(import) => import,
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, &format!("invalid import: {err}"))
        }
    };

    match state.engine.import_schedule(import).await {
        Ok(count) => Json(ImportResponse { ok: true, count }).into_response(),
        Err(err) => engine_error_response(&err),
    }
}

async fn handle_schedule_pause(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let paused = match params.get("paused") {
        Some(value) => match parse_flag(value) {
            Some(paused) => paused,
            None => return error_response(StatusCode::BAD_REQUEST, "Invalid paused"),
        },
        None => !state.engine.is_paused(),
    };

    match state.engine.set_paused(paused).await {
        Ok(()) => Json(PauseResponse { ok: true, paused }).into_response(),
        Err(err) => engine_error_response(&err),
    }
}

async fn handle_get_time(State(state): State<AppState>) -> impl IntoResponse {
    let now_local = state.clock.now_local();
    Json(TimeStatus {
        time_valid: now_local.is_some(),
        timezone: state.clock.timezone().name().to_string(),
        now_epoch: Utc::now().timestamp(),
        local_time: now_local.map(|now| now.to_rfc3339()),
    })
}

async fn handle_put_timezone(
    State(state): State<AppState>,
    Json(update): Json<TimezoneUpdate>,
) -> impl IntoResponse {
    let timezone = update.timezone.trim().to_string();
    if !state.clock.set_timezone(&timezone) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid timezone value");
    }

    {
        let mut runtime = state.runtime.lock().await;
        runtime.timezone = timezone;
    }

    if let Err(err) = persist_runtime(&state).await {
        warn!("failed to persist timezone update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist runtime settings",
        );
    }

    handle_get_time(State(state)).await.into_response()
}

async fn handle_get_device(State(state): State<AppState>) -> impl IntoResponse {
    let device = state.runtime.lock().await.device.clone();
    Json(DeviceView {
        mac_valid: is_mac_likely_valid(&device.mac),
        mac: device.mac,
        name: device.name,
    })
}

async fn handle_put_device(
    State(state): State<AppState>,
    Json(update): Json<DeviceUpdate>,
) -> impl IntoResponse {
    let mac = normalize_mac(&update.mac);
    if !is_mac_likely_valid(&mac) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid MAC address");
    }

    let changed = {
        let mut runtime = state.runtime.lock().await;
        let changed = runtime.device.mac != mac;
        runtime.device.mac = mac.clone();
        if let Some(name) = update.name {
            runtime.device.name = name;
        }
        runtime.device.sanitize();
        changed
    };

    if let Err(err) = persist_runtime(&state).await {
        warn!("failed to persist device update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist runtime settings",
        );
    }

    if changed {
        info!(%mac, "appliance address changed; dropping current link");
        state.link().set_target(&mac);
        state.link().disconnect().await;
    }

    handle_get_device(State(state)).await.into_response()
}

/// Writes the host-owned runtime fields over the stored document, keeping fields other
/// components persist (such as the pause flag).
async fn persist_runtime(state: &AppState) -> anyhow::Result<()> {
    let (device, timezone) = {
        let runtime = state.runtime.lock().await;
        (runtime.device.clone(), runtime.timezone.clone())
    };

    state
        .store
        .update_runtime_config(Box::new(move |stored: &mut RuntimeConfig| {
            stored.device = device;
            stored.timezone = timezone;
        }))
        .await?;
    Ok(())
}

fn entry_response(entry: &bedjet_common::ScheduleEntry) -> axum::response::Response {
    Json(EntryResponse {
        ok: true,
        entry: ScheduleEntryView::from(entry),
    })
    .into_response()
}

fn engine_error_response(err: &EngineError) -> axum::response::Response {
    let status = match err {
        EngineError::Schedule(ScheduleError::NotFound(_)) => StatusCode::NOT_FOUND,
        EngineError::Schedule(_) => StatusCode::BAD_REQUEST,
        EngineError::Link(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Persist(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!("request failed: {err}");
    }
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_mode(params: &HashMap<String, String>, key: &str) -> Result<Mode, String> {
    match params.get(key) {
        Some(value) => value.parse::<Mode>().map_err(|err| err.to_string()),
        None => Err(format!("Missing '{key}' parameter")),
    }
}

fn parse_int(params: &HashMap<String, String>, key: &str) -> Result<Option<i64>, String> {
    match params.get(key).map(|value| value.trim()) {
        None | Some("") => Ok(None),
        Some(value) => value
            .parse::<i64>()
            .map(Some)
            .map_err(|_| format!("Invalid {key}")),
    }
}

fn parse_temp(params: &HashMap<String, String>, key: &str) -> Result<Option<f32>, String> {
    match params.get(key).map(|value| value.trim()) {
        None | Some("") => Ok(None),
        Some(value) => match value.parse::<f32>() {
            Ok(temp) if temp.is_finite() => Ok(Some(temp)),
            _ => Err("Invalid temperature value".to_string()),
        },
    }
}

fn parse_minute(params: &HashMap<String, String>, key: &str) -> Result<u16, String> {
    match parse_int(params, key)? {
        Some(minute) if (0..i64::from(MINUTES_PER_DAY)).contains(&minute) => Ok(minute as u16),
        _ => Err(format!("Invalid {key}")),
    }
}

fn clamp_fan(fan: Option<i64>) -> Option<u8> {
    fan.map(|fan| fan.clamp(0, i64::from(FAN_STEP_MAX)) as u8)
}

fn id_from_params(params: &HashMap<String, String>) -> Result<u16, String> {
    match parse_int(params, "id")? {
        Some(id) if (1..=i64::from(u16::MAX)).contains(&id) => Ok(id as u16),
        Some(_) => Err("Invalid id".to_string()),
        None => Err("Missing id".to_string()),
    }
}

fn entry_spec_from_params(params: &HashMap<String, String>) -> Result<EntrySpec, String> {
    let start_minute = parse_minute(params, "startMin")?;
    let stop_minute = parse_minute(params, "stopMin")?;
    if start_minute == stop_minute {
        return Err(ScheduleError::ZeroLengthWindow.to_string());
    }

    let mode = match params.get("mode") {
        Some(_) => parse_mode(params, "mode")?,
        None => Mode::Off,
    };
    let enabled = match params.get("enabled") {
        Some(value) => parse_flag(value).ok_or_else(|| "Invalid enabled".to_string())?,
        None => true,
    };

    Ok(EntrySpec {
        mode,
        fan_step: clamp_fan(parse_int(params, "fan")?).unwrap_or(0),
        target_temp_f: parse_temp(params, "temp")?.unwrap_or(DEFAULT_ENTRY_TEMP_F),
        start_minute,
        stop_minute,
        enabled,
    })
}

fn ad_hoc_from_params(params: &HashMap<String, String>) -> Result<AdHocCommand, String> {
    let mode = parse_mode(params, "name")?;
    let run_hours = parse_int(params, "runH")?;
    let run_minutes = parse_int(params, "runM")?;

    let runtime_minutes = if run_hours.is_some() || run_minutes.is_some() {
        let hours = run_hours.unwrap_or(0).clamp(0, AD_HOC_MAX_RUN_HOURS);
        let minutes = run_minutes.unwrap_or(0).clamp(0, 59);
        let total = (hours * 60 + minutes) as u16;
        (total > 0).then_some(total)
    } else {
        None
    };

    Ok(AdHocCommand {
        mode,
        fan_step: clamp_fan(parse_int(params, "fan")?),
        temp_f: parse_temp(params, "temp")?,
        runtime_minutes,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_schedule_form() {
        let spec = entry_spec_from_params(&params(&[
            ("mode", "ext-heat"),
            ("fan", "25"),
            ("temp", "88.5"),
            ("startMin", "1380"),
            ("stopMin", "60"),
            ("enabled", "0"),
        ]))
        .unwrap();

        assert_eq!(
            spec,
            EntrySpec {
                mode: Mode::ExtHeat,
                fan_step: 19,
                target_temp_f: 88.5,
                start_minute: 1380,
                stop_minute: 60,
                enabled: false,
            }
        );
    }

    #[test]
    fn rejects_bad_schedule_form() {
        let err = entry_spec_from_params(&params(&[("startMin", "1440"), ("stopMin", "60")]))
            .unwrap_err();
        assert_eq!(err, "Invalid startMin");

        let err = entry_spec_from_params(&params(&[("startMin", "60")])).unwrap_err();
        assert_eq!(err, "Invalid stopMin");

        let err = entry_spec_from_params(&params(&[("startMin", "60"), ("stopMin", "60")]))
            .unwrap_err();
        assert_eq!(err, "Start and stop cannot be the same");

        let err = entry_spec_from_params(&params(&[
            ("mode", "blast"),
            ("startMin", "0"),
            ("stopMin", "60"),
        ]))
        .unwrap_err();
        assert!(err.starts_with("unknown mode"));
    }

    #[test]
    fn parses_quick_control_button() {
        let command = ad_hoc_from_params(&params(&[
            ("name", "HEAT"),
            ("fan", "12"),
            ("temp", "92"),
            ("runH", "14"),
            ("runM", "5"),
        ]))
        .unwrap();

        assert_eq!(
            command,
            AdHocCommand {
                mode: Mode::Heat,
                fan_step: Some(12),
                temp_f: Some(92.0),
                runtime_minutes: Some(11 * 60 + 5),
            }
        );

        let zero_run =
            ad_hoc_from_params(&params(&[("name", "cool"), ("runH", "0"), ("runM", "0")]))
                .unwrap();
        assert_eq!(zero_run.runtime_minutes, None);

        assert_eq!(
            ad_hoc_from_params(&params(&[])).unwrap_err(),
            "Missing 'name' parameter"
        );
    }

    #[test]
    fn parses_flags_and_ids() {
        assert_eq!(parse_flag(" Yes "), Some(true));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("maybe"), None);

        assert_eq!(id_from_params(&params(&[("id", "7")])), Ok(7));
        assert_eq!(
            id_from_params(&params(&[])),
            Err("Missing id".to_string())
        );
        assert_eq!(
            id_from_params(&params(&[("id", "0")])),
            Err("Invalid id".to_string())
        );
    }
}
