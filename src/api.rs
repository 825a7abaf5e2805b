// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Control Plane: HTTP handlers and a WebSocket event broadcaster over the
//! State Store, Storage Index, Camera Manager and Auto-Record Controller.
//! Built as a single axum `Router` sharing one `AppState`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::auto_record::AutoRecordController;
use crate::bus::BusClient;
use crate::camera_manager::CameraManager;
use crate::clock::Clock;
use crate::config::CameraConfig;
use crate::device::LiveSettingsUpdate;
use crate::error::CoordinatorError;
use crate::events::EventBus;
use crate::recorder::StartOverrides;
use crate::state::StateStore;
use crate::storage::index::{FileListFilter, StorageIndex};
use crate::streamer::wrap_multipart_frame;

const WS_BROADCAST_CAPACITY: usize = 256;
const STREAM_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared state handed to every handler. Cheap to clone (every field is an
/// `Arc`); axum holds one instance behind `State`.
pub struct AppState {
    pub state_store: Arc<StateStore>,
    pub events: Arc<EventBus>,
    pub cameras: Arc<CameraManager>,
    pub auto_record: Arc<AutoRecordController>,
    pub index: Arc<StorageIndex>,
    pub clock: Arc<Clock>,
    pub bus_client: Arc<BusClient>,
    pub ws_tx: broadcast::Sender<String>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state_store: Arc<StateStore>,
        events: Arc<EventBus>,
        cameras: Arc<CameraManager>,
        auto_record: Arc<AutoRecordController>,
        index: Arc<StorageIndex>,
        clock: Arc<Clock>,
        bus_client: Arc<BusClient>,
    ) -> Self {
        let (ws_tx, _) = broadcast::channel(WS_BROADCAST_CAPACITY);
        Self {
            state_store,
            events,
            cameras,
            auto_record,
            index,
            clock,
            bus_client,
            ws_tx,
        }
    }
}

/// Subscribes a forwarder on the Event Bus that serializes every published
/// event and sends it to the WebSocket broadcast channel via the captured
/// runtime handle, never on the publisher's own context (§4.10/§5 of the
/// coordination design).
pub fn install_event_forwarder(state: &Arc<AppState>, handle: tokio::runtime::Handle) {
    for event_type in crate::events::EventType::ALL {
        let state = state.clone();
        let handle = handle.clone();
        state.events.subscribe(event_type, move |event| {
            let payload = json!({
                "type": "event",
                "event_type": event.event_type,
                "source": event.source,
                "data": event.data,
                "timestamp": event.timestamp,
            });
            let state = state.clone();
            handle.spawn(async move {
                let _ = state.ws_tx.send(payload.to_string());
            });
        });
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/system/status", get(handle_system_status))
        .route("/machines", get(handle_machines))
        .route("/mqtt/status", get(handle_mqtt_status))
        .route("/mqtt/events", get(handle_mqtt_events))
        .route("/cameras", get(handle_list_cameras))
        .route("/cameras/refresh-discovery", post(handle_refresh_discovery))
        .route("/cameras/{name}/status", get(handle_camera_status))
        .route("/cameras/{name}/start-recording", post(handle_start_recording))
        .route("/cameras/{name}/stop-recording", post(handle_stop_recording))
        .route("/cameras/{name}/stream", get(handle_stream))
        .route("/cameras/{name}/start-stream", post(handle_start_stream))
        .route("/cameras/{name}/stop-stream", post(handle_stop_stream))
        .route(
            "/cameras/{name}/config",
            get(handle_get_config).put(handle_put_config),
        )
        .route("/cameras/{name}/apply-config", post(handle_apply_config))
        .route("/cameras/{name}/live-settings", put(handle_live_settings))
        .route("/cameras/{name}/test-connection", post(handle_test_connection))
        .route("/cameras/{name}/reconnect", post(handle_reconnect))
        .route("/cameras/{name}/restart-grab", post(handle_restart_grab))
        .route("/cameras/{name}/reset-timestamp", post(handle_reset_timestamp))
        .route("/cameras/{name}/full-reset", post(handle_full_reset))
        .route("/cameras/{name}/reinitialize", post(handle_reinitialize))
        .route(
            "/cameras/{name}/auto-recording/enable",
            post(handle_auto_recording_enable),
        )
        .route(
            "/cameras/{name}/auto-recording/disable",
            post(handle_auto_recording_disable),
        )
        .route("/auto-recording/status", get(handle_auto_recording_status))
        .route("/recordings", get(handle_recordings))
        .route("/storage/stats", get(handle_storage_stats))
        .route("/storage/files", post(handle_storage_files))
        .route("/storage/cleanup", post(handle_storage_cleanup))
        .route("/storage/verify-integrity", post(handle_storage_verify_integrity))
        .route("/ws", get(handle_ws))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn start_server(state: Arc<AppState>, host: &str, port: u16) {
    let router = build_router(state);
    let addr = format!("{host}:{port}");
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(addr = %addr, error = %err, "failed to bind control plane listener");
            return;
        }
    };
    info!(addr = %addr, "control plane listening");
    if let Err(err) = axum::serve(listener, router).await {
        error!(error = %err, "control plane server exited");
    }
}

fn success(message: impl Into<String>, data: Option<Value>) -> Json<Value> {
    Json(json!({
        "success": true,
        "message": message.into(),
        "data": data,
    }))
}

fn error_response(err: &CoordinatorError) -> Response {
    let status = match err {
        CoordinatorError::CameraNotFound { .. } => StatusCode::NOT_FOUND,
        CoordinatorError::InvalidRequest(_)
        | CoordinatorError::InvalidRecorderState { .. }
        | CoordinatorError::RequiresRestart { .. }
        | CoordinatorError::ConfigValidation(_) => StatusCode::BAD_REQUEST,
        CoordinatorError::DeviceBusy { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = Json(json!({
        "error": err.to_string(),
        "details": Value::Null,
    }));
    (status, body).into_response()
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "status": "healthy", "timestamp": state.clock.now() }))
}

async fn handle_system_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let summary = state.state_store.system_summary(state.clock.uptime_seconds());
    Json(json!(summary))
}

async fn handle_machines(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.state_store.machines()))
}

async fn handle_mqtt_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.bus_client.stats()))
}

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

async fn handle_mqtt_events(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LimitParams>,
) -> Json<Value> {
    let limit = crate::events::clamp_limit(params.limit, 20, 50);
    let (events, total) = state.state_store.recent_bus_events(limit);
    Json(json!({ "events": events, "total": total }))
}

async fn handle_list_cameras(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.state_store.cameras()))
}

async fn handle_refresh_discovery(State(state): State<Arc<AppState>>) -> Response {
    match state.cameras.refresh_camera_discovery() {
        Ok(count) => success("discovery refreshed", Some(json!({ "devices_found": count }))).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn handle_camera_status(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    match state.state_store.camera(&name) {
        Some(info) => Json(json!(info)).into_response(),
        None => error_response(&CoordinatorError::CameraNotFound { name }),
    }
}

#[derive(Debug, Deserialize, Default)]
struct StartRecordingBody {
    filename: Option<String>,
    exposure_ms: Option<f64>,
    gain: Option<f64>,
    fps: Option<u32>,
}

async fn handle_start_recording(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Option<Json<StartRecordingBody>>,
) -> Response {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let overrides = StartOverrides {
        filename: body.filename,
        exposure_ms: body.exposure_ms,
        gain: body.gain,
        target_fps: body.fps,
    };
    match state.cameras.start_recording(&name, overrides).await {
        Ok(filename) => Json(json!({
            "success": true,
            "message": "recording started",
            "filename": filename,
        }))
        .into_response(),
        Err(err) => error_response(&err),
    }
}

async fn handle_stop_recording(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    let duration_seconds = state
        .state_store
        .camera(&name)
        .and_then(|c| c.recording_start_time)
        .map(|start| (state.clock.now() - start).num_milliseconds() as f64 / 1000.0);
    match state.cameras.stop_recording(&name).await {
        Ok(()) => Json(json!({
            "success": true,
            "message": "recording stopped",
            "duration_seconds": duration_seconds,
        }))
        .into_response(),
        Err(err) => error_response(&err),
    }
}

async fn handle_stream(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    let streamer = match state.cameras.streamer(&name) {
        Ok(streamer) => streamer,
        Err(err) => return error_response(&err),
    };
    if !streamer.is_running() {
        if let Err(err) = streamer.start() {
            return error_response(&err);
        }
    }

    let body_stream = async_stream::stream! {
        let mut last_seen = 0usize;
        loop {
            let streamer = streamer.clone();
            let frame = tokio::task::spawn_blocking(move || {
                streamer.wait_for_frame(last_seen, STREAM_WAIT_TIMEOUT)
            })
            .await
            .ok()
            .flatten();
            match frame {
                Some((seq, jpeg)) => {
                    last_seen = seq;
                    yield Ok::<_, std::io::Error>(bytes::Bytes::from(wrap_multipart_frame(&jpeg)));
                }
                None => {
                    if !streamer.is_running() {
                        break;
                    }
                }
            }
        }
    };

    Response::builder()
        .header(header::CONTENT_TYPE, "multipart/x-mixed-replace; boundary=frame")
        .body(axum::body::Body::from_stream(body_stream))
        .unwrap()
}

async fn handle_start_stream(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.cameras.start_stream(&name) {
        Ok(()) => success("stream started", None).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn handle_stop_stream(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.cameras.stop_stream(&name).await {
        Ok(()) => success("stream stopped", None).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn handle_get_config(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.cameras.camera_config(&name) {
        Some(config) => Json(json!(config)).into_response(),
        None => error_response(&CoordinatorError::CameraNotFound { name }),
    }
}

async fn handle_put_config(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(config): Json<CameraConfig>,
) -> Response {
    match state.cameras.update_config(&name, config) {
        Ok(()) => success("configuration staged; call apply-config to activate", None).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn handle_apply_config(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.cameras.apply_config(&name).await {
        Ok(()) => success("configuration applied", None).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn handle_live_settings(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(update): Json<LiveSettingsUpdate>,
) -> Response {
    match state.cameras.update_live_settings(&name, &update) {
        Ok(()) => success("live settings applied", None).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn recovery_op_handler(state: Arc<AppState>, name: String, op: &str) -> Response {
    match state.cameras.recovery_op(&name, op) {
        Ok(()) => success(format!("{op} succeeded"), None).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn handle_test_connection(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    recovery_op_handler(state, name, "test_connection").await
}

async fn handle_reconnect(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    recovery_op_handler(state, name, "reconnect").await
}

async fn handle_restart_grab(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    recovery_op_handler(state, name, "restart_grab").await
}

async fn handle_reset_timestamp(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    recovery_op_handler(state, name, "reset_timestamp").await
}

async fn handle_full_reset(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    recovery_op_handler(state, name, "full_reset").await
}

async fn handle_reinitialize(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    recovery_op_handler(state, name, "reinitialize").await
}

async fn handle_auto_recording_enable(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    let now = state.clock.now();
    state.state_store.set_auto_recording_enabled(&name, true, now);
    success("auto-recording enabled", None).into_response()
}

async fn handle_auto_recording_disable(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Response {
    let now = state.clock.now();
    state.state_store.set_auto_recording_enabled(&name, false, now);
    success("auto-recording disabled", None).into_response()
}

async fn handle_auto_recording_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.auto_record.status()))
}

async fn handle_recordings(State(state): State<Arc<AppState>>) -> Json<Value> {
    let files = state.index.list(&FileListFilter::default());
    Json(json!({ "files": files, "count": files.len() }))
}

async fn handle_storage_stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!(state.index.statistics()))
}

#[derive(Debug, Deserialize, Default)]
struct StorageFilesBody {
    camera_name: Option<String>,
    start_date: Option<chrono::DateTime<chrono::FixedOffset>>,
    end_date: Option<chrono::DateTime<chrono::FixedOffset>>,
    limit: Option<usize>,
}

async fn handle_storage_files(
    State(state): State<Arc<AppState>>,
    body: Option<Json<StorageFilesBody>>,
) -> Json<Value> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let filter = FileListFilter {
        camera_name: body.camera_name,
        start_date: body.start_date,
        end_date: body.end_date,
        limit: Some(crate::events::clamp_limit(body.limit, 100, 1000)),
    };
    let files = state.index.list(&filter);
    Json(json!({ "files": files, "count": files.len() }))
}

async fn handle_storage_cleanup(State(state): State<Arc<AppState>>) -> Response {
    let max_age_days = state.index.cleanup_older_than_days();
    match state.index.cleanup(max_age_days, state.clock.now()) {
        Ok(report) => Json(json!(report)).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn handle_storage_verify_integrity(State(state): State<Arc<AppState>>) -> Response {
    match state.index.verify_integrity() {
        Ok(report) => Json(json!(report)).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn handle_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| ws_connection(socket, state))
}

async fn ws_connection(socket: WebSocket, state: Arc<AppState>) {
    let mut rx = state.ws_tx.subscribe();
    let (mut sink, mut stream) = socket.split();

    let forward = tokio::spawn(async move {
        while let Ok(payload) = rx.recv().await {
            if sink.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        if matches!(message, Message::Close(_)) {
            break;
        }
    }
    forward.abort();
    warn!("websocket client disconnected");
}
