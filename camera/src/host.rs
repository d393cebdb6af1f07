use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    runtime::Handle,
    sync::{oneshot, Mutex},
    task::JoinHandle,
};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};

use picpusher_common::{
    portal::{
        basic_auth_matches, ROUTE_AUTH_CHECK, ROUTE_CAPTURE, ROUTE_CONFIG, ROUTE_PREVIEW,
        ROUTE_RESET, ROUTE_STATUS,
    },
    state::STATE_RECORD_LEN,
    upload::{check_status, upload_headers, JPEG_CONTENT_TYPE},
    ActionResponse, Board, CaptureArbiter, CaptureError, ConfigPortal, ConfigUpdate,
    DeviceConfig, DeviceStatus, FrameSource, ModeController, PersistentStore, PortalError,
    PortalSession, PowerController, PowerDown, RestartRequest, RetentionMemory, SensorError,
    SleepPlatform, UploadError, WakeCause, CAMERA_LOCK_TIMEOUT,
};

use crate::clock::{self, DeviceZone};

const ACCESS_POINT_SSID: &str = "PicPusher-Setup";
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);
const SERVER_STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct AppState {
    config: Arc<Mutex<DeviceConfig>>,
    store: AppStore,
    session: Arc<PortalSession>,
    camera: Arc<CaptureArbiter<SimulatedCamera>>,
    uploader: Uploader,
    lock_timeout: Duration,
}

#[derive(Clone)]
struct AppStore {
    config_path: Arc<PathBuf>,
    rtc_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Retention memory backed by a small file so counters survive simulated
/// deep sleep as well as real process restarts.
struct FileRetention {
    path: PathBuf,
}

/// Camera stand-in. Serves a sample JPEG when one is configured, otherwise a
/// minimal synthetic JPEG per frame.
struct SimulatedCamera {
    sample: Option<Vec<u8>>,
    frames: u32,
}

#[derive(Clone)]
struct Uploader {
    client: reqwest::Client,
    device_id: Arc<String>,
}

struct HostBoard {
    handle: Handle,
    config: DeviceConfig,
    camera: Arc<CaptureArbiter<SimulatedCamera>>,
    uploader: Uploader,
    offline: bool,
}

struct RunningServer {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct HostPortal {
    handle: Handle,
    state: AppState,
    addr: SocketAddr,
    server: Option<RunningServer>,
}

struct HostSleep;

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let port = std::env::var("PICPUSHER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let offline = std::env::var("PICPUSHER_OFFLINE")
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
        .unwrap_or(false);

    let mut cause = match std::env::var("PICPUSHER_WAKE_CAUSE") {
        Ok(value) => value
            .parse::<WakeCause>()
            .map_err(anyhow::Error::msg)
            .context("invalid PICPUSHER_WAKE_CAUSE")?,
        Err(_) => WakeCause::Undefined,
    };

    let camera = Arc::new(CaptureArbiter::new(SimulatedCamera::from_env()));
    let device_id =
        std::env::var("PICPUSHER_DEVICE_ID").unwrap_or_else(|_| "picpusher-host".to_string());
    let uploader = Uploader::new(device_id)?;

    loop {
        let mut config = store.load_config().await.unwrap_or_else(|err| {
            warn!("failed to load config from store: {err:#}");
            DeviceConfig::default()
        });
        ensure_config_defaults(&mut config);
        config.sanitize();
        if let Err(err) = config.validate() {
            warn!("configuration incomplete: {err}");
        }

        let state = AppState {
            config: Arc::new(Mutex::new(config.clone())),
            store: store.clone(),
            session: Arc::new(PortalSession::new(config.web_timeout())),
            camera: camera.clone(),
            uploader: uploader.clone(),
            lock_timeout: CAMERA_LOCK_TIMEOUT,
        };
        let board = HostBoard {
            handle: Handle::current(),
            config: config.clone(),
            camera: camera.clone(),
            uploader: uploader.clone(),
            offline,
        };
        let portal = HostPortal::new(Handle::current(), state, addr);
        let retention = store.retention();

        let down = tokio::task::spawn_blocking(move || {
            let mut controller = ModeController::new(
                board,
                portal,
                PersistentStore::new(retention),
                PowerController::new(HostSleep),
                config.schedule.clone(),
                config.controller_config(),
            );
            controller.run(cause)
        })
        .await
        .context("controller task failed")?;

        cause = match down {
            PowerDown::DeepSleep { seconds } => {
                info!("timer wake after {seconds}s");
                WakeCause::Timer
            }
            PowerDown::Restart(reason) => {
                info!("rebooting ({})", reason.as_str());
                WakeCause::Undefined
            }
        };
    }
}

fn ensure_config_defaults(config: &mut DeviceConfig) {
    let defaults = [
        ("WIFI_SSID", &mut config.wifi_ssid),
        ("WIFI_PASS", &mut config.wifi_password),
        ("SERVER_URL", &mut config.server_url),
        ("AUTH_TOKEN", &mut config.auth_token),
    ];
    for (name, field) in defaults {
        if field.is_empty() {
            if let Ok(value) = std::env::var(name) {
                *field = value;
            }
        }
    }
}

fn router(state: AppState) -> Router {
    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    Router::new()
        .route(
            ROUTE_CONFIG,
            get(handle_get_config).put(handle_put_config),
        )
        .route(ROUTE_STATUS, get(handle_get_status))
        .route(ROUTE_CAPTURE, post(handle_capture))
        .route(ROUTE_PREVIEW, get(handle_preview))
        .route(ROUTE_RESET, post(handle_reset))
        .route(ROUTE_AUTH_CHECK, get(handle_auth_check))
        .fallback_service(ServeDir::new(web_root))
        .layer(middleware::from_fn_with_state(state.clone(), track_activity))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn track_activity(State(state): State<AppState>, request: Request, next: Next) -> Response {
    state.session.touch();
    next.run(request).await
}

async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.config.lock().await;
    Json(config.view())
}

async fn handle_put_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<ConfigUpdate>,
) -> Response {
    if !authorized(&state, &headers).await {
        return unauthorized();
    }

    let mut candidate = state.config.lock().await.clone();
    candidate.apply_update(update);
    candidate.sanitize();
    if let Err(err) = candidate.validate() {
        return error_response(StatusCode::BAD_REQUEST, &err.to_string());
    }

    if let Err(err) = state.store.save_config(&candidate).await {
        warn!("failed to persist config update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist configuration",
        );
    }

    *state.config.lock().await = candidate;
    state
        .session
        .request_restart(RestartRequest::ConfigurationChanged);
    Json(ActionResponse::ok("Configuration saved, restarting")).into_response()
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.config.lock().await;
    let now = clock::local_time(&config, Utc::now());
    let next_capture = now
        .and_then(|now| config.schedule.next_capture_time(now).ok())
        .map(|at| at.to_rfc3339());

    Json(DeviceStatus {
        device_id: state.uploader.device_id().to_string(),
        uptime_sec: state.session.uptime().as_secs(),
        remaining_sec: state.session.remaining().as_secs(),
        camera_ready: state.session.camera_ready(),
        camera_busy: state.camera.is_busy(),
        ap_mode: state.session.ap_mode(),
        time_synced: now.is_some(),
        local_time: now.map(|now| now.to_rfc3339()),
        next_capture,
        schedule_entries: config.schedule.len(),
    })
}

async fn handle_capture(State(state): State<AppState>) -> Response {
    if !state.session.camera_ready() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Camera not ready");
    }

    let image = match grab_frame(&state, true).await {
        Ok(image) => image,
        Err(response) => return response,
    };

    let config = state.config.lock().await.clone();
    match state.uploader.upload(&config, image).await {
        Ok(()) => Json(ActionResponse::ok("Image captured and uploaded")).into_response(),
        Err(err) => {
            warn!("manual upload failed: {err}");
            (
                StatusCode::BAD_GATEWAY,
                Json(ActionResponse::failed(err.to_string())),
            )
                .into_response()
        }
    }
}

async fn handle_preview(State(state): State<AppState>) -> Response {
    if !state.session.camera_ready() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Camera not ready");
    }

    match grab_frame(&state, false).await {
        Ok(image) => (
            [
                (header::CONTENT_TYPE, JPEG_CONTENT_TYPE),
                (header::CACHE_CONTROL, "no-store"),
            ],
            image,
        )
            .into_response(),
        Err(response) => response,
    }
}

async fn handle_reset(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers).await {
        return unauthorized();
    }

    let defaults = DeviceConfig::default();
    if let Err(err) = state.store.save_config(&defaults).await {
        warn!("failed to persist factory defaults: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to reset configuration",
        );
    }

    *state.config.lock().await = defaults;
    state.session.request_restart(RestartRequest::FactoryReset);
    Json(ActionResponse::ok("Factory reset, restarting")).into_response()
}

async fn handle_auth_check(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if authorized(&state, &headers).await {
        Json(ActionResponse::ok("Authorized")).into_response()
    } else {
        unauthorized()
    }
}

/// Runs a blocking camera capture off the async workers. Errors come back as
/// ready-made responses.
async fn grab_frame(state: &AppState, warm_up: bool) -> Result<Vec<u8>, Response> {
    let camera = state.camera.clone();
    let timeout = state.lock_timeout;

    let result = tokio::task::spawn_blocking(move || {
        let captured = if warm_up {
            camera.capture_with_warmup(timeout)
        } else {
            camera.capture_preview(timeout)
        }?;
        Ok::<_, CaptureError>(captured.bytes().to_vec())
    })
    .await;

    match result {
        Ok(Ok(image)) => Ok(image),
        Ok(Err(CaptureError::Busy(_))) => Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Camera busy",
        )),
        Ok(Err(err)) => {
            warn!("camera capture failed: {err}");
            Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Capture failed",
            ))
        }
        Err(err) => {
            warn!("camera task failed: {err}");
            Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Capture failed",
            ))
        }
    }
}

async fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let config = state.config.lock().await;
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    basic_auth_matches(header, &config.web_username, &config.web_password)
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"PicPusher\"")],
        Json(ErrorBody {
            error: "Authentication required".to_string(),
        }),
    )
        .into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("PICPUSHER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.picpusher"));
        Self::in_dir(&data_dir)
    }

    fn in_dir(data_dir: &Path) -> Self {
        Self {
            config_path: Arc::new(data_dir.join("config.json")),
            rtc_path: Arc::new(data_dir.join("rtc.bin")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_config(&self) -> anyhow::Result<DeviceConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.config_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<DeviceConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(DeviceConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_config(&self, config: &DeviceConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.config_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(config)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }

    fn retention(&self) -> FileRetention {
        FileRetention {
            path: self.rtc_path.as_ref().clone(),
        }
    }
}

impl FileRetention {
    fn try_write(&self, record: &[u8; STATE_RECORD_LEN]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, record)
    }
}

impl RetentionMemory for FileRetention {
    fn read(&self) -> [u8; STATE_RECORD_LEN] {
        let mut record = [0_u8; STATE_RECORD_LEN];
        match std::fs::read(&self.path) {
            Ok(raw) if raw.len() == STATE_RECORD_LEN => record.copy_from_slice(&raw),
            Ok(raw) => warn!(
                "ignoring {}-byte retention file {}",
                raw.len(),
                self.path.display()
            ),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(
                "failed to read retention file {}: {err}",
                self.path.display()
            ),
        }
        record
    }

    fn write(&mut self, record: &[u8; STATE_RECORD_LEN]) {
        if let Err(err) = self.try_write(record) {
            warn!(
                "failed to write retention file {}: {err}",
                self.path.display()
            );
        }
    }
}

impl SimulatedCamera {
    fn from_env() -> Self {
        let sample = std::env::var("PICPUSHER_SAMPLE_IMAGE")
            .ok()
            .and_then(|path| match std::fs::read(&path) {
                Ok(bytes) => {
                    info!("serving sample image {path} ({} bytes)", bytes.len());
                    Some(bytes)
                }
                Err(err) => {
                    warn!("failed to read sample image {path}: {err}");
                    None
                }
            });
        Self { sample, frames: 0 }
    }

    /// SOI, one COM segment carrying the frame number, EOI.
    fn synthetic_frame(sequence: u32) -> Vec<u8> {
        let comment = format!("picpusher frame {sequence}");
        let segment_len = (comment.len() + 2) as u16;

        let mut frame = vec![0xFF, 0xD8, 0xFF, 0xFE];
        frame.extend_from_slice(&segment_len.to_be_bytes());
        frame.extend_from_slice(comment.as_bytes());
        frame.extend_from_slice(&[0xFF, 0xD9]);
        frame
    }
}

impl FrameSource for SimulatedCamera {
    type Frame = Vec<u8>;

    fn grab(&mut self) -> Result<Vec<u8>, SensorError> {
        self.frames = self.frames.wrapping_add(1);
        match &self.sample {
            Some(sample) if sample.is_empty() => Err(SensorError::NoFrame),
            Some(sample) => Ok(sample.clone()),
            None => Ok(Self::synthetic_frame(self.frames)),
        }
    }
}

impl Uploader {
    fn new(device_id: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            device_id: Arc::new(device_id),
        })
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn upload(&self, config: &DeviceConfig, image: Vec<u8>) -> Result<(), UploadError> {
        if !config.has_upload_target() {
            return Err(UploadError::NotConfigured);
        }

        let size = image.len();
        let mut request = self.client.post(&config.server_url).body(image);
        for (name, value) in upload_headers(
            &config.auth_token,
            &self.device_id,
            Utc::now().timestamp(),
        ) {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|err| UploadError::Network(err.to_string()))?;
        let status = response.status().as_u16();
        check_status(status)?;
        info!("uploaded {size} bytes to {} (HTTP {status})", config.server_url);
        Ok(())
    }
}

impl Board for HostBoard {
    type Zone = DeviceZone;

    fn now_local(&self) -> Option<DateTime<DeviceZone>> {
        clock::local_time(&self.config, Utc::now())
    }

    fn connect_station(&mut self) -> bool {
        if self.offline {
            warn!("network simulated offline");
            return false;
        }
        if !self.config.has_station_credentials() {
            warn!("wifi credentials missing");
            return false;
        }
        info!("station connected to `{}`", self.config.wifi_ssid);
        true
    }

    fn start_access_point(&mut self) -> bool {
        info!("access point `{ACCESS_POINT_SSID}` started");
        true
    }

    fn sync_time(&mut self) -> Option<i64> {
        let now = Utc::now();
        clock::clock_is_set(now).then(|| now.timestamp())
    }

    fn camera_ready(&self) -> bool {
        true
    }

    fn capture_and_upload(&mut self) -> Result<(), UploadError> {
        let image = {
            let captured = self.camera.capture_with_warmup(CAMERA_LOCK_TIMEOUT)?;
            captured.bytes().to_vec()
        };
        info!("captured {} bytes", image.len());
        self.handle
            .block_on(self.uploader.upload(&self.config, image))
    }

    fn pause(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

impl HostPortal {
    fn new(handle: Handle, state: AppState, addr: SocketAddr) -> Self {
        Self {
            handle,
            state,
            addr,
            server: None,
        }
    }
}

impl ConfigPortal for HostPortal {
    fn start(&mut self) -> Result<(), PortalError> {
        if self.server.is_some() {
            return Ok(());
        }

        let listener = self
            .handle
            .block_on(TcpListener::bind(self.addr))
            .map_err(|err| PortalError(format!("bind {}: {err}", self.addr)))?;
        let local = listener
            .local_addr()
            .map_err(|err| PortalError(err.to_string()))?;

        let (shutdown, signal) = oneshot::channel::<()>();
        let app = router(self.state.clone());
        let task = self.handle.spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = signal.await;
            });
            if let Err(err) = serve.await {
                warn!("configuration server error: {err}");
            }
        });

        info!("configuration server listening on http://{local}");
        self.server = Some(RunningServer { shutdown, task });
        Ok(())
    }

    fn stop(&mut self) {
        let Some(server) = self.server.take() else {
            return;
        };
        let _ = server.shutdown.send(());
        let abort = server.task.abort_handle();
        let finished = self
            .handle
            .block_on(async { tokio::time::timeout(SERVER_STOP_GRACE, server.task).await });
        if finished.is_err() {
            warn!("configuration server did not drain in time; aborting");
            abort.abort();
        }
        info!("configuration server stopped");
    }

    fn is_running(&self) -> bool {
        self.server.is_some()
    }

    fn is_inactivity_timeout_expired(&self) -> bool {
        self.state.session.is_expired()
    }

    fn reset_inactivity_timer(&mut self) {
        self.state.session.touch();
    }

    fn mark_camera_ready(&mut self, ready: bool) {
        self.state.session.set_camera_ready(ready);
    }

    fn set_access_point_mode(&mut self, enabled: bool) {
        self.state.session.set_ap_mode(enabled);
    }

    fn take_restart_request(&mut self) -> Option<RestartRequest> {
        self.state.session.take_restart()
    }
}

impl SleepPlatform for HostSleep {
    fn shutdown_network(&mut self) {
        info!("network shut down");
    }

    fn deep_sleep(&mut self, duration: Duration) {
        info!("deep sleep for {}s", duration.as_secs());
        std::thread::sleep(duration);
    }

    fn restart(&mut self) {
        info!("restart requested");
    }
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use picpusher_common::{PersistentState, WarmupProfile};
    use pretty_assertions::assert_eq;

    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("picpusher-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn test_state(name: &str, config: DeviceConfig) -> AppState {
        let session = PortalSession::new(Duration::from_secs(60));
        session.set_camera_ready(true);
        AppState {
            config: Arc::new(Mutex::new(config)),
            store: AppStore::in_dir(&scratch_dir(name)),
            session: Arc::new(session),
            camera: Arc::new(
                CaptureArbiter::new(SimulatedCamera {
                    sample: None,
                    frames: 0,
                })
                .with_warmup(WarmupProfile::NONE),
            ),
            uploader: Uploader::new("test-device".to_string()).unwrap(),
            lock_timeout: Duration::from_millis(50),
        }
    }

    fn configured() -> DeviceConfig {
        DeviceConfig {
            wifi_ssid: "garden".to_string(),
            wifi_password: "hunter22".to_string(),
            server_url: "http://127.0.0.1:1/upload".to_string(),
            auth_token: "secret-token".to_string(),
            ..DeviceConfig::default()
        }
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn file_retention_survives_reopen() {
        let dir = scratch_dir("retention");
        let store = AppStore::in_dir(&dir);

        let mut first = PersistentStore::new(store.retention());
        let (mut state, _) = first.load();
        state.record_boot();
        state.record_capture_failure();
        first.save(&state);

        let mut second = PersistentStore::new(store.retention());
        let (restored, _) = second.load();
        assert_eq!(restored, state);
        assert!(restored.is_valid());
    }

    #[test]
    fn truncated_retention_file_reads_as_garbage() {
        let dir = scratch_dir("truncated");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("rtc.bin"), [0xBE, 0xBA, 0xFE, 0xCA]).unwrap();

        let retention = AppStore::in_dir(&dir).retention();
        let state = PersistentState::from_bytes(&retention.read());
        assert!(!state.is_valid());
    }

    #[test]
    fn synthetic_frames_are_jpeg_shaped() {
        let mut camera = SimulatedCamera {
            sample: None,
            frames: 0,
        };
        let frame = camera.grab().unwrap();

        assert_eq!(&frame[..2], &[0xFF, 0xD8]);
        assert_eq!(&frame[frame.len() - 2..], &[0xFF, 0xD9]);
        assert_eq!(
            u16::from_be_bytes([frame[4], frame[5]]) as usize,
            frame.len() - 6
        );
    }

    #[tokio::test]
    async fn store_round_trips_config() {
        let store = AppStore::in_dir(&scratch_dir("store"));
        assert_eq!(store.load_config().await.unwrap(), DeviceConfig::default());

        store.save_config(&configured()).await.unwrap();
        assert_eq!(store.load_config().await.unwrap(), configured());
    }

    #[tokio::test]
    async fn config_endpoint_masks_secrets() {
        let state = test_state("get-config", configured());
        let response = handle_get_config(State(state)).await.into_response();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["wifiSsid"], "garden");
        assert_eq!(body["wifiPassword"], "********");
        assert_eq!(body["authToken"], "********");
    }

    #[tokio::test]
    async fn invalid_update_is_rejected_without_restart() {
        let state = test_state("put-invalid", configured());
        let update = ConfigUpdate {
            schedule: Some(Default::default()),
            ..ConfigUpdate::default()
        };

        let response = handle_put_config(State(state.clone()), HeaderMap::new(), Json(update)).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.session.take_restart(), None);
    }

    #[tokio::test]
    async fn saved_update_requests_restart() {
        let state = test_state("put-valid", configured());
        let update = ConfigUpdate {
            sleep_margin_sec: Some(120),
            wifi_password: Some("********".to_string()),
            ..ConfigUpdate::default()
        };

        let response = handle_put_config(State(state.clone()), HeaderMap::new(), Json(update)).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            state.session.take_restart(),
            Some(RestartRequest::ConfigurationChanged)
        );
        let stored = state.store.load_config().await.unwrap();
        assert_eq!(stored.sleep_margin_sec, 120);
        assert_eq!(stored.wifi_password, "hunter22");
    }

    #[tokio::test]
    async fn preview_serves_jpeg() {
        let state = test_state("preview", configured());
        let response = handle_preview(State(state)).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            JPEG_CONTENT_TYPE
        );
    }

    #[tokio::test]
    async fn preview_reports_busy_camera() {
        let state = test_state("busy", configured());
        let camera = state.camera.clone();
        let _held = camera.acquire(Duration::from_secs(1)).unwrap();

        let response = handle_preview(State(state)).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["error"], "Camera busy");
    }

    #[tokio::test]
    async fn capture_refused_until_camera_ready() {
        let state = test_state("not-ready", configured());
        state.session.set_camera_ready(false);

        let response = handle_capture(State(state)).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn reset_restores_defaults_and_requests_factory_reset() {
        let state = test_state("reset", configured());
        let response = handle_reset(State(state.clone()), HeaderMap::new()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(*state.config.lock().await, DeviceConfig::default());
        assert_eq!(
            state.session.take_restart(),
            Some(RestartRequest::FactoryReset)
        );
    }

    #[tokio::test]
    async fn auth_check_requires_credentials_when_password_set() {
        let state = test_state(
            "auth",
            DeviceConfig {
                web_password: "letmein".to_string(),
                ..configured()
            },
        );

        let denied = handle_auth_check(State(state.clone()), HeaderMap::new()).await;
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let mut headers = HeaderMap::new();
        // admin:letmein
        headers.insert(
            header::AUTHORIZATION,
            "Basic YWRtaW46bGV0bWVpbg==".parse().unwrap(),
        );
        let allowed = handle_auth_check(State(state), headers).await;
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn upload_without_target_is_not_configured() {
        let uploader = Uploader::new("test-device".to_string()).unwrap();
        let result = uploader
            .upload(&DeviceConfig::default(), vec![0xFF, 0xD8])
            .await;
        assert!(matches!(result, Err(UploadError::NotConfigured)));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_network_error() {
        let uploader = Uploader::new("test-device".to_string()).unwrap();
        let result = uploader.upload(&configured(), vec![0xFF, 0xD8]).await;
        assert!(matches!(result, Err(UploadError::Network(_))));
    }

    #[test]
    fn portal_starts_and_stops() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let state = test_state("portal", configured());
        let mut portal = HostPortal::new(
            runtime.handle().clone(),
            state.clone(),
            SocketAddr::from(([127, 0, 0, 1], 0)),
        );

        portal.mark_camera_ready(false);
        portal.set_access_point_mode(true);
        portal.start().unwrap();
        assert!(portal.is_running());
        assert!(!portal.is_inactivity_timeout_expired());
        assert!(state.session.ap_mode());
        assert!(!state.session.camera_ready());

        state.session.request_restart(RestartRequest::ConfigurationChanged);
        assert_eq!(
            portal.take_restart_request(),
            Some(RestartRequest::ConfigurationChanged)
        );

        portal.stop();
        assert!(!portal.is_running());
    }
}
