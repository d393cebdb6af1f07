use core::{convert::TryInto, ptr::NonNull};
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{delay::FreeRtos, peripherals::Peripherals};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::{EspSntp, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use esp_idf_sys::camera;
use log::{info, warn};
use serde::Serialize;

use picpusher_common::{
    portal::{
        basic_auth_matches, ROUTE_AUTH_CHECK, ROUTE_CAPTURE, ROUTE_CONFIG, ROUTE_PREVIEW,
        ROUTE_RESET, ROUTE_STATUS,
    },
    state::STATE_RECORD_LEN,
    upload::{check_status, device_id_from_mac, upload_headers, JPEG_CONTENT_TYPE},
    ActionResponse, Board, CaptureArbiter, CaptureError, ConfigPortal, ConfigUpdate,
    DeviceConfig, DeviceStatus, FrameSource, ModeController, PersistentStore, PortalError,
    PortalSession, PowerController, RestartRequest, RetentionMemory, SensorError,
    SleepPlatform, UploadError, WakeCause, CAMERA_LOCK_TIMEOUT,
};

use crate::clock::{self, DeviceZone};

const NVS_NAMESPACE: &str = "picpusher";
const NVS_CONFIG_KEY: &str = "config_json";
const NVS_BUFFER_LEN: usize = 4096;
const MAX_HTTP_BODY: usize = 4096;
const PROVISIONING_AP_SSID: &str = "PicPusher-Setup";
const PROVISIONING_AP_PASSWORD: &str = "PicPusherSetup";
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u32 = 3_000;
const SNTP_SYNC_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

// XIAO ESP32S3 Sense camera wiring.
const CAM_PIN_PWDN: i32 = -1;
const CAM_PIN_RESET: i32 = -1;
const CAM_PIN_XCLK: i32 = 10;
const CAM_PIN_SIOD: i32 = 40;
const CAM_PIN_SIOC: i32 = 39;
const CAM_PIN_D7: i32 = 48;
const CAM_PIN_D6: i32 = 11;
const CAM_PIN_D5: i32 = 12;
const CAM_PIN_D4: i32 = 14;
const CAM_PIN_D3: i32 = 16;
const CAM_PIN_D2: i32 = 18;
const CAM_PIN_D1: i32 = 17;
const CAM_PIN_D0: i32 = 15;
const CAM_PIN_VSYNC: i32 = 38;
const CAM_PIN_HREF: i32 = 47;
const CAM_PIN_PCLK: i32 = 13;
const CAM_XCLK_FREQ_HZ: i32 = 20_000_000;
const CAM_JPEG_QUALITY: i32 = 10;

const INDEX_HTML: &str = include_str!("../web/index.html");

/// Survives deep sleep; holds garbage after a power cycle until the sentinel
/// check resets it.
#[link_section = ".rtc.data"]
static mut RTC_RECORD: [u8; STATE_RECORD_LEN] = [0; STATE_RECORD_LEN];

struct RtcRetention;

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

/// esp32-camera driver. Frames go back to the driver when dropped.
struct EspCamera;

struct FrameBuffer(NonNull<camera::camera_fb_t>);

// The driver owns the buffer until esp_camera_fb_return; only one task holds
// a frame at a time because grabs go through the arbiter.
unsafe impl Send for FrameBuffer {}

struct EspBoard {
    wifi: BlockingWifi<EspWifi<'static>>,
    sntp: Option<EspSntp<'static>>,
    config: DeviceConfig,
    camera: Arc<CaptureArbiter<EspCamera>>,
    camera_ready: bool,
    device_id: String,
}

#[derive(Clone)]
struct PortalContext {
    config: Arc<Mutex<DeviceConfig>>,
    nvs_store: NvsStore,
    session: Arc<PortalSession>,
    camera: Arc<CaptureArbiter<EspCamera>>,
    device_id: Arc<String>,
}

struct EspPortal {
    context: PortalContext,
    server: Option<EspHttpServer<'static>>,
}

struct EspSleep;

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let cause = WakeCause::from_raw(unsafe { esp_idf_svc::sys::esp_sleep_get_wakeup_cause() });
    info!("wake cause: {cause:?}");

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut config = nvs_store.load_config().unwrap_or_else(|err| {
        warn!("failed to load config from NVS: {err:#}");
        DeviceConfig::default()
    });
    ensure_config_defaults(&mut config);
    config.sanitize();
    if let Err(err) = config.validate() {
        warn!("configuration incomplete: {err}");
    }

    info!(
        "NVS config loaded: ssid=`{}`, server=`{}`, {} capture times",
        config.wifi_ssid,
        config.server_url,
        config.schedule.len(),
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = BlockingWifi::wrap(
        EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?,
        sys_loop,
    )?;

    let camera_ready = match init_camera() {
        Ok(()) => {
            tune_sensor();
            info!("camera initialized");
            true
        }
        Err(err) => {
            warn!("camera init failed, captures disabled: {err:#}");
            false
        }
    };
    let camera = Arc::new(CaptureArbiter::new(EspCamera));
    let device_id = read_device_id();

    let board = EspBoard {
        wifi,
        sntp: None,
        config: config.clone(),
        camera: camera.clone(),
        camera_ready,
        device_id: device_id.clone(),
    };
    let portal = EspPortal {
        context: PortalContext {
            config: Arc::new(Mutex::new(config.clone())),
            nvs_store,
            session: Arc::new(PortalSession::new(config.web_timeout())),
            camera,
            device_id: Arc::new(device_id),
        },
        server: None,
    };

    let mut controller = ModeController::new(
        board,
        portal,
        PersistentStore::new(RtcRetention),
        PowerController::new(EspSleep),
        config.schedule.clone(),
        config.controller_config(),
    );
    let down = controller.run(cause);

    warn!("power down {down:?} returned control; restarting");
    unsafe { esp_idf_svc::sys::esp_restart() }
}

fn ensure_config_defaults(config: &mut DeviceConfig) {
    if config.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            config.wifi_ssid = ssid.to_string();
        }
    }

    if config.wifi_password.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            config.wifi_password = pass.to_string();
        }
    }

    if config.server_url.is_empty() {
        if let Some(url) = option_env!("SERVER_URL") {
            config.server_url = url.to_string();
        }
    }

    if config.auth_token.is_empty() {
        if let Some(token) = option_env!("AUTH_TOKEN") {
            config.auth_token = token.to_string();
        }
    }
}

fn read_device_id() -> String {
    let mut mac = [0_u8; 6];
    let rc = unsafe {
        esp_idf_svc::sys::esp_read_mac(
            mac.as_mut_ptr(),
            esp_idf_svc::sys::esp_mac_type_t_ESP_MAC_WIFI_STA,
        )
    };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to read station MAC: esp_err_t={rc}");
    }
    device_id_from_mac(mac)
}

fn init_camera() -> anyhow::Result<()> {
    let config = camera::camera_config_t {
        pin_pwdn: CAM_PIN_PWDN,
        pin_reset: CAM_PIN_RESET,
        pin_xclk: CAM_PIN_XCLK,
        __bindgen_anon_1: camera::camera_config_t__bindgen_ty_1 {
            pin_sccb_sda: CAM_PIN_SIOD,
        },
        __bindgen_anon_2: camera::camera_config_t__bindgen_ty_2 {
            pin_sccb_scl: CAM_PIN_SIOC,
        },
        pin_d7: CAM_PIN_D7,
        pin_d6: CAM_PIN_D6,
        pin_d5: CAM_PIN_D5,
        pin_d4: CAM_PIN_D4,
        pin_d3: CAM_PIN_D3,
        pin_d2: CAM_PIN_D2,
        pin_d1: CAM_PIN_D1,
        pin_d0: CAM_PIN_D0,
        pin_vsync: CAM_PIN_VSYNC,
        pin_href: CAM_PIN_HREF,
        pin_pclk: CAM_PIN_PCLK,
        xclk_freq_hz: CAM_XCLK_FREQ_HZ,
        ledc_timer: esp_idf_svc::sys::ledc_timer_t_LEDC_TIMER_0,
        ledc_channel: esp_idf_svc::sys::ledc_channel_t_LEDC_CHANNEL_0,
        pixel_format: camera::pixformat_t_PIXFORMAT_JPEG,
        frame_size: camera::framesize_t_FRAMESIZE_UXGA,
        jpeg_quality: CAM_JPEG_QUALITY,
        fb_count: 1,
        fb_location: camera::camera_fb_location_t_CAMERA_FB_IN_PSRAM,
        grab_mode: camera::camera_grab_mode_t_CAMERA_GRAB_LATEST,
        ..Default::default()
    };

    esp_idf_svc::sys::esp!(unsafe { camera::esp_camera_init(&config) })
        .context("esp_camera_init failed")?;
    Ok(())
}

fn tune_sensor() {
    let Some(sensor) = NonNull::new(unsafe { camera::esp_camera_sensor_get() }) else {
        warn!("camera sensor handle unavailable; keeping driver defaults");
        return;
    };

    let raw = sensor.as_ptr();
    let ops = unsafe { sensor.as_ref() };
    let settings = [
        (ops.set_whitebal, 1),
        (ops.set_awb_gain, 1),
        (ops.set_exposure_ctrl, 1),
        (ops.set_gain_ctrl, 1),
        (ops.set_wpc, 1),
        (ops.set_raw_gma, 1),
        (ops.set_lenc, 1),
        (ops.set_dcw, 1),
    ];
    for (setter, value) in settings {
        if let Some(setter) = setter {
            unsafe {
                setter(raw, value);
            }
        }
    }
}

fn upload_image(config: &DeviceConfig, device_id: &str, image: &[u8]) -> Result<(), UploadError> {
    if !config.has_upload_target() {
        return Err(UploadError::NotConfigured);
    }

    let http_conf = HttpClientConfiguration {
        timeout: Some(UPLOAD_TIMEOUT),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf).map_err(network_error)?);

    let headers = upload_headers(&config.auth_token, device_id, Utc::now().timestamp());
    let content_length = image.len().to_string();
    let mut request_headers: Vec<(&str, &str)> = headers
        .iter()
        .map(|(name, value)| (*name, value.as_str()))
        .collect();
    request_headers.push(("Content-Length", content_length.as_str()));

    let mut request = client
        .request(Method::Post, &config.server_url, &request_headers)
        .map_err(network_error)?;
    request.write_all(image).map_err(network_error)?;
    request.flush().map_err(network_error)?;
    let response = request.submit().map_err(network_error)?;

    let status = response.status();
    check_status(status)?;
    info!("uploaded {} bytes to {} (HTTP {status})", image.len(), config.server_url);
    Ok(())
}

fn network_error<E: core::fmt::Debug>(err: E) -> UploadError {
    UploadError::Network(format!("{err:?}"))
}

fn connect_wifi(
    wifi: &mut BlockingWifi<EspWifi<'static>>,
    config: &DeviceConfig,
) -> anyhow::Result<()> {
    let auth_method = if config.wifi_password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: config
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: config
            .wifi_password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", config.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                return Ok(());
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            FreeRtos::delay_ms(WIFI_RETRY_DELAY_MS);
        }
    }

    match last_err {
        Some(err) => Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}"
        )),
        None => Err(anyhow!("wifi connect not attempted")),
    }
}

fn start_provisioning_ap(wifi: &mut BlockingWifi<EspWifi<'static>>) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: PROVISIONING_AP_SSID
            .try_into()
            .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
        password: PROVISIONING_AP_PASSWORD
            .try_into()
            .map_err(|_| anyhow!("provisioning AP password too long"))?,
        auth_method: AuthMethod::WPA2Personal,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!(
        "provisioning AP started on `{}` (password: `{}`)",
        PROVISIONING_AP_SSID, PROVISIONING_AP_PASSWORD
    );
    Ok(())
}

fn create_http_server(context: PortalContext) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let context = context.clone();
        server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
            context.session.touch();
            req.into_ok_response()?.write_all(INDEX_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    {
        let context = context.clone();
        server.fn_handler(ROUTE_CONFIG, Method::Get, move |req| {
            context.session.touch();
            let view = context.config_snapshot().view();
            write_json(req, &view)
        })?;
    }

    {
        let context = context.clone();
        server.fn_handler(ROUTE_CONFIG, Method::Put, move |mut req| {
            context.session.touch();
            if !context.authorized(req.header("Authorization")) {
                return write_unauthorized(req);
            }

            let body = match read_request_body(&mut req) {
                Ok(body) => body,
                Err(err) => return write_error(req, 400, &err.to_string()),
            };
            let update = match serde_json::from_slice::<ConfigUpdate>(&body) {
                Ok(update) => update,
                Err(err) => return write_error(req, 400, &format!("Invalid JSON: {err}")),
            };

            let mut candidate = context.config_snapshot();
            candidate.apply_update(update);
            candidate.sanitize();
            if let Err(err) = candidate.validate() {
                return write_error(req, 400, &err.to_string());
            }

            if let Err(err) = context.nvs_store.save_config(&candidate) {
                warn!("failed to persist config update: {err:#}");
                return write_error(req, 500, "Failed to persist configuration");
            }

            *context.config.lock().unwrap_or_else(PoisonError::into_inner) = candidate;
            context
                .session
                .request_restart(RestartRequest::ConfigurationChanged);
            write_json(req, &ActionResponse::ok("Configuration saved, restarting"))
        })?;
    }

    {
        let context = context.clone();
        server.fn_handler(ROUTE_STATUS, Method::Get, move |req| {
            context.session.touch();
            let status = context.status();
            write_json(req, &status)
        })?;
    }

    {
        let context = context.clone();
        server.fn_handler(ROUTE_CAPTURE, Method::Post, move |req| {
            context.session.touch();
            if !context.session.camera_ready() {
                return write_error(req, 503, "Camera not ready");
            }

            let config = context.config_snapshot();
            let result = context
                .camera
                .capture_with_warmup(CAMERA_LOCK_TIMEOUT)
                .map_err(UploadError::from)
                .and_then(|captured| upload_image(&config, &context.device_id, captured.bytes()));

            match result {
                Ok(()) => write_json(req, &ActionResponse::ok("Image captured and uploaded")),
                Err(UploadError::Capture(CaptureError::Busy(_))) => {
                    write_error(req, 503, "Camera busy")
                }
                Err(UploadError::Capture(err)) => {
                    warn!("manual capture failed: {err}");
                    write_error(req, 500, "Capture failed")
                }
                Err(err) => {
                    warn!("manual upload failed: {err}");
                    write_json_status(req, 502, &ActionResponse::failed(err.to_string()))
                }
            }
        })?;
    }

    {
        let context = context.clone();
        server.fn_handler::<anyhow::Error, _>(ROUTE_PREVIEW, Method::Get, move |req| {
            context.session.touch();
            if !context.session.camera_ready() {
                return write_error(req, 503, "Camera not ready");
            }

            match context.camera.capture_preview(CAMERA_LOCK_TIMEOUT) {
                Ok(captured) => {
                    req.into_response(
                        200,
                        Some("OK"),
                        &[
                            ("Content-Type", JPEG_CONTENT_TYPE),
                            ("Cache-Control", "no-store"),
                        ],
                    )?
                    .write_all(captured.bytes())?;
                    Ok(())
                }
                Err(CaptureError::Busy(_)) => write_error(req, 503, "Camera busy"),
                Err(err) => {
                    warn!("preview capture failed: {err}");
                    write_error(req, 500, "Capture failed")
                }
            }
        })?;
    }

    {
        let context = context.clone();
        server.fn_handler(ROUTE_RESET, Method::Post, move |req| {
            context.session.touch();
            if !context.authorized(req.header("Authorization")) {
                return write_unauthorized(req);
            }

            if let Err(err) = context.nvs_store.clear_config() {
                warn!("failed to clear stored config: {err:#}");
                return write_error(req, 500, "Failed to reset configuration");
            }

            *context.config.lock().unwrap_or_else(PoisonError::into_inner) =
                DeviceConfig::default();
            context.session.request_restart(RestartRequest::FactoryReset);
            write_json(req, &ActionResponse::ok("Factory reset, restarting"))
        })?;
    }

    server.fn_handler(ROUTE_AUTH_CHECK, Method::Get, move |req| {
        context.session.touch();
        if context.authorized(req.header("Authorization")) {
            write_json(req, &ActionResponse::ok("Authorized"))
        } else {
            write_unauthorized(req)
        }
    })?;

    Ok(server)
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    write_json_status(req, 200, payload)
}

fn write_json_status<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    write_json_status(req, status_code, &ErrorBody { error: message })
}

fn write_unauthorized(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(&ErrorBody {
        error: "Authentication required",
    })?;
    req.into_response(
        401,
        None,
        &[
            ("Content-Type", "application/json; charset=utf-8"),
            ("WWW-Authenticate", "Basic realm=\"PicPusher\""),
        ],
    )?
    .write_all(&body)?;
    Ok(())
}

impl RetentionMemory for RtcRetention {
    fn read(&self) -> [u8; STATE_RECORD_LEN] {
        unsafe { core::ptr::addr_of!(RTC_RECORD).read() }
    }

    fn write(&mut self, record: &[u8; STATE_RECORD_LEN]) {
        unsafe { core::ptr::addr_of_mut!(RTC_RECORD).write(*record) }
    }
}

impl NvsStore {
    fn load_config(&self) -> anyhow::Result<DeviceConfig> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; NVS_BUFFER_LEN];

        match nvs.get_str(NVS_CONFIG_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<DeviceConfig>(value)?),
            None => Ok(DeviceConfig::default()),
        }
    }

    fn save_config(&self, config: &DeviceConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(config)?;
        nvs.set_str(NVS_CONFIG_KEY, &payload)?;
        Ok(())
    }

    fn clear_config(&self) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        nvs.remove(NVS_CONFIG_KEY)?;
        Ok(())
    }
}

impl AsRef<[u8]> for FrameBuffer {
    fn as_ref(&self) -> &[u8] {
        unsafe {
            let fb = self.0.as_ref();
            core::slice::from_raw_parts(fb.buf, fb.len)
        }
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        unsafe { camera::esp_camera_fb_return(self.0.as_ptr()) }
    }
}

impl FrameSource for EspCamera {
    type Frame = FrameBuffer;

    fn grab(&mut self) -> Result<FrameBuffer, SensorError> {
        let fb = unsafe { camera::esp_camera_fb_get() };
        let frame = NonNull::new(fb).map(FrameBuffer).ok_or(SensorError::NoFrame)?;
        if frame.as_ref().is_empty() {
            return Err(SensorError::NoFrame);
        }
        Ok(frame)
    }
}

impl Board for EspBoard {
    type Zone = DeviceZone;

    fn now_local(&self) -> Option<DateTime<DeviceZone>> {
        clock::local_time(&self.config, Utc::now())
    }

    fn connect_station(&mut self) -> bool {
        if !self.config.has_station_credentials() {
            warn!("wifi credentials missing");
            return false;
        }

        match connect_wifi(&mut self.wifi, &self.config) {
            Ok(()) => true,
            Err(err) => {
                warn!("wifi station unavailable: {err:#}");
                let _ = self.wifi.disconnect();
                let _ = self.wifi.stop();
                false
            }
        }
    }

    fn start_access_point(&mut self) -> bool {
        match start_provisioning_ap(&mut self.wifi) {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to start provisioning AP: {err:#}");
                false
            }
        }
    }

    fn sync_time(&mut self) -> Option<i64> {
        let sntp = match self.sntp.take() {
            Some(sntp) => sntp,
            None => match EspSntp::new_default() {
                Ok(sntp) => sntp,
                Err(err) => {
                    warn!("failed to start SNTP: {err}");
                    return None;
                }
            },
        };

        let deadline = Instant::now() + SNTP_SYNC_TIMEOUT;
        while !matches!(sntp.get_sync_status(), SyncStatus::Completed) {
            if Instant::now() >= deadline {
                warn!("SNTP sync timed out after {}s", SNTP_SYNC_TIMEOUT.as_secs());
                self.sntp = Some(sntp);
                return None;
            }
            FreeRtos::delay_ms(100);
        }
        self.sntp = Some(sntp);

        let now = Utc::now();
        info!("SNTP synchronized: {now}");
        clock::clock_is_set(now).then(|| now.timestamp())
    }

    fn camera_ready(&self) -> bool {
        self.camera_ready
    }

    fn capture_and_upload(&mut self) -> Result<(), UploadError> {
        if !self.camera_ready {
            return Err(UploadError::CameraNotReady);
        }

        let captured = self.camera.capture_with_warmup(CAMERA_LOCK_TIMEOUT)?;
        info!("captured {} bytes", captured.len());
        upload_image(&self.config, &self.device_id, captured.bytes())
    }

    fn pause(&mut self, duration: Duration) {
        let millis = u32::try_from(duration.as_millis()).unwrap_or(u32::MAX);
        FreeRtos::delay_ms(millis);
    }
}

impl PortalContext {
    fn config_snapshot(&self) -> DeviceConfig {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn authorized(&self, header: Option<&str>) -> bool {
        let config = self.config.lock().unwrap_or_else(PoisonError::into_inner);
        basic_auth_matches(header, &config.web_username, &config.web_password)
    }

    fn status(&self) -> DeviceStatus {
        let config = self.config_snapshot();
        let now = clock::local_time(&config, Utc::now());
        let next_capture = now
            .and_then(|now| config.schedule.next_capture_time(now).ok())
            .map(|at| at.to_rfc3339());

        DeviceStatus {
            device_id: self.device_id.as_ref().clone(),
            uptime_sec: self.session.uptime().as_secs(),
            remaining_sec: self.session.remaining().as_secs(),
            camera_ready: self.session.camera_ready(),
            camera_busy: self.camera.is_busy(),
            ap_mode: self.session.ap_mode(),
            time_synced: now.is_some(),
            local_time: now.map(|now| now.to_rfc3339()),
            next_capture,
            schedule_entries: config.schedule.len(),
        }
    }
}

impl ConfigPortal for EspPortal {
    fn start(&mut self) -> Result<(), PortalError> {
        if self.server.is_some() {
            return Ok(());
        }

        let server = create_http_server(self.context.clone())
            .map_err(|err| PortalError(format!("{err:#}")))?;
        self.context.session.touch();
        info!("configuration server started");
        self.server = Some(server);
        Ok(())
    }

    fn stop(&mut self) {
        if self.server.take().is_some() {
            info!("configuration server stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.server.is_some()
    }

    fn is_inactivity_timeout_expired(&self) -> bool {
        self.context.session.is_expired()
    }

    fn reset_inactivity_timer(&mut self) {
        self.context.session.touch();
    }

    fn mark_camera_ready(&mut self, ready: bool) {
        self.context.session.set_camera_ready(ready);
    }

    fn set_access_point_mode(&mut self, enabled: bool) {
        self.context.session.set_ap_mode(enabled);
    }

    fn take_restart_request(&mut self) -> Option<RestartRequest> {
        self.context.session.take_restart()
    }
}

impl SleepPlatform for EspSleep {
    fn shutdown_network(&mut self) {
        if let Err(err) = esp_idf_svc::sys::esp!(unsafe { esp_idf_svc::sys::esp_wifi_stop() }) {
            warn!("wifi stop failed: {err}");
        }
    }

    fn deep_sleep(&mut self, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        unsafe {
            camera::esp_camera_deinit();
            esp_idf_svc::sys::esp_sleep_enable_timer_wakeup(micros);
            esp_idf_svc::sys::esp_deep_sleep_start();
        }
    }

    fn restart(&mut self) {
        unsafe { esp_idf_svc::sys::esp_restart() }
    }
}
