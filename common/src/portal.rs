use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

pub const ROUTE_CONFIG: &str = "/api/config";
pub const ROUTE_STATUS: &str = "/api/status";
pub const ROUTE_CAPTURE: &str = "/api/capture";
pub const ROUTE_PREVIEW: &str = "/api/preview";
pub const ROUTE_RESET: &str = "/api/reset";
pub const ROUTE_AUTH_CHECK: &str = "/api/auth-check";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartRequest {
    ConfigurationChanged,
    FactoryReset,
}

#[derive(Debug, Error)]
#[error("configuration server failed to start: {0}")]
pub struct PortalError(pub String);

/// Control surface of the local configuration server as seen by the mode
/// controller.
pub trait ConfigPortal {
    fn start(&mut self) -> Result<(), PortalError>;
    fn stop(&mut self);
    fn is_running(&self) -> bool;
    fn is_inactivity_timeout_expired(&self) -> bool;
    fn reset_inactivity_timer(&mut self);
    fn mark_camera_ready(&mut self, ready: bool);
    fn set_access_point_mode(&mut self, enabled: bool);
    fn take_restart_request(&mut self) -> Option<RestartRequest>;
}

/// State shared between the control loop and the request handlers.
#[derive(Debug)]
pub struct PortalSession {
    booted: Instant,
    timeout: Duration,
    last_activity: Mutex<Instant>,
    camera_ready: AtomicBool,
    ap_mode: AtomicBool,
    restart: Mutex<Option<RestartRequest>>,
}

impl PortalSession {
    pub fn new(timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            booted: now,
            timeout,
            last_activity: Mutex::new(now),
            camera_ready: AtomicBool::new(false),
            ap_mode: AtomicBool::new(false),
            restart: Mutex::new(None),
        }
    }

    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.idle_for() >= self.timeout
    }

    pub fn remaining(&self) -> Duration {
        self.timeout.saturating_sub(self.idle_for())
    }

    pub fn uptime(&self) -> Duration {
        self.booted.elapsed()
    }

    pub fn set_camera_ready(&self, ready: bool) {
        self.camera_ready.store(ready, Ordering::Relaxed);
    }

    pub fn camera_ready(&self) -> bool {
        self.camera_ready.load(Ordering::Relaxed)
    }

    pub fn set_ap_mode(&self, enabled: bool) {
        self.ap_mode.store(enabled, Ordering::Relaxed);
    }

    pub fn ap_mode(&self) -> bool {
        self.ap_mode.load(Ordering::Relaxed)
    }

    /// A pending factory reset is never downgraded to a plain restart.
    pub fn request_restart(&self, request: RestartRequest) {
        let mut pending = self.restart.lock().unwrap_or_else(PoisonError::into_inner);
        if *pending != Some(RestartRequest::FactoryReset) {
            *pending = Some(request);
        }
    }

    pub fn take_restart(&self) -> Option<RestartRequest> {
        self.restart
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Checks an `Authorization` header against the configured web credentials.
/// An empty password disables authentication.
pub fn basic_auth_matches(header: Option<&str>, username: &str, password: &str) -> bool {
    if password.is_empty() {
        return true;
    }

    let Some(encoded) = header.and_then(|value| value.trim().strip_prefix("Basic ")) else {
        return false;
    };
    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(credentials) = String::from_utf8(decoded) else {
        return false;
    };

    credentials
        .split_once(':')
        .is_some_and(|(user, pass)| user == username && pass == password)
}
