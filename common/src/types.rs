use serde::{Deserialize, Serialize};

use crate::wake::WakeReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Config,
    Capture,
    Wait,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "CONFIG",
            Self::Capture => "CAPTURE",
            Self::Wait => "WAIT",
        }
    }
}

pub fn initial_mode(reason: WakeReason) -> Mode {
    match reason {
        WakeReason::Timer => Mode::Capture,
        WakeReason::PowerOn | WakeReason::ExternalSignal | WakeReason::Unknown => Mode::Config,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkLink {
    Station,
    AccessPoint,
    Offline,
}

impl NetworkLink {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Station => "STATION",
            Self::AccessPoint => "ACCESS_POINT",
            Self::Offline => "OFFLINE",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "uptimeSec")]
    pub uptime_sec: u64,
    #[serde(rename = "remainingSec")]
    pub remaining_sec: u64,
    #[serde(rename = "cameraReady")]
    pub camera_ready: bool,
    #[serde(rename = "cameraBusy")]
    pub camera_busy: bool,
    #[serde(rename = "apMode")]
    pub ap_mode: bool,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    #[serde(rename = "localTime")]
    pub local_time: Option<String>,
    #[serde(rename = "nextCapture")]
    pub next_capture: Option<String>,
    #[serde(rename = "scheduleEntries")]
    pub schedule_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

impl ActionResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn timer_wakes_go_straight_to_capture() {
        assert_eq!(initial_mode(WakeReason::Timer), Mode::Capture);
        assert_eq!(initial_mode(WakeReason::PowerOn), Mode::Config);
        assert_eq!(initial_mode(WakeReason::ExternalSignal), Mode::Config);
        assert_eq!(initial_mode(WakeReason::Unknown), Mode::Config);
    }

    #[test]
    fn mode_serializes_like_its_label() {
        assert_eq!(serde_json::to_string(&Mode::Wait).unwrap(), r#""WAIT""#);
        assert_eq!(Mode::Wait.as_str(), "WAIT");
        assert_eq!(
            serde_json::to_string(&NetworkLink::AccessPoint).unwrap(),
            format!("\"{}\"", NetworkLink::AccessPoint.as_str())
        );
    }
}
