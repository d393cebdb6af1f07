use std::time::Duration;

use chrono::FixedOffset;
use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schedule::{Schedule, ScheduleEntry, ScheduleError};

pub const DEFAULT_WEB_TIMEOUT_MIN: u32 = 15;
pub const MAX_WEB_TIMEOUT_MIN: u32 = 240;
pub const DEFAULT_SLEEP_MARGIN_SEC: u32 = 60;
pub const MAX_SLEEP_MARGIN_SEC: u32 = 600;
pub const MIN_SLEEP_THRESHOLD_SEC: u64 = 300;
pub const MASKED_SECRET: &str = "********";

const MIN_SERVER_URL_LEN: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub sleep_margin_secs: u32,
    pub min_sleep_secs: u64,
    pub failure_threshold: u32,
    pub wifi_retry_limit: u32,
    pub wifi_retry_backoff_secs: u64,
    pub config_poll: Duration,
    pub wait_poll: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sleep_margin_secs: DEFAULT_SLEEP_MARGIN_SEC,
            min_sleep_secs: MIN_SLEEP_THRESHOLD_SEC,
            failure_threshold: 3,
            wifi_retry_limit: 5,
            wifi_retry_backoff_secs: 300,
            config_poll: Duration::from_secs(1),
            wait_poll: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("wifiSsid cannot be empty")]
    MissingSsid,
    #[error("serverUrl must be at least {MIN_SERVER_URL_LEN} characters")]
    InvalidServerUrl,
    #[error("authToken cannot be empty")]
    MissingAuthToken,
    #[error("webTimeoutMin must be between 1 and {MAX_WEB_TIMEOUT_MIN}")]
    WebTimeout(u32),
    #[error("sleepMarginSec must be between 0 and {MAX_SLEEP_MARGIN_SEC}")]
    SleepMargin(u32),
    #[error("invalid schedule: {0}")]
    Schedule(#[from] ScheduleError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceConfig {
    #[serde(rename = "wifiSsid")]
    pub wifi_ssid: String,
    #[serde(rename = "wifiPassword")]
    pub wifi_password: String,
    #[serde(rename = "serverUrl")]
    pub server_url: String,
    #[serde(rename = "authToken")]
    pub auth_token: String,
    #[serde(rename = "gmtOffsetSec")]
    pub gmt_offset_sec: i32,
    #[serde(rename = "daylightOffsetSec")]
    pub daylight_offset_sec: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    pub schedule: Schedule,
    #[serde(rename = "webTimeoutMin")]
    pub web_timeout_min: u32,
    #[serde(rename = "sleepMarginSec")]
    pub sleep_margin_sec: u32,
    #[serde(rename = "webUsername", default)]
    pub web_username: String,
    #[serde(rename = "webPassword", default)]
    pub web_password: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_password: String::new(),
            server_url: String::new(),
            auth_token: String::new(),
            gmt_offset_sec: 3600,
            daylight_offset_sec: 3600,
            timezone: None,
            schedule: Schedule::new(vec![
                ScheduleEntry::new(8, 0),
                ScheduleEntry::new(11, 0),
                ScheduleEntry::new(15, 0),
                ScheduleEntry::new(17, 0),
            ]),
            web_timeout_min: DEFAULT_WEB_TIMEOUT_MIN,
            sleep_margin_sec: DEFAULT_SLEEP_MARGIN_SEC,
            web_username: "admin".to_string(),
            web_password: String::new(),
        }
    }
}

/// Partial update from the configuration page. Absent fields keep their
/// stored value; a masked or empty secret keeps the stored secret.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigUpdate {
    #[serde(rename = "wifiSsid", default)]
    pub wifi_ssid: Option<String>,
    #[serde(rename = "wifiPassword", default)]
    pub wifi_password: Option<String>,
    #[serde(rename = "serverUrl", default)]
    pub server_url: Option<String>,
    #[serde(rename = "authToken", default)]
    pub auth_token: Option<String>,
    #[serde(rename = "gmtOffsetSec", default)]
    pub gmt_offset_sec: Option<i32>,
    #[serde(rename = "daylightOffsetSec", default)]
    pub daylight_offset_sec: Option<i32>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub schedule: Option<Schedule>,
    #[serde(rename = "webTimeoutMin", default)]
    pub web_timeout_min: Option<u32>,
    #[serde(rename = "sleepMarginSec", default)]
    pub sleep_margin_sec: Option<u32>,
    #[serde(rename = "webUsername", default)]
    pub web_username: Option<String>,
    #[serde(rename = "webPassword", default)]
    pub web_password: Option<String>,
}

fn is_kept_secret(value: &str) -> bool {
    value.is_empty() || value == MASKED_SECRET
}

fn mask(value: &str) -> String {
    if value.is_empty() {
        String::new()
    } else {
        MASKED_SECRET.to_string()
    }
}

impl DeviceConfig {
    pub fn sanitize(&mut self) {
        self.web_timeout_min = self.web_timeout_min.clamp(1, MAX_WEB_TIMEOUT_MIN);
        self.sleep_margin_sec = self.sleep_margin_sec.min(MAX_SLEEP_MARGIN_SEC);
        self.wifi_ssid = self.wifi_ssid.trim().to_string();
        self.server_url = self.server_url.trim().to_string();
        if self
            .timezone
            .as_deref()
            .is_some_and(|tz| tz.trim().is_empty())
        {
            self.timezone = None;
        }
        self.schedule.normalize();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wifi_ssid.trim().is_empty() {
            return Err(ConfigError::MissingSsid);
        }
        if self.server_url.trim().len() < MIN_SERVER_URL_LEN {
            return Err(ConfigError::InvalidServerUrl);
        }
        if self.auth_token.is_empty() {
            return Err(ConfigError::MissingAuthToken);
        }
        if !(1..=MAX_WEB_TIMEOUT_MIN).contains(&self.web_timeout_min) {
            return Err(ConfigError::WebTimeout(self.web_timeout_min));
        }
        if self.sleep_margin_sec > MAX_SLEEP_MARGIN_SEC {
            return Err(ConfigError::SleepMargin(self.sleep_margin_sec));
        }
        self.schedule.validate()?;

        if let Some(gap) = self.schedule.min_gap_secs() {
            if u64::from(self.sleep_margin_sec) >= gap {
                warn!(
                    "sleep margin {}s is not smaller than the shortest capture gap {gap}s; \
                     the device will stay awake between those captures",
                    self.sleep_margin_sec
                );
            }
        }
        Ok(())
    }

    pub fn has_station_credentials(&self) -> bool {
        !self.wifi_ssid.trim().is_empty()
    }

    pub fn has_upload_target(&self) -> bool {
        self.server_url.trim().len() >= MIN_SERVER_URL_LEN && !self.auth_token.is_empty()
    }

    pub fn utc_offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.gmt_offset_sec.saturating_add(self.daylight_offset_sec))
    }

    pub fn web_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.web_timeout_min) * 60)
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            sleep_margin_secs: self.sleep_margin_sec,
            ..ControllerConfig::default()
        }
    }

    pub fn view(&self) -> DeviceConfig {
        DeviceConfig {
            wifi_password: mask(&self.wifi_password),
            auth_token: mask(&self.auth_token),
            web_password: mask(&self.web_password),
            ..self.clone()
        }
    }

    pub fn apply_update(&mut self, update: ConfigUpdate) {
        if let Some(ssid) = update.wifi_ssid {
            self.wifi_ssid = ssid;
        }
        if let Some(password) = update.wifi_password.filter(|value| !is_kept_secret(value)) {
            self.wifi_password = password;
        }
        if let Some(url) = update.server_url {
            self.server_url = url;
        }
        if let Some(token) = update.auth_token.filter(|value| !is_kept_secret(value)) {
            self.auth_token = token;
        }
        if let Some(offset) = update.gmt_offset_sec {
            self.gmt_offset_sec = offset;
        }
        if let Some(offset) = update.daylight_offset_sec {
            self.daylight_offset_sec = offset;
        }
        if let Some(timezone) = update.timezone {
            self.timezone = Some(timezone);
        }
        if let Some(schedule) = update.schedule {
            self.schedule = schedule;
        }
        if let Some(timeout) = update.web_timeout_min {
            self.web_timeout_min = timeout;
        }
        if let Some(margin) = update.sleep_margin_sec {
            self.sleep_margin_sec = margin;
        }
        if let Some(username) = update.web_username {
            self.web_username = username;
        }
        if let Some(password) = update.web_password.filter(|value| !is_kept_secret(value)) {
            self.web_password = password;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn configured() -> DeviceConfig {
        DeviceConfig {
            wifi_ssid: "garden".to_string(),
            wifi_password: "hunter22".to_string(),
            server_url: "https://photos.example.net/upload".to_string(),
            auth_token: "secret-token".to_string(),
            ..DeviceConfig::default()
        }
    }

    #[test]
    fn default_config_needs_credentials() {
        let config = DeviceConfig::default();
        assert_eq!(config.validate(), Err(ConfigError::MissingSsid));
        assert_eq!(configured().validate(), Ok(()));
    }

    #[test]
    fn sanitize_clamps_ranges() {
        let mut config = DeviceConfig {
            web_timeout_min: 0,
            sleep_margin_sec: 5_000,
            ..configured()
        };
        config.sanitize();
        assert_eq!(config.web_timeout_min, 1);
        assert_eq!(config.sleep_margin_sec, MAX_SLEEP_MARGIN_SEC);

        config.web_timeout_min = 1_000;
        config.sanitize();
        assert_eq!(config.web_timeout_min, MAX_WEB_TIMEOUT_MIN);
    }

    #[test]
    fn validate_rejects_short_url_and_missing_token() {
        let short = DeviceConfig {
            server_url: "http:/".to_string(),
            ..configured()
        };
        assert_eq!(short.validate(), Err(ConfigError::InvalidServerUrl));

        let tokenless = DeviceConfig {
            auth_token: String::new(),
            ..configured()
        };
        assert_eq!(tokenless.validate(), Err(ConfigError::MissingAuthToken));

        let empty_schedule = DeviceConfig {
            schedule: Schedule::default(),
            ..configured()
        };
        assert_eq!(
            empty_schedule.validate(),
            Err(ConfigError::Schedule(ScheduleError::Empty))
        );
    }

    #[test]
    fn view_masks_secrets() {
        let view = configured().view();
        assert_eq!(view.wifi_password, MASKED_SECRET);
        assert_eq!(view.auth_token, MASKED_SECRET);
        assert_eq!(view.web_password, "");
        assert_eq!(view.wifi_ssid, "garden");
    }

    #[test]
    fn masked_secrets_keep_stored_values() {
        let mut config = configured();
        let update: ConfigUpdate = serde_json::from_str(
            r#"{
                "wifiSsid": "orchard",
                "wifiPassword": "********",
                "authToken": "",
                "schedule": [{"hour": 6, "minute": 45}],
                "sleepMarginSec": 90
            }"#,
        )
        .unwrap();
        config.apply_update(update);

        assert_eq!(config.wifi_ssid, "orchard");
        assert_eq!(config.wifi_password, "hunter22");
        assert_eq!(config.auth_token, "secret-token");
        assert_eq!(config.schedule, Schedule::new(vec![ScheduleEntry::new(6, 45)]));
        assert_eq!(config.sleep_margin_sec, 90);
        assert_eq!(config.web_timeout_min, DEFAULT_WEB_TIMEOUT_MIN);
    }

    #[test]
    fn new_secret_replaces_stored_value() {
        let mut config = configured();
        config.apply_update(ConfigUpdate {
            auth_token: Some("rotated".to_string()),
            ..ConfigUpdate::default()
        });
        assert_eq!(config.auth_token, "rotated");
    }

    #[test]
    fn json_uses_camel_case_fields() {
        let json = serde_json::to_value(configured()).unwrap();
        assert_eq!(json["wifiSsid"], "garden");
        assert_eq!(json["webTimeoutMin"], 15);
        assert_eq!(json["schedule"][0]["hour"], 8);
        assert!(json.get("timezone").is_none());

        let restored: DeviceConfig = serde_json::from_value(json).unwrap();
        assert_eq!(restored, configured());
    }

    #[test]
    fn offsets_combine_into_fixed_offset() {
        let config = DeviceConfig {
            gmt_offset_sec: -5 * 3600,
            daylight_offset_sec: 3600,
            ..DeviceConfig::default()
        };
        assert_eq!(config.utc_offset(), FixedOffset::west_opt(4 * 3600));
        assert_eq!(config.controller_config().sleep_margin_secs, 60);
    }
}
