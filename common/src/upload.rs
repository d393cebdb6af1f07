use thiserror::Error;

use crate::arbiter::CaptureError;

pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_AUTH_TOKEN: &str = "X-Auth-Token";
pub const HEADER_DEVICE_ID: &str = "X-Device-ID";
pub const HEADER_TIMESTAMP: &str = "X-Timestamp";
pub const JPEG_CONTENT_TYPE: &str = "image/jpeg";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("camera not initialised")]
    CameraNotReady,
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("upload target not configured")]
    NotConfigured,
    #[error("network error: {0}")]
    Network(String),
    #[error("server rejected upload with HTTP {0}")]
    Rejected(u16),
}

pub fn upload_headers(
    auth_token: &str,
    device_id: &str,
    timestamp: i64,
) -> [(&'static str, String); 4] {
    [
        (HEADER_CONTENT_TYPE, JPEG_CONTENT_TYPE.to_string()),
        (HEADER_AUTH_TOKEN, auth_token.to_string()),
        (HEADER_DEVICE_ID, device_id.to_string()),
        (HEADER_TIMESTAMP, timestamp.to_string()),
    ]
}

pub fn check_status(status: u16) -> Result<(), UploadError> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(UploadError::Rejected(status))
    }
}

pub fn device_id_from_mac(mac: [u8; 6]) -> String {
    mac.iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}
