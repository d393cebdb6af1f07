pub mod arbiter;
pub mod config;
pub mod controller;
pub mod portal;
pub mod power;
pub mod schedule;
pub mod state;
pub mod types;
pub mod upload;
pub mod wake;

pub use arbiter::{
    CaptureArbiter, CaptureError, Captured, FrameSource, SensorError, WarmupProfile,
    CAMERA_LOCK_TIMEOUT,
};
pub use config::{ConfigError, ConfigUpdate, ControllerConfig, DeviceConfig};
pub use controller::{Board, ModeController};
pub use portal::{ConfigPortal, PortalError, PortalSession, RestartRequest};
pub use power::{PowerController, PowerDown, RestartReason, SleepPlatform};
pub use schedule::{Schedule, ScheduleEntry, ScheduleError};
pub use state::{MemoryRetention, PersistentState, PersistentStore, RetentionMemory};
pub use types::{ActionResponse, DeviceStatus, Mode, NetworkLink};
pub use upload::UploadError;
pub use wake::{WakeCause, WakeReason};
