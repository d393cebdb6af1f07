use std::time::Duration;

use log::{error, info, warn};

use crate::schedule::Schedule;

/// Hardware side of powering down. On the device neither `deep_sleep` nor
/// `restart` returns; simulations may return and reboot in-process.
pub trait SleepPlatform {
    fn shutdown_network(&mut self);
    fn deep_sleep(&mut self, duration: Duration);
    fn restart(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    InvalidSleepDuration,
    EmptySchedule,
    ClockUnavailable,
    AccessPointTimeout,
    PortalUnavailable,
    ConfigurationChanged,
    FactoryReset,
}

impl RestartReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidSleepDuration => "invalid sleep duration",
            Self::EmptySchedule => "empty capture schedule",
            Self::ClockUnavailable => "wall clock unavailable",
            Self::AccessPointTimeout => "configuration timed out without station network",
            Self::PortalUnavailable => "configuration server failed to start",
            Self::ConfigurationChanged => "configuration saved",
            Self::FactoryReset => "factory reset",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerDown {
    DeepSleep { seconds: u64 },
    Restart(RestartReason),
}

pub struct PowerController<P> {
    platform: P,
}

impl<P: SleepPlatform> PowerController<P> {
    pub fn new(platform: P) -> Self {
        Self { platform }
    }

    /// Sleeps on the wake timer. A zero duration or an empty schedule would
    /// leave the device without a wake source, so both restart instead.
    pub fn enter_deep_sleep(&mut self, seconds: u64, schedule: &Schedule) -> PowerDown {
        if schedule.is_empty() {
            error!("refusing deep sleep with an empty capture schedule");
            return self.restart(RestartReason::EmptySchedule);
        }
        if seconds == 0 {
            error!("refusing deep sleep of 0s");
            return self.restart(RestartReason::InvalidSleepDuration);
        }

        info!("entering deep sleep for {seconds}s");
        self.platform.shutdown_network();
        self.platform.deep_sleep(Duration::from_secs(seconds));
        PowerDown::DeepSleep { seconds }
    }

    pub fn restart(&mut self, reason: RestartReason) -> PowerDown {
        warn!("restarting: {}", reason.as_str());
        self.platform.shutdown_network();
        self.platform.restart();
        PowerDown::Restart(reason)
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn into_inner(self) -> P {
        self.platform
    }
}
