use std::time::Duration;

use chrono::{DateTime, TimeZone};
use log::{debug, error, info, warn};

use crate::{
    config::ControllerConfig,
    portal::{ConfigPortal, RestartRequest},
    power::{PowerController, PowerDown, RestartReason, SleepPlatform},
    schedule::{minute_of_day, Schedule, ScheduleError},
    state::{PersistentState, PersistentStore, RetentionMemory, StateOrigin},
    types::{initial_mode, Mode, NetworkLink},
    upload::UploadError,
    wake::{classify, WakeCause, WakeReason},
};

pub trait Board {
    type Zone: TimeZone;

    /// Local wall-clock time, `None` until the clock has been set.
    fn now_local(&self) -> Option<DateTime<Self::Zone>>;
    fn connect_station(&mut self) -> bool;
    fn start_access_point(&mut self) -> bool;
    /// Synchronises the clock and returns the epoch seconds it was set to.
    fn sync_time(&mut self) -> Option<i64>;
    fn camera_ready(&self) -> bool;
    fn capture_and_upload(&mut self) -> Result<(), UploadError>;
    fn pause(&mut self, duration: Duration);
}

const HOLD_ATTEMPTS: usize = 3;

impl From<ScheduleError> for RestartReason {
    fn from(err: ScheduleError) -> Self {
        match err {
            ScheduleError::Empty => Self::EmptySchedule,
            ScheduleError::ClockUnavailable => Self::ClockUnavailable,
            _ => Self::InvalidSleepDuration,
        }
    }
}

pub struct ModeController<B, P, R, S> {
    board: B,
    portal: P,
    store: PersistentStore<R>,
    power: PowerController<S>,
    schedule: Schedule,
    config: ControllerConfig,

    state: PersistentState,
    wake: WakeReason,
    mode: Mode,
    link: NetworkLink,
    last_serviced_minute: Option<u16>,
    retry_wake: bool,
}

impl<B, P, R, S> ModeController<B, P, R, S>
where
    B: Board,
    <B::Zone as TimeZone>::Offset: Copy,
    P: ConfigPortal,
    R: RetentionMemory,
    S: SleepPlatform,
{
    pub fn new(
        board: B,
        portal: P,
        store: PersistentStore<R>,
        power: PowerController<S>,
        schedule: Schedule,
        config: ControllerConfig,
    ) -> Self {
        Self {
            board,
            portal,
            store,
            power,
            schedule,
            config,
            state: PersistentState::default(),
            wake: WakeReason::PowerOn,
            mode: Mode::Config,
            link: NetworkLink::Offline,
            last_serviced_minute: None,
            retry_wake: false,
        }
    }

    pub fn run(&mut self, cause: WakeCause) -> PowerDown {
        if let Some(down) = self.boot(cause) {
            return down;
        }
        loop {
            if let Some(down) = self.tick() {
                return down;
            }
        }
    }

    pub fn boot(&mut self, cause: WakeCause) -> Option<PowerDown> {
        let (mut state, origin) = self.store.load();
        if origin == StateOrigin::Reinitialized {
            info!("persistent state initialised");
        }
        state.record_boot();
        self.state = state;
        self.persist();

        self.wake = classify(cause);
        self.mode = initial_mode(self.wake);
        info!(
            "boot #{} woke by {} ({cause:?}); starting in {}",
            self.state.boot_count,
            self.wake.as_str(),
            self.mode.as_str()
        );

        match self.mode {
            Mode::Capture => self.begin_timer_capture(),
            Mode::Config | Mode::Wait => self.begin_config(),
        }
    }

    pub fn tick(&mut self) -> Option<PowerDown> {
        match self.mode {
            Mode::Config => self.tick_config(),
            Mode::Capture => self.tick_capture(),
            Mode::Wait => self.tick_wait(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn wake_reason(&self) -> WakeReason {
        self.wake
    }

    pub fn link(&self) -> NetworkLink {
        self.link
    }

    pub fn state(&self) -> &PersistentState {
        &self.state
    }

    pub fn board(&self) -> &B {
        &self.board
    }

    pub fn portal(&self) -> &P {
        &self.portal
    }

    pub fn power(&self) -> &PowerController<S> {
        &self.power
    }

    pub fn store(&self) -> &PersistentStore<R> {
        &self.store
    }

    fn persist(&mut self) {
        self.store.save(&self.state);
    }

    fn begin_config(&mut self) -> Option<PowerDown> {
        self.mode = Mode::Config;
        if self.board.connect_station() {
            self.link = NetworkLink::Station;
            self.sync_clock();
        } else {
            warn!("station network unavailable; starting access point fallback");
            self.link = if self.board.start_access_point() {
                NetworkLink::AccessPoint
            } else {
                error!("access point fallback failed to start");
                NetworkLink::Offline
            };
        }
        self.open_portal()
    }

    fn begin_timer_capture(&mut self) -> Option<PowerDown> {
        if !self.board.connect_station() {
            self.link = NetworkLink::Offline;
            let limit = self.config.wifi_retry_limit;

            if self.state.wifi_retry_count < limit {
                let attempt = self.state.record_wifi_retry();
                self.persist();
                let backoff = self.config.wifi_retry_backoff_secs;
                warn!("wifi unavailable on timer wake; retry {attempt}/{limit} in {backoff}s");
                return Some(self.sleep_for(backoff));
            }

            warn!("wifi unavailable after {limit} retries; skipping this capture");
            self.state.reset_wifi_retries();
            self.persist();
            return Some(self.sleep_until_next_wake());
        }

        self.link = NetworkLink::Station;
        self.retry_wake = self.state.wifi_retry_count != 0;
        if self.retry_wake {
            self.state.reset_wifi_retries();
            self.persist();
        }
        self.sync_clock();
        None
    }

    fn sync_clock(&mut self) {
        match self.board.sync_time() {
            Some(epoch) => {
                self.state.record_time_sync(epoch);
                self.persist();
            }
            None => warn!("time synchronisation failed"),
        }
    }

    fn open_portal(&mut self) -> Option<PowerDown> {
        self.portal.mark_camera_ready(self.board.camera_ready());
        self.portal
            .set_access_point_mode(self.link == NetworkLink::AccessPoint);

        if let Err(err) = self.portal.start() {
            error!("{err}");
            return Some(self.restart(RestartReason::PortalUnavailable));
        }
        self.portal.reset_inactivity_timer();
        info!("configuration server running ({})", self.link.as_str());
        None
    }

    fn close_portal(&mut self) {
        if self.portal.is_running() {
            self.portal.stop();
        }
    }

    fn restart(&mut self, reason: RestartReason) -> PowerDown {
        self.close_portal();
        self.power.restart(reason)
    }

    fn sleep_for(&mut self, seconds: u64) -> PowerDown {
        self.close_portal();
        self.power.enter_deep_sleep(seconds, &self.schedule)
    }

    fn now_or_restart(&mut self) -> Result<DateTime<B::Zone>, PowerDown> {
        match self.board.now_local() {
            Some(now) => Ok(now),
            None => {
                error!("wall clock unavailable");
                Err(self.restart(RestartReason::ClockUnavailable))
            }
        }
    }

    fn sleep_until_next_wake(&mut self) -> PowerDown {
        let now = match self.now_or_restart() {
            Ok(now) => now,
            Err(down) => return down,
        };
        match self
            .schedule
            .seconds_until_wake(now, self.config.sleep_margin_secs)
        {
            Ok(seconds) => self.sleep_for(seconds),
            Err(err) => {
                error!("cannot compute next wake: {err}");
                self.restart(err.into())
            }
        }
    }

    /// Sleeps when the next wake is far enough away, otherwise stays awake in
    /// `Wait`.
    fn settle(&mut self) -> Option<PowerDown> {
        let now = match self.now_or_restart() {
            Ok(now) => now,
            Err(down) => return Some(down),
        };
        match self
            .schedule
            .seconds_until_wake(now, self.config.sleep_margin_secs)
        {
            Ok(seconds) if seconds > self.config.min_sleep_secs => Some(self.sleep_for(seconds)),
            Ok(seconds) => {
                if self.mode != Mode::Wait {
                    info!("next wake in {seconds}s; waiting awake");
                }
                self.close_portal();
                self.mode = Mode::Wait;
                None
            }
            Err(err) => {
                error!("cannot compute next wake: {err}");
                Some(self.restart(err.into()))
            }
        }
    }

    fn take_due_minute(&mut self, now: DateTime<B::Zone>) -> bool {
        if !self.schedule.is_capture_due(now) {
            return false;
        }
        let minute = minute_of_day(&now);
        if self.last_serviced_minute == Some(minute) {
            return false;
        }
        self.last_serviced_minute = Some(minute);
        true
    }

    /// One capture-and-upload attempt. Returns true when the failure streak
    /// reached the escalation threshold.
    fn capture_once(&mut self) -> bool {
        match self.board.capture_and_upload() {
            Ok(()) => {
                info!("capture uploaded");
                self.state.record_capture_success();
                self.persist();
                false
            }
            Err(err) => {
                let failures = self.state.record_capture_failure();
                self.persist();
                warn!("capture failed ({failures} in a row): {err}");
                failures >= self.config.failure_threshold
            }
        }
    }

    fn escalate(&mut self) -> Option<PowerDown> {
        error!(
            "{} consecutive capture failures; staying awake for configuration",
            self.state.consecutive_failed_captures
        );
        self.mode = Mode::Config;
        if self.portal.is_running() {
            self.portal.reset_inactivity_timer();
            return None;
        }
        self.open_portal()
    }

    /// Picks the slot this timer wake serves before capturing. A wake within
    /// the margin holds until that slot; one further out waits awake or goes
    /// back to sleep without capturing, unless it is a WiFi retry wake that
    /// owes a missed slot.
    fn tick_capture(&mut self) -> Option<PowerDown> {
        if let Some(now) = self.board.now_local() {
            if self.schedule.is_capture_due(now) {
                self.last_serviced_minute = Some(minute_of_day(&now));
            } else {
                let next = self.schedule.next_capture_time(now).and_then(|target| {
                    let ahead = self.schedule.seconds_until_capture(now)?;
                    Ok((target, ahead))
                });
                let (target, ahead) = match next {
                    Ok(next) => next,
                    Err(err) => {
                        error!("cannot compute next capture: {err}");
                        return Some(self.restart(err.into()));
                    }
                };
                let slot = target.time().format("%H:%M").to_string();

                if ahead <= u64::from(self.config.sleep_margin_secs) {
                    info!("woke {ahead}s before the {slot} capture; holding");
                    self.hold_until(target);
                    self.last_serviced_minute = Some(minute_of_day(&target));
                } else if self.retry_wake {
                    info!("capturing the slot missed while wifi was down");
                } else if ahead < self.config.min_sleep_secs {
                    info!("woke {ahead}s before the {slot} capture; waiting awake");
                    self.mode = Mode::Wait;
                    return None;
                } else {
                    warn!("woke {ahead}s before the {slot} capture; going back to sleep");
                    return Some(self.sleep_until_next_wake());
                }
            }
        }

        if self.capture_once() {
            return self.escalate();
        }

        let now = match self.now_or_restart() {
            Ok(now) => now,
            Err(down) => return Some(down),
        };
        match self
            .schedule
            .seconds_until_wake(now, self.config.sleep_margin_secs)
        {
            Ok(0) => {
                warn!("next wake is already due; waiting awake");
                self.mode = Mode::Wait;
                None
            }
            Ok(seconds) => Some(self.sleep_for(seconds)),
            Err(err) => {
                error!("cannot compute next wake: {err}");
                Some(self.restart(err.into()))
            }
        }
    }

    fn hold_until(&mut self, target: DateTime<B::Zone>) {
        for _ in 0..HOLD_ATTEMPTS {
            let Some(now) = self.board.now_local() else {
                return;
            };
            match (target - now).to_std() {
                Ok(remaining) if !remaining.is_zero() => self.board.pause(remaining),
                _ => return,
            }
        }
    }

    fn tick_config(&mut self) -> Option<PowerDown> {
        if let Some(request) = self.portal.take_restart_request() {
            return Some(self.handle_restart_request(request));
        }

        if let Some(now) = self.board.now_local() {
            if self.take_due_minute(now) {
                info!("scheduled capture during configuration session");
                if self.capture_once() {
                    if let Some(down) = self.escalate() {
                        return Some(down);
                    }
                }
            }
        }

        if self.portal.is_inactivity_timeout_expired() {
            return self.finish_config_session();
        }

        self.board.pause(self.config.config_poll);
        None
    }

    fn finish_config_session(&mut self) -> Option<PowerDown> {
        info!("configuration session timed out");
        if self.link != NetworkLink::Station {
            return Some(self.restart(RestartReason::AccessPointTimeout));
        }
        self.settle()
    }

    fn handle_restart_request(&mut self, request: RestartRequest) -> PowerDown {
        match request {
            RestartRequest::ConfigurationChanged => {
                self.restart(RestartReason::ConfigurationChanged)
            }
            RestartRequest::FactoryReset => {
                self.state = self.store.reset();
                self.restart(RestartReason::FactoryReset)
            }
        }
    }

    fn tick_wait(&mut self) -> Option<PowerDown> {
        let now = match self.now_or_restart() {
            Ok(now) => now,
            Err(down) => return Some(down),
        };

        if self.take_due_minute(now) {
            if self.capture_once() {
                return self.escalate();
            }
            return self.settle();
        }

        debug!("waiting for next capture");
        self.board.pause(self.config.wait_poll);
        None
    }
}
