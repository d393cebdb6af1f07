use std::fmt;

use chrono::{
    DateTime, Datelike, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, Offset,
    TimeZone, Utc,
};
use chrono_tz::Tz;

use picpusher_common::DeviceConfig;

/// Earliest year the clock is trusted; an unsynchronised RTC starts at 1970.
const MIN_VALID_YEAR: i32 = 2024;

/// Zone the device reads its schedule in. A named zone keeps its daylight
/// saving rules so dates after a transition get the right offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceZone {
    Named(Tz),
    Fixed(FixedOffset),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneOffset {
    zone: DeviceZone,
    fixed: FixedOffset,
}

impl DeviceZone {
    /// An IANA `timezone` wins over the fixed GMT/daylight offsets when it
    /// parses.
    pub fn for_config(config: &DeviceConfig) -> Option<Self> {
        if let Some(tz) = config
            .timezone
            .as_deref()
            .and_then(|name| name.parse::<Tz>().ok())
        {
            return Some(Self::Named(tz));
        }
        config.utc_offset().map(Self::Fixed)
    }

    fn offset(self, fixed: FixedOffset) -> ZoneOffset {
        ZoneOffset { zone: self, fixed }
    }
}

impl Offset for ZoneOffset {
    fn fix(&self) -> FixedOffset {
        self.fixed
    }
}

impl fmt::Display for ZoneOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.fixed, f)
    }
}

impl TimeZone for DeviceZone {
    type Offset = ZoneOffset;

    fn from_offset(offset: &ZoneOffset) -> Self {
        offset.zone
    }

    fn offset_from_local_date(&self, local: &NaiveDate) -> LocalResult<ZoneOffset> {
        self.offset_from_local_datetime(&local.and_time(NaiveTime::MIN))
    }

    fn offset_from_local_datetime(&self, local: &NaiveDateTime) -> LocalResult<ZoneOffset> {
        match *self {
            Self::Named(tz) => tz
                .offset_from_local_datetime(local)
                .map(|offset| self.offset(offset.fix())),
            Self::Fixed(fixed) => LocalResult::Single(self.offset(fixed)),
        }
    }

    fn offset_from_utc_date(&self, utc: &NaiveDate) -> ZoneOffset {
        self.offset_from_utc_datetime(&utc.and_time(NaiveTime::MIN))
    }

    fn offset_from_utc_datetime(&self, utc: &NaiveDateTime) -> ZoneOffset {
        match *self {
            Self::Named(tz) => self.offset(tz.offset_from_utc_datetime(utc).fix()),
            Self::Fixed(fixed) => self.offset(fixed),
        }
    }
}

pub fn clock_is_set(utc: DateTime<Utc>) -> bool {
    utc.year() >= MIN_VALID_YEAR
}

pub fn local_time(config: &DeviceConfig, utc: DateTime<Utc>) -> Option<DateTime<DeviceZone>> {
    if !clock_is_set(utc) {
        return None;
    }
    DeviceZone::for_config(config).map(|zone| utc.with_timezone(&zone))
}

#[cfg(all(test, not(feature = "esp32")))]
mod tests {
    use chrono::Timelike;
    use picpusher_common::{Schedule, ScheduleEntry};
    use pretty_assertions::assert_eq;

    use super::*;

    fn utc(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn unset_clock_has_no_local_time() {
        let config = DeviceConfig::default();
        assert_eq!(local_time(&config, utc(1970, 1, 1, 0)), None);
    }

    #[test]
    fn fixed_offsets_apply_without_timezone() {
        let config = DeviceConfig {
            gmt_offset_sec: 3600,
            daylight_offset_sec: 0,
            ..DeviceConfig::default()
        };
        let local = local_time(&config, utc(2025, 1, 15, 12)).unwrap();
        assert_eq!(local.hour(), 13);
    }

    #[test]
    fn named_timezone_follows_daylight_saving() {
        let config = DeviceConfig {
            timezone: Some("Europe/Berlin".to_string()),
            gmt_offset_sec: 0,
            daylight_offset_sec: 0,
            ..DeviceConfig::default()
        };
        assert_eq!(local_time(&config, utc(2025, 1, 15, 12)).unwrap().hour(), 13);
        assert_eq!(local_time(&config, utc(2025, 7, 15, 12)).unwrap().hour(), 14);
    }

    #[test]
    fn next_capture_after_spring_forward_uses_summer_offset() {
        let config = DeviceConfig {
            timezone: Some("Europe/Berlin".to_string()),
            ..DeviceConfig::default()
        };
        let schedule = Schedule::new(vec![ScheduleEntry::new(8, 0)]);
        let now = local_time(&config, utc(2025, 3, 29, 12)).unwrap();

        let next = schedule.next_capture_time(now).unwrap();
        assert_eq!(next.hour(), 8);
        assert_eq!(next.with_timezone(&Utc), utc(2025, 3, 30, 6));
        assert_eq!(schedule.seconds_until_wake(now, 60).unwrap(), 18 * 3600 - 60);
    }

    #[test]
    fn next_capture_after_fall_back_uses_winter_offset() {
        let config = DeviceConfig {
            timezone: Some("Europe/Berlin".to_string()),
            ..DeviceConfig::default()
        };
        let schedule = Schedule::new(vec![ScheduleEntry::new(8, 0)]);
        let now = local_time(&config, utc(2025, 10, 25, 12)).unwrap();

        let next = schedule.next_capture_time(now).unwrap();
        assert_eq!(next.with_timezone(&Utc), utc(2025, 10, 26, 7));
        assert_eq!(schedule.seconds_until_capture(now).unwrap(), 19 * 3600);
    }

    #[test]
    fn capture_inside_skipped_hour_keeps_the_old_offset() {
        let config = DeviceConfig {
            timezone: Some("Europe/Berlin".to_string()),
            ..DeviceConfig::default()
        };
        let schedule = Schedule::new(vec![ScheduleEntry::new(2, 30)]);
        let now = local_time(&config, utc(2025, 3, 29, 12)).unwrap();

        let next = schedule.next_capture_time(now).unwrap();
        assert_eq!(
            next.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2025, 3, 30, 1, 30, 0).unwrap()
        );
    }

    #[test]
    fn unknown_timezone_falls_back_to_offsets() {
        let config = DeviceConfig {
            timezone: Some("Mars/Olympus".to_string()),
            gmt_offset_sec: -3600,
            daylight_offset_sec: 0,
            ..DeviceConfig::default()
        };
        assert_eq!(local_time(&config, utc(2025, 1, 15, 12)).unwrap().hour(), 11);
    }
}
