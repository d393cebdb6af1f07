use chrono::{DateTime, Days, NaiveDateTime, Offset, TimeZone, Timelike};
use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_CAPTURE_TIMES: usize = 24;

const MINUTES_PER_DAY: u16 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub hour: u8,
    pub minute: u8,
}

impl ScheduleEntry {
    pub const fn new(hour: u8, minute: u8) -> Self {
        Self { hour, minute }
    }

    pub fn is_valid(&self) -> bool {
        self.hour < 24 && self.minute < 60
    }

    pub fn minute_of_day(&self) -> u16 {
        u16::from(self.hour) * 60 + u16::from(self.minute)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("capture schedule is empty")]
    Empty,
    #[error("wall clock has not been synchronised")]
    ClockUnavailable,
    #[error("capture schedule has {0} entries (at most {MAX_CAPTURE_TIMES} allowed)")]
    TooManyEntries(usize),
    #[error("capture time {hour:02}:{minute:02} is out of range")]
    InvalidEntry { hour: u8, minute: u8 },
    #[error("capture time {hour:02}:{minute:02} is listed twice")]
    DuplicateEntry { hour: u8, minute: u8 },
    #[error("next capture time falls outside the representable calendar")]
    OutOfRange,
}

pub fn minute_of_day<T: Timelike>(now: &T) -> u16 {
    (now.hour() * 60 + now.minute()) as u16
}

/// Daily capture times. Order is irrelevant to every calculation below.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schedule {
    pub entries: Vec<ScheduleEntry>,
}

impl Schedule {
    pub fn new(entries: Vec<ScheduleEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn normalize(&mut self) {
        self.entries.retain(ScheduleEntry::is_valid);
        self.entries.sort();
        self.entries.dedup();
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.entries.is_empty() {
            return Err(ScheduleError::Empty);
        }
        if self.entries.len() > MAX_CAPTURE_TIMES {
            return Err(ScheduleError::TooManyEntries(self.entries.len()));
        }

        for (index, entry) in self.entries.iter().enumerate() {
            if !entry.is_valid() {
                return Err(ScheduleError::InvalidEntry {
                    hour: entry.hour,
                    minute: entry.minute,
                });
            }
            if self.entries[..index].contains(entry) {
                return Err(ScheduleError::DuplicateEntry {
                    hour: entry.hour,
                    minute: entry.minute,
                });
            }
        }

        Ok(())
    }

    /// Smallest distance between two consecutive capture times, wrapping past
    /// midnight. `None` when fewer than two entries exist.
    pub fn min_gap_secs(&self) -> Option<u64> {
        if self.entries.len() < 2 {
            return None;
        }

        let mut minutes: Vec<u16> = self
            .entries
            .iter()
            .map(ScheduleEntry::minute_of_day)
            .collect();
        minutes.sort_unstable();

        let wrap = MINUTES_PER_DAY - minutes[minutes.len() - 1] + minutes[0];
        minutes
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .chain(std::iter::once(wrap))
            .min()
            .map(|gap| u64::from(gap) * 60)
    }

    /// The date-time is resolved in `now`'s own zone, so a zone with daylight
    /// saving rules yields the offset that applies on the capture day.
    pub fn next_capture_time<Tz: TimeZone>(
        &self,
        now: DateTime<Tz>,
    ) -> Result<DateTime<Tz>, ScheduleError> {
        let current = minute_of_day(&now);

        let later_today = self
            .entries
            .iter()
            .filter(|entry| entry.minute_of_day() > current)
            .min();

        let (entry, day_offset) = match later_today {
            Some(entry) => (entry, 0),
            None => (self.entries.iter().min().ok_or(ScheduleError::Empty)?, 1),
        };

        let date = now
            .date_naive()
            .checked_add_days(Days::new(day_offset))
            .ok_or(ScheduleError::OutOfRange)?;
        let naive = date
            .and_hms_opt(u32::from(entry.hour), u32::from(entry.minute), 0)
            .ok_or(ScheduleError::InvalidEntry {
                hour: entry.hour,
                minute: entry.minute,
            })?;

        resolve_local(&now, &naive).ok_or(ScheduleError::OutOfRange)
    }

    pub fn next_wake_time<Tz: TimeZone>(
        &self,
        now: DateTime<Tz>,
        margin_secs: u32,
    ) -> Result<DateTime<Tz>, ScheduleError> {
        let capture = self.next_capture_time(now)?;
        Ok(capture - chrono::Duration::seconds(i64::from(margin_secs)))
    }

    /// A wake time already in the past yields zero.
    pub fn seconds_until_wake<Tz: TimeZone>(
        &self,
        now: DateTime<Tz>,
        margin_secs: u32,
    ) -> Result<u64, ScheduleError> {
        let wake = self.next_wake_time(now.clone(), margin_secs)?;
        let delta = (wake.clone() - now).num_seconds();
        if delta < 0 {
            warn!(
                "next wake {} is {}s in the past; clamping to 0",
                wake.naive_local(),
                -delta
            );
            return Ok(0);
        }
        Ok(delta as u64)
    }

    pub fn seconds_until_capture<Tz: TimeZone>(
        &self,
        now: DateTime<Tz>,
    ) -> Result<u64, ScheduleError> {
        let capture = self.next_capture_time(now.clone())?;
        Ok((capture - now).num_seconds().max(0) as u64)
    }

    pub fn is_capture_due<Tz: TimeZone>(&self, now: DateTime<Tz>) -> bool {
        let current = minute_of_day(&now);
        self.entries
            .iter()
            .any(|entry| entry.minute_of_day() == current)
    }
}

// Skipped local times (spring forward) keep the offset in force at `now`;
// repeated ones (fall back) take the earlier instant.
fn resolve_local<Tz: TimeZone>(
    now: &DateTime<Tz>,
    naive: &NaiveDateTime,
) -> Option<DateTime<Tz>> {
    let zone = now.timezone();
    zone.from_local_datetime(naive).earliest().or_else(|| {
        now.offset()
            .fix()
            .from_local_datetime(naive)
            .single()
            .map(|at| at.with_timezone(&zone))
    })
}
