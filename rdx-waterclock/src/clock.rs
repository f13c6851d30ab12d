//! The clock facade the scheduler reads "now" from.
//!
//! The scheduling core never asks the operating system for the time itself.
//! Instead each tick is handed a `Now` value, produced either by the
//! `WallClock` (real time in the controller's timezone) or by the `SimClock`
//! (a one-second-per-tick simulation used for dry runs and tests).

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// A single observation of the clock, broken into the fields the scheduler
/// matches programs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Now {
    /// Absolute time in seconds since the Unix epoch.
    pub epoch: i64,
    /// Day-of-year (1-based). Even/odd programs key off its parity.
    pub day: u32,
    /// Day of week, 0 = Monday through 6 = Sunday.
    pub day_of_week: u8,
    /// Local wall time, truncated to whole seconds.
    pub time: NaiveTime,
}

impl Now {
    pub fn new(epoch: i64, day: u32, day_of_week: u8, time: NaiveTime) -> Self {
        Self {
            epoch,
            day,
            day_of_week,
            time,
        }
    }

    /// Breaks a zoned timestamp into its scheduling fields.
    pub fn from_datetime<Z: TimeZone>(dt: &DateTime<Z>) -> Self {
        let time = NaiveTime::from_num_seconds_from_midnight_opt(dt.num_seconds_from_midnight(), 0)
            .unwrap_or(NaiveTime::MIN);
        Self {
            epoch: dt.timestamp(),
            day: dt.ordinal(),
            day_of_week: dt.weekday().num_days_from_monday() as u8,
            time,
        }
    }

    /// The scheduling fields of `epoch` as seen in `timezone`.
    pub fn from_epoch(epoch: i64, timezone: Tz) -> Option<Self> {
        let utc = Utc.timestamp_opt(epoch, 0).single()?;
        Some(Self::from_datetime(&utc.with_timezone(&timezone)))
    }

    /// Seconds elapsed since local midnight.
    pub fn seconds_from_midnight(&self) -> u32 {
        self.time.num_seconds_from_midnight()
    }

    pub fn is_even_day(&self) -> bool {
        self.day % 2 == 0
    }
}

/// Anything that can produce the current `Now`.
pub trait Clock {
    fn now(&self) -> Now;
}

/// Reads the system time, interpreted in the controller's timezone.
#[derive(Debug, Clone, Copy)]
pub struct WallClock {
    timezone: Tz,
}

impl WallClock {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }
}

impl Clock for WallClock {
    fn now(&self) -> Now {
        Now::from_datetime(&Utc::now().with_timezone(&self.timezone))
    }
}

/// A simulated clock that advances exactly one second per `tick`.
#[derive(Debug, Clone)]
pub struct SimClock {
    timezone: Tz,
    current: DateTime<Tz>,
}

impl SimClock {
    /// Creates a clock parked at the given instant.
    pub fn new(start: DateTime<Tz>) -> Self {
        Self {
            timezone: start.timezone(),
            current: start,
        }
    }

    /// Creates a clock parked at local midnight of `date`.
    pub fn starting_at(date: NaiveDate, timezone: Tz) -> Self {
        Self::new(local_midnight(date, timezone))
    }

    /// Rewinds (or fast-forwards) the clock to the start of the current day.
    pub fn reset_to_today(&mut self) {
        let today = Utc::now().with_timezone(&self.timezone).date_naive();
        self.current = local_midnight(today, self.timezone);
    }

    pub fn tick(&mut self) {
        self.advance(1);
    }

    pub fn advance(&mut self, seconds: i64) {
        self.current += chrono::Duration::seconds(seconds);
    }

    pub fn current(&self) -> DateTime<Tz> {
        self.current.clone()
    }
}

impl Clock for SimClock {
    fn now(&self) -> Now {
        Now::from_datetime(&self.current)
    }
}

fn local_midnight(date: NaiveDate, timezone: Tz) -> DateTime<Tz> {
    let naive = date.and_time(NaiveTime::MIN);
    // Midnight can be skipped by a DST transition; fall back to reading the
    // naive value as UTC in that case.
    timezone
        .from_local_datetime(&naive)
        .earliest()
        .unwrap_or_else(|| timezone.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_breaks_out_calendar_fields() {
        // 2024-03-05 was a Tuesday, the 65th day of a leap year.
        let dt = Utc.with_ymd_and_hms(2024, 3, 5, 6, 0, 30).unwrap();
        let now = Now::from_datetime(&dt);
        assert_eq!(now.day, 65);
        assert_eq!(now.day_of_week, 1);
        assert_eq!(now.time, NaiveTime::from_hms_opt(6, 0, 30).unwrap());
        assert_eq!(now.epoch, dt.timestamp());
        assert!(!now.is_even_day());
    }

    #[test]
    fn from_epoch_uses_the_local_calendar() {
        // 2024-03-05 23:30 UTC is already Wednesday the 6th in Tokyo.
        let dt = Utc.with_ymd_and_hms(2024, 3, 5, 23, 30, 0).unwrap();
        let now = Now::from_epoch(dt.timestamp(), Tz::Asia__Tokyo).unwrap();
        assert_eq!(now.day, 66);
        assert_eq!(now.day_of_week, 2);
        assert_eq!(now.time, NaiveTime::from_hms_opt(8, 30, 0).unwrap());
        assert_eq!(now.epoch, dt.timestamp());
    }

    #[test]
    fn sim_clock_ticks_one_second() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let mut clock = SimClock::starting_at(date, Tz::UTC);
        let start = clock.now();
        assert_eq!(start.seconds_from_midnight(), 0);

        clock.tick();
        let next = clock.now();
        assert_eq!(next.epoch, start.epoch + 1);
        assert_eq!(next.seconds_from_midnight(), 1);

        clock.advance(86_399);
        assert_eq!(clock.now().day, 3);
        assert_eq!(clock.now().seconds_from_midnight(), 0);
    }
}
