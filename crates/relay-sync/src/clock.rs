use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Local, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Wall-clock source for poll cycles.
///
/// `day_start` resolves the local calendar day through the zone's own rules,
/// so the offset in effect at midnight is used even on DST change days.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// First instant of the local calendar day containing `now`.
    fn day_start(&self, now: DateTime<Utc>) -> DateTime<Utc>;
}

/// The process's local clock and zone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn day_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        midnight_cutoff(&now.with_timezone(&Local))
    }
}

/// Settable clock pinned to an IANA zone, for tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    zone: Tz,
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Tz>) -> Self {
        Self {
            zone: now.timezone(),
            now: Mutex::new(now.with_timezone(&Utc)),
        }
    }

    pub fn zone(&self) -> Tz {
        self.zone
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn day_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        midnight_cutoff(&now.with_timezone(&self.zone))
    }
}

/// Start of the calendar day containing `now`, in `now`'s zone.
///
/// An ambiguous midnight resolves to its earlier instant. Zones that skip
/// midnight start the day at the first whole hour that exists.
pub fn midnight_cutoff<Z: TimeZone>(now: &DateTime<Z>) -> DateTime<Utc> {
    let zone = now.timezone();
    let date = now.date_naive();
    (0..24)
        .filter_map(|hour| NaiveTime::from_hms_opt(hour, 0, 0))
        .find_map(|time| zone.from_local_datetime(&date.and_time(time)).earliest())
        .map(|start| start.with_timezone(&Utc))
        .unwrap_or_else(|| now.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;
    use chrono_tz::America::New_York;

    #[test]
    fn cutoff_is_local_midnight() {
        let tz = FixedOffset::west_opt(4 * 3600).unwrap();
        let now = tz.with_ymd_and_hms(2026, 10, 16, 9, 30, 15).unwrap();
        let cutoff = midnight_cutoff(&now);
        assert_eq!(cutoff, Utc.with_ymd_and_hms(2026, 10, 16, 4, 0, 0).unwrap());
    }

    #[test]
    fn cutoff_follows_local_date_not_utc_date() {
        // 22:00 in New York is already the next day in UTC.
        let now = New_York.with_ymd_and_hms(2026, 10, 16, 22, 0, 0).unwrap();
        assert_eq!(
            midnight_cutoff(&now),
            Utc.with_ymd_and_hms(2026, 10, 16, 4, 0, 0).unwrap()
        );
    }

    #[test]
    fn fall_back_day_uses_the_offset_in_effect_at_midnight() {
        // Midnight on 2026-11-01 is still EDT (UTC-4); 09:00 is EST (UTC-5).
        let now = New_York.with_ymd_and_hms(2026, 11, 1, 9, 0, 0).unwrap();
        assert_eq!(
            midnight_cutoff(&now),
            Utc.with_ymd_and_hms(2026, 11, 1, 4, 0, 0).unwrap()
        );
    }

    #[test]
    fn spring_forward_day_uses_the_offset_in_effect_at_midnight() {
        // Midnight on 2026-03-08 is still EST (UTC-5); 09:00 is EDT (UTC-4).
        let now = New_York.with_ymd_and_hms(2026, 3, 8, 9, 0, 0).unwrap();
        assert_eq!(
            midnight_cutoff(&now),
            Utc.with_ymd_and_hms(2026, 3, 8, 5, 0, 0).unwrap()
        );
    }

    #[test]
    fn manual_clock_resolves_day_start_in_its_zone() {
        let clock = ManualClock::new(New_York.with_ymd_and_hms(2026, 11, 1, 9, 0, 0).unwrap());
        assert_eq!(clock.zone(), New_York);
        assert_eq!(
            clock.day_start(clock.now()),
            Utc.with_ymd_and_hms(2026, 11, 1, 4, 0, 0).unwrap()
        );
    }

    #[test]
    fn manual_clock_advances() {
        let start = New_York.with_ymd_and_hms(2026, 10, 16, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        clock.advance(Duration::minutes(5));
        assert_eq!(clock.now(), start.with_timezone(&Utc) + Duration::minutes(5));
        clock.set(start.with_timezone(&Utc));
        assert_eq!(clock.now(), start.with_timezone(&Utc));
    }
}
