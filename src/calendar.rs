// =============================================================================
// Exchange calendar — open/closed oracle with a bounded memoization cache
// =============================================================================
//
// The calendar's trading-session data is an external collaborator (see
// SPEC_FULL.md §1): a production deployment plugs in a real market-calendar
// provider behind the `ExchangeCalendar` trait. `ReferenceCalendar` is a
// good-enough-for-tests implementation of standard US equity / CME hours,
// including the NYSE/NASDAQ pre- and post-market extension.
//
// Lookups are memoized per `(exchange, minute)` behind a small bounded cache,
// mirroring the Python source's `@cache`d `check_open_time` — eviction is a
// simple FIFO over a handful of exchanges' worth of entries, not a full LRU,
// since a process only ever queries the handful of exchanges it was
// configured with.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use parking_lot::Mutex;

use crate::types::CalendarCode;

/// External calendar oracle: "was `exchange` open at this UTC minute?"
pub trait ExchangeCalendar: Send + Sync {
    fn is_open_at(&self, calendar: CalendarCode, minute: DateTime<Utc>) -> bool;
}

/// Reference implementation covering the calendars named in the
/// configuration contract: standard NYSE/NASDAQ equity hours (09:30-16:00
/// ET) with a 04:00-09:30 pre-market and 16:00-20:00 post-market extension,
/// Mon-Fri, and CME_Rate (GLOBEX) Sun 18:00 - Fri 17:00 ET with a daily
/// 17:00-18:00 ET maintenance break. US federal holidays are not modeled;
/// a production deployment replaces this with a real calendar provider.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceCalendar;

/// Eastern Time offset from UTC in hours, ignoring DST (a fixed UTC-5
/// offset, matching the reference implementation's documented scope).
const ET_OFFSET_HOURS: i64 = -5;

impl ReferenceCalendar {
    fn to_et_minutes(minute: DateTime<Utc>) -> (Weekday, i64) {
        let et = minute + chrono::Duration::hours(ET_OFFSET_HOURS);
        let minutes_since_midnight = i64::from(et.hour()) * 60 + i64::from(et.minute());
        (et.weekday(), minutes_since_midnight)
    }

    fn equity_open(minute: DateTime<Utc>, extended: bool) -> bool {
        let (weekday, mins) = Self::to_et_minutes(minute);
        if matches!(weekday, Weekday::Sat | Weekday::Sun) {
            return false;
        }
        if extended {
            (4 * 60..20 * 60).contains(&mins)
        } else {
            (9 * 60 + 30..16 * 60).contains(&mins)
        }
    }

    fn cme_open(minute: DateTime<Utc>) -> bool {
        let (weekday, mins) = Self::to_et_minutes(minute);
        match weekday {
            Weekday::Sat => false,
            Weekday::Sun => mins >= 18 * 60,
            Weekday::Fri => mins < 17 * 60,
            _ => !(17 * 60..18 * 60).contains(&mins),
        }
    }
}

impl ExchangeCalendar for ReferenceCalendar {
    fn is_open_at(&self, calendar: CalendarCode, minute: DateTime<Utc>) -> bool {
        match calendar {
            CalendarCode::Nasdaq | CalendarCode::Nyse => {
                Self::equity_open(minute, calendar.has_extended_sessions())
            }
            CalendarCode::CmeRate => Self::cme_open(minute),
        }
    }
}

/// Bounded memoizing wrapper over any `ExchangeCalendar`.
pub struct CalendarCache<C: ExchangeCalendar> {
    inner: C,
    capacity: usize,
    cache: Mutex<(HashMap<(CalendarCode, i64), bool>, VecDeque<(CalendarCode, i64)>)>,
}

impl<C: ExchangeCalendar> CalendarCache<C> {
    pub fn new(inner: C, capacity: usize) -> Self {
        Self {
            inner,
            capacity,
            cache: Mutex::new((HashMap::new(), VecDeque::new())),
        }
    }

    /// Memoized open-at-time query, keyed on `(calendar, minute timestamp)`.
    pub fn is_open_at(&self, calendar: CalendarCode, minute: DateTime<Utc>) -> bool {
        let key = (calendar, minute.timestamp());
        let mut guard = self.cache.lock();
        if let Some(&hit) = guard.0.get(&key) {
            return hit;
        }
        drop(guard);

        let result = self.inner.is_open_at(calendar, minute);

        let mut guard = self.cache.lock();
        guard.0.insert(key, result);
        guard.1.push_back(key);
        while guard.1.len() > self.capacity {
            if let Some(evict) = guard.1.pop_front() {
                guard.0.remove(&evict);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn et(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        // Build the UTC instant whose ET-offset (fixed UTC-5) clock reads
        // the given wall time.
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap() - chrono::Duration::hours(ET_OFFSET_HOURS)
    }

    #[test]
    fn nyse_regular_session_open() {
        // Monday 2024-06-03, 10:00 ET -- regular session.
        let minute = et(2024, 6, 3, 10, 0);
        assert!(ReferenceCalendar.is_open_at(CalendarCode::Nyse, minute));
    }

    #[test]
    fn nyse_closed_overnight() {
        let minute = et(2024, 6, 3, 2, 0);
        assert!(!ReferenceCalendar.is_open_at(CalendarCode::Nyse, minute));
    }

    #[test]
    fn nyse_weekend_closed() {
        // Saturday.
        let minute = et(2024, 6, 8, 10, 0);
        assert!(!ReferenceCalendar.is_open_at(CalendarCode::Nyse, minute));
    }

    #[test]
    fn nasdaq_premarket_open() {
        let minute = et(2024, 6, 3, 5, 0);
        assert!(ReferenceCalendar.is_open_at(CalendarCode::Nasdaq, minute));
    }

    #[test]
    fn cme_maintenance_break_closed() {
        let minute = et(2024, 6, 3, 17, 30);
        assert!(!ReferenceCalendar.is_open_at(CalendarCode::CmeRate, minute));
    }

    #[test]
    fn cme_sunday_evening_open() {
        let minute = et(2024, 6, 2, 19, 0);
        assert!(ReferenceCalendar.is_open_at(CalendarCode::CmeRate, minute));
    }

    #[test]
    fn cache_returns_consistent_results_and_evicts() {
        let cache = CalendarCache::new(ReferenceCalendar, 2);
        let a = et(2024, 6, 3, 10, 0);
        let b = et(2024, 6, 3, 11, 0);
        let c = et(2024, 6, 3, 12, 0);

        assert!(cache.is_open_at(CalendarCode::Nyse, a));
        assert!(cache.is_open_at(CalendarCode::Nyse, b));
        assert!(cache.is_open_at(CalendarCode::Nyse, c)); // evicts `a`'s entry

        // Still correct after eviction -- just recomputed.
        assert!(cache.is_open_at(CalendarCode::Nyse, a));
    }
}
