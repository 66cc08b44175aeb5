//! Next check time of a retrieve directory from its time entries.

use afd_config::log_maint_warn;
use afd_ipc::TimeEntry;
use chrono::{DateTime, Datelike, Duration, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// Upper bound on search steps; an entry that never matches gives up.
const MAX_STEPS: usize = 10_000;

/// Earliest minute after `now` matched by any of `entries`, evaluated in
/// timezone `tz` (UTC when unset or unknown).
pub fn next_check_time(entries: &[TimeEntry], tz: Option<&str>, now: i64) -> Option<i64> {
    let tz: Tz = match tz {
        Some(name) => name.parse().unwrap_or_else(|_| {
            log_maint_warn!("Unknown timezone, using UTC", timezone = name);
            chrono_tz::UTC
        }),
        None => chrono_tz::UTC,
    };
    entries.iter().filter_map(|te| next_match(te, &tz, now)).min()
}

fn local_midnight(tz: &Tz, day: NaiveDateTime) -> Option<i64> {
    // A DST gap can swallow midnight; take the first valid hour after it.
    (0..3)
        .filter_map(|h| tz.from_local_datetime(&(day + Duration::hours(h))).earliest())
        .map(|dt| dt.timestamp())
        .next()
}

fn next_match(te: &TimeEntry, tz: &Tz, now: i64) -> Option<i64> {
    let mut t = now - now.rem_euclid(60) + 60;
    for _ in 0..MAX_STEPS {
        let local = DateTime::<Utc>::from_timestamp(t, 0)?.with_timezone(tz);
        let month_ok = te.month & (1 << local.month0()) != 0;
        let dom_ok = te.day_of_month & (1 << local.day()) != 0;
        let dow_ok = te.day_of_week & (1 << local.weekday().number_from_monday()) != 0;
        if !(month_ok && dom_ok && dow_ok) {
            let next_day = local.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?;
            t = local_midnight(tz, next_day)?;
            continue;
        }
        if te.hour & (1 << local.hour()) == 0 {
            t += i64::from(60 - local.minute()) * 60;
            continue;
        }
        if te.minute & (1u64 << local.minute()) == 0 {
            t += 60;
            continue;
        }
        return Some(t);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> i64 {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M")
            .unwrap()
            .and_utc()
            .timestamp()
    }

    #[test]
    fn test_every_minute_is_next_minute() {
        let now = ts("2024-03-05 10:15") + 30;
        let next = next_check_time(&[TimeEntry::every_minute()], None, now);
        assert_eq!(next, Some(ts("2024-03-05 10:16")));
    }

    #[test]
    fn test_fixed_hour_and_minute() {
        let mut te = TimeEntry::every_minute();
        te.minute = 1 << 30;
        te.hour = 1 << 6;
        let now = ts("2024-03-05 10:15");
        assert_eq!(next_check_time(&[te], None, now), Some(ts("2024-03-06 06:30")));
    }

    #[test]
    fn test_day_of_week_and_earliest_entry() {
        // Sundays at 00:00
        let mut sunday = TimeEntry::every_minute();
        sunday.minute = 1;
        sunday.hour = 1;
        sunday.day_of_week = 1 << 7;
        // every hour at :45
        let mut hourly = TimeEntry::every_minute();
        hourly.minute = 1 << 45;

        let now = ts("2024-03-05 10:15"); // a Tuesday
        assert_eq!(next_check_time(&[sunday], None, now), Some(ts("2024-03-10 00:00")));
        assert_eq!(
            next_check_time(&[sunday, hourly], None, now),
            Some(ts("2024-03-05 10:45"))
        );
    }

    #[test]
    fn test_timezone_shifts_result() {
        let mut te = TimeEntry::every_minute();
        te.minute = 1;
        te.hour = 1 << 12;
        let now = ts("2024-01-10 00:00");
        // 12:00 in Berlin (UTC+1 in winter) is 11:00 UTC
        assert_eq!(
            next_check_time(&[te], Some("Europe/Berlin"), now),
            Some(ts("2024-01-10 11:00"))
        );
    }

    #[test]
    fn test_impossible_entry() {
        let mut te = TimeEntry::every_minute();
        te.day_of_month = 1 << 31;
        te.month = 1 << 1; // February 31st
        assert_eq!(next_check_time(&[te], None, 0), None);
        assert_eq!(next_check_time(&[], None, 0), None);
    }
}
