use chrono::{Datelike, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::America::New_York;

/// Regular trading hours for US equities: 09:30-16:00 Eastern, Mon-Fri.
/// Exchange holidays are not modeled; upstream data simply has no bars on
/// those days.
pub fn is_rth(timestamp_ms: i64) -> bool {
    let Some(utc) = Utc.timestamp_millis_opt(timestamp_ms).single() else {
        return false;
    };
    let eastern = utc.with_timezone(&New_York);

    match eastern.weekday() {
        Weekday::Sat | Weekday::Sun => return false,
        _ => {}
    }

    let time = eastern.time();
    let open = NaiveTime::from_hms_opt(9, 30, 0).expect("valid time");
    let close = NaiveTime::from_hms_opt(16, 0, 0).expect("valid time");
    time >= open && time < close
}

/// Whether any regular-hours trading falls inside `[start_ms, end_ms)`.
/// Used by gap detection: a quiet overnight span is not a data gap.
pub fn overlaps_rth(start_ms: i64, end_ms: i64) -> bool {
    if end_ms <= start_ms {
        return false;
    }
    // Probe minute by minute, capped to a week; ranges longer than that
    // always cross a session.
    const MINUTE_MS: i64 = 60_000;
    const WEEK_MS: i64 = 7 * 24 * 3_600_000;
    if end_ms - start_ms >= WEEK_MS {
        return true;
    }
    let mut t = start_ms;
    while t < end_ms {
        if is_rth(t) {
            return true;
        }
        t += MINUTE_MS;
    }
    false
}

/// Minute of the regular session this timestamp falls on, or `None` outside
/// regular hours.
pub fn session_minute(timestamp_ms: i64) -> Option<u32> {
    if !is_rth(timestamp_ms) {
        return None;
    }
    let eastern = Utc
        .timestamp_millis_opt(timestamp_ms)
        .single()?
        .with_timezone(&New_York);
    let minutes = eastern.time().hour() * 60 + eastern.time().minute();
    Some(minutes - (9 * 60 + 30))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use chrono_tz::America::New_York;

    fn eastern_ms(y: i32, m: u32, d: u32, hh: u32, mm: u32) -> i64 {
        New_York
            .from_local_datetime(
                &NaiveDate::from_ymd_opt(y, m, d)
                    .unwrap()
                    .and_hms_opt(hh, mm, 0)
                    .unwrap(),
            )
            .single()
            .unwrap()
            .timestamp_millis()
    }

    #[test]
    fn session_open_is_rth_and_premarket_is_not() {
        // 2024-06-11 is a Tuesday
        assert!(is_rth(eastern_ms(2024, 6, 11, 9, 30)));
        assert!(is_rth(eastern_ms(2024, 6, 11, 15, 59)));
        assert!(!is_rth(eastern_ms(2024, 6, 11, 9, 29)));
        assert!(!is_rth(eastern_ms(2024, 6, 11, 16, 0)));
    }

    #[test]
    fn weekends_are_closed() {
        assert!(!is_rth(eastern_ms(2024, 6, 8, 12, 0))); // Saturday
        assert!(!is_rth(eastern_ms(2024, 6, 9, 12, 0))); // Sunday
    }

    #[test]
    fn overnight_span_does_not_overlap() {
        let evening = eastern_ms(2024, 6, 11, 17, 0);
        let next_premarket = eastern_ms(2024, 6, 12, 8, 0);
        assert!(!overlaps_rth(evening, next_premarket));
    }

    #[test]
    fn midday_span_overlaps() {
        let a = eastern_ms(2024, 6, 11, 11, 0);
        let b = eastern_ms(2024, 6, 11, 11, 10);
        assert!(overlaps_rth(a, b));
    }

    #[test]
    fn session_minute_at_open_is_zero() {
        assert_eq!(session_minute(eastern_ms(2024, 6, 11, 9, 30)), Some(0));
        assert_eq!(session_minute(eastern_ms(2024, 6, 11, 10, 30)), Some(60));
        assert_eq!(session_minute(eastern_ms(2024, 6, 11, 8, 0)), None);
    }
}
