// Appointment due-ness calculation
//
// An appointment carries a calendar date and a local time-of-day. They are
// combined in the yard's timezone with the seconds component fixed to zero,
// and the appointment is due once that instant is at or before `now`.

use crate::models::Appointment;
use chrono::{
    DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMATS: [&str; 2] = ["%H:%M", "%H:%M:%S"];

/// Parse an appointment date (`YYYY-MM-DD`)
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).ok()
}

/// Parse an appointment time (`HH:MM` or `HH:MM:SS`), dropping any seconds
pub fn parse_time(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(raw, fmt).ok())
        .and_then(|t| t.with_second(0))
}

/// Combine the appointment date and time into the instant it becomes due
///
/// Returns `None` when either field is missing or malformed. Wall-clock times
/// skipped by a DST transition resolve to the first valid instant an hour
/// later; repeated wall-clock times resolve to the earlier occurrence.
pub fn build_scheduled_instant(appointment: &Appointment, tz: &Tz) -> Option<DateTime<Utc>> {
    let date = parse_date(appointment.date.as_deref()?)?;
    let time = parse_time(appointment.time.as_deref()?)?;
    resolve_local(NaiveDateTime::new(date, time), tz)
}

fn resolve_local(naive: NaiveDateTime, tz: &Tz) -> Option<DateTime<Utc>> {
    let local = match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => tz.from_local_datetime(&(naive + Duration::hours(1))).earliest()?,
    };
    Some(local.with_timezone(&Utc))
}

/// Whether the appointment's scheduled instant has been reached
///
/// Inclusive: an appointment scheduled exactly at `now` is due.
pub fn is_due(appointment: &Appointment, now: DateTime<Utc>, tz: &Tz) -> bool {
    match build_scheduled_instant(appointment, tz) {
        Some(at) => at <= now,
        None => false,
    }
}

/// Default timezone for interpreting appointment wall-clock times
pub fn default_timezone() -> Tz {
    Tz::UTC
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AppointmentKind, AppointmentStatus};
    use proptest::prelude::*;

    fn appointment(date: Option<&str>, time: Option<&str>) -> Appointment {
        Appointment {
            id: "apt-1".to_string(),
            vehicle_id: Some("veh-1".to_string()),
            vehicle_plate: "ABC1D23".to_string(),
            kind: AppointmentKind::Load,
            date: date.map(str::to_string),
            time: time.map(str::to_string),
            status: Some(AppointmentStatus::Scheduled),
            dispatched_at: None,
            linked_task_id: None,
            created_at: None,
        }
    }

    #[test]
    fn test_due_exactly_at_scheduled_minute() {
        let apt = appointment(Some("2024-01-10"), Some("08:00"));
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 8, 0, 0).unwrap();
        assert!(is_due(&apt, now, &Tz::UTC));
    }

    #[test]
    fn test_not_due_one_second_before() {
        let apt = appointment(Some("2024-01-10"), Some("08:00"));
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 7, 59, 59).unwrap();
        assert!(!is_due(&apt, now, &Tz::UTC));
    }

    #[test]
    fn test_seconds_in_time_are_ignored() {
        let apt = appointment(Some("2024-01-10"), Some("08:00:45"));
        let at = build_scheduled_instant(&apt, &Tz::UTC).unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2024, 1, 10, 8, 0, 0).unwrap());
    }

    #[test]
    fn test_missing_or_malformed_fields_never_due() {
        let far_future = Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap();
        let cases = [
            appointment(None, Some("08:00")),
            appointment(Some("2024-01-10"), None),
            appointment(Some("10/01/2024"), Some("08:00")),
            appointment(Some("2024-02-30"), Some("08:00")),
            appointment(Some("2024-01-10"), Some("25:00")),
            appointment(Some("2024-01-10"), Some("8h")),
            appointment(Some(""), Some("")),
        ];
        for apt in cases {
            assert!(build_scheduled_instant(&apt, &Tz::UTC).is_none());
            assert!(!is_due(&apt, far_future, &Tz::UTC));
        }
    }

    #[test]
    fn test_local_time_uses_configured_timezone() {
        let apt = appointment(Some("2024-01-10"), Some("08:00"));
        let tz: Tz = "America/Sao_Paulo".parse().unwrap();
        // Sao Paulo is UTC-3 in January 2024
        let at = build_scheduled_instant(&apt, &tz).unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2024, 1, 10, 11, 0, 0).unwrap());
        assert!(!is_due(&apt, Utc.with_ymd_and_hms(2024, 1, 10, 10, 59, 0).unwrap(), &tz));
        assert!(is_due(&apt, Utc.with_ymd_and_hms(2024, 1, 10, 11, 0, 0).unwrap(), &tz));
    }

    #[test]
    fn test_dst_gap_resolves_forward() {
        // 2024-03-10 02:30 does not exist in New York
        let apt = appointment(Some("2024-03-10"), Some("02:30"));
        let tz: Tz = "America/New_York".parse().unwrap();
        let at = build_scheduled_instant(&apt, &tz).unwrap();
        assert_eq!(at, Utc.with_ymd_and_hms(2024, 3, 10, 7, 30, 0).unwrap());
    }

    #[test]
    fn test_whitespace_is_trimmed() {
        let apt = appointment(Some(" 2024-01-10 "), Some(" 08:00 "));
        assert!(build_scheduled_instant(&apt, &Tz::UTC).is_some());
    }

    #[test]
    fn test_default_timezone_is_utc() {
        assert_eq!(default_timezone(), Tz::UTC);
    }

    proptest! {
        #[test]
        fn prop_due_iff_now_reaches_scheduled_minute(
            day_offset in 0i64..3650,
            minute_of_day in 0u32..1440,
            delta_secs in -172_800i64..172_800,
        ) {
            let date = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap() + Duration::days(day_offset);
            let time = NaiveTime::from_hms_opt(minute_of_day / 60, minute_of_day % 60, 0).unwrap();
            let apt = appointment(
                Some(&date.format("%Y-%m-%d").to_string()),
                Some(&time.format("%H:%M").to_string()),
            );
            let scheduled = Utc.from_utc_datetime(&NaiveDateTime::new(date, time));
            let now = scheduled + Duration::seconds(delta_secs);

            prop_assert_eq!(build_scheduled_instant(&apt, &Tz::UTC), Some(scheduled));
            prop_assert_eq!(is_due(&apt, now, &Tz::UTC), delta_secs >= 0);
        }

        #[test]
        fn prop_garbage_dates_never_due(raw in "[a-zA-Z/ ]{0,12}") {
            let apt = appointment(Some(&raw), Some("08:00"));
            let now = Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap();
            prop_assert!(!is_due(&apt, now, &Tz::UTC));
        }
    }
}
