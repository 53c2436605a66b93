//! Recurrence engine: pure next-occurrence computation.
//!
//! All computation happens as civil date + wall time in the reminder's
//! configured timezone and is converted to an absolute UTC instant exactly
//! once, so daylight-saving transitions neither skip nor double-fire a day.
//!
//! No I/O and no shared state; callers inject the reference instant.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;

use crate::error::{Error, Result};
use crate::models::{DayOfWeek, RecurrenceRule};

/// Result of a next-occurrence computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occurrence {
    /// The next instant the reminder becomes due (strictly after reference).
    At(DateTime<Utc>),
    /// No further occurrence exists (one-time rule already fired); the caller
    /// must transition the reminder to `completed`.
    Exhausted,
}

/// Validate a rule at reminder-creation time so configuration errors never
/// reach the dispatcher.
pub fn validate_rule(rule: &RecurrenceRule) -> Result<()> {
    match rule {
        RecurrenceRule::DaysOfWeek { days } if days.is_empty() => {
            Err(Error::Config("day set must not be empty".into()))
        }
        _ => Ok(()),
    }
}

/// Compute the next occurrence of `rule` strictly after `reference`.
///
/// `time_of_day` and `timezone` are ignored for one-time rules, which carry
/// their own absolute instant.
pub fn next_occurrence(
    rule: &RecurrenceRule,
    time_of_day: NaiveTime,
    timezone: Tz,
    reference: DateTime<Utc>,
) -> Result<Occurrence> {
    validate_rule(rule)?;

    match rule {
        RecurrenceRule::OneTime { at } => {
            if *at > reference {
                Ok(Occurrence::At(*at))
            } else {
                Ok(Occurrence::Exhausted)
            }
        }
        RecurrenceRule::Daily => next_matching_day(|_| true, time_of_day, timezone, reference),
        RecurrenceRule::Weekdays => next_matching_day(
            |d| !matches!(d, DayOfWeek::Sat | DayOfWeek::Sun),
            time_of_day,
            timezone,
            reference,
        ),
        RecurrenceRule::DaysOfWeek { days } => {
            next_matching_day(|d| days.contains(&d), time_of_day, timezone, reference)
        }
    }
}

/// Walk forward one civil day at a time in the reminder's zone until a
/// qualifying day resolves to an instant strictly after the reference.
fn next_matching_day(
    allowed: impl Fn(DayOfWeek) -> bool,
    time_of_day: NaiveTime,
    timezone: Tz,
    reference: DateTime<Utc>,
) -> Result<Occurrence> {
    let mut date = reference.with_timezone(&timezone).date_naive();

    // A nonempty weekday set qualifies within 7 days; the extra iterations
    // cover the reference day itself plus DST edge resolution.
    for _ in 0..9 {
        if allowed(DayOfWeek::from_weekday(date.weekday())) {
            let instant = resolve_local(date, time_of_day, timezone)?;
            if instant > reference {
                return Ok(Occurrence::At(instant));
            }
        }
        date = date
            .succ_opt()
            .ok_or_else(|| Error::Internal("date overflow advancing recurrence".into()))?;
    }

    Err(Error::Internal(
        "no qualifying occurrence within 9 days".into(),
    ))
}

/// Resolve a civil date + wall time in `timezone` to a UTC instant.
///
/// Ambiguous local times (fall-back) take the earlier instant. Nonexistent
/// local times (spring-forward gap) shift forward in 30-minute steps until a
/// valid local time is found on the same civil day.
fn resolve_local(date: NaiveDate, time_of_day: NaiveTime, timezone: Tz) -> Result<DateTime<Utc>> {
    use chrono::offset::LocalResult;
    use chrono::TimeZone;

    let mut wall = time_of_day;
    for _ in 0..6 {
        match timezone.from_local_datetime(&date.and_time(wall)) {
            LocalResult::Single(dt) => return Ok(dt.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => return Ok(earliest.with_timezone(&Utc)),
            LocalResult::None => {
                // Inside a DST gap; try the next half hour.
                wall = wall
                    .overflowing_add_signed(Duration::minutes(30))
                    .0;
            }
        }
    }

    Err(Error::Config(format!(
        "could not resolve {date} {time_of_day} in {timezone}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::America::New_York;
    use chrono_tz::UTC;

    fn tod(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn at(occ: Occurrence) -> DateTime<Utc> {
        match occ {
            Occurrence::At(t) => t,
            Occurrence::Exhausted => panic!("expected an occurrence"),
        }
    }

    #[test]
    fn test_daily_after_todays_time_rolls_to_tomorrow() {
        // daily 09:00 UTC, reference 2024-01-01T10:00Z
        let reference = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        let next = next_occurrence(&RecurrenceRule::Daily, tod(9, 0), UTC, reference).unwrap();
        assert_eq!(at(next), Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_daily_before_todays_time_fires_today() {
        let reference = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        let next = next_occurrence(&RecurrenceRule::Daily, tod(9, 0), UTC, reference).unwrap();
        assert_eq!(at(next), Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_daily_exactly_at_time_is_strictly_after() {
        let reference = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        let next = next_occurrence(&RecurrenceRule::Daily, tod(9, 0), UTC, reference).unwrap();
        assert_eq!(at(next), Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_weekdays_skips_weekend() {
        // 2024-01-05 is a Friday.
        let reference = Utc.with_ymd_and_hms(2024, 1, 5, 10, 0, 0).unwrap();
        let next = next_occurrence(&RecurrenceRule::Weekdays, tod(9, 0), UTC, reference).unwrap();
        // Next weekday occurrence is Monday the 8th.
        assert_eq!(at(next), Utc.with_ymd_and_hms(2024, 1, 8, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_days_of_week_picks_next_qualifying_day() {
        // 2024-01-01 is a Monday.
        let rule = RecurrenceRule::DaysOfWeek {
            days: vec![DayOfWeek::Wed, DayOfWeek::Sun],
        };
        let reference = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let next = next_occurrence(&rule, tod(9, 0), UTC, reference).unwrap();
        assert_eq!(at(next), Utc.with_ymd_and_hms(2024, 1, 3, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_days_of_week_same_day_later_time() {
        // Monday reference before a Monday occurrence later that day.
        let rule = RecurrenceRule::DaysOfWeek {
            days: vec![DayOfWeek::Mon],
        };
        let reference = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        let next = next_occurrence(&rule, tod(20, 0), UTC, reference).unwrap();
        assert_eq!(at(next), Utc.with_ymd_and_hms(2024, 1, 1, 20, 0, 0).unwrap());
    }

    #[test]
    fn test_empty_day_set_is_config_error() {
        let rule = RecurrenceRule::DaysOfWeek { days: vec![] };
        let err = next_occurrence(&rule, tod(9, 0), UTC, Utc::now()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(validate_rule(&rule).is_err());
    }

    #[test]
    fn test_one_time_future_and_past() {
        let fire_at = Utc.with_ymd_and_hms(2024, 6, 1, 15, 0, 0).unwrap();
        let rule = RecurrenceRule::OneTime { at: fire_at };

        let before = fire_at - chrono::Duration::hours(1);
        assert_eq!(
            next_occurrence(&rule, tod(0, 0), UTC, before).unwrap(),
            Occurrence::At(fire_at)
        );

        // At or after the instant: exhausted.
        assert_eq!(
            next_occurrence(&rule, tod(0, 0), UTC, fire_at).unwrap(),
            Occurrence::Exhausted
        );
    }

    #[test]
    fn test_timezone_wall_time_converted_once() {
        // 09:00 in New York during winter is 14:00 UTC.
        let reference = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        let next =
            next_occurrence(&RecurrenceRule::Daily, tod(9, 0), New_York, reference).unwrap();
        assert_eq!(at(next), Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).unwrap());
    }

    #[test]
    fn test_dst_spring_forward_gap_shifts_not_skips() {
        // 2024-03-10 02:30 does not exist in New York; the occurrence shifts
        // to 03:00 EDT rather than skipping the day.
        let reference = Utc.with_ymd_and_hms(2024, 3, 9, 20, 0, 0).unwrap();
        let next =
            next_occurrence(&RecurrenceRule::Daily, tod(2, 30), New_York, reference).unwrap();
        // 03:00 EDT == 07:00 UTC.
        assert_eq!(at(next), Utc.with_ymd_and_hms(2024, 3, 10, 7, 0, 0).unwrap());

        // And the next day returns to the normal wall time (02:30 EDT = 06:30Z),
        // so the transition never double-fires.
        let after = at(next);
        let following =
            next_occurrence(&RecurrenceRule::Daily, tod(2, 30), New_York, after).unwrap();
        assert_eq!(
            at(following),
            Utc.with_ymd_and_hms(2024, 3, 11, 6, 30, 0).unwrap()
        );
    }

    #[test]
    fn test_dst_fall_back_takes_earlier_instant() {
        // 2024-11-03 01:30 happens twice in New York; take the first (EDT).
        let reference = Utc.with_ymd_and_hms(2024, 11, 2, 12, 0, 0).unwrap();
        let next =
            next_occurrence(&RecurrenceRule::Daily, tod(1, 30), New_York, reference).unwrap();
        // 01:30 EDT == 05:30 UTC.
        assert_eq!(at(next), Utc.with_ymd_and_hms(2024, 11, 3, 5, 30, 0).unwrap());
    }

    #[test]
    fn test_always_strictly_after_reference() {
        let rules = [
            RecurrenceRule::Daily,
            RecurrenceRule::Weekdays,
            RecurrenceRule::DaysOfWeek {
                days: vec![DayOfWeek::Sun],
            },
        ];
        let mut reference = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        for _ in 0..30 {
            for rule in &rules {
                let next = at(next_occurrence(rule, tod(7, 45), New_York, reference).unwrap());
                assert!(next > reference, "{rule:?} produced {next} <= {reference}");
            }
            reference += chrono::Duration::hours(13);
        }
    }
}
