//! Next-occurrence computation for recurrence rules.
//!
//! Pure: the reference time is the explicit `after` argument, never the
//! wall clock, so the same `(pattern, after)` pair always yields the same
//! result. The returned timestamp is strictly after `after`.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::models::task_run::{RecurrenceFrequency, RecurrencePattern};

/// Storage format shared with the database layer.
pub fn format_utc(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

pub fn next_occurrence(
    pattern: &RecurrencePattern,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let (hour, minute) = parse_time(&pattern.time)?;
    let interval = pattern.interval.max(1);
    let after_naive = after.naive_utc();

    let next: NaiveDateTime = match pattern.frequency {
        RecurrenceFrequency::Daily => {
            let today = after.date_naive().and_hms_opt(hour, minute, 0)?;
            if today > after_naive {
                today
            } else {
                today + Duration::days(interval)
            }
        }
        RecurrenceFrequency::Weekly => {
            let target_days = pattern.days_of_week.as_ref()?;
            if target_days.is_empty() {
                return None;
            }
            let current = after.weekday().num_days_from_sunday() as i64;
            let today_at = after.date_naive().and_hms_opt(hour, minute, 0)?;

            if target_days.iter().any(|&d| i64::from(d) == current) && today_at > after_naive {
                today_at
            } else {
                // Next matching weekday strictly after today; when the
                // only match is today's weekday, jump a full cycle.
                let mut best_diff = 7 * interval;
                for &day in target_days {
                    let diff = (i64::from(day) - current + 7) % 7;
                    if diff > 0 && diff < best_diff {
                        best_diff = diff;
                    }
                }
                (after.date_naive() + Duration::days(best_diff)).and_hms_opt(hour, minute, 0)?
            }
        }
        RecurrenceFrequency::Monthly => {
            let target_day = pattern.day_of_month.unwrap_or(1);
            let candidate =
                clamped_date(after.year(), after.month(), target_day)?.and_hms_opt(hour, minute, 0)?;
            if candidate > after_naive {
                candidate
            } else {
                let (year, month) = if after.month() == 12 {
                    (after.year() + 1, 1)
                } else {
                    (after.year(), after.month() + 1)
                };
                clamped_date(year, month, target_day)?.and_hms_opt(hour, minute, 0)?
            }
        }
        RecurrenceFrequency::Yearly => {
            let target_month = pattern.month.unwrap_or(1).clamp(1, 12);
            let target_day = pattern.day_of_month.unwrap_or(1);
            let candidate = clamped_date(after.year(), target_month, target_day)?
                .and_hms_opt(hour, minute, 0)?;
            if candidate > after_naive {
                candidate
            } else {
                clamped_date(after.year() + 1, target_month, target_day)?
                    .and_hms_opt(hour, minute, 0)?
            }
        }
    };

    Some(Utc.from_utc_datetime(&next))
}

/// `day` clamped to the month's actual last day (Jan 31 recurring lands
/// on Feb 28/29, Apr 30, ...).
fn clamped_date(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    let last = days_in_month(year, month)?;
    NaiveDate::from_ymd_opt(year, month, day.clamp(1, last))
}

fn days_in_month(year: i32, month: u32) -> Option<u32> {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => Some(31),
        4 | 6 | 9 | 11 => Some(30),
        2 => Some(if NaiveDate::from_ymd_opt(year, 2, 29).is_some() {
            29
        } else {
            28
        }),
        _ => None,
    }
}

/// Parse "HH:MM".
fn parse_time(time_str: &str) -> Option<(u32, u32)> {
    let (h, m) = time_str.split_once(':')?;
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::task_run::RecurrenceFrequency::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn pattern(frequency: RecurrenceFrequency, time: &str) -> RecurrencePattern {
        RecurrencePattern {
            frequency,
            time: time.into(),
            interval: 1,
            days_of_week: None,
            day_of_month: None,
            month: None,
        }
    }

    #[test]
    fn daily_same_day_when_time_not_passed() {
        let p = pattern(Daily, "09:00");
        let next = next_occurrence(&p, at(2025, 6, 10, 8, 0)).unwrap();
        assert_eq!(next, at(2025, 6, 10, 9, 0));
    }

    #[test]
    fn daily_advances_by_interval_when_time_passed() {
        let mut p = pattern(Daily, "09:00");
        p.interval = 3;
        let next = next_occurrence(&p, at(2025, 6, 10, 10, 0)).unwrap();
        assert_eq!(next, at(2025, 6, 13, 9, 0));
    }

    #[test]
    fn weekly_tuesday_morning_rolls_to_wednesday() {
        // 2025-06-10 is a Tuesday; days 1/3/5 are Mon/Wed/Fri.
        let mut p = pattern(Weekly, "09:00");
        p.days_of_week = Some(vec![1, 3, 5]);
        let next = next_occurrence(&p, at(2025, 6, 10, 10, 0)).unwrap();
        assert_eq!(next, at(2025, 6, 11, 9, 0));
    }

    #[test]
    fn weekly_same_day_counts_when_time_not_passed() {
        // 2025-06-09 is a Monday.
        let mut p = pattern(Weekly, "09:00");
        p.days_of_week = Some(vec![1]);
        let next = next_occurrence(&p, at(2025, 6, 9, 8, 0)).unwrap();
        assert_eq!(next, at(2025, 6, 9, 9, 0));
    }

    #[test]
    fn weekly_single_day_jumps_a_full_cycle() {
        let mut p = pattern(Weekly, "09:00");
        p.days_of_week = Some(vec![1]);
        p.interval = 2;
        let next = next_occurrence(&p, at(2025, 6, 9, 10, 0)).unwrap();
        assert_eq!(next, at(2025, 6, 23, 9, 0));
    }

    #[test]
    fn monthly_clamps_to_short_months() {
        let mut p = pattern(Monthly, "09:00");
        p.day_of_month = Some(31);
        let next = next_occurrence(&p, at(2025, 1, 31, 12, 0)).unwrap();
        assert_eq!(next, at(2025, 2, 28, 9, 0));
    }

    #[test]
    fn yearly_clamps_leap_day() {
        let mut p = pattern(Yearly, "09:00");
        p.month = Some(2);
        p.day_of_month = Some(29);
        let next = next_occurrence(&p, at(2024, 3, 1, 0, 0)).unwrap();
        assert_eq!(next, at(2025, 2, 28, 9, 0));
    }

    #[test]
    fn result_is_strictly_after_reference() {
        let mut weekly = pattern(Weekly, "00:00");
        weekly.days_of_week = Some(vec![0, 2, 4, 6]);
        let mut monthly = pattern(Monthly, "23:59");
        monthly.day_of_month = Some(1);
        let patterns = [pattern(Daily, "00:00"), weekly, monthly];

        for p in &patterns {
            let mut t = at(2025, 1, 1, 0, 0);
            for _ in 0..50 {
                let next = next_occurrence(p, t).unwrap();
                assert!(next > t, "{:?} produced {} <= {}", p.frequency, next, t);
                t = next;
            }
        }
    }

    #[test]
    fn deterministic_for_same_inputs() {
        let mut p = pattern(Weekly, "09:00");
        p.days_of_week = Some(vec![1, 3, 5]);
        let reference = at(2025, 6, 10, 10, 0);
        assert_eq!(
            next_occurrence(&p, reference),
            next_occurrence(&p, reference)
        );
    }

    #[test]
    fn rejects_malformed_time() {
        let p = pattern(Daily, "25:00");
        assert!(next_occurrence(&p, at(2025, 6, 10, 8, 0)).is_none());
    }
}
