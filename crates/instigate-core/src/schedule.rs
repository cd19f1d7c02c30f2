//! Cron recurrences and schedule due-ness.
//!
//! Expressions may be written in the 5-field unix form
//! (`min hour dom month dow`) or the 6/7-field form the `cron` crate parses
//! natively (`sec min hour dom month dow [year]`). In the 5-field form the
//! day-of-week field uses unix numbering (0 or 7 = Sunday) and is translated
//! to the `cron` crate's numbering (1 = Sunday).

use crate::error::{InstigateError, Result};
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use std::collections::VecDeque;
use std::str::FromStr;

/// Lookback windows tried in order when collecting due boundaries. Most
/// schedules find their latest boundaries in the first window.
const LOOKBACK_DAYS: [Option<i64>; 4] = [Some(1), Some(30), Some(400), None];

/// Upper bound on boundaries returned by one `due_ticks` call.
pub const MAX_CATCHUP_TICKS: u32 = 1000;

#[derive(Debug, Clone)]
pub struct Recurrence {
    expression: String,
    schedule: Schedule,
    timezone: Tz,
}

impl Recurrence {
    pub fn parse(cron: &str, timezone: &str) -> Result<Self> {
        let normalized = normalize_expression(cron).map_err(|reason| {
            InstigateError::InvalidSchedule {
                cron: cron.to_string(),
                reason,
            }
        })?;
        let schedule =
            Schedule::from_str(&normalized).map_err(|e| InstigateError::InvalidSchedule {
                cron: cron.to_string(),
                reason: e.to_string(),
            })?;
        let timezone: Tz = timezone
            .parse()
            .map_err(|_| InstigateError::InvalidSchedule {
                cron: cron.to_string(),
                reason: format!("unknown timezone '{timezone}'"),
            })?;
        Ok(Self {
            expression: cron.to_string(),
            schedule,
            timezone,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// First boundary strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Boundaries in `(position, now]`, keeping only the latest `max`,
    /// oldest first. `max` is clamped to `1..=MAX_CATCHUP_TICKS`.
    pub fn due_ticks(
        &self,
        position: DateTime<Utc>,
        now: DateTime<Utc>,
        max: u32,
    ) -> Vec<DateTime<Utc>> {
        let max = max.clamp(1, MAX_CATCHUP_TICKS) as usize;
        if position >= now {
            return Vec::new();
        }
        for lookback in LOOKBACK_DAYS {
            let start = match lookback {
                Some(days) => (now - Duration::days(days)).max(position),
                None => position,
            };
            let ticks = self.collect_latest(start, now, max);
            if ticks.len() >= max || start == position {
                return ticks;
            }
        }
        Vec::new()
    }

    fn collect_latest(
        &self,
        start: DateTime<Utc>,
        now: DateTime<Utc>,
        max: usize,
    ) -> Vec<DateTime<Utc>> {
        let now_tz = now.with_timezone(&self.timezone);
        let mut latest = VecDeque::new();
        for t in self
            .schedule
            .after(&start.with_timezone(&self.timezone))
            .take_while(|t| *t <= now_tz)
        {
            if latest.len() == max {
                latest.pop_front();
            }
            latest.push_back(t.with_timezone(&Utc));
        }
        latest.into_iter().collect()
    }
}

fn normalize_expression(expr: &str) -> std::result::Result<String, String> {
    let expr = expr.trim();
    if expr.starts_with('@') {
        return Ok(expr.to_string());
    }
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => {
            let dow = translate_unix_dow(fields[4])?;
            Ok(format!(
                "0 {} {} {} {} {}",
                fields[0], fields[1], fields[2], fields[3], dow
            ))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(format!("expected 5, 6 or 7 fields, found {n}")),
    }
}

/// Map unix day-of-week numbers (0-7, Sunday = 0 or 7) onto 1-7 with
/// Sunday = 1. Names and `*`/`?` pass through.
fn translate_unix_dow(field: &str) -> std::result::Result<String, String> {
    let mut items = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((r, s)) => (r, Some(s)),
            None => (item, None),
        };
        let translated = match range.split_once('-') {
            Some((a, b)) => match (a.parse::<u8>(), b.parse::<u8>()) {
                (Ok(a), Ok(b)) => {
                    if a > 7 || b > 7 {
                        return Err(format!("day-of-week out of range in '{item}'"));
                    }
                    let start = a % 7 + 1;
                    if b == 7 {
                        // Saturday..Sunday wraps in the target numbering.
                        if start == 1 {
                            "1-7".to_string()
                        } else if start == 7 {
                            "7,1".to_string()
                        } else {
                            format!("{start}-7,1")
                        }
                    } else {
                        format!("{start}-{}", b + 1)
                    }
                }
                _ => range.to_string(),
            },
            None => match range.parse::<u8>() {
                Ok(n) if n <= 7 => (n % 7 + 1).to_string(),
                Ok(_) => return Err(format!("day-of-week out of range in '{item}'")),
                Err(_) => range.to_string(),
            },
        };
        match step {
            Some(s) if !translated.contains(',') => items.push(format!("{translated}/{s}")),
            Some(_) => return Err(format!("unsupported day-of-week step in '{item}'")),
            None => items.push(translated),
        }
    }
    Ok(items.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};
    use proptest::prelude::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn hourly_after_last_tick_yields_one() {
        let r = Recurrence::parse("0 * * * *", "UTC").unwrap();
        let due = r.due_ticks(utc(2024, 5, 1, 9, 0), utc(2024, 5, 1, 10, 1), 1);
        assert_eq!(due, vec![utc(2024, 5, 1, 10, 0)]);
    }

    #[test]
    fn nothing_due_before_next_boundary() {
        let r = Recurrence::parse("0 * * * *", "UTC").unwrap();
        assert!(r
            .due_ticks(utc(2024, 5, 1, 10, 0), utc(2024, 5, 1, 10, 59), 1)
            .is_empty());
    }

    #[test]
    fn catchup_keeps_latest_oldest_first() {
        let r = Recurrence::parse("0 * * * *", "UTC").unwrap();
        let due = r.due_ticks(utc(2024, 5, 1, 0, 0), utc(2024, 5, 1, 6, 30), 3);
        assert_eq!(
            due,
            vec![
                utc(2024, 5, 1, 4, 0),
                utc(2024, 5, 1, 5, 0),
                utc(2024, 5, 1, 6, 0)
            ]
        );
    }

    #[test]
    fn oversized_catchup_is_clamped() {
        let r = Recurrence::parse("0 * * * *", "UTC").unwrap();
        let due = r.due_ticks(utc(2024, 5, 1, 9, 0), utc(2024, 5, 1, 10, 1), u32::MAX);
        assert_eq!(due, vec![utc(2024, 5, 1, 10, 0)]);

        let minutely = Recurrence::parse("* * * * *", "UTC").unwrap();
        let due = minutely.due_ticks(utc(2024, 4, 1, 0, 0), utc(2024, 5, 1, 0, 0), u32::MAX);
        assert_eq!(due.len(), MAX_CATCHUP_TICKS as usize);
        assert_eq!(due.last(), Some(&utc(2024, 5, 1, 0, 0)));
    }

    #[test]
    fn sparse_schedule_found_beyond_first_window() {
        // Yearly on Jan 1st; position two years back.
        let r = Recurrence::parse("0 0 1 1 *", "UTC").unwrap();
        let due = r.due_ticks(utc(2022, 6, 1, 0, 0), utc(2024, 3, 1, 0, 0), 5);
        assert_eq!(due, vec![utc(2023, 1, 1, 0, 0), utc(2024, 1, 1, 0, 0)]);
    }

    #[test]
    fn six_field_form_accepted() {
        let r = Recurrence::parse("0 0 10 * * *", "UTC").unwrap();
        assert_eq!(
            r.next_after(utc(2024, 5, 1, 9, 0)),
            Some(utc(2024, 5, 1, 10, 0))
        );
    }

    #[test]
    fn timezone_shifts_boundaries() {
        let r = Recurrence::parse("0 9 * * *", "America/New_York").unwrap();
        // 09:00 EDT == 13:00 UTC
        assert_eq!(
            r.next_after(utc(2024, 7, 1, 0, 0)),
            Some(utc(2024, 7, 1, 13, 0))
        );
    }

    #[test]
    fn unix_weekdays_translate() {
        // Monday to Friday at noon.
        let r = Recurrence::parse("0 12 * * 1-5", "UTC").unwrap();
        // 2024-05-04 is a Saturday.
        let next = r.next_after(utc(2024, 5, 4, 0, 0)).unwrap();
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next.hour(), 12);

        let sunday = Recurrence::parse("0 0 * * 0", "UTC").unwrap();
        assert_eq!(
            sunday.next_after(utc(2024, 5, 1, 0, 0)).unwrap().weekday(),
            Weekday::Sun
        );
        let sunday7 = Recurrence::parse("0 0 * * 7", "UTC").unwrap();
        assert_eq!(
            sunday7.next_after(utc(2024, 5, 1, 0, 0)).unwrap().weekday(),
            Weekday::Sun
        );
    }

    #[test]
    fn weekend_range_wraps() {
        assert_eq!(translate_unix_dow("6-7").unwrap(), "7,1");
        assert_eq!(translate_unix_dow("5-7").unwrap(), "6-7,1");
        assert_eq!(translate_unix_dow("0-6").unwrap(), "1-7");
        assert_eq!(translate_unix_dow("*/2").unwrap(), "*/2");
        assert_eq!(translate_unix_dow("MON-FRI").unwrap(), "MON-FRI");
        assert!(translate_unix_dow("8").is_err());
    }

    #[test]
    fn invalid_expressions() {
        assert!(Recurrence::parse("* * *", "UTC").is_err());
        assert!(Recurrence::parse("0 * * * *", "Mars/Olympus").is_err());
        assert!(Recurrence::parse("99 * * * *", "UTC").is_err());
    }

    proptest! {
        #[test]
        fn due_ticks_are_bounded_sorted_and_in_window(
            start_min in 0i64..(60 * 24 * 90),
            span_min in 0i64..(60 * 24 * 3),
            max in 1u32..6,
        ) {
            let r = Recurrence::parse("*/15 * * * *", "UTC").unwrap();
            let base = utc(2024, 1, 1, 0, 0);
            let position = base + Duration::minutes(start_min);
            let now = position + Duration::minutes(span_min);
            let due = r.due_ticks(position, now, max);

            prop_assert!(due.len() <= max as usize);
            prop_assert!(due.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(due.iter().all(|t| *t > position && *t <= now));
            // The newest due boundary is the newest boundary at or before now.
            if let Some(last) = due.last() {
                prop_assert!(r.next_after(*last).map_or(true, |n| n > now));
            }
        }
    }
}
