//! Trigger calculation: when does a schedule fire next?
//!
//! Pure functions of `(trigger, anchor, now)`; nothing here reads a clock.
//!
//! | Mode          | Next run                                                        |
//! |---------------|-----------------------------------------------------------------|
//! | Interval      | first `anchor + k·interval` strictly after `now` (k ≥ 1)        |
//! | Active hours  | first top-of-hour strictly after `now` inside `[start, end)`    |
//!
//! Missed interval slots are skipped, not replayed: a process that was down
//! for three intervals resumes on the next future slot.

use chrono::{DateTime, Duration, Timelike, Utc};

use crate::{
    error::{Result, SchedulerError},
    types::{ActiveHours, ScheduleConfig, Trigger},
};

/// Compute the next fire time for `trigger`.
///
/// `anchor` is the last completion time; `None` means the schedule never
/// ran, in which case the first interval starts at `now`. Window triggers
/// ignore the anchor.
pub fn compute_next_run(
    trigger: &Trigger,
    anchor: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    trigger.validate()?;
    match trigger.active_hours {
        Some(window) => next_window_hour(window, now),
        None => next_interval_slot(trigger.period(), anchor, now),
    }
}

/// Next run of a stored schedule, anchored on its `last_run`.
pub fn next_run_for(config: &ScheduleConfig, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    compute_next_run(&config.trigger(), config.last_run, now)
}

fn next_interval_slot(
    period: Duration,
    anchor: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let Some(anchor) = anchor else {
        return add(now, period);
    };
    let first = add(anchor, period)?;
    if first > now {
        return Ok(first);
    }
    let step = period.num_milliseconds().max(1);
    let behind = (now - anchor).num_milliseconds();
    let offset = (behind / step)
        .checked_add(1)
        .and_then(|slots| slots.checked_mul(step))
        .ok_or_else(|| out_of_range(anchor))?;
    add(anchor, Duration::milliseconds(offset))
}

fn add(at: DateTime<Utc>, by: Duration) -> Result<DateTime<Utc>> {
    at.checked_add_signed(by).ok_or_else(|| out_of_range(at))
}

fn out_of_range(at: DateTime<Utc>) -> SchedulerError {
    SchedulerError::InvalidScheduleConfig(format!(
        "next run after {at} is outside the representable time range"
    ))
}

fn next_window_hour(window: ActiveHours, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    window.validate()?;
    let top_of_hour = now
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);

    let mut candidate = top_of_hour + Duration::hours(1);
    for _ in 0..24 {
        if window.contains(candidate.hour()) {
            return Ok(candidate);
        }
        candidate += Duration::hours(1);
    }
    Err(SchedulerError::InvalidScheduleConfig(format!(
        "active hours {window} never fire"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MAX_INTERVAL_HOURS;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, minute, 0).unwrap()
    }

    #[test]
    fn oversized_interval_is_rejected_not_overflowed() {
        let now = at(1, 10, 0);
        for hours in [1e10, f64::MAX, MAX_INTERVAL_HOURS + 1.0] {
            let err = compute_next_run(&Trigger::interval(hours), None, now).unwrap_err();
            assert_eq!(err.code(), "INVALID_SCHEDULE_CONFIG", "{hours}");
        }
        assert!(compute_next_run(&Trigger::interval(MAX_INTERVAL_HOURS), None, now).is_ok());
    }

    #[test]
    fn slot_past_end_of_time_is_an_error() {
        let near_end = DateTime::<Utc>::MAX_UTC - Duration::minutes(30);
        let trigger = Trigger::interval(1.0);
        assert!(compute_next_run(&trigger, None, near_end).is_err());
        assert!(compute_next_run(&trigger, Some(near_end - Duration::hours(3)), near_end).is_err());
    }

    #[test]
    fn first_run_is_one_interval_from_now() {
        let now = at(1, 10, 0);
        let next = compute_next_run(&Trigger::interval(2.0), None, now).unwrap();
        assert_eq!(next, at(1, 12, 0));
    }

    #[test]
    fn anchor_in_recent_past_keeps_cadence() {
        let next =
            compute_next_run(&Trigger::interval(1.0), Some(at(1, 9, 30)), at(1, 10, 0)).unwrap();
        assert_eq!(next, at(1, 10, 30));
    }

    #[test]
    fn missed_slots_jump_to_next_future_slot() {
        // Down from 09:00 to 12:10 with hourly cadence: next is 13:00, not 10:00.
        let next =
            compute_next_run(&Trigger::interval(1.0), Some(at(1, 9, 0)), at(1, 12, 10)).unwrap();
        assert_eq!(next, at(1, 13, 0));
    }

    #[test]
    fn slot_equal_to_now_is_not_reused() {
        let next =
            compute_next_run(&Trigger::interval(1.0), Some(at(1, 9, 0)), at(1, 10, 0)).unwrap();
        assert_eq!(next, at(1, 11, 0));
    }

    #[test]
    fn window_after_end_rolls_to_next_day_start() {
        let trigger = Trigger::windowed(1.0, ActiveHours::new(6, 9));
        assert_eq!(compute_next_run(&trigger, None, at(1, 10, 0)).unwrap(), at(2, 6, 0));
    }

    #[test]
    fn window_inside_fires_next_hour() {
        let trigger = Trigger::windowed(1.0, ActiveHours::new(6, 9));
        assert_eq!(compute_next_run(&trigger, None, at(1, 7, 0)).unwrap(), at(1, 8, 0));
        assert_eq!(compute_next_run(&trigger, None, at(1, 7, 45)).unwrap(), at(1, 8, 0));
    }

    #[test]
    fn window_last_hour_rolls_over() {
        let trigger = Trigger::windowed(1.0, ActiveHours::new(6, 9));
        assert_eq!(compute_next_run(&trigger, None, at(1, 8, 15)).unwrap(), at(2, 6, 0));
    }

    #[test]
    fn window_before_start_fires_same_day() {
        let trigger = Trigger::windowed(3.0, ActiveHours::new(6, 9));
        assert_eq!(compute_next_run(&trigger, None, at(1, 5, 59)).unwrap(), at(1, 6, 0));
    }

    #[test]
    fn invalid_triggers_fail() {
        let empty = Trigger::windowed(1.0, ActiveHours::new(9, 9));
        assert!(matches!(
            compute_next_run(&empty, None, at(1, 0, 0)),
            Err(SchedulerError::InvalidScheduleConfig(_))
        ));
        assert!(compute_next_run(&Trigger::interval(0.0), None, at(1, 0, 0)).is_err());
    }

    proptest! {
        #[test]
        fn interval_next_is_future_and_on_grid(
            interval_mins in 1i64..(48 * 60),
            anchor_offset_mins in -(30 * 24 * 60i64)..(60i64),
        ) {
            let now = at(15, 12, 0);
            let anchor = now + Duration::minutes(anchor_offset_mins);
            let trigger = Trigger::interval(interval_mins as f64 / 60.0);
            let next = compute_next_run(&trigger, Some(anchor), now).unwrap();
            prop_assert!(next > now);
            prop_assert!(next > anchor);
            let since_anchor = (next - anchor).num_milliseconds();
            prop_assert_eq!(since_anchor % trigger.period().num_milliseconds(), 0);
            // Never more than one interval ahead of now unless the anchor is ahead.
            if anchor <= now {
                prop_assert!(next - now <= trigger.period());
            }
        }

        #[test]
        fn window_next_is_inside_window_within_a_day(
            start in 0u8..23,
            len in 1u8..23,
            minute_of_day in 0u32..(24 * 60),
        ) {
            let end = (start + len).min(23);
            prop_assume!(start < end);
            let window = ActiveHours::new(start, end);
            let now = at(10, minute_of_day / 60, minute_of_day % 60);
            let next = compute_next_run(&Trigger::windowed(1.0, window), None, now).unwrap();
            prop_assert!(next > now);
            prop_assert!(next - now <= Duration::hours(24));
            prop_assert!(window.contains(next.hour()));
            prop_assert_eq!(next.minute(), 0);
        }
    }
}
