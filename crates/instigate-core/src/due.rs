//! When is an instigator due?
//!
//! A schedule is due when a recurrence boundary falls in `(position, now]`,
//! where the position is the later of the committed cursor (the last
//! evaluated boundary) and the moment the status last changed. Boundaries
//! that passed while the schedule was stopped are never fired on restart.
//! A sensor is due when it has never run or its minimum interval has elapsed.

use crate::definition::{InstigatorDefinition, InstigatorKind};
use crate::error::Result;
use crate::evaluation::EvaluationContext;
use crate::schedule::Recurrence;
use crate::state::InstigatorState;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Due {
    /// Boundaries to evaluate, oldest first.
    Schedule(Vec<DateTime<Utc>>),
    Sensor,
}

/// Where a schedule resumes from.
pub fn schedule_position(state: &InstigatorState) -> DateTime<Utc> {
    match state.cursor.as_deref() {
        Some(c) => match DateTime::parse_from_rfc3339(c) {
            Ok(t) => t.with_timezone(&Utc).max(state.status_changed_at),
            Err(_) => {
                tracing::warn!(
                    instigator = %state.id,
                    cursor = c,
                    "schedule cursor is not a timestamp; resuming from last status change"
                );
                state.status_changed_at
            }
        },
        None => state.status_changed_at,
    }
}

pub fn due_work(
    def: &InstigatorDefinition,
    state: &InstigatorState,
    now: DateTime<Utc>,
) -> Result<Option<Due>> {
    match &def.kind {
        InstigatorKind::Schedule(spec) => {
            let recurrence = Recurrence::parse(&spec.cron, &spec.timezone)?;
            let ticks =
                recurrence.due_ticks(schedule_position(state), now, spec.max_catchup_ticks);
            Ok((!ticks.is_empty()).then_some(Due::Schedule(ticks)))
        }
        InstigatorKind::Sensor(spec) => {
            let due = match state.last_evaluated_at {
                None => true,
                Some(last) => now - last >= spec.minimum_interval(),
            };
            Ok(due.then_some(Due::Sensor))
        }
    }
}

/// Earliest time the instigator could next be evaluated.
pub fn next_tick_at(
    def: &InstigatorDefinition,
    state: &InstigatorState,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    match &def.kind {
        InstigatorKind::Schedule(spec) => {
            let recurrence = Recurrence::parse(&spec.cron, &spec.timezone)?;
            Ok(recurrence.next_after(schedule_position(state)))
        }
        InstigatorKind::Sensor(spec) => Ok(Some(match state.last_evaluated_at {
            Some(last) => last + spec.minimum_interval(),
            None => now,
        })),
    }
}

/// Context for evaluating `def` outside of a tick, as a dry run would. A
/// schedule is handed its next boundary.
pub fn preview_context(
    def: &InstigatorDefinition,
    state: &InstigatorState,
    now: DateTime<Utc>,
) -> Result<EvaluationContext> {
    let scheduled_for = match &def.kind {
        InstigatorKind::Schedule(spec) => Recurrence::parse(&spec.cron, &spec.timezone)?
            .next_after(schedule_position(state)),
        InstigatorKind::Sensor(_) => None,
    };
    Ok(EvaluationContext {
        instigator: def.id.clone(),
        instigator_type: def.instigator_type(),
        job_name: def.job_name.clone(),
        scheduled_for,
        cursor: state.cursor.clone(),
        last_evaluated_at: state.last_evaluated_at,
        evaluation_time: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{InstigatorId, ScheduleSpec, SensorSpec};
    use crate::evaluation::{EvaluationResult, FnEvaluator};
    use crate::state::InstigatorStatus;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    fn hourly() -> InstigatorDefinition {
        InstigatorDefinition::new(
            InstigatorId::new("etl", "repo", "hourly").unwrap(),
            InstigatorKind::Schedule(ScheduleSpec {
                cron: "0 * * * *".into(),
                timezone: "UTC".into(),
                max_catchup_ticks: 1,
            }),
            "job",
            Arc::new(FnEvaluator::new(|_| Ok(EvaluationResult::default()))),
        )
        .unwrap()
    }

    fn sensor(interval: u64) -> InstigatorDefinition {
        InstigatorDefinition::new(
            InstigatorId::new("etl", "repo", "sensor").unwrap(),
            InstigatorKind::Sensor(SensorSpec {
                minimum_interval_seconds: interval,
            }),
            "job",
            Arc::new(FnEvaluator::new(|_| Ok(EvaluationResult::default()))),
        )
        .unwrap()
    }

    fn state(def: &InstigatorDefinition, changed: DateTime<Utc>) -> InstigatorState {
        InstigatorState::new(def.id.clone(), InstigatorStatus::Running, changed)
    }

    #[test]
    fn schedule_resumes_after_cursor() {
        let def = hourly();
        let mut st = state(&def, at(0, 0));
        st.cursor = Some("2024-05-01T09:00:00Z".into());
        assert_eq!(
            due_work(&def, &st, at(10, 1)).unwrap(),
            Some(Due::Schedule(vec![at(10, 0)]))
        );
        assert_eq!(due_work(&def, &st, at(9, 59)).unwrap(), None);
        assert_eq!(next_tick_at(&def, &st, at(9, 30)).unwrap(), Some(at(10, 0)));
    }

    #[test]
    fn schedule_without_cursor_starts_at_status_change() {
        let def = hourly();
        let st = state(&def, at(9, 30));
        assert_eq!(due_work(&def, &st, at(9, 59)).unwrap(), None);
        assert_eq!(
            due_work(&def, &st, at(10, 0)).unwrap(),
            Some(Due::Schedule(vec![at(10, 0)]))
        );
    }

    #[test]
    fn restart_skips_windows_missed_while_stopped() {
        let def = hourly();
        // Last fired at 01:00, stopped, then started again at 10:30.
        let mut st = state(&def, at(10, 30));
        st.cursor = Some("2024-05-01T01:00:00Z".into());
        assert_eq!(schedule_position(&st), at(10, 30));
        assert_eq!(due_work(&def, &st, at(10, 31)).unwrap(), None);
        assert_eq!(next_tick_at(&def, &st, at(10, 31)).unwrap(), Some(at(11, 0)));
        assert_eq!(
            due_work(&def, &st, at(11, 0)).unwrap(),
            Some(Due::Schedule(vec![at(11, 0)]))
        );
    }

    #[test]
    fn garbage_cursor_falls_back_to_status_change() {
        let def = hourly();
        let mut st = state(&def, at(9, 30));
        st.cursor = Some("not-a-time".into());
        assert_eq!(schedule_position(&st), at(9, 30));
    }

    #[test]
    fn sensor_due_by_interval() {
        let def = sensor(30);
        let mut st = state(&def, at(9, 0));
        assert_eq!(due_work(&def, &st, at(9, 0)).unwrap(), Some(Due::Sensor));

        st.last_evaluated_at = Some(at(9, 0));
        let almost = at(9, 0) + Duration::seconds(29);
        assert_eq!(due_work(&def, &st, almost).unwrap(), None);
        let exactly = at(9, 0) + Duration::seconds(30);
        assert_eq!(due_work(&def, &st, exactly).unwrap(), Some(Due::Sensor));
        assert_eq!(next_tick_at(&def, &st, at(9, 0)).unwrap(), Some(exactly));
    }

    #[test]
    fn preview_targets_next_boundary_with_stored_cursor() {
        let def = hourly();
        let mut st = state(&def, at(0, 0));
        st.cursor = Some("2024-05-01T09:00:00Z".into());
        let ctx = preview_context(&def, &st, at(9, 30)).unwrap();
        assert_eq!(ctx.scheduled_for, Some(at(10, 0)));
        assert_eq!(ctx.cursor.as_deref(), Some("2024-05-01T09:00:00Z"));
        assert_eq!(ctx.evaluation_time, at(9, 30));

        let def = sensor(30);
        let ctx = preview_context(&def, &state(&def, at(0, 0)), at(9, 30)).unwrap();
        assert_eq!(ctx.scheduled_for, None);
        assert_eq!(ctx.job_name, "job");
    }

    proptest! {
        #[test]
        fn sensor_due_iff_interval_elapsed(interval in 1u64..3600, elapsed in 0i64..7200) {
            let def = sensor(interval);
            let mut st = state(&def, at(0, 0));
            st.last_evaluated_at = Some(at(0, 0));
            let now = at(0, 0) + Duration::seconds(elapsed);
            let due = due_work(&def, &st, now).unwrap().is_some();
            prop_assert_eq!(due, elapsed >= interval as i64);
        }

        #[test]
        fn hourly_schedule_yields_at_most_one_boundary(minutes_after in 0i64..600) {
            let def = hourly();
            let mut st = state(&def, at(0, 0));
            st.cursor = Some("2024-05-01T09:00:00Z".into());
            let now = at(9, 0) + Duration::minutes(minutes_after);
            match due_work(&def, &st, now).unwrap() {
                None => prop_assert!(minutes_after < 60),
                Some(Due::Schedule(ticks)) => {
                    prop_assert!(minutes_after >= 60);
                    prop_assert_eq!(ticks.len(), 1);
                    prop_assert!(ticks[0] <= now && now - ticks[0] < Duration::hours(1));
                }
                Some(Due::Sensor) => prop_assert!(false, "schedule reported as sensor"),
            }
        }
    }
}
