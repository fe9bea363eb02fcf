//! Validated schedule triggers built from persisted records.

use std::time::Duration;

use chrono::{Datelike, NaiveDateTime, NaiveTime, Timelike, Weekday};
use tracing::warn;

use crate::error::ScheduleEvaluationError;
use crate::store::{ScheduleRecord, MINUTE_FORMAT, TIMESTAMP_FORMAT};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneStep {
    pub device_id: String,
    pub duration: Duration,
}

impl ZoneStep {
    pub fn minutes(&self) -> u64 {
        self.duration.as_secs() / 60
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub id: u64,
    pub program_name: String,
    pub start_time: NaiveTime,
    pub days_of_week: Vec<Weekday>,
    pub steps: Vec<ZoneStep>,
}

impl Trigger {
    /// Due when today is a scheduled day and the wall clock is inside the
    /// start minute.
    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        self.days_of_week.contains(&now.weekday())
            && now.hour() == self.start_time.hour()
            && now.minute() == self.start_time.minute()
    }

    pub fn total_duration(&self) -> Duration {
        self.steps.iter().map(|s| s.duration).sum()
    }
}

impl TryFrom<&ScheduleRecord> for Trigger {
    type Error = ScheduleEvaluationError;

    fn try_from(record: &ScheduleRecord) -> Result<Self, Self::Error> {
        let fail = |reason: String| ScheduleEvaluationError {
            id: record.id,
            program: record.name.clone(),
            reason,
        };

        let start_time = NaiveTime::parse_from_str(record.start.trim(), "%H:%M")
            .map_err(|_| fail(format!("invalid start time '{}'", record.start)))?;

        let mut days_of_week = Vec::with_capacity(record.days.len());
        for day in &record.days {
            let wd: Weekday = day
                .trim()
                .parse()
                .map_err(|_| fail(format!("unknown day '{day}'")))?;
            if !days_of_week.contains(&wd) {
                days_of_week.push(wd);
            }
        }
        if days_of_week.is_empty() {
            return Err(fail("no days selected".into()));
        }

        let steps: Vec<ZoneStep> = record
            .sequence
            .iter()
            .enumerate()
            .filter_map(|(i, step)| {
                if step.key.trim().is_empty() || step.mins == 0 {
                    warn!(
                        schedule = record.id,
                        step = i + 1,
                        key = %step.key,
                        mins = step.mins,
                        "dropping empty schedule step"
                    );
                    return None;
                }
                Some(ZoneStep {
                    device_id: step.key.trim().to_string(),
                    duration: Duration::from_secs(u64::from(step.mins) * 60),
                })
            })
            .collect();
        if steps.is_empty() {
            return Err(fail("no runnable steps".into()));
        }

        Ok(Self {
            id: record.id,
            program_name: record.name.clone(),
            start_time,
            days_of_week,
            steps,
        })
    }
}

/// True when the record already ran or was skipped in `now`'s minute.
pub fn handled_this_minute(record: &ScheduleRecord, now: NaiveDateTime) -> bool {
    let same_minute = |t: NaiveDateTime| {
        t.date() == now.date() && t.hour() == now.hour() && t.minute() == now.minute()
    };

    let ran = record
        .last_run
        .as_deref()
        .and_then(|s| NaiveDateTime::parse_from_str(s, MINUTE_FORMAT).ok())
        .is_some_and(same_minute);
    let skipped = record
        .last_skipped
        .as_ref()
        .and_then(|s| NaiveDateTime::parse_from_str(&s.time, TIMESTAMP_FORMAT).ok())
        .is_some_and(same_minute);
    ran || skipped
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SkipSummary, StepRecord};
    use chrono::NaiveDate;

    fn morning_lawn() -> ScheduleRecord {
        ScheduleRecord {
            id: 1,
            name: "Morning Lawn".into(),
            start: "06:00".into(),
            days: vec!["Mon".into(), "Wed".into(), "Fri".into()],
            sequence: vec![
                StepRecord { key: "R1".into(), mins: 10 },
                StepRecord { key: "R2".into(), mins: 5 },
            ],
            ..ScheduleRecord::default()
        }
    }

    /// 2025-01-01 is a Wednesday.
    fn wed(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 1, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn valid_record_parses() {
        let t = Trigger::try_from(&morning_lawn()).unwrap();
        assert_eq!(t.program_name, "Morning Lawn");
        assert_eq!(t.days_of_week, vec![Weekday::Mon, Weekday::Wed, Weekday::Fri]);
        assert_eq!(t.steps.len(), 2);
        assert_eq!(t.steps[0].minutes(), 10);
        assert_eq!(t.total_duration(), Duration::from_secs(15 * 60));
    }

    #[test]
    fn full_day_names_accepted() {
        let mut r = morning_lawn();
        r.days = vec!["monday".into(), "Wednesday".into()];
        let t = Trigger::try_from(&r).unwrap();
        assert_eq!(t.days_of_week, vec![Weekday::Mon, Weekday::Wed]);
    }

    #[test]
    fn bad_start_time_rejected() {
        let mut r = morning_lawn();
        r.start = "25:00".into();
        let err = Trigger::try_from(&r).unwrap_err();
        assert!(err.reason.contains("invalid start time"));
        assert_eq!(err.program, "Morning Lawn");
    }

    #[test]
    fn unknown_day_rejected() {
        let mut r = morning_lawn();
        r.days.push("Funday".into());
        assert!(Trigger::try_from(&r).unwrap_err().reason.contains("Funday"));
    }

    #[test]
    fn no_days_rejected() {
        let mut r = morning_lawn();
        r.days.clear();
        assert!(Trigger::try_from(&r).is_err());
    }

    #[test]
    fn empty_steps_dropped() {
        let mut r = morning_lawn();
        r.sequence.insert(0, StepRecord { key: "".into(), mins: 4 });
        r.sequence.push(StepRecord { key: "R3".into(), mins: 0 });
        let t = Trigger::try_from(&r).unwrap();
        let ids: Vec<_> = t.steps.iter().map(|s| s.device_id.as_str()).collect();
        assert_eq!(ids, ["R1", "R2"]);
    }

    #[test]
    fn all_steps_empty_rejected() {
        let mut r = morning_lawn();
        r.sequence = vec![StepRecord { key: "R1".into(), mins: 0 }];
        assert!(Trigger::try_from(&r).unwrap_err().reason.contains("no runnable steps"));
    }

    // -- Due check --------------------------------------------------------

    #[test]
    fn due_only_in_start_minute_on_listed_days() {
        let t = Trigger::try_from(&morning_lawn()).unwrap();
        assert!(t.is_due(wed(6, 0, 0)));
        assert!(t.is_due(wed(6, 0, 59)));
        assert!(!t.is_due(wed(6, 1, 0)));
        assert!(!t.is_due(wed(5, 59, 59)));

        let tuesday = wed(6, 0, 5) - chrono::Duration::days(1);
        assert!(!t.is_due(tuesday));
    }

    // -- Minute window ----------------------------------------------------

    #[test]
    fn last_run_marks_minute_handled() {
        let mut r = morning_lawn();
        assert!(!handled_this_minute(&r, wed(6, 0, 10)));
        r.last_run = Some("2025-01-01 06:00".into());
        assert!(handled_this_minute(&r, wed(6, 0, 10)));
        assert!(!handled_this_minute(&r, wed(6, 1, 0)));
        // Same time of day, next week.
        assert!(!handled_this_minute(&r, wed(6, 0, 10) + chrono::Duration::days(7)));
    }

    #[test]
    fn last_skip_marks_minute_handled() {
        let mut r = morning_lawn();
        r.last_skipped = Some(SkipSummary {
            time: "2025-01-01 06:00:05".into(),
            humidity: 97.0,
            temp: None,
        });
        assert!(handled_this_minute(&r, wed(6, 0, 45)));
    }
}
