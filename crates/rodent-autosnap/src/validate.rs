//! Schedule and policy validation
//!
//! Total functions: every input yields success or a typed validation error,
//! never a panic. All admission paths route through here.

use crate::policy::{ScheduleKind, ScheduleSpec, SnapshotPolicy};
use rodent_core::{Error, Result};

/// Maximum schedules per policy.
pub const MAX_SCHEDULES: usize = 5;

/// Parse `H[:M[:S]]` with each field in canonical range.
pub(crate) fn parse_at_time(at_time: &str) -> Result<(u32, u32, u32)> {
    let mut parts = at_time.split(':');
    let hour = parse_time_field(parts.next(), "hour", 23, at_time)?;
    let minute = match parts.next() {
        Some(m) => parse_time_field(Some(m), "minute", 59, at_time)?,
        None => 0,
    };
    let second = match parts.next() {
        Some(s) => parse_time_field(Some(s), "second", 59, at_time)?,
        None => 0,
    };
    if parts.next().is_some() {
        return Err(Error::validation(format!(
            "invalid at_time '{}': expected H[:M[:S]]",
            at_time
        )));
    }
    Ok((hour, minute, second))
}

fn parse_time_field(field: Option<&str>, name: &str, max: u32, raw: &str) -> Result<u32> {
    let field = field.unwrap_or_default();
    let value: u32 = field.parse().map_err(|_| {
        Error::validation(format!("invalid at_time '{}': bad {} field", raw, name))
    })?;
    if value > max {
        return Err(Error::validation(format!(
            "invalid at_time '{}': {} must be 0-{}",
            raw, name, max
        )));
    }
    Ok(value)
}

fn require_at_time(at_time: &str, kind: &str) -> Result<()> {
    parse_at_time(at_time)
        .map(|_| ())
        .map_err(|err| Error::validation(format!("{} schedule: {}", kind, err)))
}

fn require_day_of_month(day_of_month: u8, kind: &str) -> Result<()> {
    if !(1..=31).contains(&day_of_month) {
        return Err(Error::validation(format!(
            "{} schedule requires day_of_month 1-31, got {}",
            kind, day_of_month
        )));
    }
    Ok(())
}

/// Validate a single schedule specification.
pub fn validate_schedule(spec: &ScheduleSpec) -> Result<()> {
    match &spec.kind {
        ScheduleKind::Secondly { interval }
        | ScheduleKind::Minutely { interval }
        | ScheduleKind::Hourly { interval } => {
            if *interval == 0 {
                return Err(Error::validation(format!(
                    "{} schedule requires interval > 0",
                    spec.kind.name()
                )));
            }
        }
        ScheduleKind::Daily { at_time, .. } => {
            require_at_time(at_time, "daily")?;
        }
        ScheduleKind::Weekly {
            at_time, week_day, ..
        } => {
            require_at_time(at_time, "weekly")?;
            if *week_day > 6 {
                return Err(Error::validation(format!(
                    "weekly schedule requires week_day 0-6, got {}",
                    week_day
                )));
            }
        }
        ScheduleKind::Monthly {
            at_time,
            day_of_month,
            ..
        } => {
            require_at_time(at_time, "monthly")?;
            require_day_of_month(*day_of_month, "monthly")?;
        }
        ScheduleKind::Yearly {
            at_time,
            day_of_month,
            month,
        } => {
            require_at_time(at_time, "yearly")?;
            require_day_of_month(*day_of_month, "yearly")?;
            if !(1..=12).contains(month) {
                return Err(Error::validation(format!(
                    "yearly schedule requires month 1-12, got {}",
                    month
                )));
            }
        }
        ScheduleKind::Onetime => {
            if spec.start_time.is_none() {
                return Err(Error::validation(
                    "onetime schedule requires a start_time",
                ));
            }
        }
        ScheduleKind::Duration { duration } => {
            if *duration == 0 {
                return Err(Error::validation("duration schedule requires duration > 0"));
            }
        }
        ScheduleKind::Random {
            min_duration,
            max_duration,
        } => {
            if *min_duration == 0 || *max_duration == 0 {
                return Err(Error::validation(
                    "random schedule requires min_duration > 0 and max_duration > 0",
                ));
            }
            if min_duration >= max_duration {
                return Err(Error::validation(format!(
                    "random schedule requires min_duration < max_duration, got {} >= {}",
                    min_duration, max_duration
                )));
            }
        }
    }

    if let (Some(start), Some(end)) = (spec.start_time, spec.end_time) {
        if end <= start {
            return Err(Error::validation(
                "schedule end_time must be after start_time",
            ));
        }
    }

    Ok(())
}

/// Validate a whole policy. Schedule failures are re-tagged with the
/// offending index and kind.
pub fn validate_policy(policy: &SnapshotPolicy) -> Result<()> {
    if policy.name.trim().is_empty() {
        return Err(Error::validation("policy name must not be empty"));
    }
    if policy.dataset.trim().is_empty() {
        return Err(Error::validation("policy dataset must not be empty"));
    }
    if policy.schedules.is_empty() || policy.schedules.len() > MAX_SCHEDULES {
        return Err(Error::validation_with(
            format!(
                "policy must declare 1-{} schedules, got {}",
                MAX_SCHEDULES,
                policy.schedules.len()
            ),
            [(
                "schedule_count".to_string(),
                policy.schedules.len().to_string(),
            )],
        ));
    }

    for (index, spec) in policy.schedules.iter().enumerate() {
        if let Err(err) = validate_schedule(spec) {
            return Err(Error::validation_with(
                format!("schedule {}: {}", index, err),
                [
                    ("schedule_index".to_string(), index.to_string()),
                    ("schedule_kind".to_string(), spec.kind.name().to_string()),
                ],
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{RetentionPolicy, ScheduleSpec};
    use chrono::Utc;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn policy_with(schedules: Vec<ScheduleSpec>) -> SnapshotPolicy {
        SnapshotPolicy {
            id: Uuid::new_v4(),
            name: "nightly".to_string(),
            description: String::new(),
            dataset: "tank/data".to_string(),
            schedules,
            recursive: false,
            snap_name_pattern: String::new(),
            retention_policy: RetentionPolicy::default(),
            properties: HashMap::new(),
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_run_at: None,
            last_run_status: String::new(),
            last_run_error: String::new(),
            monitor_status: None,
        }
    }

    #[test]
    fn test_at_time_forms() {
        assert_eq!(parse_at_time("3").unwrap(), (3, 0, 0));
        assert_eq!(parse_at_time("03:15").unwrap(), (3, 15, 0));
        assert_eq!(parse_at_time("23:59:59").unwrap(), (23, 59, 59));
        assert!(parse_at_time("24:00").is_err());
        assert!(parse_at_time("12:60").is_err());
        assert!(parse_at_time("12:00:00:00").is_err());
        assert!(parse_at_time("").is_err());
        assert!(parse_at_time("noon").is_err());
    }

    #[test]
    fn test_cadence_requires_interval() {
        let spec = ScheduleSpec::new(ScheduleKind::Secondly { interval: 0 });
        assert!(validate_schedule(&spec).is_err());
        let spec = ScheduleSpec::new(ScheduleKind::Hourly { interval: 4 });
        assert!(validate_schedule(&spec).is_ok());
    }

    #[test]
    fn test_weekly_bounds() {
        let spec = ScheduleSpec::new(ScheduleKind::Weekly {
            interval: 1,
            at_time: "04:00".to_string(),
            week_day: 7,
        });
        assert!(validate_schedule(&spec).is_err());
    }

    #[test]
    fn test_yearly_bounds() {
        let mut spec = ScheduleSpec::new(ScheduleKind::Yearly {
            at_time: "00:30".to_string(),
            day_of_month: 29,
            month: 2,
        });
        assert!(validate_schedule(&spec).is_ok());
        spec.kind = ScheduleKind::Yearly {
            at_time: "00:30".to_string(),
            day_of_month: 0,
            month: 2,
        };
        assert!(validate_schedule(&spec).is_err());
    }

    #[test]
    fn test_onetime_requires_start() {
        let spec = ScheduleSpec::new(ScheduleKind::Onetime);
        assert!(validate_schedule(&spec).is_err());
        let mut spec = ScheduleSpec::new(ScheduleKind::Onetime);
        spec.start_time = Some(Utc::now());
        assert!(validate_schedule(&spec).is_ok());
    }

    #[test]
    fn test_random_ordering() {
        let spec = ScheduleSpec::new(ScheduleKind::Random {
            min_duration: 60,
            max_duration: 60,
        });
        assert!(validate_schedule(&spec).is_err());
        let spec = ScheduleSpec::new(ScheduleKind::Random {
            min_duration: 30,
            max_duration: 90,
        });
        assert!(validate_schedule(&spec).is_ok());
    }

    #[test]
    fn test_policy_schedule_count() {
        let one = ScheduleSpec::new(ScheduleKind::Hourly { interval: 1 });
        assert!(validate_policy(&policy_with(vec![])).is_err());
        assert!(validate_policy(&policy_with(vec![one.clone(); 6])).is_err());
        assert!(validate_policy(&policy_with(vec![one; 5])).is_ok());
    }

    #[test]
    fn test_policy_schedule_error_carries_index() {
        let bad = ScheduleSpec::new(ScheduleKind::Minutely { interval: 0 });
        let good = ScheduleSpec::new(ScheduleKind::Hourly { interval: 1 });
        let err = validate_policy(&policy_with(vec![good, bad])).unwrap_err();
        let meta = err.metadata();
        assert_eq!(meta.get("schedule_index").unwrap(), "1");
        assert_eq!(meta.get("schedule_kind").unwrap(), "minutely");
    }

    #[test]
    fn test_empty_name_and_dataset() {
        let mut p = policy_with(vec![ScheduleSpec::new(ScheduleKind::Hourly { interval: 1 })]);
        p.name = "  ".to_string();
        assert!(validate_policy(&p).is_err());
        p.name = "ok".to_string();
        p.dataset = String::new();
        assert!(validate_policy(&p).is_err());
    }

    #[test]
    fn test_window_ordering() {
        let mut spec = ScheduleSpec::new(ScheduleKind::Secondly { interval: 1 });
        spec.start_time = Some(Utc::now());
        spec.end_time = spec.start_time;
        assert!(validate_schedule(&spec).is_err());
    }
}
