//! Standard five-field cron (`min hour dom month dow`) on top of the `cron`
//! crate, which wants a leading seconds field. `schedule_create` and the
//! driver's own tick both go through [`parse`] so an invalid expression is
//! rejected the same way in both places.

use super::error::SchedulerError;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

pub fn parse(expression: &str) -> Result<Schedule, SchedulerError> {
    let with_seconds = format!("0 {expression}");
    Schedule::from_str(&with_seconds).map_err(|source| SchedulerError::InvalidCron {
        expression: expression.to_string(),
        source: source.to_string(),
    })
}

/// Validates without keeping the parsed schedule around; used by
/// `schedule_create` to fail fast before persisting.
pub fn validate(expression: &str) -> Result<(), SchedulerError> {
    parse(expression).map(|_| ())
}

/// The next fire time strictly after `after`, or `None` if the schedule
/// never fires again (never happens for a well-formed cron expression, but
/// `cron::Schedule` is an infinite iterator so this stays an `Option` to
/// match its API).
pub fn next_after(expression: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, SchedulerError> {
    let schedule = parse(expression)?;
    Ok(schedule.after(&after).next())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_standard_five_field_expression() {
        assert!(validate("0 8 * * *").is_ok());
        assert!(validate("*/15 * * * *").is_ok());
    }

    #[test]
    fn rejects_garbage() {
        assert!(validate("not a cron expression").is_err());
    }

    #[test]
    fn computes_next_fire_strictly_after_the_given_instant() {
        let now = Utc::now();
        let next = next_after("* * * * *", now).unwrap().unwrap();
        assert!(next > now);
    }
}
