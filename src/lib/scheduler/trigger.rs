use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::lib::error::{OrchestratorError, Result};

/// When a scheduled task fires next.
#[derive(Debug, Clone)]
pub enum Trigger {
    Cron(Box<Schedule>),
    Interval(Duration),
}

impl Trigger {
    /// Five-field cron expressions take precedence; anything else must be an
    /// `<integer><s|m|h|d>` interval.
    pub fn parse(schedule: &str) -> Result<Self> {
        if let Some(cron) = parse_cron(schedule) {
            return Ok(Trigger::Cron(Box::new(cron)));
        }
        parse_interval(schedule)
            .map(Trigger::Interval)
            .ok_or_else(|| OrchestratorError::InvalidSchedule(schedule.to_string()))
    }

    /// First fire time strictly after `after`. `None` when a cron expression
    /// has no future occurrence.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Cron(schedule) => schedule.after(&after).next(),
            Trigger::Interval(every) => {
                after.checked_add_signed(chrono::Duration::from_std(*every).ok()?)
            }
        }
    }
}

fn parse_cron(schedule: &str) -> Option<Schedule> {
    let fields: Vec<&str> = schedule.split_whitespace().collect();
    let [minute, hour, day, month, weekday] = fields.as_slice() else {
        return None;
    };
    // The cron crate wants a leading seconds field and counts weekdays from
    // Sunday = 1.
    let expr = format!(
        "0 {minute} {hour} {day} {month} {}",
        shift_weekdays(weekday)
    );
    Schedule::from_str(&expr).ok()
}

/// Rewrites crontab weekday numbers (0-7, Sunday = 0 or 7) for the cron crate.
fn shift_weekdays(field: &str) -> String {
    let shift = |n: &str| match n.parse::<u8>() {
        Ok(7) => "1".to_string(),
        Ok(n) => (n + 1).to_string(),
        Err(_) => n.to_string(),
    };

    field
        .split(',')
        .map(|item| {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (item, None),
            };
            let mut shifted = match range.split_once('-') {
                Some((from, "7")) => format!("{}-7", shift(from)),
                Some((from, to)) => format!("{}-{}", shift(from), shift(to)),
                None => shift(range),
            };
            if let Some(step) = step {
                shifted = format!("{shifted}/{step}");
            } else if range.ends_with("-7") {
                shifted.push_str(",1");
            }
            shifted
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// `30s`, `5m`, `2h`, `1d`. Zero-length intervals are rejected.
pub fn parse_interval(schedule: &str) -> Option<Duration> {
    let schedule = schedule.trim();
    let unit = schedule.chars().last()?;
    let digits = &schedule[..schedule.len() - unit.len_utf8()];
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let multiplier = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86_400,
        _ => return None,
    };
    let seconds = digits.parse::<u64>().ok()?.checked_mul(multiplier)?;
    (seconds > 0).then(|| Duration::from_secs(seconds))
}
