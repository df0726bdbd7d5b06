use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::models::{Task, Timestamp};

// Naive layouts are read as UTC. `%Y-%m-%dT%H:%M` is what a datetime-local input sends.
const NAIVE_DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidDueDate(pub String);

impl fmt::Display for InvalidDueDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "can't parse due date '{}'", self.0)
    }
}

impl std::error::Error for InvalidDueDate {}

pub fn parse_due_date(value: &str) -> Result<Timestamp, InvalidDueDate> {
    let trimmed = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(parsed.and_utc());
        }
    }
    NaiveDate::parse_from_str(trimmed, DATE_FORMAT)
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc())
        .ok_or_else(|| InvalidDueDate(value.to_string()))
}

/// Ascending by due date; equal due dates keep creation order.
pub fn sort_by_due_date(tasks: &mut [Task]) {
    tasks.sort_by_key(|task| (task.due_date, task.id));
}
