//! Processing windows restricting when a store may run.
//!
//! A window is a time-of-day range in a fixed-offset timezone, optionally
//! limited to a set of weekdays. Windows whose start is later than their end
//! wrap past midnight; the hours after midnight belong to the previous day's
//! window when checking weekdays.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, FixedOffset, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

fn default_timezone() -> String {
    "UTC".to_string()
}

/// Time-of-day restriction on when a store may be scheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingWindow {
    /// Window start as `HH:MM` (inclusive).
    pub start: String,
    /// Window end as `HH:MM` (exclusive).
    pub end: String,
    /// Fixed UTC offset: `UTC`, `Z`, `+02:00`, `-0530` or `UTC+01:00`.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Allowed weekdays, 0 = Sunday through 6 = Saturday. `None` allows all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_of_week: Option<Vec<u8>>,
}

impl ProcessingWindow {
    /// Creates a window in UTC open on every day.
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            timezone: default_timezone(),
            days_of_week: None,
        }
    }

    /// Sets the timezone offset.
    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    /// Restricts the window to the given weekdays (0 = Sunday).
    pub fn with_days(mut self, days: Vec<u8>) -> Self {
        self.days_of_week = Some(days);
        self
    }

    /// Checks that times, timezone and weekdays parse.
    pub fn validate(&self) -> Result<(), String> {
        parse_time(&self.start).ok_or_else(|| format!("invalid start time '{}'", self.start))?;
        parse_time(&self.end).ok_or_else(|| format!("invalid end time '{}'", self.end))?;
        parse_offset(&self.timezone)
            .ok_or_else(|| format!("unsupported timezone '{}'", self.timezone))?;

        if let Some(days) = &self.days_of_week {
            if let Some(day) = days.iter().find(|d| **d > 6) {
                return Err(format!("invalid weekday {} (expected 0-6)", day));
            }
        }

        Ok(())
    }

    /// Returns whether `now` falls inside the window.
    ///
    /// A window that fails to parse is treated as closed.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let (Some(start), Some(end), Some(offset)) = (
            parse_time(&self.start),
            parse_time(&self.end),
            parse_offset(&self.timezone),
        ) else {
            tracing::warn!(
                start = %self.start,
                end = %self.end,
                timezone = %self.timezone,
                "Ignoring unparseable processing window"
            );
            return false;
        };

        let local = now.with_timezone(&offset);
        let time = local.time();

        // Start == end means the window never closes.
        let (inside, after_midnight) = if start == end {
            (true, false)
        } else if start < end {
            (time >= start && time < end, false)
        } else if time >= start {
            (true, false)
        } else {
            (time < end, true)
        };

        if !inside {
            return false;
        }

        let Some(days) = &self.days_of_week else {
            return true;
        };

        let window_day = if after_midnight {
            local - ChronoDuration::days(1)
        } else {
            local
        };
        let weekday = window_day.weekday().num_days_from_sunday() as u8;
        days.contains(&weekday)
    }
}

fn parse_time(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}

/// Parses a fixed UTC offset. Named IANA zones other than UTC are rejected.
fn parse_offset(value: &str) -> Option<FixedOffset> {
    let trimmed = value.trim();
    let upper = trimmed.to_ascii_uppercase();
    if matches!(upper.as_str(), "UTC" | "Z" | "GMT" | "ETC/UTC") {
        return FixedOffset::east_opt(0);
    }

    let rest = upper
        .strip_prefix("UTC")
        .or_else(|| upper.strip_prefix("GMT"))
        .unwrap_or(&upper);

    let (sign, digits) = match rest.chars().next()? {
        '+' => (1, &rest[1..]),
        '-' => (-1, &rest[1..]),
        _ => return None,
    };

    let digits: String = digits.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    if hours > 14 || minutes > 59 {
        return None;
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}
