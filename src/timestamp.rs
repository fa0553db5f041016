//! Parsing of oracle timestamp ranges into video offsets

use serde::{Deserialize, Serialize};

use crate::error::TimestampError;

/// Half-open range `[start_seconds, end_seconds)` measured from video start
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimestampRange {
    pub start_seconds: f64,
    pub end_seconds: f64,
}

impl TimestampRange {
    pub fn new(start_seconds: f64, end_seconds: f64) -> Self {
        Self {
            start_seconds,
            end_seconds,
        }
    }

    pub fn contains(&self, seconds: f64) -> bool {
        seconds >= self.start_seconds && seconds < self.end_seconds
    }

    pub fn overlaps(&self, other: &TimestampRange) -> bool {
        !(self.end_seconds <= other.start_seconds || self.start_seconds >= other.end_seconds)
    }

    /// Parse `"M:SS"`, `"H:MM:SS"` or a `"start - end"` range of either form.
    ///
    /// A single timestamp becomes a one second wide range.
    pub fn parse(input: &str) -> Result<Self, TimestampError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(malformed(input, "empty timestamp"));
        }

        match split_range(trimmed) {
            Some((start, end)) => {
                let start = clock_to_seconds(start).map_err(|reason| malformed(input, &reason))?;
                let end = clock_to_seconds(end).map_err(|reason| malformed(input, &reason))?;
                if end < start {
                    return Err(malformed(input, "range ends before it starts"));
                }
                Ok(Self::new(start, end))
            }
            None => {
                let start = clock_to_seconds(trimmed).map_err(|reason| malformed(input, &reason))?;
                Ok(Self::new(start, start + 1.0))
            }
        }
    }
}

/// Convenience wrapper returning `(start, end)` seconds
pub fn parse_timestamp_range(input: &str) -> Result<(f64, f64), TimestampError> {
    TimestampRange::parse(input).map(|range| (range.start_seconds, range.end_seconds))
}

/// Format seconds back into `M:SS` (or `H:MM:SS` past the hour)
pub fn format_clock(seconds: f64) -> String {
    let total = seconds.max(0.0).floor() as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{}:{:02}", minutes, secs)
    }
}

fn malformed(input: &str, reason: &str) -> TimestampError {
    TimestampError::MalformedTimestamp {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}

// Ranges are separated by a dash with optional whitespace; clock parts never contain one.
fn split_range(input: &str) -> Option<(&str, &str)> {
    let separator = input.find(|c| c == '-' || c == '–')?;
    let dash_len = input[separator..].chars().next().map_or(1, char::len_utf8);
    let start = input[..separator].trim();
    let end = input[separator + dash_len..].trim();
    Some((start, end))
}

fn clock_to_seconds(clock: &str) -> Result<f64, String> {
    let parts: Vec<&str> = clock.split(':').collect();
    let (hours, minutes, seconds) = match parts.as_slice() {
        [m, s] => ("0", *m, *s),
        [h, m, s] => (*h, *m, *s),
        _ => return Err(format!("'{}' is not M:SS or H:MM:SS", clock)),
    };

    let hours = parse_whole(hours, clock)?;
    let minutes = parse_whole(minutes, clock)?;
    let seconds: f64 = seconds
        .trim()
        .parse()
        .map_err(|_| format!("invalid seconds in '{}'", clock))?;

    if !seconds.is_finite() || seconds < 0.0 || seconds >= 60.0 {
        return Err(format!("seconds out of range in '{}'", clock));
    }
    if parts.len() == 3 && minutes >= 60 {
        return Err(format!("minutes out of range in '{}'", clock));
    }

    Ok(hours as f64 * 3600.0 + minutes as f64 * 60.0 + seconds)
}

fn parse_whole(part: &str, clock: &str) -> Result<u64, String> {
    let part = part.trim();
    if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("invalid clock component '{}' in '{}'", part, clock));
    }
    part.parse().map_err(|_| format!("invalid clock component '{}' in '{}'", part, clock))
}
