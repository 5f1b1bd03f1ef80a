//! `YYYYMMDDHHmm` time labels and bucket alignment
//!
//! Alignment works on the calendar fields of the label, so it does not
//! depend on the time zone the labels are written in. The zone only matters
//! when converting a label to an epoch for storage sort keys.

use crate::{AggregationError, Timeframe};
use chrono::{
    DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike, Utc,
};

/// Length of a time label
pub const TIME_LABEL_LEN: usize = 12;

const MINUTES_PER_HOUR: u32 = 60;

fn invalid(label: &str, reason: &'static str) -> AggregationError {
    AggregationError::InvalidTimeLabel { label: label.to_string(), reason }
}

/// Parse a `YYYYMMDDHHmm` label
pub fn parse_time_label(label: &str) -> Result<NaiveDateTime, AggregationError> {
    if label.len() != TIME_LABEL_LEN {
        return Err(invalid(label, "expected 12 digits"));
    }
    if !label.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(label, "contains non-digit characters"));
    }

    // All ASCII digits, so byte slicing is on char boundaries
    let field = |range: std::ops::Range<usize>| -> u32 {
        label[range].bytes().fold(0, |acc, b| acc * 10 + u32::from(b - b'0'))
    };
    let year = i32::try_from(field(0..4)).map_err(|_| invalid(label, "year out of range"))?;

    let date = NaiveDate::from_ymd_opt(year, field(4..6), field(6..8))
        .ok_or_else(|| invalid(label, "no such calendar date"))?;
    let time = NaiveTime::from_hms_opt(field(8..10), field(10..12), 0)
        .ok_or_else(|| invalid(label, "no such time of day"))?;

    Ok(date.and_time(time))
}

/// Format a timestamp as a `YYYYMMDDHHmm` label
#[must_use]
pub fn format_time_label(time: NaiveDateTime) -> String {
    time.format("%Y%m%d%H%M").to_string()
}

/// Floor a timestamp to the start of its bucket
///
/// Intraday and daily frames floor the minute-of-day to a multiple of the
/// frame length. Weekly frames floor to Monday 00:00.
#[must_use]
pub fn align_time(time: NaiveDateTime, timeframe: Timeframe) -> NaiveDateTime {
    let midnight = time.date().and_time(NaiveTime::MIN);

    match timeframe {
        Timeframe::W1 => {
            let days_since_monday = time.date().weekday().num_days_from_monday();
            midnight - TimeDelta::days(i64::from(days_since_monday))
        }
        _ => {
            let minute_of_day = time.hour() * MINUTES_PER_HOUR + time.minute();
            let floored = minute_of_day - minute_of_day % timeframe.duration_minutes();
            midnight + TimeDelta::minutes(i64::from(floored))
        }
    }
}

/// Aligned bucket start for a label
pub fn align_to_timeframe(label: &str, timeframe: Timeframe) -> Result<String, AggregationError> {
    let time = parse_time_label(label)?;
    Ok(format_time_label(align_time(time, timeframe)))
}

/// Whether the label is already the start of its own bucket
pub fn is_timeframe_boundary(label: &str, timeframe: Timeframe) -> Result<bool, AggregationError> {
    let time = parse_time_label(label)?;
    Ok(align_time(time, timeframe) == time)
}

/// Seconds since the Unix epoch for a label written in `offset`
pub fn label_epoch(label: &str, offset: FixedOffset) -> Result<i64, AggregationError> {
    let time = parse_time_label(label)?;
    Ok(time.and_utc().timestamp() - i64::from(offset.local_minus_utc()))
}

/// Epoch at which the bucket starting at `label` closes
pub fn bucket_close_epoch(
    label: &str,
    timeframe: Timeframe,
    offset: FixedOffset,
) -> Result<i64, AggregationError> {
    Ok(label_epoch(label, offset)? + timeframe.duration_seconds())
}

/// Whether the bucket starting at `label` has fully elapsed at `now`
pub fn is_bucket_closed(
    label: &str,
    timeframe: Timeframe,
    offset: FixedOffset,
    now: DateTime<Utc>,
) -> Result<bool, AggregationError> {
    Ok(now.timestamp() >= bucket_close_epoch(label, timeframe, offset)?)
}
