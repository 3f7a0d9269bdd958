// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};

const UNSET: &[&str] = &["", "unknown", "none", "n/a", "(null)", "0"];

/// Parses a scheduler timestamp into an absolute UTC instant.
///
/// An embedded offset wins; timestamps without one are read in `tz`.
/// Accepted forms: RFC 3339 (also with `+HHMM` offsets or a space separator),
/// naive `YYYY-MM-DDTHH:MM:SS`, ctime (`Fri Mar  1 10:00:00 2024`) and Unix
/// epoch seconds. Placeholders such as `Unknown` or `N/A` yield `None`.
pub fn parse_timestamp(raw: &str, tz: UtcOffset) -> AppResult<Option<OffsetDateTime>> {
    let trimmed = raw.trim();
    if UNSET.contains(&trimmed.to_ascii_lowercase().as_str()) {
        return Ok(None);
    }
    if trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return from_epoch(trimmed);
    }

    let normalized = normalize(trimmed);
    if let Ok(parsed) = OffsetDateTime::parse(&normalized, &Rfc3339) {
        return Ok(Some(parsed.to_offset(UtcOffset::UTC)));
    }
    let naive = format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]");
    let naive_fraction =
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]");
    for format in [naive, naive_fraction] {
        if let Ok(parsed) = PrimitiveDateTime::parse(&normalized, format) {
            return Ok(Some(parsed.assume_offset(tz).to_offset(UtcOffset::UTC)));
        }
    }
    if let Some(parsed) = parse_ctime(trimmed) {
        return Ok(Some(parsed.assume_offset(tz).to_offset(UtcOffset::UTC)));
    }
    Err(AppError::with_message(
        AppErrorKind::ParseFailed,
        codes::PARSE_FAILED,
        format!("unrecognised timestamp '{trimmed}'"),
    ))
}

pub fn from_epoch_secs(secs: i64) -> Option<OffsetDateTime> {
    if secs <= 0 {
        return None;
    }
    OffsetDateTime::from_unix_timestamp(secs).ok()
}

fn from_epoch(raw: &str) -> AppResult<Option<OffsetDateTime>> {
    let secs: i64 = raw.parse().map_err(|_| {
        AppError::with_message(
            AppErrorKind::ParseFailed,
            codes::PARSE_FAILED,
            format!("epoch timestamp out of range '{raw}'"),
        )
    })?;
    Ok(from_epoch_secs(secs))
}

/// `2024-03-01 10:00:00+0200` -> `2024-03-01T10:00:00+02:00`
fn normalize(raw: &str) -> String {
    let mut value = raw.to_string();
    if value.len() > 10 && value.as_bytes()[10] == b' ' {
        value.replace_range(10..11, "T");
    }
    let bytes = value.as_bytes();
    let len = bytes.len();
    if len > 19 {
        let tail = &bytes[len - 5..];
        if (tail[0] == b'+' || tail[0] == b'-') && tail[1..].iter().all(u8::is_ascii_digit) {
            value.insert(len - 2, ':');
            return value;
        }
        let short = &bytes[len - 3..];
        if (short[0] == b'+' || short[0] == b'-') && short[1..].iter().all(u8::is_ascii_digit) {
            value.push_str(":00");
        }
    }
    value
}

fn parse_ctime(raw: &str) -> Option<PrimitiveDateTime> {
    let tokens: Vec<&str> = raw.split_whitespace().collect();
    let [_weekday, month, day, clock, year] = tokens.as_slice() else {
        return None;
    };
    let day = day.trim_start_matches('0');
    let compact = format!("{month} {day} {clock} {year}");
    let format = format_description!(
        "[month repr:short] [day padding:none] [hour]:[minute]:[second] [year]"
    );
    PrimitiveDateTime::parse(&compact, format).ok()
}
