//! Positional arguments of `sync <entity> [a1] [a2] [a3]`.

use chrono::NaiveDate;
use erpsync_core::filters::parse_start_date;
use erpsync_core::{ConfigError, Period, SyncFilters};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRequest {
    Single(SyncFilters),
    Range {
        start: Period,
        end: Period,
        start_date: Option<NaiveDate>,
    },
}

fn looks_like_period(arg: &str) -> bool {
    arg.len() == 4 && arg.bytes().all(|b| b.is_ascii_digit())
}

fn looks_like_date(arg: &str) -> bool {
    arg.len() >= 6
}

pub fn interpret(args: &[String], all: bool) -> Result<SyncRequest, ConfigError> {
    if all {
        if !args.is_empty() {
            return Err(ConfigError::InvalidArguments(
                "--all cannot be combined with a period or start date".into(),
            ));
        }
        return Ok(SyncRequest::Single(SyncFilters::all()));
    }

    match args {
        [] => Ok(SyncRequest::Single(SyncFilters::none())),
        [one] if looks_like_period(one) => Ok(SyncRequest::Single(SyncFilters::parse(Some(one), None)?)),
        [one] if looks_like_date(one) => Ok(SyncRequest::Single(SyncFilters::parse(None, Some(one))?)),
        [a, b] if looks_like_period(a) && looks_like_period(b) => Ok(SyncRequest::Range {
            start: a.parse()?,
            end: b.parse()?,
            start_date: None,
        }),
        // A long second argument is always the start date; the first is the
        // period, possibly empty.
        [a, b] if looks_like_date(b) => Ok(SyncRequest::Single(SyncFilters::parse(Some(a), Some(b))?)),
        [a, b, c] => Ok(SyncRequest::Range {
            start: a.parse()?,
            end: b.parse()?,
            start_date: Some(parse_start_date(c)?),
        }),
        other => Err(ConfigError::InvalidArguments(format!(
            "cannot interpret arguments {other:?}; expected PERIOD, START_DATE, PERIOD START_DATE, START END or START END START_DATE"
        ))),
    }
}
