//! Period and start-date filters passed through to the upstream API.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::descriptor::FilterDefaults;
use crate::ConfigError;

const START_DATE_FORMAT: &str = "%Y%m%d";

/// A reporting month written as `YYMM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        ((2000..2100).contains(&year) && (1..=12).contains(&month)).then_some(Self { year, month })
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Every month from `start` through `end`, both inclusive.
    pub fn range(start: Period, end: Period) -> Result<Vec<Period>, ConfigError> {
        if start > end {
            return Err(ConfigError::InvertedRange {
                start: start.to_string(),
                end: end.to_string(),
            });
        }
        let mut out = vec![start];
        let mut current = start;
        while current < end {
            current = current.next();
            out.push(current);
        }
        Ok(out)
    }
}

impl FromStr for Period {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidPeriod(s.to_string());
        if s.len() != 4 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let yy: i32 = s[..2].parse().map_err(|_| invalid())?;
        let mm: u32 = s[2..].parse().map_err(|_| invalid())?;
        Period::new(2000 + yy, mm).ok_or_else(invalid)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}{:02}", self.year % 100, self.month)
    }
}

impl Serialize for Period {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Period {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

pub fn parse_start_date(s: &str) -> Result<NaiveDate, ConfigError> {
    if s.len() != 8 {
        return Err(ConfigError::InvalidStartDate(s.to_string()));
    }
    NaiveDate::parse_from_str(s, START_DATE_FORMAT)
        .map_err(|_| ConfigError::InvalidStartDate(s.to_string()))
}

pub fn format_start_date(date: &NaiveDate) -> String {
    date.format(START_DATE_FORMAT).to_string()
}

/// Filters for one run. `all` disables descriptor defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncFilters {
    pub period: Option<Period>,
    pub start_date: Option<NaiveDate>,
    pub all: bool,
}

impl SyncFilters {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    /// Parses the raw `period`/`startDate` strings; empty strings mean absent.
    pub fn parse(period: Option<&str>, start_date: Option<&str>) -> Result<Self, ConfigError> {
        let period = period
            .filter(|p| !p.is_empty())
            .map(str::parse::<Period>)
            .transpose()?;
        let start_date = start_date
            .filter(|d| !d.is_empty())
            .map(parse_start_date)
            .transpose()?;
        Ok(Self {
            period,
            start_date,
            all: false,
        })
    }

    pub fn resolve(self, defaults: FilterDefaults, today: NaiveDate) -> Self {
        if self.all || defaults == FilterDefaults::None {
            return self;
        }
        let start_date = self.start_date.unwrap_or(today);
        let period = self.period.unwrap_or_else(|| Period::from_date(start_date));
        Self {
            period: Some(period),
            start_date: Some(start_date),
            all: false,
        }
    }

    pub fn period_text(&self) -> Option<String> {
        self.period.map(|p| p.to_string())
    }

    pub fn start_date_text(&self) -> Option<String> {
        self.start_date.as_ref().map(format_start_date)
    }
}
