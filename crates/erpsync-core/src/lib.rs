//! Core domain model for the ERP warehouse sync: descriptors, value coercion,
//! deduplication, filters and run results.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod coerce;
pub mod dedup;
pub mod descriptor;
pub mod filters;
pub mod result;

pub use coerce::CoercionError;
pub use descriptor::{
    resolve_params, ColumnKind, ColumnSpec, ConflictAction, DedupStrategy, FilterDefaults,
    MappingError, Pagination, ParamContext, ParamSpec, ParamValue, SyncDescriptor,
    TimestampPolicy,
};
pub use filters::{Period, SyncFilters};
pub use result::{
    DeleteResult, ErrorKind, RangeSummary, RunState, SyncFailure, SyncResult, Watermark,
};

pub const CRATE_NAME: &str = "erpsync-core";

/// Upper bound on rows handed to the writer in one statement.
pub const MAX_BATCH_ROWS: usize = 500;

/// One flat upstream record (`<Entity>_<Field>` keys).
pub type RawRecord = serde_json::Map<String, serde_json::Value>;

/// Typed value bound into a destination column.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ColumnValue {
    Text(Option<String>),
    Int(i64),
    Float(f64),
    Flag(bool),
    Date(Option<NaiveDate>),
    Timestamp(Option<NaiveDateTime>),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(
            self,
            ColumnValue::Text(None) | ColumnValue::Date(None) | ColumnValue::Timestamp(None)
        )
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ColumnValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Text(Some(v)) => write!(f, "{v}"),
            ColumnValue::Int(v) => write!(f, "{v}"),
            ColumnValue::Float(v) => write!(f, "{v}"),
            ColumnValue::Flag(v) => write!(f, "{}", if *v { "1" } else { "0" }),
            ColumnValue::Date(Some(v)) => write!(f, "{}", v.format("%Y-%m-%d")),
            ColumnValue::Timestamp(Some(v)) => write!(f, "{}", coerce::format_timestamp(v)),
            _ => write!(f, "NULL"),
        }
    }
}

/// A mapped destination row, aligned with the descriptor's column order.
pub type Row = Vec<ColumnValue>;

/// What the writer needs to know about a destination table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableContract {
    pub table: String,
    pub columns: Vec<String>,
    pub key_columns: Vec<String>,
    pub conflict: ConflictAction,
}

impl TableContract {
    pub fn update_columns(&self) -> impl Iterator<Item = &String> {
        self.columns
            .iter()
            .filter(|c| !self.key_columns.contains(c))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown entity `{0}`")]
    UnknownEntity(String),
    #[error("invalid SQL identifier `{0}`")]
    InvalidIdentifier(String),
    #[error("entity `{entity}`: {message}")]
    InvalidDescriptor { entity: String, message: String },
    #[error("invalid period `{0}`, expected YYMM")]
    InvalidPeriod(String),
    #[error("invalid start date `{0}`, expected YYYYMMDD")]
    InvalidStartDate(String),
    #[error("start period {start} is after end period {end}")]
    InvertedRange { start: String, end: String },
    #[error("{0}")]
    InvalidArguments(String),
}

/// Lower-case Postgres identifier that is safe to splice into SQL text.
pub fn is_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= 63
        && (first.is_ascii_lowercase() || first == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

pub fn ensure_identifier(name: &str) -> Result<(), ConfigError> {
    if is_sql_identifier(name) {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_reject_injection() {
        assert!(is_sql_identifier("parttran"));
        assert!(is_sql_identifier("mscshp_packnum_c"));
        assert!(!is_sql_identifier(""));
        assert!(!is_sql_identifier("PartTran"));
        assert!(!is_sql_identifier("1abc"));
        assert!(!is_sql_identifier("part; drop table part"));
    }

    #[test]
    fn update_columns_exclude_keys() {
        let contract = TableContract {
            table: "labordtl".into(),
            columns: vec!["laborhedseq".into(), "labordtlseq".into(), "jobnum".into()],
            key_columns: vec!["laborhedseq".into(), "labordtlseq".into()],
            conflict: ConflictAction::Upsert,
        };
        let updates: Vec<_> = contract.update_columns().cloned().collect();
        assert_eq!(updates, vec!["jobnum".to_string()]);
    }
}
