//! Declarative per-entity sync configuration.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::coerce::{self, CoercionError};
use crate::{ensure_identifier, ColumnValue, ConfigError, RawRecord, Row, TableContract};

/// Postgres caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;

fn default_page_size() -> usize {
    5000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Raw,
    Int,
    Float,
    BoolFlag,
    Date,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub column: String,
    pub field: String,
    pub kind: ColumnKind,
    #[serde(default)]
    pub default: Option<Value>,
}

impl ColumnSpec {
    pub fn extract(&self, record: &RawRecord) -> Result<ColumnValue, CoercionError> {
        Ok(match self.kind {
            ColumnKind::Raw => {
                let default = self.default.as_ref().map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
                ColumnValue::Text(coerce::as_text(record, &self.field, default.as_deref()))
            }
            ColumnKind::Int => ColumnValue::Int(coerce::as_int(
                record,
                &self.field,
                self.default.as_ref().and_then(Value::as_i64).unwrap_or(0),
            )),
            ColumnKind::Float => ColumnValue::Float(coerce::as_float(
                record,
                &self.field,
                self.default.as_ref().and_then(Value::as_f64).unwrap_or(0.0),
            )),
            ColumnKind::BoolFlag => ColumnValue::Flag(coerce::as_bool_flag(record, &self.field)),
            ColumnKind::Date => ColumnValue::Date(coerce::as_date(record, &self.field)),
            ColumnKind::Timestamp => {
                ColumnValue::Timestamp(coerce::as_timestamp(record, &self.field)?)
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum DedupStrategy {
    #[default]
    None,
    KeepLast {
        #[serde(default)]
        fields: Vec<String>,
    },
    KeepMaxTimestamp {
        #[serde(default)]
        fields: Vec<String>,
        timestamp_field: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictAction {
    #[default]
    Upsert,
    InsertIgnore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Pagination {
    Offset {
        #[serde(default = "default_page_size")]
        page_size: usize,
    },
    /// Append-only feed resumed from the highest sequence already stored.
    Sequence {
        field: String,
        column: String,
        #[serde(default = "default_page_size")]
        page_size: usize,
    },
}

impl Pagination {
    pub fn page_size(&self) -> usize {
        match self {
            Pagination::Offset { page_size } | Pagination::Sequence { page_size, .. } => *page_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamValue {
    Offset,
    PageSize,
    Period,
    StartDate,
    Cursor,
    EpochTimestamp,
    Literal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub value: ParamValue,
    #[serde(default)]
    pub literal: Option<String>,
}

/// Per-call values a request parameter can resolve to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamContext {
    pub offset: u64,
    pub page_size: usize,
    pub period: Option<String>,
    pub start_date: Option<String>,
    pub cursor: Option<i64>,
    pub epoch_timestamp: Option<i64>,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, value: ParamValue) -> Self {
        Self {
            name: name.into(),
            value,
            literal: None,
        }
    }

    /// Absent optional values resolve to the empty string.
    pub fn resolve(&self, ctx: &ParamContext) -> String {
        match self.value {
            ParamValue::Offset => ctx.offset.to_string(),
            ParamValue::PageSize => ctx.page_size.to_string(),
            ParamValue::Period => ctx.period.clone().unwrap_or_default(),
            ParamValue::StartDate => ctx.start_date.clone().unwrap_or_default(),
            ParamValue::Cursor => ctx.cursor.map(|c| c.to_string()).unwrap_or_default(),
            ParamValue::EpochTimestamp => ctx
                .epoch_timestamp
                .map(|t| t.to_string())
                .unwrap_or_default(),
            ParamValue::Literal => self.literal.clone().unwrap_or_default(),
        }
    }
}

pub fn resolve_params(params: &[ParamSpec], ctx: &ParamContext) -> Vec<(String, String)> {
    params
        .iter()
        .map(|p| (p.name.clone(), p.resolve(ctx)))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FilterDefaults {
    #[default]
    None,
    /// Missing start date becomes today, missing period its month.
    Today,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimestampPolicy {
    #[default]
    FailRun,
    SkipRow,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("column `{column}`: {source}")]
    Coercion {
        column: String,
        #[source]
        source: CoercionError,
    },
    #[error("key column `{column}` resolved to null from field `{field}`")]
    NullKey { column: String, field: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncDescriptor {
    pub name: String,
    pub table: String,
    pub endpoint: String,
    #[serde(default)]
    pub schedule: Option<String>,
    pub pagination: Pagination,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    #[serde(default)]
    pub default_filters: FilterDefaults,
    pub columns: Vec<ColumnSpec>,
    pub key_columns: Vec<String>,
    #[serde(default)]
    pub conflict: ConflictAction,
    #[serde(default)]
    pub dedup: DedupStrategy,
    #[serde(default)]
    pub track_max: Vec<String>,
    #[serde(default)]
    pub on_bad_timestamp: TimestampPolicy,
}

impl SyncDescriptor {
    pub fn page_size(&self) -> usize {
        self.pagination.page_size()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.column == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.column == name)
    }

    /// Source fields backing the key columns; the default dedup key.
    pub fn key_fields(&self) -> Vec<String> {
        self.key_columns
            .iter()
            .filter_map(|k| self.column(k).map(|c| c.field.clone()))
            .collect()
    }

    pub fn table_contract(&self) -> TableContract {
        TableContract {
            table: self.table.clone(),
            columns: self.columns.iter().map(|c| c.column.clone()).collect(),
            key_columns: self.key_columns.clone(),
            conflict: self.conflict,
        }
    }

    pub fn dedupe(&self, records: Vec<RawRecord>) -> Vec<RawRecord> {
        self.dedup.apply(records, &self.key_fields())
    }

    pub fn map_record(&self, record: &RawRecord) -> Result<Row, MappingError> {
        let mut row = Vec::with_capacity(self.columns.len());
        for spec in &self.columns {
            let value = spec
                .extract(record)
                .map_err(|source| MappingError::Coercion {
                    column: spec.column.clone(),
                    source,
                })?;
            if value.is_null() && self.key_columns.contains(&spec.column) {
                return Err(MappingError::NullKey {
                    column: spec.column.clone(),
                    field: spec.field.clone(),
                });
            }
            row.push(value);
        }
        Ok(row)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidDescriptor {
            entity: self.name.clone(),
            message,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("entity name is empty".into()));
        }
        ensure_identifier(&self.table)?;
        if self.columns.is_empty() {
            return Err(invalid("no columns configured".into()));
        }
        if self.columns.len() * crate::MAX_BATCH_ROWS > MAX_BIND_PARAMS {
            return Err(invalid(format!(
                "{} columns exceed the bind parameter budget of a full batch",
                self.columns.len()
            )));
        }

        let mut seen = HashSet::new();
        for spec in &self.columns {
            ensure_identifier(&spec.column)?;
            if !seen.insert(spec.column.as_str()) {
                return Err(invalid(format!("duplicate column `{}`", spec.column)));
            }
            if spec.field.is_empty() {
                return Err(invalid(format!("column `{}` has no source field", spec.column)));
            }
            match (spec.kind, &spec.default) {
                (ColumnKind::Int, Some(v)) if !v.is_i64() => {
                    return Err(invalid(format!("column `{}` default must be an integer", spec.column)))
                }
                (ColumnKind::Float, Some(v)) if !v.is_number() => {
                    return Err(invalid(format!("column `{}` default must be a number", spec.column)))
                }
                (ColumnKind::Date | ColumnKind::Timestamp | ColumnKind::BoolFlag, Some(_)) => {
                    return Err(invalid(format!(
                        "column `{}` does not take a default",
                        spec.column
                    )))
                }
                _ => {}
            }
        }

        if self.key_columns.is_empty() {
            return Err(invalid("no key columns configured".into()));
        }
        for key in &self.key_columns {
            if !seen.contains(key.as_str()) {
                return Err(invalid(format!("key column `{key}` is not a configured column")));
            }
        }
        if self.key_columns.len() == self.columns.len() && self.conflict == ConflictAction::Upsert {
            return Err(invalid("upsert needs at least one non-key column".into()));
        }

        if self.page_size() == 0 {
            return Err(invalid("page size must be at least 1".into()));
        }
        let sequence_mode = matches!(self.pagination, Pagination::Sequence { .. });
        if let Pagination::Sequence { column, field, .. } = &self.pagination {
            match self.column(column) {
                Some(spec) if spec.kind == ColumnKind::Int => {}
                _ => {
                    return Err(invalid(format!(
                        "sequence column `{column}` must be a configured int column"
                    )))
                }
            }
            if field.is_empty() {
                return Err(invalid("sequence field is empty".into()));
            }
        }

        for param in &self.params {
            if param.name.is_empty() {
                return Err(invalid("request parameter without a name".into()));
            }
            match param.value {
                ParamValue::Cursor if !sequence_mode => {
                    return Err(invalid(format!(
                        "parameter `{}` uses the cursor outside sequence pagination",
                        param.name
                    )))
                }
                ParamValue::Offset if sequence_mode => {
                    return Err(invalid(format!(
                        "parameter `{}` uses the offset in sequence pagination",
                        param.name
                    )))
                }
                ParamValue::Literal if param.literal.is_none() => {
                    return Err(invalid(format!("literal parameter `{}` has no value", param.name)))
                }
                _ => {}
            }
        }

        for column in &self.track_max {
            match self.column(column) {
                Some(spec) if spec.kind == ColumnKind::Int => {}
                _ => {
                    return Err(invalid(format!(
                        "tracked column `{column}` must be a configured int column"
                    )))
                }
            }
        }

        if let DedupStrategy::KeepMaxTimestamp {
            timestamp_field, ..
        } = &self.dedup
        {
            if timestamp_field.is_empty() {
                return Err(invalid("dedup timestamp field is empty".into()));
            }
        }
        Ok(())
    }
}
