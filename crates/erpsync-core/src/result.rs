//! Run summaries handed back to schedulers, the CLI and HTTP handlers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::filters::SyncFilters;

/// Highest value seen per tracked column.
pub type Watermark = BTreeMap<String, i64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Fetching,
    Deduping,
    Writing,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Fetch,
    Write,
    Coercion,
    Configuration,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub error_kind: ErrorKind,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl SyncFailure {
    pub fn new(error_kind: ErrorKind, error: impl Into<String>) -> Self {
        Self {
            error_kind,
            error: error.into(),
            status_code: None,
            details: None,
        }
    }

    pub fn with_status(mut self, status_code: Option<u16>) -> Self {
        self.status_code = status_code;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub entity: String,
    pub run_id: Uuid,
    pub success: bool,
    pub state: RunState,
    pub total_rows_processed: u64,
    pub total_batches_written: u64,
    pub total_rows_affected: u64,
    pub rows_skipped: u64,
    pub pages_fetched: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_period: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_start_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_watermark: Option<Watermark>,
    #[serde(flatten)]
    pub failure: Option<SyncFailure>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncResult {
    pub fn begin(entity: impl Into<String>, filters: &SyncFilters) -> Self {
        Self {
            entity: entity.into(),
            run_id: Uuid::new_v4(),
            success: false,
            state: RunState::Idle,
            total_rows_processed: 0,
            total_batches_written: 0,
            total_rows_affected: 0,
            rows_skipped: 0,
            pages_fetched: 0,
            filter_period: filters.period_text(),
            filter_start_date: filters.start_date_text(),
            last_watermark: None,
            failure: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn enter(&mut self, state: RunState) {
        if !self.state.is_terminal() {
            self.state = state;
        }
    }

    pub fn record_page(&mut self) {
        self.pages_fetched += 1;
    }

    pub fn record_batch(&mut self, rows_sent: usize, rows_affected: u64) {
        self.total_rows_processed += rows_sent as u64;
        self.total_batches_written += 1;
        self.total_rows_affected += rows_affected;
    }

    pub fn record_skipped(&mut self, rows: u64) {
        self.rows_skipped += rows;
    }

    pub fn observe_watermark(&mut self, column: &str, value: i64) {
        let marks = self.last_watermark.get_or_insert_with(Watermark::new);
        marks
            .entry(column.to_string())
            .and_modify(|current| *current = (*current).max(value))
            .or_insert(value);
    }

    pub fn complete(mut self) -> Self {
        self.success = true;
        self.state = RunState::Completed;
        self.finished_at = Some(Utc::now());
        self
    }

    /// Counters stay as accumulated so far; the run is reported failed.
    pub fn fail(mut self, failure: SyncFailure) -> Self {
        self.success = false;
        self.state = RunState::Failed;
        self.failure = Some(failure);
        self.finished_at = Some(Utc::now());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeSummary {
    pub entity: String,
    pub start: String,
    pub end: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_start_date: Option<String>,
    pub success: bool,
    pub success_count: u32,
    pub fail_count: u32,
    pub total_rows_processed: u64,
    pub total_batches_written: u64,
    pub periods: Vec<SyncResult>,
}

impl RangeSummary {
    pub fn new(entity: &str, start: String, end: String, filter_start_date: Option<String>) -> Self {
        Self {
            entity: entity.to_string(),
            start,
            end,
            filter_start_date,
            success: true,
            success_count: 0,
            fail_count: 0,
            total_rows_processed: 0,
            total_batches_written: 0,
            periods: Vec::new(),
        }
    }

    pub fn push(&mut self, result: SyncResult) {
        if result.success {
            self.success_count += 1;
            self.total_rows_processed += result.total_rows_processed;
            self.total_batches_written += result.total_batches_written;
        } else {
            self.fail_count += 1;
            self.success = false;
        }
        self.periods.push(result);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteResult {
    pub run_id: Uuid,
    pub success: bool,
    pub total_examined: u64,
    pub total_deleted: u64,
    pub total_skipped: u64,
    pub total_failed: u64,
    pub pages_fetched: u64,
    pub epoch_timestamp_used: i64,
    #[serde(flatten)]
    pub failure: Option<SyncFailure>,
}

impl DeleteResult {
    pub fn begin(epoch_timestamp_used: i64) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            success: false,
            total_examined: 0,
            total_deleted: 0,
            total_skipped: 0,
            total_failed: 0,
            pages_fetched: 0,
            epoch_timestamp_used,
            failure: None,
        }
    }

    pub fn complete(mut self) -> Self {
        self.success = true;
        self
    }

    pub fn fail(mut self, failure: SyncFailure) -> Self {
        self.success = false;
        self.failure = Some(failure);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counters_accumulate_and_watermark_keeps_max() {
        let mut result = SyncResult::begin("parttran", &SyncFilters::none());
        result.record_page();
        result.record_batch(500, 500);
        result.record_batch(120, 118);
        result.observe_watermark("trannum", 150);
        result.observe_watermark("trannum", 120);
        let result = result.complete();

        assert!(result.success);
        assert_eq!(result.state, RunState::Completed);
        assert_eq!(result.total_rows_processed, 620);
        assert_eq!(result.total_batches_written, 2);
        assert_eq!(result.total_rows_affected, 618);
        assert_eq!(result.last_watermark.unwrap()["trannum"], 150);
    }

    #[test]
    fn failure_flattens_into_json() {
        let filters = SyncFilters::parse(Some("2405"), None).unwrap();
        let result = SyncResult::begin("part", &filters).fail(
            SyncFailure::new(ErrorKind::Fetch, "upstream returned 503")
                .with_status(Some(503))
                .with_details(json!({"body": "busy"})),
        );
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["state"], json!("failed"));
        assert_eq!(value["error_kind"], json!("fetch"));
        assert_eq!(value["status_code"], json!(503));
        assert_eq!(value["filter_period"], json!("2405"));
        assert!(value.get("filter_start_date").is_none());
    }

    #[test]
    fn terminal_state_is_sticky() {
        let mut result = SyncResult::begin("part", &SyncFilters::none())
            .fail(SyncFailure::new(ErrorKind::Write, "boom"));
        result.enter(RunState::Writing);
        assert_eq!(result.state, RunState::Failed);
    }

    #[test]
    fn range_summary_counts_each_period() {
        let mut summary = RangeSummary::new("labordtl", "2401".into(), "2403".into(), None);
        let ok = SyncResult::begin("labordtl", &SyncFilters::none()).complete();
        let bad = SyncResult::begin("labordtl", &SyncFilters::none())
            .fail(SyncFailure::new(ErrorKind::Fetch, "timeout"));
        summary.push(ok.clone());
        summary.push(bad);
        summary.push(ok);
        assert_eq!((summary.success_count, summary.fail_count), (2, 1));
        assert!(!summary.success);
    }

    #[test]
    fn range_totals_only_count_successful_periods() {
        let mut summary = RangeSummary::new("labordtl", "2401".into(), "2402".into(), None);
        let mut ok = SyncResult::begin("labordtl", &SyncFilters::none());
        ok.record_batch(3, 3);
        let mut partial = SyncResult::begin("labordtl", &SyncFilters::none());
        partial.record_batch(5, 5);
        summary.push(ok.complete());
        summary.push(partial.fail(SyncFailure::new(ErrorKind::Write, "second batch failed")));
        assert_eq!(summary.total_rows_processed, 3);
        assert_eq!(summary.total_batches_written, 1);
        assert_eq!(summary.periods[1].total_rows_processed, 5);
    }
}
