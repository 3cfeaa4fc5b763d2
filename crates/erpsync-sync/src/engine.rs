//! The generic per-entity sync driver and its range mode.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use erpsync_core::filters::format_start_date;
use erpsync_core::{
    ConflictAction, MappingError, Pagination, ParamContext, Period, RangeSummary, RawRecord, Row,
    RunState, SyncDescriptor, SyncFilters, SyncResult, TimestampPolicy, MAX_BATCH_ROWS,
};
use erpsync_source::{PageSource, PageStream};
use erpsync_store::Warehouse;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::registry::EntityRegistry;
use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub batch_size: usize,
    pub run_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            batch_size: MAX_BATCH_ROWS,
            run_timeout: Duration::from_secs(1800),
        }
    }
}

pub struct SyncEngine {
    pub(crate) source: Arc<dyn PageSource>,
    pub(crate) warehouse: Arc<dyn Warehouse>,
    pub(crate) registry: Arc<EntityRegistry>,
    pub(crate) settings: EngineSettings,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn PageSource>,
        warehouse: Arc<dyn Warehouse>,
        registry: Arc<EntityRegistry>,
        settings: EngineSettings,
    ) -> Self {
        let settings = EngineSettings {
            batch_size: settings.batch_size.clamp(1, MAX_BATCH_ROWS),
            ..settings
        };
        Self {
            source,
            warehouse,
            registry,
            settings,
        }
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn settings(&self) -> EngineSettings {
        self.settings
    }

    /// Runs one entity to completion. Failures are reported in the result,
    /// never raised.
    pub async fn run_sync(&self, entity: &str, filters: SyncFilters) -> SyncResult {
        self.run_sync_on(entity, filters, Local::now().date_naive()).await
    }

    pub async fn run_sync_on(&self, entity: &str, filters: SyncFilters, today: NaiveDate) -> SyncResult {
        let descriptor = match self.registry.get(entity) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                warn!(entity, error = %err, "sync requested for unknown entity");
                return SyncResult::begin(entity, &filters).fail(SyncError::from(err).into_failure());
            }
        };
        let filters = filters.resolve(descriptor.default_filters, today);
        let mut result = SyncResult::begin(&descriptor.name, &filters);
        let span = info_span!("entity_sync", entity = %descriptor.name, run_id = %result.run_id);

        async move {
            info!(
                period = result.filter_period.as_deref().unwrap_or(""),
                start_date = result.filter_start_date.as_deref().unwrap_or(""),
                "sync started"
            );
            let outcome = tokio::time::timeout(
                self.settings.run_timeout,
                self.drive(descriptor, &filters, &mut result),
            )
            .await;

            let result = match outcome {
                Ok(Ok(())) => result.complete(),
                Ok(Err(err)) => {
                    error!(error = %err, state = ?result.state, "sync failed");
                    result.fail(err.into_failure())
                }
                Err(_) => {
                    error!(timeout = ?self.settings.run_timeout, "sync exceeded its time budget");
                    result.fail(SyncError::Timeout(self.settings.run_timeout).into_failure())
                }
            };
            info!(
                success = result.success,
                pages = result.pages_fetched,
                rows = result.total_rows_processed,
                batches = result.total_batches_written,
                skipped = result.rows_skipped,
                "sync finished"
            );
            result
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        descriptor: &SyncDescriptor,
        filters: &SyncFilters,
        result: &mut SyncResult,
    ) -> Result<(), SyncError> {
        let contract = descriptor.table_contract();
        let key_indices: Vec<usize> = descriptor
            .key_columns
            .iter()
            .filter_map(|k| descriptor.column_index(k))
            .collect();
        let tracked: Vec<(&str, usize)> = descriptor
            .track_max
            .iter()
            .filter_map(|c| descriptor.column_index(c).map(|idx| (c.as_str(), idx)))
            .collect();

        let mut base = ParamContext {
            period: filters.period_text(),
            start_date: filters.start_date_text(),
            ..ParamContext::default()
        };
        if let Pagination::Sequence { column, .. } = &descriptor.pagination {
            let start = self.warehouse.max_value(&descriptor.table, column).await?;
            info!(column = %column, start = ?start, "resuming sequence feed");
            if let Some(start) = start {
                result.observe_watermark(column, start);
            }
            base.cursor = Some(start.unwrap_or(0));
        }
        for (column, _) in &tracked {
            let seen = result
                .last_watermark
                .as_ref()
                .is_some_and(|marks| marks.contains_key(*column));
            if seen {
                continue;
            }
            if let Some(stored) = self.warehouse.max_value(&descriptor.table, column).await? {
                result.observe_watermark(column, stored);
            }
        }

        result.enter(RunState::Fetching);
        let mut pages = PageStream::new(
            self.source.as_ref(),
            &descriptor.endpoint,
            &descriptor.params,
            &descriptor.pagination,
            base,
        );

        while let Some(page) = pages.next_page().await? {
            result.record_page();
            let fetched = page.records.len();

            result.enter(RunState::Deduping);
            let records = descriptor.dedupe(page.records);
            let mut rows = map_page(descriptor, &records, result)?;
            if descriptor.conflict == ConflictAction::Upsert {
                rows = collapse_duplicate_keys(rows, &key_indices);
            }

            result.enter(RunState::Writing);
            for chunk in rows.chunks(self.settings.batch_size) {
                let affected = self.warehouse.write_batch(&contract, chunk).await?;
                result.record_batch(chunk.len(), affected);
            }
            for (column, idx) in &tracked {
                if let Some(max) = rows.iter().filter_map(|r| r[*idx].as_i64()).max() {
                    result.observe_watermark(column, max);
                }
            }
            debug!(page = page.number, fetched, written = rows.len(), "page processed");
            result.enter(RunState::Fetching);
        }
        Ok(())
    }

    /// Runs every month from `start` through `end`. A failing period is
    /// counted and the loop moves on.
    pub async fn run_range(
        &self,
        entity: &str,
        start: Period,
        end: Period,
        start_date: Option<NaiveDate>,
    ) -> Result<RangeSummary, SyncError> {
        let descriptor = self.registry.get(entity)?;
        let periods = Period::range(start, end)?;
        let mut summary = RangeSummary::new(
            &descriptor.name,
            start.to_string(),
            end.to_string(),
            start_date.as_ref().map(format_start_date),
        );

        info!(entity = %descriptor.name, %start, %end, periods = periods.len(), "range sync started");
        for period in periods {
            let filters = SyncFilters {
                period: Some(period),
                start_date,
                all: false,
            };
            let result = self.run_sync(&descriptor.name, filters).await;
            if !result.success {
                warn!(entity = %descriptor.name, %period, "period failed, continuing");
            }
            summary.push(result);
        }
        info!(
            entity = %descriptor.name,
            success_count = summary.success_count,
            fail_count = summary.fail_count,
            "range sync finished"
        );
        Ok(summary)
    }
}

fn map_page(
    descriptor: &SyncDescriptor,
    records: &[RawRecord],
    result: &mut SyncResult,
) -> Result<Vec<Row>, SyncError> {
    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        match descriptor.map_record(record) {
            Ok(row) => rows.push(row),
            Err(MappingError::Coercion { column, source })
                if descriptor.on_bad_timestamp == TimestampPolicy::SkipRow =>
            {
                warn!(column = %column, error = %source, "skipping row with malformed timestamp");
                result.record_skipped(1);
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(rows)
}

/// One statement cannot upsert the same key twice; the later row wins.
fn collapse_duplicate_keys(rows: Vec<Row>, key_indices: &[usize]) -> Vec<Row> {
    let mut last_seen: HashMap<Vec<String>, usize> = HashMap::with_capacity(rows.len());
    for (idx, row) in rows.iter().enumerate() {
        let key = key_indices.iter().map(|k| row[*k].to_string()).collect();
        last_seen.insert(key, idx);
    }
    if last_seen.len() == rows.len() {
        return rows;
    }
    let mut keep = vec![false; rows.len()];
    for idx in last_seen.into_values() {
        keep[idx] = true;
    }
    rows.into_iter()
        .zip(keep)
        .filter_map(|(row, keep)| keep.then_some(row))
        .collect()
}
