//! Propagates upstream hard deletes to allow-listed destination tables.

use chrono::{TimeDelta, Utc};
use erpsync_core::coerce::as_text;
use erpsync_core::{DeleteResult, ErrorKind, ParamContext, RawRecord, SyncFailure};
use erpsync_source::PageStream;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::engine::SyncEngine;
use crate::registry::{DeleteFeedConfig, MAX_LOOKBACK_HOURS};
use crate::SyncError;

impl SyncEngine {
    /// Applies deletes reported within the feed's lookback window.
    pub async fn run_delete_sync(&self) -> DeleteResult {
        let Some(feed) = self.registry.delete_feed.as_ref() else {
            return DeleteResult::begin(0).fail(SyncFailure::new(
                ErrorKind::Configuration,
                "no delete feed configured",
            ));
        };
        self.run_delete_sync_within(feed.lookback_hours).await
    }

    /// Applies deletes reported within `lookback_hours` of now.
    pub async fn run_delete_sync_within(&self, lookback_hours: i64) -> DeleteResult {
        let epoch = TimeDelta::try_hours(lookback_hours)
            .filter(|_| (0..=MAX_LOOKBACK_HOURS).contains(&lookback_hours))
            .and_then(|lookback| Utc::now().checked_sub_signed(lookback));
        match epoch {
            Some(epoch) => self.run_delete_sync_since(epoch.timestamp()).await,
            None => {
                warn!(lookback_hours, "delete lookback window out of range");
                DeleteResult::begin(0).fail(SyncFailure::new(
                    ErrorKind::Configuration,
                    format!("lookback of {lookback_hours} hours is outside 0..={MAX_LOOKBACK_HOURS}"),
                ))
            }
        }
    }

    pub async fn run_delete_sync_since(&self, epoch: i64) -> DeleteResult {
        let Some(feed) = self.registry.delete_feed.as_ref() else {
            return DeleteResult::begin(epoch).fail(SyncFailure::new(
                ErrorKind::Configuration,
                "no delete feed configured",
            ));
        };
        let mut result = DeleteResult::begin(epoch);
        let span = info_span!("delete_sync", run_id = %result.run_id, epoch);

        async move {
            info!(endpoint = %feed.endpoint, "delete sync started");
            let outcome = tokio::time::timeout(
                self.settings.run_timeout,
                self.drive_deletes(feed, epoch, &mut result),
            )
            .await;
            let result = match outcome {
                Ok(Ok(())) => result.complete(),
                Ok(Err(err)) => {
                    error!(error = %err, "delete sync failed");
                    result.fail(err.into_failure())
                }
                Err(_) => {
                    error!(timeout = ?self.settings.run_timeout, "delete sync exceeded its time budget");
                    result.fail(SyncError::Timeout(self.settings.run_timeout).into_failure())
                }
            };
            info!(
                success = result.success,
                examined = result.total_examined,
                deleted = result.total_deleted,
                skipped = result.total_skipped,
                failed = result.total_failed,
                "delete sync finished"
            );
            result
        }
        .instrument(span)
        .await
    }

    async fn drive_deletes(
        &self,
        feed: &DeleteFeedConfig,
        epoch: i64,
        result: &mut DeleteResult,
    ) -> Result<(), SyncError> {
        let pagination = feed.pagination();
        let base = ParamContext {
            epoch_timestamp: Some(epoch),
            ..ParamContext::default()
        };
        let mut pages = PageStream::new(
            self.source.as_ref(),
            &feed.endpoint,
            &feed.params,
            &pagination,
            base,
        );
        while let Some(page) = pages.next_page().await? {
            result.pages_fetched += 1;
            for record in &page.records {
                self.apply_delete(feed, record, result).await;
            }
        }
        Ok(())
    }

    /// Per-row failures are counted and logged; they never abort the feed.
    async fn apply_delete(&self, feed: &DeleteFeedConfig, record: &RawRecord, result: &mut DeleteResult) {
        result.total_examined += 1;
        let table = as_text(record, &feed.table_field, None)
            .map(|t| t.trim().to_ascii_lowercase())
            .unwrap_or_default();
        let row_id = as_text(record, &feed.row_id_field, None).unwrap_or_default();

        if table.is_empty() || row_id.is_empty() || !feed.allows(&table) {
            debug!(table = %table, row_id = %row_id, "delete record skipped");
            result.total_skipped += 1;
            return;
        }

        match self
            .warehouse
            .delete_by_row_id(&table, &feed.row_id_column, &row_id)
            .await
        {
            Ok(deleted) => result.total_deleted += deleted,
            Err(err) => {
                error!(table = %table, row_id = %row_id, error = %err, "row delete failed");
                result.total_failed += 1;
            }
        }
    }
}
