//! Lazy page-by-page fetch loop over a [`PageSource`].
//!
//! Offset feeds advance by the number of records received. Sequence feeds
//! resume from the largest sequence value seen so far, inclusively. Both stop
//! on the first page shorter than the page size.

use erpsync_core::coerce::as_int;
use erpsync_core::{resolve_params, Pagination, ParamContext, ParamSpec, RawRecord};
use serde_json::Value;
use tracing::debug;

use crate::{FetchError, PageSource};

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    /// 1-based page number within the run.
    pub number: u64,
    pub records: Vec<RawRecord>,
}

pub struct PageStream<'a> {
    source: &'a dyn PageSource,
    endpoint: &'a str,
    params: &'a [ParamSpec],
    pagination: &'a Pagination,
    base: ParamContext,
    offset: u64,
    cursor: Option<i64>,
    pages: u64,
    done: bool,
}

impl<'a> PageStream<'a> {
    /// `base.cursor` seeds sequence feeds; `base.offset` is ignored.
    pub fn new(
        source: &'a dyn PageSource,
        endpoint: &'a str,
        params: &'a [ParamSpec],
        pagination: &'a Pagination,
        base: ParamContext,
    ) -> Self {
        let cursor = base.cursor;
        Self {
            source,
            endpoint,
            params,
            pagination,
            base,
            offset: 0,
            cursor,
            pages: 0,
            done: false,
        }
    }

    pub fn pages_fetched(&self) -> u64 {
        self.pages
    }

    pub fn cursor(&self) -> Option<i64> {
        self.cursor
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Query pairs for the next call.
    pub fn next_query(&self) -> Vec<(String, String)> {
        let ctx = ParamContext {
            offset: self.offset,
            page_size: self.pagination.page_size(),
            cursor: self.cursor,
            ..self.base.clone()
        };
        resolve_params(self.params, &ctx)
    }

    /// `Ok(None)` once the feed is exhausted. An error ends the stream.
    pub async fn next_page(&mut self) -> Result<Option<FetchedPage>, FetchError> {
        if self.done {
            return Ok(None);
        }
        let page_size = self.pagination.page_size();
        let query = self.next_query();
        let records = match self.source.fetch_page(self.endpoint, &query).await {
            Ok(records) => records,
            Err(err) => {
                self.done = true;
                return Err(err);
            }
        };
        self.pages += 1;
        let len = records.len();
        debug!(page = self.pages, records = len, offset = self.offset, cursor = ?self.cursor, "page received");

        match self.pagination {
            Pagination::Offset { .. } => self.offset += len as u64,
            Pagination::Sequence { field, .. } => {
                let page_max = records
                    .iter()
                    .filter(|r| !matches!(r.get(field), None | Some(Value::Null)))
                    .map(|r| as_int(r, field, i64::MIN))
                    .max();
                match (page_max, self.cursor) {
                    (Some(max), Some(cursor)) if max > cursor => self.cursor = Some(max),
                    (Some(max), None) => self.cursor = Some(max),
                    _ if len >= page_size => {
                        self.done = true;
                        return Err(FetchError::StalledCursor {
                            cursor: self.cursor.unwrap_or_default(),
                        });
                    }
                    _ => {}
                }
            }
        }

        if len < page_size {
            self.done = true;
        }
        if len == 0 {
            return Ok(None);
        }
        Ok(Some(FetchedPage {
            number: self.pages,
            records,
        }))
    }
}
