use chrono::NaiveDate;
use gscsync_adapters::{AnalyticsSource, SourceQuery};
use gscsync_core::{AnalyticsRow, DimensionFilters, SyncWindow};
use gscsync_http::{BackoffPolicy, RetryDisposition};
use tracing::{info, warn};

use crate::{PageCursor, SyncError};

/// One non-empty page of source rows, in source order.
#[derive(Debug, Clone)]
pub struct Page {
    pub cursor: PageCursor,
    pub rows: Vec<AnalyticsRow>,
}

/// Walks the source one day at a time, `row_limit` rows per request, until
/// every day of the window returned a short page.
///
/// Pull-based: nothing is fetched until [`SourcePaginator::next_page`] is
/// awaited, so rows can be reconciled while later pages are still unfetched.
pub struct SourcePaginator<'a, S: AnalyticsSource + ?Sized> {
    source: &'a S,
    site_url: String,
    filters: DimensionFilters,
    row_limit: u32,
    backoff: BackoffPolicy,
    days: Vec<NaiveDate>,
    day_idx: usize,
    offset: u64,
    day_rows: usize,
    pages_fetched: usize,
    finished: bool,
}

impl<'a, S: AnalyticsSource + ?Sized> SourcePaginator<'a, S> {
    pub fn new(
        source: &'a S,
        site_url: impl Into<String>,
        window: SyncWindow,
        filters: DimensionFilters,
        row_limit: u32,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            source,
            site_url: site_url.into(),
            filters,
            row_limit: row_limit.max(1),
            backoff,
            days: window.days().collect(),
            day_idx: 0,
            offset: 0,
            day_rows: 0,
            pages_fetched: 0,
            finished: false,
        }
    }

    /// Position of the next request, `None` once the sequence has ended.
    pub fn cursor(&self) -> Option<PageCursor> {
        if self.finished {
            return None;
        }
        self.days.get(self.day_idx).map(|day| PageCursor {
            day: *day,
            offset: self.offset,
        })
    }

    /// Source requests that returned successfully so far.
    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Next non-empty page, `Ok(None)` when the window is exhausted. After an
    /// error the sequence is over and further calls return `Ok(None)`.
    pub async fn next_page(&mut self) -> Result<Option<Page>, SyncError> {
        loop {
            let Some(cursor) = self.cursor() else {
                self.finished = true;
                return Ok(None);
            };

            let rows = match self.fetch_with_retry(cursor).await {
                Ok(rows) => rows,
                Err(err) => {
                    self.finished = true;
                    return Err(err);
                }
            };
            self.pages_fetched += 1;
            self.day_rows += rows.len();

            if rows.len() < self.row_limit as usize {
                info!(day = %cursor.day, rows = self.day_rows, "day fetched");
                self.day_idx += 1;
                self.offset = 0;
                self.day_rows = 0;
            } else {
                self.offset += u64::from(self.row_limit);
            }

            if !rows.is_empty() {
                return Ok(Some(Page { cursor, rows }));
            }
        }
    }

    async fn fetch_with_retry(&self, cursor: PageCursor) -> Result<Vec<AnalyticsRow>, SyncError> {
        let query = SourceQuery {
            site_url: self.site_url.clone(),
            window: SyncWindow::single_day(cursor.day),
            filters: self.filters.clone(),
            limit: self.row_limit,
            offset: cursor.offset,
        };

        let mut attempt = 0usize;
        loop {
            match self.source.query(&query).await {
                Ok(rows) => return Ok(rows),
                Err(err) => {
                    let retryable = matches!(
                        err.disposition(),
                        RetryDisposition::Throttled | RetryDisposition::Transient
                    );
                    if retryable && attempt < self.backoff.max_retries {
                        let delay = self.backoff.retry_delay(attempt, err.retry_after());
                        warn!(
                            %cursor,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "source fetch failed; backing off"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(SyncError::SourceFetch {
                        cursor,
                        attempts: attempt + 1,
                        source: err,
                    });
                }
            }
        }
    }
}
