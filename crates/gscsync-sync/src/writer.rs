use std::future::Future;

use gscsync_adapters::RecordStore;
use gscsync_core::{DestinationRecord, RecordId, RowKey};
use gscsync_http::{ApiError, BackoffPolicy, Pacer, RetryDisposition};
use tracing::{debug, warn};

use crate::upsert::UpsertAction;
use crate::{DestinationWriteError, WriteOperation};

#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub operation: WriteOperation,
    pub record: DestinationRecord,
    /// Rate-limit responses absorbed before the call went through.
    pub throttle_retries: usize,
}

/// Single gateway to the destination store. Every request, lookups
/// included, first waits on the pacer; throttled requests are retried with
/// backoff, anything else fails the row at once.
pub struct RateLimitedWriter<'a, S: RecordStore + ?Sized> {
    store: &'a S,
    pacer: Pacer,
    backoff: BackoffPolicy,
    requests_sent: usize,
    throttle_retries: usize,
}

impl<'a, S: RecordStore + ?Sized> RateLimitedWriter<'a, S> {
    pub fn new(store: &'a S, pacer: Pacer, backoff: BackoffPolicy) -> Self {
        Self {
            store,
            pacer,
            backoff,
            requests_sent: 0,
            throttle_retries: 0,
        }
    }

    pub fn requests_sent(&self) -> usize {
        self.requests_sent
    }

    /// Throttle retries across all requests made through this writer.
    pub fn throttle_retries(&self) -> usize {
        self.throttle_retries
    }

    pub async fn find_by_key(
        &mut self,
        key: &RowKey,
    ) -> Result<Vec<RecordId>, DestinationWriteError> {
        let store = self.store;
        let (ids, _) = self
            .paced(key, WriteOperation::Lookup, || store.find_by_key(key))
            .await?;
        Ok(ids)
    }

    pub async fn execute(
        &mut self,
        action: &UpsertAction,
    ) -> Result<WriteOutcome, DestinationWriteError> {
        let store = self.store;
        let (record, throttle_retries) = match action {
            UpsertAction::Create { properties } => {
                self.paced(&properties.key, WriteOperation::Create, || {
                    store.create(properties)
                })
                .await?
            }
            UpsertAction::Update { id, properties } => {
                self.paced(&properties.key, WriteOperation::Update, || {
                    store.update(id, properties)
                })
                .await?
            }
        };
        debug!(key = %record.properties.key, id = %record.id, operation = %action.operation(), "write applied");
        Ok(WriteOutcome {
            operation: action.operation(),
            record,
            throttle_retries,
        })
    }

    async fn paced<T, F, Fut>(
        &mut self,
        key: &RowKey,
        operation: WriteOperation,
        mut call: F,
    ) -> Result<(T, usize), DestinationWriteError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut retries = 0usize;
        loop {
            self.pacer.wait().await;
            self.requests_sent += 1;

            let err = match call().await {
                Ok(value) => return Ok((value, retries)),
                Err(err) => err,
            };

            if err.disposition() == RetryDisposition::Throttled && retries < self.backoff.max_retries {
                let delay = self.backoff.retry_delay(retries, err.retry_after());
                warn!(
                    %key,
                    %operation,
                    attempt = retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    "destination throttled; backing off"
                );
                tokio::time::sleep(delay).await;
                retries += 1;
                self.throttle_retries += 1;
                continue;
            }

            return Err(DestinationWriteError {
                key: key.clone(),
                operation,
                attempts: retries + 1,
                source: err,
            });
        }
    }
}
