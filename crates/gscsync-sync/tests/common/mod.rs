#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use gscsync_adapters::{AnalyticsSource, RecordStore, SiteEntry, SourceQuery};
use gscsync_core::{AnalyticsRow, DestinationRecord, RecordId, RowKey, RowProperties};
use gscsync_http::ApiError;
use tokio::time::Instant;

pub fn day(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

pub fn row(date: &str, query: &str, clicks: u64) -> AnalyticsRow {
    AnalyticsRow {
        date: day(date),
        query: query.into(),
        page: "https://shop.test/boots".into(),
        country: "FRA".into(),
        device: "MOBILE".into(),
        clicks,
        impressions: clicks * 10 + 5,
        ctr: clicks as f64 / (clicks * 10 + 5) as f64,
        position: 3.5,
    }
}

/// Row for query "shoes" on page "/a" from France.
pub fn shoes_row(device: &str, clicks: u64) -> AnalyticsRow {
    AnalyticsRow {
        page: "/a".into(),
        country: "FR".into(),
        device: device.into(),
        ..row("2025-08-01", "shoes", clicks)
    }
}

pub fn http_status(status: u16) -> ApiError {
    ApiError::HttpStatus {
        status,
        url: "http://fake.test".into(),
        body: String::new(),
    }
}

pub fn throttled(retry_after: Option<Duration>) -> ApiError {
    ApiError::Throttled {
        url: "http://fake.test".into(),
        retry_after,
    }
}

/// Analytics source serving fixed pages per (day, offset). Unknown cursors
/// return an empty page.
#[derive(Default)]
pub struct FakeSource {
    pages: HashMap<(NaiveDate, u64), Vec<AnalyticsRow>>,
    errors: Mutex<HashMap<(NaiveDate, u64), VecDeque<ApiError>>>,
    always_fail: HashSet<(NaiveDate, u64)>,
    calls: Mutex<Vec<(NaiveDate, u64)>>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, date: &str, offset: u64, rows: Vec<AnalyticsRow>) -> Self {
        self.pages.insert((day(date), offset), rows);
        self
    }

    /// Errors served, one per call, before the page at this cursor.
    pub fn fail_first(self, date: &str, offset: u64, err: ApiError) -> Self {
        self.errors
            .lock()
            .unwrap()
            .entry((day(date), offset))
            .or_default()
            .push_back(err);
        self
    }

    pub fn always_fail(mut self, date: &str, offset: u64) -> Self {
        self.always_fail.insert((day(date), offset));
        self
    }

    pub fn calls(&self) -> Vec<(NaiveDate, u64)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AnalyticsSource for FakeSource {
    async fn query(&self, query: &SourceQuery) -> Result<Vec<AnalyticsRow>, ApiError> {
        assert_eq!(query.window.start(), query.window.end(), "one day per request");
        let cursor = (query.window.start(), query.offset);
        self.calls.lock().unwrap().push(cursor);

        if self.always_fail.contains(&cursor) {
            return Err(http_status(503));
        }
        if let Some(err) = self
            .errors
            .lock()
            .unwrap()
            .get_mut(&cursor)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        let rows = self.pages.get(&cursor).cloned().unwrap_or_default();
        assert!(rows.len() <= query.limit as usize, "page larger than limit");
        Ok(rows)
    }

    async fn list_sites(&self) -> Result<Vec<SiteEntry>, ApiError> {
        Ok(Vec::new())
    }
}

/// In-memory record store. Lookups and writes can be throttled or rejected
/// per key; every request's (virtual) dispatch time is recorded.
#[derive(Default)]
pub struct FakeStore {
    records: Mutex<Vec<DestinationRecord>>,
    next_id: Mutex<usize>,
    throttle_next_writes: Mutex<usize>,
    throttle_retry_after: Option<Duration>,
    throttle_keys: HashSet<RowKey>,
    reject_keys: HashSet<RowKey>,
    throttle_lookup_keys: HashSet<RowKey>,
    reject_lookup_keys: HashSet<RowKey>,
    lookups: Mutex<Vec<RowKey>>,
    request_times: Mutex<Vec<Instant>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded(self, id: &str, properties: RowProperties) -> Self {
        self.records.lock().unwrap().push(DestinationRecord {
            id: RecordId::new(id),
            properties,
        });
        self
    }

    pub fn throttle_next_writes(self, count: usize, retry_after: Option<Duration>) -> Self {
        *self.throttle_next_writes.lock().unwrap() = count;
        Self {
            throttle_retry_after: retry_after,
            ..self
        }
    }

    pub fn always_throttle(mut self, key: RowKey) -> Self {
        self.throttle_keys.insert(key);
        self
    }

    pub fn reject(mut self, key: RowKey) -> Self {
        self.reject_keys.insert(key);
        self
    }

    pub fn always_throttle_lookup(mut self, key: RowKey) -> Self {
        self.throttle_lookup_keys.insert(key);
        self
    }

    pub fn reject_lookup(mut self, key: RowKey) -> Self {
        self.reject_lookup_keys.insert(key);
        self
    }

    pub fn lookups(&self) -> Vec<RowKey> {
        self.lookups.lock().unwrap().clone()
    }

    pub fn records(&self) -> Vec<DestinationRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn request_times(&self) -> Vec<Instant> {
        self.request_times.lock().unwrap().clone()
    }

    fn record_request(&self) {
        self.request_times.lock().unwrap().push(Instant::now());
    }

    fn gate_write(&self, key: &RowKey) -> Result<(), ApiError> {
        if self.reject_keys.contains(key) {
            return Err(http_status(400));
        }
        if self.throttle_keys.contains(key) {
            return Err(throttled(self.throttle_retry_after));
        }
        let mut pending = self.throttle_next_writes.lock().unwrap();
        if *pending > 0 {
            *pending -= 1;
            return Err(throttled(self.throttle_retry_after));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FakeStore {
    async fn find_by_key(&self, key: &RowKey) -> Result<Vec<RecordId>, ApiError> {
        self.record_request();
        self.lookups.lock().unwrap().push(key.clone());
        if self.reject_lookup_keys.contains(key) {
            return Err(http_status(400));
        }
        if self.throttle_lookup_keys.contains(key) {
            return Err(throttled(self.throttle_retry_after));
        }
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|record| &record.properties.key == key)
            .map(|record| record.id.clone())
            .collect())
    }

    async fn create(&self, properties: &RowProperties) -> Result<DestinationRecord, ApiError> {
        self.record_request();
        self.gate_write(&properties.key)?;
        let mut next_id = self.next_id.lock().unwrap();
        *next_id += 1;
        let record = DestinationRecord {
            id: RecordId::new(format!("page-{}", *next_id)),
            properties: properties.clone(),
        };
        self.records.lock().unwrap().push(record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        id: &RecordId,
        properties: &RowProperties,
    ) -> Result<DestinationRecord, ApiError> {
        self.record_request();
        self.gate_write(&properties.key)?;
        let mut records = self.records.lock().unwrap();
        let record = records
            .iter_mut()
            .find(|record| &record.id == id)
            .ok_or_else(|| http_status(404))?;
        record.properties = properties.clone();
        Ok(record.clone())
    }
}
