//! Sync engine: window planning, paginated extraction, key-based upsert and
//! paced destination writes, driven by [`SyncOrchestrator`].

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use gscsync_adapters::{AnalyticsSource, PropertySchema, RecordStore, SiteEntry, MAX_ROW_LIMIT};
use gscsync_core::{
    AnalyticsRow, DimensionFilters, RowKey, SyncWindow, WindowError, WindowRequest, DATE_FORMAT,
};
use gscsync_http::{ApiError, BackoffPolicy, Pacer, MIN_RATE_PER_SEC};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod paginator;
pub mod report;
pub mod upsert;
pub mod writer;

pub use config::{load_property_schema, EnvConfig};
pub use paginator::{Page, SourcePaginator};
pub use report::{persist_run_report, write_run_report};
pub use upsert::{decide, LookupAmbiguity, UpsertAction, UpsertDecision, UpsertPlanner};
pub use writer::{RateLimitedWriter, WriteOutcome};

pub const CRATE_NAME: &str = "gscsync-sync";

pub const DEFAULT_DAYS_BACK: u32 = 3;
pub const DEFAULT_LAG_DAYS: u32 = 2;
pub const DEFAULT_WRITE_RATE_PER_SEC: f64 = 3.0;

/// Where the paginator stands: the day being fetched and the row offset
/// within that day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageCursor {
    pub day: NaiveDate,
    pub offset: u64,
}

impl fmt::Display for PageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.day.format(DATE_FORMAT), self.offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOperation {
    Lookup,
    Create,
    Update,
}

impl fmt::Display for WriteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WriteOperation::Lookup => "lookup",
            WriteOperation::Create => "create",
            WriteOperation::Update => "update",
        })
    }
}

/// Run-level failures. Any of these ends the run in [`RunState::Failed`].
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid window: {0}")]
    InvalidWindow(#[from] WindowError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("source fetch failed at {cursor} after {attempts} attempt(s): {source}")]
    SourceFetch {
        cursor: PageCursor,
        attempts: usize,
        #[source]
        source: ApiError,
    },
    #[error("run cancelled")]
    Cancelled,
}

/// Row-scoped failure: recorded in the report, the run carries on.
#[derive(Debug, Error)]
#[error("destination {operation} failed for {key} after {attempts} attempt(s): {source}")]
pub struct DestinationWriteError {
    pub key: RowKey,
    pub operation: WriteOperation,
    pub attempts: usize,
    #[source]
    pub source: ApiError,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub site_url: String,
    pub window: WindowRequest,
    pub filters: DimensionFilters,
    pub row_limit: u32,
    pub write_rate_per_sec: f64,
    pub source_backoff: BackoffPolicy,
    pub destination_backoff: BackoffPolicy,
    pub reports_dir: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            site_url: String::new(),
            window: WindowRequest::relative(DEFAULT_DAYS_BACK, DEFAULT_LAG_DAYS),
            filters: DimensionFilters::default(),
            row_limit: MAX_ROW_LIMIT,
            write_rate_per_sec: DEFAULT_WRITE_RATE_PER_SEC,
            source_backoff: BackoffPolicy::default(),
            destination_backoff: BackoffPolicy::default(),
            reports_dir: None,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.site_url.trim().is_empty() {
            return Err(SyncError::InvalidConfig("site url is empty".into()));
        }
        if !(1..=MAX_ROW_LIMIT).contains(&self.row_limit) {
            return Err(SyncError::InvalidConfig(format!(
                "row limit {} outside 1..={MAX_ROW_LIMIT}",
                self.row_limit
            )));
        }
        if !self.write_rate_per_sec.is_finite() || self.write_rate_per_sec < MIN_RATE_PER_SEC {
            return Err(SyncError::InvalidConfig(format!(
                "write rate {} below minimum {MIN_RATE_PER_SEC}/s",
                self.write_rate_per_sec
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Planning,
    Fetching,
    Reconciling,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RowFailure {
    pub key: RowKey,
    pub operation: WriteOperation,
    pub attempts: usize,
    pub message: String,
}

impl From<&DestinationWriteError> for RowFailure {
    fn from(err: &DestinationWriteError) -> Self {
        Self {
            key: err.key.clone(),
            operation: err.operation,
            attempts: err.attempts,
            message: err.source.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub site_url: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: RunState,
    pub window: Option<SyncWindow>,
    pub pages_fetched: usize,
    pub rows_fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub destination_requests: usize,
    pub throttle_retries: usize,
    pub failures: Vec<RowFailure>,
    pub ambiguities: Vec<LookupAmbiguity>,
    #[serde(skip)]
    pub fatal: Option<SyncError>,
}

impl SyncReport {
    fn new(run_id: Uuid, site_url: &str) -> Self {
        Self {
            run_id,
            site_url: site_url.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            state: RunState::Planning,
            window: None,
            pages_fetched: 0,
            rows_fetched: 0,
            created: 0,
            updated: 0,
            destination_requests: 0,
            throttle_retries: 0,
            failures: Vec::new(),
            ambiguities: Vec::new(),
            fatal: None,
        }
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// 0 = done without row failures, 1 = run failed, 2 = done with row failures.
    pub fn exit_code(&self) -> i32 {
        match self.state {
            RunState::Done if self.failures.is_empty() => 0,
            RunState::Done => 2,
            _ => 1,
        }
    }

    fn transition(&mut self, next: RunState) {
        if self.state != next {
            tracing::debug!(from = ?self.state, to = ?next, "run state");
            self.state = next;
        }
    }

    fn finish(mut self, state: RunState, fatal: Option<SyncError>) -> Self {
        self.transition(state);
        self.fatal = fatal;
        self.finished_at = Some(Utc::now());
        self
    }
}

/// Shared abort switch, checked between rows and between pages.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct SyncOrchestrator<'a, S: AnalyticsSource + ?Sized, D: RecordStore + ?Sized> {
    config: SyncConfig,
    source: &'a S,
    store: &'a D,
    cancel: CancelFlag,
}

impl<'a, S: AnalyticsSource + ?Sized, D: RecordStore + ?Sized> SyncOrchestrator<'a, S, D> {
    pub fn new(config: SyncConfig, source: &'a S, store: &'a D) -> Self {
        Self {
            config,
            source,
            store,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run once with the current UTC date as "today".
    pub async fn run_today(&self) -> SyncReport {
        self.run(Utc::now().date_naive()).await
    }

    pub async fn run(&self, today: NaiveDate) -> SyncReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, site = %self.config.site_url);
        let report = self.run_inner(run_id, today).instrument(span.clone()).await;
        span.in_scope(|| match &report.fatal {
            None => info!(
                created = report.created,
                updated = report.updated,
                failed = report.failed(),
                "sync finished"
            ),
            Some(err) => warn!(
                error = %err,
                created = report.created,
                updated = report.updated,
                failed = report.failed(),
                "sync failed"
            ),
        });
        report
    }

    async fn run_inner(&self, run_id: Uuid, today: NaiveDate) -> SyncReport {
        let mut report = SyncReport::new(run_id, &self.config.site_url);

        if let Err(err) = self.config.validate() {
            return report.finish(RunState::Failed, Some(err));
        }
        let window = match self.config.window.plan(today) {
            Ok(window) => window,
            Err(err) => return report.finish(RunState::Failed, Some(err.into())),
        };
        if window.end() >= today {
            warn!(%window, "window reaches today; the source may not have complete data yet");
        }
        info!(%window, "sync window");
        report.window = Some(window);

        let mut paginator = SourcePaginator::new(
            self.source,
            self.config.site_url.clone(),
            window,
            self.config.filters.clone(),
            self.config.row_limit,
            self.config.source_backoff,
        );
        let mut writer = RateLimitedWriter::new(
            self.store,
            Pacer::per_second(self.config.write_rate_per_sec),
            self.config.destination_backoff,
        );
        let planner = UpsertPlanner;

        let fatal = loop {
            if self.cancel.is_cancelled() {
                break Some(SyncError::Cancelled);
            }
            report.transition(RunState::Fetching);
            let page = match paginator.next_page().await {
                Ok(Some(page)) => page,
                Ok(None) => break None,
                Err(err) => break Some(err),
            };
            report.pages_fetched = paginator.pages_fetched();
            report.rows_fetched += page.rows.len();

            report.transition(RunState::Reconciling);
            let mut cancelled = false;
            for row in &page.rows {
                if self.cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                self.reconcile_row(&planner, &mut writer, row, &mut report).await;
            }
            if cancelled {
                break Some(SyncError::Cancelled);
            }
        };

        report.pages_fetched = paginator.pages_fetched();
        report.destination_requests = writer.requests_sent();
        report.throttle_retries = writer.throttle_retries();
        match fatal {
            None => report.finish(RunState::Done, None),
            Some(err) => report.finish(RunState::Failed, Some(err)),
        }
    }

    async fn reconcile_row(
        &self,
        planner: &UpsertPlanner,
        writer: &mut RateLimitedWriter<'_, D>,
        row: &AnalyticsRow,
        report: &mut SyncReport,
    ) {
        let key = row.key();
        let result = match planner.plan(writer, row, key).await {
            Ok(decision) => {
                if let Some(ambiguity) = decision.ambiguity {
                    report.ambiguities.push(ambiguity);
                }
                writer.execute(&decision.action).await
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(outcome) => match outcome.operation {
                WriteOperation::Create => report.created += 1,
                WriteOperation::Update => report.updated += 1,
                WriteOperation::Lookup => {}
            },
            Err(err) => {
                warn!(error = %err, "row failed");
                report.failures.push(RowFailure::from(&err));
            }
        }
    }
}

/// Build both API clients from the environment, run once, and write the run
/// report when a reports directory is configured.
pub async fn run_sync_once_from_env(
    config: SyncConfig,
    schema: PropertySchema,
    cancel: CancelFlag,
) -> anyhow::Result<SyncReport> {
    let env = EnvConfig::from_env();
    let client = gscsync_http::build_client(&env.http_config())?;
    let source = env.search_console(client.clone())?;
    let store = env.notion(client, schema)?;

    let reports_dir = config.reports_dir.clone();
    let report = SyncOrchestrator::new(config, &source, &store)
        .with_cancel_flag(cancel)
        .run_today()
        .await;

    if let Some(dir) = reports_dir {
        persist_run_report(&dir, &report).await;
    }
    Ok(report)
}

pub async fn list_sites_from_env() -> anyhow::Result<Vec<SiteEntry>> {
    let env = EnvConfig::from_env();
    let client = gscsync_http::build_client(&env.http_config())?;
    let source = env.search_console(client)?;
    Ok(source.list_sites().await?)
}
