mod common;

use std::time::Duration;

use common::{row, FakeStore};
use gscsync_core::RowProperties;
use gscsync_http::{BackoffPolicy, Pacer};
use gscsync_sync::{RateLimitedWriter, UpsertAction, UpsertPlanner, WriteOperation};
use tokio::time::Instant;

fn backoff() -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_secs(1),
    }
}

#[tokio::test(start_paused = true)]
async fn create_succeeds_after_two_throttles() {
    let store = FakeStore::new().throttle_next_writes(2, None);
    let mut writer = RateLimitedWriter::new(&store, Pacer::per_second(10.0), backoff());
    let r = row("2025-08-01", "boots", 4);

    let outcome = writer
        .execute(&UpsertAction::Create {
            properties: RowProperties::from_row(r.key(), &r),
        })
        .await
        .expect("write succeeds");

    assert_eq!(outcome.operation, WriteOperation::Create);
    assert_eq!(outcome.throttle_retries, 2);
    assert_eq!(outcome.record.properties.key, r.key());
    assert_eq!(writer.requests_sent(), 3);
    assert_eq!(writer.throttle_retries(), 2);
}

#[tokio::test(start_paused = true)]
async fn longer_retry_after_hint_is_honoured() {
    let store = FakeStore::new().throttle_next_writes(1, Some(Duration::from_secs(5)));
    let mut writer = RateLimitedWriter::new(&store, Pacer::per_second(10.0), backoff());
    let r = row("2025-08-01", "boots", 4);

    let started = Instant::now();
    writer
        .execute(&UpsertAction::Create {
            properties: RowProperties::from_row(r.key(), &r),
        })
        .await
        .expect("write succeeds");

    assert!(started.elapsed() >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn planner_looks_up_through_the_writer() {
    let existing = row("2025-08-01", "boots", 1);
    let store = FakeStore::new().seeded("page-1", RowProperties::from_row(existing.key(), &existing));
    let mut writer = RateLimitedWriter::new(&store, Pacer::per_second(10.0), backoff());

    let fresh = row("2025-08-01", "boots", 6);
    let decision = UpsertPlanner
        .plan(&mut writer, &fresh, fresh.key())
        .await
        .expect("lookup succeeds");

    match decision.action {
        UpsertAction::Update { id, properties } => {
            assert_eq!(id.as_str(), "page-1");
            assert_eq!(properties.clicks, 6);
        }
        other => panic!("expected update, got {other:?}"),
    }
    assert_eq!(writer.requests_sent(), 1);
}
