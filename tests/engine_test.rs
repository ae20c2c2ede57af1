//! End-to-end tests for the dispatcher, runner and recovery sweeper,
//! with stubbed collaborators.

mod common;

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use snapsum::config::EngineConfig;
use snapsum::database::SqlxJobStore;
use snapsum::database::models::NewJob;
use snapsum::database::store::JobStore;
use snapsum::engine::{Dispatcher, RecoverySweeper};
use snapsum::services::metadata::{FetchError, MetadataFetcher, VideoMetadata};
use snapsum::services::summary::{GenerationError, SummaryGenerator};

/// Configurable fetcher stub: records call order, optionally sleeps,
/// optionally always fails.
struct StubFetcher {
    calls: Arc<StdMutex<Vec<String>>>,
    delay: Duration,
    fail: bool,
}

impl StubFetcher {
    fn ok() -> Self {
        Self {
            calls: Arc::new(StdMutex::new(Vec::new())),
            delay: Duration::ZERO,
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::ok()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::ok()
        }
    }
}

#[async_trait]
impl MetadataFetcher for StubFetcher {
    async fn fetch(&self, video_url: &str) -> Result<VideoMetadata, FetchError> {
        self.calls.lock().unwrap().push(video_url.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(FetchError::Status { status: 502 });
        }
        Ok(VideoMetadata {
            title: "Quick pasta recipe #cooking".to_string(),
            author: "chef".to_string(),
            hashtags: vec!["cooking".to_string()],
            thumbnail_url: None,
        })
    }
}

struct StubGenerator;

#[async_trait]
impl SummaryGenerator for StubGenerator {
    async fn generate(&self, _metadata: &VideoMetadata) -> Result<String, GenerationError> {
        Ok("A concise summary of the clip.".to_string())
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_poll_interval_ms(20)
        .with_retry_delay_secs(0)
        .with_sweep_interval_secs(0)
}

fn new_job(id: &str) -> NewJob {
    NewJob::new(id, format!("https://example.com/video/{id}"))
}

/// Poll the store until the job reaches the given status.
async fn wait_for_status(
    store: &dyn JobStore,
    id: &str,
    status: &str,
    timeout: Duration,
) -> snapsum::database::models::JobRecord {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(record) = store.get(id).await.unwrap()
            && record.status == status
        {
            return record;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("job {id} did not reach {status} within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_end_to_end_success() {
    let (_dir, pool) = common::test_db().await;
    let store: Arc<dyn JobStore> = Arc::new(SqlxJobStore::new(pool));

    store.enqueue(new_job("123")).await.unwrap();

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::new(StubFetcher::ok()),
        Arc::new(StubGenerator),
        fast_config(),
    ));
    dispatcher.start().await.unwrap();

    let record = wait_for_status(store.as_ref(), "123", "COMPLETED", Duration::from_secs(10)).await;
    assert!(record.completed_at.is_some());
    assert_eq!(record.progress_percent, 100);
    let result = record.summary_result().unwrap().unwrap();
    assert!(!result.summary.is_empty());
    assert_eq!(result.keywords, vec!["cooking"]);

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_job() {
    let (_dir, pool) = common::test_db().await;
    let store: Arc<dyn JobStore> = Arc::new(SqlxJobStore::new(pool));

    store.enqueue(new_job("123")).await.unwrap();

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::new(StubFetcher::failing()),
        Arc::new(StubGenerator),
        fast_config(),
    ));
    dispatcher.start().await.unwrap();

    let record = wait_for_status(store.as_ref(), "123", "FAILED", Duration::from_secs(10)).await;
    assert_eq!(record.attempt_count, 3);
    let failure = record.failure_info().unwrap().unwrap();
    assert_eq!(failure.code, "FetchError");
    assert!(!failure.message.is_empty());

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrency_bound_holds() {
    let (_dir, pool) = common::test_db().await;
    let store: Arc<dyn JobStore> = Arc::new(SqlxJobStore::new(pool));

    for i in 0..10 {
        store.enqueue(new_job(&format!("job{i}"))).await.unwrap();
    }

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::new(StubFetcher::slow(Duration::from_millis(150))),
        Arc::new(StubGenerator),
        fast_config(),
    ));
    dispatcher.start().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let processing = store.list_processing().await.unwrap();
        assert!(
            processing.len() <= 3,
            "concurrency bound violated: {} jobs processing",
            processing.len()
        );

        let counts = store.counts().await.unwrap();
        if counts.completed == 10 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "jobs did not finish in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    dispatcher.stop().await.unwrap();
}

#[tokio::test]
async fn test_dispatch_tie_break_by_id() {
    let (_dir, pool) = common::test_db().await;
    let store: Arc<dyn JobStore> = Arc::new(SqlxJobStore::new(pool.clone()));

    store.enqueue(new_job("b")).await.unwrap();
    store.enqueue(new_job("a")).await.unwrap();
    sqlx::query("UPDATE job SET queued_at = '2026-01-01T00:00:00+00:00'")
        .execute(&pool)
        .await
        .unwrap();

    let fetcher = Arc::new(StubFetcher::ok());
    let calls = Arc::clone(&fetcher.calls);

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        fetcher,
        Arc::new(StubGenerator),
        fast_config().with_max_concurrent(1),
    ));
    dispatcher.start().await.unwrap();

    wait_for_status(store.as_ref(), "a", "COMPLETED", Duration::from_secs(10)).await;
    wait_for_status(store.as_ref(), "b", "COMPLETED", Duration::from_secs(10)).await;
    dispatcher.stop().await.unwrap();

    let order = calls.lock().unwrap().clone();
    assert_eq!(order.len(), 2);
    assert!(order[0].ends_with("/a"), "expected a first, got {order:?}");
}

#[tokio::test]
async fn test_failed_start_leaves_dispatcher_restartable() {
    let (_dir, pool) = common::test_db().await;
    let store: Arc<dyn JobStore> = Arc::new(SqlxJobStore::new(pool.clone()));

    // A closed pool makes the startup sweep fail.
    pool.close().await;

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::new(StubFetcher::ok()),
        Arc::new(StubGenerator),
        fast_config(),
    ));

    assert!(matches!(
        dispatcher.start().await.unwrap_err(),
        snapsum::Error::DatabaseSqlx(_)
    ));
    // A retry hits the same sweep failure, not an "already started" state.
    assert!(matches!(
        dispatcher.start().await.unwrap_err(),
        snapsum::Error::DatabaseSqlx(_)
    ));
}

#[tokio::test]
async fn test_concurrency_bound_holds_with_leftover_processing_row() {
    let (_dir, pool) = common::test_db().await;
    let store: Arc<dyn JobStore> = Arc::new(SqlxJobStore::new(pool));

    // A fresh processing row from a previous process: within the staleness
    // threshold, so the sweeper leaves it and no runner owns it.
    store.enqueue(new_job("leftover")).await.unwrap();
    store.claim("leftover").await.unwrap();

    for i in 0..6 {
        store.enqueue(new_job(&format!("job{i}"))).await.unwrap();
    }

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::new(StubFetcher::slow(Duration::from_millis(100))),
        Arc::new(StubGenerator),
        fast_config().with_max_concurrent(2),
    ));
    dispatcher.start().await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let processing = store.list_processing().await.unwrap();
        assert!(
            processing.len() <= 2,
            "concurrency bound violated: {} jobs processing",
            processing.len()
        );

        let counts = store.counts().await.unwrap();
        if counts.completed == 6 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "jobs did not finish in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    dispatcher.stop().await.unwrap();
    assert_eq!(
        store.get("leftover").await.unwrap().unwrap().status,
        "PROCESSING"
    );
}

#[tokio::test]
async fn test_sweep_requeues_stalled_jobs() {
    let (_dir, pool) = common::test_db().await;
    let store: Arc<dyn JobStore> = Arc::new(SqlxJobStore::new(pool.clone()));

    // One stalled job, one fresh processing job.
    store.enqueue(new_job("stalled")).await.unwrap();
    store.claim("stalled").await.unwrap();
    store.record_attempt("stalled", 2).await.unwrap();
    sqlx::query("UPDATE job SET started_at = '2020-01-01T00:00:00+00:00' WHERE id = 'stalled'")
        .execute(&pool)
        .await
        .unwrap();

    store.enqueue(new_job("fresh")).await.unwrap();
    store.claim("fresh").await.unwrap();

    let sweeper = RecoverySweeper::new(Arc::clone(&store), Duration::from_secs(300));
    assert_eq!(sweeper.sweep().await.unwrap(), 1);

    let stalled = store.get("stalled").await.unwrap().unwrap();
    assert_eq!(stalled.status, "QUEUED");
    assert_eq!(stalled.attempt_count, 2);
    assert!(stalled.started_at.is_none());

    let fresh = store.get("fresh").await.unwrap().unwrap();
    assert_eq!(fresh.status, "PROCESSING");

    // Back-to-back sweeps are idempotent.
    assert_eq!(sweeper.sweep().await.unwrap(), 0);
}

#[tokio::test]
async fn test_startup_sweep_recovers_abandoned_jobs() {
    let (_dir, pool) = common::test_db().await;
    let store: Arc<dyn JobStore> = Arc::new(SqlxJobStore::new(pool.clone()));

    // Simulate a job left processing by a previous process.
    store.enqueue(new_job("orphan")).await.unwrap();
    store.claim("orphan").await.unwrap();
    sqlx::query("UPDATE job SET started_at = '2020-01-01T00:00:00+00:00' WHERE id = 'orphan'")
        .execute(&pool)
        .await
        .unwrap();

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::new(StubFetcher::ok()),
        Arc::new(StubGenerator),
        fast_config(),
    ));
    dispatcher.start().await.unwrap();

    let record =
        wait_for_status(store.as_ref(), "orphan", "COMPLETED", Duration::from_secs(10)).await;
    assert!(record.completed_at.is_some());

    dispatcher.stop().await.unwrap();
}
