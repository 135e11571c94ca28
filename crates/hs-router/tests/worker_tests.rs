//! QueueWorker Tests
//!
//! End-to-end through the embedded SQLite queue: poll, dispatch, settle.

mod common;

use common::*;
use hs_common::{PendingRequestStatus, SYNC_RESPONSE_MESSAGE_TYPE, MESSAGE_TYPE_PROPERTY};
use hs_queue::sqlite::SqliteQueue;
use hs_queue::{EmbeddedQueue, QueueConsumer, QueuePublisher};
use hs_router::{
    DispatcherConfig, HearingDelivery, MessageDispatcher, QueueWorker, WorkerConfig,
};
use hs_store::PendingRequestRepository;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_test::assert_ok;

const BODY: &str = r#"{"hearingDetails":{"venue":"Taylor House"}}"#;

struct WorkerHarness {
    api: Arc<ScriptedHearingApiClient>,
    inbound: Arc<SqliteQueue>,
    outbound: Arc<SqliteQueue>,
    repository: Arc<hs_store::SqlitePendingRequestRepository>,
    worker: QueueWorker,
}

impl WorkerHarness {
    async fn new() -> Self {
        Self::with_api(ScriptedHearingApiClient::new()).await
    }

    async fn with_api(api: ScriptedHearingApiClient) -> Self {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let inbound = Arc::new(SqliteQueue::new(pool.clone(), "hearings-inbound".to_string(), 30));
        let outbound = Arc::new(SqliteQueue::new(pool, "hearings-outbound".to_string(), 30));
        inbound.init_schema().await.unwrap();

        let api = Arc::new(api);
        let repository = sqlite_repository().await;
        let delivery = Arc::new(HearingDelivery::new(
            api.clone(),
            outbound.clone(),
            Duration::from_secs(5),
        ));
        let dispatcher = Arc::new(MessageDispatcher::new(
            repository.clone(),
            delivery,
            DispatcherConfig {
                max_delivery_count: MAX_DELIVERY_COUNT,
                deployment_id: DEPLOYMENT.to_string(),
            },
        ));
        let worker = QueueWorker::new(
            "worker-0",
            inbound.clone(),
            dispatcher,
            WorkerConfig {
                batch_size: 10,
                poll_interval: Duration::from_millis(20),
            },
        );

        Self {
            api,
            inbound,
            outbound,
            repository,
            worker,
        }
    }
}

#[tokio::test]
async fn test_delivered_message_is_removed_and_sync_published() {
    let harness = WorkerHarness::new().await;
    harness
        .inbound
        .publish(hearing_message("REQUEST_HEARING", "1001", BODY))
        .await
        .unwrap();

    assert_eq!(assert_ok!(harness.worker.run_once().await), 1);
    assert_eq!(assert_ok!(harness.worker.run_once().await), 0);

    let metrics = harness.inbound.get_metrics().await.unwrap().unwrap();
    assert_eq!(metrics.pending_messages, 0);
    assert_eq!(metrics.in_flight_messages, 0);

    let sync = harness.outbound.poll(10).await.unwrap();
    assert_eq!(sync.len(), 1);
    assert_eq!(
        sync[0].message.property(MESSAGE_TYPE_PROPERTY),
        Some(SYNC_RESPONSE_MESSAGE_TYPE)
    );

    let row = harness.repository.find_latest_by_hearing_id(1001).await.unwrap().unwrap();
    assert_eq!(row.status, PendingRequestStatus::Completed);
}

#[tokio::test]
async fn test_malformed_message_lands_in_dead_letters() {
    let harness = WorkerHarness::new().await;
    harness
        .inbound
        .publish(hearing_message("CANCEL_HEARING", "1001", BODY))
        .await
        .unwrap();

    assert_ok!(harness.worker.run_once().await);

    let dead = harness.inbound.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, "malformed message");
    assert_eq!(dead[0].delivery_count, 1);
    assert!(dead[0].description.contains("CANCEL_HEARING"));
    assert!(harness.api.calls().is_empty());
}

#[tokio::test]
async fn test_retryable_failure_is_redelivered_until_dead_lettered() {
    let harness = WorkerHarness::new().await;
    for _ in 0..MAX_DELIVERY_COUNT {
        harness
            .api
            .respond(Err(rejected(500, 5000, "Downstream unavailable")));
    }
    harness
        .inbound
        .publish(hearing_message("AMEND_HEARING", "1001", BODY))
        .await
        .unwrap();

    for _ in 0..MAX_DELIVERY_COUNT {
        assert_eq!(harness.worker.run_once().await.unwrap(), 1);
    }
    assert_eq!(harness.worker.run_once().await.unwrap(), 0);

    assert_eq!(harness.api.calls().len(), MAX_DELIVERY_COUNT as usize);

    let dead = harness.inbound.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, "application processing error");
    assert_eq!(dead[0].delivery_count, MAX_DELIVERY_COUNT);

    let rows = harness.repository.find_by_hearing_id_locked(1001).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, PendingRequestStatus::Exception);
    assert_eq!(rows[0].retry_count, (MAX_DELIVERY_COUNT - 1) as i32);
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let harness = WorkerHarness::new().await;
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let worker = Arc::new(harness.worker);

    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run(shutdown_rx).await }
    });

    harness
        .inbound
        .publish(hearing_message("DELETE_HEARING", "1001", BODY))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(harness.api.calls(), vec![ApiCall::Delete(1001)]);
}

#[tokio::test]
async fn test_shutdown_lets_in_flight_delivery_finish() {
    let api = ScriptedHearingApiClient::new().with_delay(Duration::from_millis(500));
    let harness = WorkerHarness::with_api(api).await;
    harness
        .inbound
        .publish(hearing_message("DELETE_HEARING", "1001", BODY))
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let worker = Arc::new(harness.worker);
    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run(shutdown_rx).await }
    });

    // Shutdown lands while the downstream call is still sleeping
    tokio::time::sleep(Duration::from_millis(150)).await;
    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(harness.api.calls(), vec![ApiCall::Delete(1001)]);

    let row = harness.repository.find_latest_by_hearing_id(1001).await.unwrap().unwrap();
    assert_eq!(row.status, PendingRequestStatus::Completed);

    let metrics = harness.inbound.get_metrics().await.unwrap().unwrap();
    assert_eq!(metrics.pending_messages, 0);
    assert_eq!(metrics.in_flight_messages, 0);
    assert_eq!(harness.outbound.poll(10).await.unwrap().len(), 1);
}
