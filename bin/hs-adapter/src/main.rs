//! Hearing Sync Adapter
//!
//! Consumes hearing lifecycle events from the inbound queue, forwards them to the
//! downstream scheduling API and reports each outcome on the egress queue. A
//! pending request ledger tracks every attempt; the escalation scheduler re-drives,
//! escalates and purges it in the background.
//!
//! ## Configuration
//!
//! Loaded from the first TOML file found (path given as the only argument,
//! `HEARING_SYNC_CONFIG`, `config.toml`, `hearing-sync.toml`, ...), then
//! overridden by `HS_*` environment variables. See `hs_config::AppConfig`.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `HS_DATABASE_URL` | `sqlite://./data/hearing-sync.db?mode=rwc` | `sqlite://` or `postgres://` ledger database |
//! | `HS_QUEUE_TYPE` | `embedded` | `embedded` (SQLite) or `sqs` (needs the `sqs` feature) |
//! | `HS_QUEUE_WORKERS` | `2` | Concurrent inbound consumers |
//! | `HS_DOWNSTREAM_BASE_URL` | `http://localhost:4550` | Scheduling API |
//! | `HS_SCHEDULER_ENABLED` | `true` | Run the escalation scheduler in this process |
//! | `RUST_LOG` | `info` | Log level |
//! | `LOG_FORMAT` | text | `json` for structured output |

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use hs_config::{AppConfig, ConfigLoader, DatabaseConfig};
use hs_queue::sqlite::SqliteQueue;
use hs_queue::{EmbeddedQueue, QueueConsumer, QueuePublisher};
use hs_router::{
    DispatcherConfig, HearingDelivery, HttpHearingApiClient, MessageDispatcher, QueueWorker,
    WorkerConfig,
};
use hs_scheduler::{EscalationScheduler, SchedulerConfig};
use hs_store::{
    PendingRequestRepository, PostgresPendingRequestRepository, SqlitePendingRequestRepository,
};

/// Embedded queue database when the ledger lives in PostgreSQL
const EMBEDDED_QUEUE_URL: &str = "sqlite://./data/hearing-sync-queue.db?mode=rwc";

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

struct Queues {
    consumer: Arc<dyn QueueConsumer>,
    publisher: Arc<dyn QueuePublisher>,
}

#[tokio::main]
async fn main() -> Result<()> {
    hs_common::logging::init_logging("hs-adapter");

    let loader = match std::env::args().nth(1) {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let config = loader.load().context("failed to load configuration")?;

    info!(
        deployment_id = %config.deployment_id,
        queue_type = %config.queue.queue_type,
        workers = config.queue.workers,
        "Starting Hearing Sync adapter"
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let (repository, sqlite_pool) = create_repository(&config.database).await?;
    let queues = create_queues(&config, sqlite_pool).await?;

    let client = Arc::new(HttpHearingApiClient::new(config.downstream.clone())?);
    let delivery = Arc::new(HearingDelivery::new(
        client,
        queues.publisher.clone(),
        config.downstream.timeout(),
    ));

    let dispatcher = Arc::new(MessageDispatcher::new(
        repository.clone(),
        delivery.clone(),
        DispatcherConfig {
            max_delivery_count: config.queue.max_delivery_count,
            deployment_id: config.deployment_id.clone(),
        },
    ));

    let worker_config = WorkerConfig {
        batch_size: config.queue.poll_batch_size,
        poll_interval: Duration::from_millis(config.queue.poll_interval_ms),
    };

    let mut handles = Vec::with_capacity(config.queue.workers + 1);
    for index in 0..config.queue.workers {
        let worker = QueueWorker::new(
            format!("worker-{index}"),
            queues.consumer.clone(),
            dispatcher.clone(),
            worker_config.clone(),
        );
        let shutdown_rx = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move { worker.run(shutdown_rx).await }));
    }

    let scheduler = Arc::new(EscalationScheduler::new(
        SchedulerConfig::from(&config),
        repository,
        delivery,
    ));
    if let Some(handle) = scheduler.start(shutdown_tx.subscribe()) {
        handles.push(handle);
    }

    info!("Hearing Sync adapter started, press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());
    queues.consumer.stop().await;

    let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Task panicked during shutdown");
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Shutdown timed out with tasks still running"
        );
    }

    info!("Hearing Sync adapter shutdown complete");
    Ok(())
}

/// Ledger repository for the configured URL. The SQLite pool is handed back so the
/// embedded queue can share the database file.
async fn create_repository(
    database: &DatabaseConfig,
) -> Result<(Arc<dyn PendingRequestRepository>, Option<SqlitePool>)> {
    let url = database.url.as_str();

    if url.starts_with("sqlite:") {
        let pool = connect_sqlite(url, database.max_connections).await?;
        let repo = SqlitePendingRequestRepository::new(pool.clone());
        repo.init_schema().await?;
        info!(url, "Using SQLite pending request store");
        Ok((Arc::new(repo), Some(pool)))
    } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let pool = PgPoolOptions::new()
            .max_connections(database.max_connections)
            .connect(url)
            .await
            .context("failed to connect to PostgreSQL")?;
        let repo = PostgresPendingRequestRepository::new(pool);
        repo.init_schema().await?;
        info!("Using PostgreSQL pending request store");
        Ok((Arc::new(repo), None))
    } else {
        bail!("Unsupported database URL: {url}. Use sqlite:// or postgres://")
    }
}

async fn connect_sqlite(url: &str, max_connections: u32) -> Result<SqlitePool> {
    if let Some(parent) = sqlite_file_path(url).and_then(Path::parent) {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .with_context(|| format!("failed to open SQLite database {url}"))
}

/// File path of a `sqlite://` URL, None for in-memory databases
fn sqlite_file_path(url: &str) -> Option<&Path> {
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path.starts_with(":memory:") {
        None
    } else {
        Some(Path::new(path))
    }
}

async fn create_queues(config: &AppConfig, sqlite_pool: Option<SqlitePool>) -> Result<Queues> {
    match config.queue.queue_type.as_str() {
        "embedded" => {
            let pool = match sqlite_pool {
                Some(pool) => pool,
                None => connect_sqlite(EMBEDDED_QUEUE_URL, config.database.max_connections).await?,
            };

            let inbound = Arc::new(SqliteQueue::new(
                pool.clone(),
                config.queue.inbound.clone(),
                config.queue.visibility_timeout_secs,
            ));
            inbound.init_schema().await?;
            let outbound = Arc::new(SqliteQueue::new(
                pool,
                config.queue.outbound.clone(),
                config.queue.visibility_timeout_secs,
            ));

            info!(
                inbound = %config.queue.inbound,
                outbound = %config.queue.outbound,
                "Using embedded SQLite queues"
            );
            Ok(Queues {
                consumer: inbound,
                publisher: outbound,
            })
        }
        "sqs" => create_sqs_queues(config).await,
        other => bail!("Unknown queue type: {other}. Use embedded or sqs"),
    }
}

#[cfg(feature = "sqs")]
async fn create_sqs_queues(config: &AppConfig) -> Result<Queues> {
    use hs_queue::sqs::{resolve_queue_url, SqsPublisher, SqsQueueConsumer};

    let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(config.queue.region.clone()))
        .load()
        .await;
    let client = aws_sdk_sqs::Client::new(&aws_config);

    let inbound_url = resolve_queue_url(&client, &config.queue.inbound).await?;
    let outbound_url = resolve_queue_url(&client, &config.queue.outbound).await?;
    let dead_letter_url = resolve_queue_url(&client, &config.queue.dead_letter).await?;

    let visibility_timeout = i32::try_from(config.queue.visibility_timeout_secs)
        .context("queue.visibility_timeout_secs is too large for SQS")?;

    info!(
        inbound = %inbound_url,
        outbound = %outbound_url,
        dead_letter = %dead_letter_url,
        "Using SQS queues"
    );

    Ok(Queues {
        consumer: Arc::new(SqsQueueConsumer::new(
            client.clone(),
            inbound_url,
            dead_letter_url,
            visibility_timeout,
        )),
        publisher: Arc::new(SqsPublisher::new(client, outbound_url)),
    })
}

#[cfg(not(feature = "sqs"))]
async fn create_sqs_queues(_config: &AppConfig) -> Result<Queues> {
    bail!("queue.type = \"sqs\" requires hs-adapter to be built with the sqs feature")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_file_path() {
        assert_eq!(
            sqlite_file_path("sqlite://./data/hearing-sync.db?mode=rwc"),
            Some(Path::new("./data/hearing-sync.db"))
        );
        assert_eq!(sqlite_file_path("sqlite:ledger.db"), Some(Path::new("ledger.db")));
        assert_eq!(sqlite_file_path("sqlite::memory:"), None);
        assert_eq!(sqlite_file_path("sqlite://:memory:"), None);
    }
}
