//! Consume the courier position stream into the history table.
use std::future::ready;
use std::sync::Arc;

use axum::routing::get;
use envconfig::Envconfig;
use futures::future::{select, Either};
use health::HealthRegistry;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use beacon_common::metrics::setup_metrics_router;
use beacon_common::retry::RetryPolicy;
use beacon_common::stream::RedisStreamLog;
use beacon_worker::config::Config;
use beacon_worker::store::PostgresHistoryStore;
use beacon_worker::worker::{IngestWorker, WorkerSettings};

async fn index() -> &'static str {
    "beacon worker"
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("invalid configuration:");

    let liveness = HealthRegistry::new("liveness");

    let log = RedisStreamLog::new(
        &config.redis_url,
        config.stream_key.as_str(),
        config.consumer_group.as_str(),
        config.stream_retention,
    )
    .await
    .expect("failed to initialize stream log");
    let log = Arc::new(log);

    let store = PostgresHistoryStore::new(
        &config.database_url,
        config.max_pg_connections,
        "beacon-worker",
    )
    .expect("failed to initialize history store");
    let store = Arc::new(store);

    let settings = WorkerSettings {
        batch_size: config.batch_size,
        read_block: config.read_block.0,
        claim_min_idle: config.claim_min_idle.0,
        max_deliveries: config.max_deliveries,
        max_batch_attempts: config.max_batch_attempts,
        retry_policy: RetryPolicy::new(
            config.retry_policy.backoff_coefficient,
            config.retry_policy.initial_interval.0,
            Some(config.retry_policy.maximum_interval.0),
        ),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for shutdown signal");
        info!("shutdown signal received, finishing in-flight batches");
        _ = shutdown_tx.send(true);
    });

    let mut workers = JoinSet::new();
    for index in 0..config.worker_count {
        let name = format!("{}-{}", config.worker_name, index);
        let handle = liveness
            .register(name.clone(), time::Duration::seconds(60))
            .await;
        let worker = IngestWorker::new(&name, log.clone(), store.clone(), settings.clone(), handle);
        let shutdown = shutdown_rx.clone();
        let error_backoff = config.error_backoff.0;
        workers.spawn(async move { worker.run(shutdown, error_backoff).await });
    }

    let router = setup_metrics_router()
        .route("/", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let binding = config.bind();
    let http_server = Box::pin(beacon_common::metrics::serve(router, &binding));

    let ingest = Box::pin(async move {
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!("worker task failed: {}", err);
            }
        }
    });

    match select(http_server, ingest).await {
        Either::Left((listen_result, _)) => {
            if let Err(e) = listen_result {
                error!("failed to serve liveness and metrics: {}", e);
            }
        }
        Either::Right((_, _)) => {
            info!("all workers exited");
        }
    };
}
