//! Outflow Watcher
//!
//! Watches ledger addresses for outgoing native transfers inside configured
//! amount ranges and publishes an alert for each one.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use outflow_watcher::config::{Config, IngestMode};
use outflow_watcher::publisher::{LogSink, RedisSink, TelegramSink};
use outflow_watcher::subscription::{
    FeedEvent, FeedSpec, LogIngestor, LogIngestorConfig, SubscriptionConfig, SubscriptionManager,
};
use outflow_watcher::{
    AlertDispatcher, AlertSink, CheckpointStore, LedgerClient, OutflowDetector, Result, RpcClient,
    SlotScheduler,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    info!(
        rpc = %config.rpc_url,
        mode = %config.mode,
        commitment = %config.commitment,
        "starting outflow watcher"
    );
    for line in config.describe_watch_list() {
        info!(watch = %line, "watching");
    }
    for watched in config.watched.iter().filter(|w| w.ranges.is_empty()) {
        warn!(label = %watched.label, "no valid ranges, this address will never alert");
    }

    let ledger: Arc<dyn LedgerClient> =
        Arc::new(RpcClient::new(&config.rpc_url, &config.ws_url, config.commitment)?);
    let checkpoints = Arc::new(CheckpointStore::open(&config.checkpoint_path));
    let dispatcher = Arc::new(AlertDispatcher::new(build_sinks(&config).await));
    info!(sinks = ?dispatcher.sink_names(), "alert sinks ready");
    let detector = Arc::new(OutflowDetector::new(
        config.watched.clone(),
        dispatcher,
        config.include_failed,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut feeds = JoinSet::new();

    match config.mode {
        IngestMode::Blocks => {
            let scheduler = SlotScheduler::resume(
                ledger.clone(),
                detector,
                checkpoints,
                config.scheduler_config(),
            )
            .await?;
            info!(checkpoint = scheduler.checkpoint(), "block ingestion ready");

            let observer = scheduler.clone();
            let mut manager =
                SubscriptionManager::new(ledger, FeedSpec::Slots, SubscriptionConfig::default());
            let rx = shutdown_rx.clone();
            feeds.spawn(async move {
                manager
                    .run(
                        |event| {
                            if let FeedEvent::Slot(slot) = event {
                                observer.observe(slot);
                            }
                        },
                        rx,
                    )
                    .await;
            });

            wait_for_signal().await;
            let _ = shutdown_tx.send(true);
            scheduler.shutdown();
            while feeds.join_next().await.is_some() {}

            if tokio::time::timeout(config.drain_timeout, scheduler.wait_idle())
                .await
                .is_err()
            {
                warn!(checkpoint = scheduler.checkpoint(), "drain timed out, exiting with work in flight");
            }
            info!(checkpoint = scheduler.checkpoint(), "stopped");
        }
        IngestMode::Logs => {
            let ingestor = LogIngestor::new(
                ledger.clone(),
                detector,
                checkpoints,
                LogIngestorConfig {
                    include_failed: config.include_failed,
                    ..Default::default()
                },
            );

            for watched in &config.watched {
                let spec = FeedSpec::Logs {
                    address: watched.address.clone(),
                    commitment: config.commitment,
                };
                let mut manager =
                    SubscriptionManager::new(ledger.clone(), spec, SubscriptionConfig::default());
                let ingestor = ingestor.clone();
                let label = watched.label.clone();
                let rx = shutdown_rx.clone();
                feeds.spawn(async move {
                    manager
                        .run(
                            |event| {
                                if let FeedEvent::Log(notification) = event {
                                    ingestor.handle(&label, notification);
                                }
                            },
                            rx,
                        )
                        .await;
                });
            }

            wait_for_signal().await;
            let _ = shutdown_tx.send(true);
            while feeds.join_next().await.is_some() {}

            if tokio::time::timeout(config.drain_timeout, ingestor.wait_idle())
                .await
                .is_err()
            {
                warn!(pending = ingestor.pending(), "drain timed out, exiting with work in flight");
            }
            info!("stopped");
        }
    }

    Ok(())
}

/// Log sink always, Redis and Telegram when configured
///
/// A sink that cannot be set up is logged and left out.
async fn build_sinks(config: &Config) -> Vec<Arc<dyn AlertSink>> {
    let mut sinks: Vec<Arc<dyn AlertSink>> = vec![Arc::new(LogSink)];

    if let Some(redis) = &config.redis {
        match RedisSink::connect(&redis.url, redis.channel.clone()).await {
            Ok(sink) => {
                info!(channel = %sink.channel(), "publishing alerts to redis");
                sinks.push(Arc::new(sink));
            }
            Err(e) => error!(error = %e, "redis sink unavailable"),
        }
    }

    if let Some(telegram) = &config.telegram {
        match TelegramSink::new(telegram.clone()) {
            Ok(sink) => sinks.push(Arc::new(sink)),
            Err(e) => error!(error = %e, "telegram sink unavailable"),
        }
    }

    sinks
}

/// Resolves on SIGINT, or SIGTERM on unix
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                    _ = term.recv() => info!("received SIGTERM"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for SIGINT");
    }
    info!("received SIGINT");
}
