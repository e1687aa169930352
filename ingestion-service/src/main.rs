use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ingestion_service::auto_import;
use ingestion_service::collaborators::{BlobStore, ContentIndexer, NotificationChannel};
use ingestion_service::config::AppConfig;
use ingestion_service::coordinator::{Collaborators, IngestionCoordinator};
use ingestion_service::indexer::BlobUploadIndexer;
use ingestion_service::notify::{
    NotificationDispatcher, NotificationSender, SubscriberHub, Subscription,
};
use ingestion_service::storage::LocalBlobStore;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    info!("Starting ingestion service v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load()?;
    std::fs::create_dir_all(&config.storage.data_dir)?;
    std::fs::create_dir_all(&config.storage.temp_dir)?;
    info!(
        data_dir = %config.storage.data_dir.display(),
        temp_dir = %config.storage.temp_dir.display(),
        workers = config.processing.max_workers,
        "Configuration loaded"
    );

    // Without a blob store the service still reports health but rejects uploads
    let blob_store: Option<Arc<dyn BlobStore>> = match LocalBlobStore::open(&config.storage.blob_dir)
    {
        Ok(store) => {
            info!(root = %store.root().display(), "Blob store opened");
            Some(Arc::new(store))
        }
        Err(e) => {
            warn!(error = %e, "Blob store unavailable, running degraded");
            None
        }
    };
    let indexer: Option<Arc<dyn ContentIndexer>> = blob_store
        .clone()
        .map(|store| Arc::new(BlobUploadIndexer::new(store)) as Arc<dyn ContentIndexer>);

    let cancel = CancellationToken::new();
    let hub = Arc::new(SubscriberHub::new());
    let (notifications, updates) = NotificationSender::channel();
    let dispatcher = NotificationDispatcher::spawn(
        updates,
        hub.clone() as Arc<dyn NotificationChannel>,
        cancel.clone(),
    );

    // Progress log for operators
    let (_, mut progress) = hub.subscribe(Subscription::AllUploads);
    tokio::spawn(async move {
        while let Some(message) = progress.recv().await {
            if let Ok(json) = serde_json::to_string(&message) {
                debug!(message = %json, "Upload progress");
            }
        }
    });

    let inbox_dir = config.storage.inbox_dir.clone();
    let coordinator = IngestionCoordinator::new(
        config,
        Collaborators {
            indexer,
            blob_store,
            notifications,
        },
    )?;
    coordinator.start()?;

    let background = cancel.child_token();
    let poller = inbox_dir.map(|dir| {
        auto_import::start_inbox_poller(coordinator.clone(), dir, background.clone())
    });

    // Forget finished uploads past the retention period
    let retention = {
        let coordinator = coordinator.clone();
        let stop = background.clone();
        let days = coordinator.config().processing.retention_days;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RETENTION_INTERVAL);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        coordinator.prune_old_uploads(days);
                    }
                }
            }
        })
    };

    let health = coordinator.check_service_health();
    info!(status = ?health.status, message = %health.message, "Ingestion service ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    background.cancel();
    if let Some(poller) = poller {
        let _ = poller.await;
    }
    let _ = retention.await;

    let stopping = coordinator.clone();
    let clean = tokio::task::spawn_blocking(move || stopping.stop()).await?;
    if !clean {
        warn!("Some workers did not stop within the shutdown timeout");
    }

    // Dropping the last sender lets the dispatcher drain what is queued
    drop(coordinator);
    let mut dispatcher = dispatcher;
    if tokio::time::timeout(DRAIN_TIMEOUT, &mut dispatcher).await.is_err() {
        cancel.cancel();
        let _ = dispatcher.await;
    }
    info!("Ingestion service stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, Layer, fmt, prelude::*};

    // Use RUST_LOG if set, otherwise default to info level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ingestion_service=info"));

    // INGEST_LOG_FORMAT=json switches to one JSON object per event
    let json = std::env::var("INGEST_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let layer = if json {
        fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    } else {
        let format = fmt::format()
            .with_target(true)
            .with_thread_ids(true)
            .compact();
        fmt::layer().event_format(format).boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();
}
