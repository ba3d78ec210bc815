use std::sync::Arc;

use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wavechat_auth::JwtService;
use wavechat_common::{create_pool, CacheService};
use wavechat_events::{
    default_registry, EventBusBuilder, EventLogListener, EventLogStore, EventPublisher,
    ProcessedEventLedger, RemoteEventBridge,
};
use wavechat_media::attachments::AttachmentStore;
use wavechat_media::config::MediaConfig;
use wavechat_media::progress::ProgressNotifier;
use wavechat_media::queue::{
    MediaQueue, RedisQueue, RedisQueueConsumer, SqsQueue, SqsQueueConsumer,
};
use wavechat_media::routes;
use wavechat_media::storage::StorageService;
use wavechat_media::sweeper::RetentionSweeper;
use wavechat_media::upload::UploadService;
use wavechat_media::worker::MediaWorker;
use wavechat_media::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wavechat_media=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = MediaConfig::from_env()?;

    let db_pool = create_pool(&config.database).await?;
    let cache = CacheService::new(&config.redis).await?;
    let jwt_service = JwtService::new(&config.jwt);

    let registry = Arc::new(default_registry());
    let bridge = RemoteEventBridge::new(&config.redis, "media")?;
    let publisher = EventPublisher::new(Some(bridge.clone()));

    let ledger = ProcessedEventLedger::new(db_pool.clone());
    let event_log = EventLogStore::new(db_pool.clone());
    let bus = EventBusBuilder::new(registry)
        .with_ledger(ledger)
        .subscribe(Arc::new(EventLogListener::new(event_log)))
        .build();
    publisher.bind(bus.clone());
    bridge.spawn_subscriber(bus);

    let store = AttachmentStore::new(db_pool.clone());
    let storage = StorageService::new(&config.storage).await?;
    let progress = ProgressNotifier::new(cache.clone());

    let worker = Arc::new(MediaWorker::new(
        store.clone(),
        storage.clone(),
        progress.clone(),
        publisher.clone(),
        config.processing.clone(),
    ));

    // Queue backend selection: processing code is shared, only the polling
    // loop differs.
    let queue: Arc<dyn MediaQueue> = match config.queue.provider.as_str() {
        "sqs" => {
            let queue = SqsQueue::new(config.queue.clone()).await?;
            SqsQueueConsumer::new(queue.clone(), worker.clone())
                .spawn(config.processing.worker_concurrency);
            Arc::new(queue)
        }
        _ => {
            let queue = RedisQueue::new(&config.redis, config.queue.clone()).await?;
            RedisQueueConsumer::new(queue.clone(), worker.clone())
                .spawn(config.processing.worker_concurrency);
            Arc::new(queue)
        }
    };

    let uploads = UploadService::new(
        store.clone(),
        storage.clone(),
        queue,
        progress.clone(),
        publisher,
        config.limits.clone(),
        config.storage.clone(),
    );

    let sweeper = RetentionSweeper::new(store, storage, config.retention.clone());
    let _sweep_scheduler = sweeper.start().await?;

    let app_state = AppState {
        config: config.clone(),
        db_pool,
        cache,
        jwt_service,
        uploads,
        progress,
    };

    let cors = CorsLayer::new().allow_headers(Any).allow_origin(Any);

    let app = routes::create_routes()
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(app_state);

    let listener =
        tokio::net::TcpListener::bind(format!("{}:{}", config.server.host, config.server.port))
            .await?;

    tracing::info!(
        "Media service listening on {}:{}",
        config.server.host,
        config.server.port
    );

    axum::serve(listener, app).await?;

    Ok(())
}
