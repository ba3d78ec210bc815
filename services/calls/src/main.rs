use std::sync::Arc;

use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wavechat_auth::JwtService;
use wavechat_calls::config::CallsConfig;
use wavechat_calls::history::CallHistoryService;
use wavechat_calls::hub::SignalingHub;
use wavechat_calls::ice::IceConfigService;
use wavechat_calls::listeners::{
    BlockListener, CallTeardownListener, FriendshipListener, MissedCallNotificationListener,
    PrivacyListener,
};
use wavechat_calls::policy::CacheBackedCallPolicy;
use wavechat_calls::routes;
use wavechat_calls::sfu::SfuClient;
use wavechat_calls::AppState;
use wavechat_common::{create_pool, CacheService, SystemClock};
use wavechat_events::{
    default_registry, EventBusBuilder, EventLogListener, EventLogStore, EventPublisher,
    ProcessedEventLedger, RemoteEventBridge,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wavechat_calls=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = CallsConfig::from_env()?;

    let db_pool = create_pool(&config.database).await?;
    let cache = CacheService::new(&config.redis).await?;
    let jwt_service = JwtService::new(&config.jwt);
    let clock = Arc::new(SystemClock);

    // Event substrate: registry and bridge first, then the publisher the
    // history service writes through, then the bus with all listeners, and
    // finally the bind that closes the loop.
    let registry = Arc::new(default_registry());
    let bridge = RemoteEventBridge::new(&config.redis, "calls")?;
    let publisher = EventPublisher::new(Some(bridge.clone()));

    let history = CallHistoryService::new(
        db_pool.clone(),
        cache.clone(),
        publisher.clone(),
        clock.clone(),
        config.timing.clone(),
    );

    let sfu = SfuClient::new(config.sfu.clone())?;
    let ice = IceConfigService::new(config.ice.clone(), cache.clone(), clock);
    let policy = Arc::new(CacheBackedCallPolicy::new(cache.clone()));

    let hub = SignalingHub::new(
        history.clone(),
        sfu,
        ice,
        policy,
        config.timing.clone(),
    );

    let ledger = ProcessedEventLedger::new(db_pool.clone());
    let event_log = EventLogStore::new(db_pool.clone());
    let bus = EventBusBuilder::new(registry)
        .with_ledger(ledger)
        .subscribe(Arc::new(EventLogListener::new(event_log)))
        .subscribe(Arc::new(CallTeardownListener::new(hub.clone())))
        .subscribe(Arc::new(BlockListener::new(history.clone(), cache.clone())))
        .subscribe(Arc::new(PrivacyListener::new(cache.clone())))
        .subscribe(Arc::new(FriendshipListener::new(cache.clone())))
        .subscribe(Arc::new(MissedCallNotificationListener::new(publisher.clone())))
        .build();
    publisher.bind(bus.clone());
    bridge.spawn_subscriber(bus);

    let app_state = AppState {
        config: config.clone(),
        db_pool,
        cache,
        jwt_service,
        history,
        hub,
    };

    let cors = CorsLayer::new().allow_headers(Any).allow_origin(Any);

    let app = routes::create_routes()
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(app_state);

    let listener =
        tokio::net::TcpListener::bind(format!("{}:{}", config.server.host, config.server.port))
            .await?;

    tracing::info!(
        "Calls service listening on {}:{}",
        config.server.host,
        config.server.port
    );

    axum::serve(listener, app).await?;

    Ok(())
}
