mod config;
mod db;
mod dispatch;
mod error;
mod http;
mod hub;
mod models;
mod notifier;
mod presence;

use config::{AppConfig, StoreBackend};
use db::memory::MemoryStore;
use db::postgres::PgStore;
use db::DispatchStore;
use dispatch::{DispatchSettings, Dispatcher};
use hub::Hub;
use notifier::kafka::KafkaPush;
use notifier::push::{LogPush, PushSender};
use notifier::EventNotifier;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load config
    let config = AppConfig::load()?;

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .init();

    info!("Starting MoveIt Dispatch Service...");

    let lock_wait = Duration::from_millis(config.lock_wait_ms);
    let store: Arc<dyn DispatchStore> = match config.store_backend {
        StoreBackend::Postgres => {
            let pool = db::init_pool(&config.database_url, config.db_max_connections).await?;
            info!("Connected to database");
            let store = PgStore::new(pool, lock_wait);
            store.ensure_schema().await?;
            Arc::new(store)
        }
        StoreBackend::Memory => {
            warn!("Using in-memory store; rides and presence are lost on restart");
            Arc::new(MemoryStore::new(lock_wait))
        }
    };

    let push: Arc<dyn PushSender> = match &config.kafka_bootstrap_servers {
        Some(servers) => Arc::new(KafkaPush::new(&config, servers)?),
        None => {
            info!("KAFKA_BOOTSTRAP_SERVERS not set; push events are logged only");
            Arc::new(LogPush)
        }
    };

    let hub = Hub::new(config.connection_queue_capacity);
    let notifier = EventNotifier::new(hub.clone(), push);
    let dispatcher = Dispatcher::new(
        store,
        notifier,
        DispatchSettings {
            radius_km: config.dispatch_radius_km,
            read_retries: config.store_read_retries,
        },
    );

    let app = http::router(http::AppState {
        dispatcher,
        hub,
        ping_interval: Duration::from_secs(config.ws_ping_interval_secs),
    });

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
