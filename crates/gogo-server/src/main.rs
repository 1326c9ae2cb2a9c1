use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gogo_server::api::{self, AppState};
use gogo_server::broker::spawn_consumer;
use gogo_server::cache::{MemoryCache, MessageCache, RedisCache};
use gogo_server::collaborators::{HttpContactDirectory, HttpSessionDirectory, StoreGroupDirectory};
use gogo_server::config::ServerConfig;
use gogo_server::hub::{Hub, HubServices};
use gogo_server::persistence::Persistence;
use gogo_server::transport::Transport;
use gogo_server::validator::DeliveryValidator;
use gogo_store::Database;

/// How often the in-process cache drops expired lists.
const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,gogo_server=debug,gogo_store=info")),
        )
        .init();

    info!("Starting gogo chat server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let shutdown = CancellationToken::new();

    // -----------------------------------------------------------------------
    // 3. Storage and cache
    // -----------------------------------------------------------------------
    let db = Database::open_at(&config.database_path)
        .with_context(|| format!("failed to open store at {}", config.database_path.display()))?;

    let cache: Arc<dyn MessageCache> = match config.redis_url.as_deref() {
        Some(url) => Arc::new(
            RedisCache::connect(url)
                .await
                .context("failed to connect Redis cache")?,
        ),
        None => {
            warn!("REDIS_URL not set, using in-process message cache");
            let cache = MemoryCache::new();
            let purger = cache.clone();
            let stop = shutdown.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(CACHE_PURGE_INTERVAL);
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = interval.tick() => purger.purge_expired().await,
                    }
                }
            });
            Arc::new(cache)
        }
    };

    let persistence = Persistence::new(db, cache, config.cache_ttl, config.cache_list_limit);

    // -----------------------------------------------------------------------
    // 4. Collaborators and the hub
    // -----------------------------------------------------------------------
    let contacts = HttpContactDirectory::new(&config.user_service_url, config.rpc_timeout)
        .context("failed to build contact client")?;
    let sessions = HttpSessionDirectory::new(&config.session_service_url, config.rpc_timeout)
        .context("failed to build session client")?;
    let validator = DeliveryValidator::new(
        Arc::new(contacts),
        Arc::new(sessions),
        config.rpc_timeout,
    );

    let services = HubServices {
        persistence: persistence.clone(),
        validator,
        groups: Arc::new(StoreGroupDirectory::new(persistence.clone())),
    };
    let (hub, hub_task) = Hub::spawn(services, config.channel_size, shutdown.clone());

    // -----------------------------------------------------------------------
    // 5. Transport (and its consumer in queued mode)
    // -----------------------------------------------------------------------
    let transport = Transport::from_config(&config).await?;
    let consumer = transport
        .broker()
        .map(|broker| spawn_consumer(broker, hub.clone(), shutdown.clone()));

    // -----------------------------------------------------------------------
    // 6. Run the HTTP API server until Ctrl+C
    // -----------------------------------------------------------------------
    let app_state = AppState {
        hub,
        persistence,
        transport,
        config: Arc::new(config.clone()),
    };

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            return;
        }
        info!("Received Ctrl+C, shutting down");
        signal.cancel();
    });

    let served = api::serve(app_state, config.http_addr, shutdown.clone()).await;
    shutdown.cancel();

    if let Err(e) = hub_task.await {
        warn!(error = %e, "Hub task ended abnormally");
    }
    if let Some(consumer) = consumer {
        if let Err(e) = consumer.await {
            warn!(error = %e, "Broker consumer ended abnormally");
        }
    }

    if let Err(e) = served {
        tracing::error!(error = %e, "HTTP server failed");
        return Err(e);
    }

    info!("Shutdown complete");
    Ok(())
}
