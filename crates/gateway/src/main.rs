//! Gateway service entry point.
//!
//! WebSocket chat gateway; one process per instance.

use anyhow::{Context, Result};
use gateway::{
    create_router, AppState, ChatInstance, GatewayConfig, NatsTransport, RedisInbox,
    ServiceDiscovery, ServiceInfo,
};
use group_directory::{GroupDirectory, RedisGroupStore, RedisMembershipCache};
use metrics_exporter_prometheus::PrometheusBuilder;
use nats_client::NatsClient;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting chat gateway");

    let config = GatewayConfig::from_env()?;
    info!("Configuration:");
    info!("  INSTANCE_ID: {}", config.instance_id);
    info!("  HTTP_PORT: {}", config.http_port);
    info!("  METRICS_PORT: {}", config.metrics_port);
    info!("  NATS_URL: {}", config.nats_url);
    info!("  REDIS_URL: {}", config.redis_url);
    info!("  CHAT_STREAM: {} (replicas: {})", config.stream_name, config.stream_replicas);

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .context("Failed to start Prometheus exporter")?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    let nats = NatsClient::connect(&config.nats_url).await?;
    let transport =
        NatsTransport::provision(nats, &config.stream_name, config.stream_replicas).await?;

    info!("Connecting to Redis at {}", config.redis_url);
    let redis = redis::Client::open(config.redis_url.as_str())?
        .get_multiplexed_async_connection()
        .await
        .context("Failed to connect to Redis")?;

    let directory = GroupDirectory::new(
        Arc::new(RedisGroupStore::new(redis.clone())),
        Arc::new(RedisMembershipCache::new(redis.clone())),
    )
    .with_cache_ttl(config.membership_cache_ttl);

    let instance = ChatInstance::new(config.instance_id.clone(), Arc::new(transport), directory);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumers = instance.start(shutdown_rx.clone()).await?;

    let discovery = ServiceDiscovery::new(
        redis.clone(),
        ServiceInfo::new(
            config.instance_id.clone(),
            config.advertise_host.clone(),
            config.http_port,
        ),
    );
    if let Err(e) = discovery.register().await {
        error!("Service registration failed: {:?}", e);
    }
    let heartbeat = tokio::spawn(
        discovery
            .clone()
            .run_heartbeat(config.heartbeat_interval, shutdown_rx),
    );

    let state = Arc::new(
        AppState::new(instance, Arc::new(RedisInbox::new(redis)))
            .with_session_buffer(config.session_buffer),
    );
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway {} listening on {}", config.instance_id, addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down consumers...");
    let _ = shutdown_tx.send(true);
    for consumer in consumers {
        let _ = consumer.await;
    }
    let _ = heartbeat.await;

    if let Err(e) = discovery.unregister().await {
        error!("Service unregistration failed: {:?}", e);
    }

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {:?}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {:?}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
