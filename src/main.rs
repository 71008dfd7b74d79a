//! Image edge cache server
//!
//! Loads configuration, sets up logging, and runs the image listener, the
//! eviction sweeper and (optionally) the metrics endpoint.

use anyhow::Context;
use image_edge_cache::access_log;
use image_edge_cache::{EdgeConfig, EdgeProxy, EdgeServer, EvictionSweeper, MetricsEndpoint};
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// # Usage
/// ```bash
/// # Start with default config (image_edge_cache.yaml)
/// image-edge-cache
///
/// # Start with custom config, overriding the port
/// PORT=8080 image-edge-cache /path/to/config.yaml
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "image_edge_cache.yaml".to_string());
    info!("Loading configuration from: {}", config_path);

    let config = EdgeConfig::from_file(&config_path)
        .and_then(|cfg| cfg.with_port_override(env::var("PORT").ok().as_deref()))
        .with_context(|| format!("failed to load configuration from {}", config_path))?;

    info!("Configuration loaded successfully");
    info!("  - Listen: {}:{}", config.server.host, config.server.port);
    info!("  - Base directory: {:?}", config.base_dir);
    info!(
        "  - Cache headers: {} (max-age {}s)",
        config.cache.enabled, config.cache.max_age_secs
    );
    info!("  - WebP negotiation: {}", config.negotiation.webp);
    info!(
        "  - Eviction: {} (every {}s, max age {}s)",
        config.eviction.enabled, config.eviction.interval_secs, config.eviction.max_age_secs
    );

    tokio::fs::create_dir_all(&config.base_dir)
        .await
        .with_context(|| format!("failed to create base directory {:?}", config.base_dir))?;

    let config = Arc::new(config);
    let sink = access_log::build_sink(&config.log)
        .await
        .context("failed to set up the access log")?;
    let proxy = Arc::new(EdgeProxy::new(Arc::clone(&config), sink)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = if config.eviction.enabled {
        let sweeper = EvictionSweeper::new(config.base_dir.clone(), &config.eviction)
            .with_metrics(proxy.metrics_arc());
        Some(Arc::new(sweeper).start(shutdown_rx.clone()))
    } else {
        info!("Eviction sweeper disabled");
        None
    };

    if let Some(endpoint_config) = config.metrics_endpoint.as_ref().filter(|m| m.enabled) {
        let addr: SocketAddr = endpoint_config
            .address
            .parse()
            .context("invalid metrics endpoint address")?;
        let endpoint = MetricsEndpoint::new(proxy.metrics_arc(), addr);
        tokio::spawn(async move {
            if let Err(e) = endpoint.start().await {
                error!("Metrics endpoint stopped: {}", e);
            }
        });
    }

    let server = EdgeServer::bind(Arc::clone(&proxy), config.listen_addr()?).await?;
    let server_task = tokio::spawn(server.serve(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    if shutdown_tx.send(true).is_err() {
        warn!("No tasks were listening for shutdown");
    }

    server_task.await.context("listener task panicked")??;
    if let Some(sweeper) = sweeper {
        if let Err(e) = sweeper.await {
            warn!("Sweeper task ended abnormally: {}", e);
        }
    }

    let stats = proxy.metrics().get_stats();
    info!(
        "Stopped: requests={} hits={} misses={} stale={} evicted={}",
        stats.total_requests, stats.cache_hits, stats.cache_misses, stats.cache_stale, stats.evicted_files
    );
    Ok(())
}
