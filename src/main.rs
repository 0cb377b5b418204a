use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

mod config;
mod error;
mod observability;
mod proxy;

use config::{CacheBackend, Config};
use observability::{AccessLogger, MetricsCollector};
use proxy::{CacheStore, EdgeProxy, HttpOrigin, MemoryStore, ProxySettings, RedisStore};

#[derive(Parser, Debug)]
#[command(name = "edge-cache-proxy")]
#[command(about = "Edge reverse proxy with a key-value response cache")]
struct Args {
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    #[arg(short, long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration before tracing so the configured level applies
    let config = Config::load(&args.config).await?;

    observability::init_tracing(&config.logging)?;

    if args.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    info!("Starting edge cache proxy");

    let metrics_collector = Arc::new(MetricsCollector::new(&config.metrics)?);
    let access_log = Arc::new(AccessLogger::new(&config.logging.access_log)?);

    let mut sweeper = None;
    let store: Arc<dyn CacheStore> = match config.cache.backend {
        CacheBackend::Memory => {
            let store = MemoryStore::new(config.cache.max_entries);
            sweeper = Some(store.spawn_sweeper(config.cache.sweep_interval));
            Arc::new(store)
        }
        CacheBackend::Redis => Arc::new(RedisStore::connect(&config.redis).await?),
    };

    let origin = Arc::new(HttpOrigin::new(&config.origin, &config.proxy.powered_by)?);
    info!("Forwarding to origin {}", config.origin.base_url);

    let settings = ProxySettings::from_config(&config)?;
    info!(
        "Caching GET responses under {:?} for {:?}",
        settings.rule.prefixes(),
        settings.ttl
    );

    let edge_proxy = Arc::new(
        EdgeProxy::new(settings, store, origin)
            .with_metrics(metrics_collector.clone())
            .with_access_log(access_log.clone()),
    );

    let metrics_task = if metrics_collector.is_enabled() {
        let metrics_collector = metrics_collector.clone();
        let metrics_config = config.metrics.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = metrics_collector.start_server(&metrics_config).await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let server_config = config.server.clone();
    let server_task = tokio::spawn(async move {
        if let Err(e) = edge_proxy.serve(&server_config).await {
            error!("Server error: {}", e);
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = server_task => {
            error!("Main server task exited unexpectedly");
        }
    }

    if let Some(metrics_task) = metrics_task {
        metrics_task.abort();
    }

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }

    info!(
        "Edge cache proxy shutdown complete ({} access log entries, {} write errors)",
        access_log.entries_written(),
        access_log.write_errors()
    );
    Ok(())
}
