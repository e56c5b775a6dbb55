use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use liteproxy_core::backend::LiteBackend;
use liteproxy_core::cache::BlockCache;
use liteproxy_core::config::{AppConfig, LoggingConfig};
use liteproxy_core::dispatch::Dispatcher;
use liteproxy_core::frontend::{Frontend, KeyConfig};
use liteproxy_core::metrics;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod backend;
mod keys;
mod transport;

#[derive(Debug, Parser)]
#[command(name = "liteproxy", about = "Caching light-server reverse proxy")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,liteproxy_core={level},liteproxy={level},server={level}",
            level = config.level
        ))
    });
    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_target(false)).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = AppConfig::load(args.config.as_deref()).context("loading configuration")?;
    init_logging(&config.logging);

    if config.metrics.enabled {
        let addr: std::net::SocketAddr = config
            .metrics
            .listen_addr
            .parse()
            .context("parsing metrics listen address")?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing the metrics exporter")?;
        metrics::describe();
        info!(%addr, "metrics exporter ready");
    }

    let backend_key = match &config.backend.server_key_id {
        Some(hexed) => {
            let bytes = hex::decode(hexed).context("decoding backend.server_key_id")?;
            bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("backend.server_key_id must be 32 bytes"))?
        }
        None => [0u8; 32],
    };
    let backend: Arc<dyn LiteBackend> =
        Arc::new(backend::PooledBackend::new(config.backend.addrs.clone(), backend_key)?);

    let cache = BlockCache::new(backend.clone(), config.cache.to_cache_config());
    let shutdown = broadcast::channel::<()>(1).0;
    if !config.only_proxy {
        cache.start_background_tasks(&shutdown);
    }

    // get-method emulation is a deployment concern: a build without a
    // linked VM proxies runSmcMethod upstream instead
    let dispatcher = Dispatcher::new(cache.clone(), backend, None);

    let mut key_ring = Vec::with_capacity(config.clients.len());
    for client in &config.clients {
        let key = keys::derive(client)?;
        info!(
            name = %key.name,
            key_id = %key.key_id,
            "serving tenant"
        );
        key_ring.push((
            key.key_id,
            KeyConfig::new(
                &client.name,
                client.cooling_per_sec,
                client.capacity_per_key,
                client.capacity_per_ip,
            ),
        ));
    }

    let frontend = Frontend::new(key_ring, dispatcher, cache, config.only_proxy);

    let serve = transport::serve(&config.listen_addr, frontend, &shutdown);
    tokio::select! {
        result = serve => result?,
        _ = signal::ctrl_c() => {
            info!("shutting down");
            shutdown.send(()).ok();
        }
    }
    Ok(())
}
