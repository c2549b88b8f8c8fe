//! proxy-relay: a single-upstream reverse proxy with retry.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request    ┌──────────┐   ┌──────────┐   ┌─────────────┐
//!     ─────────────────▶│   http   │──▶│  proxy   │──▶│  transport  │──▶ Upstream
//!                       │  server  │   │  engine  │   │  (hyper)    │
//!     Client Response   │          │   │ pipeline │   │             │
//!     ◀─────────────────│          │◀──│          │◀──│             │◀──
//!                       └──────────┘   └──────────┘   └─────────────┘
//!
//!     config file ──▶ watcher ──▶ new Proxy ──▶ ArcSwap (used by next request)
//! ```
//!
//! Listener settings (bind address, TLS) are read once at startup; a
//! reload only replaces the proxy instance.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use clap::Parser;
use tokio::net::TcpListener;

use proxy_relay::config::load_config;
use proxy_relay::config::watcher::ConfigWatcher;
use proxy_relay::http::{HttpServer, SharedProxy};
use proxy_relay::lifecycle::{signals, Shutdown};
use proxy_relay::net::tls::load_tls_config;
use proxy_relay::observability::{logging, metrics};
use proxy_relay::Proxy;

#[derive(Debug, Parser)]
#[command(name = "proxy-relay", version, about = "Retrying single-upstream reverse proxy")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "proxy-relay.toml")]
    config: PathBuf,

    /// Do not watch the configuration file for changes.
    #[arg(long)]
    no_watch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    logging::init_logging(
        Some(config.observability.log_level.as_str()),
        config.observability.json_logs,
    );
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "proxy-relay starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        upstream = %config.upstream.target,
        retry = ?config.retry,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let proxy: SharedProxy = Arc::new(ArcSwap::from_pointee(Proxy::from_config(&config)?));
    let shutdown = Shutdown::new();
    tokio::spawn(signals::shutdown_on_signal(shutdown.clone()));

    // The watcher stops when this handle is dropped at the end of main.
    let _watcher = if cli.no_watch {
        None
    } else {
        let (watcher, mut updates) = ConfigWatcher::new(&cli.config);
        let handle = watcher.run()?;
        let swap = proxy.clone();
        let stop = shutdown.wait();
        tokio::spawn(async move {
            tokio::pin!(stop);
            loop {
                tokio::select! {
                    _ = &mut stop => break,
                    update = updates.recv() => {
                        let Some(next) = update else { break };
                        match Proxy::from_config(&next) {
                            Ok(instance) => {
                                swap.store(Arc::new(instance));
                                tracing::info!(upstream = %next.upstream.target, "Proxy reloaded");
                            }
                            Err(e) => tracing::error!(error = %e, "Reload failed; keeping current proxy"),
                        }
                    }
                }
            }
        });
        Some(handle)
    };

    let server = HttpServer::new(proxy);
    match &config.listener.tls {
        Some(tls) => {
            let rustls = load_tls_config(Path::new(&tls.cert_path), Path::new(&tls.key_path)).await?;
            let addr = config.listener.bind_address.parse()?;
            server.run_tls(addr, rustls, shutdown.wait()).await?;
        }
        None => {
            let listener = TcpListener::bind(&config.listener.bind_address).await?;
            tracing::info!(address = %listener.local_addr()?, "Listening for connections");
            server.run(listener, shutdown.wait()).await?;
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
