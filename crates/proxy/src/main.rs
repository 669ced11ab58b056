//! The hornet binary.
//!
//! Startup order: identity → pool → shared subscription → connection
//! warmup probe → HTTP listener. Shutdown is driven by the watch
//! channel (config-file change); a 10 second force-exit timer bounds
//! the drain.

use anyhow::{Context, Result, bail};
use clap::Parser;
use hornet_core::identity::load_or_generate;
use hornet_client::{PoolConfig, RelayConfig, RelayPool};
use hornet_proxy::config::{Args, Config};
use hornet_proxy::gateway::{self, GatewayState};
use hornet_proxy::ingress::Ingress;
use hornet_proxy::pending::PendingTable;
use hornet_proxy::watcher::spawn_file_watcher;
use hornet_proxy::windows;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

const FORCE_EXIT_AFTER: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let config = Config::resolve(args)?;

    let identity = Arc::new(
        load_or_generate(config.nsec_file.as_deref(), config.save_nsec)
            .context("load identity")?,
    );
    info!(npub = %identity.npub().context("encode npub")?, "identity ready");

    let destination = match &config.destination {
        Some(value) => Some(
            gateway::parse_destination(value.trim())
                .map_err(|e| anyhow::anyhow!("invalid --destination: {e}"))?,
        ),
        None => None,
    };

    let pool = Arc::new(
        RelayPool::new(
            &config.relays,
            identity.public_key_hex(),
            PoolConfig {
                max_cached_relays: config.max_cached_relays,
                relay: RelayConfig::default(),
            },
        )
        .context("build relay pool")?,
    );
    let pending = Arc::new(PendingTable::new(Arc::clone(&pool)));
    let ingress = Arc::new(Ingress::new(
        Arc::clone(&identity),
        Arc::clone(&pending),
        windows::unix_now(),
    ));

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let _ingress_task = Arc::clone(&ingress).spawn(event_rx);
    pool.subscribe_ingest(event_tx, ingress.dedup_hook(), windows::subscription_since())
        .await;

    // Warmup probe: give connections a moment, then insist on at least
    // one when any initial relays were configured at all.
    if !config.relays.is_empty() {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if pool.connected_count().await == 0 {
            info!("no relay connected yet, waiting");
            tokio::time::sleep(Duration::from_secs(5)).await;
            if pool.connected_count().await == 0 {
                bail!("could not connect to any initial relay");
            }
        }
    }
    info!(
        connected = pool.connected_count().await,
        configured = config.relays.len(),
        "relay pool ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let _watcher = if config.exit_on_file_change {
        let paths = config.watch_paths();
        if paths.is_empty() {
            None
        } else {
            Some(spawn_file_watcher(paths, shutdown_tx.clone())?)
        }
    } else {
        None
    };
    let _maintenance_task = windows::spawn(
        Arc::clone(&ingress),
        Arc::clone(&pool),
        shutdown_rx.clone(),
    );

    let state = GatewayState {
        identity,
        pool: Arc::clone(&pool),
        pending,
        destination,
        keep_host: config.keep_host,
        timeout: config.timeout,
    };
    let app = gateway::router(state);

    let listener = bind_listener(&config)?;
    info!(host = %config.host, port = config.port, "listening");

    let mut shutdown = shutdown_rx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
            // Bound the drain: a supervisor restart beats a hung exit.
            tokio::spawn(async {
                tokio::time::sleep(FORCE_EXIT_AFTER).await;
                error!("shutdown did not drain in time, forcing exit");
                std::process::exit(-1);
            });
        })
        .await
        .context("http server")?;

    pool.close_all().await;
    info!("shutdown complete");
    Ok(())
}

/// Bind the listener with the configured backlog and bind exclusivity.
fn bind_listener(config: &Config) -> Result<TcpListener> {
    let addr: SocketAddr = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .with_context(|| format!("resolve {}:{}", config.host, config.port))?
        .next()
        .with_context(|| format!("no address for {}", config.host))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .context("create socket")?;
    socket
        .set_reuseaddr(!config.exclusive)
        .context("set reuseaddr")?;
    socket
        .bind(addr)
        .with_context(|| format!("bind {addr}"))?;
    socket
        .listen(config.backlog)
        .with_context(|| format!("listen on {addr}"))
}
