use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing::*;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hotwalletd::{
    config::Config,
    pipeline::{run_notifier, run_pipeline},
    server, zmq_feed, Wallet,
};

/// Capacity of the notify channel; sends backpressure when the notifier
/// stalls rather than growing without bound.
const NOTIFY_CHANNEL_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.ini".to_string());
    let config = Config::load(Path::new(&config_path))
        .with_context(|| format!("loading {config_path}"))?;
    info!(chain = config.chain.params().name, last_block = config.last_block, "starting");

    let wallet =
        Wallet::new(&config, PathBuf::from(&config_path)).context("initializing wallet")?;

    match wallet.rpc.get_blockchain_info().await {
        Ok(node) => info!(chain = %node.chain, blocks = node.blocks, "node reachable"),
        Err(err) => warn!(%err, "node not reachable yet, pipeline will retry"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (feed_tx, feed_rx) = mpsc::channel(NOTIFY_CHANNEL_CAPACITY);
    let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_CHANNEL_CAPACITY);

    let feed_thread = zmq_feed::spawn(config.zmq_url.clone(), feed_tx, shutdown_rx.clone());
    let notifier = tokio::spawn(run_notifier(wallet.rpc.clone(), notify_rx));
    let pipeline = tokio::spawn(run_pipeline(
        wallet.clone(),
        feed_rx,
        notify_tx,
        shutdown_rx.clone(),
    ));
    let persister = tokio::spawn(persist_loop(wallet.clone(), shutdown_rx));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("binding port {}", config.port))?;
    info!(port = config.port, "http server listening");

    axum::serve(listener, server::router(wallet.clone()))
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("http server")?;

    // Orderly teardown: tasks observe the flag, then state is flushed.
    pipeline.await.ok();
    persister.await.ok();
    feed_thread.join().ok();
    // The notify sender is gone once the pipeline task ends; the
    // notifier drains what is left and exits.
    notifier.await.ok();

    wallet.persist().context("final checkpoint")?;
    wallet.store.flush().context("closing utxo store")?;
    info!("bye");
    Ok(())
}

/// Rewrites the rolling indices and checkpoint every 60 seconds.
async fn persist_loop(wallet: Arc<Wallet>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(err) = wallet.persist() {
                    warn!(%err, "periodic config persist failed");
                }
            }
        }
    }
}

async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(%err, "could not listen for shutdown signal");
    }
    info!("shutdown signal received");
    let _ = shutdown.send(true);
}
