//! Aggregating relay.
//!
//! Reads plaintext metric lines from standard input, routes them to the configured aggregators, and writes the
//! aggregated metrics to standard output.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context as _;
use arc_swap::ArcSwap;
use relay_aggregator::AggregatorEngine;
use relay_app::{
    logging::{fatal_and_exit, initialize_logging},
    GenericError,
};
use tokio::{
    io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader, BufWriter},
    select,
    signal::unix::{signal, SignalKind},
    sync::{mpsc, oneshot},
    time::{interval, MissedTickBehavior},
};
use tracing::{error, info, warn};

mod config;
use self::config::RelayConfiguration;

mod router;
use self::router::Router;

const CONFIG_FILE_ENV_VAR: &str = "RELAY_CONFIG_FILE";
const DEFAULT_CONFIG_FILE: &str = "relay.yaml";
const STATISTICS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    let started = Instant::now();

    if let Err(e) = initialize_logging("relay-aggregated", None) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
        return;
    }

    match run(started).await {
        Ok(()) => info!("Relay stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }
}

async fn run(started: Instant) -> Result<(), GenericError> {
    let config_path = std::env::var(CONFIG_FILE_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));

    let config = RelayConfiguration::load(&config_path)?;
    let (router, set) = config.build()?;
    let router = ArcSwap::from_pointee(router);

    let engine = Arc::new(AggregatorEngine::new(set).with_tick_interval(config.tick_interval()));

    let (output_tx, output_rx) = mpsc::channel::<String>(config.output_queue_size.max(1));
    let (writer_shutdown_tx, writer_shutdown_rx) = oneshot::channel();
    let writer = tokio::spawn(write_output(output_rx, writer_shutdown_rx));

    engine
        .start(Arc::new(output_tx))
        .context("Failed to start aggregator engine.")?;

    info!(
        init_time_ms = started.elapsed().as_millis(),
        aggregators = engine.num_aggregators(),
        computes = engine.num_computes(),
        config_file = %config_path.display(),
        "Relay started."
    );

    let mut sighup = signal(SignalKind::hangup()).context("Failed to register SIGHUP handler.")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler.")?;
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler.")?;

    let mut statistics = interval(STATISTICS_INTERVAL);
    statistics.set_missed_tick_behavior(MissedTickBehavior::Delay);
    statistics.tick().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        select! {
            result = lines.next_line() => match result {
                Ok(Some(line)) => {
                    router.load().route(&line);
                }
                Ok(None) => {
                    info!("Reached end of input. Shutting down.");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read from standard input. Shutting down.");
                    break;
                }
            },
            _ = sighup.recv() => reload(&config_path, &router, &engine),
            _ = sigint.recv() => {
                info!("Received SIGINT. Shutting down.");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM. Shutting down.");
                break;
            }
            _ = statistics.tick() => {
                info!(
                    received = engine.received_sub(),
                    sent = engine.sent_sub(),
                    dropped = engine.dropped_sub(),
                    "Aggregator statistics."
                );
            }
        }
    }

    let stopping = Arc::clone(&engine);
    tokio::task::spawn_blocking(move || stopping.stop())
        .await
        .context("Failed to stop aggregator engine.")?;

    let _ = writer_shutdown_tx.send(());
    writer
        .await
        .context("Output writer panicked.")?
        .context("Failed to write to standard output.")?;

    info!(
        received = engine.received(),
        sent = engine.sent(),
        dropped = engine.dropped(),
        "Final aggregator statistics."
    );

    Ok(())
}

/// Reloads the configuration, replacing the routing table and aggregators as a whole.
///
/// Routing switches to the new aggregators immediately. The engine switches at its next tick, and windows still open
/// in the old aggregators are discarded.
fn reload(config_path: &Path, router: &ArcSwap<Router>, engine: &AggregatorEngine) {
    let result = RelayConfiguration::load(config_path).and_then(|config| config.build());
    match result {
        Ok((new_router, set)) => {
            let aggregators = set.len();
            engine.schedule_reload(set);
            router.store(Arc::new(new_router));
            info!(aggregators, "Reloaded configuration.");
        }
        Err(e) => {
            warn!(error = ?e, "Failed to reload configuration. Keeping current configuration.");
        }
    }
}

async fn write_output(mut lines: mpsc::Receiver<String>, mut shutdown: oneshot::Receiver<()>) -> io::Result<()> {
    let mut stdout = BufWriter::new(tokio::io::stdout());

    loop {
        select! {
            maybe_line = lines.recv() => match maybe_line {
                Some(line) => {
                    stdout.write_all(line.as_bytes()).await?;
                    if lines.is_empty() {
                        stdout.flush().await?;
                    }
                }
                None => break,
            },
            _ = &mut shutdown => {
                while let Ok(line) = lines.try_recv() {
                    stdout.write_all(line.as_bytes()).await?;
                }
                break;
            }
        }
    }

    stdout.flush().await
}
