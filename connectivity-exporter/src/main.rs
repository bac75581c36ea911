//! Connectivity exporter daemon
//!
//! Attaches the eBPF classifier to a network interface and exports per-SNI
//! TLS connectivity counters over a Prometheus scrape endpoint.
//!
//! ## Usage
//!
//! ```bash
//! # Watch 443/tcp towards the service networks on eth0
//! sudo connectivity-exporter --iface eth0 \
//!     --cidrs 10.0.0.0/8,192.168.0.0/16 --ports 443 \
//!     --ebpf-object target/bpfel-unknown-none/release/connectivity-ebpf
//!
//! # Scrape
//! curl http://127.0.0.1:9385/metrics
//! ```
//!
//! Requires privileges sufficient to create BPF maps and open an AF_PACKET
//! socket on the target interface (CAP_BPF + CAP_NET_RAW, or root).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use connectivity_exporter::{
    aggregator::Aggregator,
    config,
    histogram::{self, HistogramReader},
    loader::ProbeLoader,
    metrics::{self, MetricsRegistry},
};
use log::info;
use tokio::signal;
use tokio::sync::{mpsc, watch, Mutex};

/// TLS connectivity quality exporter
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Network interface to attach the classifier to
    #[arg(short, long)]
    iface: String,

    /// Comma-separated destination IPv4 CIDR allow-list (e.g. 10.0.0.0/8)
    #[arg(long)]
    cidrs: String,

    /// Comma-separated destination TCP port allow-list (e.g. 443,8443)
    #[arg(long)]
    ports: String,

    /// Bind address of the Prometheus scrape endpoint
    #[arg(long, default_value = "0.0.0.0:9385")]
    metrics_addr: SocketAddr,

    /// Seconds an idle SNI's series is kept before being dropped
    #[arg(long, default_value_t = 300)]
    sni_retention_secs: u64,

    /// Path to the classifier object file (if not embedded)
    #[arg(long)]
    ebpf_object: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let cidrs =
        config::parse_cidrs(&config::as_set(&args.cidrs)).context("parsing --cidrs")?;
    let ports =
        config::parse_ports(&config::as_set(&args.ports)).context("parsing --ports")?;

    let mut loader = ProbeLoader::load(args.ebpf_object.clone())?;
    loader.populate_filters(&cidrs, &ports)?;
    loader.attach(&args.iface)?;

    let connections = loader.connection_map()?;
    let stats = loader.stats_map()?;
    let ticker = loader.ticker_map()?;
    let histogram_map = loader.histogram_map()?;
    let misc = loader.misc_counters_map()?;

    let (event_tx, event_rx) = mpsc::channel(1024);
    let (snapshot_tx, snapshot_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let registry = Arc::new(Mutex::new(MetricsRegistry::default()));

    let aggregator = Aggregator::new(
        connections,
        stats,
        ticker,
        Duration::from_secs(args.sni_retention_secs),
        event_tx,
    );
    let mut aggregator_handle = tokio::spawn(aggregator.run(shutdown_rx.clone()));

    let reader = HistogramReader::new(histogram_map, misc);
    let mut tracker_handle = tokio::spawn(histogram::track_execution_time(
        reader,
        snapshot_tx,
        shutdown_rx.clone(),
    ));

    let sink_handle = tokio::spawn(metrics::run_sink(
        event_rx,
        snapshot_rx,
        Arc::clone(&registry),
    ));
    let mut server_handle = tokio::spawn(metrics::serve_metrics(
        args.metrics_addr,
        Arc::clone(&registry),
        shutdown_rx,
    ));

    info!("connectivity exporter running on {}", args.iface);

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
        result = &mut tracker_handle => {
            // a histogram read failure indicates corrupted kernel state
            result.context("histogram tracker panicked")??;
            anyhow::bail!("histogram tracker exited unexpectedly");
        }
        result = &mut aggregator_handle => {
            result.context("aggregator panicked")?;
            anyhow::bail!("aggregator exited unexpectedly");
        }
        result = &mut server_handle => {
            result.context("metrics endpoint panicked")??;
            anyhow::bail!("metrics endpoint exited unexpectedly");
        }
    }

    // Drain the current tick, close the channels, then detach.
    let _ = shutdown_tx.send(true);
    aggregator_handle.await.context("joining aggregator")?;
    tracker_handle
        .await
        .context("joining histogram tracker")??;
    server_handle.await.context("joining metrics endpoint")??;
    sink_handle.await.context("joining metrics sink")?;

    // Dropping the loader detaches the classifier and destroys the tables.
    drop(loader);
    info!("classifier detached, exiting");
    Ok(())
}
