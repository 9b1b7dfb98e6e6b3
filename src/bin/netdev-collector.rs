#[path = "../bin_common.rs"]
mod common;

use clap::{ArgAction, Parser};
use netdev_collector::collector::{
    CollectorMetrics, DeliveryPolicy, MetricsServer, Publisher, PublisherConfig, ScrapeConfig,
    ScrapeMode, Scheduler,
};
use netdev_collector::influx::{DEFAULT_ORG, DEFAULT_TOKEN, DEFAULT_URL};
use netdev_collector::provision::{self, DEFAULT_RETENTION_SECONDS};
use netdev_collector::{InfluxClient, InfluxConfig, NetlinkSource, ensure_bucket};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "netdev-collector")]
#[command(about = "Collect network interface and qdisc counters and export to InfluxDB")]
struct Args {
    /// InfluxDB URL
    #[arg(long, default_value = DEFAULT_URL)]
    db: String,

    /// InfluxDB API token
    #[arg(long, env = "INFLUX_TOKEN", default_value = DEFAULT_TOKEN, hide_env_values = true)]
    token: String,

    /// InfluxDB organization
    #[arg(long, default_value = DEFAULT_ORG)]
    org: String,

    /// Destination bucket (default: this machine's hostname)
    #[arg(long)]
    bucket: Option<String>,

    /// Collect per-interface counters
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    netdev: bool,

    /// Collect per-qdisc counters
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    qdisc: bool,

    /// Scrape interval in milliseconds (0 scrapes once and exits)
    #[arg(long, default_value_t = 0)]
    interval: u64,

    /// Print raw counters to stdout every scrape
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    print: bool,

    /// Serve the collector's own counters on this port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Points held in memory while InfluxDB is unavailable
    #[arg(long, default_value_t = 50_000)]
    buffer_size: usize,

    /// Retries per batch for transient write failures
    #[arg(long, default_value_t = 5)]
    max_retries: u32,

    /// Keep batches that exhaust their retries and try them again later
    #[arg(long)]
    at_least_once: bool,

    /// HTTP request timeout in seconds
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// Give up on the final flush after this many seconds
    #[arg(long, default_value_t = 30)]
    shutdown_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    common::init_tracing();
    let args = Args::parse();

    let bucket = match args.bucket {
        Some(bucket) => bucket,
        None => provision::local_hostname()?,
    };

    let mut config = InfluxConfig::new(&args.db, &args.token, &args.org, &bucket);
    config.timeout = Duration::from_secs(args.timeout.max(1));
    tracing::info!(
        "Exporting to {} (org {}, bucket {})",
        config.url,
        config.org,
        config.bucket
    );
    let client = Arc::new(InfluxClient::new(config)?);

    ensure_bucket(&*client, &args.org, &bucket, DEFAULT_RETENTION_SECONDS).await?;

    let source = Arc::new(NetlinkSource::open()?);

    let cancel = CancellationToken::new();
    common::spawn_shutdown_listener(cancel.clone());

    let metrics = Arc::new(CollectorMetrics::default());
    let mut registry = Registry::default();
    metrics.register(&mut registry);
    let registry = Arc::new(registry);

    let server = args.metrics_port.map(|port| {
        let server = MetricsServer::new(registry.clone(), port, cancel.clone());
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!("Metrics server error: {}", e);
            }
        })
    });

    let publisher = Publisher::spawn(
        client,
        PublisherConfig {
            capacity: args.buffer_size,
            max_retries: args.max_retries,
            policy: if args.at_least_once {
                DeliveryPolicy::AtLeastOnce
            } else {
                DeliveryPolicy::BestEffort
            },
            ..Default::default()
        },
        metrics.clone(),
    );

    let mode = ScrapeMode::from_interval_ms(args.interval);
    let scrape = ScrapeConfig {
        netdev: args.netdev,
        qdisc: args.qdisc,
        mode,
        print: args.print,
    };
    if !scrape.netdev && !scrape.qdisc {
        tracing::warn!("Both --netdev and --qdisc are disabled, nothing will be collected");
    }
    tracing::info!("Scrape mode: {:?}", mode);

    let mut scheduler = Scheduler::new(source, publisher, scrape, cancel.clone(), metrics);
    scheduler.run().await;

    let limit = Duration::from_secs(args.shutdown_timeout);
    match scheduler.shutdown_within(limit).await {
        Ok(n) => tracing::info!("Final flush wrote {} points", n),
        Err(e) => tracing::error!("Final flush failed: {}", e),
    }

    cancel.cancel();
    if let Some(handle) = server {
        handle.await.ok();
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
