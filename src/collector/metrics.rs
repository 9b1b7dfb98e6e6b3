use crate::point::MetricFamily;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicU64;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FamilyLabels {
    pub family: String,
}

impl From<MetricFamily> for FamilyLabels {
    fn from(family: MetricFamily) -> Self {
        Self {
            family: family.measurement().to_string(),
        }
    }
}

/// The collector's own health counters.
#[derive(Default)]
pub struct CollectorMetrics {
    pub ticks: Counter,
    pub points_scraped: Family<FamilyLabels, Counter>,
    pub scrape_errors: Family<FamilyLabels, Counter>,
    pub duplicate_series: Counter,
    pub points_enqueued: Counter,
    pub points_written: Counter,
    pub points_dropped: Counter,
    pub write_retries: Counter,
    pub write_failures: Counter,
    pub buffered_points: Gauge,
    pub last_tick_seconds: Gauge<f64, AtomicU64>,
}

impl CollectorMetrics {
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "netdev_collector_ticks",
            "Scrape ticks started",
            self.ticks.clone(),
        );
        registry.register(
            "netdev_collector_points_scraped",
            "Points produced by scraping, per metric family",
            self.points_scraped.clone(),
        );
        registry.register(
            "netdev_collector_scrape_errors",
            "Failed kernel queries, per metric family",
            self.scrape_errors.clone(),
        );
        registry.register(
            "netdev_collector_duplicate_series",
            "Points discarded because their series was already seen in the same tick",
            self.duplicate_series.clone(),
        );
        registry.register(
            "netdev_collector_points_enqueued",
            "Points handed to the publisher",
            self.points_enqueued.clone(),
        );
        registry.register(
            "netdev_collector_points_written",
            "Points acknowledged by the remote store",
            self.points_written.clone(),
        );
        registry.register(
            "netdev_collector_points_dropped",
            "Points lost to buffer overflow or exhausted retries",
            self.points_dropped.clone(),
        );
        registry.register(
            "netdev_collector_write_retries",
            "Write attempts retried after a transient failure",
            self.write_retries.clone(),
        );
        registry.register(
            "netdev_collector_write_failures",
            "Flushes that failed after the retry budget",
            self.write_failures.clone(),
        );
        registry.register(
            "netdev_collector_buffered_points",
            "Points waiting in the publisher buffer",
            self.buffered_points.clone(),
        );
        registry.register(
            "netdev_collector_last_tick_seconds",
            "Wall time of the most recent scrape tick in seconds",
            self.last_tick_seconds.clone(),
        );
    }

    pub fn record_scrape(&self, family: MetricFamily, points: usize) {
        self.points_scraped
            .get_or_create(&family.into())
            .inc_by(points as u64);
    }

    pub fn record_scrape_error(&self, family: MetricFamily) {
        self.scrape_errors.get_or_create(&family.into()).inc();
    }
}
