use crate::collector::{CollectorMetrics, Publisher};
use crate::console;
use crate::error::{DeliveryError, SourceError};
use crate::point::{MetricFamily, MetricPoint, netdev_point, qdisc_point};
use crate::source::StatSource;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeMode {
    /// A single tick, then stop.
    Once,
    /// A tick every period until cancelled.
    Every(Duration),
}

impl ScrapeMode {
    /// 0 means a single run.
    pub fn from_interval_ms(ms: u64) -> Self {
        match ms {
            0 => ScrapeMode::Once,
            ms => ScrapeMode::Every(Duration::from_millis(ms)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub netdev: bool,
    pub qdisc: bool,
    pub mode: ScrapeMode,
    /// Dump raw counters to stdout every tick.
    pub print: bool,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            netdev: true,
            qdisc: true,
            mode: ScrapeMode::Once,
            print: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug)]
pub struct FamilyOutcome {
    pub family: MetricFamily,
    /// Points enqueued, or why the family could not be scraped.
    pub result: Result<usize, SourceError>,
}

/// What one scrape tick did.
#[derive(Debug)]
pub struct TickReport {
    pub timestamp: DateTime<Utc>,
    pub families: Vec<FamilyOutcome>,
    pub flush: Result<usize, DeliveryError>,
}

impl TickReport {
    pub fn points(&self, family: MetricFamily) -> Option<usize> {
        self.families
            .iter()
            .find(|o| o.family == family)
            .and_then(|o| o.result.as_ref().ok().copied())
    }

    pub fn failed(&self, family: MetricFamily) -> bool {
        self.families
            .iter()
            .any(|o| o.family == family && o.result.is_err())
    }
}

struct Scraped {
    points: Vec<MetricPoint>,
    console: Option<String>,
}

/// Drives collect, adapt and publish, one tick at a time.
///
/// Cancellation is only observed between ticks: a tick that has started
/// always runs through its flush.
pub struct Scheduler {
    source: Arc<dyn StatSource>,
    publisher: Publisher,
    config: ScrapeConfig,
    cancel: CancellationToken,
    metrics: Arc<CollectorMetrics>,
    state: SchedulerState,
}

impl Scheduler {
    pub fn new(
        source: Arc<dyn StatSource>,
        publisher: Publisher,
        config: ScrapeConfig,
        cancel: CancellationToken,
        metrics: Arc<CollectorMetrics>,
    ) -> Self {
        Self {
            source,
            publisher,
            config,
            cancel,
            metrics,
            state: SchedulerState::Idle,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Run until the mode is exhausted or the token is cancelled.
    pub async fn run(&mut self) -> SchedulerState {
        if self.state == SchedulerState::Stopped {
            return self.state;
        }

        match self.config.mode {
            ScrapeMode::Once => {
                self.tick().await;
            }
            ScrapeMode::Every(period) => {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => {
                            tracing::info!("Scheduler stopping");
                            break;
                        }
                        _ = interval.tick() => {}
                    }
                    self.tick().await;
                }
            }
        }

        self.state = SchedulerState::Stopped;
        self.state
    }

    /// One full collect, adapt, publish cycle. All points share one timestamp.
    ///
    /// Returns `None` without scraping once the scheduler has stopped.
    pub async fn tick(&mut self) -> Option<TickReport> {
        if self.state == SchedulerState::Stopped {
            tracing::debug!("Scheduler is stopped, skipping tick");
            return None;
        }
        self.state = SchedulerState::Running;
        self.metrics.ticks.inc();
        let started = Instant::now();
        let timestamp = Utc::now();

        let mut seen = HashSet::new();
        let mut families = Vec::new();
        if self.config.netdev {
            families.push(self.scrape(MetricFamily::Netdev, timestamp, &mut seen).await);
        }
        if self.config.qdisc {
            families.push(self.scrape(MetricFamily::Qdisc, timestamp, &mut seen).await);
        }

        let flush = self.publisher.flush().await;
        match &flush {
            Ok(n) => tracing::debug!("Tick flushed {} points", n),
            Err(e) => tracing::warn!("Flush failed, continuing with next tick: {}", e),
        }

        let elapsed = started.elapsed();
        self.metrics.last_tick_seconds.set(elapsed.as_secs_f64());
        tracing::debug!("Tick finished in {:?}", elapsed);

        self.state = SchedulerState::Idle;
        Some(TickReport {
            timestamp,
            families,
            flush,
        })
    }

    async fn scrape(
        &self,
        family: MetricFamily,
        timestamp: DateTime<Utc>,
        seen: &mut HashSet<String>,
    ) -> FamilyOutcome {
        let source = self.source.clone();
        let print = self.config.print;
        let scraped = tokio::task::spawn_blocking(move || {
            collect(&*source, family, timestamp, print)
        })
        .await
        .unwrap_or_else(|e| {
            Err(SourceError::Unavailable {
                op: "scrape task",
                source: io::Error::other(e.to_string()),
            })
        });

        let scraped = match scraped {
            Ok(scraped) => scraped,
            Err(e) => {
                tracing::error!("Failed to scrape {}: {}", family, e);
                self.metrics.record_scrape_error(family);
                return FamilyOutcome {
                    family,
                    result: Err(e),
                };
            }
        };

        if let Some(text) = scraped.console {
            print!("{}", text);
        }

        let mut enqueued = 0;
        for point in scraped.points {
            let key = point.series_key();
            if !seen.insert(key.clone()) {
                tracing::warn!("Duplicate series {} in one tick, keeping the first", key);
                self.metrics.duplicate_series.inc();
                continue;
            }
            self.publisher.enqueue(point);
            enqueued += 1;
        }

        tracing::debug!("Scraped {} {} points", enqueued, family);
        self.metrics.record_scrape(family, enqueued);
        FamilyOutcome {
            family,
            result: Ok(enqueued),
        }
    }

    /// Final flush and worker shutdown.
    pub async fn shutdown(self) -> Result<usize, DeliveryError> {
        self.publisher.close().await
    }

    /// `shutdown`, abandoning the final flush after `limit`.
    pub async fn shutdown_within(self, limit: Duration) -> Result<usize, DeliveryError> {
        tokio::time::timeout(limit, self.shutdown())
            .await
            .map_err(|_| DeliveryError::TimedOut(limit))?
    }
}

fn collect(
    source: &dyn StatSource,
    family: MetricFamily,
    timestamp: DateTime<Utc>,
    print: bool,
) -> Result<Scraped, SourceError> {
    match family {
        MetricFamily::Netdev => {
            let stats = source.list_interfaces()?;
            Ok(Scraped {
                points: stats.iter().map(|s| netdev_point(s, timestamp)).collect(),
                console: print.then(|| console::render_interfaces(&stats)),
            })
        }
        MetricFamily::Qdisc => {
            let stats = source.list_qdiscs()?;
            Ok(Scraped {
                points: stats.iter().map(|s| qdisc_point(s, timestamp)).collect(),
                console: print.then(|| console::render_qdiscs(&stats)),
            })
        }
    }
}
