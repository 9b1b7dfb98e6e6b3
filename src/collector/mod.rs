pub mod buffer;
pub mod metrics;
pub mod publisher;
pub mod scheduler;
pub mod server;

#[cfg(test)]
pub(crate) mod testutil;

pub use buffer::PointBuffer;
pub use metrics::CollectorMetrics;
pub use publisher::{DeliveryPolicy, PointSink, Publisher, PublisherConfig};
pub use scheduler::{ScrapeConfig, ScrapeMode, Scheduler, SchedulerState, TickReport};
pub use server::MetricsServer;
