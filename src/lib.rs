pub mod collector;
pub mod console;
pub mod error;
pub mod influx;
pub mod netlink;
pub mod point;
pub mod provision;
pub mod source;

pub use error::{DeliveryError, Error, ProvisionError, ResolutionError, Result, SourceError};
pub use influx::{InfluxClient, InfluxConfig};
pub use point::{MetricFamily, MetricPoint};
pub use provision::{AdminApi, Bucket, DEFAULT_RETENTION_SECONDS, Organization, ensure_bucket};
pub use source::{NetlinkSource, RawInterfaceStat, RawQdiscStat, StatSource};
