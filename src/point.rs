use crate::source::{RawInterfaceStat, RawQdiscStat};
use chrono::{DateTime, Utc};
use influxdb_line_protocol::LineProtocolBuilder;
use std::collections::BTreeMap;
use std::fmt;

/// The two families of counters the collector scrapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricFamily {
    Netdev,
    Qdisc,
}

impl MetricFamily {
    pub const fn measurement(self) -> &'static str {
        match self {
            MetricFamily::Netdev => "netdev",
            MetricFamily::Qdisc => "qdisc",
        }
    }
}

impl fmt::Display for MetricFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.measurement())
    }
}

/// One sample of one series: measurement, identifying tags, counter fields
/// and the scrape time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricPoint {
    measurement: &'static str,
    tags: BTreeMap<&'static str, String>,
    fields: BTreeMap<&'static str, u64>,
    timestamp: DateTime<Utc>,
}

impl MetricPoint {
    pub fn new(
        measurement: &'static str,
        tags: BTreeMap<&'static str, String>,
        fields: BTreeMap<&'static str, u64>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            measurement,
            tags,
            fields,
            timestamp,
        }
    }

    pub fn measurement(&self) -> &'static str {
        self.measurement
    }

    pub fn tags(&self) -> &BTreeMap<&'static str, String> {
        &self.tags
    }

    pub fn fields(&self) -> &BTreeMap<&'static str, u64> {
        &self.fields
    }

    pub fn field(&self, key: &str) -> Option<u64> {
        self.fields.get(key).copied()
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Measurement plus tag set, e.g. `qdisc,interface=eth0,kind=mq,parent=4294967295`.
    pub fn series_key(&self) -> String {
        let mut key = self.measurement.to_string();
        for (k, v) in &self.tags {
            key.push(',');
            key.push_str(k);
            key.push('=');
            key.push_str(v);
        }
        key
    }
}

pub fn netdev_point(stat: &RawInterfaceStat, ts: DateTime<Utc>) -> MetricPoint {
    let tags = BTreeMap::from([("interface", stat.name.clone())]);
    let fields = BTreeMap::from([
        ("RXBytes", stat.rx_bytes),
        ("RXPackets", stat.rx_packets),
        ("RXErrors", stat.rx_errors),
        ("RXDropped", stat.rx_dropped),
        ("TXBytes", stat.tx_bytes),
        ("TXPackets", stat.tx_packets),
        ("TXErrors", stat.tx_errors),
        ("TXDropped", stat.tx_dropped),
    ]);
    MetricPoint::new(MetricFamily::Netdev.measurement(), tags, fields, ts)
}

pub fn qdisc_point(stat: &RawQdiscStat, ts: DateTime<Utc>) -> MetricPoint {
    let tags = BTreeMap::from([
        ("interface", stat.interface.clone()),
        ("kind", stat.kind.clone()),
        ("parent", stat.parent.to_string()),
    ]);
    let fields = BTreeMap::from([
        ("Bytes", stat.bytes),
        ("Packets", stat.packets),
        ("Drops", stat.drops as u64),
        ("Overlimits", stat.overlimits as u64),
        ("Backlog", stat.backlog as u64),
    ]);
    MetricPoint::new(MetricFamily::Qdisc.measurement(), tags, fields, ts)
}

/// Encode points as InfluxDB line protocol with nanosecond timestamps.
///
/// Points without fields are not representable and are skipped.
pub fn to_line_protocol(points: &[MetricPoint]) -> Vec<u8> {
    let mut builder = LineProtocolBuilder::new();

    for point in points {
        let mut fields = point.fields.iter();
        let Some((&first_key, &first_value)) = fields.next() else {
            tracing::warn!("Skipping {} with no fields", point.series_key());
            continue;
        };
        let ts = point.timestamp.timestamp_nanos_opt().unwrap_or(0);

        let mut tags = point.tags.iter();
        let line = builder.measurement(point.measurement);
        let line = match tags.next() {
            Some((k, v)) => tags
                .fold(line.tag(k, v), |b, (k, v)| b.tag(k, v))
                .field(first_key, first_value),
            None => line.field(first_key, first_value),
        };
        builder = fields
            .fold(line, |b, (&k, &v)| b.field(k, v))
            .timestamp(ts)
            .close_line();
    }

    builder.build()
}
