//! Human-readable dumps of raw counters.
//!
//! The interface table reproduces the column layout of `/proc/net/dev`.

use crate::source::{RawInterfaceStat, RawQdiscStat};
use std::fmt::Write;

const NETDEV_HEADER: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
";

pub fn render_interfaces(stats: &[RawInterfaceStat]) -> String {
    let mut out = String::from(NETDEV_HEADER);
    for s in stats {
        let _ = writeln!(
            out,
            "{:>6}: {:>7} {:>7} {:>4} {:>4} {:>4} {:>5} {:>10} {:>9} {:>8} {:>7} {:>4} {:>4} {:>4} {:>5} {:>7} {:>9}",
            s.name,
            s.rx_bytes,
            s.rx_packets,
            s.rx_errors,
            s.rx_dropped,
            s.rx_fifo_errors,
            s.rx_frame_errors,
            s.rx_compressed,
            s.multicast,
            s.tx_bytes,
            s.tx_packets,
            s.tx_errors,
            s.tx_dropped,
            s.tx_fifo_errors,
            s.collisions,
            s.tx_carrier_errors,
            s.tx_compressed,
        );
    }
    out
}

pub fn render_qdiscs(stats: &[RawQdiscStat]) -> String {
    let mut out = String::new();
    for q in stats {
        let _ = writeln!(out, "{} {} parent:{}", q.interface, q.kind, q.parent);
        let _ = writeln!(
            out,
            "Bytes: {} Packets: {} Drops: {} Overlimits: {}",
            q.bytes, q.packets, q.drops, q.overlimits
        );
        let _ = writeln!(
            out,
            "Bps: {} Pps: {} Qlen: {} Backlog: {}",
            q.bps, q.pps, q.qlen, q.backlog
        );
    }
    out
}
