use crate::error::{ResolutionError, SourceError};
use crate::netlink::{
    self, IFINFOMSG_LEN, NetlinkSocket, QdiscMessage, RTM_GETLINK, RTM_GETQDISC, RTM_NEWLINK,
    RTM_NEWQDISC, TCMSG_LEN,
};
use std::ffi::CStr;
use std::io;
use std::sync::Mutex;

/// Per-interface counters, as `/proc/net/dev` reports them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawInterfaceStat {
    pub name: String,
    pub index: u32,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errors: u64,
    pub rx_dropped: u64,
    pub rx_fifo_errors: u64,
    pub rx_frame_errors: u64,
    pub rx_compressed: u64,
    pub multicast: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errors: u64,
    pub tx_dropped: u64,
    pub tx_fifo_errors: u64,
    pub collisions: u64,
    pub tx_carrier_errors: u64,
    pub tx_compressed: u64,
}

/// Per-qdisc counters with the owning interface already resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawQdiscStat {
    pub interface: String,
    pub ifindex: u32,
    pub kind: String,
    pub handle: u32,
    pub parent: u32,
    pub bytes: u64,
    pub packets: u64,
    pub drops: u32,
    pub overlimits: u32,
    pub bps: u64,
    pub pps: u64,
    pub qlen: u32,
    pub backlog: u32,
}

/// Source of raw kernel counters.
///
/// Both calls block on I/O. Errors are returned, never papered over with
/// partial data; only a qdisc whose interface cannot be resolved is skipped.
pub trait StatSource: Send + Sync {
    fn list_interfaces(&self) -> Result<Vec<RawInterfaceStat>, SourceError>;

    fn list_qdiscs(&self) -> Result<Vec<RawQdiscStat>, SourceError>;
}

/// `StatSource` backed by an rtnetlink socket.
pub struct NetlinkSource {
    socket: Mutex<NetlinkSocket>,
}

impl NetlinkSource {
    pub fn open() -> Result<Self, SourceError> {
        let socket =
            NetlinkSocket::open().map_err(|e| SourceError::unavailable("open rtnetlink socket", e))?;
        Ok(Self {
            socket: Mutex::new(socket),
        })
    }

    fn dump(
        &self,
        op: &'static str,
        request: u16,
        family_len: usize,
        reply: u16,
    ) -> Result<Vec<Vec<u8>>, SourceError> {
        let socket = self
            .socket
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        socket.dump(op, request, family_len, reply)
    }
}

impl StatSource for NetlinkSource {
    fn list_interfaces(&self) -> Result<Vec<RawInterfaceStat>, SourceError> {
        const OP: &str = "RTM_GETLINK dump";
        let payloads = self.dump(OP, RTM_GETLINK, IFINFOMSG_LEN, RTM_NEWLINK)?;

        let mut stats = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let link = netlink::parse_link(&payload).map_err(|e| SourceError::malformed(OP, e))?;
            let Some(s) = link.stats else {
                tracing::debug!("{} (index {}) reports no statistics", link.name, link.index);
                continue;
            };
            stats.push(RawInterfaceStat {
                name: link.name,
                index: link.index,
                rx_bytes: s.rx_bytes,
                rx_packets: s.rx_packets,
                rx_errors: s.rx_errors,
                rx_dropped: s.rx_dropped,
                rx_fifo_errors: s.rx_fifo_errors,
                rx_frame_errors: s.rx_frame_errors,
                rx_compressed: s.rx_compressed,
                multicast: s.multicast,
                tx_bytes: s.tx_bytes,
                tx_packets: s.tx_packets,
                tx_errors: s.tx_errors,
                tx_dropped: s.tx_dropped,
                tx_fifo_errors: s.tx_fifo_errors,
                collisions: s.collisions,
                tx_carrier_errors: s.tx_carrier_errors,
                tx_compressed: s.tx_compressed,
            });
        }
        Ok(stats)
    }

    fn list_qdiscs(&self) -> Result<Vec<RawQdiscStat>, SourceError> {
        const OP: &str = "RTM_GETQDISC dump";
        let payloads = self.dump(OP, RTM_GETQDISC, TCMSG_LEN, RTM_NEWQDISC)?;

        let messages = payloads
            .iter()
            .map(|p| netlink::parse_qdisc(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SourceError::malformed(OP, e))?;

        Ok(resolve_owners(messages, interface_name))
    }
}

/// Attach interface names to qdisc records.
///
/// A record whose index does not resolve is dropped with a warning; the rest
/// are returned in their original order.
pub fn resolve_owners<F>(messages: Vec<QdiscMessage>, mut resolve: F) -> Vec<RawQdiscStat>
where
    F: FnMut(u32) -> Result<String, ResolutionError>,
{
    let mut stats = Vec::with_capacity(messages.len());
    for msg in messages {
        let interface = match resolve(msg.ifindex) {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(
                    "Skipping {} qdisc (handle {:#x}, parent {}): {}",
                    msg.kind,
                    msg.handle,
                    msg.parent,
                    e
                );
                continue;
            }
        };
        stats.push(RawQdiscStat {
            interface,
            ifindex: msg.ifindex,
            kind: msg.kind,
            handle: msg.handle,
            parent: msg.parent,
            bytes: msg.stats.bytes,
            packets: msg.stats.packets,
            drops: msg.stats.drops,
            overlimits: msg.stats.overlimits,
            bps: msg.stats.bps,
            pps: msg.stats.pps,
            qlen: msg.stats.qlen,
            backlog: msg.stats.backlog,
        });
    }
    stats
}

/// Map an interface index to its name with `if_indextoname(3)`.
pub fn interface_name(ifindex: u32) -> Result<String, ResolutionError> {
    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
    let ret = unsafe { libc::if_indextoname(ifindex, buf.as_mut_ptr()) };
    if ret.is_null() {
        return Err(ResolutionError {
            ifindex,
            source: io::Error::last_os_error(),
        });
    }
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::QdiscStats;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct LogCapture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogCapture {
        fn warnings(&self) -> Vec<String> {
            String::from_utf8(self.0.lock().unwrap().clone())
                .unwrap()
                .lines()
                .filter(|l| l.contains("WARN"))
                .map(str::to_string)
                .collect()
        }
    }

    fn qdisc(ifindex: u32, kind: &str, parent: u32) -> QdiscMessage {
        QdiscMessage {
            ifindex,
            handle: 0,
            parent,
            kind: kind.to_string(),
            stats: QdiscStats {
                bytes: 100 * ifindex as u64,
                packets: 10,
                drops: 1,
                overlimits: 2,
                backlog: 3,
                ..Default::default()
            },
        }
    }

    fn lookup(names: &[(u32, &str)]) -> impl FnMut(u32) -> Result<String, ResolutionError> {
        let names: HashMap<u32, String> = names
            .iter()
            .map(|(i, n)| (*i, n.to_string()))
            .collect();
        move |ifindex| {
            names.get(&ifindex).cloned().ok_or(ResolutionError {
                ifindex,
                source: io::Error::from_raw_os_error(libc::ENXIO),
            })
        }
    }

    #[test]
    fn resolves_all_known_owners() {
        let messages = vec![
            qdisc(1, "noqueue", 0xffff_ffff),
            qdisc(2, "fq_codel", 0xffff_ffff),
        ];
        let stats = resolve_owners(messages, lookup(&[(1, "lo"), (2, "eth0")]));

        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].interface, "lo");
        assert_eq!(stats[1].interface, "eth0");
        assert_eq!(stats[1].kind, "fq_codel");
        assert_eq!(stats[1].bytes, 200);
        assert_eq!(stats[1].backlog, 3);
    }

    #[test]
    fn unresolvable_owners_are_skipped_not_fatal() {
        let messages = vec![
            qdisc(1, "noqueue", 0xffff_ffff),
            qdisc(7, "mq", 0xffff_ffff),
            qdisc(2, "fq_codel", 0xffff_ffff),
            qdisc(9, "pfifo_fast", 1),
            qdisc(2, "ingress", 0xffff_fff1),
        ];
        let capture = LogCapture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();

        let stats = tracing::subscriber::with_default(subscriber, || {
            resolve_owners(messages, lookup(&[(1, "lo"), (2, "eth0")]))
        });

        assert_eq!(stats.len(), 3);
        assert!(stats.iter().all(|s| s.ifindex == 1 || s.ifindex == 2));
        assert_eq!(stats[2].kind, "ingress");

        let warnings = capture.warnings();
        assert_eq!(warnings.len(), 2, "{warnings:?}");
        assert!(warnings[0].contains("Skipping mq qdisc"));
        assert!(warnings[0].contains("index 7"));
        assert!(warnings[1].contains("Skipping pfifo_fast qdisc"));
        assert!(warnings[1].contains("index 9"));
    }

    #[test]
    fn resolves_loopback_by_index() {
        // Index 1 is the loopback device on Linux.
        let name = interface_name(1).unwrap();
        assert_eq!(name, "lo");
    }

    #[test]
    fn unknown_index_fails_resolution() {
        let err = interface_name(u32::MAX).unwrap_err();
        assert_eq!(err.ifindex, u32::MAX);
    }
}
