//! Minimal rtnetlink client.
//!
//! Only what the collector needs: a blocking `NETLINK_ROUTE` socket that can
//! issue dump requests, and decoders for the `RTM_NEWLINK` and `RTM_NEWQDISC`
//! replies. Multi-byte fields on netlink are host byte order.

use crate::error::SourceError;
use bitflags::bitflags;
use byteorder::{ByteOrder, NativeEndian};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicU32, Ordering};

pub const NLMSG_HDRLEN: usize = 16;
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;

pub const RTM_NEWLINK: u16 = 16;
pub const RTM_GETLINK: u16 = 18;
pub const RTM_NEWQDISC: u16 = 36;
pub const RTM_GETQDISC: u16 = 38;

/// `struct ifinfomsg`
pub const IFINFOMSG_LEN: usize = 16;
/// `struct tcmsg`
pub const TCMSG_LEN: usize = 20;

pub const IFLA_IFNAME: u16 = 3;
pub const IFLA_STATS: u16 = 7;
pub const IFLA_STATS64: u16 = 23;

pub const TCA_KIND: u16 = 1;
pub const TCA_STATS: u16 = 3;
pub const TCA_STATS2: u16 = 7;

pub const TCA_STATS_BASIC: u16 = 1;
pub const TCA_STATS_RATE_EST: u16 = 2;
pub const TCA_STATS_QUEUE: u16 = 3;
pub const TCA_STATS_RATE_EST64: u16 = 5;
pub const TCA_STATS_PKT64: u16 = 8;

/// Strips `NLA_F_NESTED` and `NLA_F_NET_BYTEORDER`.
const NLA_TYPE_MASK: u16 = 0x3fff;

/// `struct rtnl_link_stats64` has 23 counters we know about.
const LINK_STATS_COUNTERS: usize = 23;
/// Legacy `struct tc_stats` without its trailing padding.
const TC_STATS_LEN: usize = 36;

const RECV_BUF_LEN: usize = 64 * 1024;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NlmFlags: u16 {
        const REQUEST = 0x01;
        const MULTI = 0x02;
        const ACK = 0x04;
        const ROOT = 0x100;
        const MATCH = 0x200;
        const DUMP = Self::ROOT.bits() | Self::MATCH.bits();
    }
}

const fn align(len: usize) -> usize {
    (len + 3) & !3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub len: u32,
    pub kind: u16,
    pub flags: NlmFlags,
    pub seq: u32,
    pub pid: u32,
}

#[derive(Debug)]
pub struct Message<'a> {
    pub header: MessageHeader,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attribute<'a> {
    pub kind: u16,
    pub value: &'a [u8],
}

/// Build a dump request with an all-zero family header of `family_len` bytes.
pub fn dump_request(kind: u16, seq: u32, family_len: usize) -> Vec<u8> {
    let len = NLMSG_HDRLEN + align(family_len);
    let mut buf = vec![0u8; len];
    NativeEndian::write_u32(&mut buf[0..4], len as u32);
    NativeEndian::write_u16(&mut buf[4..6], kind);
    NativeEndian::write_u16(
        &mut buf[6..8],
        (NlmFlags::REQUEST | NlmFlags::DUMP).bits(),
    );
    NativeEndian::write_u32(&mut buf[8..12], seq);
    buf
}

/// Split a receive buffer into netlink messages.
pub fn parse_messages(buf: &[u8]) -> Result<Vec<Message<'_>>, String> {
    let mut messages = Vec::new();
    let mut offset = 0;

    while buf.len() - offset >= NLMSG_HDRLEN {
        let raw = &buf[offset..];
        let len = NativeEndian::read_u32(&raw[0..4]) as usize;
        if len < NLMSG_HDRLEN || len > raw.len() {
            return Err(format!(
                "message length {} out of bounds ({} bytes left)",
                len,
                raw.len()
            ));
        }

        let header = MessageHeader {
            len: len as u32,
            kind: NativeEndian::read_u16(&raw[4..6]),
            flags: NlmFlags::from_bits_retain(NativeEndian::read_u16(&raw[6..8])),
            seq: NativeEndian::read_u32(&raw[8..12]),
            pid: NativeEndian::read_u32(&raw[12..16]),
        };
        messages.push(Message {
            header,
            payload: &raw[NLMSG_HDRLEN..len],
        });

        offset += align(len).min(raw.len());
    }

    Ok(messages)
}

/// Parse a run of `rtattr`/`nlattr` records.
pub fn parse_attributes(buf: &[u8]) -> Result<Vec<Attribute<'_>>, String> {
    let mut attrs = Vec::new();
    let mut offset = 0;

    while buf.len() - offset >= 4 {
        let raw = &buf[offset..];
        let len = NativeEndian::read_u16(&raw[0..2]) as usize;
        if len < 4 || len > raw.len() {
            return Err(format!(
                "attribute length {} out of bounds ({} bytes left)",
                len,
                raw.len()
            ));
        }
        attrs.push(Attribute {
            kind: NativeEndian::read_u16(&raw[2..4]) & NLA_TYPE_MASK,
            value: &raw[4..len],
        });
        offset += align(len).min(raw.len());
    }

    Ok(attrs)
}

fn attr_string(value: &[u8]) -> String {
    let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
    String::from_utf8_lossy(&value[..end]).into_owned()
}

/// The errno carried by an `NLMSG_ERROR` (or `NLMSG_DONE`) payload, as a
/// negative number; 0 is an acknowledgement.
pub fn error_code(payload: &[u8]) -> Option<i32> {
    (payload.len() >= 4).then(|| NativeEndian::read_i32(&payload[0..4]))
}

/// Counters from `struct rtnl_link_stats64`, in kernel field order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
    pub multicast: u64,
    pub collisions: u64,
    pub rx_length_errors: u64,
    pub rx_over_errors: u64,
    pub rx_crc_errors: u64,
    pub rx_frame_errors: u64,
    pub rx_fifo_errors: u64,
    pub rx_missed_errors: u64,
    pub tx_aborted_errors: u64,
    pub tx_carrier_errors: u64,
    pub tx_fifo_errors: u64,
    pub tx_heartbeat_errors: u64,
    pub tx_window_errors: u64,
    pub rx_compressed: u64,
    pub tx_compressed: u64,
}

impl LinkStats {
    fn from_counters(c: &[u64; LINK_STATS_COUNTERS]) -> Self {
        Self {
            rx_packets: c[0],
            tx_packets: c[1],
            rx_bytes: c[2],
            tx_bytes: c[3],
            rx_errors: c[4],
            tx_errors: c[5],
            rx_dropped: c[6],
            tx_dropped: c[7],
            multicast: c[8],
            collisions: c[9],
            rx_length_errors: c[10],
            rx_over_errors: c[11],
            rx_crc_errors: c[12],
            rx_frame_errors: c[13],
            rx_fifo_errors: c[14],
            rx_missed_errors: c[15],
            tx_aborted_errors: c[16],
            tx_carrier_errors: c[17],
            tx_fifo_errors: c[18],
            tx_heartbeat_errors: c[19],
            tx_window_errors: c[20],
            rx_compressed: c[21],
            tx_compressed: c[22],
        }
    }

    /// Decode `IFLA_STATS64` (8-byte counters) or `IFLA_STATS` (4-byte).
    fn parse(value: &[u8], width: usize) -> Option<Self> {
        if value.len() < LINK_STATS_COUNTERS * width {
            return None;
        }
        let mut counters = [0u64; LINK_STATS_COUNTERS];
        for (i, counter) in counters.iter_mut().enumerate() {
            let at = i * width;
            *counter = match width {
                8 => NativeEndian::read_u64(&value[at..at + 8]),
                _ => NativeEndian::read_u32(&value[at..at + 4]) as u64,
            };
        }
        Some(Self::from_counters(&counters))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkMessage {
    pub index: u32,
    pub name: String,
    pub stats: Option<LinkStats>,
}

/// Decode the payload of an `RTM_NEWLINK` message.
pub fn parse_link(payload: &[u8]) -> Result<LinkMessage, String> {
    if payload.len() < IFINFOMSG_LEN {
        return Err(format!("ifinfomsg truncated ({} bytes)", payload.len()));
    }
    let index = NativeEndian::read_i32(&payload[4..8]) as u32;

    let mut name = None;
    let mut stats64 = None;
    let mut stats32 = None;
    for attr in parse_attributes(&payload[IFINFOMSG_LEN..])? {
        match attr.kind {
            IFLA_IFNAME => name = Some(attr_string(attr.value)),
            IFLA_STATS64 => stats64 = LinkStats::parse(attr.value, 8),
            IFLA_STATS => stats32 = LinkStats::parse(attr.value, 4),
            _ => {}
        }
    }

    let name = name.ok_or_else(|| format!("link {} has no IFLA_IFNAME", index))?;
    Ok(LinkMessage {
        index,
        name,
        stats: stats64.or(stats32),
    })
}

/// Qdisc counters, merged from `TCA_STATS2` or the legacy `TCA_STATS`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QdiscStats {
    pub bytes: u64,
    pub packets: u64,
    pub drops: u32,
    pub overlimits: u32,
    pub requeues: u32,
    pub bps: u64,
    pub pps: u64,
    pub qlen: u32,
    pub backlog: u32,
}

impl QdiscStats {
    fn parse_legacy(value: &[u8]) -> Option<Self> {
        if value.len() < TC_STATS_LEN {
            return None;
        }
        Some(Self {
            bytes: NativeEndian::read_u64(&value[0..8]),
            packets: NativeEndian::read_u32(&value[8..12]) as u64,
            drops: NativeEndian::read_u32(&value[12..16]),
            overlimits: NativeEndian::read_u32(&value[16..20]),
            bps: NativeEndian::read_u32(&value[20..24]) as u64,
            pps: NativeEndian::read_u32(&value[24..28]) as u64,
            qlen: NativeEndian::read_u32(&value[28..32]),
            backlog: NativeEndian::read_u32(&value[32..36]),
            requeues: 0,
        })
    }

    fn parse_stats2(value: &[u8]) -> Result<Self, String> {
        let mut stats = Self::default();
        let mut pkt64 = None;

        for attr in parse_attributes(value)? {
            let v = attr.value;
            match attr.kind {
                TCA_STATS_BASIC if v.len() >= 12 => {
                    stats.bytes = NativeEndian::read_u64(&v[0..8]);
                    stats.packets = NativeEndian::read_u32(&v[8..12]) as u64;
                }
                TCA_STATS_PKT64 if v.len() >= 8 => {
                    pkt64 = Some(NativeEndian::read_u64(&v[0..8]));
                }
                TCA_STATS_RATE_EST if v.len() >= 8 && stats.bps == 0 && stats.pps == 0 => {
                    stats.bps = NativeEndian::read_u32(&v[0..4]) as u64;
                    stats.pps = NativeEndian::read_u32(&v[4..8]) as u64;
                }
                TCA_STATS_RATE_EST64 if v.len() >= 16 => {
                    stats.bps = NativeEndian::read_u64(&v[0..8]);
                    stats.pps = NativeEndian::read_u64(&v[8..16]);
                }
                TCA_STATS_QUEUE if v.len() >= 20 => {
                    stats.qlen = NativeEndian::read_u32(&v[0..4]);
                    stats.backlog = NativeEndian::read_u32(&v[4..8]);
                    stats.drops = NativeEndian::read_u32(&v[8..12]);
                    stats.requeues = NativeEndian::read_u32(&v[12..16]);
                    stats.overlimits = NativeEndian::read_u32(&v[16..20]);
                }
                _ => {}
            }
        }

        if let Some(packets) = pkt64 {
            stats.packets = packets;
        }
        Ok(stats)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QdiscMessage {
    pub ifindex: u32,
    pub handle: u32,
    pub parent: u32,
    pub kind: String,
    pub stats: QdiscStats,
}

/// Decode the payload of an `RTM_NEWQDISC` message.
pub fn parse_qdisc(payload: &[u8]) -> Result<QdiscMessage, String> {
    if payload.len() < TCMSG_LEN {
        return Err(format!("tcmsg truncated ({} bytes)", payload.len()));
    }
    let ifindex = NativeEndian::read_i32(&payload[4..8]) as u32;
    let handle = NativeEndian::read_u32(&payload[8..12]);
    let parent = NativeEndian::read_u32(&payload[12..16]);

    let mut kind = None;
    let mut stats2 = None;
    let mut legacy = None;
    for attr in parse_attributes(&payload[TCMSG_LEN..])? {
        match attr.kind {
            TCA_KIND => kind = Some(attr_string(attr.value)),
            TCA_STATS2 => stats2 = Some(QdiscStats::parse_stats2(attr.value)?),
            TCA_STATS => legacy = QdiscStats::parse_legacy(attr.value),
            _ => {}
        }
    }

    let kind = kind.ok_or_else(|| format!("qdisc on ifindex {} has no TCA_KIND", ifindex))?;
    Ok(QdiscMessage {
        ifindex,
        handle,
        parent,
        kind,
        stats: stats2.or(legacy).unwrap_or_default(),
    })
}

/// Blocking `NETLINK_ROUTE` socket.
pub struct NetlinkSocket {
    fd: OwnedFd,
    seq: AtomicU32,
}

impl NetlinkSocket {
    pub fn open() -> io::Result<Self> {
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_ROUTE,
            )
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            fd,
            seq: AtomicU32::new(1),
        })
    }

    /// Issue a dump request and collect the payloads of every reply of type
    /// `reply_kind` until `NLMSG_DONE`.
    pub fn dump(
        &self,
        op: &'static str,
        request_kind: u16,
        family_len: usize,
        reply_kind: u16,
    ) -> Result<Vec<Vec<u8>>, SourceError> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let request = dump_request(request_kind, seq, family_len);
        self.send(&request)
            .map_err(|e| SourceError::unavailable(op, e))?;

        let mut buf = vec![0u8; RECV_BUF_LEN];
        let mut payloads = Vec::new();

        loop {
            let n = self
                .recv(&mut buf)
                .map_err(|e| SourceError::unavailable(op, e))?;
            if n == 0 {
                return Err(SourceError::malformed(op, "socket closed mid-dump"));
            }

            let messages = parse_messages(&buf[..n]).map_err(|e| SourceError::malformed(op, e))?;
            for msg in messages {
                if msg.header.seq != seq {
                    tracing::trace!("{}: ignoring message with seq {}", op, msg.header.seq);
                    continue;
                }
                match msg.header.kind {
                    NLMSG_DONE => {
                        return match error_code(msg.payload) {
                            Some(code) if code < 0 => Err(SourceError::unavailable(
                                op,
                                io::Error::from_raw_os_error(-code),
                            )),
                            _ => Ok(payloads),
                        };
                    }
                    NLMSG_ERROR => match error_code(msg.payload) {
                        Some(0) => {}
                        Some(code) => {
                            return Err(SourceError::unavailable(
                                op,
                                io::Error::from_raw_os_error(-code),
                            ));
                        }
                        None => return Err(SourceError::malformed(op, "truncated NLMSG_ERROR")),
                    },
                    kind if kind == reply_kind => payloads.push(msg.payload.to_vec()),
                    _ => {}
                }
            }
        }
    }

    fn send(&self, buf: &[u8]) -> io::Result<()> {
        loop {
            let n = unsafe {
                libc::send(
                    self.fd.as_raw_fd(),
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if n >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}
