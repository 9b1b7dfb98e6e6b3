use crate::collector::PointSink;
use crate::error::{DeliveryError, SourceError};
use crate::source::{RawInterfaceStat, RawQdiscStat, StatSource};
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Fails the first `failures` writes with `status`, then accepts and records.
/// Bodies containing `poisoned` are always refused with HTTP 400.
pub struct FakeSink {
    failures: AtomicUsize,
    status: u16,
    poisoned: Option<&'static str>,
    pub attempts: AtomicUsize,
    pub bodies: Mutex<Vec<String>>,
}

impl FakeSink {
    pub fn new(failures: usize, status: u16) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicUsize::new(failures),
            status,
            poisoned: None,
            attempts: AtomicUsize::new(0),
            bodies: Mutex::new(Vec::new()),
        })
    }

    pub fn healthy() -> Arc<Self> {
        Self::new(0, 200)
    }

    pub fn refusing(marker: &'static str) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicUsize::new(0),
            status: 200,
            poisoned: Some(marker),
            attempts: AtomicUsize::new(0),
            bodies: Mutex::new(Vec::new()),
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn lines(&self) -> Vec<String> {
        self.bodies
            .lock()
            .unwrap()
            .iter()
            .flat_map(|b| b.lines().map(str::to_string).collect::<Vec<_>>())
            .collect()
    }
}

#[async_trait]
impl PointSink for FakeSink {
    async fn write(&self, body: &[u8]) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let text = String::from_utf8(body.to_vec()).unwrap();
        if self.poisoned.is_some_and(|marker| text.contains(marker)) {
            return Err(DeliveryError::Rejected {
                status: 400,
                body: "unable to parse points".into(),
            });
        }
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(DeliveryError::Rejected {
                status: self.status,
                body: "unavailable".into(),
            });
        }
        self.bodies.lock().unwrap().push(text);
        Ok(())
    }
}

/// Serves fixed snapshots; `None` makes that family fail with EPERM.
#[derive(Default)]
pub struct FakeSource {
    pub interfaces: Option<Vec<RawInterfaceStat>>,
    pub qdiscs: Option<Vec<RawQdiscStat>>,
    pub calls: AtomicUsize,
}

impl FakeSource {
    pub fn new(
        interfaces: Option<Vec<RawInterfaceStat>>,
        qdiscs: Option<Vec<RawQdiscStat>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            interfaces,
            qdiscs,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn denied(op: &'static str) -> SourceError {
    SourceError::Unavailable {
        op,
        source: io::Error::from_raw_os_error(libc::EPERM),
    }
}

impl StatSource for FakeSource {
    fn list_interfaces(&self) -> Result<Vec<RawInterfaceStat>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.interfaces.clone().ok_or_else(|| denied("RTM_GETLINK dump"))
    }

    fn list_qdiscs(&self) -> Result<Vec<RawQdiscStat>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.qdiscs.clone().ok_or_else(|| denied("RTM_GETQDISC dump"))
    }
}

pub fn interface(name: &str, rx_bytes: u64, tx_bytes: u64) -> RawInterfaceStat {
    RawInterfaceStat {
        name: name.into(),
        rx_bytes,
        tx_bytes,
        ..Default::default()
    }
}

pub fn qdisc(interface: &str, kind: &str, parent: u32) -> RawQdiscStat {
    RawQdiscStat {
        interface: interface.into(),
        kind: kind.into(),
        parent,
        bytes: 64,
        packets: 1,
        ..Default::default()
    }
}
