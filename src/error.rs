use std::io;
use std::time::Duration;

/// Failure to query the kernel for one metric family.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("{op} failed: {source}")]
    Unavailable {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{op} returned a malformed reply: {reason}")]
    Malformed { op: &'static str, reason: String },
}

impl SourceError {
    pub(crate) fn unavailable(op: &'static str, source: io::Error) -> Self {
        SourceError::Unavailable { op, source }
    }

    pub(crate) fn malformed(op: &'static str, reason: impl Into<String>) -> Self {
        SourceError::Malformed {
            op,
            reason: reason.into(),
        }
    }
}

/// A qdisc whose owning interface index could not be mapped to a name.
#[derive(Debug, thiserror::Error)]
#[error("could not resolve interface index {ifindex}: {source}")]
pub struct ResolutionError {
    pub ifindex: u32,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("write rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("gave up on {points} points after {attempts} attempts: {last}")]
    RetriesExhausted {
        points: usize,
        attempts: u32,
        last: Box<DeliveryError>,
    },

    #[error("publisher worker is not running")]
    WorkerStopped,

    #[error("delivery did not finish within {0:?}")]
    TimedOut(Duration),
}

impl DeliveryError {
    /// Whether retrying the same write could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DeliveryError::Http(e) => !e.is_builder() && !e.is_decode(),
            DeliveryError::Rejected { status, .. } => *status >= 500 || *status == 429,
            DeliveryError::RetriesExhausted { .. }
            | DeliveryError::WorkerStopped
            | DeliveryError::TimedOut(_) => false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("HTTP transport error during {op}: {source}")]
    Http {
        op: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{op} failed with HTTP {status}: {body}")]
    Status {
        op: &'static str,
        status: u16,
        body: String,
    },

    #[error("organization {0:?} not found")]
    OrganizationNotFound(String),

    #[error("could not determine local hostname for the default bucket: {0}")]
    Hostname(#[source] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(status: u16) -> DeliveryError {
        DeliveryError::Rejected {
            status,
            body: String::new(),
        }
    }

    #[test]
    fn server_errors_and_throttling_are_transient() {
        assert!(rejected(500).is_transient());
        assert!(rejected(503).is_transient());
        assert!(rejected(429).is_transient());
    }

    #[test]
    fn client_errors_are_permanent() {
        assert!(!rejected(400).is_transient());
        assert!(!rejected(401).is_transient());
        assert!(!rejected(404).is_transient());
        assert!(!DeliveryError::WorkerStopped.is_transient());
    }

    #[test]
    fn exhausted_retries_report_the_last_cause() {
        let err = DeliveryError::RetriesExhausted {
            points: 12,
            attempts: 3,
            last: Box::new(rejected(503)),
        };
        let text = err.to_string();
        assert!(text.contains("12 points"));
        assert!(text.contains("3 attempts"));
        assert!(text.contains("HTTP 503"));
    }

    #[test]
    fn source_errors_name_the_operation() {
        let err = SourceError::unavailable(
            "RTM_GETQDISC dump",
            io::Error::from_raw_os_error(libc::EPERM),
        );
        assert!(err.to_string().starts_with("RTM_GETQDISC dump failed"));
    }
}
