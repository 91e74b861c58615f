//! Wire boundary. The actual request serialization lives in the networking
//! layer; the fetcher only sees a future per request and a uniform error
//! taxonomy that feeds its retry/ban path.

use crate::fetcher::job::JobTask;
use crate::peers::pool::PeerRef;
use core::future::Future;
use core::pin::Pin;

pub type TransportFuture<T> =
    Pin<Box<dyn Future<Output = Result<Vec<T>, TransportError>> + Send + 'static>>;

/// Failure of a single peer request. Every variant is recoverable: the
/// scheduler retries the task and holds the failure against the peer.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// The peer did not answer within the per-job timeout.
    Timeout,
    /// The connection dropped before or during the response.
    Disconnected(String),
    /// The response could not be decoded, or its shape does not match the
    /// request (wrong count, wrong range). Signals a lying or broken peer.
    Malformed(String),
    /// The peer answered with a protocol-level error.
    Protocol(String),
}

impl TransportError {
    /// Short label used in structured log events.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Timeout => "timeout",
            TransportError::Disconnected(_) => "disconnected",
            TransportError::Malformed(_) => "malformed",
            TransportError::Protocol(_) => "protocol",
        }
    }

    /// Whether this failure indicates a response that actively contradicts
    /// the request, as opposed to a peer that simply went away.
    pub fn is_mismatch(&self) -> bool {
        matches!(self, TransportError::Malformed(_))
    }
}

impl core::fmt::Display for TransportError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "request timed out"),
            TransportError::Disconnected(detail) => write!(f, "peer disconnected: {detail}"),
            TransportError::Malformed(detail) => write!(f, "malformed response: {detail}"),
            TransportError::Protocol(detail) => write!(f, "protocol error: {detail}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Trait implemented by the networking layer to serve fetch requests.
///
/// `request` returns all items covered by the task, in ascending order. Any
/// shortfall, reordering, or junk must surface as [`TransportError`]; the
/// fetcher never inspects partially valid responses.
pub trait PeerTransport: Send + Sync + 'static {
    type Item: Send + 'static;

    fn request(&self, peer: &PeerRef, task: &JobTask) -> TransportFuture<Self::Item>;
}
