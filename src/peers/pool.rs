use std::time::Duration;

/// Opaque identifier of a connected peer, as negotiated by the connection
/// layer (node public key).
pub type PeerId = alloy_primitives::B512;

/// Snapshot of a connected peer as reported by the pool.
///
/// The handle is only valid for the scheduling pass it was listed in; the
/// connection layer may drop the peer at any time, which surfaces to the
/// fetcher as a transport failure on the next request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRef {
    pub id: PeerId,
    /// Largest item count the peer accepts in one request.
    pub max_items_per_request: usize,
    /// Negotiated sync protocol version.
    pub protocol_version: u32,
    /// Whether the connection layer currently considers the peer live.
    pub is_alive: bool,
}

impl PeerRef {
    pub fn new(id: PeerId, max_items_per_request: usize, protocol_version: u32) -> Self {
        Self {
            id,
            max_items_per_request,
            protocol_version,
            is_alive: true,
        }
    }

    /// Whether this peer can serve a request of `count` items.
    pub fn can_serve(&self, count: usize) -> bool {
        self.is_alive && self.max_items_per_request >= count
    }
}

/// Read-only view of the connection layer's peer set.
///
/// Implementations are expected to be cheap to poll; the scheduler calls
/// [`PeerPool::list_available`] on every assignment pass.
pub trait PeerPool: Send + Sync + 'static {
    /// Peers currently available for assignment.
    fn list_available(&self) -> Vec<PeerRef>;

    /// Asks the connection layer to exclude a misbehaving peer for `cooldown`.
    ///
    /// Advisory only: the scheduler enforces its own ban list regardless of
    /// what the pool does with the request.
    fn ban(&self, peer: PeerId, cooldown: Duration);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_serve_respects_capability_and_liveness() {
        let mut peer = PeerRef::new(PeerId::random(), 16, 68);
        assert!(peer.can_serve(16));
        assert!(!peer.can_serve(17));

        peer.is_alive = false;
        assert!(!peer.can_serve(1));
    }
}
