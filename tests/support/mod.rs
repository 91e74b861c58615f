use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use alloy_primitives::U256;
use anyhow::{anyhow, bail, Result};
use chainfetch::{
    BlockItem, JobTask, PeerId, PeerPool, PeerRef, PeerTransport, SinkError, SinkFuture, SinkStage,
    StorageSink, TransportError, TransportFuture,
};
use once_cell::sync::Lazy;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Minimal fetched item: just a block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestBlock {
    pub number: U256,
}

impl BlockItem for TestBlock {
    fn number(&self) -> U256 {
        self.number
    }
}

fn honest_response(task: &JobTask) -> Vec<TestBlock> {
    (0..task.count)
        .map(|offset| TestBlock {
            number: task.first + U256::from(offset as u64),
        })
        .collect()
}

/// Scripted misbehaviour, consumed one entry per request; a peer with an
/// empty script answers honestly.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Never answer; the engine's request timeout must fire.
    Hang,
    Disconnect,
    /// Answer with one item fewer than requested.
    ShortResponse,
    /// Answer with the right count but starting one block too high.
    WrongStart,
}

struct PeerState {
    peer: PeerRef,
    faults: Mutex<VecDeque<Fault>>,
    requests: AtomicU64,
}

struct NetworkInner {
    peers: Mutex<Vec<Arc<PeerState>>>,
    bans: Mutex<Vec<(PeerId, Duration)>>,
    latency: Duration,
}

/// In-process peer set serving scripted responses. Implements both
/// [`PeerPool`] and [`PeerTransport`], so one clone serves as the pool and
/// another as the transport.
#[derive(Clone)]
pub struct MockNetwork {
    inner: Arc<NetworkInner>,
}

impl MockNetwork {
    pub fn new(honest_peers: usize) -> Self {
        Self::with_latency(honest_peers, Duration::from_millis(2))
    }

    /// Network whose every request takes `latency` to answer, for tests that
    /// care about peers staying busy.
    pub fn with_latency(honest_peers: usize, latency: Duration) -> Self {
        let network = Self {
            inner: Arc::new(NetworkInner {
                peers: Mutex::new(Vec::new()),
                bans: Mutex::new(Vec::new()),
                latency,
            }),
        };
        for _ in 0..honest_peers {
            network.add_peer(128);
        }
        network
    }

    pub fn add_peer(&self, max_items: usize) -> PeerId {
        self.add_peer_with_faults(max_items, Vec::new())
    }

    pub fn add_peer_with_faults(&self, max_items: usize, faults: Vec<Fault>) -> PeerId {
        let peer = PeerRef::new(PeerId::random(), max_items, 68);
        let id = peer.id;
        self.inner.peers.lock().unwrap().push(Arc::new(PeerState {
            peer,
            faults: Mutex::new(faults.into()),
            requests: AtomicU64::new(0),
        }));
        id
    }

    pub fn requests_served(&self, peer: &PeerId) -> u64 {
        self.inner
            .peers
            .lock()
            .unwrap()
            .iter()
            .find(|state| state.peer.id == *peer)
            .map(|state| state.requests.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Peers the fetcher asked the pool to exclude, in order.
    pub fn ban_requests(&self) -> Vec<(PeerId, Duration)> {
        self.inner.bans.lock().unwrap().clone()
    }

    fn state_of(&self, peer: &PeerId) -> Option<Arc<PeerState>> {
        self.inner
            .peers
            .lock()
            .unwrap()
            .iter()
            .find(|state| state.peer.id == *peer)
            .cloned()
    }
}

impl PeerPool for MockNetwork {
    fn list_available(&self) -> Vec<PeerRef> {
        self.inner
            .peers
            .lock()
            .unwrap()
            .iter()
            .map(|state| state.peer.clone())
            .collect()
    }

    fn ban(&self, peer: PeerId, cooldown: Duration) {
        self.inner.bans.lock().unwrap().push((peer, cooldown));
    }
}

impl PeerTransport for MockNetwork {
    type Item = TestBlock;

    fn request(&self, peer: &PeerRef, task: &JobTask) -> TransportFuture<TestBlock> {
        let latency = self.inner.latency;
        let state = self.state_of(&peer.id);
        let task = *task;
        Box::pin(async move {
            sleep(latency).await;
            let Some(state) = state else {
                return Err(TransportError::Disconnected("unknown peer".into()));
            };
            state.requests.fetch_add(1, Ordering::Relaxed);

            let fault = state.faults.lock().unwrap().pop_front();
            match fault {
                None => Ok(honest_response(&task)),
                Some(Fault::Hang) => {
                    futures::future::pending::<()>().await;
                    unreachable!("pending future resolved")
                }
                Some(Fault::Disconnect) => {
                    Err(TransportError::Disconnected("connection reset".into()))
                }
                Some(Fault::ShortResponse) => {
                    let mut items = honest_response(&task);
                    items.pop();
                    Ok(items)
                }
                Some(Fault::WrongStart) => {
                    let shifted = JobTask::new(task.first + U256::from(1u64), task.count);
                    Ok(honest_response(&shifted))
                }
            }
        })
    }
}

#[derive(Default)]
pub struct SinkState {
    pub flushed: Vec<TestBlock>,
    pub batch_sizes: Vec<usize>,
    pub shutdowns: u32,
}

pub type SharedSinkState = Arc<Mutex<SinkState>>;

/// Sink that records every flushed batch; optionally fails after a number of
/// successful flushes.
pub struct RecordingSink {
    state: SharedSinkState,
    fail_after_batches: Option<usize>,
}

impl RecordingSink {
    pub fn new() -> (Self, SharedSinkState) {
        let state = SharedSinkState::default();
        (
            Self {
                state: state.clone(),
                fail_after_batches: None,
            },
            state,
        )
    }

    pub fn failing_after(batches: usize) -> (Self, SharedSinkState) {
        let (mut sink, state) = Self::new();
        sink.fail_after_batches = Some(batches);
        (sink, state)
    }
}

impl StorageSink for RecordingSink {
    type Item = TestBlock;

    fn flush<'a>(&'a mut self, batch: Vec<TestBlock>) -> SinkFuture<'a> {
        let state = self.state.clone();
        let fail_after = self.fail_after_batches;
        Box::pin(async move {
            let mut guard = state.lock().unwrap();
            if let Some(limit) = fail_after {
                if guard.batch_sizes.len() >= limit {
                    return Err(SinkError::new(SinkStage::Flush, anyhow!("disk full")));
                }
            }
            guard.batch_sizes.push(batch.len());
            guard.flushed.extend(batch);
            Ok(())
        })
    }

    fn shutdown<'a>(&'a mut self) -> SinkFuture<'a> {
        let state = self.state.clone();
        Box::pin(async move {
            state.lock().unwrap().shutdowns += 1;
            Ok(())
        })
    }
}

/// Flushed block numbers, narrowed to u64 for easy assertions.
pub fn flushed_numbers(state: &SharedSinkState) -> Vec<u64> {
    state
        .lock()
        .unwrap()
        .flushed
        .iter()
        .map(|block| block.number.to::<u64>())
        .collect()
}

pub fn assert_is_contiguous(numbers: &[u64]) {
    for window in numbers.windows(2) {
        if let [lhs, rhs] = window {
            assert_eq!(rhs, &(lhs + 1), "block numbers must increase by one");
        }
    }
}

pub async fn wait_for_flushed_len(
    state: &SharedSinkState,
    target: usize,
    timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    loop {
        let current = state.lock().unwrap().flushed.len();
        if current >= target {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("sink did not receive {target} blocks within {timeout:?} (got {current})");
        }
        sleep(Duration::from_millis(20)).await;
    }
}
