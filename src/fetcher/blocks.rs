//! Block-sync specialization of the generic fetch engine.
//!
//! The engine only compares item counts; it never looks inside an item. For
//! block sync that is not enough: a peer can return the right number of
//! blocks from the wrong part of the chain. [`RangeCheckedTransport`] wraps
//! the networking layer and rejects any response whose block numbers do not
//! match the requested run, so a lying peer is charged a mismatch and the
//! task is retried elsewhere.

use crate::fetcher::job::JobTask;
use crate::fetcher::{FetchSummary, Fetcher};
use crate::peers::pool::{PeerPool, PeerRef};
use crate::runtime::config::FetcherConfig;
use crate::runtime::telemetry::Telemetry;
use crate::sink::StorageSink;
use crate::transport::{PeerTransport, TransportError, TransportFuture};
use alloy_primitives::U256;
use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Implemented by fetched items that carry their own chain position.
pub trait BlockItem: Send + 'static {
    /// Block number this item belongs to.
    fn number(&self) -> U256;
}

/// Checks that `items` is exactly the ascending run the task asked for.
pub fn validate_range<T: BlockItem>(items: &[T], task: &JobTask) -> Result<(), TransportError> {
    for (offset, item) in items.iter().enumerate() {
        let expected = task.first + U256::from(offset as u64);
        if item.number() != expected {
            return Err(TransportError::Malformed(format!(
                "item {offset} has block number {}, expected {expected}",
                item.number()
            )));
        }
    }
    Ok(())
}

/// Transport adapter that validates block numbering on every response.
pub struct RangeCheckedTransport<X> {
    inner: Arc<X>,
}

impl<X> RangeCheckedTransport<X> {
    pub fn new(inner: X) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }
}

impl<X> PeerTransport for RangeCheckedTransport<X>
where
    X: PeerTransport,
    X::Item: BlockItem,
{
    type Item = X::Item;

    fn request(&self, peer: &PeerRef, task: &JobTask) -> TransportFuture<Self::Item> {
        let request = self.inner.request(peer, task);
        let task = *task;
        Box::pin(async move {
            let items = request.await?;
            validate_range(&items, &task)?;
            Ok(items)
        })
    }
}

/// Block fetcher: the [`Fetcher`] engine with block-range validation layered
/// on the transport.
///
/// Blocks leave the fetcher strictly ordered by block number, because tasks
/// are generated in ascending order and released by task index.
pub struct BlockFetcher<X, S, P>
where
    X: PeerTransport,
    X::Item: BlockItem,
    S: StorageSink<Item = X::Item>,
    P: PeerPool,
{
    inner: Fetcher<RangeCheckedTransport<X>, S, P>,
}

impl<X, S, P> BlockFetcher<X, S, P>
where
    X: PeerTransport,
    X::Item: BlockItem,
    S: StorageSink<Item = X::Item>,
    P: PeerPool,
{
    pub fn new(config: FetcherConfig, transport: X, sink: S, pool: P) -> Self {
        Self::with_cancellation_token(config, transport, sink, pool, CancellationToken::new())
    }

    pub fn with_cancellation_token(
        config: FetcherConfig,
        transport: X,
        sink: S,
        pool: P,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            inner: Fetcher::with_cancellation_token(
                config,
                RangeCheckedTransport::new(transport),
                sink,
                pool,
                shutdown_token,
            ),
        }
    }

    pub fn config(&self) -> &FetcherConfig {
        self.inner.config()
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.inner.telemetry()
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// See [`Fetcher::replace_shutdown_root`].
    pub fn replace_shutdown_root(&mut self, shutdown: CancellationToken) {
        self.inner.replace_shutdown_root(shutdown);
    }

    /// Starts the pipeline. See [`Fetcher::start`].
    pub async fn start(&mut self) -> Result<()> {
        self.inner.start().await
    }

    /// Enqueues the block range `[first, first + count)`. Returns the number
    /// of tasks generated.
    pub async fn fetch_range(&self, first: U256, count: U256) -> Result<usize> {
        self.inner.enqueue_range(first, count).await
    }

    /// Enqueues an explicit set of block numbers ahead of fresh work; `min`
    /// is the smallest number in the set. Contiguous sets travel as bulk
    /// requests, gapped sets as singletons.
    pub async fn fetch_numbers(&self, numbers: &[U256], min: U256) -> Result<usize> {
        self.inner.enqueue_numbers(numbers, min).await
    }

    /// Blocks until the run terminates. See [`Fetcher::wait`].
    pub async fn wait(&mut self) -> Result<FetchSummary> {
        self.inner.wait().await
    }

    /// Stops the pipeline. See [`Fetcher::stop`].
    pub async fn stop(&mut self) -> Result<()> {
        self.inner.stop().await
    }
}
