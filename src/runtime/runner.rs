use crate::fetcher::blocks::{BlockFetcher, BlockItem};
use crate::peers::pool::PeerPool;
use crate::runtime::config::FetcherConfig;
use crate::sink::StorageSink;
use crate::transport::PeerTransport;
use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Coordinates the block fetcher lifecycle and handles OS signals for graceful shutdowns.
pub struct Runner<X, S, P>
where
    X: PeerTransport,
    X::Item: BlockItem,
    S: StorageSink<Item = X::Item>,
    P: PeerPool,
{
    fetcher: BlockFetcher<X, S, P>,
    shutdown: CancellationToken,
    started: bool,
}

impl<X, S, P> Runner<X, S, P>
where
    X: PeerTransport,
    X::Item: BlockItem,
    S: StorageSink<Item = X::Item>,
    P: PeerPool,
{
    /// Creates a new runner and wires a root [`CancellationToken`] that propagates
    /// through the entire pipeline (scheduler, request tasks, flush loop).
    pub fn new(config: FetcherConfig, transport: X, sink: S, pool: P) -> Self {
        let shutdown = CancellationToken::new();
        let fetcher =
            BlockFetcher::with_cancellation_token(config, transport, sink, pool, shutdown.clone());
        Self {
            fetcher,
            shutdown,
            started: false,
        }
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Returns the underlying fetcher, e.g. to enqueue work while running.
    pub fn fetcher(&self) -> &BlockFetcher<X, S, P> {
        &self.fetcher
    }

    pub fn fetcher_mut(&mut self) -> &mut BlockFetcher<X, S, P> {
        &mut self.fetcher
    }

    /// Starts the underlying fetcher pipeline.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        self.fetcher.start().await?;
        self.started = true;
        Ok(())
    }

    /// Stops the pipeline gracefully by cancelling the root token and delegating to the fetcher.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }

        self.shutdown.cancel();
        self.fetcher.stop().await?;
        self.started = false;
        self.reinitialize_shutdown_token();
        Ok(())
    }

    /// Runs until a Ctrl-C (SIGINT) is received or the shutdown token is cancelled elsewhere.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start().await?;
        tracing::info!("runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received; shutting down runner");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("runner shutdown token cancelled");
            }
        }

        self.shutdown.cancel();
        self.fetcher.stop().await?;
        self.started = false;
        self.reinitialize_shutdown_token();
        Ok(())
    }

    fn reinitialize_shutdown_token(&mut self) {
        self.shutdown = CancellationToken::new();
        self.fetcher.replace_shutdown_root(self.shutdown.clone());
    }
}
