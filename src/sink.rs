//! Storage boundary. Batches arrive strictly ordered and contiguous by
//! generation index; the sink never observes duplicates or gaps (unless the
//! skip policy is active, in which case holes are announced in the log).

use anyhow::Error as AnyError;
use core::future::Future;
use core::pin::Pin;

pub type SinkFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>>;

/// Enumerates the execution stages of the [`StorageSink`] hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkStage {
    Flush,
    Shutdown,
}

/// Error surfaced by sink hooks. Every instance is considered fatal: the
/// fetcher cannot make progress against storage that rejects ordered batches.
#[derive(Debug)]
pub struct SinkError {
    stage: SinkStage,
    source: AnyError,
}

impl SinkError {
    pub fn new(stage: SinkStage, source: AnyError) -> Self {
        Self { stage, source }
    }

    pub fn stage(&self) -> SinkStage {
        self.stage
    }

    pub fn into_source(self) -> AnyError {
        self.source
    }
}

impl core::fmt::Display for SinkError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?} sink error: {}", self.stage, self.source)
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Trait implemented by downstream consumers of fetched chain data.
pub trait StorageSink: Send + 'static {
    type Item: Send + 'static;

    /// Persists one ordered, contiguous batch. Executed sequentially by the
    /// flush task; may block/apply backpressure, which stalls flushing but
    /// not fetching.
    fn flush<'a>(&'a mut self, batch: Vec<Self::Item>) -> SinkFuture<'a>;

    /// Called once during shutdown to allow graceful cleanup (flush buffers,
    /// close handles, etc.).
    fn shutdown<'a>(&'a mut self) -> SinkFuture<'a>;
}
