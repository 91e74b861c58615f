pub mod fetcher;
pub mod peers;
pub mod runtime;
pub mod sink;
pub mod transport;

pub use fetcher::blocks::{BlockFetcher, BlockItem, RangeCheckedTransport};
pub use fetcher::job::JobTask;
pub use fetcher::{FetchSummary, Fetcher};
pub use peers::pool::{PeerId, PeerPool, PeerRef};
pub use peers::reputation::PeerReputationDump;
pub use runtime::config::{
    FailurePolicy, FetcherConfig, FetcherConfigBuilder, FetcherConfigParams,
};
pub use runtime::runner::Runner;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use sink::{SinkError, SinkFuture, SinkStage, StorageSink};
pub use transport::{PeerTransport, TransportError, TransportFuture};
