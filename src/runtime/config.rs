use crate::runtime::telemetry;
use anyhow::{bail, Result};
use std::time::Duration;

const DEFAULT_MAX_PER_REQUEST: usize = 128;
const DEFAULT_MAX_IN_FLIGHT: usize = 16;
const DEFAULT_RETRY_CEILING: u32 = 3;
const DEFAULT_PEER_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_BAN_COOLDOWN_SECS: u64 = 60;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 8;
const DEFAULT_STALL_BACKOFF_INITIAL_MS: u64 = 250;
const DEFAULT_STALL_BACKOFF_MAX_SECS: u64 = 5;

/// What to do when a task exhausts its retry ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Abort the whole fetch and surface the error to the caller.
    Abort,
    /// Mark the task permanently missing and keep going. Requires a sink
    /// that tolerates holes in the delivered range.
    Skip,
}

/// Runtime configuration for the sync fetcher.
///
/// All instances must be constructed via [`FetcherConfig::builder`] or
/// [`FetcherConfig::new`] so invariants are validated before any consumer
/// observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetcherConfig {
    max_per_request: usize,
    max_in_flight: usize,
    retry_ceiling: u32,
    peer_failure_threshold: u32,
    ban_cooldown: Duration,
    request_timeout: Duration,
    destroy_when_done: bool,
    failure_policy: FailurePolicy,
    stall_backoff_initial: Duration,
    stall_backoff_max: Duration,
    metrics_interval: Duration,
}

pub struct FetcherConfigParams {
    pub max_per_request: usize,
    pub max_in_flight: usize,
    pub retry_ceiling: u32,
    pub peer_failure_threshold: u32,
    pub ban_cooldown: Duration,
    pub request_timeout: Duration,
    pub destroy_when_done: bool,
    pub failure_policy: FailurePolicy,
    pub stall_backoff_initial: Duration,
    pub stall_backoff_max: Duration,
    pub metrics_interval: Duration,
}

impl FetcherConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> FetcherConfigBuilder {
        FetcherConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    ///
    /// Prefer [`FetcherConfig::builder`] when many values use defaults.
    pub fn new(params: FetcherConfigParams) -> Result<Self> {
        let FetcherConfigParams {
            max_per_request,
            max_in_flight,
            retry_ceiling,
            peer_failure_threshold,
            ban_cooldown,
            request_timeout,
            destroy_when_done,
            failure_policy,
            stall_backoff_initial,
            stall_backoff_max,
            metrics_interval,
        } = params;

        let config = Self {
            max_per_request,
            max_in_flight,
            retry_ceiling,
            peer_failure_threshold,
            ban_cooldown,
            request_timeout,
            destroy_when_done,
            failure_policy,
            stall_backoff_initial,
            stall_backoff_max,
            metrics_interval,
        };

        config.validate()?;
        Ok(config)
    }

    /// Maximum items a single task may cover.
    pub fn max_per_request(&self) -> usize {
        self.max_per_request
    }

    /// Maximum simultaneous in-flight jobs.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Attempts allowed per task before it fails permanently.
    pub fn retry_ceiling(&self) -> u32 {
        self.retry_ceiling
    }

    /// Consecutive failures after which a peer is banned.
    pub fn peer_failure_threshold(&self) -> u32 {
        self.peer_failure_threshold
    }

    /// How long a banned peer is excluded from assignment.
    pub fn ban_cooldown(&self) -> Duration {
        self.ban_cooldown
    }

    /// Per-job timeout applied to each peer request.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Whether the engine terminates once all tasks are resolved.
    pub fn destroy_when_done(&self) -> bool {
        self.destroy_when_done
    }

    /// Policy applied when a task exhausts its retry ceiling.
    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Initial backoff used when no eligible peers are available.
    pub fn stall_backoff_initial(&self) -> Duration {
        self.stall_backoff_initial
    }

    /// Ceiling for the peer-exhaustion backoff.
    pub fn stall_backoff_max(&self) -> Duration {
        self.stall_backoff_max
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        if self.max_per_request == 0 {
            bail!("max_per_request must be greater than 0");
        }

        if self.max_in_flight == 0 {
            bail!("max_in_flight must be greater than 0");
        }

        if self.retry_ceiling == 0 {
            bail!("retry_ceiling must be greater than 0");
        }

        if self.peer_failure_threshold == 0 {
            bail!("peer_failure_threshold must be greater than 0");
        }

        if self.ban_cooldown.is_zero() {
            bail!("ban_cooldown must be greater than 0");
        }

        if self.request_timeout.is_zero() {
            bail!("request_timeout must be greater than 0");
        }

        if self.stall_backoff_initial.is_zero() {
            bail!("stall_backoff_initial must be greater than 0");
        }

        if self.stall_backoff_max < self.stall_backoff_initial {
            bail!("stall_backoff_max must be at least stall_backoff_initial");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        Ok(())
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_per_request: DEFAULT_MAX_PER_REQUEST,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            retry_ceiling: DEFAULT_RETRY_CEILING,
            peer_failure_threshold: DEFAULT_PEER_FAILURE_THRESHOLD,
            ban_cooldown: Duration::from_secs(DEFAULT_BAN_COOLDOWN_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            destroy_when_done: true,
            failure_policy: FailurePolicy::Abort,
            stall_backoff_initial: Duration::from_millis(DEFAULT_STALL_BACKOFF_INITIAL_MS),
            stall_backoff_max: Duration::from_secs(DEFAULT_STALL_BACKOFF_MAX_SECS),
            metrics_interval: telemetry::DEFAULT_METRICS_INTERVAL,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct FetcherConfigBuilder {
    max_per_request: Option<usize>,
    max_in_flight: Option<usize>,
    retry_ceiling: Option<u32>,
    peer_failure_threshold: Option<u32>,
    ban_cooldown: Option<Duration>,
    request_timeout: Option<Duration>,
    destroy_when_done: Option<bool>,
    failure_policy: Option<FailurePolicy>,
    stall_backoff_initial: Option<Duration>,
    stall_backoff_max: Option<Duration>,
    metrics_interval: Option<Duration>,
}

impl FetcherConfigBuilder {
    pub fn max_per_request(mut self, max: usize) -> Self {
        self.max_per_request = Some(max);
        self
    }

    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = Some(max);
        self
    }

    pub fn retry_ceiling(mut self, ceiling: u32) -> Self {
        self.retry_ceiling = Some(ceiling);
        self
    }

    pub fn peer_failure_threshold(mut self, threshold: u32) -> Self {
        self.peer_failure_threshold = Some(threshold);
        self
    }

    pub fn ban_cooldown(mut self, cooldown: Duration) -> Self {
        self.ban_cooldown = Some(cooldown);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn destroy_when_done(mut self, destroy: bool) -> Self {
        self.destroy_when_done = Some(destroy);
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = Some(policy);
        self
    }

    pub fn stall_backoff_initial(mut self, backoff: Duration) -> Self {
        self.stall_backoff_initial = Some(backoff);
        self
    }

    pub fn stall_backoff_max(mut self, backoff: Duration) -> Self {
        self.stall_backoff_max = Some(backoff);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<FetcherConfig> {
        let defaults = FetcherConfig::default();
        let params = FetcherConfigParams {
            max_per_request: self.max_per_request.unwrap_or(defaults.max_per_request),
            max_in_flight: self.max_in_flight.unwrap_or(defaults.max_in_flight),
            retry_ceiling: self.retry_ceiling.unwrap_or(defaults.retry_ceiling),
            peer_failure_threshold: self
                .peer_failure_threshold
                .unwrap_or(defaults.peer_failure_threshold),
            ban_cooldown: self.ban_cooldown.unwrap_or(defaults.ban_cooldown),
            request_timeout: self.request_timeout.unwrap_or(defaults.request_timeout),
            destroy_when_done: self.destroy_when_done.unwrap_or(defaults.destroy_when_done),
            failure_policy: self.failure_policy.unwrap_or(defaults.failure_policy),
            stall_backoff_initial: self
                .stall_backoff_initial
                .unwrap_or(defaults.stall_backoff_initial),
            stall_backoff_max: self.stall_backoff_max.unwrap_or(defaults.stall_backoff_max),
            metrics_interval: self.metrics_interval.unwrap_or(defaults.metrics_interval),
        };

        FetcherConfig::new(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_produce_valid_config() {
        let config = FetcherConfig::builder().build().unwrap();
        assert_eq!(config.max_per_request(), DEFAULT_MAX_PER_REQUEST);
        assert_eq!(config.max_in_flight(), DEFAULT_MAX_IN_FLIGHT);
        assert_eq!(config.retry_ceiling(), DEFAULT_RETRY_CEILING);
        assert!(config.destroy_when_done());
        assert_eq!(config.failure_policy(), FailurePolicy::Abort);
        assert_eq!(
            config.request_timeout(),
            Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)
        );
        assert_eq!(config.metrics_interval(), telemetry::DEFAULT_METRICS_INTERVAL);
    }

    #[test]
    fn overrides_are_applied() {
        let config = FetcherConfig::builder()
            .max_per_request(64)
            .max_in_flight(4)
            .retry_ceiling(2)
            .ban_cooldown(Duration::from_secs(10))
            .failure_policy(FailurePolicy::Skip)
            .destroy_when_done(false)
            .build()
            .expect("config should build");
        assert_eq!(config.max_per_request(), 64);
        assert_eq!(config.max_in_flight(), 4);
        assert_eq!(config.retry_ceiling(), 2);
        assert_eq!(config.ban_cooldown(), Duration::from_secs(10));
        assert_eq!(config.failure_policy(), FailurePolicy::Skip);
        assert!(!config.destroy_when_done());
    }

    #[test]
    fn validation_catches_invalid_values() {
        let err = FetcherConfig::builder()
            .max_per_request(0)
            .build()
            .unwrap_err();
        assert!(
            format!("{err}").contains("max_per_request"),
            "error should mention max_per_request"
        );

        let err = FetcherConfig::builder().max_in_flight(0).build().unwrap_err();
        assert!(
            format!("{err}").contains("max_in_flight"),
            "error should mention max_in_flight"
        );

        let err = FetcherConfig::builder().retry_ceiling(0).build().unwrap_err();
        assert!(
            format!("{err}").contains("retry_ceiling"),
            "error should mention retry_ceiling"
        );

        let err = FetcherConfig::builder()
            .request_timeout(Duration::from_secs(0))
            .build()
            .unwrap_err();
        assert!(
            format!("{err}").contains("request_timeout"),
            "error should mention request_timeout"
        );

        let err = FetcherConfig::builder()
            .ban_cooldown(Duration::from_secs(0))
            .build()
            .unwrap_err();
        assert!(
            format!("{err}").contains("ban_cooldown"),
            "error should mention ban_cooldown"
        );

        let err = FetcherConfig::builder()
            .stall_backoff_initial(Duration::from_secs(10))
            .stall_backoff_max(Duration::from_secs(1))
            .build()
            .unwrap_err();
        assert!(
            format!("{err}").contains("stall_backoff_max"),
            "error should mention stall_backoff_max"
        );
    }

    #[test]
    fn direct_constructor_runs_validation() {
        let defaults = FetcherConfig::default();
        let err = FetcherConfig::new(FetcherConfigParams {
            max_per_request: defaults.max_per_request(),
            max_in_flight: 0,
            retry_ceiling: defaults.retry_ceiling(),
            peer_failure_threshold: defaults.peer_failure_threshold(),
            ban_cooldown: defaults.ban_cooldown(),
            request_timeout: defaults.request_timeout(),
            destroy_when_done: true,
            failure_policy: FailurePolicy::Abort,
            stall_backoff_initial: defaults.stall_backoff_initial(),
            stall_backoff_max: defaults.stall_backoff_max(),
            metrics_interval: defaults.metrics_interval(),
        })
        .unwrap_err();

        assert!(
            format!("{err}").contains("max_in_flight"),
            "error should mention invalid max_in_flight"
        );
    }
}
