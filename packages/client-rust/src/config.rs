//! Connector configuration.

use std::time::Duration;

use crate::breaker::BreakerConfig;

/// Tuning knobs for a [`crate::ClientConnector`].
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Maximum reconnection attempts per `reconnect()` call.
    pub reconnect_attempts: u32,
    /// Base delay for exponential reconnect backoff (doubles per attempt).
    pub backoff_base: Duration,
    /// Upper bound on the backoff delay.
    pub backoff_cap: Duration,
    /// Maximum random jitter added to each delay, as a fraction of it.
    pub backoff_jitter: f64,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    /// Circuit breaker settings.
    pub breaker: BreakerConfig,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            backoff_jitter: 0.1,
            request_timeout: Duration::from_secs(10),
            breaker: BreakerConfig::default(),
        }
    }
}
