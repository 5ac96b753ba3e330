use std::time::Duration;

/// Default interval between readiness probes.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(25);

/// Default delay between a peer's lock release and declaring the channel lost.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Tunables shared by every requester and responder built from one
/// [`Services`](crate::Services) value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Interval between readiness probes while a port is pending.
    pub probe_interval: Duration,
    /// Time allowed for a formal close/completion to arrive after the peer's
    /// liveness lock was released.
    pub grace_period: Duration,
    /// Upper bound on how long one dispatch waits for port readiness.
    /// `None` waits forever; on expiry the envelope is dropped and logged.
    pub readiness_timeout: Option<Duration>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            probe_interval: DEFAULT_PROBE_INTERVAL,
            grace_period: DEFAULT_GRACE_PERIOD,
            readiness_timeout: None,
        }
    }
}

impl ProtocolConfig {
    /// Reject configurations that would spin or never probe.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probe_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("probe_interval"));
        }
        if self.readiness_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::ZeroDuration("readiness_timeout"));
        }
        Ok(())
    }
}

/// Invalid [`ProtocolConfig`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
}
