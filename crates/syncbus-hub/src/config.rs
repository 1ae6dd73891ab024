//! Hub configuration.

use std::time::Duration;
use syncbus_mom::config::{env_millis, env_parse};
use syncbus_store::StoreConfig;

/// Configuration of a [`crate::SyncHub`].
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// How long one election round waits for the leader to answer.
    pub election_timeout: Duration,
    /// First pause before a lost round is repeated. Doubles per round up to
    /// `election_timeout`.
    pub election_backoff: Duration,
    /// Give up after this many rounds. `None` retries forever.
    pub max_election_rounds: Option<usize>,
    /// Period of the background job persisting dirty documents.
    pub persist_interval: Duration,
    /// Configuration of every store the hub opens.
    pub store: StoreConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(2_000),
            election_backoff: Duration::from_millis(100),
            max_election_rounds: None,
            persist_interval: Duration::from_millis(30_000),
            store: StoreConfig::default(),
        }
    }
}

impl HubConfig {
    /// Defaults overridden by `SYNCBUS_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self {
            store: StoreConfig::from_env(),
            ..Self::default()
        };
        if let Some(timeout) = env_millis("SYNCBUS_ELECTION_TIMEOUT_MS") {
            config.election_timeout = timeout;
        }
        if let Some(backoff) = env_millis("SYNCBUS_ELECTION_BACKOFF_MS") {
            config.election_backoff = backoff;
        }
        if let Some(rounds) = env_parse::<usize>("SYNCBUS_MAX_ELECTION_ROUNDS") {
            config.max_election_rounds = Some(rounds);
        }
        if let Some(interval) = env_millis("SYNCBUS_PERSIST_INTERVAL_MS") {
            config.persist_interval = interval;
        }
        config
    }

    /// Pause before election round `round` (1-based) is repeated.
    pub fn backoff(&self, round: usize) -> Duration {
        let exponent = round.saturating_sub(1).min(16) as u32;
        self.election_backoff
            .saturating_mul(1 << exponent)
            .min(self.election_timeout)
    }
}

pub struct HubConfigBuilder {
    config: HubConfig,
}

impl Default for HubConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HubConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: HubConfig::default(),
        }
    }

    pub fn election_timeout(mut self, timeout: Duration) -> Self {
        self.config.election_timeout = timeout;
        self
    }

    pub fn election_backoff(mut self, backoff: Duration) -> Self {
        self.config.election_backoff = backoff;
        self
    }

    pub fn max_election_rounds(mut self, rounds: usize) -> Self {
        self.config.max_election_rounds = Some(rounds);
        self
    }

    pub fn persist_interval(mut self, interval: Duration) -> Self {
        self.config.persist_interval = interval;
        self
    }

    pub fn store(mut self, store: StoreConfig) -> Self {
        self.config.store = store;
        self
    }

    pub fn build(self) -> HubConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HubConfig::default();
        assert_eq!(config.election_timeout, Duration::from_secs(2));
        assert_eq!(config.persist_interval, Duration::from_secs(30));
        assert!(config.max_election_rounds.is_none());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = HubConfigBuilder::new()
            .election_timeout(Duration::from_millis(500))
            .election_backoff(Duration::from_millis(100))
            .build();
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(400));
        assert_eq!(config.backoff(4), Duration::from_millis(500));
        assert_eq!(config.backoff(100), Duration::from_millis(500));
    }

    #[test]
    fn test_builder_overrides() {
        let config = HubConfigBuilder::new()
            .max_election_rounds(3)
            .persist_interval(Duration::from_secs(1))
            .build();
        assert_eq!(config.max_election_rounds, Some(3));
        assert_eq!(config.persist_interval, Duration::from_secs(1));
    }
}
