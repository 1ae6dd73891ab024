//! Dispatcher configuration.

use crate::{codec, uid};
use std::str::FromStr;
use std::time::Duration;

/// Configuration for a [`crate::Dispatcher`].
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Participant id; also the transport client id.
    pub client_id: String,
    /// Namespace prepended to every topic the dispatcher and its users derive.
    pub topic_prefix: String,
    /// Protocol revision. Messages carrying another revision are dropped.
    pub revision: String,
    /// Payload size in bytes from which bodies are compressed. `None` disables compression.
    pub compression_threshold: Option<usize>,
    /// Largest inbound body, after decompression, in bytes.
    pub max_body_size: usize,
    /// Lower bound of the simulated inbound latency.
    pub min_latency: Duration,
    /// Upper bound of the simulated inbound latency.
    pub max_latency: Duration,
    pub echo_timeout: Duration,
    pub response_timeout: Duration,
    /// How long destroy waits for listeners to detach before dropping them.
    pub listener_detach_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            client_id: uid::slug(),
            topic_prefix: "syncbus/mom".to_string(),
            revision: "1".to_string(),
            compression_threshold: None,
            max_body_size: codec::DEFAULT_MAX_BODY_SIZE,
            min_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
            echo_timeout: Duration::from_millis(15_000),
            response_timeout: Duration::from_millis(30_000),
            listener_detach_timeout: Duration::from_millis(5_000),
        }
    }
}

impl DispatcherConfig {
    /// Defaults overridden by `SYNCBUS_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(client_id) = std::env::var("SYNCBUS_CLIENT_ID") {
            config.client_id = client_id;
        }
        if let Ok(prefix) = std::env::var("SYNCBUS_TOPIC_PREFIX") {
            config.topic_prefix = prefix;
        }
        if let Ok(revision) = std::env::var("SYNCBUS_REVISION") {
            config.revision = revision;
        }
        if let Some(threshold) = env_parse::<i64>("SYNCBUS_COMPRESSION_THRESHOLD") {
            config.compression_threshold = usize::try_from(threshold).ok();
        }
        if let Some(max) = env_parse::<usize>("SYNCBUS_MAX_BODY_SIZE") {
            config.max_body_size = max;
        }
        if let Some(latency) = env_millis("SYNCBUS_MIN_LATENCY_MS") {
            config.min_latency = latency;
        }
        if let Some(latency) = env_millis("SYNCBUS_MAX_LATENCY_MS") {
            config.max_latency = latency;
        }
        if let Some(timeout) = env_millis("SYNCBUS_ECHO_TIMEOUT_MS") {
            config.echo_timeout = timeout;
        }
        if let Some(timeout) = env_millis("SYNCBUS_RESPONSE_TIMEOUT_MS") {
            config.response_timeout = timeout;
        }
        config
    }

    pub fn simulates_latency(&self) -> bool {
        !self.max_latency.is_zero()
    }
}

/// Builder for dispatcher configuration.
pub struct DispatcherConfigBuilder {
    config: DispatcherConfig,
}

impl DispatcherConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: DispatcherConfig::default(),
        }
    }

    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.config.client_id = id.into();
        self
    }

    pub fn topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.topic_prefix = prefix.into();
        self
    }

    pub fn revision(mut self, revision: impl Into<String>) -> Self {
        self.config.revision = revision.into();
        self
    }

    pub fn compression_threshold(mut self, bytes: Option<usize>) -> Self {
        self.config.compression_threshold = bytes;
        self
    }

    pub fn max_body_size(mut self, bytes: usize) -> Self {
        self.config.max_body_size = bytes;
        self
    }

    pub fn latency(mut self, min: Duration, max: Duration) -> Self {
        self.config.min_latency = min;
        self.config.max_latency = max.max(min);
        self
    }

    pub fn echo_timeout(mut self, timeout: Duration) -> Self {
        self.config.echo_timeout = timeout;
        self
    }

    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    pub fn listener_detach_timeout(mut self, timeout: Duration) -> Self {
        self.config.listener_detach_timeout = timeout;
        self
    }

    pub fn build(self) -> DispatcherConfig {
        self.config
    }
}

impl Default for DispatcherConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse an environment variable, logging and ignoring malformed values.
pub fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring malformed environment variable");
            None
        }
    }
}

/// Read a millisecond duration from the environment.
pub fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}
