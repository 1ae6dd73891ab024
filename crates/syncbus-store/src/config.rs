//! Store configuration.

use std::time::Duration;
use syncbus_mom::config::{env_millis, env_parse};
use syncbus_mom::Qos;

/// Configuration shared by every [`crate::SyncStore`] a process opens.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Minimum interval between two outbound update messages.
    pub debounce: Duration,
    /// Delivery level of update messages.
    pub update_qos: Qos,
    /// Pause between two attempts of a retrying mutex operation.
    pub mutex_retry_delay: Duration,
    /// Overrides the dispatcher's response timeout for sync and mutex requests.
    pub request_timeout: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            update_qos: Qos::ExactlyOnce,
            mutex_retry_delay: Duration::from_millis(50),
            request_timeout: None,
        }
    }
}

impl StoreConfig {
    /// Defaults overridden by `SYNCBUS_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(debounce) = env_millis("SYNCBUS_DEBOUNCE_MS") {
            config.debounce = debounce;
        }
        if let Some(qos) = env_parse::<u8>("SYNCBUS_UPDATE_QOS") {
            config.update_qos = match qos {
                0 => Qos::AtMostOnce,
                1 => Qos::AtLeastOnce,
                _ => Qos::ExactlyOnce,
            };
        }
        if let Some(delay) = env_millis("SYNCBUS_MUTEX_RETRY_MS") {
            config.mutex_retry_delay = delay;
        }
        if let Some(timeout) = env_millis("SYNCBUS_REQUEST_TIMEOUT_MS") {
            config.request_timeout = Some(timeout);
        }
        config
    }
}

pub struct StoreConfigBuilder {
    config: StoreConfig,
}

impl Default for StoreConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: StoreConfig::default(),
        }
    }

    pub fn debounce(mut self, window: Duration) -> Self {
        self.config.debounce = window;
        self
    }

    pub fn update_qos(mut self, qos: Qos) -> Self {
        self.config.update_qos = qos;
        self
    }

    pub fn mutex_retry_delay(mut self, delay: Duration) -> Self {
        self.config.mutex_retry_delay = delay;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> StoreConfig {
        self.config
    }
}
