//! Proxy configuration with builder methods

use std::path::Path;
use std::time::Duration;
use serde::{Deserialize, Serialize};

const MAX_MULTIPLIER: f64 = 16.0;

/// Retry schedule for services that fail to reconcile
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(rename = "initial_ms", with = "millis")]
    pub initial: Duration,
    #[serde(rename = "max_ms", with = "millis")]
    pub max: Duration,
    pub multiplier: f64,
    /// Each delay is scaled by a random factor in `1 ± jitter` so that keys
    /// failing together do not retry in lockstep
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// HNS network the service endpoints live on
    pub network_name: String,
    /// Deadline for every individual HNS call
    #[serde(rename = "call_timeout_ms", with = "millis")]
    pub call_timeout: Duration,
    pub backoff: BackoffConfig,
    /// Lock shards in the resource cache
    pub cache_shards: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            network_name: String::new(),
            call_timeout: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
            cache_shards: 16,
        }
    }
}

impl ProxyConfig {
    pub fn new(network_name: impl Into<String>) -> Self {
        Self {
            network_name: network_name.into(),
            ..Self::default()
        }
    }

    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff.initial = initial;
        self.backoff.max = max;
        self
    }

    pub fn cache_shards(mut self, shards: usize) -> Self {
        self.cache_shards = shards;
        self
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.network_name.trim().is_empty() {
            return Err(crate::Error::Config("network_name cannot be empty".into()));
        }
        if self.call_timeout.is_zero() {
            return Err(crate::Error::Config("call_timeout must be positive".into()));
        }
        if self.backoff.initial.is_zero() || self.backoff.max < self.backoff.initial {
            return Err(crate::Error::Config(
                "backoff must satisfy 0 < initial <= max".into(),
            ));
        }
        if !(1.0..=MAX_MULTIPLIER).contains(&self.backoff.multiplier) {
            return Err(crate::Error::Config(format!(
                "backoff multiplier must be between 1 and {}",
                MAX_MULTIPLIER
            )));
        }
        if !(0.0..1.0).contains(&self.backoff.jitter) {
            return Err(crate::Error::Config("backoff jitter must be in [0, 1)".into()));
        }
        if self.cache_shards == 0 {
            return Err(crate::Error::Config("cache_shards must be at least 1".into()));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
