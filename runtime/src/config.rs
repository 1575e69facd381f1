//! Client configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default time an unobserved key is kept before disposal.
pub const DEFAULT_MAX_AGE_MS: u64 = 30_000;

/// Inactivity garbage collection settings.
///
/// Deserializable so applications can embed it in their own config files:
///
/// ```
/// use composable_query_runtime::config::GcConfig;
///
/// let gc: GcConfig = serde_json::from_str(r#"{ "max_age_ms": 5000 }"#).unwrap();
/// assert_eq!(gc.max_age().as_secs(), 5);
///
/// let gc: GcConfig = serde_json::from_str("{}").unwrap();
/// assert_eq!(gc.max_age().as_secs(), 30);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Milliseconds a key may stay unobserved before it is disposed
    pub max_age_ms: u64,
}

impl GcConfig {
    /// Create a GC configuration.
    #[must_use]
    pub const fn new(max_age_ms: u64) -> Self {
        Self { max_age_ms }
    }

    /// The configured max age.
    #[must_use]
    pub const fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            max_age_ms: DEFAULT_MAX_AGE_MS,
        }
    }
}

/// Configuration for [`Client`](crate::Client) instances.
///
/// # Example
///
/// ```
/// use composable_query_runtime::config::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::default().with_max_age(Duration::from_secs(5));
/// assert_eq!(config.gc.max_age(), Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Inactivity GC settings
    pub gc: GcConfig,
}

impl ClientConfig {
    /// Create a configuration with the given GC settings.
    #[must_use]
    pub const fn new(gc: GcConfig) -> Self {
        Self { gc }
    }

    /// Set the GC settings
    #[must_use]
    pub const fn with_gc(mut self, gc: GcConfig) -> Self {
        self.gc = gc;
        self
    }

    /// Set the inactivity max age
    ///
    /// Durations beyond `u64::MAX` milliseconds saturate.
    #[must_use]
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.gc.max_age_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_max_age_is_thirty_seconds() {
        assert_eq!(ClientConfig::default().gc.max_age(), Duration::from_secs(30));
    }

    #[test]
    fn builders_override_gc() {
        let config = ClientConfig::default().with_gc(GcConfig::new(10));
        assert_eq!(config.gc.max_age(), Duration::from_millis(10));

        let config = config.with_max_age(Duration::from_secs(2));
        assert_eq!(config.gc.max_age_ms, 2_000);
    }

    #[test]
    fn client_config_deserializes_nested_gc() {
        let config: ClientConfig = serde_json::from_str(r#"{ "gc": { "max_age_ms": 250 } }"#).unwrap();
        assert_eq!(config.gc.max_age(), Duration::from_millis(250));
    }
}
