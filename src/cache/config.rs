//! Cache configuration

use std::time::Duration;

/// Configuration for a [`CacheManager`](crate::cache::CacheManager)
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL applied by the default-TTL convenience methods
    pub default_ttl: Duration,
    /// Whether to track hit/miss statistics
    pub enable_metrics: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            enable_metrics: true,
        }
    }
}

impl CacheConfig {
    /// Creates a new configuration builder
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::new()
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.default_ttl.is_zero() {
            return Err("default_ttl must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Builder for [`CacheConfig`]
pub struct CacheConfigBuilder {
    default_ttl: Option<Duration>,
    enable_metrics: Option<bool>,
}

impl CacheConfigBuilder {
    pub fn new() -> Self {
        Self {
            default_ttl: None,
            enable_metrics: None,
        }
    }

    /// Sets the default TTL
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Enables or disables metrics collection
    pub fn enable_metrics(mut self, enabled: bool) -> Self {
        self.enable_metrics = Some(enabled);
        self
    }

    /// Builds the configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();
        CacheConfig {
            default_ttl: self.default_ttl.unwrap_or(defaults.default_ttl),
            enable_metrics: self.enable_metrics.unwrap_or(defaults.enable_metrics),
        }
    }
}

impl Default for CacheConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.default_ttl, Duration::from_secs(3600));
        assert!(config.enable_metrics);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = CacheConfig::builder()
            .default_ttl(Duration::from_secs(300))
            .enable_metrics(false)
            .build();

        assert_eq!(config.default_ttl, Duration::from_secs(300));
        assert!(!config.enable_metrics);
    }

    #[test]
    fn test_validation_rejects_zero_ttl() {
        let config = CacheConfig::builder()
            .default_ttl(Duration::from_secs(0))
            .build();
        assert!(config.validate().is_err());
    }
}
