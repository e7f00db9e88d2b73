//! Configuration types for devices

use std::time::Duration;

use crate::command_channel::Retry;
use crate::error::{DeviceError, Result};

/// Configuration for a [`Device`](crate::Device)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// How long a TCP connect may take before the channel is failed
    /// Default: 5 seconds
    pub connect_timeout: Duration,

    /// Retry policy for commands written without an explicit one
    /// Default: Retry::Never
    pub default_retry: Retry,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            default_retry: Retry::Never,
        }
    }
}

impl DeviceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_default_retry(mut self, retry: Retry) -> Self {
        self.default_retry = retry;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() {
            return Err(DeviceError::Configuration(
                "connect_timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DeviceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.default_retry, Retry::Never);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = DeviceConfig::new().with_connect_timeout(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(DeviceError::Configuration(_))
        ));
    }
}
