//! Configuration for the reactor and its worker pool

use std::time::Duration;

use crate::error::{ReactorError, Result};

/// Configuration for [`ChannelManager`](crate::ChannelManager) and
/// [`TokioScheduler`](crate::TokioScheduler).
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Size of the buffer used for a single read
    /// Default: 1024 bytes
    pub read_buffer_size: usize,

    /// Upper bound on one poll wait. `None` blocks until a readiness event
    /// or a wakeup arrives.
    /// Default: None
    pub poll_timeout: Option<Duration>,

    /// Readiness events processed per poll
    /// Default: 128
    pub event_capacity: usize,

    /// Threads driving timers and dispatched callbacks
    /// Default: 2
    pub worker_threads: usize,

    /// Name given to the poll thread
    /// Default: "ipremote-reactor"
    pub thread_name: String,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 1024,
            poll_timeout: None,
            event_capacity: 128,
            worker_threads: 2,
            thread_name: "ipremote-reactor".to_string(),
        }
    }
}

impl ReactorConfig {
    /// Create a new ReactorConfig with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the poll thread at least every `timeout` even when idle
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    /// Use `threads` workers for dispatch and timers
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 {
            return Err(ReactorError::Configuration(
                "read_buffer_size must be greater than 0".to_string(),
            ));
        }

        if self.event_capacity == 0 {
            return Err(ReactorError::Configuration(
                "event_capacity must be greater than 0".to_string(),
            ));
        }

        if self.worker_threads == 0 {
            return Err(ReactorError::Configuration(
                "worker_threads must be greater than 0".to_string(),
            ));
        }

        if self.thread_name.is_empty() {
            return Err(ReactorError::Configuration(
                "thread_name must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ReactorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.read_buffer_size, 1024);
        assert!(config.poll_timeout.is_none());
    }

    #[test]
    fn test_zero_read_buffer_rejected() {
        let config = ReactorConfig {
            read_buffer_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ReactorError::Configuration(_))
        ));
    }

    #[test]
    fn test_builders() {
        let config = ReactorConfig::new()
            .with_poll_timeout(Duration::from_millis(250))
            .with_worker_threads(4);
        assert_eq!(config.poll_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.worker_threads, 4);

        let config = config.with_worker_threads(0);
        assert!(config.validate().is_err());
    }
}
