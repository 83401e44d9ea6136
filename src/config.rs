use std::time::Duration;

/// Indicates an error within the i/o system configuration.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// The buffer size limit is zero.
    #[error("Buffer size limit must be greater than zero")]
    BufferSizeLimitZero,

    /// The abort poll interval is zero.
    #[error("Abort poll interval must be greater than zero")]
    AbortPollIntervalZero,

    /// No request slots are reserved.
    #[error("Request reserve must be greater than zero")]
    RequestReserveZero,
}

/// Additional configuration for an [`IoSystem`](crate::iosystem::IoSystem).
#[derive(Debug, Clone)]
pub struct IoSystemConfig {
    /// The byte budget for buffered data.
    ///
    /// Both the write aggregator and the backend's pending nonblocking
    /// requests are flushed once the largest usage across the group exceeds
    /// this value.
    ///
    /// The default is 10 MiB.
    pub buffer_size_limit: u64,

    /// How often a blocked receive checks whether the group was aborted.
    ///
    /// The default is 50 milliseconds.
    pub abort_poll_interval: Duration,

    /// The number of request handles reserved per variable before the
    /// first nonblocking write.
    ///
    /// The default is 16.
    pub request_reserve: usize,
}

impl IoSystemConfig {
    /// Validates the configuration.
    ///
    /// See [`IoSystemConfig`] and [`ConfigError`] for details.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size_limit == 0 {
            return Err(ConfigError::BufferSizeLimitZero);
        }

        if self.abort_poll_interval.is_zero() {
            return Err(ConfigError::AbortPollIntervalZero);
        }

        if self.request_reserve == 0 {
            return Err(ConfigError::RequestReserveZero);
        }

        Ok(())
    }

    pub fn with_buffer_size_limit(mut self, limit: u64) -> Self {
        if limit > 0 {
            self.buffer_size_limit = limit;
        }
        self
    }
}

impl Default for IoSystemConfig {
    fn default() -> Self {
        Self {
            buffer_size_limit: 10 * 1024 * 1024,
            abort_poll_interval: Duration::from_millis(50),
            request_reserve: 16,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(IoSystemConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_zero_values() {
        let config = IoSystemConfig {
            buffer_size_limit: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::BufferSizeLimitZero));

        let config = IoSystemConfig {
            abort_poll_interval: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::AbortPollIntervalZero));

        let config = IoSystemConfig {
            request_reserve: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::RequestReserveZero));
    }

    #[test]
    fn zero_limit_is_ignored() {
        let config = IoSystemConfig::default().with_buffer_size_limit(0);
        assert_eq!(config.buffer_size_limit, 10 * 1024 * 1024);
        let config = config.with_buffer_size_limit(64);
        assert_eq!(config.buffer_size_limit, 64);
    }
}
