//! Error types for fastlimiter.

use std::time::Duration;

use thiserror::Error;

/// Main error type for limiter operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// A limiter parameter violated its constraint. Nothing was changed.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Produced only when a host converts a denial into an error.
    #[error("Rate limit exceeded. Try again in {:.2} seconds.", .wait.as_secs_f64())]
    RateLimited { wait: Duration },

    /// Configuration source errors (file, environment, YAML)
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for LimiterError {
    fn from(err: ::config::ConfigError) -> Self {
        LimiterError::Config(err.to_string())
    }
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_message_carries_wait() {
        let err = LimiterError::RateLimited {
            wait: Duration::from_millis(5500),
        };
        assert_eq!(err.to_string(), "Rate limit exceeded. Try again in 5.50 seconds.");
    }
}
