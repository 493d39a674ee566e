use std::time::Duration;

/// Errors raised when a limiter is constructed with parameters it can never
/// honour.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// The refill rate must be a finite number of tokens per second above zero.
    #[error("limit must be finite and greater than zero, got {0}")]
    InvalidLimit(f64),

    /// A refill interval of zero would mean an infinite rate.
    #[error("refill interval must be greater than zero, got {0:?}")]
    ZeroInterval(Duration),
}
