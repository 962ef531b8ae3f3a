use thiserror::Error;

/// Typed error hierarchy for fanout.
///
/// Use at the outer boundaries (CLI entry points, pipeline startup).
/// Internal/leaf functions can continue using `anyhow::Result` — the
/// `Internal` variant allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using FanoutError.
pub type FanoutResult<T> = std::result::Result<T, FanoutError>;
