//! Error types shared across the workspace.

use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The timer tick must be a positive number of seconds.
    #[error("timer tick must be positive, got {0}")]
    InvalidTick(f64),

    /// The flow timeout must be at least one tick.
    #[error("flow timeout must be at least one tick")]
    InvalidTimeout,

    /// A destination rewrite entry maps a port to an unusable address.
    #[error("destination rewrite for port {0} must not be 0.0.0.0")]
    InvalidRewrite(u16),
}
