//! Error types for the Aegis anomaly detection engine.

use thiserror::Error;

/// Result type alias for detection engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for detection engine operations
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid configuration error
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Feature not supported
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Model/threshold persistence error
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Numerical model error
    #[error("Model error: {0}")]
    Model(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration source error
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// Metrics registry error
    #[cfg(feature = "prometheus")]
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// 起動時に即座に失敗させるべき設定エラーかどうか
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::InvalidConfiguration(_)
                | Error::NotSupported(_)
                | Error::ConfigSource(_)
        )
    }
}
