use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("configuration rejected: {0}")]
    Invalid(#[from] ValidationError),
}

/// A loaded value that the engine refuses to run with.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} must be set")]
    MissingRequired(&'static str),

    #[error("model base URL needs an http:// or https:// scheme")]
    InvalidBaseUrl,

    #[error("temperature outside 0.0..=2.0")]
    InvalidTemperature,

    #[error("top_p outside (0.0, 1.0]")]
    InvalidTopP,

    #[error("timeouts must be at least one second")]
    InvalidTimeout,

    #[error("event buffer must be non-empty")]
    InvalidEventBuffer,

    #[error("database URL is not a sqlite: URL")]
    InvalidDatabaseUrl,

    #[error("store pool needs one or more connections")]
    InvalidPoolSize,
}
