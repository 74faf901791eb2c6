//! Runtime configuration read from the process environment.
//!
//! Keys use the `CHAT_STREAM` prefix with `__` between nesting levels, for
//! example `CHAT_STREAM__MODEL__DEFAULT_MODEL=glm-4-flash` or
//! `CHAT_STREAM__STORE__DATABASE_URL=sqlite://chat.db`. A `.env` file in the
//! working directory is honoured. Unset keys fall back to defaults, so an
//! empty environment is a valid configuration.
//!
//! ```no_run
//! use chat_stream::config::AppConfig;
//!
//! let config = AppConfig::from_env()?;
//! println!("posting to {}", config.model.completions_url());
//! # Ok::<(), chat_stream::config::ConfigError>(())
//! ```

mod error;
mod logging;
mod model;
mod store;

pub use error::{ConfigError, ValidationError};
pub use logging::LoggingConfig;
pub use model::ModelConfig;
pub use store::StoreConfig;

use serde::Deserialize;

const ENV_PREFIX: &str = "CHAT_STREAM";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Reads and validates in one step.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::load()?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the environment without checking value ranges.
    pub fn load() -> Result<Self, ConfigError> {
        // A missing .env is the normal case outside development.
        let _ = dotenvy::dotenv();

        let source = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true);

        let loaded = config::Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.model.validate()?;
        self.store.validate()
    }
}
