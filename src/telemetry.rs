//! Tracing subscriber bootstrap.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Installs the global fmt subscriber.
///
/// `RUST_LOG` wins over the configured filter; an unparsable filter falls
/// back to `info`. Returns false if a global subscriber was already set,
/// which makes repeated calls harmless.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let filter = build_filter(config);
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if config.json {
        subscriber.json().try_init().is_ok()
    } else {
        subscriber.try_init().is_ok()
    };

    if installed {
        tracing::debug!(json = config.json, "Tracing initialised");
    }
    installed
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => match config.filter.parse::<EnvFilter>() {
            Ok(filter) => filter,
            Err(e) => {
                eprintln!(
                    "WARN: log filter '{}' is invalid ({}); falling back to 'info'",
                    config.filter, e
                );
                EnvFilter::new("info")
            }
        },
    }
}
