//! Installs the global `tracing` subscriber.

use crate::api::error::FlowError;
use crate::core::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber. `RUST_LOG` takes precedence over the configured
/// filter. Fails if a global subscriber is already set.
pub fn init(config: &LoggingConfig) -> Result<(), FlowError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| FlowError::Configuration(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi)
        .with_target(false)
        .try_init()
        .map_err(|e| FlowError::Configuration(format!("Failed to install logger: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_fails_without_panicking() {
        let config = LoggingConfig {
            filter: "warn".to_string(),
            ansi: false,
        };
        let _ = init(&config);
        assert!(matches!(init(&config), Err(FlowError::Configuration(_))));
    }
}
