//! Tracing subscriber setup

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::LoggingConfig;

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter`. Returns false when a
/// subscriber was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

/// Install the global subscriber with the filter from `config`
pub fn init_from_config(config: &LoggingConfig) -> bool {
    init_tracing(&config.filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_tracing("train_core=debug");
        assert!(!init_tracing("train_core=debug"));
        assert!(!init_from_config(&LoggingConfig::default()));
    }
}
