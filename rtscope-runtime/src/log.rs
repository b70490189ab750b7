//! Logging setup.
//!
//! The runtime emits structured events through `tracing`. This module only
//! installs a subscriber; embedding applications that already have one keep
//! theirs.

use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogLevel};

impl LogLevel {
    /// The matching `tracing` level, or `None` for [`LogLevel::Off`].
    pub fn to_tracing(self) -> Option<Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

/// Build the filter for a configuration.
///
/// `RUST_LOG` wins when set; otherwise the configured level applies.
pub fn filter_for(config: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.as_str()))
}

/// Install a `fmt` subscriber for the configuration.
///
/// Returns `false` when a global subscriber was already installed.
pub fn init(config: &LogConfig) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter_for(config))
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        .with_thread_names(true);

    let installed = if config.timestamps {
        builder.try_init()
    } else {
        builder.without_time().try_init()
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(LogLevel::Off.to_tracing(), None);
        assert_eq!(LogLevel::Warn.to_tracing(), Some(Level::WARN));
        assert_eq!(LogLevel::Trace.to_tracing(), Some(Level::TRACE));
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LogConfig {
            level: LogLevel::Error,
            ..LogConfig::default()
        };
        init(&config);
        // A second install finds the first one in place.
        assert!(!init(&config));
    }
}
