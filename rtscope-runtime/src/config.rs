//! Runtime Configuration
//!
//! Configuration for the region allocator, the interrupt machinery and
//! logging. Values can be set programmatically or loaded from environment
//! variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `RTSCOPE_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `RTSCOPE_GLOBAL_POOL_SIZE` | Global backing-store budget in bytes | 67108864 (64MB) |
//! | `RTSCOPE_MAX_REGION_SIZE` | Largest object area or backing size in bytes | 16777216 (16MB) |
//! | `RTSCOPE_JOIN_TIMEOUT_MS` | Default `join*` timeout in milliseconds (0 = none) | 0 |
//! | `RTSCOPE_TIMER_QUEUE` | Timer command channel capacity | 8 |
//! | `RTSCOPE_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//!
//! # Example
//!
//! ```rust,ignore
//! use rtscope_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::builder()
//!     .global_pool_size(8 * 1024 * 1024)
//!     .join_timeout(Some(Duration::from_millis(250)))
//!     .build()?;
//! rtscope_runtime::init(config)?;
//! ```

use std::env;
use std::time::Duration;

use thiserror::Error;

/// Smallest accepted pool or region limit.
const MIN_SIZE: usize = 4096;

/// Log level for runtime logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Memory configuration.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Budget of the process-wide pool root stores are reserved from.
    /// Default: 64MB.
    pub global_pool_size: usize,

    /// Largest object area or backing store a single region may request.
    /// Default: 16MB.
    pub max_region_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            global_pool_size: crate::backing::DEFAULT_POOL_SIZE,
            max_region_size: 16 * 1024 * 1024, // 16 MB
        }
    }
}

/// Interrupt and wait configuration.
#[derive(Debug, Clone)]
pub struct InterruptConfig {
    /// Timeout applied by `join*` when the caller passes none.
    /// None means wait indefinitely (default).
    pub join_timeout: Option<Duration>,

    /// Capacity of each timed interrupt's command channel.
    /// Default: 8.
    pub timer_queue: usize,
}

impl Default for InterruptConfig {
    fn default() -> Self {
        Self {
            join_timeout: None,
            timer_queue: 8,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level.
    /// Default: Info.
    pub level: LogLevel,

    /// Include timestamps in log output.
    /// Default: true.
    pub timestamps: bool,

    /// Include source location in log output.
    /// Default: false (only in debug builds).
    pub source_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            timestamps: true,
            source_location: cfg!(debug_assertions),
        }
    }
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for sensible defaults, or
/// `RuntimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Memory configuration.
    pub memory: MemoryConfig,

    /// Interrupt configuration.
    pub interrupt: InterruptConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are unset or fail to parse keep their default values.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("RTSCOPE_GLOBAL_POOL_SIZE") {
            if val >= MIN_SIZE {
                config.memory.global_pool_size = val;
            }
        }

        if let Some(val) = parse_env_usize("RTSCOPE_MAX_REGION_SIZE") {
            if val >= MIN_SIZE {
                config.memory.max_region_size = val;
            }
        }

        if let Some(val) = parse_env_usize("RTSCOPE_JOIN_TIMEOUT_MS") {
            config.interrupt.join_timeout = if val > 0 {
                Some(Duration::from_millis(val as u64))
            } else {
                None
            };
        }

        if let Some(val) = parse_env_usize("RTSCOPE_TIMER_QUEUE") {
            if val > 0 {
                config.interrupt.timer_queue = val;
            }
        }

        if let Ok(val) = env::var("RTSCOPE_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&val) {
                config.log.level = level;
            }
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory.global_pool_size < MIN_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "memory.global_pool_size".into(),
                message: format!("must be at least {} bytes", MIN_SIZE),
            });
        }

        if self.memory.max_region_size < MIN_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "memory.max_region_size".into(),
                message: format!("must be at least {} bytes", MIN_SIZE),
            });
        }

        if self.interrupt.timer_queue == 0 {
            return Err(ConfigError::InvalidValue {
                field: "interrupt.timer_queue".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.interrupt.join_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidValue {
                field: "interrupt.join_timeout".into(),
                message: "use None for no timeout".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
    /// The runtime was already initialized with a configuration.
    #[error("runtime already initialized")]
    AlreadyInitialized,
}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the global pool budget in bytes.
    pub fn global_pool_size(mut self, size: usize) -> Self {
        self.config.memory.global_pool_size = size;
        self
    }

    /// Set the maximum region size in bytes.
    pub fn max_region_size(mut self, size: usize) -> Self {
        self.config.memory.max_region_size = size;
        self
    }

    /// Set the default `join*` timeout.
    pub fn join_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.interrupt.join_timeout = timeout;
        self
    }

    /// Set the timer command channel capacity.
    pub fn timer_queue(mut self, capacity: usize) -> Self {
        self.config.interrupt.timer_queue = capacity;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Include or omit timestamps in log output.
    pub fn timestamps(mut self, enabled: bool) -> Self {
        self.config.log.timestamps = enabled;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}
