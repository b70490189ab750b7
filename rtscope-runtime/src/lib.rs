//! # rtscope Runtime
//!
//! Deterministic region memory and asynchronous interruption for real-time
//! tasks:
//!
//! - **Backing stores**: a process-wide pool and two-ended stores with LIFO
//!   sub-allocation
//! - **Scoped regions**: reference-counted object areas obeying the
//!   single-parent rule, reclaimed synchronously by the last task to leave
//! - **Stacked and pinnable regions**: host/guest store sharing and
//!   pin-deferred reclamation
//! - **Asynchronous interrupts**: per-task pending slot with depth
//!   arbitration, protected calls, deadline timers
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        RTSCOPE RUNTIME                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                                │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐        │
//! │  │   Regions    │  │   Stacked    │  │  Pinnable    │        │
//! │  │ (region.rs)  │  │ (stacked.rs) │  │(pinnable.rs) │        │
//! │  └──────────────┘  └──────────────┘  └──────────────┘        │
//! │         │                 │                 │                 │
//! │         └─────────────────┼─────────────────┘                 │
//! │                           │                                   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐        │
//! │  │ Scope stack  │  │   Backing    │  │   Objects    │        │
//! │  │  (scope.rs)  │  │ (backing.rs) │  │ (object.rs)  │        │
//! │  └──────────────┘  └──────────────┘  └──────────────┘        │
//! │                                                                │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐        │
//! │  │  Interrupts  │  │    Timed     │  │    Tasks     │        │
//! │  │(interrupt.rs)│  │  (timed.rs)  │  │  (task.rs)   │        │
//! │  └──────────────┘  └──────────────┘  └──────────────┘        │
//! │                                                                │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use rtscope_runtime::{AsyncInterrupt, Region};
//!
//! let region = Region::new(4096)?;
//! let sum = region.enter(|| {
//!     let a = region.alloc(40u64)?;
//!     let b = region.alloc(2u64)?;
//!     Ok(a.get()? + b.get()?)
//! })?;
//!
//! let irq = AsyncInterrupt::new();
//! let outcome = irq.run(|frame| {
//!     frame.check()?;
//!     Ok(sum)
//! })?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod backing;
pub mod config;
pub mod error;
pub mod interrupt;
pub mod log;
pub mod object;
pub mod pinnable;
pub mod region;
pub mod scope;
pub mod stacked;
pub mod task;
pub mod timed;

use std::sync::OnceLock;

// Re-exports
pub use backing::{global_pool, reset_global_pool, BackingStore, Carve, End, GlobalPool, StoreId, RESERVATION_OVERHEAD};
pub use config::{ConfigError, LogLevel, RuntimeConfig, RuntimeConfigBuilder};
pub use error::{Error, Result};
pub use interrupt::{AsyncInterrupt, Frame, InterruptId, Interruptible, Interrupted, Outcome, Rejection};
pub use object::{Epoch, RegionRef, StaleReferenceError};
pub use region::{ReclaimStats, Region, RegionId, RegionKind, RegionStats};
pub use scope::ContextId;
pub use task::{Task, TaskId};
pub use timed::{Timed, TimerSpec};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Global runtime configuration.
static RUNTIME_CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Initialize the runtime.
///
/// Validates and installs `config`, installs a log subscriber unless one is
/// already present, then replaces the global pool with one of the configured
/// size. Can be called once per process.
///
/// # Example
///
/// ```rust,ignore
/// use rtscope_runtime::{init, RuntimeConfig};
///
/// let config = RuntimeConfig::builder()
///     .global_pool_size(8 * 1024 * 1024)
///     .build()?;
/// init(config)?;
/// ```
pub fn init(config: RuntimeConfig) -> std::result::Result<(), ConfigError> {
    config.validate()?;
    let pool_size = config.memory.global_pool_size;
    RUNTIME_CONFIG
        .set(config)
        .map_err(|_| ConfigError::AlreadyInitialized)?;
    if let Some(installed) = RUNTIME_CONFIG.get() {
        log::init(&installed.log);
    }
    reset_global_pool(pool_size);
    tracing::info!(pool_size, "rtscope runtime initialized");
    Ok(())
}

/// Initialize the runtime from environment variables.
///
/// Reads `RTSCOPE_*` variables; see [`RuntimeConfig::from_env`].
pub fn init_from_env() -> std::result::Result<(), ConfigError> {
    init(RuntimeConfig::from_env())
}

/// Get the installed runtime configuration.
///
/// Returns `None` until [`init`] or [`init_from_env`] succeeds.
pub fn runtime_config() -> Option<&'static RuntimeConfig> {
    RUNTIME_CONFIG.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_init_rejects_invalid_config() {
        let config = RuntimeConfig::builder()
            .timer_queue(0)
            .build_unchecked();
        assert!(init(config).is_err());
    }
}
