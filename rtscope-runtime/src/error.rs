//! Error types for region and interrupt operations.
//!
//! Every fallible operation in the runtime reports through [`Error`]. The
//! variants fall into four groups:
//!
//! - **Structural violations**: `CyclicScope`, `GuestConflict`,
//!   `WrongContext`, `OutOfOrderRelease`, `NotInScope`,
//!   `NotCurrentContext`. These are programming errors and are never retried.
//! - **Resource exhaustion**: `OutOfBackingStore`. Construction that fails
//!   this way leaves nothing behind.
//! - **Waits**: `JoinTimedOut` and `Interrupted`. An asynchronous interrupt
//!   always wins over a normal return, so interrupted waits surface as errors
//!   rather than status codes.
//! - **Handle misuse**: `StaleReference`, `TypeMismatch`, `RegionRetired`.

use std::time::Duration;

use thiserror::Error;

use crate::backing::StoreId;
use crate::interrupt::Interrupted;
use crate::object::StaleReferenceError;
use crate::region::RegionId;
use crate::scope::ContextId;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors reported by the region and interrupt runtime.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Not enough contiguous space in a backing store or the global pool.
    #[error("out of backing store: requested {requested} bytes, {available} available")]
    OutOfBackingStore {
        /// Bytes requested, including any reservation overhead.
        requested: usize,
        /// Bytes that were available at the time of the request.
        available: usize,
    },

    /// Entering would give the region a second parent.
    #[error("cyclic scope: {region} is bound to {recorded}, entered from {current}")]
    CyclicScope {
        /// The region being entered.
        region: RegionId,
        /// The parent recorded at first entry.
        recorded: ContextId,
        /// The caller's current allocation context.
        current: ContextId,
    },

    /// The stacked region already has a live guest child.
    #[error("{host} already has a live guest region")]
    GuestConflict {
        /// The stacked region whose guest slot is taken.
        host: RegionId,
    },

    /// A stacked region was entered outside its construction context.
    #[error("{region} must be entered from {expected}, entered from {current}")]
    WrongContext {
        /// The region being entered.
        region: RegionId,
        /// The context the region was constructed in.
        expected: ContextId,
        /// The caller's current allocation context.
        current: ContextId,
    },

    /// A carve was released while a later carve on the same end is live.
    #[error("out-of-order release on {store}: [{offset}, +{len}) is not the most recent carve")]
    OutOfOrderRelease {
        /// The store the carve belongs to.
        store: StoreId,
        /// Offset of the rejected carve.
        offset: usize,
        /// Length of the rejected carve.
        len: usize,
    },

    /// An argument or precondition was not satisfied.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The region is not on the calling task's scope stack.
    #[error("{region} is not on the scope stack of the calling task")]
    NotInScope {
        /// The region that was addressed.
        region: RegionId,
    },

    /// The region is not the calling task's current allocation context.
    #[error("{region} is not the current allocation context")]
    NotCurrentContext {
        /// The region that was addressed.
        region: RegionId,
    },

    /// A pin operation was attempted on a region that cannot be pinned.
    #[error("{region} is not a pinnable region")]
    NotPinnable {
        /// The region that was addressed.
        region: RegionId,
    },

    /// A stacked-only operation was attempted on another kind of region.
    #[error("{region} is not a stacked region")]
    NotStacked {
        /// The region that was addressed.
        region: RegionId,
    },

    /// The operation requires the region to be unentered and unpinned.
    #[error("{region} is in use (reference count {ref_count}, pin count {pin_count})")]
    RegionInUse {
        /// The region that was addressed.
        region: RegionId,
        /// Reference count at the time of the request.
        ref_count: usize,
        /// Pin count at the time of the request.
        pin_count: usize,
    },

    /// The region's backing storage has been returned; it cannot be used.
    #[error("{region} has been retired")]
    RegionRetired {
        /// The region that was addressed.
        region: RegionId,
    },

    /// A handle outlived the contents it referred to.
    #[error(transparent)]
    StaleReference(#[from] StaleReferenceError),

    /// A typed access did not match the stored object's type.
    #[error("object in {region} is not of the requested type")]
    TypeMismatch {
        /// The region holding the object.
        region: RegionId,
    },

    /// `join_and_enter` gave up before the reference count reached zero.
    #[error("join on {region} timed out after {waited:?}")]
    JoinTimedOut {
        /// The region being joined.
        region: RegionId,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The deadline timer for a timed interrupt could not be started.
    #[error("timer unavailable: {0}")]
    TimerUnavailable(String),

    /// An asynchronous interrupt was delivered to the calling task.
    #[error(transparent)]
    Interrupted(Interrupted),
}

impl Error {
    /// Returns the delivered interrupt if this error is an interruption.
    pub fn as_interrupted(&self) -> Option<&Interrupted> {
        match self {
            Error::Interrupted(i) => Some(i),
            _ => None,
        }
    }

    /// Whether this error is a structural violation (a programming error).
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::CyclicScope { .. }
                | Error::GuestConflict { .. }
                | Error::WrongContext { .. }
                | Error::OutOfOrderRelease { .. }
                | Error::NotInScope { .. }
                | Error::NotCurrentContext { .. }
        )
    }
}

impl From<Interrupted> for Error {
    fn from(interrupted: Interrupted) -> Self {
        Error::Interrupted(interrupted)
    }
}
