//! Pinnable regions.
//!
//! Pinning keeps a region's contents alive after every task has left it.
//! Reclamation needs both the reference count and the pin count at zero; the
//! join family still waits on the reference count alone.

use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};
use crate::region::{Region, RegionKind};
use crate::scope::{self, ContextId};

impl Region {
    /// Create a pinnable region with an object area of `size` bytes.
    pub fn pinnable(size: usize) -> Result<Self> {
        Self::from_pool(RegionKind::Pinnable, size)
    }

    fn require_pinnable(&self) -> Result<()> {
        if !self.kind().is_pinnable() {
            return Err(Error::NotPinnable { region: self.id() });
        }
        Ok(())
    }

    /// Pin the region.
    ///
    /// The region must be the caller's current allocation context.
    pub fn pin(&self) -> Result<()> {
        self.require_pinnable()?;
        if scope::current_context() != ContextId::Region(self.id()) {
            return Err(Error::NotCurrentContext { region: self.id() });
        }
        let mut st = self.shared.state.lock();
        st.pin_count += 1;
        debug!(region = %self.id(), pin_count = st.pin_count, "pinned region");
        Ok(())
    }

    /// Remove one pin.
    ///
    /// Removing the last pin of an unentered region reclaims it in the
    /// calling task.
    ///
    /// # Panics
    ///
    /// Panics when the region is not pinned.
    pub fn unpin(&self) -> Result<()> {
        self.require_pinnable()?;
        let teardown = {
            let mut st = self.shared.state.lock();
            if st.pin_count == 0 {
                drop(st);
                panic!("unpin of {} with a pin count of zero", self.id());
            }
            st.pin_count -= 1;
            debug!(region = %self.id(), pin_count = st.pin_count, "unpinned region");
            if st.pin_count == 0 && st.ref_count == 0 && !st.is_retired() {
                Some(self.shared.detach_contents(&mut st))
            } else {
                None
            }
        };

        if let Some(teardown) = teardown {
            self.shared.complete_teardown(teardown);
        }
        Ok(())
    }

    /// Current pin count. Zero for regions that cannot be pinned.
    pub fn pin_count(&self) -> usize {
        self.shared.state.lock().pin_count
    }

    /// [`Region::join`] for a pinnable region.
    pub fn join_pinned(&self, timeout: Option<Duration>) -> Result<bool> {
        self.require_pinnable()?;
        self.join(timeout)
    }

    /// [`Region::join_and_enter`] for a pinnable region.
    pub fn join_and_enter_pinned<T>(
        &self,
        logic: impl FnOnce() -> Result<T>,
        timeout: Option<Duration>,
    ) -> Result<T> {
        self.require_pinnable()?;
        self.join_and_enter(logic, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_requires_current_context() {
        let region = Region::pinnable(256).unwrap();
        assert!(matches!(
            region.pin(),
            Err(Error::NotCurrentContext { .. })
        ));

        let generic = Region::new(256).unwrap();
        generic
            .enter(|| {
                assert!(matches!(generic.pin(), Err(Error::NotPinnable { .. })));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_pin_defers_reclamation() {
        let region = Region::pinnable(256).unwrap();
        let handle = region
            .enter(|| {
                region.pin()?;
                region.alloc(7u32)
            })
            .unwrap();

        assert_eq!(region.reference_count(), 0);
        assert_eq!(region.pin_count(), 1);
        assert_eq!(handle.get().unwrap(), 7);
        assert!(matches!(
            region.reclaim(),
            Err(Error::RegionInUse { pin_count: 1, .. })
        ));

        region.unpin().unwrap();
        assert_eq!(region.pin_count(), 0);
        assert!(matches!(
            handle.get(),
            Err(Error::StaleReference(_))
        ));
    }

    #[test]
    fn test_unpin_while_entered_keeps_contents() {
        let region = Region::pinnable(256).unwrap();
        region
            .enter(|| {
                region.pin()?;
                let handle = region.alloc(1u8)?;
                region.unpin()?;
                assert_eq!(handle.get()?, 1);
                Ok(())
            })
            .unwrap();
        assert_eq!(region.memory_consumed(), 0);
    }

    #[test]
    #[should_panic(expected = "pin count of zero")]
    fn test_unpin_below_zero_panics() {
        let region = Region::pinnable(64).unwrap();
        let _ = region.unpin();
    }

    #[test]
    fn test_pin_does_not_hold_joiners() {
        let region = Region::pinnable(256).unwrap();
        let handle = region
            .enter(|| {
                region.pin()?;
                region.alloc(11u16)
            })
            .unwrap();
        assert_eq!(region.reference_count(), 0);
        assert_eq!(region.pin_count(), 1);

        let start = std::time::Instant::now();
        assert!(region.join_pinned(Some(Duration::from_secs(5))).unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));

        // Entering and leaving while pinned keeps the contents.
        let seen = region
            .join_and_enter_pinned(|| handle.get(), Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(seen, 11);
        assert_eq!(region.pin_count(), 1);
        assert!(handle.is_valid());

        region.unpin().unwrap();
        assert!(!handle.is_valid());
    }

    #[test]
    fn test_pinned_joins_check_kind() {
        let generic = Region::new(64).unwrap();
        assert!(matches!(
            generic.join_pinned(None),
            Err(Error::NotPinnable { .. })
        ));
        assert!(matches!(
            generic.join_and_enter_pinned(|| Ok(()), None),
            Err(Error::NotPinnable { .. })
        ));

        let pinnable = Region::pinnable(64).unwrap();
        assert!(pinnable.join_pinned(Some(Duration::from_millis(1))).unwrap());
        let value = pinnable.join_and_enter_pinned(|| Ok(5), None).unwrap();
        assert_eq!(value, 5);
    }
}
