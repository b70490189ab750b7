//! Stack-discipline regions.
//!
//! A **host** owns a backing store. When it is constructed inside another
//! stacked region the store is carved from that region's store top;
//! otherwise it comes from the global pool. The host's object area is then
//! carved from the bottom of its own store.
//!
//! A **guest** owns no store. Its object area is carved from the bottom of
//! the store used by the stacked region that is current at construction. A
//! stacked region has at most one live guest.
//!
//! Both kinds record their construction context as their parent and may only
//! be entered from it.

use std::sync::Arc;

use tracing::debug;

use crate::backing::End;
use crate::error::{Error, Result};
use crate::region::{check_size, Backing, Region, RegionKind, RegionShared};
use crate::scope::{self, ContextId};

impl Region {
    /// Create a stacked host region.
    ///
    /// Reserves `backing_size` bytes, from the current stacked region's store
    /// or else from the global pool, and carves a `scope_size` object area
    /// from the bottom of the new store. Nothing is left reserved on failure.
    pub fn stacked_host(scope_size: usize, backing_size: usize) -> Result<Self> {
        check_size(backing_size)?;
        if scope_size > backing_size {
            return Err(Error::OutOfBackingStore {
                requested: scope_size,
                available: backing_size,
            });
        }

        let ctx = scope::current();
        let parent_store = match &ctx {
            Some(region) if region.kind().is_stacked() => {
                let st = region.shared.state.lock();
                let backing = st.backing.as_ref().ok_or(Error::RegionRetired {
                    region: region.id(),
                })?;
                Some(Arc::clone(&backing.store))
            }
            _ => None,
        };

        let store = match parent_store {
            Some(parent) => parent.reserve_child(backing_size)?,
            None => crate::backing::global_pool().reserve(backing_size)?,
        };
        let area = store.sub_reserve(End::Bottom, scope_size)?;

        let parent = ctx
            .as_ref()
            .map_or(ContextId::Heap, |r| ContextId::Region(r.id()));
        let shared = RegionShared::build(
            RegionKind::StackedHost,
            Backing {
                store,
                area,
                host: None,
            },
            Some(parent),
        );
        debug!(region = %shared.id(), scope_size, backing_size, %parent, "created stacked host");
        Ok(Region::adopt(shared, true))
    }

    /// Create a stacked guest region inside the current stacked region.
    ///
    /// Fails with [`Error::InvalidArgument`] when the current context is not
    /// stacked and with [`Error::GuestConflict`] when that region already has
    /// a live guest.
    pub fn stacked_guest(scope_size: usize) -> Result<Self> {
        check_size(scope_size)?;
        let host = match scope::current() {
            Some(region) if region.kind().is_stacked() => region,
            Some(region) => {
                return Err(Error::InvalidArgument(format!(
                    "guest regions need a stacked context, {} is {:?}",
                    region.id(),
                    region.kind()
                )))
            }
            None => {
                return Err(Error::InvalidArgument(
                    "guest regions need a stacked context, not the heap".into(),
                ))
            }
        };

        // Slot check, carve and registration happen under the host's lock.
        let mut st = host.shared.state.lock();
        if st.has_live_guest() {
            return Err(Error::GuestConflict { host: host.id() });
        }
        let store = match st.backing.as_ref() {
            Some(backing) => Arc::clone(&backing.store),
            None => return Err(Error::RegionRetired { region: host.id() }),
        };
        let area = store.sub_reserve(End::Bottom, scope_size)?;

        let shared = RegionShared::build(
            RegionKind::StackedGuest,
            Backing {
                store,
                area,
                host: Some(Arc::downgrade(&host.shared)),
            },
            Some(ContextId::Region(host.id())),
        );
        st.guest = Some(Arc::downgrade(&shared));
        st.adopt(&shared, true);
        drop(st);

        debug!(region = %shared.id(), host = %host.id(), scope_size, "created stacked guest");
        Ok(Region { shared })
    }

    /// Change the size of a stacked region's object area.
    ///
    /// The region must be unentered, `new_scope_size` must cover the bytes in
    /// use, and nothing may have been carved after the area in the same store.
    pub fn resize(&self, new_scope_size: usize) -> Result<()> {
        if !self.kind().is_stacked() {
            return Err(Error::NotStacked { region: self.id() });
        }
        check_size(new_scope_size)?;

        let mut st = self.shared.state.lock();
        if st.is_retired() {
            return Err(Error::RegionRetired { region: self.id() });
        }
        if st.ref_count > 0 || st.pin_count > 0 {
            return Err(Error::RegionInUse {
                region: self.id(),
                ref_count: st.ref_count,
                pin_count: st.pin_count,
            });
        }
        if st.has_live_guest() {
            return Err(Error::GuestConflict { host: self.id() });
        }

        let mut objects = self.shared.objects.lock();
        if new_scope_size < objects.used() {
            return Err(Error::InvalidArgument(format!(
                "{} has {} bytes in use; cannot shrink to {}",
                self.id(),
                objects.used(),
                new_scope_size
            )));
        }

        let Some(backing) = st.backing.as_mut() else {
            return Err(Error::RegionRetired { region: self.id() });
        };
        if !backing.store.is_most_recent(&backing.area) {
            return Err(Error::InvalidArgument(format!(
                "{}: a later carve in the same store blocks the resize",
                self.id()
            )));
        }
        backing.area = backing.store.resize_carve(backing.area, new_scope_size)?;
        objects.set_capacity(new_scope_size);
        debug!(region = %self.id(), new_scope_size, "resized stacked region");
        Ok(())
    }

    /// Bytes of a host's store in use beyond its own object area.
    ///
    /// Counts guest areas and nested host stores. `None` for guests, other
    /// region kinds and retired hosts.
    pub fn backing_store_consumed(&self) -> Option<usize> {
        if self.kind() != RegionKind::StackedHost {
            return None;
        }
        let st = self.shared.state.lock();
        st.backing
            .as_ref()
            .map(|b| b.store.consumed().saturating_sub(b.area.len()))
    }

    /// Whether a live guest currently occupies this region's guest slot.
    pub fn has_guest(&self) -> bool {
        self.shared.state.lock().has_live_guest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::RESERVATION_OVERHEAD;

    #[test]
    fn test_host_from_pool() {
        let host = Region::stacked_host(256, 1024).unwrap();
        assert_eq!(host.kind(), RegionKind::StackedHost);
        assert_eq!(host.size(), 256);
        assert_eq!(host.parent_id(), Some(ContextId::Heap));
        assert_eq!(host.backing_store_consumed(), Some(0));
    }

    #[test]
    fn test_host_scope_larger_than_backing() {
        assert!(matches!(
            Region::stacked_host(2048, 1024),
            Err(Error::OutOfBackingStore { .. })
        ));
    }

    #[test]
    fn test_guest_needs_stacked_context() {
        assert!(matches!(
            Region::stacked_guest(64),
            Err(Error::InvalidArgument(_))
        ));
        let generic = Region::new(256).unwrap();
        generic
            .enter(|| {
                assert!(matches!(
                    Region::stacked_guest(64),
                    Err(Error::InvalidArgument(_))
                ));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_guest_carves_host_store() {
        let host = Region::stacked_host(256, 1024).unwrap();
        host.enter(|| {
            let guest = Region::stacked_guest(128)?;
            assert_eq!(guest.kind(), RegionKind::StackedGuest);
            assert_eq!(guest.parent_id(), Some(ContextId::Region(host.id())));
            assert_eq!(guest.backing_store_consumed(), None);
            assert_eq!(host.backing_store_consumed(), Some(128));
            assert!(host.has_guest());
            Ok(())
        })
        .unwrap();
        assert_eq!(host.backing_store_consumed(), Some(0));
        assert!(!host.has_guest());
    }

    #[test]
    fn test_guest_out_of_space_leaves_slot_free() {
        let host = Region::stacked_host(256, 512).unwrap();
        host.enter(|| {
            assert!(matches!(
                Region::stacked_guest(512),
                Err(Error::OutOfBackingStore { .. })
            ));
            assert!(!host.has_guest());
            Region::stacked_guest(256)?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_nested_host_carves_parent_top() {
        let outer = Region::stacked_host(128, 4096).unwrap();
        outer
            .enter(|| {
                let inner = Region::stacked_host(64, 512)?;
                assert_eq!(inner.parent_id(), Some(ContextId::Region(outer.id())));
                assert_eq!(
                    outer.backing_store_consumed(),
                    Some(512 + RESERVATION_OVERHEAD)
                );
                inner.enter(|| Ok(()))?;
                Ok(())
            })
            .unwrap();
        assert_eq!(outer.backing_store_consumed(), Some(0));
    }

    #[test]
    fn test_nested_host_too_large_leaves_nothing() {
        let outer = Region::stacked_host(128, 1024).unwrap();
        outer
            .enter(|| {
                assert!(matches!(
                    Region::stacked_host(64, 4096),
                    Err(Error::OutOfBackingStore { .. })
                ));
                assert_eq!(outer.backing_store_consumed(), Some(0));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_wrong_context_entry() {
        let outer = Region::stacked_host(128, 4096).unwrap();
        let inner = outer
            .enter(|| Region::stacked_host(64, 512))
            .unwrap();
        // Created in the outer context, so the outer exit retired it.
        assert!(inner.is_retired());

        let host = Region::stacked_host(64, 256).unwrap();
        let generic = Region::new(64).unwrap();
        let err = generic.enter(|| host.enter(|| Ok(()))).unwrap_err();
        assert!(matches!(err, Error::WrongContext { .. }));
    }

    #[test]
    fn test_resize() {
        let host = Region::stacked_host(256, 1024).unwrap();
        assert!(matches!(
            Region::new(64).unwrap().resize(10),
            Err(Error::NotStacked { .. })
        ));

        host.resize(512).unwrap();
        assert_eq!(host.size(), 512);
        assert!(matches!(
            host.resize(2048),
            Err(Error::OutOfBackingStore { .. })
        ));

        host.enter(|| {
            assert!(matches!(
                host.resize(128),
                Err(Error::RegionInUse { .. })
            ));
            Ok(())
        })
        .unwrap();

        host.resize(64).unwrap();
        assert_eq!(host.memory_remaining(), 64);
    }
}
