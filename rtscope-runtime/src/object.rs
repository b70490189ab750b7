//! Region-allocated objects and generation-checked handles.
//!
//! A region's object area is accounted byte-for-byte against its carve of the
//! backing store; the values themselves live in a per-region table and are
//! addressed through [`RegionRef`] handles. Every handle records the region's
//! epoch at allocation time. Reclamation advances the epoch, so a handle that
//! outlives the contents it pointed to is detected instead of read.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Weak;

use crate::error::{Error, Result};
use crate::region::{RegionId, RegionShared};

/// Epoch counter type. Advances once per reclamation.
pub type Epoch = u64;

/// Epoch of a freshly created region.
pub const FIRST_EPOCH: Epoch = 1;

/// Error returned when a handle's epoch no longer matches its region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleReferenceError {
    /// Region the handle points into.
    pub region: RegionId,
    /// Epoch recorded in the handle.
    pub expected: Epoch,
    /// Current epoch of the region.
    pub actual: Epoch,
}

impl fmt::Display for StaleReferenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stale reference into {}: expected epoch {}, found {}",
            self.region, self.expected, self.actual
        )
    }
}

impl std::error::Error for StaleReferenceError {}

struct Slot {
    value: Box<dyn Any + Send + Sync>,
    charged: usize,
}

/// Per-region object storage with a bump cursor.
pub(crate) struct ObjectTable {
    capacity: usize,
    used: usize,
    epoch: Epoch,
    slots: Vec<Slot>,
    portal: Option<usize>,
}

/// Contents detached from a table by [`ObjectTable::take_all`].
pub(crate) struct Detached {
    slots: Vec<Slot>,
    pub(crate) bytes: usize,
}

impl Detached {
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

impl Drop for Detached {
    fn drop(&mut self) {
        // Reverse allocation order.
        while let Some(slot) = self.slots.pop() {
            drop(slot);
        }
    }
}

fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

impl ObjectTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: 0,
            epoch: FIRST_EPOCH,
            slots: Vec::new(),
            portal: None,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn set_capacity(&mut self, capacity: usize) {
        debug_assert!(capacity >= self.used);
        self.capacity = capacity;
    }

    pub(crate) fn used(&self) -> usize {
        self.used
    }

    pub(crate) fn remaining(&self) -> usize {
        self.capacity - self.used
    }

    pub(crate) fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Bump the cursor by `size` aligned to `align` and store `value`.
    pub(crate) fn push(
        &mut self,
        value: Box<dyn Any + Send + Sync>,
        size: usize,
        align: usize,
    ) -> Result<(usize, Epoch)> {
        let start = align_up(self.used, align.max(1));
        let end = start.checked_add(size).filter(|end| *end <= self.capacity);
        let Some(end) = end else {
            return Err(Error::OutOfBackingStore {
                requested: size,
                available: self.remaining(),
            });
        };

        let index = self.slots.len();
        self.slots.push(Slot {
            value,
            charged: end - self.used,
        });
        self.used = end;
        Ok((index, self.epoch))
    }

    fn slot(&self, region: RegionId, index: usize, epoch: Epoch) -> Result<&Slot> {
        if epoch != self.epoch {
            return Err(StaleReferenceError {
                region,
                expected: epoch,
                actual: self.epoch,
            }
            .into());
        }
        self.slots.get(index).ok_or_else(|| {
            StaleReferenceError {
                region,
                expected: epoch,
                actual: self.epoch,
            }
            .into()
        })
    }

    pub(crate) fn get<T: Any>(&self, region: RegionId, index: usize, epoch: Epoch) -> Result<&T> {
        self.slot(region, index, epoch)?
            .value
            .downcast_ref::<T>()
            .ok_or(Error::TypeMismatch { region })
    }

    pub(crate) fn get_mut<T: Any>(
        &mut self,
        region: RegionId,
        index: usize,
        epoch: Epoch,
    ) -> Result<&mut T> {
        self.slot(region, index, epoch)?;
        self.slots[index]
            .value
            .downcast_mut::<T>()
            .ok_or(Error::TypeMismatch { region })
    }

    pub(crate) fn set_portal(&mut self, region: RegionId, index: usize, epoch: Epoch) -> Result<()> {
        self.slot(region, index, epoch)?;
        self.portal = Some(index);
        Ok(())
    }

    pub(crate) fn portal<T: Any>(&self, region: RegionId) -> Result<Option<usize>> {
        match self.portal {
            None => Ok(None),
            Some(index) => {
                self.get::<T>(region, index, self.epoch)?;
                Ok(Some(index))
            }
        }
    }

    /// Detach every object, reset the cursor and portal, advance the epoch.
    pub(crate) fn take_all(&mut self) -> Detached {
        let slots = std::mem::take(&mut self.slots);
        let bytes = slots.iter().map(|s| s.charged).sum();
        self.used = 0;
        self.portal = None;
        self.epoch += 1;
        Detached { slots, bytes }
    }
}

/// A typed handle to an object allocated in a region.
///
/// Handles do not keep the region alive. Access fails with
/// [`Error::StaleReference`] once the region has been reclaimed since the
/// allocation, and with [`Error::RegionRetired`] once it is gone.
///
/// The closure passed to [`RegionRef::with`] and [`RegionRef::update`] runs
/// while the region's object table is locked; it must not allocate in the
/// same region.
pub struct RegionRef<T> {
    region: Weak<RegionShared>,
    region_id: RegionId,
    index: usize,
    epoch: Epoch,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for RegionRef<T> {
    fn clone(&self) -> Self {
        Self {
            region: self.region.clone(),
            region_id: self.region_id,
            index: self.index,
            epoch: self.epoch,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for RegionRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionRef")
            .field("region", &self.region_id)
            .field("index", &self.index)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl<T: Any + Send + Sync> RegionRef<T> {
    pub(crate) fn new(region: Weak<RegionShared>, region_id: RegionId, index: usize, epoch: Epoch) -> Self {
        Self {
            region,
            region_id,
            index,
            epoch,
            _marker: PhantomData,
        }
    }

    /// The region this handle points into.
    pub fn region_id(&self) -> RegionId {
        self.region_id
    }

    /// The epoch recorded at allocation.
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn shared(&self) -> Result<std::sync::Arc<RegionShared>> {
        self.region.upgrade().ok_or(Error::RegionRetired {
            region: self.region_id,
        })
    }

    /// Whether the handle still refers to live contents.
    pub fn is_valid(&self) -> bool {
        self.with(|_| ()).is_ok()
    }

    /// Borrow the object.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        let shared = self.shared()?;
        let objects = shared.objects.lock();
        let value = objects.get::<T>(self.region_id, self.index, self.epoch)?;
        Ok(f(value))
    }

    /// Mutably borrow the object.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let shared = self.shared()?;
        let mut objects = shared.objects.lock();
        let value = objects.get_mut::<T>(self.region_id, self.index, self.epoch)?;
        Ok(f(value))
    }

    /// Copy the object out.
    pub fn get(&self) -> Result<T>
    where
        T: Clone,
    {
        self.with(T::clone)
    }
}
