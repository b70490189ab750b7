//! # Backing Store Allocator
//!
//! Raw storage accounting for regions.
//!
//! ## Design
//!
//! A [`BackingStore`] is a contiguous extent `[0, capacity)` with two
//! allocation ends:
//!
//! - the **bottom** cursor grows upward and holds object areas (a region's own
//!   area first, then any guest areas stacked on top of it);
//! - the **top** cursor grows downward and lends space to nested host stores.
//!
//! Each end keeps a stack of outstanding [`Carve`]s. Only the most recent carve
//! on an end may be released, so every operation is O(1) and the extent never
//! fragments. `bottom <= top` always holds; a carve that would cross is an
//! out-of-memory condition.
//!
//! Root stores come from the process-wide [`GlobalPool`], which keeps a byte
//! budget and charges [`RESERVATION_OVERHEAD`] per reservation.
//!
//! ```text
//!  0                                                        capacity
//!  ├── own area ──┼── guest ──┼── free ──────┼── nested host ──┤
//!                              ^ bottom       ^ top
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Bytes charged on top of every reservation for store bookkeeping.
pub const RESERVATION_OVERHEAD: usize = 64;

/// Default global pool budget (64 MiB).
pub const DEFAULT_POOL_SIZE: usize = 64 * 1024 * 1024;

/// Backing store identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreId(pub u64);

impl StoreId {
    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store#{}", self.0)
    }
}

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

fn next_store_id() -> StoreId {
    StoreId(NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed))
}

/// Which end of a store a carve is taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum End {
    /// Grows upward from offset zero.
    Bottom,
    /// Grows downward from the capacity.
    Top,
}

/// A range carved from one end of a backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Carve {
    store: StoreId,
    end: End,
    offset: usize,
    len: usize,
    /// Per-store issue number; tells apart carves with equal extents.
    seq: u64,
}

impl Carve {
    /// The store this carve belongs to.
    pub fn store(&self) -> StoreId {
        self.store
    }

    /// The end the carve was taken from.
    pub fn end(&self) -> End {
        self.end
    }

    /// Offset of the first byte.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the carve is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The carved byte range.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.len
    }
}

struct Cursors {
    bottom: usize,
    top: usize,
    bottom_carves: Vec<Carve>,
    top_carves: Vec<Carve>,
    next_seq: u64,
}

impl Cursors {
    fn stack(&self, end: End) -> &Vec<Carve> {
        match end {
            End::Bottom => &self.bottom_carves,
            End::Top => &self.top_carves,
        }
    }
}

/// Where a store's extent was taken from, and how to give it back.
enum Origin {
    Pool { pool: Arc<GlobalPool>, charged: usize },
    Parent { parent: Arc<BackingStore>, carve: Carve },
}

/// A two-ended contiguous extent from which regions carve their storage.
pub struct BackingStore {
    id: StoreId,
    capacity: usize,
    cursors: Mutex<Cursors>,
    origin: Origin,
    returned: AtomicBool,
}

impl BackingStore {
    fn new(capacity: usize, origin: Origin) -> Self {
        Self {
            id: next_store_id(),
            capacity,
            cursors: Mutex::new(Cursors {
                bottom: 0,
                top: capacity,
                bottom_carves: Vec::with_capacity(4),
                top_carves: Vec::with_capacity(4),
                next_seq: 0,
            }),
            origin,
            returned: AtomicBool::new(false),
        }
    }

    /// Get the store ID.
    pub fn id(&self) -> StoreId {
        self.id
    }

    /// Total size of the extent.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current bottom cursor.
    pub fn bottom(&self) -> usize {
        self.cursors.lock().bottom
    }

    /// Current top cursor.
    pub fn top(&self) -> usize {
        self.cursors.lock().top
    }

    /// Bytes currently carved from either end.
    pub fn consumed(&self) -> usize {
        let c = self.cursors.lock();
        c.bottom + (self.capacity - c.top)
    }

    /// Bytes still available between the cursors.
    pub fn available(&self) -> usize {
        let c = self.cursors.lock();
        c.top - c.bottom
    }

    /// Number of outstanding carves on one end.
    pub fn carve_count(&self, end: End) -> usize {
        self.cursors.lock().stack(end).len()
    }

    /// Whether `carve` is the most recent carve on its end.
    pub fn is_most_recent(&self, carve: &Carve) -> bool {
        self.cursors.lock().stack(carve.end).last() == Some(carve)
    }

    /// Carve `size` bytes from one end.
    pub fn sub_reserve(&self, end: End, size: usize) -> Result<Carve> {
        let mut c = self.cursors.lock();
        let available = c.top - c.bottom;
        if size > available {
            return Err(Error::OutOfBackingStore {
                requested: size,
                available,
            });
        }

        let seq = c.next_seq;
        c.next_seq += 1;
        let carve = match end {
            End::Bottom => {
                let carve = Carve {
                    store: self.id,
                    end,
                    offset: c.bottom,
                    len: size,
                    seq,
                };
                c.bottom += size;
                c.bottom_carves.push(carve);
                carve
            }
            End::Top => {
                c.top -= size;
                let carve = Carve {
                    store: self.id,
                    end,
                    offset: c.top,
                    len: size,
                    seq,
                };
                c.top_carves.push(carve);
                carve
            }
        };

        debug!(store = %self.id, ?end, offset = carve.offset, len = size, "carved backing store");
        Ok(carve)
    }

    /// Return a carve to the store.
    ///
    /// Only the most recent carve on each end may be released; any other
    /// carve is rejected and the store is left untouched.
    pub fn release(&self, carve: Carve) -> Result<()> {
        let mut c = self.cursors.lock();
        let is_last = carve.store == self.id && c.stack(carve.end).last() == Some(&carve);
        if !is_last {
            warn!(store = %self.id, offset = carve.offset, len = carve.len, "rejected out-of-order release");
            return Err(Error::OutOfOrderRelease {
                store: self.id,
                offset: carve.offset,
                len: carve.len,
            });
        }

        match carve.end {
            End::Bottom => {
                c.bottom_carves.pop();
                c.bottom = carve.offset;
            }
            End::Top => {
                c.top_carves.pop();
                c.top = carve.offset + carve.len;
            }
        }

        debug!(store = %self.id, end = ?carve.end, offset = carve.offset, len = carve.len, "released backing store");
        Ok(())
    }

    /// Grow or shrink the most recent bottom carve in place.
    pub(crate) fn resize_carve(&self, carve: Carve, new_len: usize) -> Result<Carve> {
        let mut c = self.cursors.lock();
        if carve.end != End::Bottom || c.bottom_carves.last() != Some(&carve) {
            return Err(Error::InvalidArgument(format!(
                "{}: only the most recent bottom carve can be resized",
                self.id
            )));
        }

        let limit = c.top - carve.offset;
        if new_len > limit {
            return Err(Error::OutOfBackingStore {
                requested: new_len,
                available: limit,
            });
        }

        let resized = Carve {
            len: new_len,
            ..carve
        };
        c.bottom = carve.offset + new_len;
        if let Some(last) = c.bottom_carves.last_mut() {
            *last = resized;
        }
        Ok(resized)
    }

    /// Carve a nested store of `size` bytes from this store's top end.
    ///
    /// The carve is charged `size + RESERVATION_OVERHEAD`.
    pub fn reserve_child(self: &Arc<Self>, size: usize) -> Result<Arc<BackingStore>> {
        let charged = size.checked_add(RESERVATION_OVERHEAD).ok_or_else(|| {
            Error::InvalidArgument(format!("reservation of {} bytes overflows", size))
        })?;
        let carve = self.sub_reserve(End::Top, charged)?;
        Ok(Arc::new(BackingStore::new(
            size,
            Origin::Parent {
                parent: Arc::clone(self),
                carve,
            },
        )))
    }

    /// Give the extent back to the parent store or the pool.
    ///
    /// Idempotent: only the first call has an effect.
    pub fn dispose(&self) -> Result<()> {
        if self.returned.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let leftover = self.consumed();
        if leftover != 0 {
            warn!(store = %self.id, leftover, "disposing backing store with live carves");
        }

        match &self.origin {
            Origin::Pool { pool, charged } => {
                pool.release(*charged);
                Ok(())
            }
            Origin::Parent { parent, carve } => parent.release(*carve),
        }
    }

    /// Whether the extent has been given back.
    pub fn is_disposed(&self) -> bool {
        self.returned.load(Ordering::Acquire)
    }
}

impl Drop for BackingStore {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            warn!(store = %self.id, error = %e, "backing store dropped out of order");
        }
    }
}

impl fmt::Debug for BackingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = self.cursors.lock();
        f.debug_struct("BackingStore")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("bottom", &c.bottom)
            .field("top", &c.top)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ============================================================================
// Global pool
// ============================================================================

#[derive(Debug)]
struct PoolState {
    consumed: usize,
    reservations: usize,
}

/// Process-wide budget from which root backing stores are reserved.
#[derive(Debug)]
pub struct GlobalPool {
    capacity: usize,
    state: Mutex<PoolState>,
}

impl GlobalPool {
    /// Create a pool with the given byte budget.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            state: Mutex::new(PoolState {
                consumed: 0,
                reservations: 0,
            }),
        })
    }

    /// Total budget.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes charged by live reservations, overhead included.
    pub fn consumed(&self) -> usize {
        self.state.lock().consumed
    }

    /// Bytes still available.
    pub fn available(&self) -> usize {
        self.capacity - self.state.lock().consumed
    }

    /// Number of live reservations.
    pub fn reservations(&self) -> usize {
        self.state.lock().reservations
    }

    /// Reserve a root store of `size` bytes.
    pub fn reserve(self: &Arc<Self>, size: usize) -> Result<Arc<BackingStore>> {
        let charged = size.checked_add(RESERVATION_OVERHEAD).ok_or_else(|| {
            Error::InvalidArgument(format!("reservation of {} bytes overflows", size))
        })?;

        {
            let mut state = self.state.lock();
            let available = self.capacity - state.consumed;
            if charged > available {
                return Err(Error::OutOfBackingStore {
                    requested: charged,
                    available,
                });
            }
            state.consumed += charged;
            state.reservations += 1;
        }

        let store = BackingStore::new(
            size,
            Origin::Pool {
                pool: Arc::clone(self),
                charged,
            },
        );
        debug!(store = %store.id(), size, charged, "reserved from global pool");
        Ok(Arc::new(store))
    }

    fn release(&self, charged: usize) {
        let mut state = self.state.lock();
        state.consumed = state.consumed.saturating_sub(charged);
        state.reservations = state.reservations.saturating_sub(1);
    }
}

static GLOBAL_POOL: OnceLock<RwLock<Arc<GlobalPool>>> = OnceLock::new();

fn pool_slot() -> &'static RwLock<Arc<GlobalPool>> {
    GLOBAL_POOL.get_or_init(|| {
        let size = crate::runtime_config()
            .map(|c| c.memory.global_pool_size)
            .unwrap_or(DEFAULT_POOL_SIZE);
        RwLock::new(GlobalPool::new(size))
    })
}

/// Get the process-wide pool.
pub fn global_pool() -> Arc<GlobalPool> {
    Arc::clone(&pool_slot().read())
}

/// Replace the process-wide pool with a fresh one.
///
/// Stores reserved from the previous pool keep returning to it; only new
/// reservations see the replacement. Intended for start-up and test
/// isolation.
pub fn reset_global_pool(capacity: usize) -> Arc<GlobalPool> {
    let fresh = GlobalPool::new(capacity);
    *pool_slot().write() = Arc::clone(&fresh);
    fresh
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_reserve_and_dispose() {
        let pool = GlobalPool::new(4096);
        let store = pool.reserve(1024).unwrap();
        assert_eq!(store.capacity(), 1024);
        assert_eq!(pool.consumed(), 1024 + RESERVATION_OVERHEAD);
        assert_eq!(pool.reservations(), 1);

        store.dispose().unwrap();
        assert_eq!(pool.consumed(), 0);
        assert_eq!(pool.reservations(), 0);
    }

    #[test]
    fn test_pool_exhaustion() {
        let pool = GlobalPool::new(1024);
        let err = pool.reserve(1024).unwrap_err();
        assert!(matches!(err, Error::OutOfBackingStore { .. }));
        assert_eq!(pool.consumed(), 0);
    }

    #[test]
    fn test_drop_returns_to_pool() {
        let pool = GlobalPool::new(4096);
        {
            let _store = pool.reserve(512).unwrap();
            assert!(pool.consumed() > 0);
        }
        assert_eq!(pool.consumed(), 0);
    }

    #[test]
    fn test_two_ended_carving() {
        let pool = GlobalPool::new(4096);
        let store = pool.reserve(1000).unwrap();

        let low = store.sub_reserve(End::Bottom, 100).unwrap();
        let high = store.sub_reserve(End::Top, 300).unwrap();
        assert_eq!(low.range(), 0..100);
        assert_eq!(high.range(), 700..1000);
        assert_eq!(store.consumed(), 400);
        assert_eq!(store.available(), 600);

        store.release(high).unwrap();
        store.release(low).unwrap();
        assert_eq!(store.consumed(), 0);
    }

    #[test]
    fn test_cursors_never_cross() {
        let pool = GlobalPool::new(4096);
        let store = pool.reserve(256).unwrap();
        store.sub_reserve(End::Bottom, 200).unwrap();

        let err = store.sub_reserve(End::Top, 57).unwrap_err();
        match err {
            Error::OutOfBackingStore { requested, available } => {
                assert_eq!(requested, 57);
                assert_eq!(available, 56);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.bottom() <= store.top());
    }

    #[test]
    fn test_out_of_order_release_rejected() {
        let pool = GlobalPool::new(4096);
        let store = pool.reserve(1024).unwrap();
        let first = store.sub_reserve(End::Bottom, 64).unwrap();
        let second = store.sub_reserve(End::Bottom, 64).unwrap();

        assert!(matches!(
            store.release(first),
            Err(Error::OutOfOrderRelease { .. })
        ));
        assert_eq!(store.bottom(), 128);

        store.release(second).unwrap();
        store.release(first).unwrap();
        assert_eq!(store.bottom(), 0);
    }

    #[test]
    fn test_stale_carve_cannot_release_successor() {
        let pool = GlobalPool::new(4096);
        let store = pool.reserve(1024).unwrap();
        let first = store.sub_reserve(End::Bottom, 64).unwrap();
        store.release(first).unwrap();

        // Same end, offset and length as the released carve.
        let second = store.sub_reserve(End::Bottom, 64).unwrap();
        assert_eq!(second.range(), first.range());
        assert_ne!(second, first);
        assert!(matches!(
            store.release(first),
            Err(Error::OutOfOrderRelease { .. })
        ));
        assert_eq!(store.bottom(), 64);
        assert!(store.is_most_recent(&second));
        store.release(second).unwrap();
    }

    #[test]
    fn test_empty_carves_are_distinct() {
        let pool = GlobalPool::new(4096);
        let store = pool.reserve(256).unwrap();
        let a = store.sub_reserve(End::Top, 0).unwrap();
        let b = store.sub_reserve(End::Top, 0).unwrap();
        assert!(a.is_empty() && b.is_empty());
        assert_ne!(a, b);
        assert!(matches!(
            store.release(a),
            Err(Error::OutOfOrderRelease { .. })
        ));
        assert_eq!(store.carve_count(End::Top), 2);
        store.release(b).unwrap();
        store.release(a).unwrap();
        assert_eq!(store.carve_count(End::Top), 0);
    }

    #[test]
    fn test_release_foreign_carve_rejected() {
        let pool = GlobalPool::new(8192);
        let a = pool.reserve(512).unwrap();
        let b = pool.reserve(512).unwrap();
        let carve = a.sub_reserve(End::Bottom, 10).unwrap();
        assert!(b.release(carve).is_err());
        assert!(a.release(carve).is_ok());
    }

    #[test]
    fn test_nested_store_returns_to_parent() {
        let pool = GlobalPool::new(8192);
        let parent = pool.reserve(2048).unwrap();
        let child = parent.reserve_child(512).unwrap();
        assert_eq!(child.capacity(), 512);
        assert_eq!(parent.consumed(), 512 + RESERVATION_OVERHEAD);

        child.dispose().unwrap();
        assert_eq!(parent.consumed(), 0);
        // Second dispose is a no-op.
        child.dispose().unwrap();
        assert_eq!(parent.consumed(), 0);
    }

    #[test]
    fn test_resize_most_recent_carve() {
        let pool = GlobalPool::new(4096);
        let store = pool.reserve(1024).unwrap();
        let area = store.sub_reserve(End::Bottom, 100).unwrap();

        let grown = store.resize_carve(area, 400).unwrap();
        assert_eq!(grown.len(), 400);
        assert_eq!(store.bottom(), 400);

        let shrunk = store.resize_carve(grown, 50).unwrap();
        assert_eq!(store.bottom(), 50);

        let _guest = store.sub_reserve(End::Bottom, 10).unwrap();
        assert!(store.resize_carve(shrunk, 60).is_err());
    }
}
