//! # Scoped Regions
//!
//! A region is a bounded object area with a reference count. Tasks enter a
//! region to make it their current allocation context and leave it when the
//! entered logic returns. When the last task leaves (and, for pinnable
//! regions, no pin remains) the region is reclaimed in the exiting task:
//!
//! 1. its objects are dropped in reverse allocation order,
//! 2. every region created in its allocation context is retired in reverse
//!    creation order, returning their backing storage,
//! 3. the reclaim hook runs.
//!
//! A reclaimed region keeps its parent and its own backing carve and can be
//! entered again. A retired region has returned its storage and cannot.
//!
//! ## Single-parent rule
//!
//! The first successful entry records the caller's current allocation
//! context as the region's parent. Any later entry from a different context
//! fails with [`Error::CyclicScope`]. Stacked regions record their parent at
//! construction and reject entry from elsewhere with
//! [`Error::WrongContext`].
//!
//! ## Waiting
//!
//! [`Region::join`] waits for the count to reach zero. [`Region::join_and_enter`]
//! queues a ticket; each transition to zero grants the front ticket and
//! counts the entry on the waiter's behalf, so exactly one waiter is released
//! and no other entry can slip in between.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::backing::{global_pool, BackingStore, Carve, End};
use crate::error::{Error, Result};
use crate::object::{Detached, Epoch, ObjectTable, RegionRef};
use crate::scope::{self, ContextId};
use crate::task::{self, Unblock};

/// Region identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub u64);

impl RegionId {
    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region#{}", self.0)
    }
}

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

fn next_region_id() -> RegionId {
    RegionId(NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed))
}

/// The variant of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// A plain scoped region backed by its own store from the global pool.
    Generic,
    /// A scoped region whose reclamation can be deferred by pinning.
    Pinnable,
    /// A stacked region owning a store carved from its construction context.
    StackedHost,
    /// A stacked region borrowing the store of its construction context.
    StackedGuest,
}

impl RegionKind {
    /// Whether this is a host or guest stacked region.
    pub fn is_stacked(&self) -> bool {
        matches!(self, RegionKind::StackedHost | RegionKind::StackedGuest)
    }

    /// Whether the region can be pinned.
    pub fn is_pinnable(&self) -> bool {
        matches!(self, RegionKind::Pinnable)
    }
}

/// What a reclamation freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimStats {
    /// The reclaimed region.
    pub region: RegionId,
    /// Objects dropped.
    pub objects: usize,
    /// Object-area bytes returned to the cursor.
    pub bytes: usize,
    /// Regions retired because they were created in this context.
    pub retired: usize,
}

/// A point-in-time snapshot of a region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionStats {
    /// Region ID.
    pub id: RegionId,
    /// Region variant.
    pub kind: RegionKind,
    /// Recorded parent, if bound.
    pub parent: Option<ContextId>,
    /// Number of tasks that have the region entered.
    pub reference_count: usize,
    /// Pin count (always zero for non-pinnable regions).
    pub pin_count: usize,
    /// Object area size.
    pub size: usize,
    /// Object area bytes in use.
    pub consumed: usize,
    /// Current epoch.
    pub epoch: Epoch,
    /// Live child regions.
    pub children: usize,
    /// Whether the region has returned its storage.
    pub retired: bool,
}

pub(crate) type Logic = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// Contents detached under the state lock, dropped after it is released.
pub(crate) struct Teardown {
    detached: Detached,
    owned: Vec<Arc<RegionShared>>,
}
type ReclaimHook = Arc<dyn Fn(&ReclaimStats) + Send + Sync>;

/// A region's object area carve.
pub(crate) struct Backing {
    /// The store the area was carved from. Owned for hosts and generic
    /// regions, shared with the construction context for guests.
    pub(crate) store: Arc<BackingStore>,
    pub(crate) area: Carve,
    /// For guests, the stacked region whose guest slot this region holds.
    pub(crate) host: Option<Weak<RegionShared>>,
}

pub(crate) struct RegionState {
    pub(crate) parent: Option<ContextId>,
    pub(crate) ref_count: usize,
    pub(crate) pin_count: usize,
    zero_epoch: u64,
    retired: bool,
    retire_on_reclaim: bool,
    tickets: VecDeque<u64>,
    next_ticket: u64,
    granted: Option<u64>,
    children: Vec<Weak<RegionShared>>,
    owned: Vec<Arc<RegionShared>>,
    pub(crate) backing: Option<Backing>,
    pub(crate) guest: Option<Weak<RegionShared>>,
}

impl RegionState {
    pub(crate) fn is_retired(&self) -> bool {
        self.retired
    }

    pub(crate) fn has_live_guest(&self) -> bool {
        self.guest
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|g| !g.state.lock().retired)
    }

    /// Record `child` as created in this context, and as a child when its
    /// parent is this region.
    pub(crate) fn adopt(&mut self, child: &Arc<RegionShared>, is_child: bool) {
        self.owned.push(Arc::clone(child));
        if is_child {
            self.children.retain(|w| w.strong_count() > 0);
            self.children.push(Arc::downgrade(child));
        }
    }
}

pub(crate) struct RegionShared {
    id: RegionId,
    kind: RegionKind,
    pub(crate) state: Mutex<RegionState>,
    pub(crate) objects: Mutex<ObjectTable>,
    zero: Condvar,
    logic: Mutex<Option<Logic>>,
    on_reclaim: Mutex<Option<ReclaimHook>>,
}

impl RegionShared {
    pub(crate) fn build(kind: RegionKind, backing: Backing, parent: Option<ContextId>) -> Arc<Self> {
        let size = backing.area.len();
        Arc::new(Self {
            id: next_region_id(),
            kind,
            state: Mutex::new(RegionState {
                parent,
                ref_count: 0,
                pin_count: 0,
                zero_epoch: 0,
                retired: false,
                retire_on_reclaim: false,
                tickets: VecDeque::new(),
                next_ticket: 0,
                granted: None,
                children: Vec::new(),
                owned: Vec::new(),
                backing: Some(backing),
                guest: None,
            }),
            objects: Mutex::new(ObjectTable::new(size)),
            zero: Condvar::new(),
            logic: Mutex::new(None),
            on_reclaim: Mutex::new(None),
        })
    }

    pub(crate) fn id(&self) -> RegionId {
        self.id
    }

    /// Check (and on first entry record) the caller's context as parent.
    ///
    /// Returns whether the parent was recorded by this call.
    fn bind_parent(&self, st: &mut RegionState, ctx: ContextId) -> Result<bool> {
        if self.kind.is_stacked() {
            let expected = st.parent.unwrap_or(ContextId::Heap);
            if expected != ctx {
                return Err(Error::WrongContext {
                    region: self.id,
                    expected,
                    current: ctx,
                });
            }
            return Ok(false);
        }

        match st.parent {
            None => {
                st.parent = Some(ctx);
                Ok(true)
            }
            Some(recorded) if recorded == ctx => Ok(false),
            Some(recorded) => Err(Error::CyclicScope {
                region: self.id,
                recorded,
                current: ctx,
            }),
        }
    }

    /// Check the parent rule without recording anything.
    fn check_parent(&self, st: &RegionState, ctx: ContextId) -> Result<()> {
        match st.parent {
            Some(recorded) if recorded != ctx => {
                if self.kind.is_stacked() {
                    Err(Error::WrongContext {
                        region: self.id,
                        expected: recorded,
                        current: ctx,
                    })
                } else {
                    Err(Error::CyclicScope {
                        region: self.id,
                        recorded,
                        current: ctx,
                    })
                }
            }
            _ => Ok(()),
        }
    }

    /// Drop one entry; reclaim when this was the last one.
    ///
    /// The contents are detached in the same critical section as the
    /// transition to zero, so each transition reclaims exactly once. A queued
    /// `join_and_enter` ticket is granted only after the teardown finishes.
    pub(crate) fn release_entry(self: &Arc<Self>) {
        let teardown = {
            let mut st = self.state.lock();
            st.ref_count -= 1;
            if st.ref_count > 0 {
                return;
            }

            st.zero_epoch += 1;
            let teardown = if st.pin_count == 0 && !st.retired {
                Some(self.detach_contents(&mut st))
            } else {
                self.grant_front(&mut st);
                None
            };
            self.zero.notify_all();
            teardown
        };

        if let Some(teardown) = teardown {
            self.complete_teardown(teardown);
        }
    }

    /// Hand the region to the oldest queued `join_and_enter` caller.
    fn grant_front(&self, st: &mut RegionState) {
        if st.retired || st.ref_count > 0 {
            return;
        }
        if let Some(ticket) = st.tickets.pop_front() {
            st.granted = Some(ticket);
            st.ref_count = 1;
            debug!(region = %self.id, ticket, "granted join ticket");
            self.zero.notify_all();
        }
    }

    /// Detach objects and owned regions; the epoch advances.
    pub(crate) fn detach_contents(&self, st: &mut RegionState) -> Teardown {
        Teardown {
            detached: self.objects.lock().take_all(),
            owned: std::mem::take(&mut st.owned),
        }
    }

    /// Finish a reclamation, then admit the next queued waiter.
    pub(crate) fn complete_teardown(self: &Arc<Self>, teardown: Teardown) -> ReclaimStats {
        let stats = self.finish_reclaim(teardown);
        let mut st = self.state.lock();
        self.grant_front(&mut st);
        stats
    }

    /// Tear the contents down if the region is unentered and unpinned.
    pub(crate) fn reclaim_now(self: &Arc<Self>) -> Result<ReclaimStats> {
        let teardown = {
            let mut st = self.state.lock();
            if st.retired {
                return Err(Error::RegionRetired { region: self.id });
            }
            if st.ref_count > 0 || st.pin_count > 0 {
                return Err(Error::RegionInUse {
                    region: self.id,
                    ref_count: st.ref_count,
                    pin_count: st.pin_count,
                });
            }
            self.detach_contents(&mut st)
        };
        Ok(self.complete_teardown(teardown))
    }

    fn finish_reclaim(self: &Arc<Self>, teardown: Teardown) -> ReclaimStats {
        let Teardown { detached, owned } = teardown;
        let objects = detached.len();
        let bytes = detached.bytes;
        drop(detached);

        let mut retired = 0;
        for child in owned.into_iter().rev() {
            retired += child.retire(false);
        }

        let stats = ReclaimStats {
            region: self.id,
            objects,
            bytes,
            retired,
        };
        info!(region = %self.id, objects, bytes, retired, "reclaimed region");

        let hook = self.on_reclaim.lock().clone();
        if let Some(hook) = hook {
            hook(&stats);
        }

        let retire_after = self.state.lock().retire_on_reclaim;
        if retire_after {
            self.retire(false);
        }
        stats
    }

    /// Return the backing storage; the region becomes unusable.
    ///
    /// An entered or pinned region is marked and retired when it is next
    /// reclaimed, unless `force` is set. Returns the number of regions
    /// retired, nested ones included.
    pub(crate) fn retire(&self, force: bool) -> usize {
        let (backing, owned, detached) = {
            let mut st = self.state.lock();
            if st.retired {
                return 0;
            }
            if !force && (st.ref_count > 0 || st.pin_count > 0) {
                st.retire_on_reclaim = true;
                return 0;
            }
            st.retired = true;
            st.tickets.clear();
            self.zero.notify_all();
            let detached = self.objects.lock().take_all();
            (st.backing.take(), std::mem::take(&mut st.owned), detached)
        };

        drop(detached);
        let mut retired = 1;
        for child in owned.into_iter().rev() {
            retired += child.retire(true);
        }

        if let Some(backing) = backing {
            if let Err(e) = backing.store.release(backing.area) {
                warn!(region = %self.id, error = %e, "object area released out of order");
            }
            if let Some(host) = backing.host.as_ref().and_then(Weak::upgrade) {
                let mut host_st = host.state.lock();
                let holds_slot = host_st
                    .guest
                    .as_ref()
                    .is_some_and(|g| std::ptr::eq(g.as_ptr(), self));
                if holds_slot {
                    host_st.guest = None;
                }
            }
        }

        debug!(region = %self.id, retired, "retired region");
        retired
    }

    fn default_join_timeout() -> Option<Duration> {
        crate::runtime_config().and_then(|c| c.interrupt.join_timeout)
    }
}

impl Unblock for RegionShared {
    fn unblock(&self) {
        let _st = self.state.lock();
        self.zero.notify_all();
    }
}

impl Drop for RegionShared {
    fn drop(&mut self) {
        self.retire(true);
    }
}

/// Restores the scope stack and the reference count when an entry ends.
pub(crate) struct EntryGuard {
    region: Region,
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        scope::pop(self.region.id());
        debug!(region = %self.region.id(), "exit region");
        self.region.shared.release_entry();
    }
}

/// A handle to a region.
///
/// Handles are cheap to clone. A region created in another region's
/// allocation context lives until that context is reclaimed; a region created
/// in the heap context lives until its last handle is dropped.
#[derive(Clone)]
pub struct Region {
    pub(crate) shared: Arc<RegionShared>,
}

impl Region {
    /// Create a generic region with an object area of `size` bytes.
    ///
    /// The backing store is reserved from the global pool.
    pub fn new(size: usize) -> Result<Self> {
        Self::from_pool(RegionKind::Generic, size)
    }

    pub(crate) fn from_pool(kind: RegionKind, size: usize) -> Result<Self> {
        check_size(size)?;
        let store = global_pool().reserve(size)?;
        let area = store.sub_reserve(End::Bottom, size)?;
        let shared = RegionShared::build(
            kind,
            Backing {
                store,
                area,
                host: None,
            },
            None,
        );
        Ok(Self::adopt(shared, false))
    }

    /// Register a freshly built region with the caller's allocation context.
    pub(crate) fn adopt(shared: Arc<RegionShared>, is_child: bool) -> Self {
        if let Some(ctx) = scope::current() {
            ctx.shared.state.lock().adopt(&shared, is_child);
        }
        debug!(region = %shared.id, kind = ?shared.kind, "created region");
        Self { shared }
    }

    /// Bind the logic run by [`Region::enter_bound`].
    pub fn bind_logic<F>(&self, logic: F)
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        *self.shared.logic.lock() = Some(Arc::new(logic));
    }

    /// Builder form of [`Region::bind_logic`].
    pub fn with_logic<F>(self, logic: F) -> Self
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        self.bind_logic(logic);
        self
    }

    /// Install the hook run after each reclamation.
    pub fn on_reclaim<F>(&self, hook: F)
    where
        F: Fn(&ReclaimStats) + Send + Sync + 'static,
    {
        *self.shared.on_reclaim.lock() = Some(Arc::new(hook));
    }

    fn bound_logic(&self) -> Result<Logic> {
        self.shared.logic.lock().clone().ok_or_else(|| {
            Error::InvalidArgument(format!("{} has no bound logic", self.shared.id))
        })
    }

    /// Get the region ID.
    pub fn id(&self) -> RegionId {
        self.shared.id
    }

    /// Get the region variant.
    pub fn kind(&self) -> RegionKind {
        self.shared.kind
    }

    /// The recorded parent, or `None` before the first entry.
    pub fn parent_id(&self) -> Option<ContextId> {
        self.shared.state.lock().parent
    }

    /// Number of tasks that currently have the region entered.
    pub fn reference_count(&self) -> usize {
        self.shared.state.lock().ref_count
    }

    /// Object area size in bytes.
    pub fn size(&self) -> usize {
        self.shared.objects.lock().capacity()
    }

    /// Object area bytes in use.
    pub fn memory_consumed(&self) -> usize {
        self.shared.objects.lock().used()
    }

    /// Object area bytes still free.
    pub fn memory_remaining(&self) -> usize {
        self.shared.objects.lock().remaining()
    }

    /// Whether the region has returned its backing storage.
    pub fn is_retired(&self) -> bool {
        self.shared.state.lock().retired
    }

    /// Whether two handles refer to the same region.
    pub fn ptr_eq(&self, other: &Region) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Snapshot the region's state.
    pub fn stats(&self) -> RegionStats {
        let st = self.shared.state.lock();
        let objects = self.shared.objects.lock();
        RegionStats {
            id: self.shared.id,
            kind: self.shared.kind,
            parent: st.parent,
            reference_count: st.ref_count,
            pin_count: st.pin_count,
            size: objects.capacity(),
            consumed: objects.used(),
            epoch: objects.epoch(),
            children: st.children.iter().filter(|w| w.strong_count() > 0).count(),
            retired: st.retired,
        }
    }

    // ------------------------------------------------------------------
    // Entry
    // ------------------------------------------------------------------

    /// Enter the region and run `logic` with it as the allocation context.
    ///
    /// The scope stack and the reference count are restored on every exit
    /// path, unwinding included. When this task's exit leaves the region
    /// unentered (and unpinned), it is reclaimed before `enter` returns.
    pub fn enter<T>(&self, logic: impl FnOnce() -> Result<T>) -> Result<T> {
        let _entry = self.acquire()?;
        logic()
    }

    /// Enter the region and run its bound logic.
    pub fn enter_bound(&self) -> Result<()> {
        let logic = self.bound_logic()?;
        self.enter(|| logic())
    }

    fn acquire(&self) -> Result<EntryGuard> {
        let ctx = scope::current_context();
        let newly_bound = {
            let mut st = self.shared.state.lock();
            if st.retired {
                return Err(Error::RegionRetired {
                    region: self.shared.id,
                });
            }
            let newly = self.shared.bind_parent(&mut st, ctx)?;
            st.ref_count += 1;
            newly
        };
        Ok(self.finish_entry(newly_bound))
    }

    fn finish_entry(&self, newly_bound: bool) -> EntryGuard {
        if newly_bound {
            if let Some(parent) = scope::current() {
                let mut pst = parent.shared.state.lock();
                pst.children.retain(|w| w.strong_count() > 0);
                pst.children.push(Arc::downgrade(&self.shared));
            }
        }
        debug!(region = %self.shared.id, depth = scope::depth() + 1, "enter region");
        scope::push(self.clone());
        EntryGuard {
            region: self.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Waiting
    // ------------------------------------------------------------------

    /// A timeout too large to express as an instant waits without one.
    fn deadline(timeout: Option<Duration>) -> Option<Instant> {
        timeout
            .or_else(RegionShared::default_join_timeout)
            .and_then(|t| Instant::now().checked_add(t))
    }

    fn reject_self_wait(&self) -> Result<()> {
        if scope::contains(self.shared.id) {
            return Err(Error::InvalidArgument(format!(
                "{} is on the caller's scope stack; waiting on it would never finish",
                self.shared.id
            )));
        }
        Ok(())
    }

    fn wait_guard(&self) -> (Arc<task::TaskShared>, task::BlockerGuard) {
        let task = task::current_shared();
        let blocker: Weak<dyn Unblock> = Arc::downgrade(&self.shared) as Weak<dyn Unblock>;
        let guard = task.block_on(blocker);
        (task, guard)
    }

    fn wait_on(&self, st: &mut MutexGuard<'_, RegionState>, deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => {
                self.shared.zero.wait_until(st, deadline);
            }
            None => self.shared.zero.wait(st),
        }
    }

    /// Wait until no task has the region entered.
    ///
    /// Returns `true` when the count reached zero (or a transition to zero
    /// was observed) and `false` when the timeout elapsed first. A `None`
    /// timeout falls back to the configured default, then to waiting
    /// indefinitely.
    pub fn join(&self, timeout: Option<Duration>) -> Result<bool> {
        self.reject_self_wait()?;
        let deadline = Self::deadline(timeout);
        let (task, _blocked) = self.wait_guard();

        let mut st = self.shared.state.lock();
        let seen = st.zero_epoch;
        loop {
            if st.ref_count == 0 || st.zero_epoch != seen || st.retired {
                return Ok(true);
            }
            if let Some(interrupted) = task.pending_deliverable() {
                debug!(region = %self.shared.id, "join interrupted");
                return Err(Error::Interrupted(interrupted));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(false);
            }
            self.wait_on(&mut st, deadline);
        }
    }

    /// Wait until the region is unentered, then enter it and run `logic`.
    ///
    /// No other entry can intervene between the count reaching zero and this
    /// entry. Waiters are released one per transition to zero, in arrival
    /// order. On timeout the region is not entered and
    /// [`Error::JoinTimedOut`] is returned.
    pub fn join_and_enter<T>(
        &self,
        logic: impl FnOnce() -> Result<T>,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let _entry = self.acquire_after_join(timeout)?;
        logic()
    }

    /// [`Region::join_and_enter`] with the bound logic.
    pub fn join_and_enter_bound(&self, timeout: Option<Duration>) -> Result<()> {
        let logic = self.bound_logic()?;
        self.join_and_enter(|| logic(), timeout)
    }

    fn acquire_after_join(&self, timeout: Option<Duration>) -> Result<EntryGuard> {
        self.reject_self_wait()?;
        let ctx = scope::current_context();
        let start = Instant::now();
        let deadline = Self::deadline(timeout);
        let (task, _blocked) = self.wait_guard();

        let mut st = self.shared.state.lock();
        if st.retired {
            return Err(Error::RegionRetired {
                region: self.shared.id,
            });
        }
        self.shared.check_parent(&st, ctx)?;

        if st.ref_count == 0 && st.tickets.is_empty() {
            let newly = self.shared.bind_parent(&mut st, ctx)?;
            st.ref_count = 1;
            drop(st);
            return Ok(self.finish_entry(newly));
        }

        let ticket = st.next_ticket;
        st.next_ticket += 1;
        st.tickets.push_back(ticket);
        debug!(region = %self.shared.id, ticket, "queued for join-and-enter");

        loop {
            if st.granted == Some(ticket) {
                st.granted = None;
                break;
            }

            let failure = if st.retired {
                Some(Error::RegionRetired {
                    region: self.shared.id,
                })
            } else if let Some(interrupted) = task.pending_deliverable() {
                Some(Error::Interrupted(interrupted))
            } else if deadline.is_some_and(|d| Instant::now() >= d) {
                Some(Error::JoinTimedOut {
                    region: self.shared.id,
                    waited: start.elapsed(),
                })
            } else {
                None
            };

            if let Some(err) = failure {
                st.tickets.retain(|t| *t != ticket);
                return Err(err);
            }
            self.wait_on(&mut st, deadline);
        }

        // The grant already counted this entry.
        match self.shared.bind_parent(&mut st, ctx) {
            Ok(newly) => {
                drop(st);
                Ok(self.finish_entry(newly))
            }
            Err(e) => {
                drop(st);
                self.shared.release_entry();
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Reclamation and children
    // ------------------------------------------------------------------

    /// Reclaim the region now.
    ///
    /// Fails with [`Error::RegionInUse`] while it is entered or pinned.
    pub fn reclaim(&self) -> Result<ReclaimStats> {
        self.shared.reclaim_now()
    }

    /// Visit the live regions whose recorded parent is this region.
    ///
    /// Each child is visited at most once. Children retired before the
    /// visitor reaches them are skipped. A `Break` from the visitor stops
    /// the traversal and is returned.
    pub fn visit_children<B>(
        &self,
        mut visitor: impl FnMut(&Region) -> ControlFlow<B>,
    ) -> ControlFlow<B> {
        let snapshot: Vec<Arc<RegionShared>> = {
            let mut st = self.shared.state.lock();
            st.children.retain(|w| w.strong_count() > 0);
            st.children.iter().filter_map(Weak::upgrade).collect()
        };

        for shared in snapshot {
            if shared.state.lock().retired {
                continue;
            }
            visitor(&Region { shared })?;
        }
        ControlFlow::Continue(())
    }

    // ------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------

    fn require_in_scope(&self) -> Result<()> {
        if !scope::contains(self.shared.id) {
            return Err(Error::NotInScope {
                region: self.shared.id,
            });
        }
        Ok(())
    }

    fn store<T: Any + Send + Sync>(&self, value: T, size: usize, align: usize) -> Result<RegionRef<T>> {
        self.require_in_scope()?;
        let (index, epoch) = self
            .shared
            .objects
            .lock()
            .push(Box::new(value), size, align)?;
        Ok(RegionRef::new(
            Arc::downgrade(&self.shared),
            self.shared.id,
            index,
            epoch,
        ))
    }

    /// Allocate `value` in the region's object area.
    ///
    /// Charges `size_of::<T>()` at `T`'s alignment. The caller must have the
    /// region on its scope stack.
    pub fn alloc<T: Any + Send + Sync>(&self, value: T) -> Result<RegionRef<T>> {
        self.store(value, std::mem::size_of::<T>(), std::mem::align_of::<T>())
    }

    /// Allocate a zeroed byte buffer of `len` bytes.
    pub fn alloc_bytes(&self, len: usize) -> Result<RegionRef<Vec<u8>>> {
        let remaining = self.memory_remaining();
        if len > remaining {
            return Err(Error::OutOfBackingStore {
                requested: len,
                available: remaining,
            });
        }
        self.store(vec![0u8; len], len, 1)
    }

    /// Publish `object` as the region's portal.
    pub fn set_portal<T: Any + Send + Sync>(&self, object: &RegionRef<T>) -> Result<()> {
        self.require_in_scope()?;
        if object.region_id() != self.shared.id {
            return Err(Error::InvalidArgument(format!(
                "portal object lives in {}, not {}",
                object.region_id(),
                self.shared.id
            )));
        }
        self.shared
            .objects
            .lock()
            .set_portal(self.shared.id, object.index(), object.epoch())
    }

    /// The region's portal, if one is set.
    ///
    /// Fails with [`Error::TypeMismatch`] when the portal holds another type.
    pub fn portal<T: Any + Send + Sync>(&self) -> Result<Option<RegionRef<T>>> {
        let objects = self.shared.objects.lock();
        let epoch = objects.epoch();
        Ok(objects.portal::<T>(self.shared.id)?.map(|index| {
            RegionRef::new(Arc::downgrade(&self.shared), self.shared.id, index, epoch)
        }))
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.shared.id)
            .field("kind", &self.shared.kind)
            .finish()
    }
}

impl PartialEq for Region {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Region {}

/// Reject sizes above the configured region limit.
pub(crate) fn check_size(size: usize) -> Result<()> {
    let limit = crate::runtime_config()
        .map(|c| c.memory.max_region_size)
        .unwrap_or_else(|| crate::config::MemoryConfig::default().max_region_size);
    if size > limit {
        return Err(Error::InvalidArgument(format!(
            "region size {} exceeds the limit of {} bytes",
            size, limit
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_enter_binds_parent_and_counts() {
        let region = Region::new(1024).unwrap();
        assert_eq!(region.parent_id(), None);
        assert_eq!(region.reference_count(), 0);

        let inside = region
            .enter(|| {
                assert_eq!(scope::current_context(), ContextId::Region(region.id()));
                Ok(region.reference_count())
            })
            .unwrap();
        assert_eq!(inside, 1);
        assert_eq!(region.reference_count(), 0);
        assert_eq!(region.parent_id(), Some(ContextId::Heap));
        assert_eq!(scope::current_context(), ContextId::Heap);
    }

    #[test]
    fn test_cyclic_scope_rejected() {
        let outer = Region::new(1024).unwrap();
        let inner = Region::new(1024).unwrap();

        outer
            .enter(|| inner.enter(|| Ok(())))
            .unwrap();
        assert_eq!(inner.parent_id(), Some(ContextId::Region(outer.id())));

        // Entering from the heap now gives the region a second parent.
        let err = inner.enter(|| Ok(())).unwrap_err();
        assert!(matches!(err, Error::CyclicScope { .. }));
        assert_eq!(inner.reference_count(), 0);

        // A region cannot be entered into its own subtree.
        let err = outer
            .enter(|| inner.enter(|| outer.enter(|| Ok(()))))
            .unwrap_err();
        assert!(matches!(err, Error::CyclicScope { .. }));
    }

    #[test]
    fn test_alloc_requires_scope() {
        let region = Region::new(256).unwrap();
        assert!(matches!(region.alloc(1u32), Err(Error::NotInScope { .. })));

        let handle = region
            .enter(|| {
                let h = region.alloc(41u64)?;
                h.update(|v| *v += 1)?;
                assert_eq!(h.get()?, 42);
                assert_eq!(region.memory_consumed(), 8);
                Ok(h)
            })
            .unwrap();

        // The exit reclaimed the contents.
        assert_eq!(region.memory_consumed(), 0);
        assert!(matches!(handle.get(), Err(Error::StaleReference(_))));
    }

    #[test]
    fn test_alloc_out_of_space() {
        let region = Region::new(16).unwrap();
        region
            .enter(|| {
                region.alloc(0u64)?;
                region.alloc(0u64)?;
                let err = region.alloc(0u8).unwrap_err();
                assert!(matches!(err, Error::OutOfBackingStore { .. }));
                assert!(region.alloc_bytes(1).is_err());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_portal_lifecycle() {
        let region = Region::new(256).unwrap();
        region
            .enter(|| {
                let obj = region.alloc(String::from("portal"))?;
                region.set_portal(&obj)?;
                let back = region.portal::<String>()?.expect("portal set");
                assert_eq!(back.get()?, "portal");
                assert!(matches!(
                    region.portal::<u32>(),
                    Err(Error::TypeMismatch { .. })
                ));
                Ok(())
            })
            .unwrap();
        assert!(region.portal::<String>().unwrap().is_none());
    }

    #[test]
    fn test_reclaim_hook_and_stats() {
        let region = Region::new(256).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        region.on_reclaim(move |stats| {
            assert_eq!(stats.objects, 2);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        region
            .enter(|| {
                region.alloc(1u32)?;
                region.alloc(2u32)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(region.stats().epoch, crate::object::FIRST_EPOCH + 1);
    }

    #[test]
    fn test_explicit_reclaim_in_use() {
        let region = Region::new(128).unwrap();
        region
            .enter(|| {
                let err = region.reclaim().unwrap_err();
                assert!(matches!(err, Error::RegionInUse { ref_count: 1, .. }));
                Ok(())
            })
            .unwrap();
        let stats = region.reclaim().unwrap();
        assert_eq!(stats.objects, 0);
    }

    #[test]
    fn test_bound_logic() {
        let region = Region::new(128).unwrap();
        assert!(matches!(
            region.enter_bound(),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            region.join_and_enter_bound(Some(Duration::from_millis(1))),
            Err(Error::InvalidArgument(_))
        ));

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let region = region.with_logic(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        region.enter_bound().unwrap();
        region.join_and_enter_bound(None).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_count_restored_on_error_and_panic() {
        let region = Region::new(128).unwrap();
        let err = region
            .enter(|| -> Result<()> { Err(Error::InvalidArgument("boom".into())) })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(region.reference_count(), 0);

        let r = region.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            r.enter(|| -> Result<()> { panic!("logic failed") })
        }));
        assert!(result.is_err());
        assert_eq!(region.reference_count(), 0);
        assert_eq!(scope::depth(), 0);
    }

    #[test]
    fn test_children_retired_with_parent_context() {
        let parent = Region::new(512).unwrap();
        let child = parent
            .enter(|| {
                let child = Region::new(64)?;
                child.enter(|| Ok(()))?;
                let mut visited = Vec::new();
                let _ = parent.visit_children(|r| {
                    visited.push(r.id());
                    ControlFlow::<()>::Continue(())
                });
                assert_eq!(visited, vec![child.id()]);
                Ok(child)
            })
            .unwrap();

        assert!(child.is_retired());
        assert!(matches!(
            child.enter(|| Ok(())),
            Err(Error::RegionRetired { .. })
        ));
        let none = parent.visit_children(|_| ControlFlow::Break(()));
        assert_eq!(none, ControlFlow::Continue(()));
    }

    #[test]
    fn test_visit_children_break() {
        let parent = Region::new(512).unwrap();
        parent
            .enter(|| {
                for _ in 0..3 {
                    let child = Region::new(32)?;
                    child.enter(|| Ok(()))?;
                }
                let mut count = 0;
                let flow = parent.visit_children(|r| {
                    count += 1;
                    ControlFlow::Break(r.id())
                });
                assert!(matches!(flow, ControlFlow::Break(_)));
                assert_eq!(count, 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_join_unentered_returns_immediately() {
        let region = Region::new(64).unwrap();
        assert!(region.join(Some(Duration::from_millis(1))).unwrap());
    }

    #[test]
    fn test_join_times_out_while_entered() {
        let region = Region::new(64).unwrap();
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(0);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);

        let r = region.clone();
        let holder = std::thread::spawn(move || {
            r.enter(|| {
                entered_tx.send(()).unwrap();
                done_rx.recv().unwrap();
                Ok(())
            })
            .unwrap();
        });

        entered_rx.recv().unwrap();
        assert!(!region.join(Some(Duration::from_millis(20))).unwrap());
        let err = region
            .join_and_enter(|| Ok(()), Some(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, Error::JoinTimedOut { .. }));

        done_tx.send(()).unwrap();
        assert!(region.join(None).unwrap());
        holder.join().unwrap();
        assert_eq!(region.reference_count(), 0);
    }

    #[test]
    fn test_unbounded_timeouts_do_not_overflow() {
        let region = Region::new(64).unwrap();
        assert!(region.join(Some(Duration::MAX)).unwrap());
        let value = region.join_and_enter(|| Ok(3), Some(Duration::MAX)).unwrap();
        assert_eq!(value, 3);

        let (entered_tx, entered_rx) = crossbeam_channel::bounded(0);
        let r = region.clone();
        let holder = std::thread::spawn(move || {
            r.enter(|| {
                entered_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(10));
                Ok(())
            })
            .unwrap();
        });
        entered_rx.recv().unwrap();
        assert!(region.join(Some(Duration::MAX)).unwrap());
        holder.join().unwrap();
    }

    #[test]
    fn test_each_zero_transition_reclaims_once() {
        let region = Region::new(4096).unwrap();
        let hooks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hooks);
        region.on_reclaim(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let r = region.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        r.enter(|| r.alloc(1u8).map(drop)).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let transitions = region.shared.state.lock().zero_epoch;
        assert!(transitions > 0);
        assert_eq!(hooks.load(Ordering::SeqCst) as u64, transitions);
        assert_eq!(region.memory_consumed(), 0);
        assert_eq!(region.reference_count(), 0);
    }

    #[test]
    fn test_join_on_own_scope_rejected() {
        let region = Region::new(64).unwrap();
        region
            .enter(|| {
                assert!(matches!(
                    region.join(Some(Duration::from_millis(1))),
                    Err(Error::InvalidArgument(_))
                ));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_size_limit() {
        assert!(matches!(
            Region::new(usize::MAX / 2),
            Err(Error::InvalidArgument(_))
        ));
    }
}
