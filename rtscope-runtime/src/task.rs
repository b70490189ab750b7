//! Task identity and per-task interrupt state.
//!
//! Every OS thread that touches the runtime is a task. A task owns:
//!
//! - the pending-interrupt slot, holding at most one request together with
//!   the frame depth it targets;
//! - its current interrupt frame depth;
//! - a deferral counter that suppresses delivery at checkpoints;
//! - a park point used by interruptible sleeps, plus the blocker it is
//!   currently waiting on so a fired interrupt can wake it.
//!
//! [`Task`] is a cheap clonable handle that other threads use to interrupt
//! the task.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::{Error, Result};
use crate::interrupt::{AsyncInterrupt, InterruptShared, Interrupted, GENERIC_DEPTH};

/// Task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl TaskId {
    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Something a task can block on and be woken from.
pub(crate) trait Unblock: Send + Sync {
    fn unblock(&self);
}

/// The request held in a task's pending slot.
pub(crate) struct PendingInterrupt {
    pub(crate) interrupt: Arc<InterruptShared>,
    pub(crate) depth: u32,
}

pub(crate) struct TaskShared {
    id: TaskId,
    name: Option<String>,
    pending: Mutex<Option<PendingInterrupt>>,
    frame_depth: AtomicU32,
    deferred: AtomicU32,
    park: Mutex<()>,
    park_cv: Condvar,
    blocker: Mutex<Option<Weak<dyn Unblock>>>,
}

impl TaskShared {
    fn for_current_thread() -> Self {
        Self {
            id: TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)),
            name: std::thread::current().name().map(str::to_owned),
            pending: Mutex::new(None),
            frame_depth: AtomicU32::new(0),
            deferred: AtomicU32::new(0),
            park: Mutex::new(()),
            park_cv: Condvar::new(),
            blocker: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn frame_depth(&self) -> u32 {
        self.frame_depth.load(Ordering::Acquire)
    }

    /// Enter a frame; returns the new depth.
    pub(crate) fn push_frame(&self) -> u32 {
        self.frame_depth.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn pop_frame(&self) {
        self.frame_depth.fetch_sub(1, Ordering::AcqRel);
    }

    /// Record a request if it outranks whatever is pending.
    ///
    /// Accepted when nothing is pending or `depth` is strictly shallower than
    /// the pending request. The caller wakes the task after releasing its own
    /// locks.
    pub(crate) fn offer(&self, interrupt: &Arc<InterruptShared>, depth: u32) -> bool {
        let mut pending = self.pending.lock();
        let accept = match pending.as_ref() {
            None => true,
            Some(current) => depth < current.depth,
        };
        trace!(
            task = %self.id,
            interrupt = %interrupt.id(),
            depth,
            pending_depth = pending.as_ref().map(|p| p.depth),
            accept,
            "interrupt arbitration"
        );
        if accept {
            *pending = Some(PendingInterrupt {
                interrupt: Arc::clone(interrupt),
                depth,
            });
        }
        accept
    }

    /// Clear the pending slot if it holds `interrupt`.
    pub(crate) fn clear_if(&self, interrupt: &InterruptShared) -> bool {
        let mut pending = self.pending.lock();
        match pending.as_ref() {
            Some(p) if p.interrupt.id() == interrupt.id() => {
                *pending = None;
                true
            }
            _ => false,
        }
    }

    /// The pending request as an error value, ignoring deferral and disabling.
    pub(crate) fn pending_interrupted(&self) -> Option<Interrupted> {
        self.pending
            .lock()
            .as_ref()
            .map(|p| p.interrupt.interrupted(p.depth))
    }

    /// The pending request if it may be delivered at a checkpoint now.
    pub(crate) fn pending_deliverable(&self) -> Option<Interrupted> {
        if self.deferred.load(Ordering::Acquire) > 0 {
            return None;
        }
        let pending = self.pending.lock();
        pending
            .as_ref()
            .filter(|p| p.interrupt.is_enabled())
            .map(|p| p.interrupt.interrupted(p.depth))
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    pub(crate) fn defer(&self) {
        self.deferred.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn undefer(&self) {
        self.deferred.fetch_sub(1, Ordering::AcqRel);
    }

    /// Wake the task from a sleep or a region wait.
    pub(crate) fn wake(&self) {
        {
            let _park = self.park.lock();
            self.park_cv.notify_all();
        }
        let blocker = self.blocker.lock().as_ref().and_then(Weak::upgrade);
        if let Some(blocker) = blocker {
            blocker.unblock();
        }
    }

    /// Register what the task is about to block on.
    pub(crate) fn block_on(self: &Arc<Self>, blocker: Weak<dyn Unblock>) -> BlockerGuard {
        *self.blocker.lock() = Some(blocker);
        BlockerGuard {
            task: Arc::clone(self),
        }
    }

    /// Sleep until `deadline` unless a deliverable interrupt arrives first.
    ///
    /// With no deadline, only delivery ends the sleep.
    pub(crate) fn sleep_until(&self, deadline: Option<Instant>) -> Result<()> {
        let mut park = self.park.lock();
        loop {
            if let Some(interrupted) = self.pending_deliverable() {
                return Err(Error::Interrupted(interrupted));
            }
            match deadline {
                Some(deadline) if Instant::now() >= deadline => return Ok(()),
                Some(deadline) => {
                    self.park_cv.wait_until(&mut park, deadline);
                }
                None => self.park_cv.wait(&mut park),
            }
        }
    }
}

/// Clears the task's blocker on drop.
pub(crate) struct BlockerGuard {
    task: Arc<TaskShared>,
}

impl Drop for BlockerGuard {
    fn drop(&mut self) {
        *self.task.blocker.lock() = None;
    }
}

thread_local! {
    static CURRENT_TASK: Arc<TaskShared> = Arc::new(TaskShared::for_current_thread());
}

pub(crate) fn current_shared() -> Arc<TaskShared> {
    CURRENT_TASK.with(Arc::clone)
}

/// A handle to a task.
#[derive(Clone)]
pub struct Task {
    shared: Arc<TaskShared>,
}

impl Task {
    /// The calling thread's task.
    pub fn current() -> Self {
        Self {
            shared: current_shared(),
        }
    }

    /// Get the task ID.
    pub fn id(&self) -> TaskId {
        self.shared.id
    }

    /// Thread name at the time the task was first observed.
    pub fn name(&self) -> Option<&str> {
        self.shared.name.as_deref()
    }

    /// Number of interrupt frames the task is currently inside.
    pub fn frame_depth(&self) -> u32 {
        self.shared.frame_depth()
    }

    /// Whether an interrupt is pending for the task.
    pub fn has_pending(&self) -> bool {
        self.shared.has_pending()
    }

    /// Interrupt the task with the generic interrupt.
    ///
    /// The generic interrupt targets depth zero, so it outranks any
    /// frame-scoped request. Returns `false` when the task is not inside an
    /// interruptible frame or a generic request is already pending.
    pub fn interrupt(&self) -> bool {
        if self.shared.frame_depth() == 0 {
            return false;
        }
        let accepted = self
            .shared
            .offer(AsyncInterrupt::generic().shared(), GENERIC_DEPTH);
        if accepted {
            self.shared.wake();
        }
        accepted
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for Task {}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("frame_depth", &self.frame_depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_current_task_is_stable() {
        let a = Task::current();
        let b = Task::current();
        assert_eq!(a, b);
        assert_eq!(a.frame_depth(), 0);
    }

    #[test]
    fn test_tasks_differ_across_threads() {
        let here = Task::current().id();
        let there = std::thread::spawn(|| Task::current().id()).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_interrupt_without_frame_is_ignored() {
        let task = std::thread::spawn(Task::current).join().unwrap();
        assert!(!task.interrupt());
        assert!(!task.has_pending());
    }

    #[test]
    fn test_sleep_until_elapses() {
        let task = current_shared();
        let start = Instant::now();
        task.sleep_until(Some(start + Duration::from_millis(20))).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_thread_name_recorded() {
        let name = std::thread::Builder::new()
            .name("rt-worker".into())
            .spawn(|| Task::current().name().map(str::to_owned))
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(name.as_deref(), Some("rt-worker"));
    }
}
