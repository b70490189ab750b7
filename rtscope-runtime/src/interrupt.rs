//! # Asynchronous Interrupts
//!
//! An [`AsyncInterrupt`] protects one call at a time. Calling
//! [`AsyncInterrupt::do_interruptible`] opens an interrupt frame on the
//! calling task; while the frame is live, any task may [`fire`] the interrupt
//! to request that the protected call be abandoned.
//!
//! ## Arbitration
//!
//! Each task has one pending-interrupt slot. A request carries the depth of
//! the frame it targets and replaces the pending one only when it is strictly
//! shallower, so an interrupt aimed at an outer call beats one aimed at an
//! inner call and equal or deeper requests are dropped.
//!
//! ## Delivery
//!
//! A pending interrupt surfaces as [`Error::Interrupted`] at the task's
//! delivery points: [`check`], [`Frame::check`], [`Frame::sleep`] and the
//! region join family. Frames between the delivery point and the target
//! frame see it as an ordinary error and propagate it with `?`; the target
//! frame consumes it, runs [`Interruptible::interrupt_action`] and returns
//! [`Outcome::Interrupted`].
//!
//! Delivery is held while the interrupt is disabled and while the task is
//! inside [`deferred`]. [`AsyncInterrupt::throw_pending`] raises regardless.
//!
//! [`fire`]: AsyncInterrupt::fire

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::task::{self, TaskId, TaskShared};

/// Depth targeted by the generic interrupt; outranks every frame.
pub(crate) const GENERIC_DEPTH: u32 = 0;

/// Interrupt identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterruptId(pub u64);

impl fmt::Display for InterruptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interrupt#{}", self.0)
    }
}

static NEXT_INTERRUPT_ID: AtomicU64 = AtomicU64::new(1);

/// A delivered interrupt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interrupted {
    /// The interrupt that was fired.
    pub id: InterruptId,
    /// Its name, if it has one.
    pub name: Option<Arc<str>>,
    /// Depth of the frame the request targeted.
    pub depth: u32,
}

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({}) delivered at depth {}", self.id, name, self.depth),
            None => write!(f, "{} delivered at depth {}", self.id, self.depth),
        }
    }
}

impl std::error::Error for Interrupted {}

impl Interrupted {
    /// Whether this is the given interrupt.
    pub fn is(&self, interrupt: &AsyncInterrupt) -> bool {
        self.id == interrupt.id()
    }

    /// Whether this is the generic interrupt.
    pub fn is_generic(&self) -> bool {
        self.id == AsyncInterrupt::generic().id()
    }
}

/// Why [`AsyncInterrupt::do_interruptible`] refused to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The interrupt already has a live frame.
    AlreadyActive {
        /// Task that owns the live frame.
        owner: TaskId,
    },
    /// The generic interrupt cannot own a frame.
    Generic,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::AlreadyActive { owner } => {
                write!(f, "interrupt already protects a call on {}", owner)
            }
            Rejection::Generic => write!(f, "the generic interrupt cannot protect a call"),
        }
    }
}

/// Result of a protected call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The logic returned normally.
    Completed(T),
    /// The interrupt was delivered and the interrupt action ran.
    Interrupted(Interrupted),
    /// Nothing ran.
    Rejected(Rejection),
}

impl<T> Outcome<T> {
    /// Whether the logic returned normally.
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    /// Whether the call was cut short by the interrupt.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Outcome::Interrupted(_))
    }

    /// Whether the call was refused.
    pub fn is_rejected(&self) -> bool {
        matches!(self, Outcome::Rejected(_))
    }

    /// The completed value, if any.
    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(v) => Some(v),
            _ => None,
        }
    }
}

/// Logic protected by an interrupt.
pub trait Interruptible {
    /// Value produced on normal completion.
    type Output;

    /// The protected body.
    fn run(&mut self, frame: &Frame<'_>) -> Result<Self::Output>;

    /// Called once when the protecting interrupt is delivered.
    fn interrupt_action(&mut self, interrupted: &Interrupted) {
        let _ = interrupted;
    }
}

/// Closure adapter used by [`AsyncInterrupt::run`].
pub(crate) struct OnceLogic<F>(pub(crate) Option<F>);

impl<T, F> Interruptible for OnceLogic<F>
where
    F: FnOnce(&Frame<'_>) -> Result<T>,
{
    type Output = T;

    fn run(&mut self, frame: &Frame<'_>) -> Result<T> {
        match self.0.take() {
            Some(f) => f(frame),
            None => Err(Error::InvalidArgument("protected closure already ran".into())),
        }
    }
}

pub(crate) struct FrameSlot {
    task: Arc<TaskShared>,
    depth: u32,
    sequence: u64,
}

pub(crate) struct InterruptShared {
    id: InterruptId,
    name: Option<Arc<str>>,
    generic: bool,
    frame: Mutex<Option<FrameSlot>>,
    disable_depth: AtomicU32,
    sequence: AtomicU64,
}

impl InterruptShared {
    fn new(name: Option<Arc<str>>, generic: bool) -> Self {
        Self {
            id: InterruptId(NEXT_INTERRUPT_ID.fetch_add(1, Ordering::Relaxed)),
            name,
            generic,
            frame: Mutex::new(None),
            disable_depth: AtomicU32::new(0),
            sequence: AtomicU64::new(0),
        }
    }

    pub(crate) fn id(&self) -> InterruptId {
        self.id
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.disable_depth.load(Ordering::Acquire) == 0
    }

    pub(crate) fn interrupted(&self, depth: u32) -> Interrupted {
        Interrupted {
            id: self.id,
            name: self.name.clone(),
            depth,
        }
    }

    /// Offer a request to the frame owner.
    ///
    /// With `sequence` set, the request only applies to the frame opened
    /// with that sequence number.
    pub(crate) fn fire_sequence(self: &Arc<Self>, sequence: Option<u64>) -> bool {
        let (task, accepted) = {
            let slot = self.frame.lock();
            let Some(frame) = slot.as_ref() else {
                trace!(interrupt = %self.id, "fire with no frame");
                return false;
            };
            if sequence.is_some_and(|s| s != frame.sequence) {
                trace!(interrupt = %self.id, "fire for a finished frame");
                return false;
            }
            let accepted = frame.task.offer(self, frame.depth);
            (Arc::clone(&frame.task), accepted)
        };

        if accepted {
            debug!(interrupt = %self.id, task = %task.id(), "interrupt fired");
            task.wake();
        }
        accepted
    }

    /// Whether the calling task owns the live frame.
    fn owned_by_current(&self) -> bool {
        let me = task::current_shared().id();
        self.frame
            .lock()
            .as_ref()
            .is_some_and(|f| f.task.id() == me)
    }
}

/// Closes a frame on every exit path.
struct FrameGuard {
    interrupt: Arc<InterruptShared>,
    task: Arc<TaskShared>,
    sequence: u64,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        let mut slot = self.interrupt.frame.lock();
        if slot.as_ref().is_some_and(|f| f.sequence == self.sequence) {
            *slot = None;
        }
        self.interrupt.disable_depth.store(0, Ordering::Release);
        self.task.clear_if(&self.interrupt);
        drop(slot);
        self.task.pop_frame();
        trace!(interrupt = %self.interrupt.id, sequence = self.sequence, "frame closed");
    }
}

/// The live frame of a protected call.
pub struct Frame<'a> {
    interrupt: &'a AsyncInterrupt,
    task: Arc<TaskShared>,
    depth: u32,
    sequence: u64,
}

impl Frame<'_> {
    /// The interrupt protecting this frame.
    pub fn interrupt(&self) -> &AsyncInterrupt {
        self.interrupt
    }

    /// Nesting depth of this frame on its task, starting at one.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Invocation number of this frame for its interrupt.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Delivery point: fail with the pending interrupt if it is deliverable.
    pub fn check(&self) -> Result<()> {
        match self.task.pending_deliverable() {
            Some(interrupted) => Err(Error::Interrupted(interrupted)),
            None => Ok(()),
        }
    }

    /// Sleep for `duration`, waking early when an interrupt is delivered.
    ///
    /// A duration too large to express as a deadline sleeps until delivery.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        self.task.sleep_until(Instant::now().checked_add(duration))
    }
}

impl fmt::Debug for Frame<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("interrupt", &self.interrupt.id())
            .field("task", &self.task.id())
            .field("depth", &self.depth)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// An interrupt that can cut a protected call short.
#[derive(Clone)]
pub struct AsyncInterrupt {
    shared: Arc<InterruptShared>,
}

static GENERIC: OnceLock<AsyncInterrupt> = OnceLock::new();

impl Default for AsyncInterrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncInterrupt {
    /// Create an interrupt.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(InterruptShared::new(None, false)),
        }
    }

    /// Create a named interrupt. The name appears in logs and errors.
    pub fn named(name: impl Into<Arc<str>>) -> Self {
        Self {
            shared: Arc::new(InterruptShared::new(Some(name.into()), false)),
        }
    }

    /// The process-wide generic interrupt, delivered by [`Task::interrupt`].
    ///
    /// [`Task::interrupt`]: crate::Task::interrupt
    pub fn generic() -> &'static AsyncInterrupt {
        GENERIC.get_or_init(|| Self {
            shared: Arc::new(InterruptShared::new(Some(Arc::from("generic")), true)),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<InterruptShared> {
        &self.shared
    }

    /// Get the interrupt ID.
    pub fn id(&self) -> InterruptId {
        self.shared.id
    }

    /// The interrupt's name.
    pub fn name(&self) -> Option<&str> {
        self.shared.name.as_deref()
    }

    /// Whether this is the generic interrupt.
    pub fn is_generic(&self) -> bool {
        self.shared.generic
    }

    /// Task that owns the live frame, if any.
    pub fn frame_owner(&self) -> Option<TaskId> {
        self.shared.frame.lock().as_ref().map(|f| f.task.id())
    }

    /// Run `logic` under this interrupt.
    ///
    /// Returns [`Outcome::Rejected`] without side effects when the interrupt
    /// already protects a call anywhere in the process. An interrupted error
    /// naming this interrupt is consumed; other errors propagate.
    pub fn do_interruptible<L: Interruptible>(&self, logic: &mut L) -> Result<Outcome<L::Output>> {
        self.protect(logic, |_| Ok(()), |_| ())
    }

    /// [`AsyncInterrupt::do_interruptible`] for a closure with no interrupt
    /// action.
    pub fn run<T>(&self, body: impl FnOnce(&Frame<'_>) -> Result<T>) -> Result<Outcome<T>> {
        self.do_interruptible(&mut OnceLogic(Some(body)))
    }

    /// Open a frame, run `logic`, close the frame.
    ///
    /// `on_open` runs with the frame's sequence once it is live; `on_close`
    /// runs before the frame is closed.
    pub(crate) fn protect<L: Interruptible>(
        &self,
        logic: &mut L,
        on_open: impl FnOnce(u64) -> Result<()>,
        on_close: impl FnOnce(u64),
    ) -> Result<Outcome<L::Output>> {
        if self.shared.generic {
            return Ok(Outcome::Rejected(Rejection::Generic));
        }

        let task = task::current_shared();
        let (depth, sequence) = {
            let mut slot = self.shared.frame.lock();
            if let Some(frame) = slot.as_ref() {
                return Ok(Outcome::Rejected(Rejection::AlreadyActive {
                    owner: frame.task.id(),
                }));
            }
            let depth = task.push_frame();
            let sequence = self.shared.sequence.fetch_add(1, Ordering::AcqRel) + 1;
            self.shared.disable_depth.store(0, Ordering::Release);
            *slot = Some(FrameSlot {
                task: Arc::clone(&task),
                depth,
                sequence,
            });
            (depth, sequence)
        };
        let guard = FrameGuard {
            interrupt: Arc::clone(&self.shared),
            task: Arc::clone(&task),
            sequence,
        };
        trace!(interrupt = %self.shared.id, task = %task.id(), depth, sequence, "frame opened");

        let frame = Frame {
            interrupt: self,
            task,
            depth,
            sequence,
        };
        let result = on_open(sequence).and_then(|()| logic.run(&frame));
        on_close(sequence);
        drop(guard);

        match result {
            Ok(value) => Ok(Outcome::Completed(value)),
            Err(Error::Interrupted(interrupted)) if interrupted.id == self.shared.id => {
                debug!(interrupt = %self.shared.id, depth, "protected call interrupted");
                logic.interrupt_action(&interrupted);
                Ok(Outcome::Interrupted(interrupted))
            }
            Err(e) => Err(e),
        }
    }

    /// Request delivery to the task running the protected call.
    ///
    /// Returns `false` when no call is protected or an equally or more
    /// shallow request is already pending for that task. A request made
    /// while the interrupt is disabled is held and returns `true`.
    pub fn fire(&self) -> bool {
        self.shared.fire_sequence(None)
    }

    /// Re-enable delivery after [`AsyncInterrupt::disable`].
    ///
    /// Returns `false` when the caller does not own this interrupt's frame or
    /// there is no matching `disable` to undo.
    pub fn enable(&self) -> bool {
        if !self.shared.owned_by_current() {
            return false;
        }
        let undone = self
            .shared
            .disable_depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| d.checked_sub(1))
            .is_ok();
        if !undone {
            warn!(interrupt = %self.shared.id, "enable without a matching disable");
        }
        undone
    }

    /// Hold delivery until a matching [`AsyncInterrupt::enable`].
    ///
    /// Returns `false` when the caller does not own this interrupt's frame.
    pub fn disable(&self) -> bool {
        if !self.shared.owned_by_current() {
            return false;
        }
        self.shared.disable_depth.fetch_add(1, Ordering::AcqRel);
        true
    }

    /// Whether delivery is currently enabled.
    pub fn is_enabled(&self) -> bool {
        self.shared.is_enabled()
    }

    /// Clear this interrupt from the calling task's pending slot.
    ///
    /// Returns whether it was the pending one.
    pub fn clear(&self) -> bool {
        task::current_shared().clear_if(&self.shared)
    }

    /// Raise the calling task's pending interrupt now.
    ///
    /// Ignores deferral and disabling. `Ok` when nothing is pending.
    pub fn throw_pending() -> Result<()> {
        match task::current_shared().pending_interrupted() {
            Some(interrupted) => Err(Error::Interrupted(interrupted)),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for AsyncInterrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncInterrupt")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("enabled", &self.is_enabled())
            .field("owner", &self.frame_owner())
            .finish()
    }
}

/// Delivery point for the calling task.
pub fn check() -> Result<()> {
    match task::current_shared().pending_deliverable() {
        Some(interrupted) => Err(Error::Interrupted(interrupted)),
        None => Ok(()),
    }
}

/// Run `f` with delivery at checkpoints suppressed.
///
/// Only [`AsyncInterrupt::throw_pending`] raises inside `f`.
pub fn deferred<R>(f: impl FnOnce() -> R) -> R {
    struct Undefer(Arc<TaskShared>);

    impl Drop for Undefer {
        fn drop(&mut self) {
            self.0.undefer();
        }
    }

    let task = task::current_shared();
    task.defer();
    let _undefer = Undefer(task);
    f()
}
