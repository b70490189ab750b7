//! Deadline-triggered interrupts.
//!
//! A [`Timed`] is an [`AsyncInterrupt`] that fires itself when a protected
//! call outlives its time budget. The timer is armed when the frame opens and
//! disarmed before it closes; an expiry only applies to the invocation that
//! armed it.
//!
//! Each `Timed` owns one worker thread and a bounded command channel, both
//! created on first use and reused afterwards. The worker holds no strong
//! reference to the interrupt and exits when the `Timed` is dropped.

use std::ops::Deref;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::interrupt::{AsyncInterrupt, Frame, InterruptShared, Interruptible, OnceLogic, Outcome};

/// When a timed interrupt expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerSpec {
    /// A budget measured from the start of each invocation.
    After(Duration),
    /// An absolute deadline shared by every invocation.
    At(Instant),
}

impl TimerSpec {
    /// The deadline for an invocation starting at `now`.
    ///
    /// `None` when the budget reaches past what an [`Instant`] can hold; such
    /// an invocation never expires.
    pub fn deadline_from(&self, now: Instant) -> Option<Instant> {
        match self {
            TimerSpec::After(budget) => now.checked_add(*budget),
            TimerSpec::At(deadline) => Some(*deadline),
        }
    }
}

enum Command {
    Arm { sequence: u64, deadline: Instant },
    Disarm { sequence: u64 },
}

struct TimerHandle {
    commands: Sender<Command>,
    thread: Option<JoinHandle<()>>,
}

fn timer_loop(target: Weak<InterruptShared>, commands: Receiver<Command>) {
    let mut armed: Option<(u64, Instant)> = None;
    loop {
        let received = match armed {
            Some((_, deadline)) => commands.recv_deadline(deadline),
            None => commands.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(Command::Arm { sequence, deadline }) => {
                trace!(sequence, "timer armed");
                armed = Some((sequence, deadline));
            }
            Ok(Command::Disarm { sequence }) => {
                if armed.is_some_and(|(s, _)| s == sequence) {
                    trace!(sequence, "timer disarmed");
                    armed = None;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                let Some((sequence, _)) = armed.take() else {
                    continue;
                };
                let Some(target) = target.upgrade() else {
                    return;
                };
                let accepted = target.fire_sequence(Some(sequence));
                debug!(interrupt = %target.id(), sequence, accepted, "timer expired");
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// An interrupt that fires itself at a deadline.
pub struct Timed {
    interrupt: AsyncInterrupt,
    spec: Mutex<TimerSpec>,
    timer: Mutex<Option<TimerHandle>>,
}

impl Timed {
    /// Interrupt each protected call after `budget`.
    pub fn new(budget: Duration) -> Self {
        Self::with_spec(AsyncInterrupt::new(), TimerSpec::After(budget))
    }

    /// Interrupt protected calls still running at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::with_spec(AsyncInterrupt::new(), TimerSpec::At(deadline))
    }

    /// A named timed interrupt.
    pub fn named(name: impl Into<Arc<str>>, spec: TimerSpec) -> Self {
        Self::with_spec(AsyncInterrupt::named(name), spec)
    }

    fn with_spec(interrupt: AsyncInterrupt, spec: TimerSpec) -> Self {
        Self {
            interrupt,
            spec: Mutex::new(spec),
            timer: Mutex::new(None),
        }
    }

    /// The current expiry rule.
    pub fn spec(&self) -> TimerSpec {
        *self.spec.lock()
    }

    /// Replace the expiry rule. Takes effect at the next invocation.
    pub fn reset_time(&self, spec: TimerSpec) {
        *self.spec.lock() = spec;
    }

    /// The underlying interrupt.
    pub fn interrupt(&self) -> &AsyncInterrupt {
        &self.interrupt
    }

    /// Whether the worker thread has been started.
    pub fn timer_started(&self) -> bool {
        self.timer.lock().is_some()
    }

    /// Run `logic` under this interrupt with the timer armed.
    pub fn do_interruptible<L: Interruptible>(&self, logic: &mut L) -> Result<Outcome<L::Output>> {
        let deadline = self.spec().deadline_from(Instant::now());
        self.interrupt.protect(
            logic,
            |sequence| match deadline {
                Some(deadline) => self.send(Command::Arm { sequence, deadline }),
                None => Ok(()),
            },
            |sequence| {
                if deadline.is_some() {
                    let _ = self.send(Command::Disarm { sequence });
                }
            },
        )
    }

    /// [`Timed::do_interruptible`] for a closure with no interrupt action.
    pub fn run<T>(&self, body: impl FnOnce(&Frame<'_>) -> Result<T>) -> Result<Outcome<T>> {
        self.do_interruptible(&mut OnceLogic(Some(body)))
    }

    fn send(&self, command: Command) -> Result<()> {
        let mut timer = self.timer.lock();
        if timer.is_none() {
            *timer = Some(self.spawn_worker()?);
        }
        let handle = timer
            .as_ref()
            .ok_or_else(|| Error::TimerUnavailable("timer worker missing".into()))?;
        handle
            .commands
            .send(command)
            .map_err(|_| Error::TimerUnavailable("timer worker exited".into()))
    }

    fn spawn_worker(&self) -> Result<TimerHandle> {
        let capacity = crate::runtime_config()
            .map(|c| c.interrupt.timer_queue)
            .unwrap_or(8);
        let (tx, rx) = bounded(capacity);
        let target = Arc::downgrade(self.interrupt.shared());
        let thread = thread::Builder::new()
            .name(format!("rtscope-timer-{}", self.interrupt.id().0))
            .spawn(move || timer_loop(target, rx))
            .map_err(|e| Error::TimerUnavailable(e.to_string()))?;
        debug!(interrupt = %self.interrupt.id(), capacity, "started timer worker");
        Ok(TimerHandle {
            commands: tx,
            thread: Some(thread),
        })
    }
}

impl Deref for Timed {
    type Target = AsyncInterrupt;

    fn deref(&self) -> &AsyncInterrupt {
        &self.interrupt
    }
}

impl Drop for Timed {
    fn drop(&mut self) {
        if let Some(mut handle) = self.timer.get_mut().take() {
            let thread = handle.thread.take();
            drop(handle);
            if let Some(thread) = thread {
                let _ = thread.join();
            }
        }
    }
}

impl std::fmt::Debug for Timed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timed")
            .field("interrupt", &self.interrupt)
            .field("spec", &self.spec())
            .field("timer_started", &self.timer_started())
            .finish()
    }
}
