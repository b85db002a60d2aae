//! The sleep/wake primitive coupling blocking user calls to the worker.
//!
//! Every protocol control block owns a [`WaitCtx`]. A user thread that
//! cannot make progress sleeps on it while holding its table lock; the
//! worker thread wakes it when the awaited state changes, or interrupts it
//! through the stack-wide event broadcast. The worker itself never sleeps
//! on a context.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, MutexGuard};

use crate::error::{Error, Result};
use crate::time::Instant;

/// A sleep/wake context.
///
/// Wraps a condition variable, an interrupted flag and a waiter count. All
/// methods must be called with the lock of the owning table held; `sleep`
/// enforces this by consuming the guard. A single context must only ever be
/// used with a single mutex.
#[derive(Debug, Default)]
pub struct WaitCtx {
    cond: Condvar,
    interrupted: AtomicBool,
    waiters: AtomicUsize,
}

impl WaitCtx {
    /// Create a context with no waiters and a clear interrupted flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Release the lock and wait for a wakeup, an interrupt, or the
    /// deadline.
    ///
    /// Returns the reacquired guard. If the interrupted flag is set on
    /// entry the call returns `Err(Interrupted)` immediately without
    /// waiting. A set flag observed after waking also yields
    /// `Err(Interrupted)`; the last waiter to observe it clears it, so one
    /// broadcast interrupts every sleeper exactly once.
    ///
    /// Spurious wakeups are indistinguishable from `wakeup`; callers loop
    /// on their own condition.
    pub fn sleep<'g, T>(
        &self,
        guard: MutexGuard<'g, T>,
        deadline: Option<Instant>,
    ) -> (MutexGuard<'g, T>, Result<()>) {
        if self.interrupted.load(Ordering::SeqCst) {
            return (guard, Err(Error::Interrupted));
        }

        self.waiters.fetch_add(1, Ordering::SeqCst);
        let guard = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                let timeout = if deadline > now {
                    deadline - now
                } else {
                    core::time::Duration::from_millis(0)
                };
                let (guard, _) = self
                    .cond
                    .wait_timeout(guard, timeout)
                    .expect("wait context mutex poisoned");
                guard
            }
            None => self.cond.wait(guard).expect("wait context mutex poisoned"),
        };
        let remaining = self.waiters.fetch_sub(1, Ordering::SeqCst) - 1;

        if self.interrupted.load(Ordering::SeqCst) {
            if remaining == 0 {
                self.interrupted.store(false, Ordering::SeqCst);
            }
            return (guard, Err(Error::Interrupted));
        }
        (guard, Ok(()))
    }

    /// Wake all waiters.
    pub fn wakeup(&self) {
        self.cond.notify_all();
    }

    /// Set the interrupted flag, then wake all waiters.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }

    /// Tear the context down.
    ///
    /// Fails while waiters remain; the caller is expected to wake them and
    /// let the last one retry the teardown.
    pub fn destroy(&self) -> Result<()> {
        if self.waiters.load(Ordering::SeqCst) != 0 {
            return Err(Error::InvalidState);
        }
        self.interrupted.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Query whether any thread is currently sleeping on the context.
    pub fn has_waiters(&self) -> bool {
        self.waiters.load(Ordering::SeqCst) != 0
    }
}
