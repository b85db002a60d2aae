//! Interrupt plumbing between driver threads and the worker.
//!
//! The original signal machinery is rendered as an in-process event
//! channel: an interrupt is a plain number posted onto an mpsc channel and
//! consumed serially by the worker thread, which switches on the reserved
//! numbers and otherwise fans out over the registration list. Handlers run
//! on the worker with normal locking available; driver threads only raise.
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Mutex};

use crate::error::{Error, Result};

/// Deferred protocol processing (drain the input queues).
pub(crate) const IRQ_SOFT: u32 = 1;
/// Stack-wide cancellation broadcast.
pub(crate) const IRQ_EVENT: u32 = 2;
/// Periodic timer tick.
pub(crate) const IRQ_ALARM: u32 = 3;
/// Worker termination.
pub(crate) const IRQ_HANGUP: u32 = 4;

/// First number handed out to device interrupts.
pub(crate) const IRQ_BASE: u32 = 16;

/// A cloneable handle for raising interrupts from any thread.
#[derive(Clone)]
pub(crate) struct IrqLine {
    tx: mpsc::Sender<u32>,
}

impl IrqLine {
    /// Post an interrupt. Posting after shutdown is a no-op.
    pub(crate) fn raise(&self, irq: u32) {
        let _ = self.tx.send(irq);
    }
}

struct IrqEntry {
    irq: u32,
    name: String,
    shared: bool,
    handler: Box<dyn Fn() + Send + Sync>,
}

/// The interrupt registration list plus the event channel feeding the
/// worker.
pub(crate) struct Dispatcher {
    tx: Mutex<mpsc::Sender<u32>>,
    rx: Mutex<Option<mpsc::Receiver<u32>>>,
    entries: Mutex<Vec<IrqEntry>>,
    next_irq: AtomicU32,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Dispatcher {
            tx: Mutex::new(tx),
            rx: Mutex::new(Some(rx)),
            entries: Mutex::new(Vec::new()),
            next_irq: AtomicU32::new(IRQ_BASE),
        }
    }

    /// Hand out a fresh device interrupt number.
    pub(crate) fn allocate_irq(&self) -> u32 {
        self.next_irq.fetch_add(1, Ordering::Relaxed)
    }

    /// Obtain a handle for raising interrupts.
    pub(crate) fn line(&self) -> IrqLine {
        IrqLine { tx: self.tx.lock().unwrap().clone() }
    }

    /// Register a handler for a device interrupt.
    ///
    /// A number that is already registered may only be shared if both the
    /// existing and the new registration ask for sharing.
    pub(crate) fn request_irq(
        &self,
        irq: u32,
        name: &str,
        shared: bool,
        handler: Box<dyn Fn() + Send + Sync>,
    ) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.iter() {
            if entry.irq == irq && !(entry.shared && shared) {
                log::error!("irq {} conflicts with already registered '{}'", irq, entry.name);
                return Err(Error::InvalidArgument);
            }
        }
        log::debug!("irq registered: irq={}, name={}", irq, name);
        entries.push(IrqEntry { irq, name: name.to_string(), shared, handler });
        Ok(())
    }

    /// Post an interrupt from the stack itself.
    pub(crate) fn raise(&self, irq: u32) {
        let _ = self.tx.lock().unwrap().send(irq);
    }

    /// Take the consuming end of the channel. Succeeds once.
    pub(crate) fn take_receiver(&self) -> Option<mpsc::Receiver<u32>> {
        self.rx.lock().unwrap().take()
    }

    /// Invoke every handler registered for `irq`. Worker context only.
    pub(crate) fn dispatch(&self, irq: u32) {
        let entries = self.entries.lock().unwrap();
        for entry in entries.iter() {
            if entry.irq == irq {
                log::trace!("irq dispatch: irq={}, name={}", irq, entry.name);
                (entry.handler)();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn fan_out_over_shared_registrations() {
        let dispatcher = Dispatcher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for name in ["a", "b"] {
            let hits = hits.clone();
            dispatcher
                .request_irq(IRQ_BASE, name, true, Box::new(move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }
        dispatcher.dispatch(IRQ_BASE);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn exclusive_registration_conflicts() {
        let dispatcher = Dispatcher::new();
        dispatcher
            .request_irq(IRQ_BASE, "only", false, Box::new(|| {}))
            .unwrap();
        let err = dispatcher
            .request_irq(IRQ_BASE, "second", true, Box::new(|| {}))
            .unwrap_err();
        assert_eq!(err, Error::InvalidArgument);
    }

    #[test]
    fn raised_interrupts_arrive_in_order() {
        let dispatcher = Dispatcher::new();
        let rx = dispatcher.take_receiver().unwrap();
        let line = dispatcher.line();
        line.raise(IRQ_SOFT);
        line.raise(IRQ_BASE);
        line.raise(IRQ_HANGUP);
        assert_eq!(rx.try_recv().unwrap(), IRQ_SOFT);
        assert_eq!(rx.try_recv().unwrap(), IRQ_BASE);
        assert_eq!(rx.try_recv().unwrap(), IRQ_HANGUP);
    }
}
