//! Replaceable callback slots.
//!
//! Each event kind has at most one handler. A handler is cloned out of its
//! slot under the slot's lock and invoked after the lock is released, so a
//! handler may call back into the controller (or replace itself) freely.
use crate::lock;
use crate::types::{Channel, ExitStatus, ProcessError};
use log::*;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

pub(crate) type StartedHandler = dyn Fn() + Send + Sync;
pub(crate) type FinishedHandler = dyn Fn(i32, ExitStatus) + Send + Sync;
pub(crate) type ErrorHandler = dyn Fn(ProcessError) + Send + Sync;
pub(crate) type ReadyReadHandler = dyn Fn(&[u8]) + Send + Sync;

pub(crate) struct Slot<F: ?Sized> {
    handler: Mutex<Option<Arc<F>>>,
}

impl<F: ?Sized> Default for Slot<F> {
    fn default() -> Self {
        Self { handler: Mutex::new(None) }
    }
}

impl<F: ?Sized> Slot<F> {
    pub fn set(&self, handler: Arc<F>) {
        *lock(&self.handler) = Some(handler);
    }

    pub fn get(&self) -> Option<Arc<F>> {
        lock(&self.handler).clone()
    }
}

#[derive(Default)]
pub(crate) struct EventHub {
    pub started: Slot<StartedHandler>,
    pub finished: Slot<FinishedHandler>,
    pub error: Slot<ErrorHandler>,
    pub standard_output: Slot<ReadyReadHandler>,
    pub standard_error: Slot<ReadyReadHandler>,
}

impl EventHub {
    pub fn emit_started(&self) {
        if let Some(handler) = self.started.get() {
            isolate("started", || handler());
        }
    }

    pub fn emit_finished(&self, exit_code: i32, exit_status: ExitStatus) {
        if let Some(handler) = self.finished.get() {
            isolate("finished", || handler(exit_code, exit_status));
        }
    }

    pub fn emit_error(&self, error: ProcessError) {
        if let Some(handler) = self.error.get() {
            isolate("error", || handler(error));
        }
    }

    pub fn emit_ready_read(&self, channel: Channel, bytes: &[u8]) {
        let slot = match channel {
            Channel::StandardOutput => &self.standard_output,
            Channel::StandardError => &self.standard_error,
        };
        if let Some(handler) = slot.get() {
            isolate("ready-read", || handler(bytes));
        }
    }
}

/// A panicking handler must not take down the reader or monitor thread.
fn isolate(event: &str, call: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(call)).is_err() {
        error!("Panic in {} callback", event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn replaced_handler_receives_the_next_event() {
        let hub = EventHub::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = first.clone();
        hub.started.set(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        hub.emit_started();

        let counter = second.clone();
        hub.started.set(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        hub.emit_started();

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_may_replace_itself() {
        let hub = Arc::new(EventHub::default());
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let inner = hub.clone();
        let (counter, replacement) = (first.clone(), second.clone());
        hub.error.set(Arc::new(move |_: ProcessError| {
            counter.fetch_add(1, Ordering::SeqCst);
            let replacement = replacement.clone();
            inner.error.set(Arc::new(move |_: ProcessError| {
                replacement.fetch_add(1, Ordering::SeqCst);
            }));
        }));
        hub.emit_error(ProcessError::ReadError);
        hub.emit_error(ProcessError::ReadError);

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_is_contained() {
        let hub = EventHub::default();
        hub.finished.set(Arc::new(|_: i32, _: ExitStatus| panic!("boom")));
        hub.emit_finished(0, ExitStatus::NormalExit);
    }

    #[test]
    fn ready_read_routes_by_channel() {
        let hub = EventHub::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        hub.standard_error.set(Arc::new(move |bytes: &[u8]| sink.lock().unwrap().extend_from_slice(bytes)));

        hub.emit_ready_read(Channel::StandardOutput, b"out");
        hub.emit_ready_read(Channel::StandardError, b"err");
        assert_eq!(*seen.lock().unwrap(), b"err");
    }
}
