use crate::lock;
use crate::types::{ExitStatus, ProcessError, ProcessState};
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread::ThreadId;
use std::time::Duration;
use tokio::sync::watch;

/// The fields shared between the caller, the readers and the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Status {
    pub state: ProcessState,
    pub error: ProcessError,
    pub exit_code: i32,
    pub exit_status: ExitStatus,
    /// Set when the current run reached its finish event; cleared by `start`.
    pub finished: bool,
    /// Incremented by every `start`, so stale exit reports can be told apart.
    pub run: u64,
    /// Thread currently tearing down the run, if any.
    pub finisher: Option<ThreadId>,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: ProcessState::NotRunning,
            error: ProcessError::NoError,
            exit_code: -1,
            exit_status: ExitStatus::NormalExit,
            finished: false,
            run: 0,
            finisher: None,
        }
    }
}

/// Status behind one lock, with a condition variable for the blocking waits
/// and a watch channel for the async ones.
pub(crate) struct StatusBoard {
    inner: Mutex<Status>,
    changed: Condvar,
    watch: watch::Sender<Status>,
}

impl StatusBoard {
    pub fn new() -> Self {
        let (watch, _) = watch::channel(Status::default());
        Self { inner: Mutex::new(Status::default()), changed: Condvar::new(), watch }
    }

    pub fn snapshot(&self) -> Status {
        *lock(&self.inner)
    }

    /// Applies `change` and wakes every waiter.
    pub fn update<R>(&self, change: impl FnOnce(&mut Status) -> R) -> R {
        let mut status = lock(&self.inner);
        let result = change(&mut status);
        // Published under the lock so watchers never observe updates out of order.
        self.watch.send_replace(*status);
        drop(status);
        self.changed.notify_all();
        result
    }

    /// Blocks while `condition` holds. Returns `None` if `timeout` elapsed
    /// first; `None` as timeout waits forever.
    pub fn wait_while(&self, timeout: Option<Duration>, mut condition: impl FnMut(&Status) -> bool) -> Option<Status> {
        let status = lock(&self.inner);
        match timeout {
            None => {
                let status =
                    self.changed.wait_while(status, |s| condition(&*s)).unwrap_or_else(PoisonError::into_inner);
                Some(*status)
            }
            Some(timeout) => {
                let (status, result) = self
                    .changed
                    .wait_timeout_while(status, timeout, |s| condition(&*s))
                    .unwrap_or_else(PoisonError::into_inner);
                if result.timed_out() { None } else { Some(*status) }
            }
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Status> {
        self.watch.subscribe()
    }
}
