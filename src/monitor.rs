use crate::config::Timings;
use crate::lock;
use crate::platform::NativeProcess;
use crate::types::ExitInfo;
use log::*;
use std::io;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Wakes the monitor early when it is asked to stop.
#[derive(Debug, Default)]
struct StopSignal {
    requested: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    fn request(&self) {
        *lock(&self.requested) = true;
        self.wake.notify_all();
    }

    fn is_requested(&self) -> bool {
        *lock(&self.requested)
    }

    /// Sleeps for `interval` unless a stop arrives first. Returns whether a
    /// stop was requested.
    fn wait(&self, interval: Duration) -> bool {
        let requested = lock(&self.requested);
        let (requested, _) = self
            .wake
            .wait_timeout_while(requested, interval, |requested| !*requested)
            .unwrap_or_else(PoisonError::into_inner);
        *requested
    }
}

/// Polls a child for exit and reports the outcome exactly once.
pub(crate) struct ProcessStatusMonitor {
    timings: Timings,
    worker: Option<MonitorWorker>,
}

struct MonitorWorker {
    stop: Arc<StopSignal>,
    done: mpsc::Receiver<()>,
    handle: JoinHandle<()>,
}

impl ProcessStatusMonitor {
    pub fn new(timings: Timings) -> Self {
        Self { timings, worker: None }
    }

    /// Starts polling `process` every poll interval. `on_exit` runs on the
    /// monitor thread with the exit information, or with the error that made
    /// the status query fail. It is not called if the monitor is stopped first.
    pub fn start<P: NativeProcess>(
        &mut self,
        process: Arc<P>,
        on_exit: impl FnOnce(io::Result<ExitInfo>) + Send + 'static,
    ) -> io::Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let stop = Arc::new(StopSignal::default());
        let signal = stop.clone();
        let interval = self.timings.poll_interval;
        let (done_tx, done) = mpsc::channel::<()>();
        let handle = thread::Builder::new().name(format!("monitor-{}", process.id())).spawn(move || {
            let _done = done_tx;
            watch(&*process, &signal, interval, on_exit);
        })?;
        self.worker = Some(MonitorWorker { stop, done, handle });
        Ok(())
    }

    /// Stops the polling loop and joins it within the stop timeout. Called
    /// from the monitor's own thread (from inside `on_exit`) it only detaches.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.stop.request();
        if worker.handle.thread().id() == thread::current().id() {
            return;
        }
        match worker.done.recv_timeout(self.timings.stop_timeout) {
            Err(RecvTimeoutError::Timeout) => {
                warn!("Status monitor did not stop within {:?}, detaching it", self.timings.stop_timeout);
            }
            _ => {
                if worker.handle.join().is_err() {
                    error!("Status monitor thread panicked");
                }
            }
        }
    }
}

impl Drop for ProcessStatusMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch<P: NativeProcess>(
    process: &P,
    stop: &StopSignal,
    interval: Duration,
    on_exit: impl FnOnce(io::Result<ExitInfo>),
) {
    let pid = process.id();
    trace!("Monitoring process {}", pid);
    loop {
        if stop.is_requested() {
            trace!("Monitor for process {} stopped", pid);
            return;
        }
        match process.poll_exit() {
            Ok(None) => {}
            Ok(Some(info)) => {
                debug!("Process {} exited with code {} ({:?})", pid, info.code, info.status);
                on_exit(Ok(info));
                return;
            }
            Err(e) => {
                error!("Failed to query status of process {}: {}", pid, e);
                on_exit(Err(e));
                return;
            }
        }
        if stop.wait(interval) {
            trace!("Monitor for process {} stopped", pid);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reports "running" for a fixed number of polls, then a scripted result.
    struct FakeProcess {
        polls_until_exit: AtomicUsize,
        outcome: fn() -> io::Result<Option<ExitInfo>>,
    }

    impl NativeProcess for FakeProcess {
        fn id(&self) -> u32 {
            4242
        }

        fn poll_exit(&self) -> io::Result<Option<ExitInfo>> {
            if self.polls_until_exit.load(Ordering::SeqCst) == 0 {
                return (self.outcome)();
            }
            self.polls_until_exit.fetch_sub(1, Ordering::SeqCst);
            Ok(None)
        }

        fn terminate(&self) -> io::Result<()> {
            Ok(())
        }

        fn kill(&self) -> io::Result<()> {
            Ok(())
        }
    }

    fn fast() -> Timings {
        Timings { poll_interval: Duration::from_millis(5), ..Timings::default() }
    }

    #[test]
    fn reports_exit_once() {
        let process = Arc::new(FakeProcess {
            polls_until_exit: AtomicUsize::new(3),
            outcome: || Ok(Some(ExitInfo::normal(3))),
        });
        let (tx, rx) = mpsc::channel();
        let mut monitor = ProcessStatusMonitor::new(fast());
        monitor
            .start(process, move |result| {
                tx.send(result.map_err(|e| e.kind())).unwrap();
            })
            .unwrap();

        let info = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(info, ExitInfo::normal(3));
        monitor.stop();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn query_failure_is_reported() {
        let process = Arc::new(FakeProcess {
            polls_until_exit: AtomicUsize::new(0),
            outcome: || Err(io::Error::from(io::ErrorKind::PermissionDenied)),
        });
        let (tx, rx) = mpsc::channel();
        let mut monitor = ProcessStatusMonitor::new(fast());
        monitor.start(process, move |result| tx.send(result.map_err(|e| e.kind())).unwrap()).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Err(io::ErrorKind::PermissionDenied));
    }

    #[test]
    fn stop_prevents_the_report() {
        let process = Arc::new(FakeProcess {
            polls_until_exit: AtomicUsize::new(usize::MAX),
            outcome: || Ok(Some(ExitInfo::normal(0))),
        });
        let (tx, rx) = mpsc::channel::<()>();
        let mut monitor = ProcessStatusMonitor::new(Timings { poll_interval: Duration::from_secs(60), ..Timings::default() });
        monitor.start(process, move |_| tx.send(()).unwrap()).unwrap();

        // A long poll interval still stops promptly.
        let began = std::time::Instant::now();
        monitor.stop();
        assert!(began.elapsed() < Duration::from_secs(5));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stop_from_inside_the_callback_does_not_deadlock() {
        let process = Arc::new(FakeProcess {
            polls_until_exit: AtomicUsize::new(0),
            outcome: || Ok(Some(ExitInfo::crashed(9))),
        });
        let monitor = Arc::new(Mutex::new(ProcessStatusMonitor::new(fast())));
        let (tx, rx) = mpsc::channel();
        let inner = monitor.clone();
        // Hold the lock while starting so the callback cannot run before the worker is stored.
        let mut guard = monitor.lock().unwrap();
        guard
            .start(process, move |_| {
                inner.lock().unwrap().stop();
                tx.send(()).unwrap();
            })
            .unwrap();
        drop(guard);

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }
}
