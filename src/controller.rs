use crate::config::{ProcessConfiguration, Timings, validate_environment_entry, validate_working_directory};
use crate::events::EventHub;
use crate::lock;
use crate::monitor::ProcessStatusMonitor;
use crate::platform::{self, KILL_EXIT_CODE, Native, NativeProcess, PipeReader, PlatformLauncher, Process, TERMINATE_EXIT_CODE};
use crate::reader::{AsyncStreamReader, Latch, OutputBuffer, ReaderEvents};
use crate::status::{Status, StatusBoard};
use crate::types::{Channel, ExitInfo, ExitStatus, ProcessError, ProcessState};
use anyhow::Result;
use log::*;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, TryLockError, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// How often a terminating caller re-checks whether the child is gone.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Controls one child process at a time.
///
/// A `ProcessController` launches a program with three pipes, reads the
/// child's stdout and stderr on background threads, watches for its exit on a
/// third, and reports everything through replaceable callbacks. All methods
/// take `&self`; a controller can be shared between threads behind an `Arc`.
///
/// A controller is reusable: once a run has finished, `start` may be called
/// again. Dropping a controller whose child is still running kills the child.
///
/// # Example
///
/// ```no_run
/// use tokio_process_control::ProcessController;
///
/// let process = ProcessController::new();
/// process.set_finished_callback(|code, status| println!("exited with {} ({:?})", code, status));
/// process.start("echo", ["hello"]).expect("failed to start");
/// process.wait_for_finished(None);
/// let output = process.read_all_standard_output().expect("failed to read");
/// assert_eq!(output, b"hello\n");
/// ```
pub struct ProcessController {
    shared: Arc<Shared>,
}

struct Shared {
    /// Working directory and environment applied to the next start.
    config: Mutex<ProcessConfiguration>,
    timings: Timings,
    status: StatusBoard,
    events: EventHub,
    stdout: Arc<OutputBuffer>,
    stderr: Arc<OutputBuffer>,
    /// The active run. Whoever takes it out finishes it.
    run: Mutex<Option<Run>>,
}

struct Run {
    id: u64,
    process: Arc<Process>,
    stdin: Arc<Mutex<Option<File>>>,
    stdout_pipe: Arc<PipeReader>,
    stderr_pipe: Arc<PipeReader>,
    stdout_reader: AsyncStreamReader,
    stderr_reader: AsyncStreamReader,
    monitor: ProcessStatusMonitor,
    /// Opens just before the started event is emitted.
    announced: Arc<Latch>,
    starter: ThreadId,
}

impl Run {
    fn pipe(&self, channel: Channel) -> &Arc<PipeReader> {
        match channel {
            Channel::StandardOutput => &self.stdout_pipe,
            Channel::StandardError => &self.stderr_pipe,
        }
    }

    fn reader(&self, channel: Channel) -> &AsyncStreamReader {
        match channel {
            Channel::StandardOutput => &self.stdout_reader,
            Channel::StandardError => &self.stderr_reader,
        }
    }
}

/// Why a run is being finished.
enum Outcome {
    /// The monitor saw the child exit on its own.
    Exited(ExitInfo),
    /// The monitor could not query the child any more.
    Lost(io::Error),
    Terminate,
    Kill,
    Shutdown(Duration),
}

/// Forwards reader thread reports to the controller that owns the run.
struct RunEvents {
    shared: Weak<Shared>,
}

impl ReaderEvents for RunEvents {
    fn data(&self, channel: Channel, bytes: &[u8]) {
        if let Some(shared) = self.shared.upgrade() {
            shared.events.emit_ready_read(channel, bytes);
        }
    }

    fn failed(&self, channel: Channel, error: io::Error) {
        if let Some(shared) = self.shared.upgrade() {
            warn!("Reading {} failed: {}", channel, error);
            shared.raise(ProcessError::ReadError);
        }
    }
}

impl Default for ProcessController {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessController {
    /// Creates an idle controller with the default [`Timings`].
    pub fn new() -> Self {
        Self::with_timings(Timings::default())
    }

    /// Creates an idle controller with custom poll and shutdown timings.
    pub fn with_timings(timings: Timings) -> Self {
        Self {
            shared: Arc::new(Shared {
                config: Mutex::new(ProcessConfiguration::default()),
                timings,
                status: StatusBoard::new(),
                events: EventHub::default(),
                stdout: Arc::new(OutputBuffer::default()),
                stderr: Arc::new(OutputBuffer::default()),
                run: Mutex::new(None),
            }),
        }
    }

    /// Sets the directory the next child starts in.
    ///
    /// # Errors
    ///
    /// Fails with [`ProcessError::FailedToStart`] in the error chain if `dir`
    /// does not exist or is not a directory. The previous setting is kept.
    pub fn set_working_directory(&self, dir: impl Into<PathBuf>) -> Result<()> {
        let dir = dir.into();
        validate_working_directory(&dir)?;
        debug!("Working directory set to {}", dir.display());
        lock(&self.shared.config).working_directory = Some(dir);
        Ok(())
    }

    pub fn working_directory(&self) -> Option<PathBuf> {
        lock(&self.shared.config).working_directory.clone()
    }

    /// Replaces the environment of the next child with `entries`, each of the
    /// form `NAME=value`. The parent's environment is not inherited once this
    /// has been called.
    ///
    /// # Errors
    ///
    /// Fails with [`ProcessError::FailedToStart`] in the error chain if any
    /// entry is empty or lacks an `=`. Nothing is stored in that case.
    pub fn set_environment(&self, entries: Vec<impl Into<String>>) -> Result<()> {
        let entries: Vec<String> = entries.into_iter().map(Into::into).collect();
        for entry in &entries {
            validate_environment_entry(entry)?;
        }
        debug!("Environment replaced with {} entries", entries.len());
        lock(&self.shared.config).environment = Some(entries);
        Ok(())
    }

    /// The environment set by [`set_environment`](Self::set_environment), or
    /// `None` if the child inherits the parent's.
    pub fn environment(&self) -> Option<Vec<String>> {
        lock(&self.shared.config).environment.clone()
    }

    /// Starts `program` with `arguments`, using the stored working directory
    /// and environment.
    ///
    /// On success the state is `Running`, the started callback has been
    /// invoked, and the readers and the exit monitor are active.
    ///
    /// # Errors
    ///
    /// Every failure carries [`ProcessError::FailedToStart`] in its chain,
    /// records it as the sticky error and reports it to the error callback:
    ///
    /// - a run is already in progress (the running child is left alone)
    /// - `program` is empty
    /// - the working directory no longer exists
    /// - the operating system refused to create the pipes or the child, or
    ///   the program could not be executed
    ///
    /// # Example
    ///
    /// ```no_run
    /// use tokio_process_control::{ProcessController, ProcessError};
    ///
    /// let process = ProcessController::new();
    /// if let Err(err) = process.start("/no/such/binary", Vec::<String>::new()) {
    ///     assert_eq!(err.downcast_ref::<ProcessError>(), Some(&ProcessError::FailedToStart));
    /// }
    /// ```
    pub fn start<I, S>(&self, program: impl Into<String>, arguments: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut config = lock(&self.shared.config).clone();
        config.program = program.into();
        config.arguments = arguments.into_iter().map(Into::into).collect();
        self.start_configured(config)
    }

    /// Starts the child described by `config`. Its working directory and
    /// environment are used as given; the controller's stored settings are
    /// ignored for this run.
    pub fn start_configured(&self, config: ProcessConfiguration) -> Result<()> {
        let shared = &self.shared;
        if let Err(err) = config.validate() {
            shared.raise(ProcessError::FailedToStart);
            return Err(err);
        }

        let run_id = shared.status.update(|s| {
            if s.state != ProcessState::NotRunning {
                return None;
            }
            s.state = ProcessState::Starting;
            s.error = ProcessError::NoError;
            s.exit_code = -1;
            s.exit_status = ExitStatus::NormalExit;
            s.finished = false;
            s.run += 1;
            Some(s.run)
        });
        let Some(run_id) = run_id else {
            shared.raise(ProcessError::FailedToStart);
            return Err(anyhow::Error::new(ProcessError::FailedToStart).context("a process is already running"));
        };
        shared.stdout.clear();
        shared.stderr.clear();

        info!("Starting {} {:?}", config.program, config.arguments);
        let launched = match Native::launch(&config) {
            Ok(launched) => launched,
            Err(e) => {
                error!("Failed to start {}: {}", config.program, e);
                shared.status.update(|s| {
                    s.state = ProcessState::NotRunning;
                    s.error = ProcessError::FailedToStart;
                });
                shared.events.emit_error(ProcessError::FailedToStart);
                return Err(anyhow::Error::new(e)
                    .context(ProcessError::FailedToStart)
                    .context(format!("failed to start `{}`", config.program)));
            }
        };

        let gate = Arc::new(Latch::default());
        let announced = Arc::new(Latch::default());
        let events: Arc<dyn ReaderEvents> = Arc::new(RunEvents { shared: Arc::downgrade(shared) });
        let mut run = Run {
            id: run_id,
            process: Arc::new(launched.process),
            stdin: Arc::new(Mutex::new(Some(launched.stdin))),
            stdout_pipe: Arc::new(launched.stdout),
            stderr_pipe: Arc::new(launched.stderr),
            stdout_reader: AsyncStreamReader::new(Channel::StandardOutput, shared.stdout.clone(), shared.timings),
            stderr_reader: AsyncStreamReader::new(Channel::StandardError, shared.stderr.clone(), shared.timings),
            monitor: ProcessStatusMonitor::new(shared.timings),
            announced: announced.clone(),
            starter: thread::current().id(),
        };
        let pid = run.process.id();

        let spawned = run
            .stdout_reader
            .start(run.stdout_pipe.clone(), gate.clone(), events.clone())
            .and_then(|()| run.stderr_reader.start(run.stderr_pipe.clone(), gate.clone(), events));
        if let Err(e) = spawned {
            return Err(shared.abort_start(run, e));
        }

        {
            let mut slot = lock(&shared.run);
            let weak = Arc::downgrade(shared);
            let process = run.process.clone();
            let monitored = run.monitor.start(process, move |result| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_monitor_report(run_id, result);
                }
            });
            if let Err(e) = monitored {
                drop(slot);
                return Err(shared.abort_start(run, e));
            }
            // The monitor cannot claim the run before the slot lock is released.
            *slot = Some(run);
            shared.status.update(|s| s.state = ProcessState::Running);
        }

        info!("Process {} started", pid);
        announced.open();
        shared.events.emit_started();
        // Ready-read delivery waits for the started callback to return.
        gate.open();
        Ok(())
    }

    /// Launches `program` so that it outlives this controller. The child gets
    /// null standard streams and its own session (a new process group on
    /// Windows). Uses the stored working directory and environment; the
    /// controller's own state is not touched.
    ///
    /// Returns whether the launch succeeded.
    pub fn start_detached<I, S>(&self, program: impl Into<String>, arguments: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut config = lock(&self.shared.config).clone();
        config.program = program.into();
        config.arguments = arguments.into_iter().map(Into::into).collect();
        if let Err(err) = config.validate() {
            error!("Not starting detached process: {:#}", err);
            return false;
        }
        match Native::launch_detached(&config) {
            Ok(()) => {
                info!("Started detached process {}", config.program);
                true
            }
            Err(e) => {
                error!("Failed to start detached process {}: {}", config.program, e);
                false
            }
        }
    }

    /// Blocks until the child has left the `Starting` state.
    ///
    /// Returns `true` if the child is `Running`, `false` if no start is in
    /// progress and nothing is running, and `false` on timeout. A timeout
    /// changes nothing. `None` waits without a deadline.
    pub fn wait_for_started(&self, timeout: Option<Duration>) -> bool {
        match self.shared.status.wait_while(timeout, |s| s.state == ProcessState::Starting) {
            Some(status) => status.state == ProcessState::Running,
            None => {
                warn!("Timed out after {:?} waiting for the process to start", timeout.unwrap_or_default());
                false
            }
        }
    }

    /// Blocks until the current run has finished.
    ///
    /// Returns `true` once the finished event of the current run has been
    /// emitted, including when that happened before the call. Returns `false`
    /// if nothing was ever started, or on timeout. A timeout leaves the child
    /// running and the state and error untouched.
    pub fn wait_for_finished(&self, timeout: Option<Duration>) -> bool {
        match self.shared.status.wait_while(timeout, |s| s.state != ProcessState::NotRunning) {
            Some(status) => status.finished,
            None => {
                warn!("Timed out after {:?} waiting for the process to finish", timeout.unwrap_or_default());
                false
            }
        }
    }

    /// Async counterpart of [`wait_for_started`](Self::wait_for_started).
    pub async fn wait_for_started_async(&self, timeout: Option<Duration>) -> bool {
        let mut status = self.shared.status.subscribe();
        let wait = async move {
            status
                .wait_for(|s| s.state != ProcessState::Starting)
                .await
                .map(|s| s.state == ProcessState::Running)
                .unwrap_or(false)
        };
        self.with_deadline(timeout, wait).await
    }

    /// Async counterpart of [`wait_for_finished`](Self::wait_for_finished).
    ///
    /// ```no_run
    /// # async fn demo() -> anyhow::Result<()> {
    /// use std::time::Duration;
    /// use tokio_process_control::ProcessController;
    ///
    /// let process = ProcessController::new();
    /// process.start("sleep", ["1"])?;
    /// assert!(process.wait_for_finished_async(Some(Duration::from_secs(5))).await);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn wait_for_finished_async(&self, timeout: Option<Duration>) -> bool {
        let mut status = self.shared.status.subscribe();
        let wait = async move {
            status.wait_for(|s| s.state == ProcessState::NotRunning).await.map(|s| s.finished).unwrap_or(false)
        };
        self.with_deadline(timeout, wait).await
    }

    async fn with_deadline(&self, timeout: Option<Duration>, wait: impl Future<Output = bool>) -> bool {
        let Some(timeout) = timeout else {
            return wait.await;
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Timed out after {:?} waiting for the process", timeout);
                false
            }
        }
    }

    /// Writes all of `data` to the child's stdin. Empty input is a no-op.
    ///
    /// # Errors
    ///
    /// Fails with [`ProcessError::WriteError`] in the chain (also recorded and
    /// reported to the error callback) when nothing is running, after
    /// [`close_write_channel`](Self::close_write_channel), or when the
    /// operating system rejects the write.
    pub fn write(&self, data: impl AsRef<[u8]>) -> Result<()> {
        let data = data.as_ref();
        if data.is_empty() {
            return Ok(());
        }
        let Some(stdin) = self.shared.stdin() else {
            self.shared.raise(ProcessError::WriteError);
            return Err(anyhow::Error::new(ProcessError::WriteError).context("process is not running"));
        };
        let mut stdin = lock(&stdin);
        let Some(file) = stdin.as_mut() else {
            drop(stdin);
            self.shared.raise(ProcessError::WriteError);
            return Err(anyhow::Error::new(ProcessError::WriteError).context("write channel is closed"));
        };
        if let Err(e) = file.write_all(data).and_then(|()| file.flush()) {
            drop(stdin);
            error!("Failed to write to stdin: {}", e);
            self.shared.raise(ProcessError::WriteError);
            return Err(anyhow::Error::new(e).context(ProcessError::WriteError));
        }
        trace!("Wrote {} bytes to stdin", data.len());
        Ok(())
    }

    /// Closes the child's stdin so it sees end of input. Later writes fail.
    pub fn close_write_channel(&self) {
        let Some(stdin) = self.shared.stdin() else {
            return;
        };
        if lock(&stdin).take().is_some() {
            debug!("Closed write channel");
        }
    }

    /// Returns and clears everything the child has written to stdout so far.
    ///
    /// When the stdout reader is not active but the pipe is still open, bytes
    /// already queued on the pipe are read directly.
    pub fn read_all_standard_output(&self) -> Result<Vec<u8>> {
        self.read_all(Channel::StandardOutput)
    }

    /// Returns and clears everything the child has written to stderr so far.
    pub fn read_all_standard_error(&self) -> Result<Vec<u8>> {
        self.read_all(Channel::StandardError)
    }

    fn read_all(&self, channel: Channel) -> Result<Vec<u8>> {
        let shared = &self.shared;
        let mut bytes = shared.buffer(channel).take_all();
        let idle_pipe =
            lock(&shared.run).as_ref().filter(|run| !run.reader(channel).is_active()).map(|run| run.pipe(channel).clone());
        if let Some(pipe) = idle_pipe {
            let deadline = Instant::now() + shared.timings.poll_interval;
            if let Err(e) = platform::drain(&*pipe, &mut bytes, deadline) {
                shared.raise(ProcessError::ReadError);
                return Err(anyhow::Error::new(e).context(ProcessError::ReadError).context(format!("failed to read {}", channel)));
            }
        }
        Ok(bytes)
    }

    /// Asks the child to exit and waits up to the terminate grace period.
    ///
    /// Reports the child's real exit if it happened in time, otherwise
    /// [`ExitStatus::CrashExit`] with code 15; a child that ignores the request
    /// is reaped in the background. Does nothing when nothing is running.
    /// Concurrent callers produce exactly one finished event, and every caller
    /// returns only once the state is `NotRunning`.
    pub fn terminate(&self) {
        self.shared.stop(Outcome::Terminate);
    }

    /// Forcefully stops the child. The finished event reports
    /// [`ExitStatus::CrashExit`] with code 9. Does nothing when nothing is running.
    pub fn kill(&self) {
        self.shared.stop(Outcome::Kill);
    }

    /// Terminates the child politely and kills it if it is still alive after `grace`.
    pub fn shutdown(&self, grace: Duration) {
        self.shared.stop(Outcome::Shutdown(grace));
    }

    /// Asks the operating system whether the child is alive right now.
    pub fn is_running(&self) -> bool {
        let process = lock(&self.shared.run).as_ref().map(|run| run.process.clone());
        process.is_some_and(|process| matches!(process.poll_exit(), Ok(None)))
    }

    pub fn state(&self) -> ProcessState {
        self.shared.status.snapshot().state
    }

    /// The most recent error. Sticky until the next successful start.
    pub fn error(&self) -> ProcessError {
        self.shared.status.snapshot().error
    }

    /// Exit code of the last finished run, `-1` before any run finished.
    pub fn exit_code(&self) -> i32 {
        self.shared.status.snapshot().exit_code
    }

    pub fn exit_status(&self) -> ExitStatus {
        self.shared.status.snapshot().exit_status
    }

    /// Operating system id of the running child.
    pub fn process_id(&self) -> Option<u32> {
        lock(&self.shared.run).as_ref().map(|run| run.process.id())
    }

    pub fn set_started_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.shared.events.started.set(Arc::new(callback));
    }

    /// Invoked once per run with the exit code and status, after all output
    /// has been delivered.
    pub fn set_finished_callback(&self, callback: impl Fn(i32, ExitStatus) + Send + Sync + 'static) {
        self.shared.events.finished.set(Arc::new(callback));
    }

    pub fn set_error_callback(&self, callback: impl Fn(ProcessError) + Send + Sync + 'static) {
        self.shared.events.error.set(Arc::new(callback));
    }

    /// Invoked on a reader thread with every chunk read from stdout.
    pub fn set_ready_read_standard_output_callback(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.shared.events.standard_output.set(Arc::new(callback));
    }

    /// Invoked on a reader thread with every chunk read from stderr.
    pub fn set_ready_read_standard_error_callback(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.shared.events.standard_error.set(Arc::new(callback));
    }
}

impl Drop for ProcessController {
    fn drop(&mut self) {
        if let Some(run) = self.shared.claim_run(None) {
            debug!("Controller dropped with process {} still running, killing it", run.process.id());
            self.shared.finish(run, Outcome::Kill);
        }
    }
}

impl Shared {
    /// Records `error` and reports it to the error callback.
    fn raise(&self, error: ProcessError) {
        self.status.update(|s| s.error = error);
        self.events.emit_error(error);
    }

    fn buffer(&self, channel: Channel) -> &Arc<OutputBuffer> {
        match channel {
            Channel::StandardOutput => &self.stdout,
            Channel::StandardError => &self.stderr,
        }
    }

    fn stdin(&self) -> Option<Arc<Mutex<Option<File>>>> {
        lock(&self.run).as_ref().map(|run| run.stdin.clone())
    }

    /// Takes the active run out of its slot and marks the calling thread as
    /// the one finishing it. With `Some(id)` only that run is taken.
    fn claim_run(&self, id: Option<u64>) -> Option<Run> {
        let mut slot = lock(&self.run);
        let run = match (slot.as_ref(), id) {
            (Some(run), Some(id)) if run.id != id => None,
            _ => slot.take(),
        }?;
        self.status.update(|s| s.finisher = Some(thread::current().id()));
        Some(run)
    }

    /// Finishes the run as `outcome` asks. If another thread is already
    /// finishing it, waits until that thread is done.
    fn stop(&self, outcome: Outcome) {
        match self.claim_run(None) {
            Some(run) => self.finish(run, outcome),
            None => {
                let current = thread::current().id();
                self.status.wait_while(None, |s| s.finisher.is_some_and(|finisher| finisher != current));
            }
        }
    }

    fn on_monitor_report(&self, run_id: u64, report: io::Result<ExitInfo>) {
        let Some(run) = self.claim_run(Some(run_id)) else {
            debug!("Run {} was already finished by the caller", run_id);
            return;
        };
        match report {
            Ok(info) => self.finish(run, Outcome::Exited(info)),
            Err(e) => self.finish(run, Outcome::Lost(e)),
        }
    }

    /// Undoes a launch whose background threads could not be spawned.
    fn abort_start(&self, mut run: Run, cause: io::Error) -> anyhow::Error {
        error!("Failed to start background threads for process {}: {}", run.process.id(), cause);
        if let Err(e) = run.process.kill() {
            warn!("Failed to kill process {}: {}", run.process.id(), e);
        }
        run.stdout_reader.stop();
        run.stderr_reader.stop();
        drop(run);
        self.status.update(|s| {
            s.state = ProcessState::NotRunning;
            s.error = ProcessError::FailedToStart;
        });
        self.events.emit_error(ProcessError::FailedToStart);
        anyhow::Error::new(cause).context(ProcessError::FailedToStart)
    }

    /// Stops the child as `outcome` asks, tears down the run and emits the
    /// finished event. Runs on whichever thread claimed the run.
    fn finish(&self, mut run: Run, outcome: Outcome) {
        let pid = run.process.id();
        let mut error = None;
        let info = match outcome {
            Outcome::Exited(info) => {
                if info.status == ExitStatus::CrashExit {
                    error = Some(ProcessError::Crashed);
                }
                info
            }
            Outcome::Lost(e) => {
                error!("Lost track of process {}: {}", pid, e);
                error = Some(ProcessError::UnknownError);
                if let Err(e) = run.process.kill() {
                    debug!("Failed to kill process {}: {}", pid, e);
                }
                ExitInfo::crashed(-1)
            }
            Outcome::Terminate => {
                debug!("Terminating process {}", pid);
                if let Err(e) = run.process.terminate() {
                    warn!("Failed to terminate process {}: {}", pid, e);
                }
                wait_for_exit(&*run.process, self.timings.terminate_grace)
                    .unwrap_or(ExitInfo::crashed(TERMINATE_EXIT_CODE))
            }
            Outcome::Kill => {
                debug!("Killing process {}", pid);
                if let Err(e) = run.process.kill() {
                    warn!("Failed to kill process {}: {}", pid, e);
                }
                let _ = wait_for_exit(&*run.process, self.timings.terminate_grace);
                ExitInfo::crashed(KILL_EXIT_CODE)
            }
            Outcome::Shutdown(grace) => {
                debug!("Shutting down process {}", pid);
                if let Err(e) = run.process.terminate() {
                    warn!("Failed to terminate process {}: {}", pid, e);
                }
                match wait_for_exit(&*run.process, grace) {
                    Some(info) => info,
                    None => {
                        debug!("Process {} ignored termination, killing it", pid);
                        if let Err(e) = run.process.kill() {
                            warn!("Failed to kill process {}: {}", pid, e);
                        }
                        let _ = wait_for_exit(&*run.process, self.timings.terminate_grace);
                        ExitInfo::crashed(KILL_EXIT_CODE)
                    }
                }
            }
        };

        run.monitor.stop();
        run.stdout_reader.stop();
        run.stderr_reader.stop();
        close_stdin(&run.stdin);
        // finished must not overtake started; the starting thread itself cannot wait.
        if thread::current().id() != run.starter && !run.announced.wait_timeout(self.timings.stop_timeout) {
            warn!("Process {} finished before its start was announced", pid);
        }
        drop(run);

        info!("Process {} finished with code {} ({:?})", pid, info.code, info.status);
        self.status.update(|s: &mut Status| {
            s.state = ProcessState::NotRunning;
            s.exit_code = info.code;
            s.exit_status = info.status;
            s.finished = true;
            s.finisher = None;
            if let Some(error) = error {
                s.error = error;
            }
        });
        if let Some(error) = error {
            self.events.emit_error(error);
        }
        self.events.emit_finished(info.code, info.status);
    }
}

/// Polls until the child has exited or `grace` has passed.
fn wait_for_exit<P: NativeProcess + ?Sized>(process: &P, grace: Duration) -> Option<ExitInfo> {
    let deadline = Instant::now() + grace;
    loop {
        match process.poll_exit() {
            Ok(Some(info)) => return Some(info),
            Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL_INTERVAL),
            Ok(None) => return None,
            Err(e) => {
                debug!("Failed to poll process {}: {}", process.id(), e);
                return None;
            }
        }
    }
}

/// Drops the parent's stdin end unless a writer is still using it, in which
/// case it closes when that writer lets go.
fn close_stdin(stdin: &Mutex<Option<File>>) {
    match stdin.try_lock() {
        Ok(mut file) => drop(file.take()),
        Err(TryLockError::Poisoned(poisoned)) => drop(poisoned.into_inner().take()),
        Err(TryLockError::WouldBlock) => debug!("Write in progress, stdin closes when it returns"),
    }
}
