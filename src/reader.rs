//! Background readers for the child's stdout and stderr.
//!
//! One [`AsyncStreamReader`] exists per channel. Its thread pulls bounded
//! chunks off the pipe, appends them to the channel's [`OutputBuffer`] and
//! forwards them to the ready-read callback. Reading starts right away, but
//! callbacks are held back by a [`Latch`] until the controller has announced
//! the start of the run.
use crate::config::Timings;
use crate::lock;
use crate::platform::{self, Chunk, NativeReader, READ_CHUNK_SIZE};
use crate::types::Channel;
use log::*;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Bytes received on one channel and not yet handed to the caller.
#[derive(Debug, Default)]
pub(crate) struct OutputBuffer {
    bytes: Mutex<Vec<u8>>,
}

impl OutputBuffer {
    pub fn append(&self, bytes: &[u8]) {
        lock(&self.bytes).extend_from_slice(bytes);
    }

    /// Returns everything buffered and leaves the buffer empty.
    pub fn take_all(&self) -> Vec<u8> {
        std::mem::take(&mut *lock(&self.bytes))
    }

    pub fn clear(&self) {
        lock(&self.bytes).clear();
    }
}

/// A gate that opens once and stays open.
#[derive(Debug, Default)]
pub(crate) struct Latch {
    open: Mutex<bool>,
    opened: Condvar,
}

impl Latch {
    pub fn open(&self) {
        *lock(&self.open) = true;
        self.opened.notify_all();
    }

    pub fn is_open(&self) -> bool {
        *lock(&self.open)
    }

    /// Returns whether the latch is open after waiting at most `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let open = lock(&self.open);
        let (open, _) = self
            .opened
            .wait_timeout_while(open, timeout, |open| !*open)
            .unwrap_or_else(PoisonError::into_inner);
        *open
    }
}

/// Where a reader thread reports what it sees.
pub(crate) trait ReaderEvents: Send + Sync + 'static {
    fn data(&self, channel: Channel, bytes: &[u8]);
    fn failed(&self, channel: Channel, error: io::Error);
}

pub(crate) struct AsyncStreamReader {
    channel: Channel,
    buffer: Arc<OutputBuffer>,
    timings: Timings,
    worker: Option<Worker>,
}

struct Worker {
    stop: Arc<AtomicBool>,
    /// Disconnects when the thread returns.
    done: mpsc::Receiver<()>,
    handle: JoinHandle<()>,
}

impl AsyncStreamReader {
    pub fn new(channel: Channel, buffer: Arc<OutputBuffer>, timings: Timings) -> Self {
        Self { channel, buffer, timings, worker: None }
    }

    /// Spawns the reader thread. Calling it again on a started reader does nothing.
    pub fn start<R: NativeReader>(&mut self, pipe: Arc<R>, gate: Arc<Latch>, events: Arc<dyn ReaderEvents>) -> io::Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done) = mpsc::channel::<()>();
        let task = ReadTask {
            channel: self.channel,
            pipe,
            buffer: self.buffer.clone(),
            gate,
            events,
            held: Vec::new(),
            stop: stop.clone(),
            timings: self.timings,
        };
        let handle = thread::Builder::new().name(format!("{}-reader", self.channel.short_name())).spawn(move || {
            let _done = done_tx;
            task.run();
        })?;
        self.worker = Some(Worker { stop, done, handle });
        Ok(())
    }

    /// Asks the thread to drain what is left and exit, then joins it. A
    /// thread that does not finish within the stop timeout is left detached.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.stop.store(true, Ordering::Release);
        match worker.done.recv_timeout(self.timings.stop_timeout) {
            Err(RecvTimeoutError::Timeout) => {
                warn!("{} reader did not stop within {:?}, detaching it", self.channel, self.timings.stop_timeout);
            }
            _ => {
                if worker.handle.join().is_err() {
                    error!("{} reader thread panicked", self.channel);
                }
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.worker.as_ref().is_some_and(|worker| !worker.handle.is_finished())
    }
}

impl Drop for AsyncStreamReader {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ReadTask<R> {
    channel: Channel,
    pipe: Arc<R>,
    buffer: Arc<OutputBuffer>,
    gate: Arc<Latch>,
    events: Arc<dyn ReaderEvents>,
    /// Bytes read while the gate was still closed, not yet announced.
    held: Vec<u8>,
    stop: Arc<AtomicBool>,
    timings: Timings,
}

impl<R: NativeReader> ReadTask<R> {
    fn run(mut self) {
        debug!("{} reader started", self.channel);
        let mut scratch = vec![0u8; READ_CHUNK_SIZE];
        loop {
            if self.stopping() {
                self.final_drain();
                break;
            }
            self.release_held();
            match self.pipe.read_chunk(&mut scratch, self.timings.poll_interval) {
                Ok(Chunk::Data(n)) => self.deliver(&scratch[..n]),
                Ok(Chunk::Idle) => {}
                Ok(Chunk::Closed) => {
                    debug!("{} closed by the child", self.channel);
                    self.await_gate();
                    break;
                }
                Err(e) => {
                    error!("Failed to read {}: {}", self.channel, e);
                    self.events.failed(self.channel, e);
                    break;
                }
            }
        }
        debug!("{} reader exiting", self.channel);
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Collects whatever the child wrote before the stop request, bounded so
    /// that `stop` still gets to join within its timeout.
    fn final_drain(&mut self) {
        let mut tail = Vec::new();
        let deadline = Instant::now() + self.timings.stop_timeout / 2;
        if let Err(e) = platform::drain(&*self.pipe, &mut tail, deadline) {
            debug!("Final drain of {} failed: {}", self.channel, e);
        }
        if !tail.is_empty() {
            self.deliver(&tail);
        }
    }

    fn deliver(&mut self, bytes: &[u8]) {
        self.buffer.append(bytes);
        if self.gate.is_open() {
            self.release_held();
            self.events.data(self.channel, bytes);
        } else {
            self.held.extend_from_slice(bytes);
        }
    }

    fn release_held(&mut self) {
        if !self.held.is_empty() && self.gate.is_open() {
            let held = std::mem::take(&mut self.held);
            self.events.data(self.channel, &held);
        }
    }

    /// Output that arrived before the gate opened is announced once it opens,
    /// unless the reader is stopped first.
    fn await_gate(&mut self) {
        if self.held.is_empty() {
            return;
        }
        while !self.gate.wait_timeout(self.timings.poll_interval) {
            if self.stopping() {
                return;
            }
        }
        self.release_held();
    }
}
