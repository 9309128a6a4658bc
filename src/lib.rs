//! # Child Process Control
//!
//! This crate launches an external program, feeds its standard input, collects its standard output
//! and standard error on background threads, notices when it exits, and reports everything through
//! replaceable callbacks. It works the same way on Unix (`fork`/`execve`, file descriptors, signals)
//! and on Windows (`CreateProcessW`, pipe handles, `TerminateProcess`).
//!
//! ## Key Components
//!
//! - **`ProcessController`**: The public handle. Starts, writes to, reads from, waits for and stops
//!   one child at a time, and can be reused once a run has finished.
//! - **`ProcessConfiguration`**: Program, arguments, working directory and environment of a launch.
//!   Serializable, so launches can be described in configuration files.
//! - **`Timings`**: Poll interval of the background threads, how long a stop waits for them, and
//!   the grace period a terminated child gets before it is reported as killed.
//!
//! ## Background Work
//!
//! Every run owns three threads:
//!
//! - a **reader** per output channel that reads bounded chunks, appends them to the channel's
//!   buffer and invokes the ready-read callback;
//! - a **status monitor** that polls the operating system for the child's exit and finishes the run.
//!
//! Callbacks run on those threads, never while an internal lock is held, so a callback may call
//! back into the controller. A panicking callback is logged and otherwise ignored.
//!
//! ## Event Order
//!
//! For one run the callbacks arrive in this order: `started`, any number of ready-read chunks,
//! then exactly one `finished`. Output read before `started` was emitted is buffered but not
//! delivered to the ready-read callbacks. When the child crashes, the error callback receives
//! [`ProcessError::Crashed`] just before `finished`.
//!
//! ## Example Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio_process_control::{ExitStatus, ProcessController};
//!
//! let process = ProcessController::new();
//! process.set_ready_read_standard_output_callback(|bytes| print!("{}", String::from_utf8_lossy(bytes)));
//! process.start("cat", Vec::<String>::new()).expect("failed to start cat");
//! process.write("hello\n").expect("failed to write");
//! process.close_write_channel();
//!
//! assert!(process.wait_for_finished(Some(Duration::from_secs(5))));
//! assert_eq!(process.exit_status(), ExitStatus::NormalExit);
//! ```
//!
//! ## Error Handling
//!
//! - Fallible calls return `anyhow::Result`. The cause is classified by a [`ProcessError`] kept in
//!   the error chain; use `err.downcast_ref::<ProcessError>()` to match on it.
//! - The controller also keeps the most recent error (see `ProcessController::error`) and reports
//!   every error to the error callback.
//!
//! ## Dependencies
//!
//! - **Tokio**: Watch channels and timeouts behind the async wait methods.
//! - **Serde**: Serialization of configurations, timings and the public enums.
//! - **Anyhow**: Error propagation with context.
//! - **Log**: Diagnostics from the launch path and the background threads.
//! - **libc / winapi**: The native process and pipe calls.
use std::sync::{Mutex, MutexGuard, PoisonError};

mod config;
mod controller;
mod events;
mod monitor;
mod platform;
mod reader;
mod status;
mod types;

pub use config::{ProcessConfiguration, Timings, validate_environment_entry, validate_working_directory};
pub use controller::ProcessController;
pub use types::{Channel, ExitStatus, ProcessError, ProcessState};

/// Locks `mutex`, recovering the data if a panicking thread poisoned it.
/// Callbacks run outside every lock, so poisoning can only come from a bug
/// in this crate, and the guarded data is still consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
