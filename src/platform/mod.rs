//! Native process creation behind one trait.
//!
//! [`PlatformLauncher`] describes what the controller needs from the operating
//! system. Exactly one implementation is compiled in:
//!
//! - **Unix** ([`unix::DescriptorBased`]): `fork` + `execve`, integer file
//!   descriptors, `waitpid` for liveness and signals for termination.
//! - **Windows** ([`windows::HandleBased`]): `CreateProcessW` with inheritable
//!   pipe handles, `GetExitCodeProcess` for liveness and `TerminateProcess`.
//!
//! The rest of the crate only names the aliases [`Native`], [`Process`] and
//! [`PipeReader`], so it never sees which model is active.
use crate::config::ProcessConfiguration;
use crate::types::ExitInfo;
use std::fs::File;
use std::io;
use std::time::{Duration, Instant};

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub(crate) use unix::DescriptorBased as Native;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub(crate) use windows::HandleBased as Native;

pub(crate) type Process = <Native as PlatformLauncher>::Process;
pub(crate) type PipeReader = <Native as PlatformLauncher>::Reader;

/// Size of the scratch buffer used for every pipe read.
pub(crate) const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Sentinel exit code reported after a forced kill.
pub(crate) const KILL_EXIT_CODE: i32 = 9;

/// Exit code reported when a terminated child did not exit within its grace
/// period. Windows children are terminated with it too.
pub(crate) const TERMINATE_EXIT_CODE: i32 = 15;

/// Result of one bounded read attempt on an output pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Chunk {
    /// `n` bytes were copied into the scratch buffer.
    Data(usize),
    /// Nothing became readable before the timeout.
    Idle,
    /// The write end was closed and everything has been read.
    Closed,
}

/// A spawned child as seen by the controller and the status monitor.
pub(crate) trait NativeProcess: Send + Sync + 'static {
    fn id(&self) -> u32;

    /// Non-blocking liveness query. `Ok(None)` while the child runs; once the
    /// child has exited the same exit information is returned on every call.
    fn poll_exit(&self) -> io::Result<Option<ExitInfo>>;

    /// Polite termination request.
    fn terminate(&self) -> io::Result<()>;

    /// Forceful termination.
    fn kill(&self) -> io::Result<()>;
}

/// Parent side of a child's stdout or stderr.
pub(crate) trait NativeReader: Send + Sync + 'static {
    /// Waits at most `timeout` for data, then performs one non-blocking read.
    fn read_chunk(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Chunk>;
}

/// Endpoints handed back by a successful launch. The parent owns all of them.
#[derive(Debug)]
pub(crate) struct Launched<P, R> {
    pub process: P,
    pub stdin: File,
    pub stdout: R,
    pub stderr: R,
}

pub(crate) trait PlatformLauncher {
    type Process: NativeProcess;
    type Reader: NativeReader;

    /// Creates the three pipes and spawns the child. On failure every endpoint
    /// created so far has already been closed.
    fn launch(config: &ProcessConfiguration) -> io::Result<Launched<Self::Process, Self::Reader>>;

    /// Spawns a child that outlives the caller: null standard streams, a new
    /// session or process group, and no handle kept by the parent.
    fn launch_detached(config: &ProcessConfiguration) -> io::Result<()>;
}

/// Copies whatever is already queued on `pipe` into `out` without waiting for
/// more. Stops at the first idle read, at end of stream, or at `deadline`.
pub(crate) fn drain<R: NativeReader + ?Sized>(pipe: &R, out: &mut Vec<u8>, deadline: Instant) -> io::Result<()> {
    let mut scratch = vec![0u8; READ_CHUNK_SIZE];
    while Instant::now() < deadline {
        match pipe.read_chunk(&mut scratch, Duration::ZERO)? {
            Chunk::Data(n) => out.extend_from_slice(&scratch[..n]),
            Chunk::Idle | Chunk::Closed => break,
        }
    }
    Ok(())
}
