//! Descriptor-based launcher: `fork` + `execve` with three close-on-exec pipes.
use super::{Chunk, Launched, NativeProcess, NativeReader, PlatformLauncher};
use crate::config::ProcessConfiguration;
use crate::lock;
use crate::types::ExitInfo;
use log::*;
use std::ffi::{CString, OsStr, OsString};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Exit code used by a child whose `execve` failed.
const EXEC_FAILED_EXIT_CODE: libc::c_int = 127;

pub(crate) struct DescriptorBased;

impl PlatformLauncher for DescriptorBased {
    type Process = DescriptorProcess;
    type Reader = FdReader;

    fn launch(config: &ProcessConfiguration) -> io::Result<Launched<DescriptorProcess, FdReader>> {
        let plan = ExecPlan::new(config)?;
        let Pipe { read: stdin_read, write: stdin_write } = Pipe::new()?;
        let Pipe { read: stdout_read, write: stdout_write } = Pipe::new()?;
        let Pipe { read: stderr_read, write: stderr_write } = Pipe::new()?;
        let Pipe { read: status_read, write: status_write } = Pipe::new()?;
        let argv = plan.argv_ptrs();
        let envp = plan.envp_ptrs();

        let pid = unsafe { libc::fork() };
        if pid == -1 {
            return Err(io::Error::last_os_error());
        }
        if pid == 0 {
            let stdio = [stdin_read.as_raw_fd(), stdout_write.as_raw_fd(), stderr_write.as_raw_fd()];
            unsafe { exec_child(&plan, &argv, &envp, stdio, status_write.as_raw_fd()) }
        }

        // The child holds its own copies now.
        drop(stdin_read);
        drop(stdout_write);
        drop(stderr_write);
        drop(status_write);

        let process = DescriptorProcess::new(pid);
        match read_exec_status(status_read) {
            Ok(None) => {}
            Ok(Some(errno)) => {
                process.wait_blocking()?;
                return Err(io::Error::from_raw_os_error(errno));
            }
            Err(e) => {
                let _ = process.kill();
                return Err(e);
            }
        }

        if let Err(e) = set_nonblocking(&stdout_read).and_then(|_| set_nonblocking(&stderr_read)) {
            let _ = process.kill();
            return Err(e);
        }

        debug!("Launched `{}` as pid {}", config.program, pid);
        Ok(Launched {
            process,
            stdin: File::from(stdin_write),
            stdout: FdReader::new(stdout_read),
            stderr: FdReader::new(stderr_read),
        })
    }

    fn launch_detached(config: &ProcessConfiguration) -> io::Result<()> {
        let plan = ExecPlan::new(config)?;
        let null = OwnedFd::from(File::options().read(true).write(true).open("/dev/null")?);
        let Pipe { read: status_read, write: status_write } = Pipe::new()?;
        let argv = plan.argv_ptrs();
        let envp = plan.envp_ptrs();

        // Double fork: the intermediate child starts a new session and exits,
        // so the grandchild is adopted by init and never becomes our zombie.
        let pid = unsafe { libc::fork() };
        if pid == -1 {
            return Err(io::Error::last_os_error());
        }
        if pid == 0 {
            let status_fd = status_write.as_raw_fd();
            unsafe {
                if libc::setsid() == -1 {
                    report_errno_and_exit(status_fd, last_errno());
                }
                match libc::fork() {
                    -1 => report_errno_and_exit(status_fd, last_errno()),
                    0 => {
                        let fd = null.as_raw_fd();
                        exec_child(&plan, &argv, &envp, [fd, fd, fd], status_fd)
                    }
                    _ => libc::_exit(0),
                }
            }
        }
        drop(status_write);
        drop(null);

        let intermediate = DescriptorProcess::new(pid);
        intermediate.wait_blocking()?;
        match read_exec_status(status_read)? {
            None => {
                debug!("Launched detached `{}`", config.program);
                Ok(())
            }
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
        }
    }
}

/// A forked child. Its exit status is reaped and cached under one lock, so a
/// signal can never reach a recycled pid and the status is read only once.
#[derive(Debug)]
pub(crate) struct DescriptorProcess {
    pid: libc::pid_t,
    exit: Mutex<Option<ExitInfo>>,
}

impl DescriptorProcess {
    fn new(pid: libc::pid_t) -> Self {
        Self { pid, exit: Mutex::new(None) }
    }

    fn signal(&self, signal: libc::c_int) -> io::Result<()> {
        let exit = lock(&self.exit);
        if exit.is_some() {
            return Ok(());
        }
        cvt(unsafe { libc::kill(self.pid, signal) })?;
        Ok(())
    }

    fn wait_blocking(&self) -> io::Result<ExitInfo> {
        let mut exit = lock(&self.exit);
        if let Some(info) = *exit {
            return Ok(info);
        }
        let info = waitpid_blocking(self.pid)?;
        *exit = Some(info);
        Ok(info)
    }
}

impl NativeProcess for DescriptorProcess {
    fn id(&self) -> u32 {
        self.pid as u32
    }

    fn poll_exit(&self) -> io::Result<Option<ExitInfo>> {
        let mut exit = lock(&self.exit);
        if let Some(info) = *exit {
            return Ok(Some(info));
        }
        let mut status: libc::c_int = 0;
        loop {
            match unsafe { libc::waitpid(self.pid, &mut status, libc::WNOHANG) } {
                0 => return Ok(None),
                -1 => {
                    let err = io::Error::last_os_error();
                    if err.kind() != io::ErrorKind::Interrupted {
                        return Err(err);
                    }
                }
                _ => {
                    let info = decode_wait_status(status);
                    *exit = Some(info);
                    return Ok(Some(info));
                }
            }
        }
    }

    fn terminate(&self) -> io::Result<()> {
        self.signal(libc::SIGTERM)
    }

    fn kill(&self) -> io::Result<()> {
        self.signal(libc::SIGKILL)
    }
}

impl Drop for DescriptorProcess {
    fn drop(&mut self) {
        let exit = self.exit.get_mut().unwrap_or_else(PoisonError::into_inner);
        if exit.is_some() {
            return;
        }
        let mut status: libc::c_int = 0;
        if unsafe { libc::waitpid(self.pid, &mut status, libc::WNOHANG) } != 0 {
            return;
        }
        // Still alive: hand it to a thread that collects the status whenever it exits.
        let pid = self.pid;
        let spawned = std::thread::Builder::new().name(format!("reaper-{}", pid)).spawn(move || {
            match waitpid_blocking(pid) {
                Ok(info) => debug!("Reaped pid {} with code {}", pid, info.code),
                Err(e) => warn!("Failed to reap pid {}: {}", pid, e),
            }
        });
        if let Err(e) = spawned {
            error!("Failed to spawn reaper for pid {}: {}", pid, e);
        }
    }
}

/// Read end of a child's stdout or stderr, switched to non-blocking mode.
#[derive(Debug)]
pub(crate) struct FdReader {
    file: File,
}

impl FdReader {
    fn new(fd: OwnedFd) -> Self {
        Self { file: File::from(fd) }
    }
}

impl NativeReader for FdReader {
    fn read_chunk(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Chunk> {
        let mut pfd = libc::pollfd { fd: self.file.as_raw_fd(), events: libc::POLLIN, revents: 0 };
        let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        match unsafe { libc::poll(&mut pfd, 1, millis) } {
            -1 => {
                let err = io::Error::last_os_error();
                return if err.kind() == io::ErrorKind::Interrupted { Ok(Chunk::Idle) } else { Err(err) };
            }
            0 => return Ok(Chunk::Idle),
            _ => {}
        }
        if pfd.revents & libc::POLLNVAL != 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        // POLLIN, POLLHUP and POLLERR all resolve through read().
        match (&self.file).read(buf) {
            Ok(0) => Ok(Chunk::Closed),
            Ok(n) => Ok(Chunk::Data(n)),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => Ok(Chunk::Idle),
            Err(e) => Err(e),
        }
    }
}

struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl Pipe {
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
    fn new() -> io::Result<Self> {
        let mut fds: [libc::c_int; 2] = [-1, -1];
        cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
        // SAFETY: pipe2 just returned two fresh descriptors that nothing else owns.
        Ok(unsafe { Self { read: OwnedFd::from_raw_fd(fds[0]), write: OwnedFd::from_raw_fd(fds[1]) } })
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd")))]
    fn new() -> io::Result<Self> {
        let mut fds: [libc::c_int; 2] = [-1, -1];
        cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
        // SAFETY: pipe just returned two fresh descriptors that nothing else owns.
        let pipe = unsafe { Self { read: OwnedFd::from_raw_fd(fds[0]), write: OwnedFd::from_raw_fd(fds[1]) } };
        set_cloexec(&pipe.read)?;
        set_cloexec(&pipe.write)?;
        Ok(pipe)
    }
}

/// Everything the child needs, allocated before `fork` so the child only
/// performs async-signal-safe calls.
struct ExecPlan {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    cwd: Option<CString>,
}

impl ExecPlan {
    fn new(config: &ProcessConfiguration) -> io::Result<Self> {
        let environment: Vec<OsString> = match &config.environment {
            Some(env) => env.iter().map(OsString::from).collect(),
            None => std::env::vars_os()
                .map(|(key, value)| {
                    let mut entry = key;
                    entry.push("=");
                    entry.push(value);
                    entry
                })
                .collect(),
        };
        let program = resolve_program(&config.program, config.environment.as_deref())?;

        let mut argv = Vec::with_capacity(config.arguments.len() + 1);
        argv.push(c_string(OsStr::new(&config.program))?);
        for arg in &config.arguments {
            argv.push(c_string(OsStr::new(arg))?);
        }
        let envp = environment.into_iter().map(|var| c_string(&var)).collect::<io::Result<Vec<_>>>()?;
        let cwd = config.working_directory.as_deref().map(|dir| c_string(dir.as_os_str())).transpose()?;

        Ok(Self { program: c_string(program.as_os_str())?, argv, envp, cwd })
    }

    fn argv_ptrs(&self) -> Vec<*const libc::c_char> {
        self.argv.iter().map(|arg| arg.as_ptr()).chain(std::iter::once(std::ptr::null())).collect()
    }

    fn envp_ptrs(&self) -> Vec<*const libc::c_char> {
        self.envp.iter().map(|var| var.as_ptr()).chain(std::iter::once(std::ptr::null())).collect()
    }
}

/// Runs in the forked child. Never returns: either the image is replaced or
/// the errno is written to `status_fd` and the child exits.
unsafe fn exec_child(
    plan: &ExecPlan,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
    stdio: [RawFd; 3],
    status_fd: RawFd,
) -> ! {
    let errno = unsafe { prepare_and_exec(plan, argv, envp, stdio) };
    unsafe { report_errno_and_exit(status_fd, errno) }
}

unsafe fn prepare_and_exec(
    plan: &ExecPlan,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
    stdio: [RawFd; 3],
) -> libc::c_int {
    unsafe {
        for (target, fd) in stdio.into_iter().enumerate() {
            let target = target as libc::c_int;
            // dup2 onto itself keeps FD_CLOEXEC, so clear it explicitly.
            let ret = if fd == target { libc::fcntl(fd, libc::F_SETFD, 0) } else { libc::dup2(fd, target) };
            if ret == -1 {
                return last_errno();
            }
        }

        // Rust ignores SIGPIPE in the parent; the new image expects the default.
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        let mut empty: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut empty);
        libc::pthread_sigmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());

        if let Some(cwd) = &plan.cwd {
            if libc::chdir(cwd.as_ptr()) == -1 {
                return last_errno();
            }
        }

        libc::execve(plan.program.as_ptr(), argv.as_ptr(), envp.as_ptr());
        last_errno()
    }
}

unsafe fn report_errno_and_exit(status_fd: RawFd, errno: libc::c_int) -> ! {
    let bytes = errno.to_ne_bytes();
    unsafe {
        libc::write(status_fd, bytes.as_ptr().cast(), bytes.len());
        libc::_exit(EXEC_FAILED_EXIT_CODE)
    }
}

/// Reads the status pipe until EOF. `None` means the image was replaced,
/// `Some(errno)` is the child's failure.
fn read_exec_status(fd: OwnedFd) -> io::Result<Option<i32>> {
    let mut file = File::from(fd);
    let mut bytes = [0u8; 4];
    let mut filled = 0;
    while filled < bytes.len() {
        match file.read(&mut bytes[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    match filled {
        0 => Ok(None),
        4 => Ok(Some(i32::from_ne_bytes(bytes))),
        n => Err(io::Error::other(format!("short read of {} bytes from exec status pipe", n))),
    }
}

/// Finds `program` the way `execvp` would, using the child's `PATH` when an
/// environment replacement is configured.
fn resolve_program(program: &str, environment: Option<&[String]>) -> io::Result<PathBuf> {
    if program.contains('/') {
        return Ok(PathBuf::from(program));
    }
    let search_path = match environment {
        Some(env) => env.iter().find_map(|var| var.strip_prefix("PATH=")).map(OsString::from),
        None => std::env::var_os("PATH"),
    }
    .unwrap_or_else(|| OsString::from("/usr/local/bin:/usr/bin:/bin"));

    std::env::split_paths(&search_path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("`{}` was not found in PATH", program)))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path).map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0).unwrap_or(false)
}

fn c_string(value: &OsStr) -> io::Result<CString> {
    CString::new(value.to_os_string().into_vec())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("{:?} contains an interior nul byte", value)))
}

fn decode_wait_status(status: libc::c_int) -> ExitInfo {
    if libc::WIFEXITED(status) {
        ExitInfo::normal(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        ExitInfo::crashed(libc::WTERMSIG(status))
    } else {
        ExitInfo::crashed(status)
    }
}

fn waitpid_blocking(pid: libc::pid_t) -> io::Result<ExitInfo> {
    let mut status: libc::c_int = 0;
    loop {
        if unsafe { libc::waitpid(pid, &mut status, 0) } != -1 {
            return Ok(decode_wait_status(status));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = cvt(unsafe { libc::fcntl(raw, libc::F_GETFL) })?;
    cvt(unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd")))]
fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = cvt(unsafe { libc::fcntl(raw, libc::F_GETFD) })?;
    cvt(unsafe { libc::fcntl(raw, libc::F_SETFD, flags | libc::FD_CLOEXEC) })?;
    Ok(())
}

fn last_errno() -> libc::c_int {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL)
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 { Err(io::Error::last_os_error()) } else { Ok(ret) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Instant;

    fn wait_for_exit(process: &DescriptorProcess) -> ExitInfo {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(info) = process.poll_exit().unwrap() {
                return info;
            }
            assert!(Instant::now() < deadline, "child did not exit in time");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn bare_names_resolve_through_path() {
        let sh = resolve_program("sh", None).unwrap();
        assert!(sh.is_absolute());
        assert!(resolve_program("definitely-not-a-real-program-name", None).is_err());
        assert_eq!(resolve_program("./local", None).unwrap(), PathBuf::from("./local"));
    }

    #[test]
    fn configured_path_wins_over_parent_path() {
        let env = vec!["PATH=/nonexistent-dir".to_string()];
        let err = resolve_program("sh", Some(&env)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn exit_code_is_decoded() {
        let config = ProcessConfiguration::new("sh").with_arguments(vec!["-c", "exit 7"]);
        let launched = DescriptorBased::launch(&config).unwrap();
        assert_eq!(wait_for_exit(&launched.process), ExitInfo::normal(7));
        // Cached after the reap.
        assert_eq!(launched.process.poll_exit().unwrap(), Some(ExitInfo::normal(7)));
    }

    #[test]
    fn signal_is_reported_as_crash() {
        let config = ProcessConfiguration::new("sleep").with_argument("10");
        let launched = DescriptorBased::launch(&config).unwrap();
        launched.process.kill().unwrap();
        assert_eq!(wait_for_exit(&launched.process), ExitInfo::crashed(libc::SIGKILL));
        // Signalling a reaped child is a no-op.
        launched.process.terminate().unwrap();
    }

    #[test]
    fn exec_failure_is_reported_synchronously() {
        let err = DescriptorBased::launch(&ProcessConfiguration::new("/no/such/binary")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        let script = tempfile::NamedTempFile::new().unwrap();
        let config = ProcessConfiguration::new(script.path().to_string_lossy());
        let err = DescriptorBased::launch(&config).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn pipes_carry_bytes_both_ways() {
        let config = ProcessConfiguration::new("cat");
        let mut launched = DescriptorBased::launch(&config).unwrap();
        launched.stdin.write_all(b"ping").unwrap();
        drop(launched.stdin);

        let mut out = Vec::new();
        let mut scratch = [0u8; 64];
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            match launched.stdout.read_chunk(&mut scratch, Duration::from_millis(100)).unwrap() {
                Chunk::Data(n) => out.extend_from_slice(&scratch[..n]),
                Chunk::Idle => {}
                Chunk::Closed => break,
            }
        }
        assert_eq!(out, b"ping");
        assert_eq!(wait_for_exit(&launched.process), ExitInfo::normal(0));
    }

    #[test]
    fn environment_and_directory_apply_only_to_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let parent_dir = std::env::current_dir().unwrap();
        let config = ProcessConfiguration::new("/bin/sh")
            .with_arguments(vec!["-c", "printf '%s:%s' \"$ONLY_IN_CHILD\" \"$(pwd)\""])
            .with_working_directory(dir.path())
            .with_environment(vec!["ONLY_IN_CHILD=yes"]);
        let launched = DescriptorBased::launch(&config).unwrap();
        wait_for_exit(&launched.process);

        let mut out = Vec::new();
        super::super::drain(&launched.stdout, &mut out, Instant::now() + Duration::from_secs(1)).unwrap();
        let text = String::from_utf8(out).unwrap();
        let expected_dir = dir.path().canonicalize().unwrap();
        assert_eq!(text, format!("yes:{}", expected_dir.display()));
        assert!(std::env::var_os("ONLY_IN_CHILD").is_none());
        assert_eq!(std::env::current_dir().unwrap(), parent_dir);
    }
}
