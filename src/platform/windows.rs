//! Handle-based launcher: `CreateProcessW` with inheritable anonymous pipes.
use super::{Chunk, KILL_EXIT_CODE, Launched, NativeProcess, NativeReader, PlatformLauncher, TERMINATE_EXIT_CODE};
use crate::config::ProcessConfiguration;
use crate::lock;
use crate::types::ExitInfo;
use log::*;
use std::ffi::OsStr;
use std::fs::File;
use std::io::{self, Read};
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
use std::ptr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use winapi::shared::minwindef::{DWORD, FALSE, TRUE};
use winapi::shared::winerror::{ERROR_BROKEN_PIPE, WAIT_TIMEOUT};
use winapi::um::handleapi::SetHandleInformation;
use winapi::um::minwinbase::{SECURITY_ATTRIBUTES, STILL_ACTIVE};
use winapi::um::namedpipeapi::{CreatePipe, PeekNamedPipe};
use winapi::um::processthreadsapi::{
    CreateProcessW, GetExitCodeProcess, PROCESS_INFORMATION, STARTUPINFOW, TerminateProcess,
};
use winapi::um::synchapi::WaitForSingleObject;
use winapi::um::winbase::{
    CREATE_NEW_PROCESS_GROUP, CREATE_NO_WINDOW, CREATE_UNICODE_ENVIRONMENT, DETACHED_PROCESS, HANDLE_FLAG_INHERIT,
    STARTF_USESTDHANDLES,
};
use winapi::um::winnt::HANDLE;

/// Held while inheritable handles exist, so a concurrent launch cannot leak
/// another child's pipe ends into its own child.
static SPAWN_LOCK: Mutex<()> = Mutex::new(());

/// Exit codes at or above this value are NTSTATUS failures (access
/// violation, stack overflow, ...), i.e. the child crashed.
const NTSTATUS_ERROR: u32 = 0xC000_0000;

/// How often `read_chunk` re-checks a pipe that has nothing queued.
const PEEK_INTERVAL: Duration = Duration::from_millis(10);

pub(crate) struct HandleBased;

impl PlatformLauncher for HandleBased {
    type Process = HandleProcess;
    type Reader = HandleReader;

    fn launch(config: &ProcessConfiguration) -> io::Result<Launched<HandleProcess, HandleReader>> {
        let spawning = lock(&SPAWN_LOCK);
        let (stdin_read, stdin_write) = create_pipe(PipeSide::Write)?;
        let (stdout_read, stdout_write) = create_pipe(PipeSide::Read)?;
        let (stderr_read, stderr_write) = create_pipe(PipeSide::Read)?;

        let info = spawn(config, [&stdin_read, &stdout_write, &stderr_write], CREATE_NO_WINDOW)?;
        // Child-facing ends now live in the child.
        drop(stdin_read);
        drop(stdout_write);
        drop(stderr_write);
        drop(spawning);

        let process = HandleProcess::from_information(info);
        debug!("Launched `{}` as pid {}", config.program, process.pid);
        Ok(Launched {
            process,
            stdin: File::from(stdin_write),
            stdout: HandleReader::new(stdout_read),
            stderr: HandleReader::new(stderr_read),
        })
    }

    fn launch_detached(config: &ProcessConfiguration) -> io::Result<()> {
        let null = File::options().read(true).write(true).open("NUL")?;
        let null = OwnedHandle::from(null);
        let spawning = lock(&SPAWN_LOCK);
        set_inheritable(&null, true)?;

        let info = spawn(config, [&null, &null, &null], DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP)?;
        drop(null);
        drop(spawning);
        let process = HandleProcess::from_information(info);
        debug!("Launched detached `{}` as pid {}", config.program, process.pid);
        Ok(())
    }
}

/// A process handle plus the cached exit information.
pub(crate) struct HandleProcess {
    handle: OwnedHandle,
    pid: u32,
    exit: Mutex<Option<ExitInfo>>,
    /// Exit code we forced through `TerminateProcess`, if any.
    terminated_with: Mutex<Option<u32>>,
}

impl HandleProcess {
    fn from_information(info: PROCESS_INFORMATION) -> Self {
        // The primary thread handle is never used.
        unsafe {
            drop(OwnedHandle::from_raw_handle(info.hThread as RawHandle));
        }
        Self {
            handle: unsafe { OwnedHandle::from_raw_handle(info.hProcess as RawHandle) },
            pid: info.dwProcessId,
            exit: Mutex::new(None),
            terminated_with: Mutex::new(None),
        }
    }

    fn raw(&self) -> HANDLE {
        self.handle.as_raw_handle() as HANDLE
    }

    fn terminate_with(&self, code: u32) -> io::Result<()> {
        let exit = lock(&self.exit);
        if exit.is_some() {
            return Ok(());
        }
        if unsafe { TerminateProcess(self.raw(), code) } == 0 {
            let err = io::Error::last_os_error();
            // Access denied is what TerminateProcess reports for a process that already exited.
            if err.kind() != io::ErrorKind::PermissionDenied {
                return Err(err);
            }
            return Ok(());
        }
        *lock(&self.terminated_with) = Some(code);
        Ok(())
    }
}

impl NativeProcess for HandleProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn poll_exit(&self) -> io::Result<Option<ExitInfo>> {
        let mut exit = lock(&self.exit);
        if let Some(info) = *exit {
            return Ok(Some(info));
        }
        let mut code: DWORD = 0;
        if unsafe { GetExitCodeProcess(self.raw(), &mut code) } == 0 {
            return Err(io::Error::last_os_error());
        }
        // STILL_ACTIVE is also a legal exit code, so confirm with a zero wait.
        if code == STILL_ACTIVE && unsafe { WaitForSingleObject(self.raw(), 0) } == WAIT_TIMEOUT {
            return Ok(None);
        }
        let forced = *lock(&self.terminated_with) == Some(code);
        let info = if forced || code >= NTSTATUS_ERROR { ExitInfo::crashed(code as i32) } else { ExitInfo::normal(code as i32) };
        *exit = Some(info);
        Ok(Some(info))
    }

    fn terminate(&self) -> io::Result<()> {
        self.terminate_with(TERMINATE_EXIT_CODE as u32)
    }

    fn kill(&self) -> io::Result<()> {
        self.terminate_with(KILL_EXIT_CODE as u32)
    }
}

/// Parent read end of an anonymous pipe. Anonymous pipes cannot be
/// overlapped, so readiness is detected with `PeekNamedPipe`.
pub(crate) struct HandleReader {
    file: File,
}

impl HandleReader {
    fn new(handle: OwnedHandle) -> Self {
        Self { file: File::from(handle) }
    }

    fn available(&self) -> io::Result<Option<DWORD>> {
        let mut available: DWORD = 0;
        let ok = unsafe {
            PeekNamedPipe(
                self.file.as_raw_handle() as HANDLE,
                ptr::null_mut(),
                0,
                ptr::null_mut(),
                &mut available,
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            let err = io::Error::last_os_error();
            return if err.raw_os_error() == Some(ERROR_BROKEN_PIPE as i32) { Ok(None) } else { Err(err) };
        }
        Ok(Some(available))
    }
}

impl NativeReader for HandleReader {
    fn read_chunk(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Chunk> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.available()? {
                None => return Ok(Chunk::Closed),
                Some(0) => {}
                Some(available) => {
                    let len = buf.len().min(available as usize);
                    return match (&self.file).read(&mut buf[..len]) {
                        Ok(0) => Ok(Chunk::Closed),
                        Ok(n) => Ok(Chunk::Data(n)),
                        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(Chunk::Closed),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(Chunk::Idle),
                        Err(e) => Err(e),
                    };
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Chunk::Idle);
            }
            std::thread::sleep(PEEK_INTERVAL.min(deadline - now));
        }
    }
}

/// Which end of a pipe the parent keeps; that end is made non-inheritable.
enum PipeSide {
    Read,
    Write,
}

/// Returns `(read, write)`, both owned so that early returns close them.
fn create_pipe(parent_keeps: PipeSide) -> io::Result<(OwnedHandle, OwnedHandle)> {
    let mut attributes = SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as DWORD,
        lpSecurityDescriptor: ptr::null_mut(),
        bInheritHandle: TRUE,
    };
    let mut read: HANDLE = ptr::null_mut();
    let mut write: HANDLE = ptr::null_mut();
    if unsafe { CreatePipe(&mut read, &mut write, &mut attributes, 0) } == 0 {
        return Err(io::Error::last_os_error());
    }
    let (read, write) =
        unsafe { (OwnedHandle::from_raw_handle(read as RawHandle), OwnedHandle::from_raw_handle(write as RawHandle)) };
    match parent_keeps {
        PipeSide::Read => set_inheritable(&read, false)?,
        PipeSide::Write => set_inheritable(&write, false)?,
    }
    Ok((read, write))
}

fn set_inheritable(handle: &OwnedHandle, inheritable: bool) -> io::Result<()> {
    let flags = if inheritable { HANDLE_FLAG_INHERIT } else { 0 };
    if unsafe { SetHandleInformation(handle.as_raw_handle() as HANDLE, HANDLE_FLAG_INHERIT, flags) } == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn spawn(config: &ProcessConfiguration, stdio: [&OwnedHandle; 3], flags: DWORD) -> io::Result<PROCESS_INFORMATION> {
    let mut command_line = wide(&build_command_line(&config.program, &config.arguments));
    let environment = config.environment.as_deref().map(environment_block);
    let directory = config.working_directory.as_deref().map(|dir| wide(&dir.to_string_lossy()));

    let mut startup: STARTUPINFOW = unsafe { std::mem::zeroed() };
    startup.cb = std::mem::size_of::<STARTUPINFOW>() as DWORD;
    startup.dwFlags |= STARTF_USESTDHANDLES;
    startup.hStdInput = stdio[0].as_raw_handle() as HANDLE;
    startup.hStdOutput = stdio[1].as_raw_handle() as HANDLE;
    startup.hStdError = stdio[2].as_raw_handle() as HANDLE;

    let mut info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };
    let ok = unsafe {
        CreateProcessW(
            ptr::null(),
            command_line.as_mut_ptr(),
            ptr::null_mut(),
            ptr::null_mut(),
            TRUE,
            flags | CREATE_UNICODE_ENVIRONMENT,
            environment.as_ref().map_or(ptr::null_mut(), |block| block.as_ptr() as *mut _),
            directory.as_ref().map_or(ptr::null(), |dir| dir.as_ptr()),
            &mut startup,
            &mut info,
        )
    };
    if ok == FALSE {
        return Err(io::Error::last_os_error());
    }
    Ok(info)
}

/// Joins program and arguments into one command line using the quoting rules
/// of the Microsoft C runtime.
fn build_command_line(program: &str, arguments: &[String]) -> String {
    let mut line = String::new();
    append_quoted(&mut line, program);
    for arg in arguments {
        line.push(' ');
        append_quoted(&mut line, arg);
    }
    line
}

fn append_quoted(line: &mut String, arg: &str) {
    let needs_quotes = arg.is_empty() || arg.contains([' ', '\t', '\n', '\u{0b}', '"']);
    if !needs_quotes {
        line.push_str(arg);
        return;
    }
    line.push('"');
    let mut backslashes = 0;
    for c in arg.chars() {
        if c == '\\' {
            backslashes += 1;
            continue;
        }
        // Backslashes are literal unless they precede a quote.
        let escaped = if c == '"' { backslashes * 2 + 1 } else { backslashes };
        line.extend(std::iter::repeat_n('\\', escaped));
        line.push(c);
        backslashes = 0;
    }
    line.extend(std::iter::repeat_n('\\', backslashes * 2));
    line.push('"');
}

/// `NAME=VALUE\0...\0\0`, UTF-16.
fn environment_block(environment: &[String]) -> Vec<u16> {
    let mut block = Vec::new();
    for var in environment {
        block.extend(OsStr::new(var).encode_wide());
        block.push(0);
    }
    if environment.is_empty() {
        block.push(0);
    }
    block.push(0);
    block
}

fn wide(value: &str) -> Vec<u16> {
    OsStr::new(value).encode_wide().chain(std::iter::once(0)).collect()
}
