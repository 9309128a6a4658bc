#![cfg(unix)]

use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_process_control::{ExitStatus, ProcessController, ProcessError, ProcessState, Timings};

const WAIT: Option<Duration> = Some(Duration::from_secs(10));

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn controller() -> ProcessController {
    init_logging();
    ProcessController::with_timings(Timings { poll_interval: Duration::from_millis(10), ..Timings::default() })
}

/// Collects every finished event as `(code, status)`.
fn record_finished(process: &ProcessController) -> Arc<Mutex<Vec<(i32, ExitStatus)>>> {
    let finished = Arc::new(Mutex::new(Vec::new()));
    let sink = finished.clone();
    process.set_finished_callback(move |code, status| sink.lock().unwrap().push((code, status)));
    finished
}

#[test]
fn test_echo_output_and_exit() -> Result<()> {
    let process = controller();
    let finished = record_finished(&process);

    process.start("echo", ["hello"])?;
    assert!(process.wait_for_finished(WAIT));

    assert_eq!(process.read_all_standard_output()?, b"hello\n");
    assert_eq!(process.exit_code(), 0);
    assert_eq!(process.exit_status(), ExitStatus::NormalExit);
    assert_eq!(process.state(), ProcessState::NotRunning);
    assert_eq!(*finished.lock().unwrap(), vec![(0, ExitStatus::NormalExit)]);
    Ok(())
}

#[test]
fn test_exit_code_and_stderr() -> Result<()> {
    let process = controller();
    process.start("sh", ["-c", "echo oops >&2; exit 3"])?;
    assert!(process.wait_for_finished(WAIT));

    assert_eq!(process.exit_code(), 3);
    assert_eq!(process.exit_status(), ExitStatus::NormalExit);
    assert_eq!(process.read_all_standard_error()?, b"oops\n");
    assert!(process.read_all_standard_output()?.is_empty());
    Ok(())
}

#[test]
fn test_missing_program_fails_to_start() {
    let process = controller();
    let finished = record_finished(&process);

    let err = process.start("/no/such/binary", Vec::<String>::new()).unwrap_err();
    assert_eq!(err.downcast_ref::<ProcessError>(), Some(&ProcessError::FailedToStart));
    assert_eq!(process.error(), ProcessError::FailedToStart);
    assert_eq!(process.state(), ProcessState::NotRunning);
    assert!(!process.wait_for_finished(Some(Duration::from_millis(100))));
    assert!(finished.lock().unwrap().is_empty());
}

#[test]
fn test_kill_reports_crash_exit() -> Result<()> {
    let process = controller();
    let finished = record_finished(&process);

    process.start("sleep", ["10"])?;
    std::thread::sleep(Duration::from_millis(200));
    assert!(process.is_running());
    process.kill();

    assert_eq!(process.state(), ProcessState::NotRunning);
    assert_eq!(process.exit_status(), ExitStatus::CrashExit);
    assert_eq!(process.exit_code(), 9);
    assert!(!process.is_running());
    assert_eq!(*finished.lock().unwrap(), vec![(9, ExitStatus::CrashExit)]);
    Ok(())
}

#[test]
fn test_terminate_reports_crash_exit() -> Result<()> {
    let process = controller();
    process.start("sleep", ["10"])?;
    process.terminate();

    assert_eq!(process.state(), ProcessState::NotRunning);
    assert_eq!(process.exit_status(), ExitStatus::CrashExit);
    assert_eq!(process.exit_code(), 15);
    Ok(())
}

#[test]
fn test_shutdown_kills_a_child_that_ignores_terminate() -> Result<()> {
    let process = controller();
    process.start("sh", ["-c", "trap '' TERM; exec sleep 10"])?;
    std::thread::sleep(Duration::from_millis(200));

    let began = std::time::Instant::now();
    process.shutdown(Duration::from_millis(300));
    assert!(began.elapsed() < Duration::from_secs(5));
    assert_eq!(process.exit_status(), ExitStatus::CrashExit);
    assert_eq!(process.exit_code(), 9);
    Ok(())
}

#[test]
fn test_self_inflicted_crash_is_reported_before_finished() -> Result<()> {
    let process = controller();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    process.set_error_callback(move |error| sink.lock().unwrap().push(format!("error:{:?}", error)));
    let sink = events.clone();
    process.set_finished_callback(move |code, status| sink.lock().unwrap().push(format!("finished:{}:{:?}", code, status)));

    process.start("sh", ["-c", "kill -9 $$"])?;
    assert!(process.wait_for_finished(WAIT));

    assert_eq!(process.error(), ProcessError::Crashed);
    assert_eq!(*events.lock().unwrap(), vec!["error:Crashed".to_string(), "finished:9:CrashExit".to_string()]);
    Ok(())
}

#[test]
fn test_wait_for_finished_times_out() -> Result<()> {
    let process = controller();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    process.set_error_callback(move |error| sink.lock().unwrap().push(error));
    process.start("sleep", ["5"])?;

    assert!(!process.wait_for_finished(Some(Duration::from_millis(100))));
    assert_eq!(process.error(), ProcessError::NoError);
    assert!(errors.lock().unwrap().is_empty());
    assert!(process.is_running());
    assert_eq!(process.state(), ProcessState::Running);

    process.kill();
    assert!(process.wait_for_finished(Some(Duration::from_millis(100))));
    Ok(())
}

/// A terminate call that loses the race returns only after the winner has finished the run.
#[test]
fn test_second_terminate_waits_for_the_first() -> Result<()> {
    init_logging();
    let process = Arc::new(ProcessController::with_timings(Timings {
        poll_interval: Duration::from_millis(10),
        terminate_grace: Duration::from_secs(1),
        ..Timings::default()
    }));
    let finished = record_finished(&process);
    process.start("sh", ["-c", "trap '' TERM; exec sleep 3"])?;
    std::thread::sleep(Duration::from_millis(200));

    let first = {
        let process = process.clone();
        std::thread::spawn(move || process.terminate())
    };
    std::thread::sleep(Duration::from_millis(50));
    process.terminate();

    assert_eq!(process.state(), ProcessState::NotRunning);
    assert_eq!(finished.lock().unwrap().len(), 1);
    first.join().unwrap();
    assert_eq!(finished.lock().unwrap().len(), 1);
    Ok(())
}

#[test]
fn test_wait_for_started_after_start() -> Result<()> {
    let process = controller();
    assert!(!process.wait_for_started(Some(Duration::from_millis(50))));

    process.start("sleep", ["1"])?;
    assert!(process.wait_for_started(WAIT));
    assert!(process.process_id().is_some());
    process.kill();
    assert!(process.process_id().is_none());
    Ok(())
}

#[test]
fn test_bad_working_directory_is_rejected() {
    let process = controller();
    let err = process.set_working_directory("/path/does/not/exist").unwrap_err();
    assert_eq!(err.downcast_ref::<ProcessError>(), Some(&ProcessError::FailedToStart));
    assert_eq!(process.working_directory(), None);
}

#[test]
fn test_working_directory_applies_to_child() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let process = controller();
    process.set_working_directory(dir.path())?;
    assert_eq!(process.working_directory().as_deref(), Some(dir.path()));

    process.start("pwd", Vec::<String>::new())?;
    assert!(process.wait_for_finished(WAIT));

    let printed = String::from_utf8(process.read_all_standard_output()?)?;
    assert_eq!(std::fs::canonicalize(printed.trim())?, std::fs::canonicalize(dir.path())?);
    Ok(())
}

#[test]
fn test_environment_replaces_the_parents() -> Result<()> {
    let process = controller();
    assert!(process.set_environment(vec!["BROKEN"]).is_err());
    assert_eq!(process.environment(), None);

    process.set_environment(vec!["FOO=bar"])?;
    assert_eq!(process.environment(), Some(vec!["FOO=bar".to_string()]));

    process.start("/usr/bin/env", Vec::<String>::new())?;
    assert!(process.wait_for_finished(WAIT));
    assert_eq!(process.read_all_standard_output()?, b"FOO=bar\n");
    Ok(())
}

#[test]
fn test_write_after_close_fails() -> Result<()> {
    let process = controller();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    process.set_error_callback(move |error| sink.lock().unwrap().push(error));

    process.start("cat", Vec::<String>::new())?;
    process.write("x")?;
    process.close_write_channel();

    let err = process.write("y").unwrap_err();
    assert_eq!(err.downcast_ref::<ProcessError>(), Some(&ProcessError::WriteError));
    assert_eq!(process.error(), ProcessError::WriteError);
    assert_eq!(*errors.lock().unwrap(), vec![ProcessError::WriteError]);

    assert!(process.wait_for_finished(WAIT));
    assert_eq!(process.read_all_standard_output()?, b"x");
    Ok(())
}

#[test]
fn test_write_without_a_child_fails() {
    let process = controller();
    let err = process.write("data").unwrap_err();
    assert_eq!(err.downcast_ref::<ProcessError>(), Some(&ProcessError::WriteError));
    assert!(process.write("").is_ok());
}

#[test]
fn test_start_while_running_fails() -> Result<()> {
    let process = controller();
    process.start("sleep", ["5"])?;
    let pid = process.process_id();

    let err = process.start("echo", ["again"]).unwrap_err();
    assert_eq!(err.downcast_ref::<ProcessError>(), Some(&ProcessError::FailedToStart));
    assert!(process.is_running());
    assert_eq!(process.process_id(), pid);

    process.kill();
    Ok(())
}

#[test]
fn test_stop_calls_without_a_child_do_nothing() {
    let process = controller();
    let finished = record_finished(&process);

    process.terminate();
    process.kill();
    process.shutdown(Duration::from_millis(10));
    process.close_write_channel();

    assert_eq!(process.state(), ProcessState::NotRunning);
    assert_eq!(process.exit_code(), -1);
    assert!(finished.lock().unwrap().is_empty());
}

#[test]
fn test_controller_is_reusable() -> Result<()> {
    let process = controller();
    let finished = record_finished(&process);

    process.start("echo", ["first"])?;
    assert!(process.wait_for_finished(WAIT));
    process.start("sh", ["-c", "echo second; exit 4"])?;
    assert_eq!(process.error(), ProcessError::NoError);
    assert!(process.wait_for_finished(WAIT));

    // Output of the first run was never read; a new start discards it.
    assert_eq!(process.read_all_standard_output()?, b"second\n");
    assert_eq!(*finished.lock().unwrap(), vec![(0, ExitStatus::NormalExit), (4, ExitStatus::NormalExit)]);
    Ok(())
}

#[test]
fn test_large_output_is_not_truncated() -> Result<()> {
    let process = controller();
    process.start("sh", ["-c", "head -c 200000 /dev/zero"])?;
    assert!(process.wait_for_finished(WAIT));
    assert_eq!(process.read_all_standard_output()?.len(), 200_000);
    Ok(())
}

#[test]
fn test_drop_kills_running_child() -> Result<()> {
    let process = controller();
    let finished = record_finished(&process);
    process.start("sleep", ["10"])?;
    drop(process);

    assert_eq!(*finished.lock().unwrap(), vec![(9, ExitStatus::CrashExit)]);
    Ok(())
}
