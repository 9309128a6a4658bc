use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the child owned by a [`crate::ProcessController`].
///
/// The state machine is strictly `NotRunning -> Starting -> Running -> NotRunning`.
/// `NotRunning` is both the initial and the terminal state, so a controller can
/// launch a fresh child once the previous one has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProcessState {
    #[default]
    NotRunning,
    Starting,
    Running,
}

/// Classification of the last failure observed by a controller.
///
/// The controller keeps this value "sticky": it holds the most recent error
/// until the next call to `start`, which resets it to [`ProcessError::NoError`].
///
/// `ProcessError` also implements [`std::error::Error`], so it is the value
/// carried at the root (or as context) of every `anyhow::Error` returned by the
/// crate. Callers classify failures with:
///
/// ```rust
/// # use tokio_process_control::ProcessError;
/// # fn classify(err: &anyhow::Error) -> Option<ProcessError> {
/// err.downcast_ref::<ProcessError>().copied()
/// # }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProcessError {
    #[default]
    NoError,
    /// Spawn or pipe setup failed, or the program/working directory was invalid.
    FailedToStart,
    /// The child terminated abnormally (signal, unhandled exception).
    Crashed,
    /// A wait exceeded its deadline. The waits report this through their
    /// return value and never record it.
    Timedout,
    ReadError,
    WriteError,
    UnknownError,
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ProcessError::NoError => "no error",
            ProcessError::FailedToStart => "process failed to start",
            ProcessError::Crashed => "process crashed",
            ProcessError::Timedout => "operation timed out",
            ProcessError::ReadError => "failed to read from process",
            ProcessError::WriteError => "failed to write to process",
            ProcessError::UnknownError => "unknown process error",
        };
        f.write_str(text)
    }
}

impl std::error::Error for ProcessError {}

/// How the last run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ExitStatus {
    #[default]
    NormalExit,
    CrashExit,
}

/// One of the two output streams of a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    StandardOutput,
    StandardError,
}

impl Channel {
    pub(crate) fn short_name(self) -> &'static str {
        match self {
            Channel::StandardOutput => "stdout",
            Channel::StandardError => "stderr",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Exit information captured once per run, by whoever finishes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExitInfo {
    pub code: i32,
    pub status: ExitStatus,
}

impl ExitInfo {
    pub fn normal(code: i32) -> Self {
        Self { code, status: ExitStatus::NormalExit }
    }

    pub fn crashed(code: i32) -> Self {
        Self { code, status: ExitStatus::CrashExit }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_error_is_an_anyhow_root() {
        let err = anyhow::Error::new(std::io::Error::from(std::io::ErrorKind::NotFound))
            .context(ProcessError::FailedToStart)
            .context("failed to launch `missing`");
        assert_eq!(err.downcast_ref::<ProcessError>(), Some(&ProcessError::FailedToStart));
    }

    #[test]
    fn defaults_match_a_fresh_controller() {
        assert_eq!(ProcessState::default(), ProcessState::NotRunning);
        assert_eq!(ProcessError::default(), ProcessError::NoError);
        assert_eq!(ExitStatus::default(), ExitStatus::NormalExit);
    }
}
