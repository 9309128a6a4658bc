use crate::types::ProcessError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything needed to launch a child: program, arguments, working directory
/// and environment.
///
/// The configuration is a plain value. A controller takes a snapshot of it
/// when `start` begins, so later edits never affect a child that is already
/// running.
///
/// # Fields
///
/// * `program` - Path or bare name of the executable. Bare names are resolved
///   against `PATH`.
/// * `arguments` - Already-split argument list. No shell parsing is applied.
/// * `working_directory` - Directory the child starts in. `None` keeps the
///   parent's working directory.
/// * `environment` - `NAME=VALUE` entries. `None` inherits the parent's
///   environment, `Some` replaces it entirely (an empty list gives the child
///   an empty environment).
///
/// # Example
///
/// ```rust
/// use tokio_process_control::ProcessConfiguration;
///
/// let config = ProcessConfiguration::new("sh")
///     .with_arguments(vec!["-c", "echo $GREETING"])
///     .with_environment(vec!["GREETING=hello", "PATH=/usr/bin:/bin"]);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfiguration {
    pub program: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub environment: Option<Vec<String>>,
}

impl ProcessConfiguration {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), ..Self::default() }
    }

    /// Replaces the argument list.
    pub fn with_arguments(mut self, args: Vec<impl Into<String>>) -> Self {
        self.arguments = args.into_iter().map(|arg| arg.into()).collect();
        self
    }

    /// Appends a single argument.
    pub fn with_argument(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    /// Replaces the child's environment with the given `NAME=VALUE` entries.
    pub fn with_environment(mut self, env: Vec<impl Into<String>>) -> Self {
        self.environment = Some(env.into_iter().map(|var| var.into()).collect());
        self
    }

    /// Checks the configuration without touching the filesystem beyond a
    /// `stat` of the working directory.
    ///
    /// # Errors
    ///
    /// Fails with [`ProcessError::FailedToStart`] in the error chain when the
    /// program is empty, the working directory is not an existing directory, or
    /// an environment entry lacks `=`.
    pub fn validate(&self) -> Result<()> {
        if self.program.is_empty() {
            return Err(anyhow::Error::new(ProcessError::FailedToStart).context("program path is empty"));
        }
        if let Some(dir) = &self.working_directory {
            validate_working_directory(dir)?;
        }
        if let Some(env) = &self.environment {
            for var in env {
                validate_environment_entry(var)?;
            }
        }
        Ok(())
    }
}

/// Fails unless `dir` exists and is a directory.
pub fn validate_working_directory(dir: &Path) -> Result<()> {
    let metadata = std::fs::metadata(dir)
        .context(ProcessError::FailedToStart)
        .with_context(|| format!("working directory {} does not exist or is not accessible", dir.display()))?;
    if !metadata.is_dir() {
        return Err(anyhow::Error::new(ProcessError::FailedToStart)
            .context(format!("working directory {} is not a directory", dir.display())));
    }
    Ok(())
}

/// Fails unless `entry` has the `NAME=VALUE` shape.
pub fn validate_environment_entry(entry: &str) -> Result<()> {
    if entry.is_empty() {
        return Err(anyhow::Error::new(ProcessError::FailedToStart).context("environment variable cannot be empty"));
    }
    if !entry.contains('=') {
        return Err(anyhow::Error::new(ProcessError::FailedToStart)
            .context(format!("environment variable `{}` must be in format NAME=VALUE", entry)));
    }
    Ok(())
}

/// Polling and shutdown tunables of a controller.
///
/// * `poll_interval` - how long the readers wait for readiness and how often
///   the status monitor checks the child.
/// * `stop_timeout` - upper bound for joining a background thread on stop.
/// * `terminate_grace` - how long `terminate`/`kill` wait to collect the real
///   exit status before reporting a sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timings {
    pub poll_interval: Duration,
    pub stop_timeout: Duration,
    pub terminate_grace: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(2),
            terminate_grace: Duration::from_millis(200),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kind(err: &anyhow::Error) -> Option<ProcessError> {
        err.downcast_ref::<ProcessError>().copied()
    }

    #[test]
    fn builder_replaces_and_appends_arguments() {
        let config = ProcessConfiguration::new("test").with_arguments(vec!["a", "b"]).with_argument("c");
        assert_eq!(config.arguments, vec!["a", "b", "c"]);
        let config = config.with_arguments(vec!["new"]);
        assert_eq!(config.arguments, vec!["new"]);
    }

    #[test]
    fn empty_program_is_rejected() {
        let err = ProcessConfiguration::default().validate().unwrap_err();
        assert_eq!(kind(&err), Some(ProcessError::FailedToStart));
    }

    #[test]
    fn missing_working_directory_is_rejected() {
        let err = validate_working_directory(Path::new("/path/does/not/exist")).unwrap_err();
        assert_eq!(kind(&err), Some(ProcessError::FailedToStart));
        assert!(err.to_string().contains("/path/does/not/exist"));
    }

    #[test]
    fn file_is_not_a_working_directory() {
        let file = std::env::current_exe().unwrap();
        assert!(validate_working_directory(&file).is_err());
        assert!(validate_working_directory(&std::env::temp_dir()).is_ok());
    }

    #[test]
    fn environment_entries_need_an_equals_sign() {
        assert!(validate_environment_entry("NAME=VALUE").is_ok());
        assert!(validate_environment_entry("EMPTY=").is_ok());
        assert!(validate_environment_entry("NAME").is_err());
        assert!(validate_environment_entry("").is_err());

        let config = ProcessConfiguration::new("env").with_environment(vec!["A=1", "broken"]);
        assert_eq!(kind(&config.validate().unwrap_err()), Some(ProcessError::FailedToStart));
    }

    #[test]
    fn configuration_loads_from_json() {
        let config: ProcessConfiguration =
            serde_json::from_str(r#"{ "program": "echo", "arguments": ["hello"] }"#).unwrap();
        assert_eq!(config, ProcessConfiguration::new("echo").with_argument("hello"));
        assert!(config.environment.is_none());
    }
}
