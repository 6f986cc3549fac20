//! External command execution.
//!
//! Every control-plane operation is one child process. [`CommandRunner::launch`]
//! only pays process-creation cost; the returned [`Handle`] is awaited
//! separately so a caller can start many operations before waiting on any.
//!
//! A command that cannot be started at all still produces an
//! [`OperationResult`] (status [`OperationStatus::LaunchFailed`]) so batch
//! aggregation treats it like any other failure.

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use netfuzz_common::{CommandKind, ConfigError, Credentials, ResourceIndex};
use tokio::process::{Child, Command};

use crate::signal::AbortToken;

/// How an external operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    Exited(i32),
    /// Killed by a signal we did not send.
    Terminated,
    LaunchFailed,
    /// Killed because the session was aborted.
    Cancelled,
}

impl OperationStatus {
    pub fn is_success(self) -> bool {
        self == Self::Exited(0)
    }

    fn from_exit(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => Self::Exited(code),
            None => Self::Terminated,
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit {code}"),
            Self::Terminated => f.write_str("terminated by signal"),
            Self::LaunchFailed => f.write_str("failed to launch"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// The outcome of one external operation. Immutable once produced.
#[derive(Debug, Clone)]
pub struct OperationResult {
    /// `None` for queries that are not scoped to one resource.
    pub index: Option<ResourceIndex>,
    pub kind: CommandKind,
    pub argv: Vec<String>,
    pub status: OperationStatus,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl OperationResult {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Last non-empty stderr line, for log messages.
    pub fn error_line(&self) -> &str {
        self.stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("")
    }
}

/// Launches control-plane client commands with the resolved credentials as
/// their entire environment.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: Vec<String>,
    env: Arc<Credentials>,
}

impl CommandRunner {
    /// `client` is split with shell rules, so `"sudo neutron"` or
    /// `"sh /path/to/wrapper"` work as client programs.
    pub fn new(client: &str, env: Arc<Credentials>) -> Result<Self, ConfigError> {
        let program = shlex::split(client)
            .filter(|words| !words.is_empty())
            .ok_or_else(|| ConfigError::Invalid(format!("invalid client program {client:?}")))?;
        Ok(Self { program, env })
    }

    pub fn credentials(&self) -> &Credentials {
        &self.env
    }

    /// Start one operation. Never blocks beyond spawning the child.
    pub fn launch(
        &self,
        index: Option<ResourceIndex>,
        kind: CommandKind,
        args: Vec<String>,
        capture: bool,
    ) -> Handle {
        let mut argv = self.program.clone();
        argv.extend(args);

        let output = || if capture { Stdio::piped() } else { Stdio::null() };
        let child = Command::new(&argv[0])
            .args(&argv[1..])
            .env_clear()
            .envs(self.env.iter())
            .stdin(Stdio::null())
            .stdout(output())
            .stderr(output())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to launch {}: {e}", argv[0]));

        if let Err(ref e) = child {
            tracing::warn!(kind = %kind, index = ?index.map(|i| i.0), error = %e, "launch failed");
        } else {
            tracing::debug!(kind = %kind, index = ?index.map(|i| i.0), argv = ?argv, "launched");
        }

        Handle {
            index,
            kind,
            argv,
            started: Instant::now(),
            child,
        }
    }
}

/// A launched (or failed-to-launch) operation.
#[derive(Debug)]
pub struct Handle {
    index: Option<ResourceIndex>,
    kind: CommandKind,
    argv: Vec<String>,
    started: Instant,
    child: Result<Child, String>,
}

impl Handle {
    pub fn index(&self) -> Option<ResourceIndex> {
        self.index
    }

    /// OS process id, if the child started.
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().ok().and_then(Child::id)
    }

    /// Wait for the child to exit and collect its output.
    pub async fn wait(self) -> OperationResult {
        let Handle {
            index,
            kind,
            argv,
            started,
            child,
        } = self;

        let (status, stdout, stderr) = match child {
            Err(e) => (OperationStatus::LaunchFailed, String::new(), e),
            Ok(child) => match child.wait_with_output().await {
                Ok(out) => (
                    OperationStatus::from_exit(out.status),
                    String::from_utf8_lossy(&out.stdout).into_owned(),
                    String::from_utf8_lossy(&out.stderr).into_owned(),
                ),
                Err(e) => (
                    OperationStatus::Terminated,
                    String::new(),
                    format!("failed to wait for child: {e}"),
                ),
            },
        };

        OperationResult {
            index,
            kind,
            argv,
            status,
            stdout,
            stderr,
            elapsed: started.elapsed(),
        }
    }

    /// Like [`wait`](Self::wait), but kills the child if `abort` fires first.
    pub async fn wait_or_abort(self, abort: &AbortToken) -> OperationResult {
        let index = self.index;
        let kind = self.kind;
        let argv = self.argv.clone();
        let started = self.started;

        // Dropping the wait future drops the child, and `kill_on_drop` kills it.
        tokio::select! {
            biased;
            result = self.wait() => result,
            _ = abort.aborted() => {
                tracing::debug!(kind = %kind, index = ?index.map(|i| i.0), "killed on abort");
                OperationResult {
                    index,
                    kind,
                    argv,
                    status: OperationStatus::Cancelled,
                    stdout: String::new(),
                    stderr: String::new(),
                    elapsed: started.elapsed(),
                }
            }
        }
    }
}
