//! Typed external command execution.
//!
//! Every OS-level collaborator (jail, ifconfig, route, ipfw, zfs, rctl,
//! service reloads) builds a structured [`Cmd`] instead of a shell
//! string, and runs it through the [`CommandRunner`] trait. The real
//! [`HostRunner`] shells out with a bounded deadline; tests inject a
//! scripted runner.

use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::errors::{WardenError, WardenResult};

/// Default deadline for external commands. Package installs override it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// A fully-built external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The command line as the operator would type it, for error
    /// messages and logs.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Structured result of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CmdOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Executes built commands. The seam between the orchestrator and the
/// host OS.
pub trait CommandRunner: Send + Sync {
    /// Run the command to completion, within its deadline.
    ///
    /// A non-zero exit is returned as `Ok` with that status; callers
    /// decide whether non-zero is an error for them (liveness probes
    /// treat it as data). Failure to spawn or a blown deadline is an
    /// `Err`.
    fn run(&self, cmd: &Cmd) -> WardenResult<CmdOutput>;

    /// Run and require exit status zero.
    fn run_checked(&self, cmd: &Cmd) -> WardenResult<CmdOutput> {
        let out = self.run(cmd)?;
        if out.success() {
            Ok(out)
        } else {
            Err(WardenError::CommandFailed {
                command: cmd.display(),
                status: out.status,
                stderr: out.stderr.trim().to_string(),
            })
        }
    }
}

/// Real runner: spawns the process and polls for completion until the
/// deadline, then kills it and reports a timeout.
#[derive(Debug, Default, Clone)]
pub struct HostRunner;

impl HostRunner {
    pub fn new() -> Self {
        Self
    }
}

/// Drain a pipe on its own thread. The child must never block on a
/// full pipe buffer while we poll for its exit.
fn drain<R: Read + Send + 'static>(mut pipe: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = String::new();
        let _ = pipe.read_to_string(&mut buf);
        buf
    })
}

impl CommandRunner for HostRunner {
    fn run(&self, cmd: &Cmd) -> WardenResult<CmdOutput> {
        tracing::debug!(command = %cmd.display(), "running external command");

        let mut child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| WardenError::CommandFailed {
                command: cmd.display(),
                status: -1,
                stderr: format!("failed to spawn: {}", e),
            })?;

        let stdout_reader = child.stdout.take().map(drain);
        let stderr_reader = child.stderr.take().map(drain);

        let deadline = Instant::now() + cmd.timeout;
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(WardenError::Timeout {
                            command: cmd.display(),
                            timeout: cmd.timeout,
                        });
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
            }
        };

        let stdout = stdout_reader
            .map(|h| h.join().unwrap_or_default())
            .unwrap_or_default();
        let stderr = stderr_reader
            .map(|h| h.join().unwrap_or_default())
            .unwrap_or_default();

        let status = status.code().unwrap_or(-1);
        if status != 0 {
            tracing::debug!(
                command = %cmd.display(),
                status,
                stderr = %stderr.trim(),
                "command exited non-zero"
            );
        }

        Ok(CmdOutput {
            status,
            stdout,
            stderr,
        })
    }
}
