// src/system/executor.rs

//! Command execution capability
//!
//! Everything that shells out (systemctl, pip, npm) goes through a
//! [`CommandExecutor`] so tests can substitute [`RecordingExecutor`] for the
//! real [`SystemExecutor`].

use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Default timeout for external commands
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Uniform result of running an external command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub success: bool,
    pub output: String,
    pub error: String,
}

impl CommandOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: String::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: error.into(),
        }
    }

    /// Turn a failed run into `Error::CommandFailed`
    pub fn into_result(self, what: &str) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            let detail = if self.error.trim().is_empty() {
                self.output.trim().to_string()
            } else {
                self.error.trim().to_string()
            };
            Err(Error::CommandFailed(format!("{}: {}", what, detail)))
        }
    }
}

/// A single command invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
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

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Space-joined form used for logging and fake matching
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Runs external commands
///
/// A non-zero exit is NOT an error: it is reported through
/// `CommandOutput::success`. Errors are reserved for "could not run at all"
/// (missing binary, timeout, I/O).
pub trait CommandExecutor: Send + Sync {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Executor backed by `std::process::Command`
#[derive(Debug, Clone)]
pub struct SystemExecutor {
    timeout: Duration,
}

impl Default for SystemExecutor {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl SystemExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

impl CommandExecutor for SystemExecutor {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!("Running: {}", spec.display());

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref cwd) = spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::ToolNotFound(spec.program.clone()),
            _ => Error::CommandFailed(format!("Failed to spawn {}: {}", spec.program, e)),
        })?;

        // Drain pipes concurrently so a chatty child cannot block on a full pipe
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match child.wait_timeout(self.timeout)? {
            Some(status) => status,
            None => {
                warn!("Command timed out after {:?}: {}", self.timeout, spec.display());
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::CommandFailed(format!(
                    "{} timed out after {}s",
                    spec.display(),
                    self.timeout.as_secs()
                )));
            }
        };

        let output = stdout.join().unwrap_or_default();
        let error = stderr.join().unwrap_or_default();

        Ok(CommandOutput {
            success: status.success(),
            output,
            error,
        })
    }
}

/// Fake executor that records invocations
///
/// Every command succeeds with empty output unless a scripted response
/// matches the start of its display form.
#[derive(Debug, Default, Clone)]
pub struct RecordingExecutor {
    calls: Arc<Mutex<Vec<String>>>,
    responses: Arc<Mutex<Vec<(String, CommandOutput)>>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond with `output` to any command starting with `prefix`
    pub fn respond(&self, prefix: impl Into<String>, output: CommandOutput) {
        self.responses.lock().push((prefix.into(), output));
    }

    /// Commands run so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl CommandExecutor for RecordingExecutor {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let line = spec.display();
        self.calls.lock().push(line.clone());

        let responses = self.responses.lock();
        let scripted = responses
            .iter()
            .rev()
            .find(|(prefix, _)| line.starts_with(prefix.as_str()))
            .map(|(_, out)| out.clone());

        Ok(scripted.unwrap_or_else(|| CommandOutput::ok("")))
    }
}
