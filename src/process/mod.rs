//! Process handles
//!
//! Spawning, signalling and liveness probing of single OS processes. The
//! platform specific parts (signal delivery and "is this pid alive") live in
//! the `unix` and `windows` submodules; exactly one of them is compiled in and
//! everything above this module goes through [`is_alive`] and
//! [`send_signal`].

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as platform;

#[cfg(not(unix))]
mod windows;
#[cfg(not(unix))]
use windows as platform;

/// Signal kinds the orchestrator sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Ask the process to shut down (SIGTERM)
    Terminate,
    /// Kill the process outright (SIGKILL)
    Kill,
}

/// Check whether a process with the given pid is running.
///
/// Never fails: a pid that does not exist, or one we are not allowed to
/// signal, is reported as not running.
pub fn is_alive(pid: u32) -> bool {
    platform::is_alive(pid)
}

/// Deliver a signal to a process by pid
pub fn send_signal(pid: u32, signal: Signal) -> io::Result<()> {
    platform::send_signal(pid, signal)
}

/// Snapshot of a process, attached to node errors for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessReport {
    /// OS process id
    pub pid: u32,
    /// Exit code if the process has exited (-1 when killed by a signal)
    pub exit_code: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

/// A spawned child process whose output is captured to files
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    exit_code: Option<i32>,
    stdout_path: Option<PathBuf>,
    stderr_path: Option<PathBuf>,
}

impl ProcessHandle {
    /// Spawn a command, redirecting its output to `<output_dir>/stdout.log`
    /// and `<output_dir>/stderr.log` (truncated).
    ///
    /// Capturing to files instead of pipes means a chatty child can never
    /// block on a full pipe buffer while nobody reads it.
    pub fn spawn(command: &mut Command, output_dir: &Path) -> io::Result<Self> {
        let stdout_path = output_dir.join("stdout.log");
        let stderr_path = output_dir.join("stderr.log");
        let child = command
            .stdin(Stdio::null())
            .stdout(File::create(&stdout_path)?)
            .stderr(File::create(&stderr_path)?)
            .spawn()?;

        Ok(Self::capture(child, Some(stdout_path), Some(stderr_path)))
    }

    /// Wrap an already spawned child
    pub fn from_child(child: Child) -> Self {
        Self::capture(child, None, None)
    }

    fn capture(child: Child, stdout_path: Option<PathBuf>, stderr_path: Option<PathBuf>) -> Self {
        let pid = child.id();
        Self {
            child,
            pid,
            exit_code: None,
            stdout_path,
            stderr_path,
        }
    }

    /// OS process id of the child
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Poll the child without blocking; `Some(code)` once it has exited
    pub fn exit_code(&mut self) -> Option<i32> {
        if self.exit_code.is_none() {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.exit_code = Some(code_of(status));
            }
        }
        self.exit_code
    }

    /// Whether the child is still running
    pub fn is_alive(&mut self) -> bool {
        self.exit_code().is_none()
    }

    /// Deliver a signal to the child
    pub fn signal(&mut self, signal: Signal) -> io::Result<()> {
        if self.exit_code().is_some() {
            return Ok(());
        }
        send_signal(self.pid, signal)
    }

    /// Block until the child exits
    pub fn wait(&mut self) -> io::Result<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let code = code_of(self.child.wait()?);
        self.exit_code = Some(code);
        Ok(code)
    }

    /// Captured standard output so far
    pub fn stdout(&self) -> String {
        read_capture(self.stdout_path.as_deref())
    }

    /// Captured standard error so far
    pub fn stderr(&self) -> String {
        read_capture(self.stderr_path.as_deref())
    }

    /// Snapshot pid, exit status and captured output
    pub fn report(&mut self) -> ProcessReport {
        ProcessReport {
            pid: self.pid,
            exit_code: self.exit_code(),
            stdout: self.stdout(),
            stderr: self.stderr(),
        }
    }
}

fn code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

fn read_capture(path: Option<&Path>) -> String {
    path.and_then(|p| std::fs::read(p).ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}
