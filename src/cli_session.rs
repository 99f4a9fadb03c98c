//! Interactive shell sessions
//!
//! Drives a REPL-style subprocess (cassandra-cli, cqlsh) through its pipes.
//! Two background threads copy stdout and stderr into channels as soon as
//! lines appear, so the child never blocks on a full pipe while the caller is
//! busy; the caller then drains those channels with a short per-read timeout.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::{Error, Result};

/// Command sent by [`CliSession::close`]
const QUIT_COMMAND: &str = "quit;\n";

/// A running interactive shell
pub struct CliSession {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout_rx: Receiver<String>,
    stderr_rx: Receiver<String>,
    drains: Vec<JoinHandle<()>>,
    read_timeout: Duration,
    last_output: String,
    last_error: String,
}

impl CliSession {
    /// Spawn `command` with piped stdio and start draining its output
    pub fn spawn(mut command: Command, read_timeout: Duration) -> Result<Self> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (stdout_tx, stdout_rx) = mpsc::channel();
        let (stderr_tx, stderr_rx) = mpsc::channel();
        let mut drains = Vec::with_capacity(2);
        if let Some(out) = stdout {
            drains.push(spawn_drain("cli-stdout", out, stdout_tx)?);
        }
        if let Some(err) = stderr {
            drains.push(spawn_drain("cli-stderr", err, stderr_tx)?);
        }

        Ok(Self {
            child,
            stdin,
            stdout_rx,
            stderr_rx,
            drains,
            read_timeout,
            last_output: String::new(),
            last_error: String::new(),
        })
    }

    /// Send one statement, terminated with `;`.
    ///
    /// Whatever the shell printed since the last read is discarded first so
    /// it cannot be mistaken for the answer to this statement.
    pub fn execute(&mut self, query: &str) -> Result<()> {
        let stale_out = drain(&self.stdout_rx, self.read_timeout);
        let stale_err = drain(&self.stderr_rx, self.read_timeout);
        if !stale_out.is_empty() || !stale_err.is_empty() {
            tracing::trace!(
                "Discarding {} bytes of stale shell output",
                stale_out.len() + stale_err.len()
            );
        }
        self.last_output.clear();
        self.last_error.clear();

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Argument("shell session is closed".into()))?;
        stdin.write_all(query.as_bytes())?;
        stdin.write_all(b";\n")?;
        stdin.flush()?;
        Ok(())
    }

    /// Everything the shell wrote to stdout since the previous statement
    pub fn last_output(&mut self) -> &str {
        let fresh = drain(&self.stdout_rx, self.read_timeout);
        self.last_output.push_str(&fresh);
        &self.last_output
    }

    /// Everything the shell wrote to stderr since the previous statement
    pub fn last_error(&mut self) -> &str {
        let fresh = drain(&self.stderr_rx, self.read_timeout);
        self.last_error.push_str(&fresh);
        &self.last_error
    }

    /// Whether the shell process is still running
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Ask the shell to quit and wait for it to exit
    pub fn close(mut self) -> Result<Option<i32>> {
        if let Some(mut stdin) = self.stdin.take() {
            // The shell may already be gone; a broken pipe here is fine
            let _ = stdin.write_all(QUIT_COMMAND.as_bytes());
            let _ = stdin.flush();
        }
        let status = self.child.wait()?;
        for handle in self.drains.drain(..) {
            let _ = handle.join();
        }
        Ok(status.code())
    }
}

impl Drop for CliSession {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

impl std::fmt::Debug for CliSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CliSession")
            .field("pid", &self.child.id())
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}

fn spawn_drain<R>(name: &str, pipe: R, tx: mpsc::Sender<String>) -> Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if tx.send(String::from_utf8_lossy(&buf).into_owned()).is_err() {
                        break;
                    }
                }
            }
        }
    })?;
    Ok(handle)
}

/// Accumulate queued lines until one read times out
fn drain(rx: &Receiver<String>, timeout: Duration) -> String {
    let mut output = String::new();
    loop {
        match rx.recv_timeout(timeout) {
            Ok(line) => output.push_str(&line),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => return output,
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn cat_session() -> CliSession {
        CliSession::spawn(Command::new("cat"), Duration::from_millis(100)).unwrap()
    }

    #[test]
    fn test_output_is_attributed_to_latest_statement() {
        let mut session = cat_session();

        session.execute("select one").unwrap();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(session.last_output(), "select one;\n");

        session.execute("select two").unwrap();
        thread::sleep(Duration::from_millis(200));
        let second = session.last_output().to_string();
        assert!(second.contains("select two;"));
        assert!(!second.contains("select one"));

        assert_eq!(session.last_error(), "");
        assert_eq!(session.close().unwrap(), Some(0));
    }

    #[test]
    fn test_unread_output_is_discarded_before_next_statement() {
        let mut session = cat_session();

        session.execute("stale").unwrap();
        thread::sleep(Duration::from_millis(200));
        session.execute("fresh").unwrap();
        thread::sleep(Duration::from_millis(200));

        assert_eq!(session.last_output(), "fresh;\n");
        session.close().unwrap();
    }

    #[test]
    fn test_stderr_is_captured() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("while read line; do echo \"error: $line\" >&2; done");
        let mut session = CliSession::spawn(cmd, Duration::from_millis(100)).unwrap();

        session.execute("bad").unwrap();
        thread::sleep(Duration::from_millis(200));
        assert_eq!(session.last_error(), "error: bad;\n");
        assert_eq!(session.last_output(), "");
        session.close().unwrap();
    }
}
