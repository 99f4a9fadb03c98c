//! Log Watching
//!
//! Cassandra has no health-check endpoint: the only way to know a node is
//! ready, or that it has seen a peer come up or go down, is to read its log.
//! A [`LogWatcher`] polls a growing text file for a set of regular expressions,
//! starting from a byte offset ("mark") taken before the event of interest,
//! and optionally aborts early when a supervised process dies.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use regex::Regex;

use crate::error::{Error, Result};
use crate::process::ProcessHandle;

/// Phrase logged once the thrift (client-facing) interface accepts connections
pub const THRIFT_READY: &str = "Listening for thrift clients";

/// Phrase logged once the native binary protocol accepts connections
pub const BINARY_READY: &str = "Starting listening for CQL clients";

/// Default sleep between two polls of the file
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Current size of a file in bytes, 0 if it does not exist yet
pub fn mark(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Pattern matching a gossip line reporting `address` as alive
pub fn alive_pattern(address: &str) -> String {
    format!("{}.* now UP", regex::escape(address))
}

/// Pattern matching a gossip line reporting `address` as dead
pub fn death_pattern(address: &str) -> String {
    format!("{}.* now (dead|DOWN)", regex::escape(address))
}

/// A log line that satisfied one of the watched expressions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMatch {
    /// The expression that matched
    pub pattern: String,
    /// Full line, without the trailing newline
    pub line: String,
    /// Capture groups; index 0 is the whole match
    pub groups: Vec<Option<String>>,
}

impl LogMatch {
    /// Text matched by the whole expression
    pub fn matched(&self) -> &str {
        self.groups.first().and_then(|g| g.as_deref()).unwrap_or("")
    }
}

/// Polls one log file for regular expressions
#[derive(Debug, Clone)]
pub struct LogWatcher {
    path: PathBuf,
    name: String,
    poll_interval: Duration,
}

impl LogWatcher {
    /// Create a watcher over `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self {
            path,
            name,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Name reported in timeout errors (usually the owning node)
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sleep between polls when nothing new was written
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Watched file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the watched file
    pub fn mark(&self) -> u64 {
        mark(&self.path)
    }

    /// Wait until every expression has matched a line written after
    /// `from_mark`, returning the matches in the order they were found.
    ///
    /// If `process` is given and it exits with a non-zero status before all
    /// expressions are satisfied, the wait is aborted with a node error
    /// carrying the process output.
    pub fn watch_for(
        &self,
        exprs: &[&str],
        from_mark: Option<u64>,
        timeout: Duration,
        mut process: Option<&mut ProcessHandle>,
    ) -> Result<Vec<LogMatch>> {
        let mut pending = exprs
            .iter()
            .map(|e| Regex::new(e))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut matches = Vec::with_capacity(pending.len());
        if pending.is_empty() {
            return Ok(matches);
        }

        let start = Instant::now();
        let mut offset = from_mark.unwrap_or(0);
        let mut reads = String::new();
        let mut partial = Vec::new();

        loop {
            if let Some(p) = process.as_deref_mut() {
                self.check_process(p)?;
            }

            let chunk = self.read_from(offset)?;
            offset += chunk.len() as u64;
            partial.extend_from_slice(&chunk);

            let mut found_line = false;
            while let Some(newline) = partial.iter().position(|&b| b == b'\n') {
                found_line = true;
                let raw: Vec<u8> = partial.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&raw);
                reads.push_str(&line);
                let line = line.trim_end_matches(['\n', '\r']);

                pending.retain(|re| match re.captures(line) {
                    Some(caps) => {
                        matches.push(LogMatch {
                            pattern: re.as_str().to_string(),
                            line: line.to_string(),
                            groups: caps
                                .iter()
                                .map(|g| g.map(|m| m.as_str().to_string()))
                                .collect(),
                        });
                        false
                    }
                    None => true,
                });

                if pending.is_empty() {
                    return Ok(matches);
                }
            }

            if start.elapsed() > timeout {
                return Err(Error::Timeout {
                    source_name: self.name.clone(),
                    missing: pending.iter().map(|re| re.as_str().to_string()).collect(),
                    output: reads,
                });
            }
            if found_line {
                continue;
            }
            let remaining = timeout.saturating_sub(start.elapsed());
            std::thread::sleep(self.poll_interval.min(remaining).max(Duration::from_millis(1)));
        }
    }

    /// Wait for a single expression
    pub fn watch_for_one(
        &self,
        expr: &str,
        from_mark: Option<u64>,
        timeout: Duration,
        process: Option<&mut ProcessHandle>,
    ) -> Result<LogMatch> {
        let mut found = self.watch_for(&[expr], from_mark, timeout, process)?;
        found
            .pop()
            .ok_or_else(|| Error::node(self.name.clone(), format!("no match for {}", expr)))
    }

    /// Wait for this log to report `address` as UP
    pub fn watch_for_alive(
        &self,
        address: &str,
        from_mark: Option<u64>,
        timeout: Duration,
    ) -> Result<LogMatch> {
        self.watch_for_one(&alive_pattern(address), from_mark, timeout, None)
    }

    /// Wait for this log to report `address` as dead or DOWN
    pub fn watch_for_death(
        &self,
        address: &str,
        from_mark: Option<u64>,
        timeout: Duration,
    ) -> Result<LogMatch> {
        self.watch_for_one(&death_pattern(address), from_mark, timeout, None)
    }

    fn check_process(&self, process: &mut ProcessHandle) -> Result<()> {
        match process.exit_code() {
            Some(code) if code != 0 => {
                let report = process.report();
                tracing::warn!(
                    "[{}] process {} exited with status {}",
                    self.name,
                    report.pid,
                    code
                );
                Err(Error::node_with_process(
                    self.name.clone(),
                    format!("{} exited with status {} while waiting on its log", self.name, code),
                    report,
                ))
            }
            _ => Ok(()),
        }
    }

    /// Bytes appended after `offset`; the file may not exist yet
    fn read_from(&self, offset: u64) -> Result<Vec<u8>> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::tempdir;

    fn append(path: &Path, text: &str) {
        let mut f = OpenOptions::new().create(true).append(true).open(path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    fn watcher(path: &Path) -> LogWatcher {
        LogWatcher::new(path)
            .with_name("node1")
            .with_poll_interval(Duration::from_millis(50))
    }

    #[test]
    fn test_mark_of_missing_file_is_zero() {
        let dir = tempdir().unwrap();
        assert_eq!(mark(&dir.path().join("system.log")), 0);
    }

    #[test]
    fn test_matches_after_mark_only() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("system.log");
        append(&log, "INFO Listening for thrift clients... (old)\n");

        let w = watcher(&log);
        let m = w.mark();
        assert!(m > 0);

        let writer_log = log.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            append(&writer_log, "INFO unrelated\n");
            append(&writer_log, "INFO Listening for thrift clients... (new)\n");
        });

        let found = w
            .watch_for(&[THRIFT_READY], Some(m), Duration::from_secs(5), None)
            .unwrap();
        writer.join().unwrap();

        assert_eq!(found.len(), 1);
        assert!(found[0].line.ends_with("(new)"));
        assert_eq!(found[0].matched(), THRIFT_READY);
    }

    #[test]
    fn test_all_expressions_reported_in_match_order() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("system.log");
        append(&log, "InetAddress /127.0.0.3 is now UP\nfoo\nInetAddress /127.0.0.2 is now UP\n");

        let w = watcher(&log);
        let found = w
            .watch_for(
                &[&alive_pattern("127.0.0.2"), &alive_pattern("127.0.0.3")],
                None,
                Duration::from_secs(2),
                None,
            )
            .unwrap();

        assert_eq!(found.len(), 2);
        assert!(found[0].line.contains("127.0.0.3"));
        assert!(found[1].line.contains("127.0.0.2"));
    }

    #[test]
    fn test_partial_line_waits_for_newline() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("system.log");
        append(&log, "InetAddress /127.0.0.2 is now ");

        let writer_log = log.clone();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            append(&writer_log, "DOWN\n");
        });

        let m = watcher(&log)
            .watch_for_death("127.0.0.2", None, Duration::from_secs(5))
            .unwrap();
        writer.join().unwrap();
        assert_eq!(m.line, "InetAddress /127.0.0.2 is now DOWN");
        assert_eq!(m.groups[1].as_deref(), Some("DOWN"));
    }

    #[test]
    fn test_timeout_is_bounded() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("system.log");
        append(&log, "INFO nothing to see\n");

        let start = Instant::now();
        let err = watcher(&log)
            .watch_for(&["never printed"], None, Duration::from_secs(2), None)
            .unwrap_err();
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3));
        match err {
            Error::Timeout { source_name, missing, output } => {
                assert_eq!(source_name, "node1");
                assert_eq!(missing, vec!["never printed".to_string()]);
                assert_eq!(output, "INFO nothing to see\n");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_busy_log_still_times_out() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("system.log");
        append(&log, "");

        let done = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let writer_done = done.clone();
        let writer_log = log.clone();
        let writer = std::thread::spawn(move || {
            while !writer_done.load(std::sync::atomic::Ordering::Relaxed) {
                append(&writer_log, "DEBUG compacting\n");
            }
        });

        let started = Instant::now();
        let err = watcher(&log)
            .watch_for(&["never logged"], Some(0), Duration::from_millis(300), None)
            .unwrap_err();
        let elapsed = started.elapsed();
        done.store(true, std::sync::atomic::Ordering::Relaxed);
        writer.join().unwrap();

        assert!(err.is_timeout());
        assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
    }

    #[test]
    fn test_missing_file_times_out() {
        let dir = tempdir().unwrap();
        let err = watcher(&dir.path().join("absent.log"))
            .watch_for_one("anything", None, Duration::from_millis(200), None)
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let dir = tempdir().unwrap();
        let err = watcher(&dir.path().join("system.log"))
            .watch_for(&["("], None, Duration::from_millis(100), None)
            .unwrap_err();
        assert!(matches!(err, Error::Pattern(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_dead_process_aborts_wait() {
        use std::process::Command;

        let dir = tempdir().unwrap();
        let log = dir.path().join("system.log");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo boom >&2; exit 1");
        let mut process = ProcessHandle::spawn(&mut cmd, dir.path()).unwrap();

        let start = Instant::now();
        let err = watcher(&log)
            .watch_for(&[THRIFT_READY], None, Duration::from_secs(30), Some(&mut process))
            .unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(10));
        let report = err.process_report().expect("process report");
        assert_eq!(report.exit_code, Some(1));
        assert_eq!(report.stderr, "boom\n");
    }
}
