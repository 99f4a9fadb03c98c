//! Node process lifecycle
//!
//! Starting launches the install's `bin/cassandra` from the node directory
//! and waits on the pid file and the system log. Stopping signals the pid,
//! optionally waits for peers to notice, then polls with exponential backoff.

use std::net::TcpListener;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use super::{ClusterContext, Node, NodeStatus, PeerView};
use crate::error::{Error, NodeContext, Result};
use crate::log_watcher::{self, LogWatcher, BINARY_READY, THRIFT_READY};
use crate::partitioner::Token;
use crate::process::{self, ProcessHandle, Signal};

/// Delay between pid file checks
const PIDFILE_POLL: Duration = Duration::from_millis(100);

/// Grace period after the binary protocol announces itself
const BINARY_SETTLE: Duration = Duration::from_millis(200);

/// Options for [`Node::start`]
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Take ownership of tokens when joining (`-Dcassandra.join_ring`)
    pub join_ring: bool,
    /// Return as soon as the launcher is spawned
    pub no_wait: bool,
    /// Wait for every running peer to see this node UP
    pub wait_other_notice: bool,
    /// Replace the dead node owning this token
    pub replace_token: Option<Token>,
    /// Replace the dead node at this address
    pub replace_address: Option<String>,
    /// Extra JVM arguments
    pub jvm_args: Vec<String>,
    /// Wait for the native protocol to accept clients
    pub wait_for_binary_proto: bool,
    /// Load JNA; disabled by default for local clusters
    pub use_jna: bool,
    /// Read the pid file and refresh status before returning
    pub update_pid: bool,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            join_ring: true,
            no_wait: false,
            wait_other_notice: false,
            replace_token: None,
            replace_address: None,
            jvm_args: Vec::new(),
            wait_for_binary_proto: false,
            use_jna: false,
            update_pid: true,
        }
    }
}

/// Options for [`Node::stop`]
#[derive(Debug, Clone)]
pub struct StopOptions {
    /// Wait for the process to exit
    pub wait: bool,
    /// Wait for every running peer to see this node die
    pub wait_other_notice: bool,
    /// SIGTERM instead of SIGKILL
    pub gently: bool,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            wait: true,
            wait_other_notice: false,
            gently: true,
        }
    }
}

/// Fail with `UnavailableSocket` if `host:port` cannot be bound
pub fn check_socket_available(host: &str, port: u16) -> Result<()> {
    TcpListener::bind((host, port))
        .map(drop)
        .map_err(|e| Error::UnavailableSocket {
            address: format!("{}:{}", host, port),
            reason: e.to_string(),
        })
}

fn peer_marks(peers: &[PeerView]) -> Vec<(PeerView, u64)> {
    peers
        .iter()
        .filter(|p| p.running)
        .map(|p| (p.clone(), log_watcher::mark(&p.log_file)))
        .collect()
}

fn peer_watcher(peer: &PeerView, ctx: &ClusterContext) -> LogWatcher {
    LogWatcher::new(&peer.log_file)
        .with_name(peer.name.clone())
        .with_poll_interval(ctx.settings.poll_interval())
}

impl Node {
    /// Probe the recorded pid and reconcile the status with it.
    ///
    /// A live pid makes the node UP; a dead one clears the pid and turns an
    /// UP node DOWN. Decommissioned nodes keep their status. Changes are
    /// persisted.
    pub fn refresh_status(&mut self) -> Result<NodeStatus> {
        let alive = self.pid.map(process::is_alive).unwrap_or(false);
        let status = match (self.status, alive) {
            (NodeStatus::Decommissioned, _) => NodeStatus::Decommissioned,
            (_, true) => NodeStatus::Up,
            (NodeStatus::Up, false) => NodeStatus::Down,
            (current, false) => current,
        };
        let pid = if alive { self.pid } else { None };

        if status != self.status || pid != self.pid {
            if status != self.status {
                tracing::debug!("{} status {} -> {}", self.name, self.status, status);
            }
            self.status = status;
            self.pid = pid;
            self.save()?;
        }
        Ok(self.status)
    }

    /// Whether the node's server process is running
    pub fn is_running(&mut self) -> Result<bool> {
        self.refresh_status()?;
        Ok(self.pid.is_some())
    }

    /// Launch the node.
    ///
    /// Returns the handle of the launcher process. Unless `no_wait` is set,
    /// blocks until the node logs that it accepts thrift clients.
    pub fn start(&mut self, opts: &StartOptions, ctx: &ClusterContext) -> Result<ProcessHandle> {
        if self.status == NodeStatus::Decommissioned {
            return Err(Error::node(
                &self.name,
                format!("{} is decommissioned; remove it from the cluster instead", self.name),
            ));
        }
        if self.is_running()? {
            return Err(Error::node(&self.name, format!("{} is already running", self.name)));
        }
        if opts.replace_token.is_some() && opts.replace_address.is_some() {
            return Err(Error::Argument(
                "replace_token and replace_address are mutually exclusive".into(),
            ));
        }
        if opts.replace_address.is_none() {
            for (_, endpoint) in self.interfaces.iter() {
                check_socket_available(endpoint.host(), endpoint.port())?;
            }
        }

        let marks = if opts.wait_other_notice {
            peer_marks(&ctx.peers)
        } else {
            Vec::new()
        };

        self.import_bin_files(ctx).for_node(&self.name)?;
        let env = self.launch_env(ctx).for_node(&self.name)?;
        let mark = self.mark_log();
        let pid_file = self.pid_file();
        if pid_file.exists() {
            std::fs::remove_file(&pid_file).for_node(&self.name)?;
        }

        let mut args = vec![
            "-p".to_string(),
            pid_file.to_string_lossy().into_owned(),
            format!("-Dcassandra.join_ring={}", opts.join_ring),
        ];
        if let Some(token) = &opts.replace_token {
            args.push(format!("-Dcassandra.replace_token={}", token));
        }
        if let Some(address) = &opts.replace_address {
            args.push(format!("-Dcassandra.replace_address={}", address));
        }
        if !opts.use_jna {
            args.push("-Dcassandra.boot_without_jna=true".to_string());
        }
        args.extend(opts.jvm_args.iter().cloned());

        let launcher = self.bin_dir().join("cassandra");
        let mut command = Command::new(&launcher);
        command.args(&args).envs(env).current_dir(&self.path);
        let mut handle = ProcessHandle::spawn(&mut command, &self.log_dir())
            .map_err(|e| {
                Error::node(&self.name, format!("Problem starting node {}: {}", self.name, e))
            })?;
        tracing::info!("Starting {} (launcher pid {})", self.name, handle.pid());

        if !opts.no_wait {
            let timeout = ctx.settings.start_timeout();
            self.watch_log_for(&[THRIFT_READY], Some(mark), timeout, Some(&mut handle))?;
        }
        if opts.update_pid {
            self.update_pid(&mut handle, ctx)?;
        }

        for (peer, peer_mark) in &marks {
            peer_watcher(peer, ctx).watch_for_alive(
                self.address(),
                Some(*peer_mark),
                ctx.settings.start_timeout(),
            )?;
        }

        if opts.wait_for_binary_proto {
            self.watch_log_for(&[BINARY_READY], Some(mark), ctx.settings.start_timeout(), None)?;
            thread::sleep(BINARY_SETTLE);
        }

        Ok(handle)
    }

    /// Read the pid the launcher wrote and mark the node UP.
    ///
    /// Waits for a non-empty pid file; a launcher that fails in the meantime
    /// aborts the wait with its output attached to the error.
    pub fn update_pid(&mut self, launcher: &mut ProcessHandle, ctx: &ClusterContext) -> Result<()> {
        let pid_file = self.pid_file();
        let timeout = ctx.settings.pidfile_timeout();
        let start = Instant::now();
        loop {
            let ready = std::fs::metadata(&pid_file).map(|m| m.len() > 0).unwrap_or(false);
            if ready {
                break;
            }
            if let Some(code) = launcher.exit_code() {
                if code != 0 {
                    return Err(Error::node_with_process(
                        &self.name,
                        format!(
                            "Error starting node {}: launcher exited with status {}",
                            self.name, code
                        ),
                        launcher.report(),
                    ));
                }
            }
            if start.elapsed() > timeout {
                tracing::warn!("Timed out waiting for pidfile of {}", self.name);
                break;
            }
            thread::sleep(PIDFILE_POLL);
        }

        let pid = std::fs::read_to_string(&pid_file)
            .map_err(|e| e.to_string())
            .and_then(|content| content.trim().parse::<u32>().map_err(|e| e.to_string()))
            .map_err(|reason| {
                Error::node_with_process(
                    &self.name,
                    format!("Problem starting node {} due to {}", self.name, reason),
                    launcher.report(),
                )
            })?;

        self.pid = Some(pid);
        if !self.is_running()? {
            return Err(Error::node_with_process(
                &self.name,
                format!("Error starting node {}", self.name),
                launcher.report(),
            ));
        }
        tracing::debug!("{} running with pid {}", self.name, pid);
        Ok(())
    }

    /// Stop the node. Returns whether it was running.
    pub fn stop(&mut self, opts: &StopOptions, ctx: &ClusterContext) -> Result<bool> {
        if !self.is_running()? {
            return Ok(false);
        }
        let Some(pid) = self.pid else {
            return Ok(false);
        };

        let marks = if opts.wait_other_notice {
            peer_marks(&ctx.peers)
        } else {
            Vec::new()
        };

        let signal = if opts.gently { Signal::Terminate } else { Signal::Kill };
        if let Err(e) = process::send_signal(pid, signal) {
            if process::is_alive(pid) {
                return Err(Error::node(
                    &self.name,
                    format!("Problem stopping node {}: {}", self.name, e),
                ));
            }
        }
        tracing::info!("Stopping {} (pid {}, {:?})", self.name, pid, signal);

        if opts.wait_other_notice {
            for (peer, peer_mark) in &marks {
                peer_watcher(peer, ctx).watch_for_death(
                    self.address(),
                    Some(*peer_mark),
                    ctx.settings.start_timeout(),
                )?;
            }
        } else {
            thread::sleep(Duration::from_millis(100));
        }

        if !self.is_running()? || !opts.wait {
            return Ok(true);
        }

        let mut delay = ctx.settings.initial_backoff();
        for _ in 0..ctx.settings.stop.max_attempts {
            thread::sleep(delay);
            if !self.is_running()? {
                return Ok(true);
            }
            delay *= 2;
        }
        Err(Error::node(&self.name, format!("Problem stopping node {}", self.name)))
    }
}
