//! Cluster-wide start and stop
//!
//! Nodes are launched one after the other without waiting, then awaited
//! together: readiness of each node, its pid, and finally a barrier where
//! every started node must have seen every other started node come UP.

use std::thread;
use std::time::Duration;

use super::Cluster;
use crate::error::{Error, Result};
use crate::log_watcher::{BINARY_READY, THRIFT_READY};
use crate::node::{StartOptions, StopOptions};
use crate::process::ProcessHandle;

/// Grace period after the binary protocol announces itself
const BINARY_SETTLE: Duration = Duration::from_millis(200);

/// Options for [`Cluster::start`]
#[derive(Debug, Clone, Default)]
pub struct ClusterStartOptions {
    /// Only launch the nodes and record their pids
    pub no_wait: bool,
    /// Also wait for the native protocol on every started node
    pub wait_for_binary_proto: bool,
    /// Extra JVM arguments for every node
    pub jvm_args: Vec<String>,
    /// Load JNA in every node
    pub use_jna: bool,
}

/// A node launched by [`Cluster::start`]
#[derive(Debug)]
pub struct StartedNode {
    /// Node name
    pub node: String,
    /// Launcher process
    pub process: ProcessHandle,
    /// Size of the node's log before it was launched
    pub mark: u64,
}

/// Result of [`Cluster::stop`]
#[derive(Debug, Default)]
pub struct StopOutcome {
    /// Nodes that were already stopped
    pub not_running: Vec<String>,
    /// Nodes that could not be stopped
    pub failed: Vec<(String, Error)>,
}

impl StopOutcome {
    /// Whether every running node was stopped
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

impl Cluster {
    /// Start every node that is not running.
    ///
    /// Each node is launched, awaited until it serves clients and has its pid
    /// recorded before the next one is launched. Fails on the first node
    /// that cannot be launched, that exits before it is ready, or that does
    /// not see its peers come up; nodes started up to that point are left
    /// running and can be stopped.
    pub fn start(&mut self, opts: &ClusterStartOptions) -> Result<Vec<StartedNode>> {
        let names: Vec<String> = self.nodes.iter().map(|n| n.name().to_string()).collect();
        let node_opts = StartOptions {
            no_wait: true,
            update_pid: false,
            jvm_args: opts.jvm_args.clone(),
            use_jna: opts.use_jna,
            ..Default::default()
        };
        let timeout = self.settings.start_timeout();

        let mut started = Vec::new();
        for name in names {
            let ctx = self.context_for(&name)?;
            let node = self.require_node_mut(&name)?;
            if node.is_running()? {
                continue;
            }
            let mark = node.mark_log();
            let mut process = node.start(&node_opts, &ctx)?;

            let ready = if opts.no_wait {
                Ok(())
            } else {
                node.watch_log_for(&[THRIFT_READY], Some(mark), timeout, Some(&mut process))
                    .map(drop)
            };
            // Record the pid even when the wait failed, so a live server stays stoppable
            let recorded = node.update_pid(&mut process, &ctx);
            ready?;
            recorded?;

            started.push(StartedNode {
                node: name,
                process,
                mark,
            });
        }

        if !opts.no_wait {
            self.await_all_alive(&started)?;
        }

        if opts.wait_for_binary_proto {
            for entry in started.iter_mut() {
                let node = self.require_node_mut(&entry.node)?;
                let process = Some(&mut entry.process);
                node.watch_log_for(&[BINARY_READY], Some(entry.mark), timeout, process)?;
            }
            thread::sleep(BINARY_SETTLE);
        }

        tracing::info!("Started {} nodes of cluster {}", started.len(), self.name);
        Ok(started)
    }

    /// Every started node must log every other started node as UP
    fn await_all_alive(&self, started: &[StartedNode]) -> Result<()> {
        let timeout = self.settings.start_timeout();
        for watcher in started {
            let Some(node) = self.node(&watcher.node) else {
                continue;
            };
            for other in started.iter().filter(|o| o.node != watcher.node) {
                let Some(other_node) = self.node(&other.node) else {
                    continue;
                };
                node.watch_log_for_alive(other_node.address(), Some(watcher.mark), timeout)?;
                tracing::debug!("{} sees {} UP", watcher.node, other.node);
            }
        }
        Ok(())
    }

    /// Stop every node, collecting per-node failures instead of aborting
    pub fn stop(&mut self, wait: bool, gently: bool) -> StopOutcome {
        let opts = StopOptions {
            wait,
            wait_other_notice: false,
            gently,
        };
        let names: Vec<String> = self.nodes.iter().map(|n| n.name().to_string()).collect();
        let mut outcome = StopOutcome::default();
        for name in names {
            match self.stop_node(&name, &opts) {
                Ok(true) => {}
                Ok(false) => outcome.not_running.push(name),
                Err(e) => {
                    tracing::warn!("Failed to stop {}: {}", name, e);
                    outcome.failed.push((name, e));
                }
            }
        }
        outcome
    }
}
