//! Node administration through the install's tools

use std::process::{Command, Stdio};

use super::{ClusterContext, Node, NodeStatus};
use crate::cli_session::CliSession;
use crate::error::{Error, NodeContext, Result};
use crate::partitioner::Token;
use crate::process::ProcessReport;

/// Directories wiped by [`Node::clear`], in order of increasing reach
const DATA_DIR: &str = "data";
const COMMITLOG_DIR: &str = "commitlogs";
const EXTRA_DIRS: [&str; 2] = ["saved_caches", "logs"];

impl Node {
    /// Run `nodetool <cmd>` against this node and return its output
    pub fn nodetool(&self, cmd: &str, ctx: &ClusterContext) -> Result<String> {
        let tool = self.install_dir(ctx).join("bin").join("nodetool");
        let env = self.launch_env(ctx).for_node(&self.name)?;
        let child = Command::new(&tool)
            .arg("-h")
            .arg(self.address())
            .arg("-p")
            .arg(self.jmx_port.to_string())
            .args(cmd.split_whitespace())
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::node(&self.name, format!("cannot run {}: {}", tool.display(), e)))?;
        let pid = child.id();
        let output = child.wait_with_output().for_node(&self.name)?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            return Err(Error::node_with_process(
                &self.name,
                format!("nodetool {} failed on {}", cmd, self.name),
                ProcessReport {
                    pid,
                    exit_code: Some(output.status.code().unwrap_or(-1)),
                    stdout,
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                },
            ));
        }
        tracing::debug!("nodetool {} on {} succeeded", cmd, self.name);
        Ok(stdout)
    }

    pub fn flush(&self, ctx: &ClusterContext) -> Result<()> {
        self.nodetool("flush", ctx).map(drop)
    }

    pub fn compact(&self, ctx: &ClusterContext) -> Result<()> {
        self.nodetool("compact", ctx).map(drop)
    }

    pub fn drain(&self, ctx: &ClusterContext) -> Result<()> {
        self.nodetool("drain", ctx).map(drop)
    }

    pub fn repair(&self, ctx: &ClusterContext) -> Result<()> {
        self.nodetool("repair", ctx).map(drop)
    }

    /// Move the node to `token` on the ring
    pub fn move_token(&mut self, token: Token, ctx: &ClusterContext) -> Result<()> {
        self.nodetool(&format!("move {}", token), ctx)?;
        self.initial_token = Some(token);
        self.update_yaml(ctx)?;
        self.save()
    }

    /// Remove the node from the ring. The process keeps running until
    /// stopped; the status becomes DECOMMISSIONED for good.
    pub fn decommission(&mut self, ctx: &ClusterContext) -> Result<()> {
        if self.status == NodeStatus::Decommissioned {
            return Err(Error::node(&self.name, format!("{} is already decommissioned", self.name)));
        }
        self.nodetool("decommission", ctx)?;
        self.status = NodeStatus::Decommissioned;
        self.save()?;
        tracing::info!("Decommissioned {}", self.name);
        Ok(())
    }

    /// Wipe data; commit logs too unless `only_data`, caches and logs too
    /// with `clear_all`. The node must be stopped.
    pub fn clear(&mut self, clear_all: bool, only_data: bool) -> Result<()> {
        if self.is_running()? {
            return Err(Error::node(
                &self.name,
                format!("cannot clear {} while it is running", self.name),
            ));
        }
        let mut dirs = vec![DATA_DIR];
        if !only_data {
            dirs.push(COMMITLOG_DIR);
        }
        if clear_all {
            dirs.extend(EXTRA_DIRS);
        }
        for dir in dirs {
            let full = self.path.join(dir);
            if full.exists() {
                std::fs::remove_dir_all(&full).for_node(&self.name)?;
            }
            std::fs::create_dir_all(&full).for_node(&self.name)?;
        }
        tracing::debug!("Cleared {}", self.name);
        Ok(())
    }

    /// Open an interactive `cassandra-cli` session on this node
    pub fn cli(&self, ctx: &ClusterContext) -> Result<CliSession> {
        let mut command = Command::new(self.install_dir(ctx).join("bin").join("cassandra-cli"));
        command
            .arg("-h")
            .arg(self.interfaces.thrift.host())
            .arg("-p")
            .arg(self.interfaces.thrift.port().to_string())
            .arg("--jmxport")
            .arg(self.jmx_port.to_string())
            .envs(self.launch_env(ctx).for_node(&self.name)?);
        CliSession::spawn(command, ctx.settings.session_read_timeout())
    }
}
