//! Node Management
//!
//! A node is one Cassandra instance of a local cluster: its identity, network
//! endpoints, private directory tree, rendered configuration files and the
//! process running it. Every mutation is persisted to `<node>/node.conf`.

mod admin;
mod conf;
mod lifecycle;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::CcmConfig;
use crate::error::{Error, NodeContext, Result};
use crate::log_watcher::{self, LogMatch, LogWatcher};
use crate::overlay::ConfigOverlay;
use crate::partitioner::{Partitioner, Token};
use crate::process::ProcessHandle;

pub use lifecycle::{check_socket_available, StartOptions, StopOptions};

/// Persisted node document, inside the node directory
pub const NODE_CONF: &str = "node.conf";

/// Pid file the launcher writes
pub const PID_FILE: &str = "cassandra.pid";

/// Main server log, inside `logs/`
pub const SYSTEM_LOG: &str = "system.log";

/// Directories every node owns
pub const NODE_DIRS: [&str; 6] = ["bin", "conf", "data", "commitlogs", "saved_caches", "logs"];

/// Lifecycle status of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// Created but never started
    Uninitialized,
    /// Process running
    Up,
    /// Process stopped
    Down,
    /// Removed from the ring; terminal
    Decommissioned,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Uninitialized => write!(f, "UNINITIALIZED"),
            NodeStatus::Up => write!(f, "UP"),
            NodeStatus::Down => write!(f, "DOWN"),
            NodeStatus::Decommissioned => write!(f, "DECOMMISSIONED"),
        }
    }
}

/// Server log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TRACE" => Ok(LogLevel::Trace),
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            _ => Err(Error::Argument(format!(
                "Unknown log level {} (use one of TRACE DEBUG INFO WARN ERROR)",
                s
            ))),
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<LogLevel> for String {
    fn from(level: LogLevel) -> Self {
        level.to_string()
    }
}

/// A (host, port) pair, persisted as a two-element list
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint(pub String, pub u16);

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self(host.into(), port)
    }

    pub fn host(&self) -> &str {
        &self.0
    }

    pub fn port(&self) -> u16 {
        self.1
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.0, self.1)
    }
}

/// Named network interfaces of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterfaces {
    /// Thrift RPC (client-facing)
    pub thrift: Endpoint,
    /// Inter-node storage/gossip
    pub storage: Endpoint,
    /// Native binary protocol (client-facing), absent on old versions
    #[serde(default)]
    pub binary: Option<Endpoint>,
}

impl NetworkInterfaces {
    /// Conventional ports on a single address
    pub fn on_host(host: &str) -> Self {
        Self {
            thrift: Endpoint::new(host, 9160),
            storage: Endpoint::new(host, 7000),
            binary: Some(Endpoint::new(host, 9042)),
        }
    }

    /// All configured interfaces with their names
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Endpoint)> {
        [
            ("thrift", Some(&self.thrift)),
            ("storage", Some(&self.storage)),
            ("binary", self.binary.as_ref()),
        ]
        .into_iter()
            .filter_map(|(name, ep)| ep.map(|ep| (name, ep)))
    }
}

/// Everything needed to create a node
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub name: String,
    pub auto_bootstrap: bool,
    pub interfaces: NetworkInterfaces,
    pub jmx_port: u16,
    /// 0 disables the remote debugger
    pub remote_debug_port: u16,
    pub initial_token: Option<Token>,
    pub data_center: Option<String>,
    /// Install used by this node instead of the cluster's
    pub install_dir: Option<PathBuf>,
}

impl NodeSpec {
    /// Spec with default ports on `interfaces`
    pub fn new(name: impl Into<String>, interfaces: NetworkInterfaces) -> Self {
        Self {
            name: name.into(),
            auto_bootstrap: false,
            interfaces,
            jmx_port: 7199,
            remote_debug_port: 0,
            initial_token: None,
            data_center: None,
            install_dir: None,
        }
    }

    pub fn with_jmx_port(mut self, port: u16) -> Self {
        self.jmx_port = port;
        self
    }

    pub fn with_remote_debug_port(mut self, port: u16) -> Self {
        self.remote_debug_port = port;
        self
    }

    pub fn with_initial_token(mut self, token: Option<Token>) -> Self {
        self.initial_token = token;
        self
    }

    pub fn with_auto_bootstrap(mut self, auto_bootstrap: bool) -> Self {
        self.auto_bootstrap = auto_bootstrap;
        self
    }

    pub fn with_install_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.install_dir = Some(dir.into());
        self
    }
}

/// Another node of the same cluster, as seen by the node being operated on
#[derive(Debug, Clone)]
pub struct PeerView {
    pub name: String,
    /// Storage address other nodes gossip about
    pub address: String,
    pub log_file: PathBuf,
    pub running: bool,
}

/// Read-only snapshot of the owning cluster handed to node operations
#[derive(Debug, Clone)]
pub struct ClusterContext {
    pub cluster_name: String,
    pub install_dir: PathBuf,
    pub partitioner: Option<Partitioner>,
    pub use_vnodes: bool,
    pub config_options: ConfigOverlay,
    /// Seed addresses
    pub seeds: Vec<String>,
    pub log_level: LogLevel,
    pub settings: CcmConfig,
    /// Every other node of the cluster
    pub peers: Vec<PeerView>,
}

/// On-disk form of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct NodeDocument {
    name: String,
    status: NodeStatus,
    auto_bootstrap: bool,
    interfaces: NetworkInterfaces,
    jmx_port: u16,
    #[serde(default)]
    remote_debug_port: u16,
    #[serde(default)]
    config_options: ConfigOverlay,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    initial_token: Option<Token>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data_center: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cassandra_dir: Option<PathBuf>,
}

/// One Cassandra instance
#[derive(Debug)]
pub struct Node {
    name: String,
    path: PathBuf,
    status: NodeStatus,
    auto_bootstrap: bool,
    interfaces: NetworkInterfaces,
    jmx_port: u16,
    remote_debug_port: u16,
    initial_token: Option<Token>,
    data_center: Option<String>,
    pid: Option<u32>,
    config_options: ConfigOverlay,
    install_dir: Option<PathBuf>,
    log_level: LogLevel,
    poll_interval: Duration,
}

impl Node {
    /// Create the node directory tree under `cluster_path`, import the
    /// install's configuration and scripts, render them and persist the node
    pub fn create(cluster_path: &Path, spec: NodeSpec, ctx: &ClusterContext) -> Result<Node> {
        if spec.name.is_empty() || spec.name.contains(['/', '\\']) || spec.name.starts_with('.') {
            return Err(Error::Argument(format!("invalid node name {:?}", spec.name)));
        }
        let path = cluster_path.join(&spec.name);
        if path.exists() {
            return Err(Error::Argument(format!("Cannot create existing node {}", spec.name)));
        }

        for dir in NODE_DIRS {
            std::fs::create_dir_all(path.join(dir)).for_node(&spec.name)?;
        }

        let node = Node {
            name: spec.name,
            path,
            status: NodeStatus::Uninitialized,
            auto_bootstrap: spec.auto_bootstrap,
            interfaces: spec.interfaces,
            jmx_port: spec.jmx_port,
            remote_debug_port: spec.remote_debug_port,
            initial_token: spec.initial_token,
            data_center: spec.data_center,
            pid: None,
            config_options: ConfigOverlay::new(),
            install_dir: spec.install_dir,
            log_level: ctx.log_level,
            poll_interval: ctx.settings.poll_interval(),
        };

        node.import_config_files(ctx).for_node(&node.name)?;
        node.import_bin_files(ctx).for_node(&node.name)?;
        node.save()?;
        tracing::debug!("Created node {} in {}", node.name, node.path.display());
        Ok(node)
    }

    /// Load a node persisted under `cluster_path/name`
    pub fn load(cluster_path: &Path, name: &str) -> Result<Node> {
        let path = cluster_path.join(name);
        let conf = path.join(NODE_CONF);
        let content = std::fs::read_to_string(&conf).map_err(|e| Error::Load {
            path: conf.clone(),
            reason: e.to_string(),
        })?;
        let doc: NodeDocument = serde_yaml::from_str(&content).map_err(|e| Error::Load {
            path: conf.clone(),
            reason: e.to_string(),
        })?;
        if doc.name != name {
            return Err(Error::Load {
                path: conf,
                reason: format!("document names node {} instead of {}", doc.name, name),
            });
        }

        Ok(Node {
            name: doc.name,
            path,
            status: doc.status,
            auto_bootstrap: doc.auto_bootstrap,
            interfaces: doc.interfaces,
            jmx_port: doc.jmx_port,
            remote_debug_port: doc.remote_debug_port,
            initial_token: doc.initial_token,
            data_center: doc.data_center,
            pid: doc.pid,
            config_options: doc.config_options,
            install_dir: doc.cassandra_dir,
            log_level: LogLevel::default(),
            poll_interval: log_watcher::DEFAULT_POLL_INTERVAL,
        })
    }

    fn document(&self) -> NodeDocument {
        NodeDocument {
            name: self.name.clone(),
            status: self.status,
            auto_bootstrap: self.auto_bootstrap,
            interfaces: self.interfaces.clone(),
            jmx_port: self.jmx_port,
            remote_debug_port: self.remote_debug_port,
            config_options: self.config_options.clone(),
            pid: self.pid,
            initial_token: self.initial_token.clone(),
            data_center: self.data_center.clone(),
            cassandra_dir: self.install_dir.clone(),
        }
    }

    /// Persist the node document
    pub fn save(&self) -> Result<()> {
        let content = serde_yaml::to_string(&self.document()).for_node(&self.name)?;
        let target = self.path.join(NODE_CONF);
        let tmp = self.path.join(format!("{}.tmp", NODE_CONF));
        std::fs::write(&tmp, content).for_node(&self.name)?;
        std::fs::rename(&tmp, &target).for_node(&self.name)?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last known status, without probing the process
    pub fn status(&self) -> NodeStatus {
        self.status
    }

    /// Address peers use to refer to this node in gossip
    pub fn address(&self) -> &str {
        self.interfaces.storage.host()
    }

    pub fn interfaces(&self) -> &NetworkInterfaces {
        &self.interfaces
    }

    pub fn jmx_port(&self) -> u16 {
        self.jmx_port
    }

    pub fn remote_debug_port(&self) -> u16 {
        self.remote_debug_port
    }

    pub fn auto_bootstrap(&self) -> bool {
        self.auto_bootstrap
    }

    pub fn initial_token(&self) -> Option<&Token> {
        self.initial_token.as_ref()
    }

    pub fn data_center(&self) -> Option<&str> {
        self.data_center.as_deref()
    }

    /// Pid of the running server, if any
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Node-level configuration overrides
    pub fn config_options(&self) -> &ConfigOverlay {
        &self.config_options
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    /// Install this node runs from
    pub fn install_dir<'a>(&'a self, ctx: &'a ClusterContext) -> &'a Path {
        self.install_dir.as_deref().unwrap_or(&ctx.install_dir)
    }

    pub fn conf_dir(&self) -> PathBuf {
        self.path.join("conf")
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.path.join("bin")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.path.join("logs")
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir().join(SYSTEM_LOG)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.path.join(PID_FILE)
    }

    pub(crate) fn set_data_center(&mut self, data_center: Option<String>) -> Result<()> {
        self.data_center = data_center;
        self.save()
    }

    pub(crate) fn inherit_settings(&mut self, log_level: LogLevel, settings: &CcmConfig) {
        self.log_level = log_level;
        self.poll_interval = settings.poll_interval();
    }

    /// This node as seen by its peers
    pub fn peer_view(&mut self) -> PeerView {
        let running = self.is_running().unwrap_or(false);
        PeerView {
            name: self.name.clone(),
            address: self.address().to_string(),
            log_file: self.log_file(),
            running,
        }
    }

    /// Watcher over this node's system log
    pub fn log_watcher(&self) -> LogWatcher {
        LogWatcher::new(self.log_file())
            .with_name(self.name.clone())
            .with_poll_interval(self.poll_interval)
    }

    /// Current size of the system log
    pub fn mark_log(&self) -> u64 {
        log_watcher::mark(&self.log_file())
    }

    /// Wait for every expression to show up in the system log
    pub fn watch_log_for(
        &self,
        exprs: &[&str],
        from_mark: Option<u64>,
        timeout: Duration,
        process: Option<&mut ProcessHandle>,
    ) -> Result<Vec<LogMatch>> {
        self.log_watcher().watch_for(exprs, from_mark, timeout, process)
    }

    /// Wait for this node's log to report `other` as UP
    pub fn watch_log_for_alive(
        &self,
        other_address: &str,
        from_mark: Option<u64>,
        timeout: Duration,
    ) -> Result<LogMatch> {
        self.log_watcher().watch_for_alive(other_address, from_mark, timeout)
    }

    /// Wait for this node's log to report `other` as dead
    pub fn watch_log_for_death(
        &self,
        other_address: &str,
        from_mark: Option<u64>,
        timeout: Duration,
    ) -> Result<LogMatch> {
        self.log_watcher().watch_for_death(other_address, from_mark, timeout)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_builds_directory_tree() {
        let install = tempdir().unwrap();
        fake_install(install.path());
        let cluster = tempdir().unwrap();

        let ctx = context(install.path());
        let node = Node::create(cluster.path(), spec("node1", 1), &ctx).unwrap();

        for dir in NODE_DIRS {
            assert!(node.path().join(dir).is_dir(), "missing {}", dir);
        }
        assert!(node.path().join(NODE_CONF).is_file());
        assert!(node.conf_dir().join("cassandra.yaml").is_file());
        assert!(node.bin_dir().join("cassandra").is_file());
        assert_eq!(node.status(), NodeStatus::Uninitialized);
        assert_eq!(node.address(), "127.0.0.1");
    }

    #[test]
    fn test_create_failure_names_node() {
        let install = tempdir().unwrap();
        fake_install(install.path());
        std::fs::remove_dir_all(install.path().join("bin")).unwrap();
        let cluster = tempdir().unwrap();

        let ctx = context(install.path());
        let err = Node::create(cluster.path(), spec("node1", 1), &ctx).unwrap_err();
        assert_eq!(err.node_name(), Some("node1"));
        assert!(matches!(err, Error::Node { .. }));
    }

    #[test]
    fn test_create_rejects_existing_node() {
        let install = tempdir().unwrap();
        fake_install(install.path());
        let cluster = tempdir().unwrap();
        let ctx = context(install.path());

        Node::create(cluster.path(), spec("node1", 1), &ctx).unwrap();
        let err = Node::create(cluster.path(), spec("node1", 1), &ctx).unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
        assert!(matches!(
            Node::create(cluster.path(), spec("../escape", 2), &ctx),
            Err(Error::Argument(_))
        ));
    }

    #[test]
    fn test_load_save_round_trip() {
        let install = tempdir().unwrap();
        fake_install(install.path());
        let cluster = tempdir().unwrap();
        let mut spec = spec("node1", 1);
        spec.data_center = Some("dc1".into());
        spec.remote_debug_port = 2100;

        let created = Node::create(cluster.path(), spec, &context(install.path())).unwrap();
        let first = std::fs::read_to_string(created.path().join(NODE_CONF)).unwrap();

        let loaded = Node::load(cluster.path(), "node1").unwrap();
        assert_eq!(loaded.document(), created.document());
        loaded.save().unwrap();
        let second = std::fs::read_to_string(loaded.path().join(NODE_CONF)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_load_reports_missing_keys() {
        let cluster = tempdir().unwrap();
        std::fs::create_dir_all(cluster.path().join("node1")).unwrap();
        let conf = cluster.path().join("node1").join(NODE_CONF);
        std::fs::write(conf, "name: node1\nstatus: UP\n").unwrap();

        let err = Node::load(cluster.path(), "node1").unwrap_err();
        assert!(matches!(err, Error::Load { .. }));
        assert!(matches!(Node::load(cluster.path(), "node2"), Err(Error::Load { .. })));
    }

    #[test]
    fn test_document_format() {
        let doc: NodeDocument = serde_yaml::from_str(
            "name: node2\n\
             status: DOWN\n\
             auto_bootstrap: false\n\
             interfaces:\n  thrift: [127.0.0.2, 9160]\n  \
             storage: [127.0.0.2, 7000]\n  binary: null\n\
             jmx_port: 7200\n\
             initial_token: '-3074457345618258603'\n",
        )
        .unwrap();
        assert_eq!(doc.status, NodeStatus::Down);
        assert_eq!(doc.interfaces.thrift, Endpoint::new("127.0.0.2", 9160));
        assert!(doc.interfaces.binary.is_none());
        assert_eq!(doc.initial_token, Some(Token::Numeric(-3074457345618258603)));
        assert!(doc.config_options.is_empty());
    }

    #[test]
    fn test_interfaces_iter_skips_missing_binary() {
        let mut itfs = NetworkInterfaces::on_host("127.0.0.1");
        assert_eq!(itfs.iter().count(), 3);
        itfs.binary = None;
        let names: Vec<&str> = itfs.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["thrift", "storage"]);
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert!(matches!("LOUD".parse::<LogLevel>(), Err(Error::Argument(_))));
    }
}
