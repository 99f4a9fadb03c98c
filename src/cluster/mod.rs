//! Cluster Management
//!
//! A cluster is a directory holding `cluster.conf` and one subdirectory per
//! node. It owns its nodes, the seed list and the cluster-wide configuration
//! overlay; every change that affects rendered node configuration cascades
//! to all nodes.

mod lifecycle;
mod topology;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::config::CcmConfig;
use crate::error::{Error, NodeContext, Result};
use crate::node::{ClusterContext, LogLevel, Node, NodeSpec, StartOptions, StopOptions};
use crate::overlay::ConfigOverlay;
use crate::partitioner::Partitioner;
use crate::process::ProcessHandle;
use crate::repository::{validate_install_dir, Repository};

pub use lifecycle::{ClusterStartOptions, StartedNode, StopOutcome};
pub use topology::{NodeCounts, PopulateOptions};

/// Persisted cluster document, inside the cluster directory
pub const CLUSTER_CONF: &str = "cluster.conf";

/// On-disk form of a cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ClusterDocument {
    name: String,
    nodes: Vec<String>,
    seeds: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    partitioner: Option<Partitioner>,
    #[serde(default)]
    config_options: ConfigOverlay,
    #[serde(default)]
    log_level: LogLevel,
    #[serde(default)]
    use_vnodes: bool,
    cassandra_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,
}

/// A local Cassandra cluster
#[derive(Debug)]
pub struct Cluster {
    name: String,
    path: PathBuf,
    install_dir: PathBuf,
    version: Option<String>,
    partitioner: Option<Partitioner>,
    use_vnodes: bool,
    config_options: ConfigOverlay,
    log_level: LogLevel,
    /// Seed node names, in seeding order
    seeds: Vec<String>,
    /// Nodes in creation order
    nodes: Vec<Node>,
    settings: CcmConfig,
}

impl Cluster {
    /// Create an empty cluster in `root/name` running `install_dir`
    pub fn create(
        root: &Path,
        name: &str,
        install_dir: impl Into<PathBuf>,
        settings: CcmConfig,
    ) -> Result<Cluster> {
        let install_dir = install_dir.into();
        validate_install_dir(&install_dir)?;
        Self::create_in(root, name, install_dir, None, settings)
    }

    /// Create an empty cluster running `version` as resolved by `repository`
    pub fn create_from_repository(
        root: &Path,
        name: &str,
        repository: &dyn Repository,
        version: &str,
        settings: CcmConfig,
    ) -> Result<Cluster> {
        let install_dir = repository.resolve(version)?;
        Self::create_in(root, name, install_dir, Some(version.to_string()), settings)
    }

    fn create_in(
        root: &Path,
        name: &str,
        install_dir: PathBuf,
        version: Option<String>,
        settings: CcmConfig,
    ) -> Result<Cluster> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(Error::Argument(format!("invalid cluster name {:?}", name)));
        }
        let path = root.join(name);
        if path.exists() {
            return Err(Error::Argument(format!(
                "Cluster {} already exists in {}",
                name,
                root.display()
            )));
        }
        std::fs::create_dir_all(&path)?;

        let cluster = Cluster {
            name: name.to_string(),
            path,
            install_dir,
            version,
            partitioner: None,
            use_vnodes: false,
            config_options: ConfigOverlay::new(),
            log_level: LogLevel::default(),
            seeds: Vec::new(),
            nodes: Vec::new(),
            settings,
        };
        cluster.save()?;
        tracing::info!("Created cluster {} in {}", cluster.name, cluster.path.display());
        Ok(cluster)
    }

    /// Load the cluster persisted in `root/name`, with its nodes
    pub fn load(root: &Path, name: &str, settings: CcmConfig) -> Result<Cluster> {
        let path = root.join(name);
        let conf = path.join(CLUSTER_CONF);
        let load_error = |reason: String| Error::Load {
            path: conf.clone(),
            reason,
        };
        let content = std::fs::read_to_string(&conf).map_err(|e| load_error(e.to_string()))?;
        let doc: ClusterDocument =
            serde_yaml::from_str(&content).map_err(|e| load_error(e.to_string()))?;

        if let Some(stray) = doc.seeds.iter().find(|s| !doc.nodes.contains(s)) {
            return Err(load_error(format!("seed {} is not a node of the cluster", stray)));
        }

        let mut nodes = Vec::with_capacity(doc.nodes.len());
        for node_name in &doc.nodes {
            let mut node = Node::load(&path, node_name)?;
            node.inherit_settings(doc.log_level, &settings);
            nodes.push(node);
        }

        tracing::debug!("Loaded cluster {} with {} nodes", doc.name, nodes.len());
        Ok(Cluster {
            name: doc.name,
            path,
            install_dir: doc.cassandra_dir,
            version: doc.version,
            partitioner: doc.partitioner,
            use_vnodes: doc.use_vnodes,
            config_options: doc.config_options,
            log_level: doc.log_level,
            seeds: doc.seeds,
            nodes,
            settings,
        })
    }

    fn document(&self) -> ClusterDocument {
        ClusterDocument {
            name: self.name.clone(),
            nodes: self.nodes.iter().map(|n| n.name().to_string()).collect(),
            seeds: self.seeds.clone(),
            partitioner: self.partitioner,
            config_options: self.config_options.clone(),
            log_level: self.log_level,
            use_vnodes: self.use_vnodes,
            cassandra_dir: self.install_dir.clone(),
            version: self.version.clone(),
        }
    }

    /// Persist the cluster document
    pub fn save(&self) -> Result<()> {
        let content = serde_yaml::to_string(&self.document())?;
        let tmp = self.path.join(format!("{}.tmp", CLUSTER_CONF));
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, self.path.join(CLUSTER_CONF))?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cluster directory
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    /// Version the install was resolved from, if created from a repository
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Partitioner explicitly set on the cluster
    pub fn partitioner(&self) -> Option<Partitioner> {
        self.partitioner
    }

    pub fn use_vnodes(&self) -> bool {
        self.use_vnodes
    }

    pub fn log_level(&self) -> LogLevel {
        self.log_level
    }

    /// Cluster-wide configuration overrides
    pub fn config_options(&self) -> &ConfigOverlay {
        &self.config_options
    }

    pub fn settings(&self) -> &CcmConfig {
        &self.settings
    }

    /// Seed node names
    pub fn seeds(&self) -> &[String] {
        &self.seeds
    }

    /// Storage addresses of the seed nodes
    pub fn seed_addresses(&self) -> Vec<String> {
        self.seeds
            .iter()
            .filter_map(|s| self.node(s))
            .map(|n| n.address().to_string())
            .collect()
    }

    /// Nodes in creation order
    pub fn nodelist(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.name() == name)
    }

    fn require_node_mut(&mut self, name: &str) -> Result<&mut Node> {
        let cluster = self.name.clone();
        self.node_mut(name)
            .ok_or_else(|| Error::Argument(format!("Unknown node {} in cluster {}", name, cluster)))
    }

    /// Partitioner nodes end up running with
    pub fn effective_partitioner(&self) -> Partitioner {
        if let Some(p) = self.partitioner {
            return p;
        }
        let template = self.install_dir.join(crate::repository::DEFAULT_CONF);
        std::fs::read_to_string(template)
            .ok()
            .and_then(|content| serde_yaml::from_str::<Value>(&content).ok())
            .and_then(|doc| doc.get("partitioner").and_then(Value::as_str).map(str::to_string))
            .and_then(|class| class.parse().ok())
            .unwrap_or(Partitioner::Murmur3)
    }

    /// Snapshot handed to node operations; peers are left empty
    fn base_context(&self) -> ClusterContext {
        ClusterContext {
            cluster_name: self.name.clone(),
            install_dir: self.install_dir.clone(),
            partitioner: self.partitioner,
            use_vnodes: self.use_vnodes,
            config_options: self.config_options.clone(),
            seeds: self.seed_addresses(),
            log_level: self.log_level,
            settings: self.settings.clone(),
            peers: Vec::new(),
        }
    }

    /// Snapshot for operating on `name`, with the live state of every other node
    pub fn context_for(&mut self, name: &str) -> Result<ClusterContext> {
        if self.node(name).is_none() {
            return Err(Error::Argument(format!("Unknown node {} in cluster {}", name, self.name)));
        }
        let peers = self
            .nodes
            .iter_mut()
            .filter(|n| n.name() != name)
            .map(|n| n.peer_view())
            .collect();
        let mut ctx = self.base_context();
        ctx.peers = peers;
        Ok(ctx)
    }

    /// Add a node built from `spec`, optionally as a seed
    pub fn add(&mut self, spec: NodeSpec, is_seed: bool) -> Result<()> {
        if self.node(&spec.name).is_some() {
            return Err(Error::Argument(format!("Cannot create existing node {}", spec.name)));
        }
        if let Some(token) = &spec.initial_token {
            if let Some(owner) = self.nodes.iter().find(|n| n.initial_token() == Some(token)) {
                return Err(Error::Argument(format!(
                    "token {} is already owned by {}",
                    token,
                    owner.name()
                )));
            }
        }

        let mut ctx = self.base_context();
        if is_seed {
            ctx.seeds.push(spec.interfaces.storage.host().to_string());
        }
        let has_dc = spec.data_center.is_some();
        let node = Node::create(&self.path, spec, &ctx)?;
        tracing::info!("Added {} to cluster {}", node.name(), self.name);

        if is_seed {
            self.seeds.push(node.name().to_string());
        }
        self.nodes.push(node);
        self.save()?;

        if is_seed {
            self.render_all()?;
        }
        if has_dc {
            self.update_topology_files()?;
        }
        Ok(())
    }

    /// Regenerate cassandra.yaml of every node
    fn render_all(&self) -> Result<()> {
        let ctx = self.base_context();
        for node in &self.nodes {
            node.update_yaml(&ctx)?;
        }
        tracing::debug!("Re-rendered configuration of {} nodes", self.nodes.len());
        Ok(())
    }

    /// Start a single node with its peers' live state
    pub fn start_node(&mut self, name: &str, opts: &StartOptions) -> Result<ProcessHandle> {
        let ctx = self.context_for(name)?;
        self.require_node_mut(name)?.start(opts, &ctx)
    }

    /// Stop a single node; `Ok(false)` if it was not running
    pub fn stop_node(&mut self, name: &str, opts: &StopOptions) -> Result<bool> {
        let ctx = self.context_for(name)?;
        self.require_node_mut(name)?.stop(opts, &ctx)
    }

    /// Decommission a single node
    pub fn decommission_node(&mut self, name: &str) -> Result<()> {
        let ctx = self.context_for(name)?;
        self.require_node_mut(name)?.decommission(&ctx)
    }

    /// Override configuration options on a single node
    pub fn set_node_configuration_options<I>(&mut self, name: &str, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, Option<Value>)>,
    {
        let ctx = self.base_context();
        self.require_node_mut(name)?.set_configuration_options(values, &ctx)
    }

    /// Forcefully stop `name`, delete its directory and forget it
    pub fn remove_node(&mut self, name: &str) -> Result<()> {
        let ctx = self.context_for(name)?;
        let stop = StopOptions {
            wait: true,
            wait_other_notice: false,
            gently: false,
        };
        let node = self.require_node_mut(name)?;
        node.stop(&stop, &ctx)?;
        let node_path = node.path().to_path_buf();

        self.nodes.retain(|n| n.name() != name);
        self.seeds.retain(|s| s != name);
        if node_path.exists() {
            std::fs::remove_dir_all(&node_path).for_node(name)?;
        }
        self.save()?;
        self.render_all()?;
        self.update_topology_files()?;
        tracing::info!("Removed {} from cluster {}", name, self.name);
        Ok(())
    }

    /// Stop every node and delete the cluster directory
    pub fn destroy(mut self) -> Result<()> {
        let outcome = self.stop(true, false);
        for (node, err) in &outcome.failed {
            tracing::warn!("Could not stop {} before removal: {}", node, err);
        }
        std::fs::remove_dir_all(&self.path)?;
        tracing::info!("Destroyed cluster {}", self.name);
        Ok(())
    }

    /// Add cluster-wide configuration overrides and re-render every node
    pub fn set_configuration_options<I>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, Option<Value>)>,
    {
        self.config_options.extend(values)?;
        self.render_all()?;
        self.save()
    }

    pub fn set_partitioner(&mut self, partitioner: Partitioner) -> Result<()> {
        self.partitioner = Some(partitioner);
        self.render_all()?;
        self.save()
    }

    /// Change the server log level of every node
    pub fn set_log_level(&mut self, level: LogLevel) -> Result<()> {
        self.log_level = level;
        for node in &mut self.nodes {
            node.set_log_level(level)?;
        }
        self.save()
    }

    /// Switch the commit log between batch and periodic sync
    pub fn set_batch_commitlog(&mut self, enabled: bool) -> Result<()> {
        let values = if enabled {
            vec![
                ("commitlog_sync".to_string(), Some(Value::from("batch"))),
                ("commitlog_sync_batch_window_in_ms".to_string(), Some(Value::from(5))),
                ("commitlog_sync_period_in_ms".to_string(), None),
            ]
        } else {
            vec![
                ("commitlog_sync".to_string(), Some(Value::from("periodic"))),
                ("commitlog_sync_batch_window_in_ms".to_string(), None),
                ("commitlog_sync_period_in_ms".to_string(), Some(Value::from(10000))),
            ]
        };
        self.set_configuration_options(values)
    }

    /// Stop every node and wipe its data and commit logs
    pub fn clear(&mut self) -> Result<()> {
        let mut outcome = self.stop(true, true);
        if let Some((_, err)) = outcome.failed.pop() {
            return Err(err);
        }
        for node in &mut self.nodes {
            node.clear(false, false)?;
        }
        Ok(())
    }

    /// Run `nodetool <cmd>` on every running node, returning each output
    pub fn nodetool(&mut self, cmd: &str) -> Result<Vec<(String, String)>> {
        let ctx = self.base_context();
        let mut outputs = Vec::new();
        for node in &mut self.nodes {
            if node.is_running()? {
                outputs.push((node.name().to_string(), node.nodetool(cmd, &ctx)?));
            }
        }
        Ok(outputs)
    }

    /// Install `source` as every node's log4j configuration
    pub fn update_log4j(&self, source: &Path) -> Result<()> {
        for node in &self.nodes {
            node.update_log4j(source)?;
        }
        Ok(())
    }

    /// Install `source` as every node's logback configuration
    pub fn update_logback(&self, source: &Path) -> Result<()> {
        for node in &self.nodes {
            node.update_logback(source)?;
        }
        Ok(())
    }
}
