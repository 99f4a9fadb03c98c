//! Cluster population and datacenter topology

use std::collections::HashSet;
use std::net::Ipv4Addr;

use serde_yaml::Value;

use super::Cluster;
use crate::error::{Error, Result};
use crate::node::{Endpoint, NetworkInterfaces, Node, NodeSpec};
use crate::partitioner::Token;

/// Snitch reading `cassandra-topology.properties`
pub const PROPERTY_FILE_SNITCH: &str = "org.apache.cassandra.locator.PropertyFileSnitch";

const THRIFT_PORT: u16 = 9160;
const STORAGE_PORT: u16 = 7000;
const BINARY_PORT: u16 = 9042;
const JMX_PORT_BASE: u16 = 7000;
const DEBUG_PORT_BASE: u16 = 2000;
const PORT_STRIDE: u16 = 100;

/// How many nodes to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCounts {
    /// All nodes in one implicit datacenter
    Single(usize),
    /// Node count per datacenter `dc1`, `dc2`, ...
    PerDc(Vec<usize>),
}

impl NodeCounts {
    fn total(&self) -> usize {
        match self {
            NodeCounts::Single(n) => *n,
            NodeCounts::PerDc(counts) => counts.iter().sum(),
        }
    }

    /// Datacenter label of every node, in creation order
    fn data_centers(&self) -> Vec<Option<String>> {
        match self {
            NodeCounts::Single(n) => vec![None; *n],
            NodeCounts::PerDc(counts) => counts
                .iter()
                .enumerate()
                .flat_map(|(dc, &count)| {
                    std::iter::repeat(Some(format!("dc{}", dc + 1))).take(count)
                })
                .collect(),
        }
    }
}

impl From<usize> for NodeCounts {
    fn from(n: usize) -> Self {
        NodeCounts::Single(n)
    }
}

impl From<Vec<usize>> for NodeCounts {
    fn from(counts: Vec<usize>) -> Self {
        NodeCounts::PerDc(counts)
    }
}

impl From<&[usize]> for NodeCounts {
    fn from(counts: &[usize]) -> Self {
        NodeCounts::PerDc(counts.to_vec())
    }
}

/// Options for [`Cluster::populate`]
#[derive(Debug, Clone)]
pub struct PopulateOptions {
    /// Let Cassandra pick 256 tokens per node instead of assigning one
    pub use_vnodes: bool,
    /// Node `i` listens on `<ip_prefix><i>`
    pub ip_prefix: String,
    /// Open a remote debugger port on every node
    pub debug: bool,
    /// Explicit tokens, one per node, instead of balanced ones
    pub tokens: Option<Vec<Token>>,
}

impl Default for PopulateOptions {
    fn default() -> Self {
        Self {
            use_vnodes: false,
            ip_prefix: "127.0.0.".to_string(),
            debug: false,
            tokens: None,
        }
    }
}

fn port_for(base: u16, index: usize) -> Result<u16> {
    u16::try_from(index)
        .ok()
        .and_then(|i| i.checked_mul(PORT_STRIDE))
        .and_then(|offset| base.checked_add(offset))
        .ok_or_else(|| Error::Argument(format!("too many nodes for port layout ({})", index)))
}

impl Cluster {
    /// Create and configure the nodes of an empty cluster.
    ///
    /// Node `i` (from 1) is named `node<i>`, listens on `<ip_prefix><i>`
    /// with the standard thrift, storage and native ports, and gets JMX port
    /// `7000 + 100 * i`. Every node is a seed. Without vnodes each node gets
    /// a balanced initial token, per datacenter when counts are per DC.
    pub fn populate(
        &mut self,
        counts: impl Into<NodeCounts>,
        opts: &PopulateOptions,
    ) -> Result<()> {
        let counts = counts.into();
        if !self.nodes.is_empty() {
            return Err(Error::Argument(format!("Cluster {} is not empty", self.name)));
        }
        let total = counts.total();
        if total == 0 {
            return Err(Error::Argument("Cannot populate a cluster with no nodes".into()));
        }

        let addresses = (1..=total)
            .map(|i| {
                let address = format!("{}{}", opts.ip_prefix, i);
                address
                    .parse::<Ipv4Addr>()
                    .map(|_| address.clone())
                    .map_err(|_| {
                        Error::Argument(format!(
                            "invalid address {} from prefix {}",
                            address, opts.ip_prefix
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let tokens = self.tokens_for(&counts, opts)?;
        let data_centers = counts.data_centers();

        if let NodeCounts::PerDc(_) = counts {
            self.config_options
                .set("endpoint_snitch", Some(Value::from(PROPERTY_FILE_SNITCH)))?;
        }
        self.use_vnodes = opts.use_vnodes;

        let mut ctx = self.base_context();
        ctx.seeds = addresses.clone();

        let layout = addresses.into_iter().zip(tokens).zip(data_centers);
        for (i, ((address, token), data_center)) in layout.enumerate() {
            let index = i + 1;
            let spec = NodeSpec {
                name: format!("node{}", index),
                auto_bootstrap: false,
                interfaces: NetworkInterfaces {
                    thrift: Endpoint::new(address.clone(), THRIFT_PORT),
                    storage: Endpoint::new(address.clone(), STORAGE_PORT),
                    binary: Some(Endpoint::new(address, BINARY_PORT)),
                },
                jmx_port: port_for(JMX_PORT_BASE, index)?,
                remote_debug_port: if opts.debug { port_for(DEBUG_PORT_BASE, index)? } else { 0 },
                initial_token: token,
                data_center,
                install_dir: None,
            };
            let node = Node::create(&self.path, spec, &ctx)?;
            self.seeds.push(node.name().to_string());
            self.nodes.push(node);
        }

        self.save()?;
        self.update_topology_files()?;
        tracing::info!("Populated cluster {} with {} nodes", self.name, total);
        Ok(())
    }

    /// Initial token of every node, `None` with vnodes or without a
    /// numeric ring
    fn tokens_for(
        &self,
        counts: &NodeCounts,
        opts: &PopulateOptions,
    ) -> Result<Vec<Option<Token>>> {
        let total = counts.total();
        if opts.use_vnodes {
            if opts.tokens.is_some() {
                return Err(Error::Argument(
                    "explicit tokens cannot be combined with vnodes".into(),
                ));
            }
            return Ok(vec![None; total]);
        }

        if let Some(tokens) = &opts.tokens {
            if tokens.len() != total {
                return Err(Error::Argument(format!(
                    "got {} tokens for {} nodes",
                    tokens.len(),
                    total
                )));
            }
            let distinct: HashSet<&Token> = tokens.iter().collect();
            if distinct.len() != tokens.len() {
                return Err(Error::Argument("tokens must be distinct".into()));
            }
            return Ok(tokens.iter().cloned().map(Some).collect());
        }

        let partitioner = self.effective_partitioner();
        let balanced = match counts {
            NodeCounts::Single(n) => partitioner.balanced_tokens(*n),
            NodeCounts::PerDc(per_dc) => partitioner.balanced_tokens_across_dcs(per_dc),
        };
        match balanced {
            Some(tokens) => Ok(tokens.into_iter().map(Some).collect()),
            None => {
                tracing::warn!(
                    "{} has no numeric ring, leaving tokens unassigned",
                    partitioner.name()
                );
                Ok(vec![None; total])
            }
        }
    }

    /// Contents of `cassandra-topology.properties`
    pub fn topology(&self) -> String {
        let mut content = String::from("default=dc1:r1\n");
        for node in &self.nodes {
            if let Some(dc) = node.data_center() {
                content.push_str(&format!("{}={}:r1\n", node.address(), dc));
            }
        }
        content
    }

    /// Write the topology file to every node if any node has a datacenter
    pub(crate) fn update_topology_files(&self) -> Result<()> {
        if self.nodes.iter().all(|n| n.data_center().is_none()) {
            return Ok(());
        }
        let content = self.topology();
        for node in &self.nodes {
            node.write_topology(&content)?;
        }
        Ok(())
    }
}
