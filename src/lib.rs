//! CCM - Local Cassandra Cluster Manager
//!
//! Creates, configures, starts and stops multi-node Cassandra clusters on a
//! single machine, each node bound to its own loopback address and running
//! from its own directory tree.
//!
//! # Architecture
//!
//! A [`Cluster`] owns its [`Node`]s and persists itself as YAML documents in
//! its directory. Nodes are ordinary OS processes launched from a Cassandra
//! install; readiness and cluster formation are observed by scraping each
//! node's system log with a [`LogWatcher`].
//!
//! # Features
//!
//! - Balanced token assignment for single and multi-datacenter layouts
//! - Layered `cassandra.yaml` overrides (distribution, cluster, node)
//! - Start/stop with readiness, gossip and death barriers
//! - nodetool administration and interactive `cassandra-cli` sessions

pub mod cli_session;
pub mod cluster;
pub mod config;
pub mod error;
pub mod log_watcher;
pub mod logging;
pub mod node;
pub mod overlay;
pub mod partitioner;
pub mod process;
pub mod repository;

pub use cluster::Cluster;
pub use config::CcmConfig;
pub use error::{Error, Result};
pub use log_watcher::LogWatcher;
pub use node::Node;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cli_session::CliSession;
    pub use crate::cluster::{
        Cluster, ClusterStartOptions, NodeCounts, PopulateOptions, StartedNode, StopOutcome,
    };
    pub use crate::config::CcmConfig;
    pub use crate::error::{Error, Result};
    pub use crate::log_watcher::LogWatcher;
    pub use crate::node::{LogLevel, Node, NodeSpec, NodeStatus, StartOptions, StopOptions};
    pub use crate::overlay::ConfigOverlay;
    pub use crate::partitioner::{Partitioner, Token};
    pub use crate::repository::{LocalRepository, Repository};
}
