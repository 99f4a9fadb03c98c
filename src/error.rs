//! CCM Error Types

use std::path::PathBuf;

use thiserror::Error;

use crate::process::ProcessReport;

/// Result type alias for CCM operations
pub type Result<T> = std::result::Result<T, Error>;

/// CCM error types
#[derive(Error, Debug)]
pub enum Error {
    // Caller errors
    #[error("Invalid argument: {0}")]
    Argument(String),

    // Network errors
    #[error("Inet address {address} is not available: {reason}")]
    UnavailableSocket { address: String, reason: String },

    // Node lifecycle errors
    #[error("{message}")]
    Node {
        node: String,
        message: String,
        process: Option<Box<ProcessReport>>,
    },

    #[error("[{source_name}] Missing: {missing:?}")]
    Timeout {
        source_name: String,
        missing: Vec<String>,
        output: String,
    },

    // Persisted state errors
    #[error("Error loading {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("Repository error: {0}")]
    Repository(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid log pattern: {0}")]
    Pattern(#[from] regex::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a node error without process diagnostics
    pub fn node(node: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Node {
            node: node.into(),
            message: message.into(),
            process: None,
        }
    }

    /// Build a node error carrying a report of the offending process
    pub fn node_with_process(
        node: impl Into<String>,
        message: impl Into<String>,
        report: ProcessReport,
    ) -> Self {
        Error::Node {
            node: node.into(),
            message: message.into(),
            process: Some(Box::new(report)),
        }
    }

    /// Attach `node` to a low-level I/O or YAML failure. Errors that already
    /// name a node, or are not tied to one, pass through unchanged.
    pub fn scoped_to(self, node: &str) -> Self {
        match self {
            Error::Io(e) => Error::node(node, format!("{}: {}", node, e)),
            Error::Yaml(e) => Error::node(node, format!("{}: {}", node, e)),
            other => other,
        }
    }

    /// Check if this error is a log-watch timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Name of the node this error originated from, if any
    pub fn node_name(&self) -> Option<&str> {
        match self {
            Error::Node { node, .. } => Some(node),
            Error::Timeout { source_name, .. } => Some(source_name),
            _ => None,
        }
    }

    /// Process diagnostics attached to a node error
    pub fn process_report(&self) -> Option<&ProcessReport> {
        match self {
            Error::Node { process, .. } => process.as_deref(),
            _ => None,
        }
    }
}

/// Scope the error of a node-level step to the node it ran on
pub trait NodeContext<T> {
    fn for_node(self, node: &str) -> Result<T>;
}

impl<T, E: Into<Error>> NodeContext<T> for std::result::Result<T, E> {
    fn for_node(self, node: &str) -> Result<T> {
        self.map_err(|e| e.into().scoped_to(node))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_error_accessors() {
        let err = Error::node("node1", "node1 is already running");
        assert_eq!(err.node_name(), Some("node1"));
        assert!(err.process_report().is_none());
        assert!(!err.is_timeout());
        assert_eq!(err.to_string(), "node1 is already running");
    }

    #[test]
    fn test_io_errors_are_scoped_to_node() {
        let missing = std::fs::read_to_string("/nonexistent/ccm/node.conf").for_node("node3");
        let err = missing.unwrap_err();
        assert_eq!(err.node_name(), Some("node3"));
        assert!(err.to_string().starts_with("node3: "));

        let argument: Result<()> = Err(Error::Argument("bad".into()));
        assert!(matches!(argument.for_node("node3"), Err(Error::Argument(_))));
    }

    #[test]
    fn test_timeout_display() {
        let err = Error::Timeout {
            source_name: "node2".into(),
            missing: vec!["now UP".into()],
            output: String::new(),
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "[node2] Missing: [\"now UP\"]");
    }
}
