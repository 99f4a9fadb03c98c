//! Cassandra install resolution
//!
//! Provisioning distributions (downloading releases, building from source
//! control) is somebody else's job. The cluster manager only needs a version
//! string turned into a validated install directory.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Launcher script, relative to an install directory
pub const LAUNCHER: &str = "bin/cassandra";

/// Default configuration document, relative to an install directory
pub const DEFAULT_CONF: &str = "conf/cassandra.yaml";

/// Resolves a version identifier to a local install directory
pub trait Repository {
    /// Return a directory containing a runnable `bin/` and a default `conf/`
    fn resolve(&self, version: &str) -> Result<PathBuf>;
}

/// Check that `dir` looks like a usable Cassandra install
pub fn validate_install_dir(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Err(Error::Repository(format!("{} is not a directory", dir.display())));
    }
    for required in [LAUNCHER, DEFAULT_CONF] {
        if !dir.join(required).is_file() {
            return Err(Error::Repository(format!(
                "{} is not a Cassandra install: missing {}",
                dir.display(),
                required
            )));
        }
    }
    Ok(())
}

/// Installs laid out as `<root>/<version>`, prepared ahead of time
#[derive(Debug, Clone)]
pub struct LocalRepository {
    root: PathBuf,
}

impl LocalRepository {
    /// Create a repository over `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory holding one install per version
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Versions with a valid install, sorted
    pub fn versions(&self) -> Result<Vec<String>> {
        let mut versions = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if validate_install_dir(&entry.path()).is_ok() {
                versions.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        versions.sort();
        Ok(versions)
    }
}

impl Repository for LocalRepository {
    fn resolve(&self, version: &str) -> Result<PathBuf> {
        // Source-control references are accepted verbatim ("git:cassandra-1.2")
        let dir_name = version.replace([':', '/'], "_");
        if dir_name.is_empty() || dir_name.starts_with('.') {
            return Err(Error::Repository(format!("invalid version {:?}", version)));
        }
        let dir = self.root.join(dir_name);
        validate_install_dir(&dir)?;
        tracing::debug!("Resolved Cassandra {} to {}", version, dir.display());
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fake_install(dir: &Path) {
        std::fs::create_dir_all(dir.join("bin")).unwrap();
        std::fs::create_dir_all(dir.join("conf")).unwrap();
        std::fs::write(dir.join(LAUNCHER), "#!/bin/sh\n").unwrap();
        std::fs::write(dir.join(DEFAULT_CONF), "cluster_name: Test\n").unwrap();
    }

    #[test]
    fn test_resolve_versions() {
        let root = tempdir().unwrap();
        fake_install(&root.path().join("1.2.5"));
        fake_install(&root.path().join("git_cassandra-1.2"));
        std::fs::create_dir_all(root.path().join("broken/bin")).unwrap();

        let repo = LocalRepository::new(root.path());
        assert_eq!(repo.resolve("1.2.5").unwrap(), root.path().join("1.2.5"));
        assert_eq!(
            repo.resolve("git:cassandra-1.2").unwrap(),
            root.path().join("git_cassandra-1.2")
        );
        assert_eq!(repo.versions().unwrap(), vec!["1.2.5", "git_cassandra-1.2"]);
    }

    #[test]
    fn test_resolve_rejects_missing_and_incomplete() {
        let root = tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("2.0.0/bin")).unwrap();

        let repo = LocalRepository::new(root.path());
        assert!(matches!(repo.resolve("1.0.0"), Err(Error::Repository(_))));
        assert!(matches!(repo.resolve("2.0.0"), Err(Error::Repository(_))));
        assert!(matches!(repo.resolve(".."), Err(Error::Repository(_))));
    }
}
