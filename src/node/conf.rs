//! Node configuration files
//!
//! `cassandra.yaml` is regenerated from the install's template on every
//! change: template, then node-derived settings, then the cluster overlay,
//! then the node overlay. Logging and environment scripts are copied once at
//! creation and edited line by line afterwards.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde_yaml::{Mapping, Value};

use super::{ClusterContext, Node};
use crate::error::{Error, NodeContext, Result};
use crate::repository::DEFAULT_CONF;

/// Node-local YAML configuration
pub const CASSANDRA_YAML: &str = "cassandra.yaml";

/// log4j configuration (pre-2.1 installs)
pub const LOG4J_CONF: &str = "log4j-server.properties";

/// logback configuration (2.1+ installs)
pub const LOGBACK_CONF: &str = "logback.xml";

/// JVM environment script
pub const ENV_FILE: &str = "cassandra-env.sh";

/// Rack/datacenter assignments read by PropertyFileSnitch
pub const TOPOLOGY_FILE: &str = "cassandra-topology.properties";

/// Include script pointing the launcher at the node's directories
pub const INCLUDE_FILE: &str = "cassandra.in.sh";

const SIMPLE_SEED_PROVIDER: &str = "org.apache.cassandra.locator.SimpleSeedProvider";

/// num_tokens written when vnodes are enabled
const VNODE_TOKENS: u64 = 256;

impl Node {
    pub(crate) fn import_config_files(&self, ctx: &ClusterContext) -> Result<()> {
        copy_dir(&self.install_dir(ctx).join("conf"), &self.conf_dir())?;
        self.render_config(ctx)
    }

    pub(crate) fn import_bin_files(&self, ctx: &ClusterContext) -> Result<()> {
        copy_dir(&self.install_dir(ctx).join("bin"), &self.bin_dir())
    }

    /// Regenerate every configuration file of the node
    pub fn render_config(&self, ctx: &ClusterContext) -> Result<()> {
        self.update_yaml(ctx)?;
        self.update_log_config()?;
        self.update_envfile()
    }

    /// Regenerate `conf/cassandra.yaml`
    pub fn update_yaml(&self, ctx: &ClusterContext) -> Result<()> {
        let template = self.install_dir(ctx).join(DEFAULT_CONF);
        let content = std::fs::read_to_string(&template).map_err(|e| Error::Load {
            path: template.clone(),
            reason: e.to_string(),
        })?;
        let mut doc: Mapping = match serde_yaml::from_str::<Value>(&content).for_node(&self.name)? {
            Value::Mapping(m) => m,
            Value::Null => Mapping::new(),
            _ => {
                return Err(Error::Load {
                    path: template,
                    reason: "not a YAML mapping".into(),
                })
            }
        };

        self.apply_generated_settings(&mut doc, ctx);
        ctx.config_options.merged_with(&self.config_options).apply_to(&mut doc);

        let rendered = serde_yaml::to_string(&Value::Mapping(doc)).for_node(&self.name)?;
        std::fs::write(self.conf_dir().join(CASSANDRA_YAML), rendered).for_node(&self.name)?;
        Ok(())
    }

    fn apply_generated_settings(&self, doc: &mut Mapping, ctx: &ClusterContext) {
        let path_value = |p: PathBuf| Value::String(p.to_string_lossy().into_owned());

        set(doc, "cluster_name", Value::String(ctx.cluster_name.clone()));
        set(doc, "auto_bootstrap", Value::Bool(self.auto_bootstrap));
        if let Some(token) = &self.initial_token {
            set(doc, "initial_token", Value::String(token.to_string()));
        } else if ctx.use_vnodes {
            doc.remove("initial_token");
        }

        set(doc, "listen_address", Value::String(self.interfaces.storage.host().to_string()));
        set(doc, "storage_port", Value::from(self.interfaces.storage.port()));
        set(doc, "rpc_address", Value::String(self.interfaces.thrift.host().to_string()));
        set(doc, "rpc_port", Value::from(self.interfaces.thrift.port()));
        if let Some(binary) = &self.interfaces.binary {
            set(doc, "native_transport_port", Value::from(binary.port()));
        }

        set(
            doc,
            "data_file_directories",
            Value::Sequence(vec![path_value(self.path.join("data"))]),
        );
        set(doc, "commitlog_directory", path_value(self.path.join("commitlogs")));
        set(doc, "saved_caches_directory", path_value(self.path.join("saved_caches")));

        if let Some(partitioner) = ctx.partitioner {
            set(doc, "partitioner", Value::String(partitioner.class_name().to_string()));
        }
        if ctx.use_vnodes {
            set(doc, "num_tokens", Value::from(VNODE_TOKENS));
        } else if doc.contains_key("num_tokens") {
            set(doc, "num_tokens", Value::from(1u64));
        }

        set_seeds(doc, ctx.seeds.join(","));
    }

    /// Point the server log at `logs/system.log` with the current level
    pub fn update_log_config(&self) -> Result<()> {
        let log_file = self.log_file().to_string_lossy().replace('\\', "/");
        let level = self.log_level.to_string();

        let log4j = self.conf_dir().join(LOG4J_CONF);
        if log4j.is_file() {
            replace_in_file(
                &log4j,
                &[
                    (
                        r"^\s*log4j\.appender\.R\.File=",
                        format!("log4j.appender.R.File={}", log_file),
                    ),
                    (r"^\s*log4j\.rootLogger=", format!("log4j.rootLogger={},stdout,R", level)),
                ],
            )
            .for_node(&self.name)?;
        }

        let logback = self.conf_dir().join(LOGBACK_CONF);
        if logback.is_file() {
            replace_in_file(
                &logback,
                &[
                    (r"<file>.*</file>", format!("<file>{}</file>", log_file)),
                    (r#"<root level=".*">"#, format!(r#"<root level="{}">"#, level)),
                ],
            )
            .for_node(&self.name)?;
        }
        Ok(())
    }

    /// Set JMX and remote debugger ports in `cassandra-env.sh`
    pub fn update_envfile(&self) -> Result<()> {
        let env_file = self.conf_dir().join(ENV_FILE);
        if !env_file.is_file() {
            tracing::debug!("{} has no {}, leaving JVM environment alone", self.name, ENV_FILE);
            return Ok(());
        }
        let mut rules = vec![(r"^\s*JMX_PORT=", format!("JMX_PORT=\"{}\"", self.jmx_port))];
        if self.remote_debug_port != 0 {
            rules.push((
                r"jdwp.*address=",
                format!(
                    "JVM_OPTS=\"$JVM_OPTS -Xdebug -Xnoagent -Djava.compiler=NONE \
                     -Xrunjdwp:transport=dt_socket,server=y,suspend=n,address={}\"",
                    self.remote_debug_port
                ),
            ));
        }
        replace_in_file(&env_file, &rules).for_node(&self.name)
    }

    /// Add configuration overrides specific to this node and re-render
    pub fn set_configuration_options<I>(&mut self, values: I, ctx: &ClusterContext) -> Result<()>
    where
        I: IntoIterator<Item = (String, Option<Value>)>,
    {
        self.config_options.extend(values)?;
        self.update_yaml(ctx)?;
        self.save()
    }

    /// Change the server log level
    pub fn set_log_level(&mut self, level: super::LogLevel) -> Result<()> {
        self.log_level = level;
        self.update_log_config()
    }

    /// Install `source` as the node's log4j configuration, as is
    pub fn update_log4j(&self, source: &Path) -> Result<()> {
        std::fs::copy(source, self.conf_dir().join(LOG4J_CONF)).for_node(&self.name)?;
        Ok(())
    }

    /// Install `source` as the node's logback configuration, as is
    pub fn update_logback(&self, source: &Path) -> Result<()> {
        std::fs::copy(source, self.conf_dir().join(LOGBACK_CONF)).for_node(&self.name)?;
        Ok(())
    }

    pub(crate) fn write_topology(&self, content: &str) -> Result<()> {
        std::fs::write(self.conf_dir().join(TOPOLOGY_FILE), content).for_node(&self.name)?;
        Ok(())
    }

    /// Write `bin/cassandra.in.sh` and return the environment the launcher
    /// and tools run with
    pub(crate) fn launch_env(&self, ctx: &ClusterContext) -> Result<Vec<(String, String)>> {
        let install = self.install_dir(ctx);
        let template = install.join("bin").join(INCLUDE_FILE);
        let content = if template.is_file() {
            std::fs::read_to_string(&template)?
        } else {
            String::new()
        };

        let home = format!("CASSANDRA_HOME={}", install.display());
        let conf = format!("CASSANDRA_CONF={}", self.conf_dir().display());
        let (mut rendered, replaced) = replace_lines(
            &content,
            &[
                (Regex::new(r"^\s*CASSANDRA_HOME=")?, home.clone()),
                (Regex::new(r"^\s*CASSANDRA_CONF=")?, conf.clone()),
            ],
        );
        if replaced[1] == 0 {
            rendered.insert_str(0, &format!("{}\n", conf));
        }
        if replaced[0] == 0 {
            rendered.insert_str(0, &format!("{}\n", home));
        }

        let include = self.bin_dir().join(INCLUDE_FILE);
        std::fs::write(&include, rendered)?;

        Ok(vec![
            ("CASSANDRA_INCLUDE".to_string(), include.to_string_lossy().into_owned()),
            ("MAX_HEAP_SIZE".to_string(), ctx.settings.max_heap_size()),
            ("HEAP_NEWSIZE".to_string(), ctx.settings.heap_newsize()),
        ])
    }
}

fn set(doc: &mut Mapping, key: &str, value: Value) {
    doc.insert(Value::String(key.to_string()), value);
}

fn seed_parameters(doc: &mut Mapping) -> Option<&mut Mapping> {
    doc.get_mut("seed_provider")?
        .as_sequence_mut()?
        .get_mut(0)?
        .as_mapping_mut()?
        .get_mut("parameters")?
        .as_sequence_mut()?
        .get_mut(0)?
        .as_mapping_mut()
}

fn set_seeds(doc: &mut Mapping, seeds: String) {
    match seed_parameters(doc) {
        Some(params) => {
            params.insert(Value::String("seeds".into()), Value::String(seeds));
        }
        None => {
            let mut params = Mapping::new();
            params.insert(Value::String("seeds".into()), Value::String(seeds));
            let mut provider = Mapping::new();
            provider.insert(
                Value::String("class_name".into()),
                Value::String(SIMPLE_SEED_PROVIDER.into()),
            );
            provider.insert(
                Value::String("parameters".into()),
                Value::Sequence(vec![Value::Mapping(params)]),
            );
            set(doc, "seed_provider", Value::Sequence(vec![Value::Mapping(provider)]));
        }
    }
}

/// Replace every line matching a rule's pattern with the rule's text,
/// keeping the line's indentation. Returns the new content and how many
/// lines each rule replaced.
fn replace_lines(content: &str, rules: &[(Regex, String)]) -> (String, Vec<usize>) {
    let mut counts = vec![0; rules.len()];
    let mut out = String::with_capacity(content.len());
    for line in content.lines() {
        let rule = rules.iter().position(|(re, _)| re.is_match(line));
        match rule {
            Some(i) => {
                let indent = &line[..line.len() - line.trim_start().len()];
                out.push_str(indent);
                out.push_str(&rules[i].1);
                counts[i] += 1;
            }
            None => out.push_str(line),
        }
        out.push('\n');
    }
    (out, counts)
}

/// Rewrite matching lines of `path` in place
pub(crate) fn replace_in_file(path: &Path, rules: &[(&str, String)]) -> Result<()> {
    let compiled = rules
        .iter()
        .map(|(pattern, text)| -> Result<(Regex, String)> {
            Ok((Regex::new(pattern)?, text.clone()))
        })
        .collect::<Result<Vec<_>>>()?;
    let content = std::fs::read_to_string(path)?;
    let (rendered, _) = replace_lines(&content, &compiled);
    std::fs::write(path, rendered)?;
    Ok(())
}

/// Recursively copy the files of `src` into `dst`
pub(crate) fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::LogLevel;
    use super::*;
    use crate::partitioner::Partitioner;
    use tempfile::tempdir;

    fn rendered_yaml(node: &Node) -> Mapping {
        let content = std::fs::read_to_string(node.conf_dir().join(CASSANDRA_YAML)).unwrap();
        serde_yaml::from_str(&content).unwrap()
    }

    #[test]
    fn test_yaml_carries_node_settings() {
        let install = tempdir().unwrap();
        fake_install(install.path());
        let cluster = tempdir().unwrap();
        let mut ctx = context(install.path());
        ctx.seeds = vec!["127.0.0.1".into(), "127.0.0.2".into()];
        ctx.partitioner = Some(Partitioner::Random);

        let node = Node::create(cluster.path(), spec("node2", 2), &ctx).unwrap();
        let yaml = rendered_yaml(&node);

        assert_eq!(yaml.get("cluster_name"), Some(&Value::from("test")));
        assert_eq!(yaml.get("listen_address"), Some(&Value::from("127.0.0.2")));
        assert_eq!(yaml.get("rpc_address"), Some(&Value::from("127.0.0.2")));
        assert_eq!(yaml.get("storage_port"), Some(&Value::from(7000)));
        assert_eq!(yaml.get("initial_token"), Some(&Value::from("-9223372036854775808")));
        assert_eq!(yaml.get("num_tokens"), Some(&Value::from(1)));
        assert_eq!(
            yaml.get("partitioner"),
            Some(&Value::from("org.apache.cassandra.dht.RandomPartitioner"))
        );
        let data_dir = node.path().join("data").to_string_lossy().into_owned();
        assert_eq!(
            yaml.get("data_file_directories"),
            Some(&Value::Sequence(vec![Value::String(data_dir)]))
        );

        let seeds = yaml["seed_provider"][0]["parameters"][0]["seeds"].as_str().unwrap();
        assert_eq!(seeds, "127.0.0.1,127.0.0.2");
    }

    #[test]
    fn test_vnodes_drop_initial_token() {
        let install = tempdir().unwrap();
        fake_install(install.path());
        let cluster = tempdir().unwrap();
        let mut ctx = context(install.path());
        ctx.use_vnodes = true;

        let vnode_spec = spec("node1", 1).with_initial_token(None);
        let node = Node::create(cluster.path(), vnode_spec, &ctx).unwrap();
        let yaml = rendered_yaml(&node);
        assert_eq!(yaml.get("num_tokens"), Some(&Value::from(256)));
        assert!(yaml.get("initial_token").is_none());
    }

    #[test]
    fn test_overlays_win_over_generated_settings() {
        let install = tempdir().unwrap();
        fake_install(install.path());
        let cluster = tempdir().unwrap();
        let mut ctx = context(install.path());
        ctx.config_options.set("hinted_handoff_enabled", Some(Value::Bool(false))).unwrap();
        ctx.config_options.set("concurrent_reads", Some(Value::from(16))).unwrap();

        let mut node = Node::create(cluster.path(), spec("node1", 1), &ctx).unwrap();
        node.set_configuration_options(
            vec![
                ("concurrent_reads".to_string(), Some(Value::from(4))),
                ("endpoint_snitch".to_string(), None),
            ],
            &ctx,
        )
        .unwrap();

        let yaml = rendered_yaml(&node);
        assert_eq!(yaml.get("hinted_handoff_enabled"), Some(&Value::Bool(false)));
        assert_eq!(yaml.get("concurrent_reads"), Some(&Value::from(4)));
        assert!(yaml.get("endpoint_snitch").is_none());

        let reloaded = Node::load(cluster.path(), "node1").unwrap();
        assert_eq!(reloaded.config_options().len(), 2);
    }

    #[test]
    fn test_missing_seed_provider_is_created() {
        let mut doc: Mapping = serde_yaml::from_str("cluster_name: x\n").unwrap();
        set_seeds(&mut doc, "10.0.0.1".into());
        assert_eq!(
            doc["seed_provider"][0]["class_name"].as_str(),
            Some(SIMPLE_SEED_PROVIDER)
        );
        assert_eq!(doc["seed_provider"][0]["parameters"][0]["seeds"].as_str(), Some("10.0.0.1"));
    }

    #[test]
    fn test_log4j_and_level() {
        let install = tempdir().unwrap();
        fake_install(install.path());
        let cluster = tempdir().unwrap();

        let ctx = context(install.path());
        let mut node = Node::create(cluster.path(), spec("node1", 1), &ctx).unwrap();
        node.set_log_level(LogLevel::Debug).unwrap();

        let log4j = std::fs::read_to_string(node.conf_dir().join(LOG4J_CONF)).unwrap();
        assert!(log4j.contains("log4j.rootLogger=DEBUG,stdout,R\n"));
        assert!(log4j.contains(&format!("log4j.appender.R.File={}", node.log_file().display())));
    }

    #[test]
    fn test_log_config_is_installed_verbatim() {
        let install = tempdir().unwrap();
        fake_install(install.path());
        let cluster = tempdir().unwrap();
        let ctx = context(install.path());
        let node = Node::create(cluster.path(), spec("node1", 1), &ctx).unwrap();

        let custom = "log4j.rootLogger=ERROR,stdout\nlog4j.appender.R.File=/tmp/elsewhere.log\n";
        let source = cluster.path().join("custom.properties");
        std::fs::write(&source, custom).unwrap();
        node.update_log4j(&source).unwrap();
        assert_eq!(std::fs::read_to_string(node.conf_dir().join(LOG4J_CONF)).unwrap(), custom);

        let logback = "<configuration><root level=\"ERROR\"></root></configuration>";
        std::fs::write(&source, logback).unwrap();
        node.update_logback(&source).unwrap();
        assert_eq!(std::fs::read_to_string(node.conf_dir().join(LOGBACK_CONF)).unwrap(), logback);

        let err = node.update_log4j(&cluster.path().join("missing.properties")).unwrap_err();
        assert_eq!(err.node_name(), Some("node1"));
    }

    #[test]
    fn test_logback_is_rewritten() {
        let install = tempdir().unwrap();
        fake_install(install.path());
        std::fs::write(
            install.path().join("conf").join(LOGBACK_CONF),
            "<configuration>\n  <appender>\n    <file>/var/log/cassandra/system.log</file>\n  \
             </appender>\n  <root level=\"INFO\">\n  </root>\n</configuration>\n",
        )
        .unwrap();
        let cluster = tempdir().unwrap();
        let mut ctx = context(install.path());
        ctx.log_level = LogLevel::Warn;

        let node = Node::create(cluster.path(), spec("node1", 1), &ctx).unwrap();
        let logback = std::fs::read_to_string(node.conf_dir().join(LOGBACK_CONF)).unwrap();
        assert!(logback.contains(&format!("    <file>{}</file>\n", node.log_file().display())));
        assert!(logback.contains("  <root level=\"WARN\">\n"));
    }

    #[test]
    fn test_envfile_ports() {
        let install = tempdir().unwrap();
        fake_install(install.path());
        let cluster = tempdir().unwrap();

        let node = Node::create(
            cluster.path(),
            spec("node1", 1).with_remote_debug_port(2100),
            &context(install.path()),
        )
        .unwrap();
        let env = std::fs::read_to_string(node.conf_dir().join(ENV_FILE)).unwrap();
        assert!(env.contains("JMX_PORT=\"7100\"\n"));
        assert!(env.contains("-Xrunjdwp:transport=dt_socket,server=y,suspend=n,address=2100\""));
        assert!(env.starts_with("JMX_PORT"));
    }

    #[test]
    fn test_launch_env_rewrites_include() {
        let install = tempdir().unwrap();
        fake_install(install.path());
        let cluster = tempdir().unwrap();
        let ctx = context(install.path());

        let node = Node::create(cluster.path(), spec("node1", 1), &ctx).unwrap();
        let env = node.launch_env(&ctx).unwrap();

        let include = node.bin_dir().join(INCLUDE_FILE);
        assert_eq!(
            env[0],
            ("CASSANDRA_INCLUDE".to_string(), include.to_string_lossy().into_owned())
        );
        assert!(env.iter().any(|(k, _)| k == "MAX_HEAP_SIZE"));

        let content = std::fs::read_to_string(include).unwrap();
        assert!(content.contains(&format!("CASSANDRA_HOME={}\n", install.path().display())));
        assert!(content.contains(&format!("CASSANDRA_CONF={}\n", node.conf_dir().display())));
        assert!(content.contains("CLASSPATH=$CASSANDRA_CONF\n"));
    }

    #[test]
    fn test_replace_lines_keeps_indent_and_dollar_signs() {
        let rules = vec![(Regex::new(r"^\s*FOO=").unwrap(), "FOO=\"$BAR\"".to_string())];
        let (out, counts) = replace_lines("a\n    FOO=1\nb", &rules);
        assert_eq!(out, "a\n    FOO=\"$BAR\"\nb\n");
        assert_eq!(counts, vec![1]);
    }
}
