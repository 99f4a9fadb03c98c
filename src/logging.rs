//! Logging setup
//!
//! Installs the global `tracing` subscriber for programs embedding the
//! cluster manager. `RUST_LOG` takes precedence over the configured level.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize logging from the given configuration
pub fn init(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match (&config.file, config.format.as_str()) {
        (Some(path), format) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let layer = fmt::layer().with_ansi(false).with_writer(Mutex::new(file));
            if format == "compact" {
                registry.with(layer.compact()).try_init()
            } else {
                registry.with(layer).try_init()
            }
        }
        (None, "compact") => registry.with(fmt::layer().compact()).try_init(),
        (None, _) => registry.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Config(format!("could not install log subscriber: {}", e)))
}
