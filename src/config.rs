//! Configuration management for the qstreams daemon.
//!
//! Settings are layered, later sources overriding earlier ones:
//! 1. Defaults embedded in the binary (`config/default.toml`)
//! 2. System-wide file (`/etc/qstreams/config.toml`), if present
//! 3. A file given with `--config`
//! 4. Environment variables prefixed with `QSTREAMS_`, nested keys separated
//!    by `__` (e.g. `QSTREAMS_ENGINE__REQUEST_TIMEOUT_MS=5000`)
//! 5. Command-line arguments

use clap::{Parser, Subcommand};
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");
const DEFAULT_CONFIG_PATH: &str = "/etc/qstreams/config.toml";
const ENV_PREFIX: &str = "QSTREAMS";

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding stream and metrics records
    #[arg(long, env = "QSTREAMS_STORAGE_ROOT", global = true)]
    pub storage_root: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true)]
    pub log_filter: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the stream engine until interrupted
    Run {
        /// Upper bound for each query and delivery, in milliseconds
        #[arg(long)]
        request_timeout_ms: Option<u64>,

        /// Metrics flush interval in seconds
        #[arg(long)]
        metrics_flush_secs: Option<u64>,
    },
    /// Register a stream definition to be started by the next `run`
    Submit {
        /// JSON stream definition
        file: PathBuf,
    },
    /// List stored streams and their last known state
    List,
}

/// Complete daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub storage: StorageSettings,
    pub engine: EngineSettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// Root directory for the file store
    pub root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    /// Timeout applied to every source query and delivery
    pub request_timeout_ms: u64,
    /// Interval between metrics snapshots
    pub metrics_flush_secs: u64,
}

impl EngineSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    pub fn metrics_flush_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_flush_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    pub filter: String,
}

#[cfg(test)]
impl Default for Settings {
    fn default() -> Self {
        Self {
            storage: StorageSettings {
                root: PathBuf::from("./data"),
            },
            engine: EngineSettings {
                request_timeout_ms: 10_000,
                metrics_flush_secs: 30,
            },
            log: LogSettings {
                filter: "info".to_string(),
            },
        }
    }
}

impl Settings {
    /// Loads configuration from every source, applying CLI overrides last.
    pub fn new(cli: &CliArgs) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml));

        if Path::new(DEFAULT_CONFIG_PATH).is_file() {
            builder = builder.add_source(File::from(PathBuf::from(DEFAULT_CONFIG_PATH)));
        }
        if let Some(ref path) = cli.config {
            builder = builder.add_source(File::from(path.clone()));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        );

        if let Some(ref root) = cli.storage_root {
            builder = builder.set_override("storage.root", root.to_string_lossy().as_ref())?;
        }
        if let Some(ref filter) = cli.log_filter {
            builder = builder.set_override("log.filter", filter.as_str())?;
        }
        if let Command::Run {
            request_timeout_ms,
            metrics_flush_secs,
        } = cli.command
        {
            if let Some(timeout) = request_timeout_ms {
                builder = builder.set_override("engine.request_timeout_ms", timeout)?;
            }
            if let Some(secs) = metrics_flush_secs {
                builder = builder.set_override("engine.metrics_flush_secs", secs)?;
            }
        }

        builder.build()?.try_deserialize()
    }
}
