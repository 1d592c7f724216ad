//! Engine configuration.
//!
//! Sources are merged in order, later ones winning:
//! 1. [`EngineConfig::default`]
//! 2. an optional TOML file
//! 3. environment variables prefixed `ETCD_SHIM`, nested with `__`
//!    (e.g. `ETCD_SHIM__WATCH__QUEUE_SIZE=1024`)

use crate::backend::FileOptions;
use crate::error::{EngineError, Result};
use crate::watch::WatchConfig;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level engine configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Registry name of the storage backend.
    pub backend: String,

    /// Data directory for persistent backends.
    pub data_dir: PathBuf,

    /// Revisions reserved per allocator ceiling write.
    pub revision_batch: u64,

    /// fsync the journal after every commit.
    pub sync_writes: bool,

    pub watch: WatchConfig,

    pub server: ServerInfo,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: "file".to_string(),
            data_dir: PathBuf::from("./data"),
            revision_batch: 1000,
            sync_writes: true,
            watch: WatchConfig::default(),
            server: ServerInfo::default(),
        }
    }
}

/// Identity reported by the status and member-list operations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    pub listen: String,
    pub port: String,
    pub etcd_version: String,
    pub cluster_version: String,
    pub member_name: String,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1".to_string(),
            port: "2379".to_string(),
            etcd_version: "3.5.0".to_string(),
            cluster_version: "3.5.0".to_string(),
            member_name: "etcd-shim".to_string(),
        }
    }
}

impl ServerInfo {
    /// Client URL advertised for the single member.
    pub fn client_url(&self) -> String {
        format!("http://{}:{}", self.listen, self.port)
    }
}

impl EngineConfig {
    /// Load and validate configuration from defaults, `path` and the
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("ETCD_SHIM")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()
    }

    /// Reject values the engine cannot run with.
    pub fn validate(self) -> Result<Self> {
        if self.backend.is_empty() {
            return Err(EngineError::Config("backend name must not be empty".into()));
        }
        if self.revision_batch == 0 {
            return Err(EngineError::Config(
                "revision_batch must be greater than zero".into(),
            ));
        }
        self.watch.validate()?;
        Ok(self)
    }

    /// Options for the file backend.
    pub fn file_options(&self) -> FileOptions {
        FileOptions {
            sync_writes: self.sync_writes,
            revision_batch: self.revision_batch,
        }
    }
}
