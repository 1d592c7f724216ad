//! Name-to-constructor table used to pick the backend at startup.

use super::{Backend, FileBackend, MemoryBackend};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Builds a backend from the engine configuration.
pub type BackendFactory = Box<dyn Fn(&EngineConfig) -> Result<Arc<dyn Backend>> + Send + Sync>;

/// Explicitly populated set of available backends.
#[derive(Default)]
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
}

impl BackendRegistry {
    /// Registry with nothing registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the backends shipped with this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("memory", |_| {
            let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
            Ok(backend)
        });
        registry.register("file", |config| {
            let backend: Arc<dyn Backend> =
                Arc::new(FileBackend::open(&config.data_dir, config.file_options())?);
            Ok(backend)
        });
        registry
    }

    /// Add or replace the factory for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&EngineConfig) -> Result<Arc<dyn Backend>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Construct the backend registered as `name`.
    pub fn open(&self, name: &str, config: &EngineConfig) -> Result<Arc<dyn Backend>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| EngineError::UnknownBackend(name.to_string()))?;
        let backend = factory(config)?;
        info!(backend = name, "storage backend resolved");
        Ok(backend)
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_names() {
        let registry = BackendRegistry::with_builtin();
        assert_eq!(registry.names(), vec!["file", "memory"]);
        assert!(BackendRegistry::new().names().is_empty());
    }

    #[test]
    fn test_unknown_backend_fails_fast() {
        let registry = BackendRegistry::with_builtin();
        let result = registry.open("rocksdb", &EngineConfig::default());
        assert!(matches!(result, Err(EngineError::UnknownBackend(name)) if name == "rocksdb"));
    }

    #[test]
    fn test_file_backend_uses_data_dir() {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig {
            data_dir: dir.path().join("data"),
            sync_writes: false,
            ..EngineConfig::default()
        };

        let backend = BackendRegistry::with_builtin().open("file", &config).unwrap();
        assert_eq!(backend.name(), "file");
        assert!(dir.path().join("data").join("MANIFEST").exists());
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = BackendRegistry::new();
        registry.register("scratch", |_| {
            let backend: Arc<dyn Backend> = Arc::new(MemoryBackend::new());
            Ok(backend)
        });

        let backend = registry.open("scratch", &EngineConfig::default()).unwrap();
        assert_eq!(backend.name(), "memory");
    }
}
