//! The engine handle tying a backend to the watch dispatcher.

use crate::backend::{Backend, BackendRegistry};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::types::{
    CasResponse, DeleteResponse, KeyRange, KeyValue, PutRequest, PutResponse, RangeEnd,
    RangeOptions, RangeResponse, Revision,
};
use crate::watch::{WatchConfig, WatchDispatcher, WatchHandle, WatchRequest};
use std::sync::Arc;
use tracing::{debug, info};

/// Point-in-time engine statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineStatus {
    /// Registry name of the active backend.
    pub backend: String,
    pub revision: Revision,
    pub compacted_revision: Revision,
    /// Live (non-deleted) keys.
    pub key_count: usize,
    /// Journal bytes for persistent backends, approximate data size otherwise.
    pub db_size: u64,
    /// Registered watch subscriptions.
    pub watchers: usize,
}

/// Revisioned key-value engine.
///
/// Construct once at startup and share by reference; every operation is
/// safe to call from many threads at once.
pub struct KvEngine {
    backend: Arc<dyn Backend>,
    dispatcher: WatchDispatcher,
}

impl KvEngine {
    /// Resolve the configured backend from `registry` and start the engine.
    pub fn open(config: &EngineConfig, registry: &BackendRegistry) -> Result<Self> {
        let config = config.clone().validate()?;
        let backend = registry.open(&config.backend, &config)?;
        info!(
            backend = backend.name(),
            revision = backend.current_revision(),
            "engine opened"
        );
        Ok(Self::with_backend(backend, config.watch))
    }

    /// Engine over an already constructed backend.
    pub fn with_backend(backend: Arc<dyn Backend>, watch: WatchConfig) -> Self {
        Self {
            backend,
            dispatcher: WatchDispatcher::new(watch),
        }
    }

    /// Volatile engine with default watch settings.
    pub fn in_memory() -> Self {
        Self::with_backend(
            Arc::new(crate::backend::MemoryBackend::new()),
            WatchConfig::default(),
        )
    }

    // --- Writes ---

    pub fn put(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<PutResponse> {
        self.put_with(PutRequest::new(key, value))
    }

    /// Put with lease and previous-value options.
    pub fn put_with(&self, request: PutRequest) -> Result<PutResponse> {
        validate_key(&request.key)?;
        let mut response = self.backend.put(&request, &self.dispatcher)?;
        if !request.prev_kv {
            response.prev_kv = None;
        }
        Ok(response)
    }

    /// Delete every key in `range` at one revision.
    pub fn delete_range(&self, range: &KeyRange) -> Result<DeleteResponse> {
        validate_range(range)?;
        let response = self.backend.delete_range(range, &self.dispatcher)?;
        debug!(range = ?range, deleted = response.deleted, revision = response.revision, "delete range");
        Ok(response)
    }

    /// Put `value` if the key's mod revision is still `expected`
    /// (0 = create only if absent). A mismatch is reported in the response,
    /// not as an error.
    pub fn compare_and_swap(
        &self,
        key: impl AsRef<[u8]>,
        expected: Revision,
        value: impl AsRef<[u8]>,
    ) -> Result<CasResponse> {
        let key = key.as_ref();
        validate_key(key)?;
        if expected < 0 {
            return Err(EngineError::InvalidArgument(format!(
                "negative expected revision {}",
                expected
            )));
        }
        self.backend
            .compare_and_swap(key, expected, value.as_ref(), &self.dispatcher)
    }

    /// Discard history older than `revision`.
    pub fn compact(&self, revision: Revision) -> Result<()> {
        self.backend.compact(revision)?;
        info!(revision, "compacted");
        Ok(())
    }

    // --- Reads ---

    pub fn range(&self, range: &KeyRange, options: RangeOptions) -> Result<RangeResponse> {
        validate_range(range)?;
        self.backend.range(range, &options)
    }

    /// Latest value of a single key.
    pub fn get(&self, key: impl Into<Vec<u8>>) -> Result<Option<KeyValue>> {
        let response = self.range(&KeyRange::single(key), RangeOptions::default())?;
        Ok(response.kvs.into_iter().next())
    }

    pub fn current_revision(&self) -> Revision {
        self.backend.current_revision()
    }

    pub fn compacted_revision(&self) -> Revision {
        self.backend.compacted_revision()
    }

    // --- Watches ---

    /// Open a subscription.
    pub fn watch(&self, request: WatchRequest) -> Result<WatchHandle> {
        validate_range(&request.range)?;
        self.dispatcher.open(Arc::clone(&self.backend), request)
    }

    pub fn watcher_count(&self) -> usize {
        self.dispatcher.watcher_count()
    }

    // --- Introspection ---

    pub fn status(&self) -> EngineStatus {
        let backend = self.backend.status();
        EngineStatus {
            backend: backend.name,
            revision: backend.revision,
            compacted_revision: backend.compacted_revision,
            key_count: backend.key_count,
            db_size: backend.db_size,
            watchers: self.dispatcher.watcher_count(),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }
}

impl std::fmt::Debug for KvEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvEngine")
            .field("backend", &self.backend.name())
            .field("revision", &self.backend.current_revision())
            .finish()
    }
}

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(EngineError::InvalidArgument("key is empty".into()));
    }
    Ok(())
}

fn validate_range(range: &KeyRange) -> Result<()> {
    if range.end == RangeEnd::Single {
        validate_key(&range.start)?;
    }
    Ok(())
}
