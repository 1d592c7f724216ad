//! # etcd-shim
//!
//! A single-node, revisioned key-value engine that speaks the etcd data
//! model: every mutation gets a global revision, reads are point-in-time,
//! and watches stream revision-ordered changes without gaps or duplicates.
//!
//! ## Core Concepts
//!
//! - **Revisions**: strictly increasing, never reused, even across restarts
//! - **Backends**: pluggable storage selected by name from a [`BackendRegistry`]
//! - **Watches**: replay history then tail live changes, with bounded queues
//!   and eviction of lagging consumers
//! - **Service**: capability dispatch for the wire API; unbacked RPCs return
//!   [`EngineError::Unsupported`]
//!
//! ## Example
//!
//! ```ignore
//! use etcd_shim::{BackendRegistry, EngineConfig, KeyRange, KvEngine, WatchRequest};
//!
//! let config = EngineConfig::load(None)?;
//! let engine = KvEngine::open(&config, &BackendRegistry::with_builtin())?;
//!
//! let watch = engine.watch(WatchRequest::new(KeyRange::prefix("jobs/")))?;
//! let put = engine.put("jobs/1", "queued")?;
//!
//! let batch = watch.recv()?;
//! assert_eq!(batch.revision, put.revision);
//! ```

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod mvcc;
pub mod revision;
pub mod service;
pub mod types;
pub mod watch;

// Re-exports
pub use backend::{
    Backend, BackendFactory, BackendRegistry, BackendStatus, EventSink, FileBackend, FileOptions,
    MemoryBackend,
};
pub use config::{EngineConfig, ServerInfo};
pub use engine::{EngineStatus, KvEngine};
pub use error::{EngineError, Result};
pub use revision::{FileAllocator, MemoryAllocator, RevisionAllocator};
pub use service::{Member, Operation, Reply, Service, StatusReply};
pub use types::*;
pub use watch::{
    CancelToken, CloseReason, WatchBatch, WatchConfig, WatchDispatcher, WatchHandle,
    WatchRequest, WatchState,
};
