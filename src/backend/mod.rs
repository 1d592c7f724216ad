//! Pluggable storage backends.
//!
//! A [`Backend`] owns the keyspace and makes every mutation, its revision and
//! its watch notification visible as one unit: the commit path holds a single
//! lock while it allocates the revision, persists the change, applies it to
//! the index and hands the resulting [`ChangeSet`] to an [`EventSink`].
//!
//! Two implementations ship with the crate, both built on [`MvccBackend`]:
//! - `memory`: volatile, for tests and ephemeral deployments
//! - `file`: journaled to a data directory

mod file;
mod journal;
mod registry;

pub use file::{FileBackend, FileOptions};
pub use journal::FileJournal;
pub use registry::{BackendFactory, BackendRegistry};

use crate::error::{EngineError, Result};
use crate::mvcc::{JournalEntry, KeyIndex, Mutation};
use crate::revision::{MemoryAllocator, RevisionAllocator};
use crate::types::{
    CasResponse, ChangeSet, DeleteResponse, KeyRange, PutRequest, PutResponse, RangeOptions,
    RangeResponse, Revision,
};
use parking_lot::{Mutex, RwLock};
use tracing::trace;

/// Receiver of committed changes.
///
/// Called while the backend still holds its commit lock, so implementations
/// must never block.
pub trait EventSink: Send + Sync {
    fn publish(&self, changes: &ChangeSet);
}

/// Sink that drops every change.
pub struct NoopSink;

impl EventSink for NoopSink {
    fn publish(&self, _changes: &ChangeSet) {}
}

/// Storage capability consumed by the engine.
///
/// All implementations must provide the same atomicity and ordering: a failed
/// mutation leaves no trace, revisions increase strictly in commit order, and
/// reads never observe a half-applied commit.
pub trait Backend: Send + Sync {
    /// Registry name of this backend.
    fn name(&self) -> &str;

    fn put(&self, request: &PutRequest, sink: &dyn EventSink) -> Result<PutResponse>;

    /// Delete every existing key in `range` at a single revision.
    fn delete_range(&self, range: &KeyRange, sink: &dyn EventSink) -> Result<DeleteResponse>;

    /// Put `value` only if the key's mod revision equals `expected`
    /// (0 = key must not exist).
    fn compare_and_swap(
        &self,
        key: &[u8],
        expected: Revision,
        value: &[u8],
        sink: &dyn EventSink,
    ) -> Result<CasResponse>;

    fn range(&self, range: &KeyRange, options: &RangeOptions) -> Result<RangeResponse>;

    /// Committed changes in `range` at or after `from`, plus the head
    /// revision the snapshot was taken at.
    fn changes_since(&self, range: &KeyRange, from: Revision) -> Result<(Vec<ChangeSet>, Revision)>;

    fn compact(&self, revision: Revision) -> Result<()>;

    fn current_revision(&self) -> Revision;

    fn compacted_revision(&self) -> Revision;

    fn status(&self) -> BackendStatus;
}

/// Point-in-time backend statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackendStatus {
    pub name: String,
    pub revision: Revision,
    pub compacted_revision: Revision,
    pub key_count: usize,
    pub db_size: u64,
}

/// Durability hook for [`MvccBackend`].
pub trait Journal: Send {
    /// Durably record `entry`. On error nothing of the entry may survive.
    fn append(&mut self, entry: &JournalEntry) -> Result<()>;

    /// Bytes on disk, if the journal is persistent.
    fn size(&self) -> Option<u64>;
}

/// Journal that keeps nothing.
#[derive(Debug, Default)]
pub struct Volatile;

impl Journal for Volatile {
    fn append(&mut self, _entry: &JournalEntry) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> Option<u64> {
        None
    }
}

/// Backend built from a [`KeyIndex`], a revision allocator and a journal.
pub struct MvccBackend<J> {
    name: &'static str,
    /// Dropped before the journal so the revision ceiling is released while
    /// the data directory is still locked.
    allocator: Box<dyn RevisionAllocator>,
    /// Commit lock; also guards the journal.
    journal: Mutex<J>,
    index: RwLock<KeyIndex>,
}

/// Volatile backend.
pub type MemoryBackend = MvccBackend<Volatile>;

impl MvccBackend<Volatile> {
    pub fn new() -> Self {
        Self::from_parts(
            "memory",
            Volatile,
            Box::new(MemoryAllocator::new()),
            KeyIndex::new(),
        )
    }
}

impl Default for MvccBackend<Volatile> {
    fn default() -> Self {
        Self::new()
    }
}

impl<J: Journal> MvccBackend<J> {
    /// Assemble a backend from an already-recovered index.
    pub fn from_parts(
        name: &'static str,
        journal: J,
        allocator: Box<dyn RevisionAllocator>,
        index: KeyIndex,
    ) -> Self {
        Self {
            name,
            allocator,
            journal: Mutex::new(journal),
            index: RwLock::new(index),
        }
    }

    /// Allocate, persist, apply and publish one commit. Caller holds the
    /// commit lock through `journal`.
    fn commit(
        &self,
        journal: &mut J,
        mutations: Vec<Mutation>,
        sink: &dyn EventSink,
    ) -> Result<ChangeSet> {
        let revision = self.allocator.next()?;
        let entry = JournalEntry::Commit {
            revision,
            mutations,
        };
        journal.append(&entry)?;

        let changes = self.index.write().apply(revision, entry.mutations());
        trace!(
            backend = self.name,
            revision,
            events = changes.events.len(),
            "committed"
        );
        sink.publish(&changes);
        Ok(changes)
    }
}

impl<J: Journal> Backend for MvccBackend<J> {
    fn name(&self) -> &str {
        self.name
    }

    fn put(&self, request: &PutRequest, sink: &dyn EventSink) -> Result<PutResponse> {
        let mut journal = self.journal.lock();
        let mutation = Mutation::Put {
            key: request.key.clone(),
            value: request.value.clone(),
            lease: request.lease,
        };
        let changes = self.commit(&mut journal, vec![mutation], sink)?;

        let prev_kv = changes.events.into_iter().next().and_then(|e| e.prev_kv);
        Ok(PutResponse {
            revision: changes.revision,
            prev_kv,
        })
    }

    fn delete_range(&self, range: &KeyRange, sink: &dyn EventSink) -> Result<DeleteResponse> {
        let mut journal = self.journal.lock();

        let keys = self.index.read().live_keys(range);
        if keys.is_empty() {
            return Ok(DeleteResponse {
                deleted: 0,
                revision: self.current_revision(),
                prev_kvs: Vec::new(),
            });
        }

        let mutations = keys.into_iter().map(|key| Mutation::Delete { key }).collect();
        let changes = self.commit(&mut journal, mutations, sink)?;

        let prev_kvs: Vec<_> = changes
            .events
            .into_iter()
            .filter_map(|e| e.prev_kv)
            .collect();
        Ok(DeleteResponse {
            deleted: prev_kvs.len(),
            revision: changes.revision,
            prev_kvs,
        })
    }

    fn compare_and_swap(
        &self,
        key: &[u8],
        expected: Revision,
        value: &[u8],
        sink: &dyn EventSink,
    ) -> Result<CasResponse> {
        let mut journal = self.journal.lock();

        let current = self.index.read().get(key).cloned();
        let actual = current.as_ref().map(|kv| kv.mod_revision).unwrap_or(0);
        if actual != expected {
            return Ok(CasResponse {
                succeeded: false,
                revision: actual,
                current,
            });
        }

        // Keep the lease of the version being replaced
        let lease = current.as_ref().map(|kv| kv.lease).unwrap_or(0);
        let mutation = Mutation::Put {
            key: key.to_vec(),
            value: value.to_vec(),
            lease,
        };
        let changes = self.commit(&mut journal, vec![mutation], sink)?;
        Ok(CasResponse {
            succeeded: true,
            revision: changes.revision,
            current: None,
        })
    }

    fn range(&self, range: &KeyRange, options: &RangeOptions) -> Result<RangeResponse> {
        self.index.read().range(range, options)
    }

    fn changes_since(&self, range: &KeyRange, from: Revision) -> Result<(Vec<ChangeSet>, Revision)> {
        let index = self.index.read();
        let changes = index.changes_since(range, from)?;
        Ok((changes, index.current_revision()))
    }

    fn compact(&self, revision: Revision) -> Result<()> {
        let mut journal = self.journal.lock();

        // Validate before journaling so a rejected compaction leaves no entry
        {
            let index = self.index.read();
            if revision > index.current_revision() {
                return Err(EngineError::FutureRevision {
                    requested: revision,
                    current: index.current_revision(),
                });
            }
            if revision <= index.compacted_revision() {
                return Err(EngineError::Compacted {
                    requested: revision,
                    compacted: index.compacted_revision(),
                });
            }
        }

        journal.append(&JournalEntry::Compact { revision })?;
        self.index.write().compact(revision)
    }

    fn current_revision(&self) -> Revision {
        self.index.read().current_revision()
    }

    fn compacted_revision(&self) -> Revision {
        self.index.read().compacted_revision()
    }

    fn status(&self) -> BackendStatus {
        let journal_size = self.journal.lock().size();
        let index = self.index.read();
        BackendStatus {
            name: self.name.to_string(),
            revision: index.current_revision(),
            compacted_revision: index.compacted_revision(),
            key_count: index.live_key_count(),
            db_size: journal_size.unwrap_or_else(|| index.size_bytes()),
        }
    }
}
