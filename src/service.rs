//! Capability dispatch for the wire API.
//!
//! Every RPC of the KV, Lease, Cluster and Maintenance services is one
//! [`Operation`] variant. Operations the engine backs produce a [`Reply`];
//! all others fail with [`EngineError::Unsupported`] so callers can tell
//! "not implemented" apart from an empty result.

use crate::config::ServerInfo;
use crate::engine::KvEngine;
use crate::error::{EngineError, Result};
use crate::types::{
    CasResponse, DeleteResponse, KeyRange, LeaseId, PutRequest, PutResponse, RangeOptions,
    RangeResponse, Revision,
};
use crate::watch::{WatchHandle, WatchRequest};
use std::sync::Arc;
use tracing::{debug, warn};

/// One wire request.
#[derive(Clone, Debug)]
pub enum Operation {
    // --- KV ---
    Range {
        range: KeyRange,
        options: RangeOptions,
    },
    Put(PutRequest),
    DeleteRange {
        range: KeyRange,
        prev_kv: bool,
    },
    /// Multi-operation transactions.
    Txn,
    Compact {
        revision: Revision,
    },
    /// The single-key transaction the engine does support.
    CompareAndSwap {
        key: Vec<u8>,
        expected: Revision,
        value: Vec<u8>,
    },

    // --- Lease ---
    LeaseGrant {
        id: LeaseId,
        ttl: i64,
    },
    LeaseRevoke {
        id: LeaseId,
    },
    LeaseKeepAlive {
        id: LeaseId,
    },
    LeaseTimeToLive {
        id: LeaseId,
    },
    LeaseLeases,

    // --- Cluster ---
    MemberAdd,
    MemberRemove,
    MemberUpdate,
    MemberList,
    MemberPromote,

    // --- Maintenance ---
    Alarm,
    Status,
    Defragment,
    Hash,
    HashKv {
        revision: Revision,
    },
    Snapshot,
    MoveLeader,
    Downgrade,
}

impl Operation {
    /// RPC name.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Range { .. } => "Range",
            Operation::Put(_) => "Put",
            Operation::DeleteRange { .. } => "DeleteRange",
            Operation::Txn => "Txn",
            Operation::Compact { .. } => "Compact",
            Operation::CompareAndSwap { .. } => "CompareAndSwap",
            Operation::LeaseGrant { .. } => "LeaseGrant",
            Operation::LeaseRevoke { .. } => "LeaseRevoke",
            Operation::LeaseKeepAlive { .. } => "LeaseKeepAlive",
            Operation::LeaseTimeToLive { .. } => "LeaseTimeToLive",
            Operation::LeaseLeases => "LeaseLeases",
            Operation::MemberAdd => "MemberAdd",
            Operation::MemberRemove => "MemberRemove",
            Operation::MemberUpdate => "MemberUpdate",
            Operation::MemberList => "MemberList",
            Operation::MemberPromote => "MemberPromote",
            Operation::Alarm => "Alarm",
            Operation::Status => "Status",
            Operation::Defragment => "Defragment",
            Operation::Hash => "Hash",
            Operation::HashKv { .. } => "HashKV",
            Operation::Snapshot => "Snapshot",
            Operation::MoveLeader => "MoveLeader",
            Operation::Downgrade => "Downgrade",
        }
    }

    /// Whether the engine backs this operation.
    pub fn is_supported(&self) -> bool {
        matches!(
            self,
            Operation::Range { .. }
                | Operation::Put(_)
                | Operation::DeleteRange { .. }
                | Operation::Compact { .. }
                | Operation::CompareAndSwap { .. }
                | Operation::LeaseGrant { .. }
                | Operation::MemberList
                | Operation::Status
                | Operation::HashKv { .. }
        )
    }
}

/// A cluster member as reported by `MemberList`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub id: u64,
    pub name: String,
    pub client_urls: Vec<String>,
    pub is_learner: bool,
}

/// Maintenance status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusReply {
    pub version: String,
    pub cluster_version: String,
    pub backend: String,
    pub db_size: u64,
    pub revision: Revision,
    pub compacted_revision: Revision,
}

/// Result of a backed operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Range(RangeResponse),
    Put(PutResponse),
    DeleteRange(DeleteResponse),
    Compact {
        revision: Revision,
    },
    CompareAndSwap(CasResponse),
    LeaseGrant {
        id: LeaseId,
        ttl: i64,
    },
    MemberList(Vec<Member>),
    Status(StatusReply),
    HashKv {
        hash: u32,
        compact_revision: Revision,
        header_revision: Revision,
    },
}

/// Routes operations to the engine.
pub struct Service {
    engine: Arc<KvEngine>,
    server: ServerInfo,
}

impl Service {
    pub fn new(engine: Arc<KvEngine>, server: ServerInfo) -> Self {
        Self { engine, server }
    }

    pub fn engine(&self) -> &Arc<KvEngine> {
        &self.engine
    }

    /// Execute one operation.
    pub fn handle(&self, op: Operation) -> Result<Reply> {
        debug!(op = op.name(), "handling request");

        match op {
            Operation::Range { range, options } => {
                Ok(Reply::Range(self.engine.range(&range, options)?))
            }
            Operation::Put(request) => Ok(Reply::Put(self.engine.put_with(request)?)),
            Operation::DeleteRange { range, prev_kv } => {
                let mut response = self.engine.delete_range(&range)?;
                if !prev_kv {
                    response.prev_kvs.clear();
                }
                Ok(Reply::DeleteRange(response))
            }
            Operation::Compact { revision } => {
                self.engine.compact(revision)?;
                Ok(Reply::Compact {
                    revision: self.engine.current_revision(),
                })
            }
            Operation::CompareAndSwap {
                key,
                expected,
                value,
            } => Ok(Reply::CompareAndSwap(
                self.engine.compare_and_swap(key, expected, value)?,
            )),
            // Leases are not tracked; the grant is acknowledged as requested
            Operation::LeaseGrant { id, ttl } => Ok(Reply::LeaseGrant { id, ttl }),
            Operation::MemberList => Ok(Reply::MemberList(vec![Member {
                id: 0,
                name: self.server.member_name.clone(),
                client_urls: vec![self.server.client_url()],
                is_learner: false,
            }])),
            Operation::Status => {
                let status = self.engine.status();
                Ok(Reply::Status(StatusReply {
                    version: self.server.etcd_version.clone(),
                    cluster_version: self.server.cluster_version.clone(),
                    backend: status.backend,
                    db_size: status.db_size,
                    revision: status.revision,
                    compacted_revision: status.compacted_revision,
                }))
            }
            Operation::HashKv { revision } => self.hash_kv(revision),
            unsupported => {
                warn!(op = unsupported.name(), "unsupported operation");
                Err(EngineError::Unsupported(unsupported.name()))
            }
        }
    }

    /// Open a watch stream.
    pub fn watch(&self, request: WatchRequest) -> Result<WatchHandle> {
        debug!(range = ?request.range, start = request.start_revision, "handling watch");
        self.engine.watch(request)
    }

    /// CRC32 over every key and value visible at `revision` (0 = latest).
    fn hash_kv(&self, revision: Revision) -> Result<Reply> {
        let response = self
            .engine
            .range(&KeyRange::all(), RangeOptions::at(revision))?;

        let mut hasher = crc32fast::Hasher::new();
        for kv in &response.kvs {
            hasher.update(&kv.key);
            hasher.update(&kv.value);
        }

        Ok(Reply::HashKv {
            hash: hasher.finalize(),
            compact_revision: self.engine.compacted_revision(),
            header_revision: response.header_revision,
        })
    }
}
