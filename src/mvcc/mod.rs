//! Multi-version state shared by the storage backends.
//!
//! Backends persist [`JournalEntry`] values in whatever way they like and feed
//! them through a [`KeyIndex`], which owns all per-key metadata rules
//! (create revision, mod revision, version, tombstones).

mod index;

pub use index::KeyIndex;

use crate::types::{LeaseId, Revision};
use serde::{Deserialize, Serialize};

/// One key-level change inside a commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    Put {
        key: Vec<u8>,
        value: Vec<u8>,
        lease: LeaseId,
    },
    Delete {
        key: Vec<u8>,
    },
}

/// A durable unit of change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalEntry {
    /// Mutations committed atomically at one revision.
    Commit {
        revision: Revision,
        mutations: Vec<Mutation>,
    },
    /// History below `revision` was discarded.
    Compact { revision: Revision },
}

impl JournalEntry {
    /// Highest revision referenced by this entry.
    pub fn revision(&self) -> Revision {
        match self {
            JournalEntry::Commit { revision, .. } | JournalEntry::Compact { revision } => {
                *revision
            }
        }
    }

    /// Mutations carried by a commit; empty for compactions.
    pub fn mutations(&self) -> &[Mutation] {
        match self {
            JournalEntry::Commit { mutations, .. } => mutations,
            JournalEntry::Compact { .. } => &[],
        }
    }

    /// Replay this entry into `index`.
    pub fn replay(&self, index: &mut KeyIndex) -> crate::error::Result<()> {
        match self {
            JournalEntry::Commit {
                revision,
                mutations,
            } => {
                index.apply(*revision, mutations);
                Ok(())
            }
            JournalEntry::Compact { revision } => index.compact(*revision),
        }
    }
}
