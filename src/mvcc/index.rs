//! In-memory multi-version key index.

use super::Mutation;
use crate::error::{EngineError, Result};
use crate::types::{
    ChangeSet, EventKind, KeyRange, KeyValue, RangeEnd, RangeOptions, RangeResponse, Revision,
    WatchEvent,
};
use std::collections::BTreeMap;
use std::ops::Bound;

/// All retained versions of one key, oldest first.
///
/// Deletes are kept as tombstones so watchers can replay them.
#[derive(Debug, Default)]
struct KeyHistory {
    versions: Vec<KeyValue>,
}

impl KeyHistory {
    /// Latest live version, if the key currently exists.
    fn live(&self) -> Option<&KeyValue> {
        self.versions.last().filter(|kv| !kv.is_tombstone())
    }

    /// Version visible at `revision`, if the key existed then.
    fn at(&self, revision: Revision) -> Option<&KeyValue> {
        self.versions
            .iter()
            .rev()
            .find(|kv| kv.mod_revision <= revision)
            .filter(|kv| !kv.is_tombstone())
    }
}

/// Multi-version index over the whole keyspace.
///
/// Per-key metadata is derived in [`KeyIndex::apply`] from the previous
/// version only, so replaying the same mutations always yields the same
/// state.
#[derive(Debug, Default)]
pub struct KeyIndex {
    keys: BTreeMap<Vec<u8>, KeyHistory>,
    /// Revision of the last applied mutation.
    current: Revision,
    /// History strictly below this revision has been discarded.
    compacted: Revision,
    /// Approximate bytes held by retained versions.
    bytes: u64,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_revision(&self) -> Revision {
        self.current
    }

    pub fn compacted_revision(&self) -> Revision {
        self.compacted
    }

    /// Approximate size of retained data.
    pub fn size_bytes(&self) -> u64 {
        self.bytes
    }

    /// Number of keys that currently exist.
    pub fn live_key_count(&self) -> usize {
        self.keys.values().filter(|h| h.live().is_some()).count()
    }

    /// Latest live version of `key`.
    pub fn get(&self, key: &[u8]) -> Option<&KeyValue> {
        self.keys.get(key).and_then(KeyHistory::live)
    }

    /// Keys in `range` that currently exist, in key order.
    pub fn live_keys(&self, range: &KeyRange) -> Vec<Vec<u8>> {
        self.scan(range)
            .filter(|(_, history)| history.live().is_some())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Apply all mutations committed at `revision` and return their events.
    ///
    /// Deletes of keys that do not exist produce no event.
    pub fn apply(&mut self, revision: Revision, mutations: &[Mutation]) -> ChangeSet {
        let mut events = Vec::with_capacity(mutations.len());

        for mutation in mutations {
            match mutation {
                Mutation::Put { key, value, lease } => {
                    let history = self.keys.entry(key.clone()).or_default();
                    let prev = history.live().cloned();
                    let kv = KeyValue {
                        key: key.clone(),
                        create_revision: prev
                            .as_ref()
                            .map(|p| p.create_revision)
                            .unwrap_or(revision),
                        mod_revision: revision,
                        version: prev.as_ref().map(|p| p.version + 1).unwrap_or(1),
                        value: value.clone(),
                        lease: *lease,
                    };
                    self.bytes += (kv.key.len() + kv.value.len()) as u64;
                    history.versions.push(kv.clone());
                    events.push(WatchEvent {
                        kind: EventKind::Put,
                        kv,
                        prev_kv: prev,
                    });
                }
                Mutation::Delete { key } => {
                    let Some(history) = self.keys.get_mut(key) else {
                        continue;
                    };
                    let Some(prev) = history.live().cloned() else {
                        continue;
                    };
                    let tombstone = KeyValue::tombstone(key.clone(), revision);
                    self.bytes += tombstone.key.len() as u64;
                    history.versions.push(tombstone.clone());
                    events.push(WatchEvent {
                        kind: EventKind::Delete,
                        kv: tombstone,
                        prev_kv: Some(prev),
                    });
                }
            }
        }

        if revision > self.current {
            self.current = revision;
        }

        ChangeSet { revision, events }
    }

    /// Point-in-time range read.
    pub fn range(&self, range: &KeyRange, options: &RangeOptions) -> Result<RangeResponse> {
        let at = self.resolve_read_revision(options.revision)?;

        let mut kvs = Vec::new();
        let mut count = 0;
        for (_, history) in self.scan(range) {
            let Some(kv) = history.at(at) else {
                continue;
            };
            count += 1;
            if options.count_only || (options.limit > 0 && kvs.len() >= options.limit) {
                continue;
            }
            let mut kv = kv.clone();
            if options.keys_only {
                kv.value.clear();
            }
            kvs.push(kv);
        }

        let more = !options.count_only && options.limit > 0 && count > options.limit;
        Ok(RangeResponse {
            kvs,
            count,
            more,
            header_revision: self.current,
        })
    }

    /// Every change in `range` at or after `from`, grouped per revision in
    /// ascending order.
    pub fn changes_since(&self, range: &KeyRange, from: Revision) -> Result<Vec<ChangeSet>> {
        if from <= self.compacted {
            return Err(EngineError::Compacted {
                requested: from,
                compacted: self.compacted,
            });
        }

        let mut by_revision: BTreeMap<Revision, Vec<WatchEvent>> = BTreeMap::new();
        for (_, history) in self.scan(range) {
            for (i, kv) in history.versions.iter().enumerate() {
                if kv.mod_revision < from {
                    continue;
                }
                let prev_kv = i
                    .checked_sub(1)
                    .map(|p| &history.versions[p])
                    .filter(|p| !p.is_tombstone())
                    .cloned();
                let kind = if kv.is_tombstone() {
                    EventKind::Delete
                } else {
                    EventKind::Put
                };
                by_revision.entry(kv.mod_revision).or_default().push(WatchEvent {
                    kind,
                    kv: kv.clone(),
                    prev_kv,
                });
            }
        }

        Ok(by_revision
            .into_iter()
            .map(|(revision, events)| ChangeSet { revision, events })
            .collect())
    }

    /// Discard history older than `revision`, keeping the state visible at
    /// `revision` itself.
    pub fn compact(&mut self, revision: Revision) -> Result<()> {
        if revision > self.current {
            return Err(EngineError::FutureRevision {
                requested: revision,
                current: self.current,
            });
        }
        if revision <= self.compacted {
            return Err(EngineError::Compacted {
                requested: revision,
                compacted: self.compacted,
            });
        }

        let mut freed = 0u64;
        self.keys.retain(|_, history| {
            // Index of the version visible at `revision`
            let visible = history
                .versions
                .iter()
                .rposition(|kv| kv.mod_revision <= revision);
            if let Some(idx) = visible {
                let keep_from = if history.versions[idx].is_tombstone() {
                    idx + 1
                } else {
                    idx
                };
                for kv in history.versions.drain(..keep_from) {
                    freed += (kv.key.len() + kv.value.len()) as u64;
                }
            }
            !history.versions.is_empty()
        });

        self.bytes = self.bytes.saturating_sub(freed);
        self.compacted = revision;
        Ok(())
    }

    fn resolve_read_revision(&self, requested: Revision) -> Result<Revision> {
        if requested < 0 {
            return Err(EngineError::InvalidArgument(format!(
                "negative read revision {}",
                requested
            )));
        }
        if requested == 0 {
            return Ok(self.current);
        }
        if requested > self.current {
            return Err(EngineError::FutureRevision {
                requested,
                current: self.current,
            });
        }
        if requested < self.compacted {
            return Err(EngineError::Compacted {
                requested,
                compacted: self.compacted,
            });
        }
        Ok(requested)
    }

    fn scan<'a>(
        &'a self,
        range: &KeyRange,
    ) -> Box<dyn Iterator<Item = (&'a Vec<u8>, &'a KeyHistory)> + 'a> {
        match &range.end {
            RangeEnd::Single => Box::new(self.keys.get_key_value(range.start.as_slice()).into_iter()),
            _ if range.is_empty() => Box::new(std::iter::empty()),
            RangeEnd::Before(end) => Box::new(self.keys.range::<[u8], _>((
                Bound::Included(range.start.as_slice()),
                Bound::Excluded(end.as_slice()),
            ))),
            RangeEnd::Unbounded => Box::new(
                self.keys
                    .range::<[u8], _>((Bound::Included(range.start.as_slice()), Bound::Unbounded)),
            ),
        }
    }
}
