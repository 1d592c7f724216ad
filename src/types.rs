//! Core types for the key-value engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Global ordering token assigned to every committed mutation.
///
/// Revision 0 means "unset"; the first mutation is revision 1.
pub type Revision = i64;

/// Identifier of a watch subscription.
pub type WatchId = i64;

/// Identifier of a lease (0 = no lease).
pub type LeaseId = i64;

/// Range-end sentinel selecting every key that starts with the request key.
///
/// When the request key is itself `\0` (or empty) the range covers the whole
/// keyspace, which is how etcd clients encode "all keys".
pub const RANGE_END_SENTINEL: &[u8] = &[0];

/// Request key that, combined with [`RANGE_END_SENTINEL`], selects every key.
pub const ALL_KEYS_SENTINEL: &[u8] = &[0];

/// A single version of a key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    /// Revision at which the key was (re)created.
    pub create_revision: Revision,
    /// Revision of the latest mutation of the key.
    pub mod_revision: Revision,
    /// Number of mutations since creation; 0 for a deleted key.
    pub version: i64,
    pub value: Vec<u8>,
    pub lease: LeaseId,
}

impl KeyValue {
    /// Tombstone for a key deleted at `revision`.
    pub fn tombstone(key: Vec<u8>, revision: Revision) -> Self {
        Self {
            key,
            mod_revision: revision,
            ..Default::default()
        }
    }

    /// True for the marker left behind by a delete.
    pub fn is_tombstone(&self) -> bool {
        self.version == 0
    }
}

/// Kind of mutation carried by a [`WatchEvent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Put,
    Delete,
}

/// A single key mutation as observed by watchers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: EventKind,
    /// State after the mutation; a tombstone for deletes.
    pub kv: KeyValue,
    /// State before the mutation, if the key existed.
    pub prev_kv: Option<KeyValue>,
}

impl WatchEvent {
    pub fn revision(&self) -> Revision {
        self.kv.mod_revision
    }
}

/// All events committed at one revision.
///
/// A DeleteRange touching several keys produces several events sharing one
/// revision, so this is the unit of ordering and deduplication.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeSet {
    pub revision: Revision,
    pub events: Vec<WatchEvent>,
}

/// Upper bound of a [`KeyRange`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RangeEnd {
    /// Only the start key itself.
    Single,
    /// Exclusive upper bound.
    Before(Vec<u8>),
    /// No upper bound.
    Unbounded,
}

/// Half-open key interval `[start, end)` under byte-lexicographic order.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: RangeEnd,
}

impl KeyRange {
    /// Exactly one key.
    pub fn single(key: impl Into<Vec<u8>>) -> Self {
        Self {
            start: key.into(),
            end: RangeEnd::Single,
        }
    }

    /// Keys in `[start, end)`.
    pub fn between(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Self {
        Self {
            start: start.into(),
            end: RangeEnd::Before(end.into()),
        }
    }

    /// Every key starting with `prefix`.
    pub fn prefix(prefix: impl Into<Vec<u8>>) -> Self {
        let start = prefix.into();
        let end = match prefix_end(&start) {
            Some(end) => RangeEnd::Before(end),
            None => RangeEnd::Unbounded,
        };
        Self { start, end }
    }

    /// The whole keyspace.
    pub fn all() -> Self {
        Self {
            start: Vec::new(),
            end: RangeEnd::Unbounded,
        }
    }

    /// Translate the wire encoding `(key, range_end)` into concrete bounds.
    ///
    /// - empty `range_end`: single key
    /// - `range_end == "\0"` with key `"\0"` or empty: every key
    /// - `range_end == "\0"` otherwise: every key with `key` as prefix
    /// - anything else: `[key, range_end)`
    pub fn from_wire(key: &[u8], range_end: &[u8]) -> Self {
        if range_end.is_empty() {
            return Self::single(key);
        }
        if range_end == RANGE_END_SENTINEL {
            if key.is_empty() || key == ALL_KEYS_SENTINEL {
                return Self::all();
            }
            return Self::prefix(key);
        }
        Self::between(key, range_end)
    }

    /// Inverse of [`KeyRange::from_wire`].
    ///
    /// Returns `None` for ranges the wire encoding cannot express exactly,
    /// such as an open-ended range from a key that is not an all-`0xff`
    /// prefix, or `[start, "\0")`, which the wire reads as a sentinel.
    pub fn to_wire(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let (key, range_end) = match &self.end {
            RangeEnd::Single => (self.start.clone(), Vec::new()),
            RangeEnd::Before(end) => (self.start.clone(), end.clone()),
            RangeEnd::Unbounded if self.start.is_empty() => {
                (ALL_KEYS_SENTINEL.to_vec(), RANGE_END_SENTINEL.to_vec())
            }
            RangeEnd::Unbounded => (self.start.clone(), RANGE_END_SENTINEL.to_vec()),
        };
        (Self::from_wire(&key, &range_end) == *self).then_some((key, range_end))
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        match &self.end {
            RangeEnd::Single => key == self.start.as_slice(),
            RangeEnd::Before(end) => key >= self.start.as_slice() && key < end.as_slice(),
            RangeEnd::Unbounded => key >= self.start.as_slice(),
        }
    }

    /// True if no key can fall into the range.
    pub fn is_empty(&self) -> bool {
        match &self.end {
            RangeEnd::Before(end) => end.as_slice() <= self.start.as_slice(),
            _ => false,
        }
    }
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = String::from_utf8_lossy(&self.start);
        match &self.end {
            RangeEnd::Single => write!(f, "KeyRange({:?})", start),
            RangeEnd::Before(end) => {
                write!(f, "KeyRange({:?}..{:?})", start, String::from_utf8_lossy(end))
            }
            RangeEnd::Unbounded => write!(f, "KeyRange({:?}..)", start),
        }
    }
}

/// Smallest key greater than every key with the given prefix.
///
/// Trailing `0xff` bytes are dropped and the last remaining byte is
/// incremented. Returns `None` when no such key exists (empty prefix or all
/// bytes `0xff`).
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// Input for a put.
#[derive(Clone, Debug, Default)]
pub struct PutRequest {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub lease: LeaseId,
    /// Return the previous version of the key.
    pub prev_kv: bool,
}

impl PutRequest {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn with_lease(mut self, lease: LeaseId) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_prev_kv(mut self) -> Self {
        self.prev_kv = true;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PutResponse {
    pub revision: Revision,
    pub prev_kv: Option<KeyValue>,
}

/// Options for a range read.
#[derive(Clone, Copy, Debug, Default)]
pub struct RangeOptions {
    /// Read as of this revision (0 = latest).
    pub revision: Revision,
    /// Maximum number of items (0 = unbounded).
    pub limit: usize,
    /// Strip values from the result.
    pub keys_only: bool,
    /// Only report the count.
    pub count_only: bool,
}

impl RangeOptions {
    pub fn at(revision: Revision) -> Self {
        Self {
            revision,
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeResponse {
    /// Matching records in ascending key order.
    pub kvs: Vec<KeyValue>,
    /// Total matches, ignoring the limit.
    pub count: usize,
    /// True if the limit cut the result short.
    pub more: bool,
    /// Head revision of the store when the read was served.
    pub header_revision: Revision,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteResponse {
    pub deleted: usize,
    /// Revision of the delete, or the current head if nothing matched.
    pub revision: Revision,
    pub prev_kvs: Vec<KeyValue>,
}

/// Result of a compare-and-swap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CasResponse {
    pub succeeded: bool,
    /// New mod revision on success; the key's current mod revision (0 if
    /// absent) on failure.
    pub revision: Revision,
    /// Current version of the key when the compare failed.
    pub current: Option<KeyValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_end_increments_last_byte() {
        assert_eq!(prefix_end(b"abc"), Some(b"abd".to_vec()));
        assert_eq!(prefix_end(b"a\xff"), Some(b"b".to_vec()));
        assert_eq!(prefix_end(b"\xff\xff"), None);
        assert_eq!(prefix_end(b""), None);
    }

    #[test]
    fn test_from_wire_sentinels() {
        assert_eq!(KeyRange::from_wire(b"foo", b""), KeyRange::single("foo"));
        assert_eq!(
            KeyRange::from_wire(b"foo", b"\0"),
            KeyRange::between("foo", "fop")
        );
        assert_eq!(KeyRange::from_wire(b"\0", b"\0"), KeyRange::all());
        assert_eq!(KeyRange::from_wire(b"", b"\0"), KeyRange::all());
        assert_eq!(
            KeyRange::from_wire(b"\xff", b"\0"),
            KeyRange {
                start: b"\xff".to_vec(),
                end: RangeEnd::Unbounded
            }
        );
        assert_eq!(KeyRange::from_wire(b"a", b"c"), KeyRange::between("a", "c"));
    }

    #[test]
    fn test_to_wire_inverts_from_wire() {
        for (key, end) in [
            (&b"k"[..], &b""[..]),
            (&b"\0"[..], &b"\0"[..]),
            (&b"a"[..], &b"z"[..]),
            (&b"\xff"[..], &b"\0"[..]),
        ] {
            let range = KeyRange::from_wire(key, end);
            let (k, e) = range.to_wire().unwrap();
            assert_eq!(KeyRange::from_wire(&k, &e), range);
        }
        assert!(KeyRange::prefix("app/").to_wire().is_some());
    }

    #[test]
    fn test_to_wire_refuses_lossy_ranges() {
        let open_ended = KeyRange {
            start: b"a".to_vec(),
            end: RangeEnd::Unbounded,
        };
        assert_eq!(open_ended.to_wire(), None);
        assert_eq!(KeyRange::between("", "\0").to_wire(), None);
        assert_eq!(KeyRange::between("a", "\0").to_wire(), None);
    }

    #[test]
    fn test_contains() {
        let range = KeyRange::between("b", "d");
        assert!(!range.contains(b"a"));
        assert!(range.contains(b"b"));
        assert!(range.contains(b"c\xff"));
        assert!(!range.contains(b"d"));

        assert!(KeyRange::single("x").contains(b"x"));
        assert!(!KeyRange::single("x").contains(b"xy"));

        let prefix = KeyRange::prefix("app/");
        assert!(prefix.contains(b"app/config"));
        assert!(!prefix.contains(b"app0"));
        assert!(KeyRange::all().contains(b""));
    }

    #[test]
    fn test_inverted_range_is_empty() {
        assert!(KeyRange::between("z", "a").is_empty());
        assert!(KeyRange::between("a", "a").is_empty());
        assert!(!KeyRange::between("a", "b").is_empty());
    }
}
