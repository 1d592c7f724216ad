//! Journaled backend rooted in a data directory.
//!
//! ```text
//! <data_dir>/
//!   MANIFEST     magic + format version
//!   LOCK         exclusive lock while open
//!   journal.log  commits and compactions
//!   REVISION     reserved revision ceiling
//! ```

use super::{FileJournal, MvccBackend};
use crate::error::{EngineError, Result};
use crate::mvcc::{JournalEntry, KeyIndex};
use crate::revision::FileAllocator;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use tracing::info;

/// Magic bytes for the data directory manifest.
const MANIFEST_MAGIC: &[u8; 4] = b"KVS\0";

/// Current data directory format version.
const MANIFEST_VERSION: u8 = 1;

/// Tuning for [`FileBackend`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOptions {
    /// fsync the journal after every commit.
    pub sync_writes: bool,

    /// Revisions reserved per ceiling write.
    pub revision_batch: u64,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            sync_writes: true,
            revision_batch: 1000,
        }
    }
}

/// Durable backend.
pub type FileBackend = MvccBackend<FileJournal>;

impl MvccBackend<FileJournal> {
    /// Open the data directory at `dir`, creating it if missing, and replay
    /// the journal.
    pub fn open(dir: impl AsRef<Path>, options: FileOptions) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;

        // Nothing else in the directory is touched until the lock is held
        let lock = acquire_lock(dir)?;

        let manifest = dir.join("MANIFEST");
        if manifest.exists() {
            verify_manifest(&manifest)?;
        } else {
            write_manifest(&manifest)?;
        }

        let (mut journal, entries) = FileJournal::open(dir.join("journal.log"), options.sync_writes)?;
        journal.hold_lock(lock);

        let mut index = KeyIndex::new();
        let mut head = 0;
        for entry in &entries {
            if let JournalEntry::Commit { revision, .. } = entry {
                if *revision <= head {
                    return Err(EngineError::Corruption(format!(
                        "journal revision {} follows {}",
                        revision, head
                    )));
                }
            }
            entry.replay(&mut index)?;
            head = head.max(entry.revision());
        }

        let allocator = FileAllocator::open(dir.join("REVISION"), options.revision_batch, head)?;

        info!(
            path = %dir.display(),
            entries = entries.len(),
            revision = index.current_revision(),
            compacted = index.compacted_revision(),
            keys = index.live_key_count(),
            "file backend opened"
        );

        Ok(Self::from_parts("file", journal, Box::new(allocator), index))
    }
}

fn write_manifest(path: &Path) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(MANIFEST_MAGIC)?;
    file.write_all(&[MANIFEST_VERSION])?;
    file.sync_all()?;
    Ok(())
}

fn verify_manifest(path: &Path) -> Result<()> {
    let mut file = File::open(path)?;

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != MANIFEST_MAGIC {
        return Err(EngineError::InvalidFormat("Invalid data directory magic".into()));
    }

    let mut version = [0u8; 1];
    file.read_exact(&mut version)?;
    if version[0] != MANIFEST_VERSION {
        return Err(EngineError::InvalidFormat(format!(
            "Unsupported data directory version: {}",
            version[0]
        )));
    }

    Ok(())
}

fn acquire_lock(dir: &Path) -> Result<File> {
    let lock_file = File::create(dir.join("LOCK"))?;
    lock_file
        .try_lock_exclusive()
        .map_err(|_| EngineError::Locked)?;
    Ok(lock_file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, NoopSink};
    use crate::types::{KeyRange, PutRequest, RangeOptions};
    use tempfile::TempDir;

    fn options() -> FileOptions {
        FileOptions {
            sync_writes: false,
            revision_batch: 16,
        }
    }

    #[test]
    fn test_reopen_restores_state() {
        let dir = TempDir::new().unwrap();

        {
            let backend = FileBackend::open(dir.path(), options()).unwrap();
            backend.put(&PutRequest::new("a", "1"), &NoopSink).unwrap();
            backend.put(&PutRequest::new("a", "2"), &NoopSink).unwrap();
            backend.put(&PutRequest::new("b", "1"), &NoopSink).unwrap();
            backend
                .delete_range(&KeyRange::single("b"), &NoopSink)
                .unwrap();
            backend.compact(2).unwrap();
        }

        let backend = FileBackend::open(dir.path(), options()).unwrap();
        assert_eq!(backend.current_revision(), 4);
        assert_eq!(backend.compacted_revision(), 2);

        let resp = backend
            .range(&KeyRange::all(), &RangeOptions::default())
            .unwrap();
        assert_eq!(resp.kvs.len(), 1);
        assert_eq!(resp.kvs[0].value, b"2");
        assert_eq!(resp.kvs[0].create_revision, 1);
        assert_eq!(resp.kvs[0].version, 2);

        // Clean restart continues without a gap
        let next = backend.put(&PutRequest::new("c", "1"), &NoopSink).unwrap();
        assert_eq!(next.revision, 5);
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = TempDir::new().unwrap();
        let _first = FileBackend::open(dir.path(), options()).unwrap();

        let second = FileBackend::open(dir.path(), options());
        assert!(matches!(second, Err(EngineError::Locked)));
    }

    #[test]
    fn test_locked_directory_is_left_untouched() {
        let dir = TempDir::new().unwrap();
        let holder = File::create(dir.path().join("LOCK")).unwrap();
        holder.try_lock_exclusive().unwrap();

        let result = FileBackend::open(dir.path(), options());
        assert!(matches!(result, Err(EngineError::Locked)));
        assert!(!dir.path().join("MANIFEST").exists());
        assert!(!dir.path().join("journal.log").exists());
        assert!(!dir.path().join("REVISION").exists());
    }

    #[test]
    fn test_foreign_manifest_is_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("MANIFEST"), b"RST\0\x01").unwrap();

        let result = FileBackend::open(dir.path(), options());
        assert!(matches!(result, Err(EngineError::InvalidFormat(_))));
    }

    #[test]
    fn test_status_reports_journal_size() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::open(dir.path(), options()).unwrap();
        backend.put(&PutRequest::new("k", "v"), &NoopSink).unwrap();

        let status = backend.status();
        assert_eq!(status.name, "file");
        assert_eq!(status.key_count, 1);
        assert_eq!(
            status.db_size,
            fs::metadata(dir.path().join("journal.log")).unwrap().len()
        );
    }
}
