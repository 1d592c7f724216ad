//! Append-only commit journal for the file backend.
//!
//! Layout: a 5-byte header (magic + version) followed by entries of
//! `[len: u32 LE][rmp-serde payload][crc32 of payload: u32 LE]`.

use super::Journal;
use crate::error::{EngineError, Result};
use crate::mvcc::JournalEntry;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for the journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"KVJ\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

/// Header size (magic + version).
const HEADER_SIZE: u64 = 5;

/// Upper bound on a single encoded entry.
const MAX_ENTRY_SIZE: usize = 64 * 1024 * 1024;

/// Journal file handle.
pub struct FileJournal {
    path: PathBuf,
    file: File,
    /// Length of the valid prefix of the file.
    size: u64,
    /// fsync after every append.
    sync_writes: bool,
    /// Exclusive lock on the owning data directory, held for our lifetime.
    _lock: Option<File>,
}

impl FileJournal {
    /// Open or create the journal, returning every intact entry in order.
    ///
    /// A torn or corrupted tail is cut off at the last intact entry.
    pub fn open(path: impl AsRef<Path>, sync_writes: bool) -> Result<(Self, Vec<JournalEntry>)> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            file.write_all(JOURNAL_MAGIC)?;
            file.write_all(&[JOURNAL_VERSION])?;
            file.sync_all()?;

            let journal = Self {
                path,
                file,
                size: HEADER_SIZE,
                sync_writes,
                _lock: None,
            };
            return Ok((journal, Vec::new()));
        }

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file.try_clone()?);

        // Verify header
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(EngineError::InvalidFormat("Invalid journal magic".into()));
        }
        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != JOURNAL_VERSION {
            return Err(EngineError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }

        let mut entries = Vec::new();
        let mut valid = HEADER_SIZE;
        while valid < file_len {
            match Self::read_entry(&mut reader) {
                Ok((entry, len)) => {
                    entries.push(entry);
                    valid += len;
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        offset = valid,
                        dropped = file_len - valid,
                        error = %e,
                        "truncating damaged journal tail"
                    );
                    break;
                }
            }
        }

        if valid < file_len {
            file.set_len(valid)?;
            file.sync_all()?;
        }

        debug!(path = %path.display(), entries = entries.len(), "journal recovered");

        let journal = Self {
            path,
            file,
            size: valid,
            sync_writes,
            _lock: None,
        };
        Ok((journal, entries))
    }

    /// Keep `lock` alive until this journal is dropped.
    pub fn hold_lock(&mut self, lock: File) {
        self._lock = Some(lock);
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Force all appended entries to disk.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn encode(entry: &JournalEntry) -> Result<Vec<u8>> {
        let payload = rmp_serde::to_vec(entry)?;
        if payload.len() > MAX_ENTRY_SIZE {
            return Err(EngineError::InvalidArgument(format!(
                "commit of {} bytes exceeds the {} byte limit",
                payload.len(),
                MAX_ENTRY_SIZE
            )));
        }

        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        Ok(frame)
    }

    /// Read one entry, returning it with its framed length.
    fn read_entry(reader: &mut impl Read) -> Result<(JournalEntry, u64)> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_ENTRY_SIZE {
            return Err(EngineError::Corruption("journal entry too large".into()));
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);
        let computed = crc32fast::hash(&payload);
        if stored != computed {
            return Err(EngineError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        let entry = rmp_serde::from_slice(&payload)?;
        Ok((entry, (len + 8) as u64))
    }

    fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(self.size))?;
        self.file.write_all(frame)?;
        if self.sync_writes {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

impl Journal for FileJournal {
    fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        let frame = Self::encode(entry)?;

        if let Err(e) = self.write_frame(&frame) {
            // Drop whatever part of the frame reached the file
            if let Err(truncate_err) = self.file.set_len(self.size) {
                warn!(error = %truncate_err, "failed to roll back partial journal write");
            }
            return Err(e.into());
        }

        self.size += frame.len() as u64;
        Ok(())
    }

    fn size(&self) -> Option<u64> {
        Some(self.size)
    }
}

impl std::fmt::Debug for FileJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileJournal")
            .field("path", &self.path)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::Mutation;
    use tempfile::TempDir;

    fn commit(revision: i64, key: &str) -> JournalEntry {
        JournalEntry::Commit {
            revision,
            mutations: vec![Mutation::Put {
                key: key.as_bytes().to_vec(),
                value: b"value".to_vec(),
                lease: 0,
            }],
        }
    }

    #[test]
    fn test_journal_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.log");

        {
            let (mut journal, entries) = FileJournal::open(&path, true).unwrap();
            assert!(entries.is_empty());
            journal.append(&commit(1, "a")).unwrap();
            journal.append(&commit(2, "b")).unwrap();
            journal.append(&JournalEntry::Compact { revision: 1 }).unwrap();
        }

        let (journal, entries) = FileJournal::open(&path, true).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], commit(1, "a"));
        assert_eq!(entries[2], JournalEntry::Compact { revision: 1 });
        assert_eq!(journal.size(), Some(std::fs::metadata(&path).unwrap().len()));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.log");

        let intact_len = {
            let (mut journal, _) = FileJournal::open(&path, true).unwrap();
            journal.append(&commit(1, "a")).unwrap();
            let intact = journal.size().unwrap();
            journal.append(&commit(2, "b")).unwrap();
            intact
        };

        // Chop the last entry in half
        let full_len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(intact_len + (full_len - intact_len) / 2).unwrap();
        drop(file);

        let (mut journal, entries) = FileJournal::open(&path, true).unwrap();
        assert_eq!(entries, vec![commit(1, "a")]);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), intact_len);

        // Appends continue from the intact prefix
        journal.append(&commit(2, "c")).unwrap();
        drop(journal);
        let (_, entries) = FileJournal::open(&path, true).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1], commit(2, "c"));
    }

    #[test]
    fn test_checksum_damage_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.log");
        {
            let (mut journal, _) = FileJournal::open(&path, false).unwrap();
            journal.append(&commit(1, "a")).unwrap();
        }

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let (_, entries) = FileJournal::open(&path, false).unwrap();
        assert!(entries.is_empty());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), HEADER_SIZE);
    }

    #[test]
    fn test_wrong_magic_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.log");
        std::fs::write(&path, b"NOPE\x01").unwrap();

        let result = FileJournal::open(&path, true);
        assert!(matches!(result, Err(EngineError::InvalidFormat(_))));
    }
}
