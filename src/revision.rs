//! Revision allocation.
//!
//! Every committed mutation receives the next revision from a
//! [`RevisionAllocator`]. The file-backed allocator reserves revisions in
//! blocks and persists the reserved ceiling before handing any of them out, so
//! a crash can waste revisions but never reissue one.

use crate::error::{EngineError, Result};
use crate::types::Revision;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Source of globally increasing revisions.
///
/// Calls are fully serialized: no two callers ever receive the same value.
pub trait RevisionAllocator: Send + Sync {
    /// Issue the next revision.
    fn next(&self) -> Result<Revision>;

    /// The most recently issued revision (0 if none).
    fn last_issued(&self) -> Revision;
}

/// Volatile allocator for in-memory backends.
pub struct MemoryAllocator {
    last: Mutex<Revision>,
}

impl MemoryAllocator {
    pub fn new() -> Self {
        Self::starting_after(0)
    }

    /// Allocator whose first revision is `last + 1`.
    pub fn starting_after(last: Revision) -> Self {
        Self {
            last: Mutex::new(last),
        }
    }
}

impl Default for MemoryAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RevisionAllocator for MemoryAllocator {
    fn next(&self) -> Result<Revision> {
        let mut last = self.last.lock();
        if *last == Revision::MAX {
            return Err(EngineError::RevisionAllocation(
                "revision space exhausted".into(),
            ));
        }
        *last += 1;
        Ok(*last)
    }

    fn last_issued(&self) -> Revision {
        *self.last.lock()
    }
}

/// Magic bytes for the revision ceiling file.
const REVISION_MAGIC: &[u8; 4] = b"REV\0";

/// Current ceiling file format version.
const REVISION_VERSION: u8 = 1;

/// Ceiling file size: magic + version + ceiling + checksum.
const REVISION_FILE_SIZE: usize = 4 + 1 + 8 + 4;

struct Reservation {
    /// Last revision handed out.
    last: Revision,
    /// Highest revision durably reserved.
    ceiling: Revision,
}

/// Durable allocator that reserves revisions in blocks.
pub struct FileAllocator {
    path: PathBuf,
    batch: i64,
    state: Mutex<Reservation>,
}

impl FileAllocator {
    /// Open or create the ceiling file at `path`.
    ///
    /// The first revision issued is one past the persisted ceiling, and never
    /// below `floor + 1` (the highest revision found in the journal).
    pub fn open(path: impl AsRef<Path>, batch: u64, floor: Revision) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if batch == 0 {
            return Err(EngineError::Config(
                "revision batch must be greater than zero".into(),
            ));
        }

        let stored = if path.exists() {
            Self::read_ceiling(&path)?
        } else {
            0
        };
        if stored < floor {
            warn!(
                stored,
                floor, "revision ceiling behind journal, resuming after journal head"
            );
        }
        let last = stored.max(floor);

        debug!(path = %path.display(), last, "revision allocator opened");

        Ok(Self {
            path,
            batch: batch.min(i64::MAX as u64) as i64,
            state: Mutex::new(Reservation {
                last,
                ceiling: last,
            }),
        })
    }

    /// The persisted ceiling (for inspection).
    pub fn ceiling(&self) -> Revision {
        self.state.lock().ceiling
    }

    /// Persist `ceiling = last issued`, returning unused revisions.
    pub fn release(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.ceiling != state.last {
            Self::write_ceiling(&self.path, state.last)?;
            state.ceiling = state.last;
        }
        Ok(())
    }

    fn read_ceiling(path: &Path) -> Result<Revision> {
        let mut file = File::open(path)?;
        let mut buf = [0u8; REVISION_FILE_SIZE];
        file.read_exact(&mut buf)?;

        if &buf[0..4] != REVISION_MAGIC {
            return Err(EngineError::InvalidFormat("Invalid revision file magic".into()));
        }
        if buf[4] != REVISION_VERSION {
            return Err(EngineError::InvalidFormat(format!(
                "Unsupported revision file version: {}",
                buf[4]
            )));
        }

        let mut ceiling_bytes = [0u8; 8];
        ceiling_bytes.copy_from_slice(&buf[5..13]);
        let mut checksum_bytes = [0u8; 4];
        checksum_bytes.copy_from_slice(&buf[13..17]);

        let stored = u32::from_le_bytes(checksum_bytes);
        let computed = crc32fast::hash(&ceiling_bytes);
        if stored != computed {
            return Err(EngineError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        Ok(i64::from_le_bytes(ceiling_bytes))
    }

    /// Write via a temp file and rename so a crash leaves either the old or
    /// the new ceiling on disk.
    fn write_ceiling(path: &Path, ceiling: Revision) -> Result<()> {
        let tmp = path.with_extension("tmp");
        let ceiling_bytes = ceiling.to_le_bytes();

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(REVISION_MAGIC)?;
        file.write_all(&[REVISION_VERSION])?;
        file.write_all(&ceiling_bytes)?;
        file.write_all(&crc32fast::hash(&ceiling_bytes).to_le_bytes())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, path)?;
        Ok(())
    }
}

impl RevisionAllocator for FileAllocator {
    fn next(&self) -> Result<Revision> {
        let mut state = self.state.lock();
        if state.last == Revision::MAX {
            return Err(EngineError::RevisionAllocation(
                "revision space exhausted".into(),
            ));
        }

        let revision = state.last + 1;
        if revision > state.ceiling {
            let ceiling = state.ceiling.saturating_add(self.batch);
            Self::write_ceiling(&self.path, ceiling)
                .map_err(|e| EngineError::RevisionAllocation(e.to_string()))?;
            debug!(ceiling, "reserved revision block");
            state.ceiling = ceiling;
        }

        state.last = revision;
        Ok(revision)
    }

    fn last_issued(&self) -> Revision {
        self.state.lock().last
    }
}

impl Drop for FileAllocator {
    fn drop(&mut self) {
        // Best-effort release so clean restarts stay gap-free
        if let Err(e) = self.release() {
            warn!(error = %e, "failed to release revision reservation");
        }
    }
}
