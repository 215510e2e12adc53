//! Durable log backing the offline queue.
//!
//! Layout: a 5-byte header (magic + version) followed by entries framed as
//! `len: u32 LE | MessagePack payload | crc32: u32 LE`. An entry either adds
//! an intent or marks one done. On open the log is replayed, and rewritten
//! to hold only the intents still pending, which also drops a torn tail left
//! by a crash mid-append.

use crate::error::{Result, SyncError};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::QueuedIntent;

/// Magic bytes for the queue file.
const QUEUE_MAGIC: &[u8; 4] = b"PSQ\0";

/// Current queue format version.
const QUEUE_VERSION: u8 = 1;

/// Upper bound for a single entry.
const MAX_ENTRY_BYTES: usize = 16 * 1024 * 1024;

/// Done markers tolerated before the log is compacted.
const COMPACT_AFTER: usize = 64;

#[derive(Debug, Serialize, Deserialize)]
enum LogEntry {
    Enqueued(QueuedIntent),
    Done { seq: u64 },
}

pub(crate) struct QueueLog {
    path: PathBuf,
    writer: BufWriter<File>,
    /// Held for the lifetime of the log.
    _lock_file: File,
    done_markers: usize,
}

impl QueueLog {
    /// Open or create the log, returning the pending intents in queue order.
    pub(crate) fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<QueuedIntent>)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let lock_file = Self::acquire_lock(&path)?;

        let pending = if path.exists() {
            Self::read_pending(&path)?
        } else {
            Vec::new()
        };

        Self::write_file(&path, &pending)?;
        let writer = BufWriter::new(OpenOptions::new().append(true).open(&path)?);
        debug!(path = %path.display(), pending = pending.len(), "opened offline queue");

        Ok((
            Self {
                path,
                writer,
                _lock_file: lock_file,
                done_markers: 0,
            },
            pending,
        ))
    }

    pub(crate) fn append(&mut self, intent: &QueuedIntent) -> Result<()> {
        self.write(&LogEntry::Enqueued(intent.clone()))
    }

    pub(crate) fn mark_done(&mut self, seq: u64) -> Result<()> {
        self.write(&LogEntry::Done { seq })?;
        self.done_markers += 1;
        Ok(())
    }

    /// Whether enough done markers piled up to warrant a rewrite.
    pub(crate) fn needs_compaction(&self) -> bool {
        self.done_markers >= COMPACT_AFTER
    }

    /// Replace the log with one holding exactly `pending`.
    pub(crate) fn compact(&mut self, pending: &[QueuedIntent]) -> Result<()> {
        self.writer.flush()?;
        Self::write_file(&self.path, pending)?;
        self.writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        self.done_markers = 0;
        Ok(())
    }

    fn write(&mut self, entry: &LogEntry) -> Result<()> {
        Self::write_entry(&mut self.writer, entry)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Write header plus `pending` to a temp file and rename it into place.
    fn write_file(path: &Path, pending: &[QueuedIntent]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(QUEUE_MAGIC)?;
            writer.write_all(&[QUEUE_VERSION])?;
            for intent in pending {
                Self::write_entry(&mut writer, &LogEntry::Enqueued(intent.clone()))?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read_pending(path: &Path) -> Result<Vec<QueuedIntent>> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != QUEUE_MAGIC {
            return Err(SyncError::InvalidFormat("Invalid queue magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != QUEUE_VERSION {
            return Err(SyncError::InvalidFormat(format!(
                "Unsupported queue version: {}",
                version[0]
            )));
        }

        let mut pending = BTreeMap::new();
        loop {
            match Self::read_entry(&mut reader) {
                Ok(LogEntry::Enqueued(intent)) => {
                    pending.insert(intent.seq, intent);
                }
                Ok(LogEntry::Done { seq }) => {
                    pending.remove(&seq);
                }
                Err(SyncError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "discarding unreadable queue tail");
                    break;
                }
            }
        }

        Ok(pending.into_values().collect())
    }

    fn write_entry<W: Write>(writer: &mut W, entry: &LogEntry) -> Result<()> {
        let encoded = rmp_serde::to_vec(entry)?;

        let len = encoded.len() as u32;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&encoded)?;

        let checksum = crc32fast::hash(&encoded);
        writer.write_all(&checksum.to_le_bytes())?;

        Ok(())
    }

    fn read_entry<R: Read>(reader: &mut R) -> Result<LogEntry> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_ENTRY_BYTES {
            return Err(SyncError::Corruption("Queue entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        let computed_checksum = crc32fast::hash(&encoded);
        if stored_checksum != computed_checksum {
            return Err(SyncError::Corruption("Queue checksum mismatch".into()));
        }

        Ok(rmp_serde::from_slice(&encoded)?)
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.with_extension("lock"))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| SyncError::Locked)?;

        Ok(lock_file)
    }
}
