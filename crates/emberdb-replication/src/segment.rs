//! One segment of the append-only replication log.
//!
//! A segment is a disk file named `<base_seq>.log` holding length-prefixed
//! records, big-endian:
//!
//! ```text
//! [len: u32][payload: len bytes][len: u32][payload] ...
//! ```
//!
//! Record `base_seq + i` is the i-th record of the file. A sealed segment
//! gets a `<base_seq>.idx` sidecar carrying `[last_seq: u64][crc32: u32]`
//! (the checksum covers the first eight bytes); the sidecar is a recovery
//! hint, the data file stays the source of truth. Sealed segments are never
//! rewritten; they disappear whole once every consumer has passed them.
//!
//! On open, the record offsets are rebuilt by scanning the file. A partial
//! record at the tail (crash mid-append) is truncated away with a warning;
//! a length prefix pointing past a sealed segment's contents or a sidecar
//! that fails its checksum is [`Error::CorruptLog`].

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{Error, Result};

struct SegmentInner {
    /// Start offset of each record; one entry per record.
    offsets: Vec<u64>,
    /// File size in bytes (end offset of the last record).
    size: u64,
    /// Append handle; `None` once sealed.
    writer: Option<File>,
}

pub struct LogSegment {
    dir: PathBuf,
    base_seq: u64,
    inner: RwLock<SegmentInner>,
}

impl LogSegment {
    fn log_path(dir: &Path, base_seq: u64) -> PathBuf {
        dir.join(format!("{base_seq}.log"))
    }

    fn idx_path(dir: &Path, base_seq: u64) -> PathBuf {
        dir.join(format!("{base_seq}.idx"))
    }

    /// Create a fresh, empty segment starting at `base_seq`.
    pub async fn create(dir: &Path, base_seq: u64) -> Result<LogSegment> {
        let writer = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(Self::log_path(dir, base_seq))
            .await?;
        debug!(base_seq, dir = %dir.display(), "log segment created");
        Ok(LogSegment {
            dir: dir.to_path_buf(),
            base_seq,
            inner: RwLock::new(SegmentInner {
                offsets: Vec::new(),
                size: 0,
                writer: Some(writer),
            }),
        })
    }

    /// Open an existing segment, rebuilding the record offsets from the
    /// data file. `writable` reattaches an append handle (the active
    /// segment); sealed segments are opened read-only and validated
    /// against their sidecar.
    pub async fn open(dir: &Path, base_seq: u64, writable: bool) -> Result<LogSegment> {
        let path = Self::log_path(dir, base_seq);
        let mut file = File::open(&path).await?;
        let file_len = file.metadata().await?.len();

        let mut offsets = Vec::new();
        let mut pos = 0u64;
        let mut len_buf = [0u8; 4];
        while pos + 4 <= file_len {
            file.read_exact(&mut len_buf).await?;
            let len = u32::from_be_bytes(len_buf) as u64;
            if pos + 4 + len > file_len {
                if writable {
                    // crash mid-append; drop the partial tail
                    warn!(
                        base_seq,
                        offset = pos,
                        "partial record at segment tail, truncating"
                    );
                    break;
                }
                return Err(Error::CorruptLog(format!(
                    "record at offset {pos} of sealed segment {base_seq} overruns the file"
                )));
            }
            offsets.push(pos);
            pos += 4 + len;
            file.seek(std::io::SeekFrom::Start(pos)).await?;
        }
        let size = pos;

        let last_seq = base_seq + offsets.len() as u64;
        let last_seq = last_seq.saturating_sub(1);
        if let Some(idx_last_seq) = Self::read_idx(dir, base_seq).await? {
            if !offsets.is_empty() && idx_last_seq != last_seq {
                return Err(Error::CorruptLog(format!(
                    "segment {base_seq}: sidecar says last seq {idx_last_seq}, scan found {last_seq}"
                )));
            }
        }

        let writer = if writable {
            let mut writer = OpenOptions::new().write(true).open(&path).await?;
            writer.set_len(size).await?;
            writer.seek(std::io::SeekFrom::Start(size)).await?;
            Some(writer)
        } else {
            None
        };

        debug!(base_seq, records = offsets.len(), "log segment opened");
        Ok(LogSegment {
            dir: dir.to_path_buf(),
            base_seq,
            inner: RwLock::new(SegmentInner {
                offsets,
                size,
                writer,
            }),
        })
    }

    async fn read_idx(dir: &Path, base_seq: u64) -> Result<Option<u64>> {
        let raw = match tokio::fs::read(Self::idx_path(dir, base_seq)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if raw.len() != 12 {
            return Err(Error::CorruptLog(format!(
                "segment {base_seq}: sidecar has {} bytes, expected 12",
                raw.len()
            )));
        }
        let stored_crc = u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]);
        if crc32fast::hash(&raw[0..8]) != stored_crc {
            return Err(Error::CorruptLog(format!(
                "segment {base_seq}: sidecar checksum mismatch"
            )));
        }
        Ok(Some(u64::from_be_bytes([
            raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
        ])))
    }

    pub fn base_seq(&self) -> u64 {
        self.base_seq
    }

    /// Sequence of the last record; `base_seq - 1` while empty.
    pub async fn last_seq(&self) -> u64 {
        let inner = self.inner.read().await;
        (self.base_seq + inner.offsets.len() as u64).saturating_sub(1)
    }

    pub async fn size(&self) -> u64 {
        self.inner.read().await.size
    }

    /// Append one record; the caller hands out sequence numbers.
    pub async fn append(&self, payload: &[u8]) -> Result<()> {
        let mut inner = self.inner.write().await;
        let offset = inner.size;
        let writer = inner.writer.as_mut().ok_or(Error::Closed)?;
        writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
        writer.write_all(payload).await?;
        inner.offsets.push(offset);
        inner.size = offset + 4 + payload.len() as u64;
        Ok(())
    }

    /// Read the record with the given sequence.
    pub async fn read(&self, seq: u64) -> Result<Bytes> {
        let offset = {
            let inner = self.inner.read().await;
            if seq < self.base_seq || seq - self.base_seq >= inner.offsets.len() as u64 {
                return Err(Error::NotFound(seq));
            }
            inner.offsets[(seq - self.base_seq) as usize]
        };

        let mut file = File::open(Self::log_path(&self.dir, self.base_seq)).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload).await?;
        Ok(Bytes::from(payload))
    }

    /// Flush appended records to disk.
    pub async fn sync(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(writer) = inner.writer.as_mut() {
            writer.sync_data().await?;
        }
        Ok(())
    }

    /// Seal the segment: fsync, drop the append handle, write the sidecar.
    pub async fn seal(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        let Some(mut writer) = inner.writer.take() else {
            return Ok(());
        };
        writer.sync_all().await?;
        drop(writer);

        let last_seq = (self.base_seq + inner.offsets.len() as u64).saturating_sub(1);
        let mut sidecar = Vec::with_capacity(12);
        sidecar.extend_from_slice(&last_seq.to_be_bytes());
        sidecar.extend_from_slice(&crc32fast::hash(&last_seq.to_be_bytes()).to_be_bytes());
        tokio::fs::write(Self::idx_path(&self.dir, self.base_seq), sidecar).await?;
        debug!(base_seq = self.base_seq, last_seq, "log segment sealed");
        Ok(())
    }

    /// Delete the segment's files.
    pub async fn remove(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.writer = None;
        tokio::fs::remove_file(Self::log_path(&self.dir, self.base_seq)).await?;
        match tokio::fs::remove_file(Self::idx_path(&self.dir, self.base_seq)).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }
}
