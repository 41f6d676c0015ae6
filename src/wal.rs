//! Append-only, checksummed log file shared by the queue journals and the
//! post table.
//!
//! Layout: a 4-byte magic and a version byte, followed by frames of
//! `len (u32 LE) | MessagePack payload | crc32 (u32 LE)`. On open every frame
//! is replayed; a torn frame at the tail (crash mid-write) is truncated away
//! so subsequent appends start from a clean boundary. A damaged frame with
//! intact data after it is corruption and fails the open.

use crate::error::{FeedError, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Seek, Write};
use std::path::{Path, PathBuf};

/// Current log format version.
const WAL_VERSION: u8 = 1;

/// Header size (magic + version).
const HEADER_SIZE: u64 = 5;

/// Length prefix plus checksum.
const FRAME_OVERHEAD: u64 = 8;

/// Upper bound on a single frame.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Append-only framed log.
pub struct WriteAheadLog {
    /// Path to the log file.
    path: PathBuf,
    /// File magic.
    magic: [u8; 4],
    /// fsync after every append.
    fsync: bool,
    /// Write handle.
    writer: Mutex<BufWriter<File>>,
}

impl WriteAheadLog {
    /// Open or create a log, returning it together with every entry it holds.
    pub fn open<T: DeserializeOwned>(
        path: impl AsRef<Path>,
        magic: &[u8; 4],
        fsync: bool,
    ) -> Result<(Self, Vec<T>)> {
        let path = path.as_ref().to_path_buf();

        let existing_len = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let entries = if existing_len < HEADER_SIZE {
            // New file, or a crash before the header made it to disk
            Self::write_header(&path, magic)?;
            Vec::new()
        } else {
            let (frames, good_end) = Self::read_frames(&path, magic)?;
            if good_end < existing_len {
                tracing::warn!(
                    path = %path.display(),
                    kept_bytes = good_end,
                    dropped_bytes = existing_len - good_end,
                    "truncating torn tail of log"
                );
                let file = OpenOptions::new().write(true).open(&path)?;
                file.set_len(good_end)?;
                file.sync_all()?;
            }

            frames
                .iter()
                .map(|frame| rmp_serde::from_slice(frame).map_err(FeedError::from))
                .collect::<Result<Vec<T>>>()?
        };

        let file = OpenOptions::new().append(true).open(&path)?;

        Ok((
            Self {
                path,
                magic: *magic,
                fsync,
                writer: Mutex::new(BufWriter::new(file)),
            },
            entries,
        ))
    }

    /// Append one entry. Durable on return when `fsync` is enabled.
    pub fn append<T: Serialize>(&self, entry: &T) -> Result<()> {
        let encoded = rmp_serde::to_vec(entry)?;
        let mut writer = self.writer.lock();
        Self::write_frame(&mut *writer, &encoded)?;
        writer.flush()?;
        if self.fsync {
            writer.get_ref().sync_data()?;
        }
        Ok(())
    }

    /// Atomically replace the log contents with `entries`.
    ///
    /// The new log is written beside the old one and renamed over it.
    pub fn rewrite<T: Serialize>(&self, entries: &[T]) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;

        let tmp_path = self.path.with_extension("compact");
        {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut tmp = BufWriter::new(file);
            tmp.write_all(&self.magic)?;
            tmp.write_all(&[WAL_VERSION])?;
            for entry in entries {
                let encoded = rmp_serde::to_vec(entry)?;
                Self::write_frame(&mut tmp, &encoded)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }

        fs::rename(&tmp_path, &self.path)?;
        *writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        Ok(())
    }

    /// Flush and fsync pending writes.
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current size of the log file in bytes.
    pub fn size(&self) -> Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    fn write_header(path: &Path, magic: &[u8; 4]) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(magic)?;
        file.write_all(&[WAL_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn write_frame<W: Write>(writer: &mut W, encoded: &[u8]) -> Result<()> {
        if encoded.len() > MAX_FRAME_SIZE {
            return Err(FeedError::Serialization(format!(
                "log entry of {} bytes exceeds frame limit",
                encoded.len()
            )));
        }
        writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
        writer.write_all(encoded)?;
        writer.write_all(&crc32fast::hash(encoded).to_le_bytes())?;
        Ok(())
    }

    /// Read all intact frames. Returns them with the offset just past the last one.
    ///
    /// Only the final frame may be incomplete or fail its checksum; anything
    /// earlier is reported as corruption.
    fn read_frames(path: &Path, magic: &[u8; 4]) -> Result<(Vec<Vec<u8>>, u64)> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut header_magic = [0u8; 4];
        reader.read_exact(&mut header_magic)?;
        if &header_magic != magic {
            return Err(FeedError::InvalidFormat(format!(
                "Invalid log magic in {}",
                path.display()
            )));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != WAL_VERSION {
            return Err(FeedError::InvalidFormat(format!(
                "Unsupported log version: {}",
                version[0]
            )));
        }

        let mut frames = Vec::new();
        let mut good_end = HEADER_SIZE;
        loop {
            match Self::read_frame(&mut reader) {
                Ok(Some(frame)) => {
                    good_end += FRAME_OVERHEAD + frame.len() as u64;
                    frames.push(frame);
                }
                Ok(None) => break,
                Err(FeedError::ChecksumMismatch { expected, got }) => {
                    let frame_end = reader.stream_position()?;
                    if frame_end == file_len {
                        // Last frame, payload never fully hit the disk
                        break;
                    }
                    return Err(FeedError::Corruption(format!(
                        "checksum mismatch at offset {good_end} in {} (expected {expected:08x}, got {got:08x})",
                        path.display()
                    )));
                }
                Err(FeedError::Corruption(reason)) => {
                    return Err(FeedError::Corruption(format!(
                        "{reason} at offset {good_end} in {}",
                        path.display()
                    )));
                }
                Err(e) => return Err(e),
            }
        }

        Ok((frames, good_end))
    }

    /// Read one frame. `None` means the log ends here, possibly mid-frame.
    fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
        let mut len_bytes = [0u8; 4];
        if !read_or_eof(reader, &mut len_bytes)? {
            return Ok(None);
        }
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > MAX_FRAME_SIZE {
            return Err(FeedError::Corruption("log frame too large".into()));
        }

        let mut encoded = vec![0u8; len];
        if !read_or_eof(reader, &mut encoded)? {
            return Ok(None);
        }

        let mut checksum_bytes = [0u8; 4];
        if !read_or_eof(reader, &mut checksum_bytes)? {
            return Ok(None);
        }
        let stored = u32::from_le_bytes(checksum_bytes);
        let computed = crc32fast::hash(&encoded);
        if stored != computed {
            return Err(FeedError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        Ok(Some(encoded))
    }
}

/// Fill `buf`, returning `false` if the input ends first.
fn read_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}
