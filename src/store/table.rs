//! File-backed post table.

use super::index::FeedIndex;
use super::{InsertOutcome, PostStore};
use crate::error::{FeedError, Result};
use crate::types::{Cursor, Post};
use crate::wal::WriteAheadLog;
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the table manifest.
const TABLE_MAGIC: &[u8; 4] = b"PTB\0";

/// Current table format version.
const TABLE_VERSION: u8 = 1;

/// Magic bytes for the post log.
const LOG_MAGIC: &[u8; 4] = b"PLG\0";

/// One mutation of the table.
#[derive(Clone, Debug, Serialize, Deserialize)]
enum TableEntry {
    Insert(Post),
    Delete { uri: String },
}

/// Durable table of matched posts.
///
/// Rows live in memory, partitioned by feed; every mutation is appended to
/// `posts.log` first. A `(feed, uri)` pair holds at most one row, and the
/// check-then-append runs under a single write lock, so concurrent inserts
/// of the same post resolve here rather than in the caller.
pub struct PostTable {
    path: PathBuf,

    /// Lock file for exclusive access.
    _lock_file: File,

    log: WriteAheadLog,

    feeds: RwLock<HashMap<String, FeedIndex>>,

    /// Serializes mutations.
    write_lock: Mutex<()>,
}

impl PostTable {
    /// Open the table at `path`, creating it if needed.
    pub fn open(path: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        if path.join("MANIFEST").exists() {
            Self::verify_manifest(&path)?;
        } else {
            Self::write_manifest(&path)?;
        }

        let lock_file = Self::acquire_lock(&path)?;

        let (log, entries) =
            WriteAheadLog::open::<TableEntry>(path.join("posts.log"), LOG_MAGIC, fsync)?;

        let mut feeds: HashMap<String, FeedIndex> = HashMap::new();
        let replayed = entries.len();
        for entry in entries {
            match entry {
                TableEntry::Insert(post) => {
                    feeds.entry(post.feed.clone()).or_default().insert(post);
                }
                TableEntry::Delete { uri } => {
                    for index in feeds.values_mut() {
                        index.remove(&uri);
                    }
                }
            }
        }

        let rows: usize = feeds.values().map(FeedIndex::len).sum();
        tracing::info!(path = %path.display(), replayed, rows, "opened post table");

        Ok(Self {
            path,
            _lock_file: lock_file,
            log,
            feeds: RwLock::new(feeds),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total rows across feeds.
    pub fn len(&self) -> usize {
        self.feeds.read().values().map(FeedIndex::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrite the log so it holds one insert per live row.
    pub fn compact(&self) -> Result<()> {
        let _lock = self.write_lock.lock();
        let entries: Vec<TableEntry> = {
            let feeds = self.feeds.read();
            let mut posts: Vec<&Post> = feeds.values().flat_map(FeedIndex::posts).collect();
            posts.sort_by(|a, b| a.indexed_at.cmp(&b.indexed_at).then_with(|| a.uri.cmp(&b.uri)));
            posts.into_iter().cloned().map(TableEntry::Insert).collect()
        };
        self.log.rewrite(&entries)?;
        tracing::info!(rows = entries.len(), "compacted post log");
        Ok(())
    }

    /// Flush and fsync the log.
    pub fn sync(&self) -> Result<()> {
        self.log.sync()
    }

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(TABLE_MAGIC)?;
        file.write_all(&[TABLE_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != TABLE_MAGIC {
            return Err(FeedError::InvalidFormat("Invalid table magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != TABLE_VERSION {
            return Err(FeedError::InvalidFormat(format!(
                "Unsupported table version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| FeedError::Locked)?;
        Ok(lock_file)
    }
}

impl PostStore for PostTable {
    fn insert_post(&self, post: Post) -> Result<InsertOutcome> {
        let _lock = self.write_lock.lock();

        let exists = self
            .feeds
            .read()
            .get(&post.feed)
            .is_some_and(|index| index.contains(&post.uri));
        if exists {
            return Ok(InsertOutcome::AlreadyPresent);
        }

        let entry = TableEntry::Insert(post);
        self.log.append(&entry)?;

        if let TableEntry::Insert(post) = entry {
            self.feeds
                .write()
                .entry(post.feed.clone())
                .or_default()
                .insert(post);
        }
        Ok(InsertOutcome::Inserted)
    }

    fn delete_post(&self, uri: &str) -> Result<usize> {
        let _lock = self.write_lock.lock();

        let present = self
            .feeds
            .read()
            .values()
            .any(|index| index.contains(uri));
        if !present {
            return Ok(0);
        }

        self.log.append(&TableEntry::Delete {
            uri: uri.to_string(),
        })?;

        let mut feeds = self.feeds.write();
        let removed = feeds
            .values_mut()
            .filter_map(|index| index.remove(uri))
            .count();
        feeds.retain(|_, index| !index.is_empty());
        Ok(removed)
    }

    fn page(&self, feed: &str, limit: usize, after: Option<&Cursor>) -> Result<Vec<Post>> {
        Ok(self
            .feeds
            .read()
            .get(feed)
            .map(|index| index.page(limit, after))
            .unwrap_or_default())
    }

    fn count(&self, feed: &str) -> Result<usize> {
        Ok(self.feeds.read().get(feed).map_or(0, FeedIndex::len))
    }
}

impl Drop for PostTable {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.log.sync();
    }
}
