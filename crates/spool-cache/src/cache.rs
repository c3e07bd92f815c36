//! File-based spool with a persisted index

use crate::error::{CacheError, Result};
use crate::limiter::{ByteBudget, LimitWriter, WriteBudget};
use crate::safefile::write_atomic;
use crate::types::{CacheStats, CachedFile, EntryRecord};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Name of the index file inside the cache directory
pub const INDEX_FILE_NAME: &str = "index.json";

/// Prefix of every backing file, used to recognise orphans
const CONTENT_PREFIX: &str = "cache-";

/// A bounded spool directory.
///
/// Cloning is cheap and every clone refers to the same directory, entries
/// and budget.
#[derive(Clone)]
pub struct FileCache {
    /// Live entries in submission order
    entries: Arc<RwLock<Vec<EntryRecord>>>,
    /// Directory holding backing files and the index
    cache_dir: Arc<PathBuf>,
    /// Aggregate size of live entries plus in-flight reservations
    budget: Arc<ByteBudget>,
}

impl FileCache {
    /// Open or create the cache directory and load previously spooled
    /// entries.
    pub async fn open(cache_dir: impl Into<PathBuf>, max_size: u64) -> Result<Self> {
        let cache_dir = cache_dir.into();
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o700);
        builder.create(&cache_dir).await?;

        let cache = Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            cache_dir: Arc::new(cache_dir),
            budget: Arc::new(ByteBudget::new(max_size)),
        };
        info!(cache_dir = ?cache.cache_dir, max_size, "Cache initialized");
        cache.load().await?;
        Ok(cache)
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Current aggregate size in bytes
    pub fn size(&self) -> u64 {
        self.budget.current()
    }

    pub fn max_size(&self) -> u64 {
        self.budget.max()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Spool the content of `reader` for `user` under `filename`.
    ///
    /// Nothing is kept when the copy fails: the partial backing file is
    /// removed and its reservation returned. A refused reservation is
    /// reported as [`CacheError::BufferFull`].
    pub async fn add<R>(
        &self,
        user: &str,
        filename: &str,
        reader: &mut R,
    ) -> Result<Arc<CachedEntry>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let (file, path) = self.create_backing_file()?;
        let locator = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .ok_or_else(|| CacheError::Index(format!("unusable cache file name {:?}", path)))?;

        let budget: Arc<dyn WriteBudget> = self.budget.clone();
        let mut writer = LimitWriter::new(fs::File::from_std(file), budget);

        let size = match fill(reader, &mut writer).await {
            Ok(size) => {
                writer.finish();
                size
            }
            Err(e) => {
                let exhausted = writer.is_exhausted();
                writer.free();
                drop(writer);
                if let Err(rm) = fs::remove_file(&path).await {
                    warn!(path = ?path, error = %rm, "Failed to remove partial cache file");
                }
                if exhausted {
                    warn!(user, filename, "Cache full, rejecting file");
                    return Err(CacheError::BufferFull);
                }
                warn!(user, filename, error = %e, "Failed to cache file");
                return Err(e.into());
            }
        };
        drop(writer);

        let record = EntryRecord {
            user: user.to_string(),
            filename: filename.to_string(),
            locator,
            size,
        };

        {
            let mut entries = self.entries.write().await;
            entries.push(record.clone());
            self.save(&entries).await;
        }
        info!(user, filename, locator = %record.locator, size, "Added");

        Ok(Arc::new(CachedEntry::new(self.clone(), record)))
    }

    /// Filenames of live entries belonging to `user`, compared
    /// case-insensitively.
    pub async fn userfiles(&self, user: &str) -> Vec<String> {
        let user = user.to_lowercase();
        self.entries
            .read()
            .await
            .iter()
            .filter(|e| e.user.to_lowercase() == user)
            .map(|e| e.filename.clone())
            .collect()
    }

    /// Handles for every live entry, in submission order
    pub async fn files(&self) -> Vec<Arc<CachedEntry>> {
        self.entries
            .read()
            .await
            .iter()
            .map(|record| Arc::new(CachedEntry::new(self.clone(), record.clone())))
            .collect()
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        CacheStats {
            entries: entries.len(),
            total_size: self.size(),
            max_size: self.max_size(),
        }
    }

    async fn remove(&self, record: &EntryRecord) -> Result<()> {
        let mut entries = self.entries.write().await;

        let removed_file = fs::remove_file(self.cache_dir.join(&record.locator)).await;

        let Some(pos) = entries.iter().position(|e| e.locator == record.locator) else {
            debug!(locator = %record.locator, "Entry already removed");
            return Ok(());
        };
        let removed = entries.remove(pos);
        self.budget.free_bytes(removed.size);
        info!(
            user = %removed.user,
            filename = %removed.filename,
            locator = %removed.locator,
            "Removed"
        );
        self.save(&entries).await;

        if let Err(e) = removed_file {
            warn!(locator = %removed.locator, error = %e, "Remove failed");
            return Err(e.into());
        }
        Ok(())
    }

    async fn load(&self) -> Result<()> {
        let index_path = self.index_path();
        let data = match fs::read(&index_path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!(path = ?index_path, error = %e, "Load error");
                return Err(e.into());
            }
        };
        let records: Vec<EntryRecord> = if data.is_empty() {
            Vec::new()
        } else {
            serde_json::from_slice(&data)?
        };

        let total = records.len();
        let mut survivors = Vec::with_capacity(total);
        let mut size: u64 = 0;
        for record in records {
            if !is_content_name(&record.locator) {
                warn!(locator = %record.locator, "Ignoring entry with invalid locator");
                continue;
            }
            match fs::metadata(self.cache_dir.join(&record.locator)).await {
                Ok(_) => {
                    size += record.size;
                    survivors.push(record);
                }
                Err(e) => {
                    warn!(
                        user = %record.user,
                        filename = %record.filename,
                        error = %e,
                        "Dropping entry without backing file"
                    );
                }
            }
        }

        let referenced: HashSet<&str> = survivors.iter().map(|r| r.locator.as_str()).collect();
        if let Err(e) = self.sweep_orphans(&referenced).await {
            warn!(error = %e, "Failed to sweep orphaned cache files");
        }

        let dropped = total - survivors.len();
        self.budget.reset(size);
        let mut entries = self.entries.write().await;
        *entries = survivors;
        if dropped > 0 {
            self.save(&entries).await;
        }
        info!(bytes = size, files = entries.len(), dropped, "Loaded cache");
        Ok(())
    }

    /// Delete backing files that no live entry refers to.
    async fn sweep_orphans(&self, referenced: &HashSet<&str>) -> io::Result<usize> {
        let mut dir = fs::read_dir(self.cache_dir.as_path()).await?;
        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !is_content_name(name) || referenced.contains(name) {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => {
                    debug!(file = name, "Removed orphaned cache file");
                    removed += 1;
                }
                Err(e) => warn!(file = name, error = %e, "Failed to remove orphaned cache file"),
            }
        }
        if removed > 0 {
            info!(removed, "Swept orphaned cache files");
        }
        Ok(removed)
    }

    /// Persist the index. In-memory state stays authoritative if this fails.
    async fn save(&self, entries: &[EntryRecord]) {
        if let Err(e) = self.write_index(entries).await {
            warn!(error = %e, "Can't save cache index");
        }
    }

    async fn write_index(&self, entries: &[EntryRecord]) -> Result<()> {
        let path = self.index_path();
        if entries.is_empty() {
            return match fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            };
        }
        let json = serde_json::to_vec_pretty(entries)?;
        write_atomic(path, &json).await?;
        Ok(())
    }

    fn create_backing_file(&self) -> io::Result<(std::fs::File, PathBuf)> {
        tempfile::Builder::new()
            .prefix(CONTENT_PREFIX)
            .tempfile_in(self.cache_dir.as_path())?
            .keep()
            .map_err(|e| e.error)
    }

    fn index_path(&self) -> PathBuf {
        self.cache_dir.join(INDEX_FILE_NAME)
    }
}

async fn fill<R>(reader: &mut R, writer: &mut LimitWriter<fs::File>) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let size = tokio::io::copy(reader, writer).await?;
    writer.flush().await?;
    writer.get_mut().sync_all().await?;
    Ok(size)
}

fn is_content_name(name: &str) -> bool {
    name.starts_with(CONTENT_PREFIX) && !name.contains(['/', '\\'])
}

/// Handle to one spooled file
pub struct CachedEntry {
    cache: FileCache,
    record: EntryRecord,
    discarded: AtomicBool,
}

impl CachedEntry {
    fn new(cache: FileCache, record: EntryRecord) -> Self {
        Self {
            cache,
            record,
            discarded: AtomicBool::new(false),
        }
    }

    pub fn record(&self) -> &EntryRecord {
        &self.record
    }

    pub fn path(&self) -> PathBuf {
        self.cache.cache_dir.join(&self.record.locator)
    }
}

impl fmt::Debug for CachedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedEntry")
            .field("record", &self.record)
            .field("discarded", &self.discarded.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl CachedFile for CachedEntry {
    fn user(&self) -> &str {
        &self.record.user
    }

    fn filename(&self) -> &str {
        &self.record.filename
    }

    fn size(&self) -> u64 {
        self.record.size
    }

    async fn open(&self) -> io::Result<Box<dyn AsyncRead + Send + Unpin>> {
        if self.discarded.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "cache entry was discarded",
            ));
        }
        let file = fs::File::open(self.path()).await?;
        Ok(Box::new(file))
    }

    async fn discard(&self) -> Result<()> {
        if self.discarded.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cache.remove(&self.record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, ReadBuf};

    const MIB: u64 = 1024 * 1024;

    /// Yields `remaining` zero bytes, then fails like a dropped client.
    struct FailingReader {
        remaining: usize,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.remaining == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "client went away",
                )));
            }
            let n = self.remaining.min(buf.remaining());
            buf.put_slice(&vec![0u8; n]);
            self.remaining -= n;
            Poll::Ready(Ok(()))
        }
    }

    async fn content_files(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let mut rd = fs::read_dir(dir).await.unwrap();
        while let Some(entry) = rd.next_entry().await.unwrap() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(CONTENT_PREFIX) {
                names.push(name);
            }
        }
        names
    }

    async fn live_sum(cache: &FileCache) -> u64 {
        cache.entries.read().await.iter().map(|e| e.size).sum()
    }

    #[tokio::test]
    async fn test_add_and_read_back() {
        let dir = tempdir().unwrap();
        let cache = FileCache::open(dir.path(), 10 * MIB).await.unwrap();

        let entry = cache
            .add("alice", "notes.txt", &mut &b"Hello, world!"[..])
            .await
            .unwrap();
        assert_eq!(entry.user(), "alice");
        assert_eq!(entry.filename(), "notes.txt");
        assert_eq!(entry.size(), 13);
        assert_eq!(cache.size(), 13);

        let mut content = Vec::new();
        entry
            .open()
            .await
            .unwrap()
            .read_to_end(&mut content)
            .await
            .unwrap();
        assert_eq!(content, b"Hello, world!");
        assert!(dir.path().join(INDEX_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_userfiles_is_case_insensitive() {
        let dir = tempdir().unwrap();
        let cache = FileCache::open(dir.path(), 10 * MIB).await.unwrap();

        cache.add("Alice", "a.txt", &mut &b"a"[..]).await.unwrap();
        cache.add("bob", "b.txt", &mut &b"b"[..]).await.unwrap();
        cache.add("ALICE", "c.txt", &mut &b"c"[..]).await.unwrap();

        assert_eq!(cache.userfiles("alice").await, vec!["a.txt", "c.txt"]);
        assert_eq!(cache.userfiles("Bob").await, vec!["b.txt"]);
        assert!(cache.userfiles("carol").await.is_empty());
    }

    #[tokio::test]
    async fn test_same_name_twice_gives_two_entries() {
        let dir = tempdir().unwrap();
        let cache = FileCache::open(dir.path(), 10 * MIB).await.unwrap();

        let first = cache.add("alice", "a.txt", &mut &b"one"[..]).await.unwrap();
        let second = cache.add("alice", "a.txt", &mut &b"two!"[..]).await.unwrap();

        assert_ne!(first.record().locator, second.record().locator);
        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.size(), 7);
    }

    #[tokio::test]
    async fn test_size_tracks_live_entries() {
        let dir = tempdir().unwrap();
        let cache = FileCache::open(dir.path(), 10 * MIB).await.unwrap();

        let mut live = Vec::new();
        for i in 0..6usize {
            let data = vec![b'x'; 1000 * (i + 1)];
            live.push(cache.add("alice", &format!("{i}.bin"), &mut &data[..]).await.unwrap());
            assert_eq!(cache.size(), live_sum(&cache).await);
        }

        for entry in live.drain(..).step_by(2) {
            entry.discard().await.unwrap();
            assert_eq!(cache.size(), live_sum(&cache).await);
            assert!(cache.size() <= cache.max_size());
        }
        assert_eq!(cache.len().await, 3);
        assert_eq!(cache.size(), 2000 + 4000 + 6000);
    }

    #[tokio::test]
    async fn test_discard_is_single_use() {
        let dir = tempdir().unwrap();
        let cache = FileCache::open(dir.path(), 10 * MIB).await.unwrap();

        let keep = cache.add("alice", "keep.txt", &mut &b"keep"[..]).await.unwrap();
        let entry = cache.add("alice", "gone.txt", &mut &b"gone"[..]).await.unwrap();

        entry.discard().await.unwrap();
        entry.discard().await.unwrap();
        assert_eq!(cache.size(), keep.size());
        assert!(entry.open().await.is_err());
        assert!(!entry.path().exists());
    }

    #[tokio::test]
    async fn test_discarding_last_entry_removes_index() {
        let dir = tempdir().unwrap();
        let cache = FileCache::open(dir.path(), 10 * MIB).await.unwrap();

        let entry = cache.add("alice", "a.txt", &mut &b"abc"[..]).await.unwrap();
        assert!(dir.path().join(INDEX_FILE_NAME).exists());

        entry.discard().await.unwrap();
        assert!(!dir.path().join(INDEX_FILE_NAME).exists());
        assert_eq!(cache.size(), 0);
    }

    #[tokio::test]
    async fn test_failed_read_leaves_nothing_behind() {
        let dir = tempdir().unwrap();
        let cache = FileCache::open(dir.path(), 10 * MIB).await.unwrap();

        let mut reader = FailingReader { remaining: 50_000 };
        let result = cache.add("alice", "broken.bin", &mut reader).await;

        assert!(matches!(result, Err(CacheError::Io(_))));
        assert_eq!(cache.size(), 0);
        assert!(cache.is_empty().await);
        assert!(content_files(dir.path()).await.is_empty());
    }

    #[tokio::test]
    async fn test_reload_restores_entries_in_order() {
        let dir = tempdir().unwrap();
        {
            let cache = FileCache::open(dir.path(), 10 * MIB).await.unwrap();
            cache.add("alice", "1.txt", &mut &b"one"[..]).await.unwrap();
            cache.add("bob", "2.txt", &mut &b"two"[..]).await.unwrap();
            cache.add("alice", "3.txt", &mut &b"three"[..]).await.unwrap();
        }

        let cache = FileCache::open(dir.path(), 10 * MIB).await.unwrap();
        let names: Vec<String> = cache
            .files()
            .await
            .iter()
            .map(|f| f.filename().to_string())
            .collect();
        assert_eq!(names, vec!["1.txt", "2.txt", "3.txt"]);
        assert_eq!(cache.size(), 11);
    }

    #[tokio::test]
    async fn test_reload_drops_entries_with_missing_files() {
        let dir = tempdir().unwrap();
        let doomed_path;
        {
            let cache = FileCache::open(dir.path(), 10 * MIB).await.unwrap();
            cache.add("alice", "keep.txt", &mut &b"keep"[..]).await.unwrap();
            let doomed = cache.add("alice", "lost.txt", &mut &b"lost!!"[..]).await.unwrap();
            doomed_path = doomed.path();
        }
        fs::remove_file(&doomed_path).await.unwrap();

        let cache = FileCache::open(dir.path(), 10 * MIB).await.unwrap();
        assert_eq!(cache.userfiles("alice").await, vec!["keep.txt"]);
        assert_eq!(cache.size(), 4);

        // The rewritten index no longer mentions the lost entry
        let index = fs::read_to_string(dir.path().join(INDEX_FILE_NAME)).await.unwrap();
        assert!(!index.contains("lost.txt"));
    }

    #[tokio::test]
    async fn test_reload_sweeps_orphans_only() {
        let dir = tempdir().unwrap();
        {
            let cache = FileCache::open(dir.path(), 10 * MIB).await.unwrap();
            cache.add("alice", "keep.txt", &mut &b"keep"[..]).await.unwrap();
        }
        fs::write(dir.path().join("cache-orphan123"), b"left over").await.unwrap();
        fs::write(dir.path().join("session.dat"), b"not ours").await.unwrap();

        let cache = FileCache::open(dir.path(), 10 * MIB).await.unwrap();
        assert_eq!(cache.len().await, 1);
        assert!(!dir.path().join("cache-orphan123").exists());
        assert!(dir.path().join("session.dat").exists());
        assert_eq!(content_files(dir.path()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_index_is_a_startup_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(INDEX_FILE_NAME), b"{ definitely not").await.unwrap();

        let result = FileCache::open(dir.path(), 10 * MIB).await;
        assert!(matches!(result, Err(CacheError::Index(_))));
    }

    #[tokio::test]
    async fn test_buffer_full_then_room_after_discard() {
        let dir = tempdir().unwrap();
        let cache = FileCache::open(dir.path(), 12 * MIB).await.unwrap();

        let big = vec![1u8; (10 * MIB) as usize];
        let first = cache.add("alice", "big.bin", &mut &big[..]).await.unwrap();
        assert_eq!(cache.size(), 10 * MIB);

        let medium = vec![2u8; (5 * MIB) as usize];
        let result = cache.add("alice", "medium.bin", &mut &medium[..]).await;
        assert!(matches!(result, Err(CacheError::BufferFull)));
        assert_eq!(cache.size(), 10 * MIB);
        assert_eq!(cache.len().await, 1);
        assert_eq!(content_files(dir.path()).await.len(), 1);

        first.discard().await.unwrap();
        assert_eq!(cache.size(), 0);

        cache.add("alice", "medium.bin", &mut &medium[..]).await.unwrap();
        assert_eq!(cache.size(), 5 * MIB);
    }

    #[tokio::test]
    async fn test_stats() {
        let dir = tempdir().unwrap();
        let cache = FileCache::open(dir.path(), 2 * MIB).await.unwrap();
        cache.add("alice", "a.txt", &mut &b"test data"[..]).await.unwrap();

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.total_size, 9);
        assert_eq!(stats.max_size, 2 * MIB);
    }
}
