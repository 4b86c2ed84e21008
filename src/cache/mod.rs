//! Size-bounded, last-access-ordered cache overlay.
//!
//! [`SizeCacheFs`] layers a fast, bounded *cache* tier over a slow,
//! authoritative *base* tier. Reads are served from the cache after
//! demand-population; mutations are written through to base and reflected
//! in the cache. A byte budget is enforced by evicting the least recently
//! used files, and open files are pinned against eviction by detaching
//! their index entry for the life of the handle.

mod file;
mod index;

pub use index::{CacheEntry, INDEX_FILE};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use crate::error::{VfsError, VfsResult};
use crate::file::VfsFile;
use crate::fs::Vfs;
use crate::types::{FileAttr, OpenFlags};
use crate::util;

use file::SizeCacheFile;
use index::CacheIndex;

/// Classification of a path against both tiers.
#[derive(Debug)]
enum CacheStatus {
    /// Cached and current; carries the cache tier's attributes.
    Hit(FileAttr),
    /// Cached but absent from base; carries the cache tier's attributes.
    Local(FileAttr),
    /// Cached but base is newer (or the TTL elapsed); carries base's
    /// attributes.
    Stale(FileAttr),
    /// Not cached.
    Miss,
}

/// State shared between the overlay and its open handles.
///
/// The mutex guards the index (and with it `current_size`); tier I/O never
/// runs under it.
#[derive(Debug)]
pub(crate) struct CacheShared {
    base: Arc<dyn Vfs>,
    cache: Arc<dyn Vfs>,
    capacity: u64,
    ttl: Duration,
    index: Mutex<CacheIndex>,
}

impl CacheShared {
    pub(crate) fn cache_fs(&self) -> &dyn Vfs {
        &*self.cache
    }

    /// Remove the entry for `path` from the index, pinning it against
    /// eviction. The caller keeps the entry on its handle.
    fn detach(&self, path: &Path) -> Option<CacheEntry> {
        self.index.lock().remove(path)
    }

    /// Put an entry back without going through admission. Used to undo a
    /// detach when an open fails partway, and to land a re-keyed entry
    /// once a tier rename has completed.
    fn reattach(&self, entry: CacheEntry) {
        self.index.lock().insert(entry);
    }

    async fn status(&self, path: &Path) -> VfsResult<CacheStatus> {
        let cache_attr = match self.cache.stat(path).await {
            Ok(a) => a,
            Err(e) if e.is_not_found() => return Ok(CacheStatus::Miss),
            Err(e) => return Err(e),
        };
        let base_attr = match self.base.stat(path).await {
            Ok(a) => a,
            Err(e) if e.is_not_found() => return Ok(CacheStatus::Local(cache_attr)),
            Err(e) => return Err(e),
        };
        if base_attr.mtime > cache_attr.mtime {
            return Ok(CacheStatus::Stale(base_attr));
        }
        if !self.ttl.is_zero() && cache_attr.mtime + self.ttl < SystemTime::now() {
            return Ok(CacheStatus::Stale(base_attr));
        }
        Ok(CacheStatus::Hit(cache_attr))
    }

    /// Stream a base file into the cache tier and build its entry.
    ///
    /// Any failure cleans up the partial cache file; the index is left
    /// untouched so a retry sees MISS again.
    async fn copy_to_cache(&self, path: &Path) -> VfsResult<CacheEntry> {
        debug!(path = %path.display(), "populating cache tier from base");
        let mut bfh = self
            .base
            .open(path)
            .await
            .map_err(|e| e.context("error opening base file"))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !util::exists(&*self.cache, parent).await? {
                self.cache.mkdir_all(parent, 0o777).await?;
            }
        }

        let mut lfh = match self.cache.create(path).await {
            Ok(f) => f,
            Err(e) => {
                let _ = bfh.close().await;
                return Err(e);
            }
        };

        let copied = match util::copy(&mut *bfh, &mut *lfh).await {
            Ok(n) => n,
            Err(e) => {
                let _ = lfh.close().await;
                let _ = bfh.close().await;
                let _ = self.cache.remove(path).await;
                return Err(e.context("error copying base file to cache"));
            }
        };

        let base_attr = match bfh.stat().await {
            Ok(a) => a,
            Err(e) => {
                let _ = lfh.close().await;
                let _ = bfh.close().await;
                let _ = self.cache.remove(path).await;
                return Err(e.context("error getting base file stat"));
            }
        };
        if base_attr.size != copied {
            let _ = lfh.close().await;
            let _ = bfh.close().await;
            let _ = self.cache.remove(path).await;
            return Err(VfsError::other(format!(
                "error copying base file to cache: copied {copied} of {} bytes",
                base_attr.size
            )));
        }

        if let Err(e) = lfh.close().await {
            let _ = bfh.close().await;
            let _ = self.cache.remove(path).await;
            return Err(e.context("error closing cache file"));
        }
        bfh.close()
            .await
            .map_err(|e| e.context("error closing base file"))?;

        // carry base's mtime so staleness comparisons keep working
        self.cache
            .chtimes(path, base_attr.mtime, base_attr.mtime)
            .await
            .map_err(|e| e.context("error setting cache file times"))?;

        Ok(CacheEntry::new(path, base_attr.size, util::now_micros()))
    }

    /// Admit an entry, evicting least-recently-used files until it fits.
    ///
    /// Victim selection happens under the index lock; tier removals and
    /// directory GC run with it released. A failed removal re-inserts the
    /// victim with its score intact and surfaces the error.
    pub(crate) async fn admit(&self, entry: CacheEntry) -> VfsResult<()> {
        {
            let mut index = self.index.lock();
            index.remove(&entry.path);
        }

        if self.capacity == 0 {
            // a zero-capacity cache admits nothing and keeps the tier empty
            match self.cache.remove(&entry.path).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.context("error removing cache file")),
            }
            self.gc_parents(&entry.path).await?;
            return Ok(());
        }

        loop {
            let victim = {
                let mut index = self.index.lock();
                if index.current_size() == 0
                    || index.current_size() + entry.size <= self.capacity
                {
                    index.insert(entry);
                    return Ok(());
                }
                match index.pop_min() {
                    Some(victim) => victim,
                    None => {
                        index.insert(entry);
                        return Ok(());
                    }
                }
            };

            debug!(
                path = %victim.path.display(),
                size = victim.size,
                "evicting least recently used cache file"
            );
            match self.cache.remove(&victim.path).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    self.index.lock().insert(victim);
                    return Err(e.context("error removing cache file"));
                }
            }
            self.gc_parents(&victim.path).await?;
        }
    }

    /// Remove ancestor directories of `path` from the cache tier while
    /// they are empty, stopping at the first non-empty one or the root.
    async fn gc_parents(&self, path: &Path) -> VfsResult<()> {
        let mut current = path.parent().map(Path::to_path_buf);
        while let Some(dir) = current {
            if dir.as_os_str().is_empty() || dir == Path::new("/") {
                break;
            }
            let mut handle = match self.cache.open(&dir).await {
                Ok(h) => h,
                Err(e) if e.is_not_found() => {
                    current = dir.parent().map(Path::to_path_buf);
                    continue;
                }
                Err(e) => return Err(e.context("error opening parent directory")),
            };
            let listing = handle.readdir(None).await;
            let _ = handle.close().await;
            let entries = listing.map_err(|e| e.context("error reading parent directory"))?;

            if entries.is_empty() {
                self.cache
                    .remove(&dir)
                    .await
                    .map_err(|e| e.context("error removing parent directory"))?;
                current = dir.parent().map(Path::to_path_buf);
            } else {
                break;
            }
        }
        Ok(())
    }
}

/// Size-bounded cache overlay over two filesystems.
///
/// `base` is authoritative and unbounded; `cache` holds hot copies plus
/// the [`INDEX_FILE`] sentinel and never grows past `capacity` bytes at
/// quiescence (open handles may exceed it until they close). A zero `ttl`
/// disables time-based staleness; cached files still refresh when base has
/// a newer modification time.
#[derive(Debug)]
pub struct SizeCacheFs {
    shared: Arc<CacheShared>,
}

impl SizeCacheFs {
    /// Build the overlay, reconstructing the index from the cache tier.
    ///
    /// A persisted [`INDEX_FILE`] is loaded when present and valid;
    /// otherwise the index is rebuilt by walking the cache tier. Loaded
    /// entries whose cache file is gone are dropped, and cache files the
    /// persisted index does not know about are adopted with their mtime as
    /// the access timestamp.
    pub async fn new(
        base: Arc<dyn Vfs>,
        cache: Arc<dyn Vfs>,
        capacity: u64,
        ttl: Duration,
    ) -> VfsResult<Self> {
        let index_path = Path::new(INDEX_FILE);
        let have_index = util::exists(&*cache, index_path)
            .await
            .map_err(|e| e.context("error determining if cache index exists"))?;

        let mut persisted: Option<Vec<CacheEntry>> = None;
        if have_index {
            let data = util::read_all(&*cache, index_path)
                .await
                .map_err(|e| e.context("error reading cache index"))?;
            match serde_json::from_slice::<Vec<CacheEntry>>(&data) {
                Ok(list) => persisted = Some(list),
                Err(err) => {
                    warn!(%err, "cache index is corrupt, rebuilding from cache tier walk");
                }
            }
        }

        let mut index = CacheIndex::new();
        match persisted {
            Some(list) => {
                for entry in list {
                    match cache.stat(&entry.path).await {
                        Ok(_) => index.insert(entry),
                        Err(e) if e.is_not_found() => {
                            debug!(
                                path = %entry.path.display(),
                                "dropping index entry with no cache file"
                            );
                        }
                        Err(e) => return Err(e),
                    }
                }
                for (path, attr) in util::walk(&*cache, Path::new(""))
                    .await
                    .map_err(|e| e.context("error walking cache tier"))?
                {
                    if attr.is_dir() || path.as_path() == index_path || index.contains(&path) {
                        continue;
                    }
                    index.insert(CacheEntry::new(
                        path,
                        attr.size,
                        util::unix_micros(attr.mtime),
                    ));
                }
            }
            None => {
                for (path, attr) in util::walk(&*cache, Path::new(""))
                    .await
                    .map_err(|e| e.context("error building cache index"))?
                {
                    if attr.is_dir() || path.as_path() == index_path {
                        continue;
                    }
                    index.insert(CacheEntry::new(
                        path,
                        attr.size,
                        util::unix_micros(attr.mtime),
                    ));
                }
            }
        }

        debug!(
            entries = index.len(),
            current_size = index.current_size(),
            capacity,
            "cache index ready"
        );

        Ok(Self {
            shared: Arc::new(CacheShared {
                base,
                cache,
                capacity,
                ttl,
                index: Mutex::new(index),
            }),
        })
    }

    /// Sum of the sizes of all indexed (non-pinned) entries.
    pub fn current_size(&self) -> u64 {
        self.shared.index.lock().current_size()
    }

    /// The configured byte budget.
    pub fn capacity(&self) -> u64 {
        self.shared.capacity
    }

    /// Whether `path` is currently indexed. Open (pinned) files are not.
    pub fn is_cached(&self, path: &Path) -> bool {
        self.shared.index.lock().contains(path)
    }

    /// Persist the index to [`INDEX_FILE`] in the cache tier.
    ///
    /// Callers are expected to close their handles first; entries pinned
    /// by still-open handles are not serialized.
    pub async fn close(&self) -> VfsResult<()> {
        let entries = self.shared.index.lock().entries();
        let data = serde_json::to_vec(&entries)
            .map_err(|e| VfsError::other(format!("error serializing cache index: {e}")))?;
        util::write_all(&*self.shared.cache, Path::new(INDEX_FILE), &data)
            .await
            .map_err(|e| e.context("error writing cache index"))
    }

    /// Directory opens bypass pinning entirely; enumeration is served by
    /// the base tier (cache tier for LOCAL directories).
    async fn open_dir(&self, path: &Path) -> VfsResult<Box<dyn VfsFile>> {
        match self.shared.base.open(path).await {
            Ok(h) => Ok(h),
            Err(e) if e.is_not_found() => self.shared.cache.open(path).await,
            Err(e) => Err(e),
        }
    }

    /// Undo a detach after a failed open, provided the cache copy still
    /// exists.
    async fn restore_pinned(&self, pinned: Option<CacheEntry>) {
        if let Some(entry) = pinned {
            if util::exists(&*self.shared.cache, &entry.path)
                .await
                .unwrap_or(false)
            {
                self.shared.reattach(entry);
            }
        }
    }

    async fn open_read_inner(
        &self,
        path: &Path,
        pinned: Option<CacheEntry>,
    ) -> VfsResult<Box<dyn VfsFile>> {
        let entry = match self.shared.status(path).await? {
            CacheStatus::Hit(attr) | CacheStatus::Local(attr) => {
                if attr.is_dir() {
                    return self.open_dir(path).await;
                }
                match pinned {
                    Some(entry) => entry,
                    None => CacheEntry::new(path, attr.size, util::now_micros()),
                }
            }
            CacheStatus::Stale(base_attr) => {
                if base_attr.is_dir() {
                    return self.open_dir(path).await;
                }
                self.shared.copy_to_cache(path).await?
            }
            CacheStatus::Miss => {
                let base_attr = self.shared.base.stat(path).await?;
                if base_attr.is_dir() {
                    return self.open_dir(path).await;
                }
                self.shared.copy_to_cache(path).await?
            }
        };

        let base = match self.shared.base.open(path).await {
            Ok(h) => Some(h),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.context("error opening base file")),
        };
        let cache = self.shared.cache.open(path).await?;

        Ok(Box::new(SizeCacheFile::new(
            Arc::clone(&self.shared),
            path.to_path_buf(),
            base,
            cache,
            OpenFlags::read(),
            entry,
        )))
    }

    async fn open_with_inner(
        &self,
        path: &Path,
        flags: OpenFlags,
        mode: u32,
        pinned: Option<CacheEntry>,
    ) -> VfsResult<Box<dyn VfsFile>> {
        let entry = match self.shared.status(path).await? {
            CacheStatus::Hit(attr) | CacheStatus::Local(attr) => {
                if attr.is_dir() {
                    return self.open_dir(path).await;
                }
                match pinned {
                    Some(entry) => entry,
                    None => CacheEntry::new(path, attr.size, util::now_micros()),
                }
            }
            CacheStatus::Stale(base_attr) => {
                if base_attr.is_dir() {
                    return self.open_dir(path).await;
                }
                self.shared.copy_to_cache(path).await?
            }
            CacheStatus::Miss => match self.shared.base.stat(path).await {
                Ok(base_attr) => {
                    if base_attr.is_dir() {
                        return self.open_dir(path).await;
                    }
                    self.shared.copy_to_cache(path).await?
                }
                // creation path: the base open below decides whether the
                // flags allow bringing the file into existence
                Err(e) if e.is_not_found() => CacheEntry::new(path, 0, util::now_micros()),
                Err(e) => return Err(e),
            },
        };

        // the cache handle is forced read-write whenever any write flag is
        // present so sync can re-read it
        let cache_flags = if flags.wants_write() {
            flags.force_read_write()
        } else {
            flags
        };

        let base = self.shared.base.open_with(path, flags, mode).await?;
        let cache = match self.shared.cache.open_with(path, cache_flags, mode).await {
            Ok(f) => f,
            Err(e) => {
                let mut base = base;
                let _ = base.close().await;
                return Err(e);
            }
        };

        Ok(Box::new(SizeCacheFile::new(
            Arc::clone(&self.shared),
            path.to_path_buf(),
            Some(base),
            cache,
            flags,
            entry,
        )))
    }
}

#[async_trait]
impl Vfs for SizeCacheFs {
    fn name(&self) -> &str {
        "sizecache"
    }

    async fn open(&self, path: &Path) -> VfsResult<Box<dyn VfsFile>> {
        // detach first so the entry cannot be evicted while opening
        let pinned = self.shared.detach(path);
        match self.open_read_inner(path, pinned.clone()).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.restore_pinned(pinned).await;
                Err(e)
            }
        }
    }

    async fn open_with(
        &self,
        path: &Path,
        flags: OpenFlags,
        mode: u32,
    ) -> VfsResult<Box<dyn VfsFile>> {
        let pinned = self.shared.detach(path);
        match self.open_with_inner(path, flags, mode, pinned.clone()).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.restore_pinned(pinned).await;
                Err(e)
            }
        }
    }

    async fn create(&self, path: &Path) -> VfsResult<Box<dyn VfsFile>> {
        let base = self.shared.base.create(path).await?;
        let cache = match self.shared.cache.create(path).await {
            Ok(f) => f,
            Err(e) => {
                let mut base = base;
                let _ = base.close().await;
                return Err(e);
            }
        };

        // make sure the path is pinned out of the index for the open window
        let _ = self.shared.detach(path);
        let entry = CacheEntry::new(path, 0, util::now_micros());

        Ok(Box::new(SizeCacheFile::new(
            Arc::clone(&self.shared),
            path.to_path_buf(),
            Some(base),
            cache,
            OpenFlags::create_truncate(),
            entry,
        )))
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> VfsResult<()> {
        self.shared.base.mkdir(path, mode).await?;
        // the cache tier may be missing intermediate directories
        self.shared.cache.mkdir_all(path, mode).await
    }

    async fn mkdir_all(&self, path: &Path, mode: u32) -> VfsResult<()> {
        self.shared.base.mkdir_all(path, mode).await?;
        self.shared.cache.mkdir_all(path, mode).await
    }

    async fn remove(&self, path: &Path) -> VfsResult<()> {
        let in_cache = util::exists(&*self.shared.cache, path)
            .await
            .map_err(|e| e.context("error determining if file exists"))?;
        if in_cache {
            self.shared
                .cache
                .remove(path)
                .await
                .map_err(|e| e.context("error removing cache file"))?;
            let _ = self.shared.detach(path);
        }
        self.shared.base.remove(path).await
    }

    async fn remove_all(&self, path: &Path) -> VfsResult<()> {
        let in_cache = util::exists(&*self.shared.cache, path).await?;
        if in_cache {
            for (file_path, attr) in util::walk(&*self.shared.cache, path).await? {
                if !attr.is_dir() {
                    self.remove(&file_path).await?;
                }
            }
            let _ = self.shared.cache.remove_all(path).await;
        }
        self.shared.base.remove_all(path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> VfsResult<()> {
        let in_cache = util::exists(&*self.shared.cache, from).await?;
        if in_cache {
            // hold the entry detached across the tier rename so the index
            // never names a path whose cache file does not exist yet
            let pinned = self.shared.detach(from);
            match self.shared.cache.rename(from, to).await {
                Ok(()) => {
                    if let Some(mut entry) = pinned {
                        // the entry keeps its timestamp under the new key
                        entry.path = to.to_path_buf();
                        self.shared.reattach(entry);
                    }
                }
                Err(e) => {
                    if let Some(entry) = pinned {
                        self.shared.reattach(entry);
                    }
                    return Err(e);
                }
            }
        }
        self.shared.base.rename(from, to).await
    }

    async fn stat(&self, path: &Path) -> VfsResult<FileAttr> {
        // base is authoritative for size and mtime; the cache may be behind
        self.shared.base.stat(path).await
    }

    async fn chmod(&self, path: &Path, mode: u32) -> VfsResult<()> {
        if util::exists(&*self.shared.cache, path).await? {
            let _ = self.shared.cache.chmod(path, mode).await;
        }
        self.shared.base.chmod(path, mode).await
    }

    async fn chtimes(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> VfsResult<()> {
        if util::exists(&*self.shared.cache, path).await? {
            let _ = self.shared.cache.chtimes(path, atime, mtime).await;
        }
        self.shared.base.chtimes(path, atime, mtime).await
    }
}
