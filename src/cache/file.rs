//! The two-tier file handle returned by the cache overlay.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::index::CacheEntry;
use crate::cache::CacheShared;
use crate::error::{VfsError, VfsResult};
use crate::file::{SeekFrom, VfsFile};
use crate::types::{DirEntry, FileAttr, OpenFlags};
use crate::util;

/// A handle backed by one file in each tier.
///
/// Reads, seeks, positional I/O, stat and truncate target the cache file;
/// directory enumeration targets the base file. The base copy is refreshed
/// by restreaming the whole cache file on `sync` and on `close`.
///
/// While the handle is open its entry is detached from the overlay's index
/// (pinned); `close` re-attaches it through admission with the final size
/// and a fresh timestamp, which may evict other entries.
#[derive(Debug)]
pub(crate) struct SizeCacheFile {
    shared: Arc<CacheShared>,
    path: PathBuf,
    // absent when the base tier lost the file behind our back
    base: Option<Box<dyn VfsFile>>,
    cache: Option<Box<dyn VfsFile>>,
    flags: OpenFlags,
    entry: CacheEntry,
    closed: bool,
}

impl SizeCacheFile {
    pub(crate) fn new(
        shared: Arc<CacheShared>,
        path: PathBuf,
        base: Option<Box<dyn VfsFile>>,
        cache: Box<dyn VfsFile>,
        flags: OpenFlags,
        entry: CacheEntry,
    ) -> Self {
        Self {
            shared,
            path,
            base,
            cache: Some(cache),
            flags,
            entry,
            closed: false,
        }
    }

    fn check_open(&self) -> VfsResult<()> {
        if self.closed {
            Err(VfsError::closed(self.path.display().to_string()))
        } else {
            Ok(())
        }
    }

    fn cache_mut(&mut self) -> VfsResult<&mut Box<dyn VfsFile>> {
        let path = self.path.display().to_string();
        self.cache.as_mut().ok_or(VfsError::Closed(path))
    }

    /// Replace the base file's content with the cache file's, preserving
    /// the cache cursor.
    async fn restream_to_base(&mut self) -> VfsResult<()> {
        let (Some(cache), Some(base)) = (self.cache.as_mut(), self.base.as_mut()) else {
            return Ok(());
        };
        base.truncate(0)
            .await
            .map_err(|e| e.context("error truncating base file"))?;
        base.seek(SeekFrom::Start(0))
            .await
            .map_err(|e| e.context("error seeking base file to start"))?;
        let pos = cache
            .seek(SeekFrom::Current(0))
            .await
            .map_err(|e| e.context("error getting cache file position"))?;
        cache
            .seek(SeekFrom::Start(0))
            .await
            .map_err(|e| e.context("error seeking cache file to start"))?;
        util::copy(&mut **cache, &mut **base)
            .await
            .map_err(|e| e.context("error copying cache file to base"))?;
        cache
            .seek(SeekFrom::Start(pos))
            .await
            .map_err(|e| e.context("error restoring cache file position"))?;
        base.sync()
            .await
            .map_err(|e| e.context("error syncing base file"))?;
        Ok(())
    }
}

#[async_trait]
impl VfsFile for SizeCacheFile {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        self.check_open()?;
        self.cache_mut()?.read(buf).await
    }

    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        self.check_open()?;
        self.cache_mut()?.read_at(buf, offset).await
    }

    async fn write(&mut self, data: &[u8]) -> VfsResult<usize> {
        self.check_open()?;
        self.cache_mut()?.write(data).await
    }

    async fn write_at(&mut self, data: &[u8], offset: u64) -> VfsResult<usize> {
        self.check_open()?;
        self.cache_mut()?.write_at(data, offset).await
    }

    async fn seek(&mut self, pos: SeekFrom) -> VfsResult<u64> {
        self.check_open()?;
        self.cache_mut()?.seek(pos).await
    }

    async fn stat(&mut self) -> VfsResult<FileAttr> {
        self.check_open()?;
        self.cache_mut()?.stat().await
    }

    async fn sync(&mut self) -> VfsResult<()> {
        self.check_open()?;
        if !self.flags.wants_write() {
            return Ok(());
        }
        self.restream_to_base().await
    }

    async fn truncate(&mut self, size: u64) -> VfsResult<()> {
        self.check_open()?;
        self.cache_mut()?.truncate(size).await
    }

    async fn readdir(&mut self, count: Option<usize>) -> VfsResult<Vec<DirEntry>> {
        self.check_open()?;
        match self.base.as_mut() {
            Some(base) => base.readdir(count).await,
            None => self.cache_mut()?.readdir(count).await,
        }
    }

    async fn close(&mut self) -> VfsResult<()> {
        self.check_open()?;
        self.closed = true;
        let mut first_err: Option<VfsError> = None;

        if self.flags.wants_write() {
            if let Err(e) = self.restream_to_base().await {
                first_err = Some(e.context("error syncing to base file"));
            }
        }

        // final size and mtime come from base, the authoritative tier
        let stat_result = match self.base.as_mut() {
            Some(base) => base.stat().await,
            None => match self.cache.as_mut() {
                Some(cache) => cache.stat().await,
                None => Err(VfsError::closed(self.path.display().to_string())),
            },
        };
        let final_attr = match stat_result {
            Ok(attr) => Some(attr),
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(e.context("error getting base file stat"));
                }
                None
            }
        };

        if let Some(mut cache) = self.cache.take() {
            if let Err(e) = cache.close().await {
                if first_err.is_none() {
                    first_err = Some(e.context("error closing cache file"));
                }
            }
        }
        if let Some(mut base) = self.base.take() {
            if let Err(e) = base.close().await {
                if first_err.is_none() {
                    first_err = Some(e.context("error closing base file"));
                }
            }
        }

        if let Some(attr) = final_attr {
            // keep staleness comparisons meaningful across restarts
            let _ = self
                .shared
                .cache_fs()
                .chtimes(&self.path, attr.mtime, attr.mtime)
                .await;

            let mut entry = self.entry.clone();
            entry.size = attr.size;
            entry.last_access_time = util::now_micros();
            if let Err(e) = self.shared.admit(entry).await {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
