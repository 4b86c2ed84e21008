//! Path-prefix overlay.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::VfsResult;
use crate::file::{SeekFrom, VfsFile};
use crate::fs::Vfs;
use crate::types::{DirEntry, FileAttr, OpenFlags};

/// Rewrites every path by prepending a fixed root before delegating to the
/// wrapped filesystem.
///
/// Useful for carving independent subtrees out of one backend, e.g. the
/// two tiers of a cache overlay sharing a single disk.
#[derive(Debug)]
pub struct PrefixFs {
    inner: Arc<dyn Vfs>,
    prefix: PathBuf,
}

impl PrefixFs {
    /// Wrap `inner`, rooting all paths at `prefix`.
    pub fn new(inner: Arc<dyn Vfs>, prefix: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
        }
    }

    fn full(&self, path: &Path) -> PathBuf {
        let rel = path.strip_prefix("/").unwrap_or(path);
        self.prefix.join(rel)
    }

    fn wrap(&self, inner: Box<dyn VfsFile>, rel: &Path) -> Box<dyn VfsFile> {
        Box::new(PrefixFile {
            inner,
            rel: rel.to_path_buf(),
        })
    }
}

#[async_trait]
impl Vfs for PrefixFs {
    fn name(&self) -> &str {
        "prefix"
    }

    async fn open_with(
        &self,
        path: &Path,
        flags: OpenFlags,
        mode: u32,
    ) -> VfsResult<Box<dyn VfsFile>> {
        let inner = self.inner.open_with(&self.full(path), flags, mode).await?;
        Ok(self.wrap(inner, path))
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> VfsResult<()> {
        self.inner.mkdir(&self.full(path), mode).await
    }

    async fn mkdir_all(&self, path: &Path, mode: u32) -> VfsResult<()> {
        self.inner.mkdir_all(&self.full(path), mode).await
    }

    async fn remove(&self, path: &Path) -> VfsResult<()> {
        self.inner.remove(&self.full(path)).await
    }

    async fn remove_all(&self, path: &Path) -> VfsResult<()> {
        self.inner.remove_all(&self.full(path)).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> VfsResult<()> {
        self.inner.rename(&self.full(from), &self.full(to)).await
    }

    async fn stat(&self, path: &Path) -> VfsResult<FileAttr> {
        self.inner.stat(&self.full(path)).await
    }

    async fn chmod(&self, path: &Path, mode: u32) -> VfsResult<()> {
        self.inner.chmod(&self.full(path), mode).await
    }

    async fn chtimes(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> VfsResult<()> {
        self.inner.chtimes(&self.full(path), atime, mtime).await
    }
}

/// Handle wrapper that reports caller-relative paths.
#[derive(Debug)]
struct PrefixFile {
    inner: Box<dyn VfsFile>,
    rel: PathBuf,
}

#[async_trait]
impl VfsFile for PrefixFile {
    fn path(&self) -> &Path {
        &self.rel
    }

    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        self.inner.read(buf).await
    }

    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        self.inner.read_at(buf, offset).await
    }

    async fn write(&mut self, data: &[u8]) -> VfsResult<usize> {
        self.inner.write(data).await
    }

    async fn write_at(&mut self, data: &[u8], offset: u64) -> VfsResult<usize> {
        self.inner.write_at(data, offset).await
    }

    async fn seek(&mut self, pos: SeekFrom) -> VfsResult<u64> {
        self.inner.seek(pos).await
    }

    async fn stat(&mut self) -> VfsResult<FileAttr> {
        self.inner.stat().await
    }

    async fn sync(&mut self) -> VfsResult<()> {
        self.inner.sync().await
    }

    async fn truncate(&mut self, size: u64) -> VfsResult<()> {
        self.inner.truncate(size).await
    }

    async fn readdir(&mut self, count: Option<usize>) -> VfsResult<Vec<DirEntry>> {
        self.inner.readdir(count).await
    }

    async fn close(&mut self) -> VfsResult<()> {
        self.inner.close().await
    }

    fn can_mmap(&self) -> bool {
        self.inner.can_mmap()
    }

    async fn mmap(&mut self, offset: u64, len: usize) -> VfsResult<Vec<u8>> {
        self.inner.mmap(offset, len).await
    }

    async fn munmap(&mut self) -> VfsResult<()> {
        self.inner.munmap().await
    }
}
