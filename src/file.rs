//! The file handle contract.

use async_trait::async_trait;
use std::path::Path;

use crate::error::{VfsError, VfsResult};
use crate::types::{DirEntry, FileAttr};

pub use std::io::SeekFrom;

/// An open file handle.
///
/// Handles are owned by the caller and closed explicitly; [`close`] is
/// where overlays run their bookkeeping, so dropping a handle unclosed
/// skips that work silently. A closed handle answers every operation with
/// [`VfsError::Closed`].
///
/// Implementations may refuse operations they cannot support with
/// [`VfsError::PermissionDenied`] (the compression overlay refuses random
/// access, for example). Memory mapping is a capability: callers must
/// check [`can_mmap`] and never assume it.
///
/// [`close`]: VfsFile::close
/// [`can_mmap`]: VfsFile::can_mmap
#[async_trait]
pub trait VfsFile: Send + std::fmt::Debug {
    /// The path this handle was opened with.
    fn path(&self) -> &Path;

    /// Read up to `buf.len()` bytes at the current position.
    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize>;

    /// Read at the given offset without moving the cursor.
    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> VfsResult<usize>;

    /// Write at the current position (or the end, for append handles).
    async fn write(&mut self, data: &[u8]) -> VfsResult<usize>;

    /// Write at the given offset without moving the cursor.
    async fn write_at(&mut self, data: &[u8], offset: u64) -> VfsResult<usize>;

    /// Reposition the cursor.
    async fn seek(&mut self, pos: SeekFrom) -> VfsResult<u64>;

    /// Current metadata for the open file.
    async fn stat(&mut self) -> VfsResult<FileAttr>;

    /// Flush buffered writes to the backing store.
    async fn sync(&mut self) -> VfsResult<()>;

    /// Truncate or extend to `size` bytes.
    async fn truncate(&mut self, size: u64) -> VfsResult<()>;

    /// Read directory entries. `Some(n)` returns at most `n` entries and
    /// advances an internal cursor across calls; `None` returns everything
    /// remaining.
    async fn readdir(&mut self, count: Option<usize>) -> VfsResult<Vec<DirEntry>>;

    /// Like [`readdir`](VfsFile::readdir), names only.
    async fn readdir_names(&mut self, count: Option<usize>) -> VfsResult<Vec<String>> {
        let entries = self.readdir(count).await?;
        Ok(entries.into_iter().map(|e| e.name).collect())
    }

    /// Close the handle. Further operations fail with *already-closed*.
    async fn close(&mut self) -> VfsResult<()>;

    /// Whether this handle supports memory mapping.
    fn can_mmap(&self) -> bool {
        false
    }

    /// Map `len` bytes starting at `offset`.
    async fn mmap(&mut self, offset: u64, len: usize) -> VfsResult<Vec<u8>> {
        let _ = (offset, len);
        Err(VfsError::permission_denied(format!(
            "mmap not supported: {}",
            self.path().display()
        )))
    }

    /// Release a mapping created by [`mmap`](VfsFile::mmap).
    async fn munmap(&mut self) -> VfsResult<()> {
        Err(VfsError::permission_denied(format!(
            "mmap not supported: {}",
            self.path().display()
        )))
    }
}
