//! The filesystem contract.

use async_trait::async_trait;
use std::path::Path;
use std::time::SystemTime;

use crate::error::VfsResult;
use crate::file::VfsFile;
use crate::types::{FileAttr, OpenFlags};

/// A filesystem.
///
/// Every backend and every overlay implements this trait; values are
/// shared as `Arc<dyn Vfs>` and must be safe under concurrent invocation
/// of all operations. Paths are relative to the filesystem's root; a
/// leading `/` is tolerated and ignored.
///
/// `open` and `create` are flag shorthands over
/// [`open_with`](Vfs::open_with): read-only, and create-or-truncate with
/// read-write access, respectively.
#[async_trait]
pub trait Vfs: Send + Sync + std::fmt::Debug {
    /// Name of this filesystem, for diagnostics.
    fn name(&self) -> &str;

    /// Open with explicit flags and, for newly created files, unix mode.
    async fn open_with(
        &self,
        path: &Path,
        flags: OpenFlags,
        mode: u32,
    ) -> VfsResult<Box<dyn VfsFile>>;

    /// Open read-only. Directories open read-only for enumeration.
    async fn open(&self, path: &Path) -> VfsResult<Box<dyn VfsFile>> {
        self.open_with(path, OpenFlags::read(), 0).await
    }

    /// Create (or truncate) a file with read-write access.
    async fn create(&self, path: &Path) -> VfsResult<Box<dyn VfsFile>> {
        self.open_with(path, OpenFlags::create_truncate(), 0o666)
            .await
    }

    /// Create a directory.
    async fn mkdir(&self, path: &Path, mode: u32) -> VfsResult<()>;

    /// Create a directory and any missing ancestors.
    async fn mkdir_all(&self, path: &Path, mode: u32) -> VfsResult<()>;

    /// Remove a file or an empty directory.
    async fn remove(&self, path: &Path) -> VfsResult<()>;

    /// Remove a path and everything under it. Missing paths are not an
    /// error.
    async fn remove_all(&self, path: &Path) -> VfsResult<()>;

    /// Rename a file or directory, replacing any existing destination.
    async fn rename(&self, from: &Path, to: &Path) -> VfsResult<()>;

    /// Metadata for a path.
    async fn stat(&self, path: &Path) -> VfsResult<FileAttr>;

    /// Change permissions.
    async fn chmod(&self, path: &Path, mode: u32) -> VfsResult<()>;

    /// Change access and modification times.
    async fn chtimes(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> VfsResult<()>;
}
