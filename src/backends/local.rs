//! Local filesystem backend.
//!
//! All operations are relative to `root`, with path security to prevent
//! escaping it.

use async_trait::async_trait;
use filetime::FileTime;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{VfsError, VfsResult};
use crate::file::{SeekFrom, VfsFile};
use crate::fs::Vfs;
use crate::types::{DirEntry, FileAttr, FileType, OpenFlags};

/// Local filesystem rooted at a directory.
///
/// For example, with `root` at `/srv/data`, `open("logs/app.txt")` reads
/// `/srv/data/logs/app.txt`. Attempts to escape the root resolve back
/// inside it or fail with [`VfsError::PathEscapesRoot`].
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    /// Create a new local filesystem rooted at the given path.
    ///
    /// The root is canonicalized at construction time to handle symlinks
    /// (e.g. macOS `/tmp` → `/private/tmp`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root: PathBuf = root.into();
        let root = root.canonicalize().unwrap_or(root);
        Self { root }
    }

    /// Get the root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Normalize a relative path: drop the leading `/`, resolve `.` and
    /// `..` without ever climbing above the root.
    fn normalize(path: &Path) -> PathBuf {
        let mut result = PathBuf::new();
        for component in path.components() {
            match component {
                std::path::Component::RootDir => {}
                std::path::Component::CurDir => {}
                std::path::Component::ParentDir => {
                    result.pop();
                }
                std::path::Component::Normal(s) => {
                    result.push(s);
                }
                std::path::Component::Prefix(_) => {}
            }
        }
        result
    }

    /// Resolve a relative path to an absolute path within the root.
    ///
    /// Existing paths are canonicalized so a symlink cannot smuggle the
    /// operation outside the root.
    async fn resolve(&self, path: &Path) -> VfsResult<PathBuf> {
        let rel = Self::normalize(path);
        if rel.as_os_str().is_empty() {
            return Ok(self.root.clone());
        }
        let full = self.root.join(&rel);

        if let Ok(canonical) = fs::canonicalize(&full).await {
            if !canonical.starts_with(&self.root) {
                return Err(VfsError::path_escapes_root(format!(
                    "{} is not under {}",
                    canonical.display(),
                    self.root.display()
                )));
            }
            return Ok(canonical);
        }
        Ok(full)
    }

    /// Convert std::fs::Metadata to FileAttr.
    fn metadata_to_attr(meta: &std::fs::Metadata) -> FileAttr {
        let kind = if meta.is_dir() {
            FileType::Directory
        } else {
            FileType::File
        };
        FileAttr {
            size: meta.len(),
            kind,
            perm: meta.permissions().mode(),
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            atime: meta.accessed().ok(),
        }
    }
}

#[async_trait]
impl Vfs for LocalFs {
    fn name(&self) -> &str {
        "local"
    }

    async fn open_with(
        &self,
        path: &Path,
        flags: OpenFlags,
        mode: u32,
    ) -> VfsResult<Box<dyn VfsFile>> {
        let rel = Self::normalize(path);
        let full = self.resolve(path).await?;
        let path_str = rel.display().to_string();

        if let Ok(meta) = fs::metadata(&full).await {
            if meta.is_dir() {
                if flags.wants_write() {
                    return Err(VfsError::is_a_directory(path_str));
                }
                return Ok(Box::new(LocalFile {
                    rel,
                    full,
                    file: None,
                    flags,
                    dir_cursor: 0,
                    closed: false,
                }));
            }
        }

        if flags.create {
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| VfsError::from_io(&path_str, e))?;
            }
        }

        let mut opts = fs::OpenOptions::new();
        opts.read(flags.read)
            .write(flags.write)
            .append(flags.append)
            .create(flags.create && !flags.exclusive)
            .create_new(flags.create && flags.exclusive)
            .truncate(flags.truncate);
        if flags.create {
            opts.mode(mode);
        }

        let file = opts
            .open(&full)
            .await
            .map_err(|e| VfsError::from_io(&path_str, e))?;

        Ok(Box::new(LocalFile {
            rel,
            full,
            file: Some(file),
            flags,
            dir_cursor: 0,
            closed: false,
        }))
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> VfsResult<()> {
        let full = self.resolve(path).await?;
        let path_str = path.display().to_string();
        let mut builder = std::fs::DirBuilder::new();
        builder.mode(mode);
        builder
            .create(&full)
            .map_err(|e| VfsError::from_io(path_str, e))
    }

    async fn mkdir_all(&self, path: &Path, mode: u32) -> VfsResult<()> {
        let full = self.resolve(path).await?;
        let path_str = path.display().to_string();
        let mut builder = std::fs::DirBuilder::new();
        builder.mode(mode).recursive(true);
        builder
            .create(&full)
            .map_err(|e| VfsError::from_io(path_str, e))
    }

    async fn remove(&self, path: &Path) -> VfsResult<()> {
        let full = self.resolve(path).await?;
        let path_str = path.display().to_string();
        let meta = fs::metadata(&full)
            .await
            .map_err(|e| VfsError::from_io(&path_str, e))?;
        if meta.is_dir() {
            fs::remove_dir(&full)
                .await
                .map_err(|e| VfsError::from_io(&path_str, e))
        } else {
            fs::remove_file(&full)
                .await
                .map_err(|e| VfsError::from_io(&path_str, e))
        }
    }

    async fn remove_all(&self, path: &Path) -> VfsResult<()> {
        let full = self.resolve(path).await?;
        let path_str = path.display().to_string();
        match fs::metadata(&full).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VfsError::from_io(&path_str, e)),
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&full)
                .await
                .map_err(|e| VfsError::from_io(&path_str, e)),
            Ok(_) => fs::remove_file(&full)
                .await
                .map_err(|e| VfsError::from_io(&path_str, e)),
        }
    }

    async fn rename(&self, from: &Path, to: &Path) -> VfsResult<()> {
        let from_full = self.resolve(from).await?;
        let to_full = self.resolve(to).await?;
        let path_str = from.display().to_string();

        if let Some(parent) = to_full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| VfsError::from_io(&path_str, e))?;
        }

        fs::rename(&from_full, &to_full)
            .await
            .map_err(|e| VfsError::from_io(&path_str, e))
    }

    async fn stat(&self, path: &Path) -> VfsResult<FileAttr> {
        let full = self.resolve(path).await?;
        let meta = fs::metadata(&full)
            .await
            .map_err(|e| VfsError::from_io(path.display().to_string(), e))?;
        Ok(Self::metadata_to_attr(&meta))
    }

    async fn chmod(&self, path: &Path, mode: u32) -> VfsResult<()> {
        let full = self.resolve(path).await?;
        fs::set_permissions(&full, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| VfsError::from_io(path.display().to_string(), e))
    }

    async fn chtimes(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> VfsResult<()> {
        let full = self.resolve(path).await?;
        filetime::set_file_times(
            &full,
            FileTime::from_system_time(atime),
            FileTime::from_system_time(mtime),
        )
        .map_err(|e| VfsError::from_io(path.display().to_string(), e))
    }
}

/// Handle into a [`LocalFs`]. Directory handles carry no descriptor and
/// enumerate through `read_dir`.
#[derive(Debug)]
struct LocalFile {
    rel: PathBuf,
    full: PathBuf,
    file: Option<fs::File>,
    flags: OpenFlags,
    dir_cursor: usize,
    closed: bool,
}

impl LocalFile {
    fn check_open(&self) -> VfsResult<()> {
        if self.closed {
            Err(VfsError::closed(self.rel.display().to_string()))
        } else {
            Ok(())
        }
    }

    fn file_mut(&mut self) -> VfsResult<&mut fs::File> {
        let rel = self.rel.display().to_string();
        self.file.as_mut().ok_or(VfsError::IsADirectory(rel))
    }

    fn io_err(&self, e: std::io::Error) -> VfsError {
        VfsError::from_io(self.rel.display().to_string(), e)
    }
}

#[async_trait]
impl VfsFile for LocalFile {
    fn path(&self) -> &Path {
        &self.rel
    }

    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        self.check_open()?;
        let file = self.file_mut()?;
        let n = file.read(buf).await;
        n.map_err(|e| self.io_err(e))
    }

    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        self.check_open()?;
        let rel = self.rel.display().to_string();
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| VfsError::IsADirectory(rel.clone()))?;

        let saved = file
            .seek(SeekFrom::Current(0))
            .await
            .map_err(|e| VfsError::from_io(rel.clone(), e))?;
        let seeked = file.seek(SeekFrom::Start(offset)).await;
        let result = match seeked {
            Ok(_) => file.read(buf).await,
            Err(e) => Err(e),
        };
        let restore = file.seek(SeekFrom::Start(saved)).await;
        let n = result.map_err(|e| VfsError::from_io(rel.clone(), e))?;
        restore.map_err(|e| VfsError::from_io(rel, e))?;
        Ok(n)
    }

    async fn write(&mut self, data: &[u8]) -> VfsResult<usize> {
        self.check_open()?;
        let file = self.file_mut()?;
        match file.write_all(data).await {
            Ok(()) => Ok(data.len()),
            Err(e) => Err(self.io_err(e)),
        }
    }

    async fn write_at(&mut self, data: &[u8], offset: u64) -> VfsResult<usize> {
        self.check_open()?;
        let rel = self.rel.display().to_string();
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| VfsError::IsADirectory(rel.clone()))?;

        let saved = file
            .seek(SeekFrom::Current(0))
            .await
            .map_err(|e| VfsError::from_io(rel.clone(), e))?;
        let seeked = file.seek(SeekFrom::Start(offset)).await;
        let result = match seeked {
            Ok(_) => file.write_all(data).await,
            Err(e) => Err(e),
        };
        let restore = file.seek(SeekFrom::Start(saved)).await;
        result.map_err(|e| VfsError::from_io(rel.clone(), e))?;
        restore.map_err(|e| VfsError::from_io(rel, e))?;
        Ok(data.len())
    }

    async fn seek(&mut self, pos: SeekFrom) -> VfsResult<u64> {
        self.check_open()?;
        let file = self.file_mut()?;
        let result = file.seek(pos).await;
        result.map_err(|e| match e.kind() {
            std::io::ErrorKind::InvalidInput => {
                VfsError::invalid_seek(self.rel.display().to_string())
            }
            _ => self.io_err(e),
        })
    }

    async fn stat(&mut self) -> VfsResult<FileAttr> {
        self.check_open()?;
        let meta = match &self.file {
            Some(file) => file.metadata().await,
            None => fs::metadata(&self.full).await,
        };
        let meta = meta.map_err(|e| self.io_err(e))?;
        Ok(LocalFs::metadata_to_attr(&meta))
    }

    async fn sync(&mut self) -> VfsResult<()> {
        self.check_open()?;
        let file = self.file_mut()?;
        let result = file.sync_all().await;
        result.map_err(|e| self.io_err(e))
    }

    async fn truncate(&mut self, size: u64) -> VfsResult<()> {
        self.check_open()?;
        let file = self.file_mut()?;
        let result = file.set_len(size).await;
        result.map_err(|e| self.io_err(e))
    }

    async fn readdir(&mut self, count: Option<usize>) -> VfsResult<Vec<DirEntry>> {
        self.check_open()?;
        if self.file.is_some() {
            return Err(VfsError::not_a_directory(self.rel.display().to_string()));
        }

        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&self.full)
            .await
            .map_err(|e| self.io_err(e))?;
        loop {
            let next = dir.next_entry().await.map_err(|e| self.io_err(e))?;
            let Some(entry) = next else { break };
            let file_type = entry.file_type().await.map_err(|e| self.io_err(e))?;
            let kind = if file_type.is_dir() {
                FileType::Directory
            } else {
                FileType::File
            };
            entries.push(DirEntry::new(
                entry.file_name().to_string_lossy().into_owned(),
                kind,
            ));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let start = self.dir_cursor.min(entries.len());
        let end = match count {
            Some(n) => (start + n).min(entries.len()),
            None => entries.len(),
        };
        self.dir_cursor = end;
        Ok(entries[start..end].to_vec())
    }

    async fn close(&mut self) -> VfsResult<()> {
        self.check_open()?;
        self.closed = true;
        if let Some(mut file) = self.file.take() {
            if self.flags.wants_write() {
                if let Err(e) = file.flush().await {
                    return Err(self.io_err(e));
                }
            }
        }
        Ok(())
    }
}
