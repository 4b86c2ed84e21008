//! Write-buffering overlay with union directory listings.
//!
//! [`BufferFs`] layers a fast *layer* filesystem over an authoritative
//! *base*. Every file open copies the base content into a fresh layer
//! file and hands back a union handle: reads and seeks hit the layer
//! copy, writes land in the layer and are mirrored through to base at
//! the same offset, and directory listings merge both tiers with the
//! layer winning on name collisions.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{VfsError, VfsResult};
use crate::file::{SeekFrom, VfsFile};
use crate::fs::Vfs;
use crate::types::{DirEntry, FileAttr, OpenFlags};
use crate::util;

/// Buffers file I/O in a fast layer in front of an authoritative base.
///
/// Metadata operations route to the layer when it holds the path and fall
/// back to base otherwise. Mutations apply to both tiers, layer first.
#[derive(Debug)]
pub struct BufferFs {
    base: Arc<dyn Vfs>,
    layer: Arc<dyn Vfs>,
}

impl BufferFs {
    /// Wrap `base` with a buffering `layer`.
    pub fn new(base: Arc<dyn Vfs>, layer: Arc<dyn Vfs>) -> Self {
        Self { base, layer }
    }

    async fn open_dir(
        &self,
        path: &Path,
        base_is_dir: bool,
        layer_is_dir: bool,
    ) -> VfsResult<Box<dyn VfsFile>> {
        let base = if base_is_dir {
            Some(self.base.open(path).await?)
        } else {
            None
        };
        let layer = if layer_is_dir {
            Some(self.layer.open(path).await?)
        } else {
            None
        };
        Ok(Box::new(UnionFile {
            path: path.to_path_buf(),
            base,
            layer,
            flags: OpenFlags::read(),
            off: 0,
            is_dir: true,
            dir_entries: None,
            dir_cursor: 0,
            closed: false,
        }))
    }

    async fn open_union(
        &self,
        path: &Path,
        flags: OpenFlags,
        mode: u32,
    ) -> VfsResult<Box<dyn VfsFile>> {
        let base_attr = match self.base.stat(path).await {
            Ok(a) => Some(a),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let layer_attr = match self.layer.stat(path).await {
            Ok(a) => Some(a),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        let base_is_dir = base_attr.as_ref().is_some_and(|a| a.is_dir());
        let layer_is_dir = layer_attr.as_ref().is_some_and(|a| a.is_dir());
        if base_is_dir || layer_is_dir {
            if flags.wants_write() {
                return Err(VfsError::is_a_directory(path.display().to_string()));
            }
            return self.open_dir(path, base_is_dir, layer_is_dir).await;
        }

        // base decides existence and creation; the buffer copy follows
        let base = self.base.open_with(path, flags, mode).await?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !util::exists(&*self.layer, parent).await? {
                self.layer.mkdir_all(parent, 0o777).await?;
            }
        }
        let mut layer = match self.layer.create(path).await {
            Ok(f) => f,
            Err(e) => {
                let mut base = base;
                let _ = base.close().await;
                return Err(e.context("error opening a buffer file on layer"));
            }
        };

        // copy whatever the base open left behind (fresh files and
        // truncated opens copy nothing)
        let mut src = match self.base.open(path).await {
            Ok(f) => f,
            Err(e) => {
                let _ = layer.close().await;
                let _ = self.layer.remove(path).await;
                let mut base = base;
                let _ = base.close().await;
                return Err(e.context("error reading base file content"));
            }
        };
        let copy_result = util::copy(&mut *src, &mut *layer).await;
        let _ = src.close().await;
        if let Err(e) = copy_result {
            let _ = layer.close().await;
            let _ = self.layer.remove(path).await;
            let mut base = base;
            let _ = base.close().await;
            return Err(e.context("error copying base file content to buffer file"));
        }

        let off = if flags.append {
            layer.seek(SeekFrom::End(0)).await?
        } else {
            layer.seek(SeekFrom::Start(0)).await?
        };

        Ok(Box::new(UnionFile {
            path: path.to_path_buf(),
            base: Some(base),
            layer: Some(layer),
            flags,
            off,
            is_dir: false,
            dir_entries: None,
            dir_cursor: 0,
            closed: false,
        }))
    }
}

#[async_trait]
impl Vfs for BufferFs {
    fn name(&self) -> &str {
        "buffer"
    }

    async fn open(&self, path: &Path) -> VfsResult<Box<dyn VfsFile>> {
        self.open_union(path, OpenFlags::read(), 0).await
    }

    async fn open_with(
        &self,
        path: &Path,
        flags: OpenFlags,
        mode: u32,
    ) -> VfsResult<Box<dyn VfsFile>> {
        self.open_union(path, flags, mode).await
    }

    async fn create(&self, path: &Path) -> VfsResult<Box<dyn VfsFile>> {
        let base = self.base.create(path).await?;
        let layer = match self.layer.create(path).await {
            Ok(f) => f,
            Err(e) => {
                let mut base = base;
                let _ = base.close().await;
                return Err(e.context("error opening a buffer file on layer"));
            }
        };
        Ok(Box::new(UnionFile {
            path: path.to_path_buf(),
            base: Some(base),
            layer: Some(layer),
            flags: OpenFlags::create_truncate(),
            off: 0,
            is_dir: false,
            dir_entries: None,
            dir_cursor: 0,
            closed: false,
        }))
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> VfsResult<()> {
        self.base.mkdir(path, mode).await?;
        // the layer may be missing intermediate directories
        self.layer.mkdir_all(path, mode).await
    }

    async fn mkdir_all(&self, path: &Path, mode: u32) -> VfsResult<()> {
        self.base.mkdir_all(path, mode).await?;
        self.layer.mkdir_all(path, mode).await
    }

    async fn remove(&self, path: &Path) -> VfsResult<()> {
        // a path can exist in both tiers at once
        if util::exists(&*self.layer, path).await? {
            self.layer.remove(path).await?;
        }
        self.base.remove(path).await
    }

    async fn remove_all(&self, path: &Path) -> VfsResult<()> {
        let layer_result = self.layer.remove_all(path).await;
        let base_result = self.base.remove_all(path).await;
        layer_result.map_err(|e| e.context("error removing from layer"))?;
        base_result
    }

    async fn rename(&self, from: &Path, to: &Path) -> VfsResult<()> {
        if util::exists(&*self.layer, from).await? {
            self.layer.rename(from, to).await?;
        }
        self.base.rename(from, to).await
    }

    async fn stat(&self, path: &Path) -> VfsResult<FileAttr> {
        if util::exists(&*self.layer, path).await? {
            self.layer.stat(path).await
        } else {
            self.base.stat(path).await
        }
    }

    async fn chmod(&self, path: &Path, mode: u32) -> VfsResult<()> {
        if util::exists(&*self.layer, path).await? {
            self.layer.chmod(path, mode).await
        } else {
            self.base.chmod(path, mode).await
        }
    }

    async fn chtimes(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> VfsResult<()> {
        if util::exists(&*self.layer, path).await? {
            self.layer.chtimes(path, atime, mtime).await
        } else {
            self.base.chtimes(path, atime, mtime).await
        }
    }
}

/// Union handle over one file in each tier.
///
/// Reads come from the layer copy; writes land in the layer and are
/// mirrored through to base at the matching offset. Directory handles
/// merge the listings of both tiers, layer entries shadowing base
/// entries of the same name.
#[derive(Debug)]
struct UnionFile {
    path: PathBuf,
    base: Option<Box<dyn VfsFile>>,
    layer: Option<Box<dyn VfsFile>>,
    flags: OpenFlags,
    off: u64,
    is_dir: bool,
    dir_entries: Option<Vec<DirEntry>>,
    dir_cursor: usize,
    closed: bool,
}

impl UnionFile {
    fn check_open(&self) -> VfsResult<()> {
        if self.closed {
            Err(VfsError::closed(self.path.display().to_string()))
        } else {
            Ok(())
        }
    }

    fn check_file(&self) -> VfsResult<()> {
        self.check_open()?;
        if self.is_dir {
            return Err(VfsError::is_a_directory(self.path.display().to_string()));
        }
        Ok(())
    }

    fn check_writable(&self) -> VfsResult<()> {
        self.check_file()?;
        if !self.flags.write && !self.flags.append {
            return Err(VfsError::permission_denied(format!(
                "not opened for writing: {}",
                self.path.display()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl VfsFile for UnionFile {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        self.check_file()?;
        let Some(layer) = self.layer.as_mut() else {
            return Err(VfsError::closed(self.path.display().to_string()));
        };
        let n = layer.read(buf).await?;
        self.off += n as u64;
        Ok(n)
    }

    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        self.check_file()?;
        let Some(layer) = self.layer.as_mut() else {
            return Err(VfsError::closed(self.path.display().to_string()));
        };
        layer.read_at(buf, offset).await
    }

    async fn write(&mut self, data: &[u8]) -> VfsResult<usize> {
        self.check_writable()?;
        let (Some(layer), Some(base)) = (self.layer.as_mut(), self.base.as_mut()) else {
            return Err(VfsError::closed(self.path.display().to_string()));
        };
        let n = layer
            .write(data)
            .await
            .map_err(|e| e.context("error writing to layer file"))?;
        let pos = layer
            .seek(SeekFrom::Current(0))
            .await
            .map_err(|e| e.context("error seeking buffer file"))?;

        // mirror the bytes into base at the offset the layer landed them
        let start = pos - n as u64;
        let mut written = 0;
        while written < n {
            written += base
                .write_at(&data[written..n], start + written as u64)
                .await
                .map_err(|e| e.context("error writing to base file"))?;
        }
        self.off = pos;
        Ok(n)
    }

    async fn write_at(&mut self, data: &[u8], offset: u64) -> VfsResult<usize> {
        self.check_writable()?;
        let (Some(layer), Some(base)) = (self.layer.as_mut(), self.base.as_mut()) else {
            return Err(VfsError::closed(self.path.display().to_string()));
        };
        let n = layer
            .write_at(data, offset)
            .await
            .map_err(|e| e.context("error writing to layer file"))?;
        base.write_at(data, offset)
            .await
            .map_err(|e| e.context("error writing to base file"))?;
        Ok(n)
    }

    async fn seek(&mut self, pos: SeekFrom) -> VfsResult<u64> {
        self.check_file()?;
        let Some(layer) = self.layer.as_mut() else {
            return Err(VfsError::closed(self.path.display().to_string()));
        };
        let new_pos = layer.seek(pos).await?;
        self.off = new_pos;
        Ok(new_pos)
    }

    async fn stat(&mut self) -> VfsResult<FileAttr> {
        self.check_open()?;
        match self.layer.as_mut() {
            Some(layer) => layer.stat().await,
            None => match self.base.as_mut() {
                Some(base) => base.stat().await,
                None => Err(VfsError::closed(self.path.display().to_string())),
            },
        }
    }

    async fn sync(&mut self) -> VfsResult<()> {
        self.check_open()?;
        if let Some(layer) = self.layer.as_mut() {
            layer
                .sync()
                .await
                .map_err(|e| e.context("error syncing layer file"))?;
        }
        if let Some(base) = self.base.as_mut() {
            base.sync()
                .await
                .map_err(|e| e.context("error syncing base file"))?;
        }
        Ok(())
    }

    async fn truncate(&mut self, size: u64) -> VfsResult<()> {
        self.check_writable()?;
        let (Some(layer), Some(base)) = (self.layer.as_mut(), self.base.as_mut()) else {
            return Err(VfsError::closed(self.path.display().to_string()));
        };
        layer
            .truncate(size)
            .await
            .map_err(|e| e.context("error truncating layer file"))?;
        base.truncate(size)
            .await
            .map_err(|e| e.context("error truncating base file"))
    }

    async fn readdir(&mut self, count: Option<usize>) -> VfsResult<Vec<DirEntry>> {
        self.check_open()?;
        if !self.is_dir {
            return Err(VfsError::not_a_directory(self.path.display().to_string()));
        }

        if self.dir_entries.is_none() {
            let mut merged: HashMap<String, DirEntry> = HashMap::new();
            if let Some(base) = self.base.as_mut() {
                for entry in base.readdir(None).await? {
                    merged.insert(entry.name.clone(), entry);
                }
            }
            // layer entries shadow base entries of the same name
            if let Some(layer) = self.layer.as_mut() {
                for entry in layer.readdir(None).await? {
                    merged.insert(entry.name.clone(), entry);
                }
            }
            let mut entries: Vec<_> = merged.into_values().collect();
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            self.dir_entries = Some(entries);
        }

        let entries = self.dir_entries.as_deref().unwrap_or(&[]);
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
        let mut first_err: Option<VfsError> = None;

        // base first, so the layer copy carries the newer timestamp
        if let Some(mut base) = self.base.take() {
            if let Err(e) = base.close().await {
                first_err = Some(e.context("error closing base file"));
            }
        }
        if let Some(mut layer) = self.layer.take() {
            if let Err(e) = layer.close().await {
                if first_err.is_none() {
                    first_err = Some(e.context("error closing layer file"));
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryFs;

    fn overlay() -> (BufferFs, Arc<MemoryFs>, Arc<MemoryFs>) {
        let base = Arc::new(MemoryFs::new());
        let layer = Arc::new(MemoryFs::new());
        (BufferFs::new(base.clone(), layer.clone()), base, layer)
    }

    #[tokio::test]
    async fn test_create_writes_both_tiers() {
        let (fs, base, layer) = overlay();

        let mut f = fs.create(Path::new("doc.txt")).await.unwrap();
        f.write(b"hello world").await.unwrap();
        f.close().await.unwrap();

        assert_eq!(
            util::read_all(&*base, Path::new("doc.txt")).await.unwrap(),
            b"hello world"
        );
        assert_eq!(
            util::read_all(&*layer, Path::new("doc.txt")).await.unwrap(),
            b"hello world"
        );
        assert_eq!(
            util::read_all(&fs, Path::new("doc.txt")).await.unwrap(),
            b"hello world"
        );
    }

    #[tokio::test]
    async fn test_open_buffers_base_content() {
        let (fs, base, layer) = overlay();
        util::write_all(&*base, Path::new("seed/data.txt"), b"from base")
            .await
            .unwrap();

        let mut f = fs.open(Path::new("seed/data.txt")).await.unwrap();
        let data = util::read_to_end(&mut *f).await.unwrap();
        f.close().await.unwrap();

        assert_eq!(data, b"from base");
        // the open left a buffer copy behind
        assert_eq!(
            util::read_all(&*layer, Path::new("seed/data.txt"))
                .await
                .unwrap(),
            b"from base"
        );
    }

    #[tokio::test]
    async fn test_write_mirrors_at_offset() {
        let (fs, base, layer) = overlay();
        util::write_all(&*base, Path::new("m.txt"), b"0123456789")
            .await
            .unwrap();

        let mut f = fs
            .open_with(Path::new("m.txt"), OpenFlags::write(), 0o644)
            .await
            .unwrap();
        f.seek(SeekFrom::Start(4)).await.unwrap();
        f.write(b"XY").await.unwrap();
        f.close().await.unwrap();

        assert_eq!(
            util::read_all(&*layer, Path::new("m.txt")).await.unwrap(),
            b"0123XY6789"
        );
        assert_eq!(
            util::read_all(&*base, Path::new("m.txt")).await.unwrap(),
            b"0123XY6789"
        );
    }

    #[tokio::test]
    async fn test_append_lands_at_end_of_both_tiers() {
        let (fs, base, layer) = overlay();
        util::write_all(&*base, Path::new("log.txt"), b"one")
            .await
            .unwrap();

        let mut f = fs
            .open_with(Path::new("log.txt"), OpenFlags::append(), 0o644)
            .await
            .unwrap();
        f.write(b"two").await.unwrap();
        f.close().await.unwrap();

        assert_eq!(
            util::read_all(&*layer, Path::new("log.txt")).await.unwrap(),
            b"onetwo"
        );
        assert_eq!(
            util::read_all(&*base, Path::new("log.txt")).await.unwrap(),
            b"onetwo"
        );
    }

    #[tokio::test]
    async fn test_union_readdir_merges_tiers() {
        let (fs, base, layer) = overlay();
        util::write_all(&*base, Path::new("d/a.txt"), b"a").await.unwrap();
        util::write_all(&*base, Path::new("d/c.txt"), b"base c")
            .await
            .unwrap();
        util::write_all(&*layer, Path::new("d/b.txt"), b"b").await.unwrap();
        util::write_all(&*layer, Path::new("d/c.txt"), b"layer c!")
            .await
            .unwrap();

        let mut dir = fs.open(Path::new("d")).await.unwrap();
        let names = dir.readdir_names(None).await.unwrap();
        dir.close().await.unwrap();

        // merged view, one entry per name
        assert_eq!(names, vec!["a.txt", "b.txt", "c.txt"]);
    }

    #[tokio::test]
    async fn test_layer_shadows_base_metadata() {
        let (fs, base, layer) = overlay();
        util::write_all(&*base, Path::new("c.txt"), b"base c")
            .await
            .unwrap();
        util::write_all(&*layer, Path::new("c.txt"), b"layer c!")
            .await
            .unwrap();

        let attr = fs.stat(Path::new("c.txt")).await.unwrap();
        assert_eq!(attr.size, 8);
    }

    #[tokio::test]
    async fn test_base_only_directory_listing() {
        let (fs, base, _layer) = overlay();
        util::write_all(&*base, Path::new("only/base.txt"), b"x")
            .await
            .unwrap();

        let mut dir = fs.open(Path::new("only")).await.unwrap();
        let names = dir.readdir_names(None).await.unwrap();
        dir.close().await.unwrap();
        assert_eq!(names, vec!["base.txt"]);
    }

    #[tokio::test]
    async fn test_readonly_union_refuses_write() {
        let (fs, base, _layer) = overlay();
        util::write_all(&*base, Path::new("r.txt"), b"x").await.unwrap();

        let mut f = fs.open(Path::new("r.txt")).await.unwrap();
        assert!(matches!(
            f.write(b"y").await.unwrap_err(),
            VfsError::PermissionDenied(_)
        ));
        f.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_clears_both_tiers() {
        let (fs, base, layer) = overlay();
        let mut f = fs.create(Path::new("gone.txt")).await.unwrap();
        f.write(b"x").await.unwrap();
        f.close().await.unwrap();

        fs.remove(Path::new("gone.txt")).await.unwrap();
        assert!(!util::exists(&*base, Path::new("gone.txt")).await.unwrap());
        assert!(!util::exists(&*layer, Path::new("gone.txt")).await.unwrap());

        let err = fs.stat(Path::new("gone.txt")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_open_missing_is_not_found() {
        let (fs, _base, _layer) = overlay();
        let err = fs.open(Path::new("nope.txt")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_truncate_applies_to_both_tiers() {
        let (fs, base, layer) = overlay();
        util::write_all(&*base, Path::new("t.txt"), b"0123456789")
            .await
            .unwrap();

        let mut f = fs
            .open_with(Path::new("t.txt"), OpenFlags::write(), 0o644)
            .await
            .unwrap();
        f.truncate(4).await.unwrap();
        f.close().await.unwrap();

        assert_eq!(
            util::read_all(&*layer, Path::new("t.txt")).await.unwrap(),
            b"0123"
        );
        assert_eq!(
            util::read_all(&*base, Path::new("t.txt")).await.unwrap(),
            b"0123"
        );
    }
}
