//! In-memory filesystem backend.
//!
//! Handy as a scratch space, a test double, or the fast tier of the cache
//! overlay. All data is lost when the last reference drops.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{VfsError, VfsResult};
use crate::file::{SeekFrom, VfsFile};
use crate::fs::Vfs;
use crate::types::{DirEntry, FileAttr, FileType, OpenFlags};

/// Entry in the memory filesystem.
#[derive(Debug, Clone)]
enum Node {
    File { data: Vec<u8>, attr: FileAttr },
    Directory { attr: FileAttr },
}

impl Node {
    fn attr(&self) -> &FileAttr {
        match self {
            Node::File { attr, .. } => attr,
            Node::Directory { attr } => attr,
        }
    }

    fn attr_mut(&mut self) -> &mut FileAttr {
        match self {
            Node::File { attr, .. } => attr,
            Node::Directory { attr } => attr,
        }
    }
}

type Nodes = HashMap<PathBuf, Node>;

/// In-memory filesystem.
///
/// Cloning shares the underlying tree; handles keep the tree alive through
/// their own reference.
#[derive(Debug, Clone)]
pub struct MemoryFs {
    nodes: Arc<RwLock<Nodes>>,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFs {
    /// Create a new empty in-memory filesystem.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        // Root directory always exists
        nodes.insert(
            PathBuf::from(""),
            Node::Directory {
                attr: FileAttr::directory(0o755),
            },
        );
        Self {
            nodes: Arc::new(RwLock::new(nodes)),
        }
    }

    /// Normalize a path: remove leading `/`, resolve `.` and `..`.
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

    /// Ensure all parent directories exist, failing if a component exists
    /// as a regular file.
    fn ensure_parents(nodes: &mut Nodes, path: &Path) -> VfsResult<()> {
        let mut current = PathBuf::new();
        for component in path.parent().into_iter().flat_map(|p| p.components()) {
            if let std::path::Component::Normal(s) = component {
                current.push(s);
                match nodes.get(&current) {
                    Some(Node::Directory { .. }) => {}
                    Some(Node::File { .. }) => {
                        return Err(VfsError::not_a_directory(Self::path_str(&current)));
                    }
                    None => {
                        nodes.insert(
                            current.clone(),
                            Node::Directory {
                                attr: FileAttr::directory(0o755),
                            },
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn path_str(path: &Path) -> String {
        path.display().to_string()
    }

    fn has_children(nodes: &Nodes, path: &Path) -> bool {
        nodes
            .keys()
            .any(|k| k.parent() == Some(path) && k != path)
    }

    fn dir_handle(&self, path: PathBuf) -> Box<dyn VfsFile> {
        Box::new(MemoryFile {
            nodes: Arc::clone(&self.nodes),
            path,
            flags: OpenFlags::read(),
            pos: 0,
            is_dir: true,
            dir_cursor: 0,
            closed: false,
        })
    }
}

#[async_trait]
impl Vfs for MemoryFs {
    fn name(&self) -> &str {
        "memory"
    }

    async fn open_with(
        &self,
        path: &Path,
        flags: OpenFlags,
        mode: u32,
    ) -> VfsResult<Box<dyn VfsFile>> {
        let normalized = Self::normalize(path);
        let mut nodes = self.nodes.write();

        match nodes.get_mut(&normalized) {
            Some(Node::Directory { .. }) => {
                if flags.wants_write() {
                    return Err(VfsError::is_a_directory(Self::path_str(&normalized)));
                }
                Ok(self.dir_handle(normalized))
            }
            Some(Node::File { data, attr }) => {
                if flags.create && flags.exclusive {
                    return Err(VfsError::already_exists(Self::path_str(&normalized)));
                }
                if flags.truncate {
                    data.clear();
                    attr.size = 0;
                    attr.mtime = SystemTime::now();
                }
                Ok(Box::new(MemoryFile {
                    nodes: Arc::clone(&self.nodes),
                    path: normalized,
                    flags,
                    pos: 0,
                    is_dir: false,
                    dir_cursor: 0,
                    closed: false,
                }))
            }
            None => {
                if !flags.create {
                    return Err(VfsError::not_found(Self::path_str(&normalized)));
                }
                Self::ensure_parents(&mut nodes, &normalized)?;
                nodes.insert(
                    normalized.clone(),
                    Node::File {
                        data: Vec::new(),
                        attr: FileAttr::file(0, mode),
                    },
                );
                Ok(Box::new(MemoryFile {
                    nodes: Arc::clone(&self.nodes),
                    path: normalized,
                    flags,
                    pos: 0,
                    is_dir: false,
                    dir_cursor: 0,
                    closed: false,
                }))
            }
        }
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> VfsResult<()> {
        let normalized = Self::normalize(path);
        let mut nodes = self.nodes.write();

        match nodes.get(&normalized) {
            Some(Node::Directory { .. }) => Ok(()),
            Some(Node::File { .. }) => Err(VfsError::already_exists(Self::path_str(&normalized))),
            None => {
                Self::ensure_parents(&mut nodes, &normalized)?;
                nodes.insert(
                    normalized,
                    Node::Directory {
                        attr: FileAttr::directory(mode),
                    },
                );
                Ok(())
            }
        }
    }

    async fn mkdir_all(&self, path: &Path, mode: u32) -> VfsResult<()> {
        self.mkdir(path, mode).await
    }

    async fn remove(&self, path: &Path) -> VfsResult<()> {
        let normalized = Self::normalize(path);
        if normalized.as_os_str().is_empty() {
            return Err(VfsError::permission_denied("cannot remove root"));
        }

        let mut nodes = self.nodes.write();
        match nodes.get(&normalized) {
            Some(Node::Directory { .. }) => {
                if Self::has_children(&nodes, &normalized) {
                    return Err(VfsError::directory_not_empty(Self::path_str(&normalized)));
                }
                nodes.remove(&normalized);
                Ok(())
            }
            Some(Node::File { .. }) => {
                nodes.remove(&normalized);
                Ok(())
            }
            None => Err(VfsError::not_found(Self::path_str(&normalized))),
        }
    }

    async fn remove_all(&self, path: &Path) -> VfsResult<()> {
        let normalized = Self::normalize(path);
        let mut nodes = self.nodes.write();

        if normalized.as_os_str().is_empty() {
            nodes.retain(|k, _| k.as_os_str().is_empty());
            return Ok(());
        }
        nodes.retain(|k, _| !k.starts_with(&normalized));
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> VfsResult<()> {
        let from_normalized = Self::normalize(from);
        let to_normalized = Self::normalize(to);
        let mut nodes = self.nodes.write();

        let entry = nodes
            .remove(&from_normalized)
            .ok_or_else(|| VfsError::not_found(Self::path_str(&from_normalized)))?;

        Self::ensure_parents(&mut nodes, &to_normalized)?;

        // Directories carry their whole subtree to the new key
        if matches!(entry, Node::Directory { .. }) {
            let children: Vec<_> = nodes
                .keys()
                .filter(|k| k.starts_with(&from_normalized))
                .cloned()
                .collect();

            for child in children {
                if let Some(child_entry) = nodes.remove(&child) {
                    let relative = child.strip_prefix(&from_normalized).unwrap();
                    nodes.insert(to_normalized.join(relative), child_entry);
                }
            }
        }

        nodes.insert(to_normalized, entry);
        Ok(())
    }

    async fn stat(&self, path: &Path) -> VfsResult<FileAttr> {
        let normalized = Self::normalize(path);
        let nodes = self.nodes.read();

        if normalized.as_os_str().is_empty() {
            return Ok(FileAttr::directory(0o755));
        }

        nodes
            .get(&normalized)
            .map(|n| n.attr().clone())
            .ok_or_else(|| VfsError::not_found(Self::path_str(&normalized)))
    }

    async fn chmod(&self, path: &Path, mode: u32) -> VfsResult<()> {
        let normalized = Self::normalize(path);
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(&normalized)
            .ok_or_else(|| VfsError::not_found(Self::path_str(&normalized)))?;
        node.attr_mut().perm = mode;
        Ok(())
    }

    async fn chtimes(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> VfsResult<()> {
        let normalized = Self::normalize(path);
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(&normalized)
            .ok_or_else(|| VfsError::not_found(Self::path_str(&normalized)))?;
        let attr = node.attr_mut();
        attr.mtime = mtime;
        attr.atime = Some(atime);
        Ok(())
    }
}

/// Handle into a [`MemoryFs`]. Each handle carries its own cursor; data
/// lives in the shared tree.
#[derive(Debug)]
struct MemoryFile {
    nodes: Arc<RwLock<Nodes>>,
    path: PathBuf,
    flags: OpenFlags,
    pos: u64,
    is_dir: bool,
    dir_cursor: usize,
    closed: bool,
}

impl MemoryFile {
    fn check_open(&self) -> VfsResult<()> {
        if self.closed {
            Err(VfsError::closed(self.path.display().to_string()))
        } else {
            Ok(())
        }
    }

    fn check_readable(&self) -> VfsResult<()> {
        self.check_open()?;
        if self.is_dir {
            return Err(VfsError::is_a_directory(self.path.display().to_string()));
        }
        if !self.flags.read {
            return Err(VfsError::permission_denied(format!(
                "not opened for reading: {}",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn check_writable(&self) -> VfsResult<()> {
        self.check_open()?;
        if self.is_dir {
            return Err(VfsError::is_a_directory(self.path.display().to_string()));
        }
        if !self.flags.write && !self.flags.append {
            return Err(VfsError::permission_denied(format!(
                "not opened for writing: {}",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn read_from(&self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        let nodes = self.nodes.read();
        match nodes.get(&self.path) {
            Some(Node::File { data, .. }) => {
                let start = (offset as usize).min(data.len());
                let n = buf.len().min(data.len() - start);
                buf[..n].copy_from_slice(&data[start..start + n]);
                Ok(n)
            }
            Some(Node::Directory { .. }) => {
                Err(VfsError::is_a_directory(self.path.display().to_string()))
            }
            None => Err(VfsError::not_found(self.path.display().to_string())),
        }
    }

    fn write_to(&self, buf: &[u8], offset: u64) -> VfsResult<usize> {
        let mut nodes = self.nodes.write();
        match nodes.get_mut(&self.path) {
            Some(Node::File { data, attr }) => {
                let offset = offset as usize;
                if offset + buf.len() > data.len() {
                    data.resize(offset + buf.len(), 0);
                }
                data[offset..offset + buf.len()].copy_from_slice(buf);
                attr.size = data.len() as u64;
                attr.mtime = SystemTime::now();
                Ok(buf.len())
            }
            Some(Node::Directory { .. }) => {
                Err(VfsError::is_a_directory(self.path.display().to_string()))
            }
            None => Err(VfsError::not_found(self.path.display().to_string())),
        }
    }

    fn len(&self) -> VfsResult<u64> {
        let nodes = self.nodes.read();
        match nodes.get(&self.path) {
            Some(node) => Ok(node.attr().size),
            None => Err(VfsError::not_found(self.path.display().to_string())),
        }
    }
}

#[async_trait]
impl VfsFile for MemoryFile {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        self.check_readable()?;
        let n = self.read_from(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }

    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        self.check_readable()?;
        self.read_from(buf, offset)
    }

    async fn write(&mut self, data: &[u8]) -> VfsResult<usize> {
        self.check_writable()?;
        if self.flags.append {
            self.pos = self.len()?;
        }
        let n = self.write_to(data, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }

    async fn write_at(&mut self, data: &[u8], offset: u64) -> VfsResult<usize> {
        self.check_writable()?;
        self.write_to(data, offset)
    }

    async fn seek(&mut self, pos: SeekFrom) -> VfsResult<u64> {
        self.check_open()?;
        let target = match pos {
            SeekFrom::Start(o) => o as i64,
            SeekFrom::Current(d) => self.pos as i64 + d,
            SeekFrom::End(d) => self.len()? as i64 + d,
        };
        if target < 0 {
            return Err(VfsError::invalid_seek(format!(
                "seek before start of {}",
                self.path.display()
            )));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }

    async fn stat(&mut self) -> VfsResult<FileAttr> {
        self.check_open()?;
        let nodes = self.nodes.read();
        if self.path.as_os_str().is_empty() {
            return Ok(FileAttr::directory(0o755));
        }
        nodes
            .get(&self.path)
            .map(|n| n.attr().clone())
            .ok_or_else(|| VfsError::not_found(self.path.display().to_string()))
    }

    async fn sync(&mut self) -> VfsResult<()> {
        self.check_open()
    }

    async fn truncate(&mut self, size: u64) -> VfsResult<()> {
        self.check_writable()?;
        let mut nodes = self.nodes.write();
        match nodes.get_mut(&self.path) {
            Some(Node::File { data, attr }) => {
                data.resize(size as usize, 0);
                attr.size = size;
                attr.mtime = SystemTime::now();
                Ok(())
            }
            Some(Node::Directory { .. }) => {
                Err(VfsError::is_a_directory(self.path.display().to_string()))
            }
            None => Err(VfsError::not_found(self.path.display().to_string())),
        }
    }

    async fn readdir(&mut self, count: Option<usize>) -> VfsResult<Vec<DirEntry>> {
        self.check_open()?;
        if !self.is_dir {
            return Err(VfsError::not_a_directory(self.path.display().to_string()));
        }

        let nodes = self.nodes.read();
        let mut children = Vec::new();
        for (entry_path, node) in nodes.iter() {
            if entry_path.parent() == Some(&self.path) && entry_path != &self.path {
                if let Some(name) = entry_path.file_name() {
                    let kind = match node {
                        Node::File { .. } => FileType::File,
                        Node::Directory { .. } => FileType::Directory,
                    };
                    children.push(DirEntry::new(name.to_string_lossy().into_owned(), kind));
                }
            }
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));

        let start = self.dir_cursor.min(children.len());
        let end = match count {
            Some(n) => (start + n).min(children.len()),
            None => children.len(),
        };
        self.dir_cursor = end;
        Ok(children[start..end].to_vec())
    }

    async fn close(&mut self) -> VfsResult<()> {
        self.check_open()?;
        self.closed = true;
        Ok(())
    }
}
