//! Helpers over the filesystem contracts.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::VfsResult;
use crate::file::VfsFile;
use crate::fs::Vfs;
use crate::types::FileAttr;

const COPY_BUF: usize = 8 * 1024;

/// Whether `path` exists on `fs`. Only *not-found* maps to `false`; other
/// errors propagate.
pub async fn exists(fs: &dyn Vfs, path: &Path) -> VfsResult<bool> {
    match fs.stat(path).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Read the rest of an open handle into memory.
pub async fn read_to_end(file: &mut dyn VfsFile) -> VfsResult<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; COPY_BUF];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..n]);
    }
}

/// Read a whole file.
pub async fn read_all(fs: &dyn Vfs, path: &Path) -> VfsResult<Vec<u8>> {
    let mut file = fs.open(path).await?;
    let result = read_to_end(&mut *file).await;
    let closed = file.close().await;
    let data = result?;
    closed?;
    Ok(data)
}

/// Create (or truncate) a file and write `data` to it.
pub async fn write_all(fs: &dyn Vfs, path: &Path, data: &[u8]) -> VfsResult<()> {
    let mut file = fs.create(path).await?;
    let mut written = 0;
    while written < data.len() {
        match file.write(&data[written..]).await {
            Ok(n) => written += n,
            Err(e) => {
                let _ = file.close().await;
                return Err(e);
            }
        }
    }
    file.close().await
}

/// Stream-copy the remainder of `src` into `dst`. Returns the byte count.
pub async fn copy(src: &mut dyn VfsFile, dst: &mut dyn VfsFile) -> VfsResult<u64> {
    let mut buf = [0u8; COPY_BUF];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        let mut written = 0;
        while written < n {
            written += dst.write(&buf[written..n]).await?;
        }
        total += n as u64;
    }
}

/// Walk `root` depth-first, returning every entry under it with its
/// attributes. A root that is a regular file yields just itself; a missing
/// root yields nothing. The root itself is not included when it is a
/// directory.
pub async fn walk(fs: &dyn Vfs, root: &Path) -> VfsResult<Vec<(PathBuf, FileAttr)>> {
    let root_attr = match fs.stat(root).await {
        Ok(a) => a,
        Err(e) if e.is_not_found() => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    if !root_attr.is_dir() {
        return Ok(vec![(root.to_path_buf(), root_attr)]);
    }

    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut handle = match fs.open(&dir).await {
            Ok(h) => h,
            // raced away between listing and open
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        };
        let listing = handle.readdir(None).await;
        let closed = handle.close().await;
        let entries = listing?;
        closed?;

        for entry in entries {
            let child = dir.join(&entry.name);
            let attr = match fs.stat(&child).await {
                Ok(a) => a,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            if attr.is_dir() {
                stack.push(child.clone());
            }
            out.push((child, attr));
        }
    }
    Ok(out)
}

/// Microseconds since the Unix epoch; times before the epoch clamp to 0.
pub(crate) fn unix_micros(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

static LAST_STAMP: AtomicI64 = AtomicI64::new(0);

/// The current time in microseconds since the Unix epoch, strictly
/// monotonic across the process so that access ordering survives bursts
/// faster than the clock resolution.
pub(crate) fn now_micros() -> i64 {
    let now = unix_micros(SystemTime::now());
    let prev = LAST_STAMP
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |last| {
            Some(now.max(last + 1))
        })
        .unwrap_or(0);
    now.max(prev + 1)
}
