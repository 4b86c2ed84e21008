//! Translucent streaming compression overlay.
//!
//! Payloads are gzip-compressed on the way down and decompressed on the
//! way back up. Handles are streaming only: one direction each, no random
//! access, no truncate, no mmap.

use async_trait::async_trait;
use flate2::write::{GzDecoder, GzEncoder};

pub use flate2::Compression;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{VfsError, VfsResult};
use crate::file::{SeekFrom, VfsFile};
use crate::fs::Vfs;
use crate::types::{DirEntry, FileAttr, OpenFlags};

const CHUNK: usize = 8 * 1024;

/// Compresses file payloads on the wrapped filesystem.
///
/// Metadata operations pass straight through; `stat` reports the
/// compressed on-disk size.
#[derive(Debug)]
pub struct GzipFs {
    inner: Arc<dyn Vfs>,
    level: Compression,
}

impl GzipFs {
    /// Wrap `inner` with the default compression level.
    pub fn new(inner: Arc<dyn Vfs>) -> Self {
        Self::with_level(inner, Compression::default())
    }

    /// Wrap `inner` with an explicit compression level.
    pub fn with_level(inner: Arc<dyn Vfs>, level: Compression) -> Self {
        Self { inner, level }
    }
}

#[async_trait]
impl Vfs for GzipFs {
    fn name(&self) -> &str {
        "gzip"
    }

    async fn open_with(
        &self,
        path: &Path,
        flags: OpenFlags,
        mode: u32,
    ) -> VfsResult<Box<dyn VfsFile>> {
        let inner = self.inner.open_with(path, flags, mode).await?;
        Ok(Box::new(GzipFile {
            path: path.to_path_buf(),
            inner,
            flags,
            level: self.level,
            encoder: None,
            decoder: None,
            decoder_fed: false,
            decoder_done: false,
            out: Vec::new(),
            out_pos: 0,
            read_offset: 0,
            closed: false,
        }))
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> VfsResult<()> {
        self.inner.mkdir(path, mode).await
    }

    async fn mkdir_all(&self, path: &Path, mode: u32) -> VfsResult<()> {
        self.inner.mkdir_all(path, mode).await
    }

    async fn remove(&self, path: &Path) -> VfsResult<()> {
        self.inner.remove(path).await
    }

    async fn remove_all(&self, path: &Path) -> VfsResult<()> {
        self.inner.remove_all(path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> VfsResult<()> {
        self.inner.rename(from, to).await
    }

    async fn stat(&self, path: &Path) -> VfsResult<FileAttr> {
        self.inner.stat(path).await
    }

    async fn chmod(&self, path: &Path, mode: u32) -> VfsResult<()> {
        self.inner.chmod(path, mode).await
    }

    async fn chtimes(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> VfsResult<()> {
        self.inner.chtimes(path, atime, mtime).await
    }
}

/// Streaming handle produced by [`GzipFs`].
///
/// The codec for each direction is created lazily on first use; once one
/// direction is active the other is refused. The produced stream is
/// forward-only and non-restartable.
#[derive(Debug)]
struct GzipFile {
    path: PathBuf,
    inner: Box<dyn VfsFile>,
    flags: OpenFlags,
    level: Compression,
    encoder: Option<GzEncoder<Vec<u8>>>,
    decoder: Option<GzDecoder<Vec<u8>>>,
    decoder_fed: bool,
    decoder_done: bool,
    // decompressed bytes not yet handed to the caller
    out: Vec<u8>,
    out_pos: usize,
    read_offset: u64,
    closed: bool,
}

impl GzipFile {
    fn check_open(&self) -> VfsResult<()> {
        if self.closed {
            Err(VfsError::closed(self.path.display().to_string()))
        } else {
            Ok(())
        }
    }

    fn refuse(&self, what: &str) -> VfsError {
        VfsError::permission_denied(format!("{what}: {}", self.path.display()))
    }

    async fn write_inner(&mut self, data: &[u8]) -> VfsResult<()> {
        let mut written = 0;
        while written < data.len() {
            written += self.inner.write(&data[written..]).await?;
        }
        Ok(())
    }

    /// Move whatever the encoder has produced so far down to the wrapped
    /// handle.
    async fn drain_encoder(&mut self) -> VfsResult<()> {
        let pending = match self.encoder.as_mut() {
            Some(enc) => std::mem::take(enc.get_mut()),
            None => return Ok(()),
        };
        if pending.is_empty() {
            return Ok(());
        }
        self.write_inner(&pending).await
    }

    /// Pull one compressed chunk from the wrapped handle through the
    /// decoder. Returns false once the source is exhausted.
    async fn fill_decoder(&mut self) -> VfsResult<bool> {
        let mut chunk = [0u8; CHUNK];
        let n = self.inner.read(&mut chunk).await?;
        if n == 0 {
            // an empty source is a clean EOF, not a truncated stream
            if let Some(dec) = self.decoder.take() {
                if self.decoder_fed {
                    let rest = dec.finish().map_err(VfsError::Io)?;
                    self.out.extend_from_slice(&rest);
                }
            }
            self.decoder_done = true;
            return Ok(false);
        }
        self.decoder_fed = true;

        let dec = self
            .decoder
            .as_mut()
            .expect("decoder initialized before fill");
        dec.write_all(&chunk[..n]).map_err(VfsError::Io)?;
        let produced = std::mem::take(dec.get_mut());
        self.out.extend_from_slice(&produced);
        Ok(true)
    }

    fn take_pending(&mut self, buf: &mut [u8]) -> usize {
        let available = self.out.len() - self.out_pos;
        let n = buf.len().min(available);
        buf[..n].copy_from_slice(&self.out[self.out_pos..self.out_pos + n]);
        self.out_pos += n;
        if self.out_pos == self.out.len() {
            self.out.clear();
            self.out_pos = 0;
        }
        n
    }
}

#[async_trait]
impl VfsFile for GzipFile {
    fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&mut self, buf: &mut [u8]) -> VfsResult<usize> {
        self.check_open()?;
        if self.encoder.is_some() {
            return Err(self.refuse("cannot read from a writer"));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        if self.decoder.is_none() && !self.decoder_done {
            self.decoder = Some(GzDecoder::new(Vec::new()));
        }

        loop {
            if self.out_pos < self.out.len() {
                let n = self.take_pending(buf);
                self.read_offset += n as u64;
                return Ok(n);
            }
            if self.decoder_done {
                return Ok(0);
            }
            self.fill_decoder().await?;
        }
    }

    async fn read_at(&mut self, _buf: &mut [u8], _offset: u64) -> VfsResult<usize> {
        self.check_open()?;
        Err(self.refuse("random access not supported"))
    }

    async fn write(&mut self, data: &[u8]) -> VfsResult<usize> {
        self.check_open()?;
        if !self.flags.write {
            return Err(self.refuse("not opened for writing"));
        }
        if self.decoder.is_some() || self.decoder_done {
            return Err(self.refuse("cannot write to a reader"));
        }
        if self.encoder.is_none() {
            self.encoder = Some(GzEncoder::new(Vec::new(), self.level));
        }

        let enc = self.encoder.as_mut().expect("encoder just initialized");
        enc.write_all(data).map_err(VfsError::Io)?;
        self.drain_encoder().await?;
        Ok(data.len())
    }

    async fn write_at(&mut self, _data: &[u8], _offset: u64) -> VfsResult<usize> {
        self.check_open()?;
        Err(self.refuse("random access not supported"))
    }

    async fn seek(&mut self, pos: SeekFrom) -> VfsResult<u64> {
        self.check_open()?;
        match pos {
            SeekFrom::Start(0) if self.read_offset == 0 => Ok(0),
            SeekFrom::Current(0) => Ok(self.read_offset),
            SeekFrom::Current(n) if n > 0 => {
                // forward seek on a stream: read and discard
                let mut remaining = n as u64;
                let mut scratch = [0u8; CHUNK];
                while remaining > 0 {
                    let want = (remaining as usize).min(scratch.len());
                    let got = self.read(&mut scratch[..want]).await?;
                    if got == 0 {
                        break;
                    }
                    remaining -= got as u64;
                }
                Ok(self.read_offset)
            }
            _ => Err(self.refuse("seek not supported on compressed stream")),
        }
    }

    async fn stat(&mut self) -> VfsResult<FileAttr> {
        self.check_open()?;
        self.inner.stat().await
    }

    async fn sync(&mut self) -> VfsResult<()> {
        self.check_open()?;
        if let Some(enc) = self.encoder.as_mut() {
            enc.flush().map_err(VfsError::Io)?;
            self.drain_encoder().await?;
        }
        self.inner.sync().await
    }

    async fn truncate(&mut self, _size: u64) -> VfsResult<()> {
        self.check_open()?;
        Err(self.refuse("truncate not supported on compressed stream"))
    }

    async fn readdir(&mut self, count: Option<usize>) -> VfsResult<Vec<DirEntry>> {
        self.check_open()?;
        self.inner.readdir(count).await
    }

    async fn close(&mut self) -> VfsResult<()> {
        self.check_open()?;
        self.closed = true;

        let mut first_err = None;
        if let Some(enc) = self.encoder.take() {
            match enc.finish() {
                Ok(trailer) => {
                    if let Err(e) = self.write_inner(&trailer).await {
                        first_err = Some(e.context("error finalizing compressed stream"));
                    }
                }
                Err(e) => first_err = Some(VfsError::Io(e)),
            }
        }
        self.decoder = None;

        let closed = self.inner.close().await;
        match first_err {
            Some(e) => Err(e),
            None => closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryFs;
    use crate::util;

    fn overlay() -> (GzipFs, Arc<MemoryFs>) {
        let backing = Arc::new(MemoryFs::new());
        (GzipFs::new(backing.clone()), backing)
    }

    #[tokio::test]
    async fn test_write_then_read_back() {
        let (fs, _backing) = overlay();
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();

        let mut f = fs.create(Path::new("blob.bin")).await.unwrap();
        f.write(&payload).await.unwrap();
        f.close().await.unwrap();

        let data = util::read_all(&fs, Path::new("blob.bin")).await.unwrap();
        assert_eq!(data, payload);
    }

    #[tokio::test]
    async fn test_bytes_on_disk_are_compressed() {
        let (fs, backing) = overlay();
        let payload = vec![b'a'; 10_000];
        util::write_all(&fs, Path::new("a.gz"), &payload).await.unwrap();

        let raw = util::read_all(&*backing, Path::new("a.gz")).await.unwrap();
        assert!(raw.len() < payload.len());
        assert_eq!(&raw[..2], &[0x1f, 0x8b]);
    }

    #[tokio::test]
    async fn test_random_access_refused() {
        let (fs, _backing) = overlay();
        util::write_all(&fs, Path::new("x"), b"payload").await.unwrap();

        let mut f = fs.open(Path::new("x")).await.unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            f.read_at(&mut buf, 1).await.unwrap_err(),
            VfsError::PermissionDenied(_)
        ));
        assert!(matches!(
            f.seek(SeekFrom::End(0)).await.unwrap_err(),
            VfsError::PermissionDenied(_)
        ));
        assert!(matches!(
            f.truncate(0).await.unwrap_err(),
            VfsError::PermissionDenied(_)
        ));
        assert!(!f.can_mmap());
        assert!(matches!(
            f.mmap(0, 4).await.unwrap_err(),
            VfsError::PermissionDenied(_)
        ));
        f.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_one_direction_per_handle() {
        let (fs, _backing) = overlay();
        util::write_all(&fs, Path::new("x"), b"payload").await.unwrap();

        // reader refuses writes
        let mut r = fs
            .open_with(Path::new("x"), OpenFlags::write(), 0o644)
            .await
            .unwrap();
        let mut buf = [0u8; 3];
        r.read(&mut buf).await.unwrap();
        assert!(matches!(
            r.write(b"zzz").await.unwrap_err(),
            VfsError::PermissionDenied(_)
        ));
        r.close().await.unwrap();

        // writer refuses reads
        let mut w = fs.create(Path::new("y")).await.unwrap();
        w.write(b"data").await.unwrap();
        assert!(matches!(
            w.read(&mut buf).await.unwrap_err(),
            VfsError::PermissionDenied(_)
        ));
        w.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_requires_write_flags() {
        let (fs, _backing) = overlay();
        util::write_all(&fs, Path::new("x"), b"payload").await.unwrap();

        let mut f = fs.open(Path::new("x")).await.unwrap();
        assert!(matches!(
            f.write(b"nope").await.unwrap_err(),
            VfsError::PermissionDenied(_)
        ));
        f.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_forward_seek_discards() {
        let (fs, _backing) = overlay();
        util::write_all(&fs, Path::new("x"), b"0123456789").await.unwrap();

        let mut f = fs.open(Path::new("x")).await.unwrap();
        // no-op seeks
        assert_eq!(f.seek(SeekFrom::Start(0)).await.unwrap(), 0);
        assert_eq!(f.seek(SeekFrom::Current(0)).await.unwrap(), 0);

        assert_eq!(f.seek(SeekFrom::Current(4)).await.unwrap(), 4);
        let mut buf = [0u8; 6];
        let n = f.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"456789");

        // restart is refused once the stream has advanced
        assert!(f.seek(SeekFrom::Start(0)).await.is_err());
        f.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_large_multi_chunk_stream() {
        let (fs, _backing) = overlay();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i * 7 % 256) as u8).collect();

        let mut w = fs.create(Path::new("big")).await.unwrap();
        for chunk in payload.chunks(4096) {
            w.write(chunk).await.unwrap();
        }
        w.close().await.unwrap();

        let mut r = fs.open(Path::new("big")).await.unwrap();
        let data = util::read_to_end(&mut *r).await.unwrap();
        r.close().await.unwrap();
        assert_eq!(data, payload);
    }
}
