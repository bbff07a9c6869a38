//! Contracts shared by physical and virtual files.
//!
//! The archive layer is recursive: a blueprint part may point into an
//! article-backed file or into another composed file. Both sides implement
//! [`StreamableFile`], which is all the composer and the scanner need.

use crate::error::Result;
use async_trait::async_trait;
use newsreel_formats::source::ByteSource;
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A linear reader positioned somewhere in a file's logical stream.
#[async_trait]
pub trait SourceReader: Send {
    /// Read into `buf`. `Ok(0)` only at end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Release resources, waiting briefly for background work.
    async fn close(&mut self);
}

/// Byte-addressable file: named, sized, randomly readable, and able to hand
/// out linear readers.
///
/// Every operation that may await takes the caller's cancellation token;
/// file-internal work runs on the file's own longer-lived context.
#[async_trait]
pub trait StreamableFile: Send + Sync {
    fn name(&self) -> &str;

    /// Total logical size. May trigger the decoded-size probe.
    async fn size(&self, token: &CancellationToken) -> Result<u64>;

    /// Positional read with the standard short-read-only-at-EOF contract.
    async fn read_at(&self, token: &CancellationToken, buf: &mut [u8], offset: u64)
    -> Result<usize>;

    /// Open a linear reader positioned at `offset`.
    async fn open_reader_at(
        &self,
        token: &CancellationToken,
        offset: u64,
    ) -> Result<Box<dyn SourceReader>>;
}

/// Adapter exposing a [`StreamableFile`] to the structural parsers, which
/// want a synchronous size and io-flavored errors.
pub struct FileByteSource {
    file: Arc<dyn StreamableFile>,
    token: CancellationToken,
    size: u64,
    name: String,
}

impl FileByteSource {
    /// Resolve the file's size up front (running the probe if needed).
    pub async fn new(file: Arc<dyn StreamableFile>, token: &CancellationToken) -> Result<Self> {
        let size = file.size(token).await?;
        let name = file.name().to_string();
        Ok(Self {
            file,
            token: token.clone(),
            size,
            name,
        })
    }

    pub fn file(&self) -> &Arc<dyn StreamableFile> {
        &self.file
    }
}

#[async_trait]
impl ByteSource for FileByteSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.file
            .read_at(&self.token, buf, offset)
            .await
            .map_err(io::Error::other)
    }
}

/// Several sources laid end to end as one address space; the 7z scanner
/// reads multi-volume archives through this.
pub struct ConcatSource {
    name: String,
    /// `(start offset, source)` pairs in order.
    parts: Vec<(u64, Arc<FileByteSource>)>,
    total: u64,
}

impl ConcatSource {
    pub fn new(name: impl Into<String>, sources: Vec<Arc<FileByteSource>>) -> Self {
        let mut parts = Vec::with_capacity(sources.len());
        let mut offset = 0u64;
        for source in sources {
            let start = offset;
            offset += ByteSource::size(source.as_ref());
            parts.push((start, source));
        }
        Self {
            name: name.into(),
            parts,
            total: offset,
        }
    }
}

#[async_trait]
impl ByteSource for ConcatSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.total
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.total {
            return Ok(0);
        }
        let mut idx = self
            .parts
            .partition_point(|(start, source)| start + ByteSource::size(source.as_ref()) <= offset);
        let mut pos = offset;
        let mut filled = 0usize;
        while filled < buf.len() && idx < self.parts.len() {
            let (start, source) = &self.parts[idx];
            let local = pos - start;
            let part_remaining = ByteSource::size(source.as_ref()) - local;
            let want = (buf.len() - filled).min(part_remaining as usize);
            let n = source.read_at(local, &mut buf[filled..filled + want]).await?;
            if n == 0 {
                break;
            }
            filled += n;
            pos += n as u64;
            if pos >= start + ByteSource::size(source.as_ref()) {
                idx += 1;
            }
        }
        Ok(filled)
    }
}
