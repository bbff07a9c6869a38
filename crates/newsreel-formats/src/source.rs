//! Positional-read seam between structural parsers and their backing store.
//!
//! Archive volumes live behind the segment loader and are fetched lazily, so
//! the scanners cannot hold a `Read + Seek` handle. [`ByteSource`] is the
//! minimal async contract they need: a name, a known size, and positional
//! reads. The streaming core adapts its file types onto it; tests use
//! [`MemorySource`].

use async_trait::async_trait;
use bytes::Bytes;
use std::io;

/// A named, sized, positionally-readable byte store.
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Human-readable name, used for volume ordering and diagnostics.
    fn name(&self) -> &str;

    /// Total size in bytes.
    fn size(&self) -> u64;

    /// Read up to `buf.len()` bytes starting at `offset`. Returns the number
    /// of bytes read; a short read only occurs at end of source.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Read exactly `buf.len()` bytes starting at `offset`.
    async fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self
                .read_at(offset + filled as u64, &mut buf[filled..])
                .await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "source {:?} ended at {} while reading {} bytes at {}",
                        self.name(),
                        offset + filled as u64,
                        buf.len(),
                        offset
                    ),
                ));
            }
            filled += n;
        }
        Ok(())
    }
}

/// In-memory [`ByteSource`] for tests and fixtures.
#[derive(Debug, Clone)]
pub struct MemorySource {
    name: String,
    data: Bytes,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let start = usize::try_from(offset.min(self.data.len() as u64)).unwrap_or(usize::MAX);
        let end = (start + buf.len()).min(self.data.len());
        let n = end.saturating_sub(start);
        buf[..n].copy_from_slice(&self.data[start..end]);
        Ok(n)
    }
}
