//! Virtual files: contiguous logical streams mapped onto ranges of other
//! files.
//!
//! A [`VirtualPart`] maps `logical [start, end)` onto `source_offset ..` of
//! some [`StreamableFile`]. A [`VirtualFile`] is a sorted, gap-free slice of
//! such parts exposed through the same file contract, which is what makes
//! archive-in-archive recursion possible: the inner scan reads nested
//! volumes without knowing they live inside outer ones.

use crate::error::{Result, StreamError};
use crate::traits::{SourceReader, StreamableFile};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One contiguous mapping into a source file.
#[derive(Clone)]
pub struct VirtualPart {
    /// Logical start offset (inclusive).
    pub start: u64,
    /// Logical end offset (exclusive).
    pub end: u64,
    pub source: Arc<dyn StreamableFile>,
    /// Physical offset within the source.
    pub source_offset: u64,
}

impl VirtualPart {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Debug for VirtualPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualPart")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("source", &self.source.name())
            .field("source_offset", &self.source_offset)
            .finish()
    }
}

/// Index of the part containing `offset`, by binary search on `end`.
pub(crate) fn locate_part(parts: &[VirtualPart], offset: u64) -> Option<usize> {
    let idx = parts.partition_point(|p| p.end <= offset);
    (idx < parts.len()).then_some(idx)
}

/// Re-map the logical range `[start, start + len)` onto fresh parts whose
/// own logical space begins at zero.
///
/// This is the primitive both the archive layer and the 7z volume mapping
/// use to carve a member's byte range out of a composed address space.
pub(crate) fn slice_parts(parts: &[VirtualPart], start: u64, len: u64) -> Vec<VirtualPart> {
    let mut out = Vec::new();
    let end = start + len;
    let mut produced = 0u64;
    let Some(mut idx) = locate_part(parts, start) else {
        return out;
    };
    while idx < parts.len() && start + produced < end {
        let part = &parts[idx];
        let from = (start + produced).max(part.start);
        let until = end.min(part.end);
        if from >= until {
            break;
        }
        let take = until - from;
        out.push(VirtualPart {
            start: produced,
            end: produced + take,
            source: part.source.clone(),
            source_offset: part.source_offset + (from - part.start),
        });
        produced += take;
        idx += 1;
    }
    out
}

struct VirtualInner {
    name: String,
    parts: Vec<VirtualPart>,
    size: u64,
}

/// A file composed of parts of other files.
#[derive(Clone)]
pub struct VirtualFile {
    inner: Arc<VirtualInner>,
}

impl VirtualFile {
    /// Build from sorted, contiguous parts.
    pub fn new(name: impl Into<String>, parts: Vec<VirtualPart>) -> Result<Self> {
        let mut expected = 0u64;
        for part in &parts {
            if part.start != expected || part.end < part.start {
                return Err(StreamError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!(
                        "parts must be contiguous: got [{}, {}) at offset {expected}",
                        part.start, part.end
                    ),
                )));
            }
            expected = part.end;
        }
        Ok(Self {
            inner: Arc::new(VirtualInner {
                name: name.into(),
                parts,
                size: expected,
            }),
        })
    }

    pub fn parts(&self) -> &[VirtualPart] {
        &self.inner.parts
    }

    pub fn len(&self) -> u64 {
        self.inner.size
    }

    pub fn is_empty(&self) -> bool {
        self.inner.size == 0
    }
}

#[async_trait]
impl StreamableFile for VirtualFile {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn size(&self, _token: &CancellationToken) -> Result<u64> {
        Ok(self.inner.size)
    }

    async fn read_at(
        &self,
        token: &CancellationToken,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize> {
        if offset >= self.inner.size || buf.is_empty() {
            return Ok(0);
        }
        let Some(mut idx) = locate_part(&self.inner.parts, offset) else {
            return Ok(0);
        };
        let mut pos = offset;
        let mut filled = 0usize;
        while filled < buf.len() && idx < self.inner.parts.len() {
            let part = &self.inner.parts[idx];
            let local = pos - part.start;
            let want = (buf.len() - filled).min((part.len() - local) as usize);
            let n = part
                .source
                .read_at(token, &mut buf[filled..filled + want], part.source_offset + local)
                .await?;
            if n == 0 {
                break;
            }
            filled += n;
            pos += n as u64;
            if pos >= part.end {
                idx += 1;
            }
        }
        Ok(filled)
    }

    async fn open_reader_at(
        &self,
        token: &CancellationToken,
        offset: u64,
    ) -> Result<Box<dyn SourceReader>> {
        if offset > self.inner.size {
            return Err(StreamError::OutOfBounds {
                offset,
                size: self.inner.size,
            });
        }
        Ok(Box::new(PartReader {
            file: self.clone(),
            token: token.clone(),
            position: offset,
            inner: None,
        }))
    }
}

/// Sequential reader across a virtual file's parts, holding one inner
/// source reader at a time.
pub struct PartReader {
    file: VirtualFile,
    token: CancellationToken,
    position: u64,
    inner: Option<(usize, Box<dyn SourceReader>)>,
}

#[async_trait]
impl SourceReader for PartReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.position >= self.file.inner.size || buf.is_empty() {
            return Ok(0);
        }
        let Some(idx) = locate_part(&self.file.inner.parts, self.position) else {
            return Ok(0);
        };

        if self.inner.as_ref().map(|(i, _)| *i) != Some(idx) {
            if let Some((_, mut old)) = self.inner.take() {
                old.close().await;
            }
            let part = &self.file.inner.parts[idx];
            let reader = part
                .source
                .open_reader_at(
                    &self.token,
                    part.source_offset + (self.position - part.start),
                )
                .await?;
            self.inner = Some((idx, reader));
        }

        let part = &self.file.inner.parts[idx];
        let want = buf.len().min((part.end - self.position) as usize);
        let Some((_, reader)) = self.inner.as_mut() else {
            return Ok(0);
        };
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Ok(0);
        }
        self.position += n as u64;
        if self.position >= part.end {
            // Part exhausted; the next read opens the successor's reader.
            if let Some((_, mut old)) = self.inner.take() {
                old.close().await;
            }
        }
        Ok(n)
    }

    async fn close(&mut self) {
        if let Some((_, mut reader)) = self.inner.take() {
            reader.close().await;
        }
    }
}
