//! In-memory file doubles for unit tests.

use crate::error::Result;
use crate::traits::{SourceReader, StreamableFile};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

/// A [`StreamableFile`] over a byte buffer, counting opened readers.
pub(crate) struct MemoryFile {
    name: String,
    data: Bytes,
    readers_opened: Arc<AtomicUsize>,
}

impl MemoryFile {
    pub(crate) fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            readers_opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn readers_opened(&self) -> usize {
        self.readers_opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamableFile for MemoryFile {
    fn name(&self) -> &str {
        &self.name
    }

    async fn size(&self, _token: &CancellationToken) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    async fn read_at(
        &self,
        _token: &CancellationToken,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize> {
        let start = (offset.min(self.data.len() as u64)) as usize;
        let end = (start + buf.len()).min(self.data.len());
        let n = end.saturating_sub(start);
        buf[..n].copy_from_slice(&self.data[start..end]);
        Ok(n)
    }

    async fn open_reader_at(
        &self,
        _token: &CancellationToken,
        offset: u64,
    ) -> Result<Box<dyn SourceReader>> {
        self.readers_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryReader {
            data: self.data.clone(),
            position: offset.min(self.data.len() as u64) as usize,
        }))
    }
}

struct MemoryReader {
    data: Bytes,
    position: usize,
}

#[async_trait]
impl SourceReader for MemoryReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let end = (self.position + buf.len()).min(self.data.len());
        let n = end.saturating_sub(self.position);
        buf[..n].copy_from_slice(&self.data[self.position..end]);
        self.position = end;
        Ok(n)
    }

    async fn close(&mut self) {}
}
