//! Seekable reader over one file.
//!
//! Each opener gets its own cursor and its own cancellation scope. Reads
//! fetch the needed segment first (so the foreground never races its own
//! prefetchers for a connection), then top up a bounded prefetch window
//! sized to the providers' aggregate connection budget. Seeks tear the
//! scope down, which aborts prefetch *waits* but never the underlying
//! downloads; their results still land in the file's shared cache.

use crate::error::{Result, StreamError};
use crate::file::NzbFile;
use crate::traits::SourceReader;
use async_trait::async_trait;
use std::collections::HashSet;
use std::io::SeekFrom;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Reader+Seeker over one [`NzbFile`].
pub struct SegmentReader {
    file: NzbFile,
    /// Parent for reader scopes; survives seeks.
    parent: CancellationToken,
    /// Current prefetch scope; replaced wholesale on seek.
    scope: CancellationToken,
    position: u64,
    seg_idx: usize,
    seg_off: u64,
    /// Indexes already scheduled under the current scope.
    scheduled: HashSet<usize>,
    /// Waiters tracking outstanding prefetches for close().
    waiters: JoinSet<()>,
    total: Option<u64>,
}

impl SegmentReader {
    pub(crate) fn new(file: NzbFile, parent: &CancellationToken) -> Self {
        Self {
            file,
            parent: parent.clone(),
            scope: parent.child_token(),
            position: 0,
            seg_idx: 0,
            seg_off: 0,
            scheduled: HashSet::new(),
            waiters: JoinSet::new(),
            total: None,
        }
    }

    pub(crate) async fn at(file: NzbFile, parent: &CancellationToken, offset: u64) -> Result<Self> {
        let mut reader = Self::new(file, parent);
        let total = reader.total().await?;
        if offset > total {
            return Err(StreamError::OutOfBounds {
                offset,
                size: total,
            });
        }
        reader.relocate(offset);
        reader.prefetch_from(reader.seg_idx);
        Ok(reader)
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    async fn total(&mut self) -> Result<u64> {
        if let Some(total) = self.total {
            return Ok(total);
        }
        // Sizing is file-scoped work; run it on the file context.
        let token = self.file.file_token().clone();
        let total = self.file.size(&token).await?;
        self.total = Some(total);
        Ok(total)
    }

    /// Read at the cursor. `Ok(0)` at end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let total = self.total().await?;
        if self.position >= total {
            return Ok(0);
        }

        // Fetch the segment the caller needs before issuing any background
        // work; the wait runs on the file's long-lived context.
        let file_token = self.file.file_token().clone();
        let data = self.file.download_segment(&file_token, self.seg_idx).await?;

        let local = self.seg_off as usize;
        if local >= data.len() {
            // The trailing span over-estimates the real payload.
            return Ok(0);
        }
        let n = buf
            .len()
            .min(data.len() - local)
            .min((total - self.position) as usize);
        buf[..n].copy_from_slice(&data[local..local + n]);
        self.position += n as u64;

        let span_end = self
            .file
            .segment_span(self.seg_idx)
            .map_or(total, |(_, end)| end);
        if self.position >= span_end {
            self.seg_idx += 1;
            self.seg_off = 0;
            let floor = self
                .seg_idx
                .saturating_sub(self.file.config().evict_behind);
            self.file.evict_before(floor);
        } else {
            self.seg_off += n as u64;
        }

        // Only now top up the prefetch window.
        self.prefetch_from(self.seg_idx + 1);
        Ok(n)
    }

    /// Seek the cursor. Seeking to the current position is free; everything
    /// else resets the prefetch scope and schedules a fresh window.
    pub async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let total = self.total().await?;
        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.position) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(total) + i128::from(delta),
        };
        if target < 0 || target > i128::from(total) {
            return Err(StreamError::OutOfBounds {
                offset: u64::try_from(target.max(0)).unwrap_or(u64::MAX),
                size: total,
            });
        }
        let target = target as u64;
        if target == self.position {
            return Ok(target);
        }

        trace!(
            file = self.file.name(),
            from = self.position,
            to = target,
            "reader seek"
        );
        self.scope.cancel();
        self.scope = self.parent.child_token();
        self.scheduled.clear();
        self.waiters.abort_all();

        self.relocate(target);
        self.prefetch_from(self.seg_idx);
        Ok(target)
    }

    /// Wait out outstanding prefetches (bounded by the close grace), then
    /// release the scope.
    pub async fn close(&mut self) {
        let grace = self.file.config().close_grace;
        let _ = tokio::time::timeout(grace, async {
            while self.waiters.join_next().await.is_some() {}
        })
        .await;
        self.scope.cancel();
        self.waiters.abort_all();
    }

    fn relocate(&mut self, target: u64) {
        let (idx, local) = self.file.locate_segment(target);
        self.position = target;
        self.seg_idx = idx;
        self.seg_off = local;
    }

    /// Schedule downloads for the window starting at `start`, skipping
    /// anything cached, in flight, or already scheduled under this scope.
    fn prefetch_from(&mut self, start: usize) {
        let width = self
            .file
            .total_connections()
            .min(self.file.config().prefetch_limit);
        let count = self.file.segment_count();
        let end = start.saturating_add(width).min(count);

        for idx in start..end {
            if !self.scheduled.insert(idx) {
                continue;
            }
            if self.file.is_cached(idx) || self.file.is_inflight(idx) {
                continue;
            }
            let Ok(mut handle) = self.file.start_download_segment(idx) else {
                continue;
            };
            let scope = self.scope.clone();
            self.waiters.spawn(async move {
                let _ = handle.wait(&scope).await;
            });
        }

        // Drop completed waiters so the set stays small on long reads.
        while self.waiters.try_join_next().is_some() {}
    }
}

#[async_trait]
impl SourceReader for SegmentReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        SegmentReader::read(self, buf).await
    }

    async fn close(&mut self) {
        SegmentReader::close(self).await;
    }
}
