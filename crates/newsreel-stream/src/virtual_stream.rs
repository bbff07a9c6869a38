//! The virtual stream composer.
//!
//! Concatenates a sorted slice of [`VirtualPart`]s into one seekable logical
//! stream. A single producer task walks the active part, holds a source
//! reader across successive chunk reads within it, and emits bounded chunks;
//! the consumer half copies chunks into caller buffers and implements the
//! three-tier seek: no-op, fast-forward within the already-produced range,
//! or a producer relocation through the seek channel.
//!
//! Stale data after a relocation is fenced by generation numbers rather
//! than channel draining alone, so a chunk the producer was mid-send with
//! during a seek can never leak into the new position's byte stream.

use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::virtual_file::{VirtualPart, locate_part};
use bytes::{Buf, Bytes};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

struct Chunk {
    generation: u64,
    data: Bytes,
}

enum Status {
    Eof { generation: u64 },
    Error { generation: u64, error: StreamError },
}

struct SeekCommand {
    generation: u64,
    target: u64,
}

/// Consumer half of a composed stream.
pub struct VirtualStream {
    data_rx: mpsc::Receiver<Chunk>,
    status_rx: mpsc::Receiver<Status>,
    seek_tx: mpsc::Sender<SeekCommand>,
    /// High-water mark of bytes the producer has emitted (current
    /// generation); the ceiling for fast-forward seeks.
    produced: Arc<AtomicU64>,
    restarts: Arc<AtomicUsize>,
    token: CancellationToken,
    position: u64,
    total: u64,
    generation: u64,
    current: Option<Bytes>,
    eof: bool,
}

impl VirtualStream {
    /// Spawn the producer and hand back the consumer.
    pub fn open(
        parts: Vec<VirtualPart>,
        total_size: u64,
        parent: &CancellationToken,
        config: &StreamConfig,
    ) -> Self {
        let (data_tx, data_rx) = mpsc::channel(config.channel_depth.max(1));
        let (status_tx, status_rx) = mpsc::channel(8);
        let (seek_tx, seek_rx) = mpsc::channel(8);
        let produced = Arc::new(AtomicU64::new(0));
        let restarts = Arc::new(AtomicUsize::new(0));
        let token = parent.child_token();

        let producer = Producer {
            parts: Arc::new(parts),
            total: total_size,
            chunk_size: config.chunk_size.max(1),
            data_tx,
            status_tx,
            seek_rx,
            produced: produced.clone(),
            restarts: restarts.clone(),
            token: token.clone(),
        };
        tokio::spawn(producer.run());

        Self {
            data_rx,
            status_rx,
            seek_tx,
            produced,
            restarts,
            token,
            position: 0,
            total: total_size,
            generation: 0,
            current: None,
            eof: false,
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Times the producer had to relocate; buffered fast-forwards do not
    /// count.
    pub fn producer_restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    /// High-water mark of bytes the producer has emitted so far; forward
    /// seeks at or below it stay in the buffered fast path.
    pub fn buffered_through(&self) -> u64 {
        self.produced.load(Ordering::Acquire)
    }

    /// Read at the cursor. `Ok(0)` at end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || self.position >= self.total {
            return Ok(0);
        }
        loop {
            if let Some(chunk) = &mut self.current {
                if chunk.is_empty() {
                    self.current = None;
                    continue;
                }
                let n = buf.len().min(chunk.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                chunk.advance(n);
                if chunk.is_empty() {
                    self.current = None;
                }
                self.position += n as u64;
                return Ok(n);
            }
            if self.eof {
                return Ok(0);
            }

            tokio::select! {
                biased;
                chunk = self.data_rx.recv() => match chunk {
                    Some(c) if c.generation == self.generation => self.current = Some(c.data),
                    Some(_) => {} // stale generation, discard
                    None => return Err(StreamError::Cancelled),
                },
                status = self.status_rx.recv() => match status {
                    Some(Status::Eof { generation }) if generation == self.generation => {
                        self.eof = true;
                    }
                    Some(Status::Error { generation, error }) if generation == self.generation => {
                        return Err(error);
                    }
                    Some(_) => {}
                    None => return Err(StreamError::Cancelled),
                },
                () = self.token.cancelled() => return Err(StreamError::Cancelled),
            }
        }
    }

    /// Seek the cursor.
    ///
    /// Order of optimization: seeking to the current offset is free; a
    /// forward seek within the produced range skips buffered chunks without
    /// touching the producer; anything else posts a relocation.
    pub async fn seek(&mut self, target: u64) -> Result<u64> {
        if target > self.total {
            return Err(StreamError::OutOfBounds {
                offset: target,
                size: self.total,
            });
        }
        if target == self.position {
            return Ok(target);
        }

        let produced = self.produced.load(Ordering::Acquire);
        if !self.eof && target > self.position && target <= produced {
            trace!(from = self.position, to = target, "buffered fast-forward");
            self.skip_forward(target).await?;
            return Ok(self.position);
        }

        debug!(from = self.position, to = target, "stream relocation");
        self.generation += 1;
        self.seek_tx
            .send(SeekCommand {
                generation: self.generation,
                target,
            })
            .await
            .map_err(|_| StreamError::Cancelled)?;

        // Free channel slots so a producer blocked mid-send can observe the
        // seek; anything drained here is stale by generation.
        while self.data_rx.try_recv().is_ok() {}
        while self.status_rx.try_recv().is_ok() {}

        self.current = None;
        self.eof = false;
        self.position = target;
        Ok(target)
    }

    /// Discard buffered bytes up to `target`, adjusting into the chunk that
    /// straddles it.
    async fn skip_forward(&mut self, target: u64) -> Result<()> {
        while self.position < target {
            if let Some(chunk) = &mut self.current {
                let n = ((target - self.position).min(chunk.len() as u64)) as usize;
                chunk.advance(n);
                self.position += n as u64;
                if chunk.is_empty() {
                    self.current = None;
                }
                continue;
            }
            match self.data_rx.recv().await {
                Some(c) if c.generation == self.generation => self.current = Some(c.data),
                Some(_) => {}
                None => return Err(StreamError::Cancelled),
            }
        }
        Ok(())
    }

    /// Stop the producer and release the channels.
    pub async fn close(mut self) {
        self.token.cancel();
        self.data_rx.close();
        self.status_rx.close();
    }
}

impl Drop for VirtualStream {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Producer task: walks parts, holds the active source reader, emits chunks.
struct Producer {
    parts: Arc<Vec<VirtualPart>>,
    total: u64,
    chunk_size: usize,
    data_tx: mpsc::Sender<Chunk>,
    status_tx: mpsc::Sender<Status>,
    seek_rx: mpsc::Receiver<SeekCommand>,
    produced: Arc<AtomicU64>,
    restarts: Arc<AtomicUsize>,
    token: CancellationToken,
}

impl Producer {
    async fn run(mut self) {
        let mut generation = 0u64;
        let mut position = 0u64;
        let mut reader: Option<(usize, Box<dyn crate::traits::SourceReader>)> = None;
        // Relocation handed back by a park (EOF or failure), applied at the
        // top of the loop together with freshly queued seeks.
        let mut pending_seek: Option<SeekCommand> = None;

        loop {
            while let Some(cmd) = pending_seek.take().or_else(|| self.seek_rx.try_recv().ok()) {
                generation = cmd.generation;
                position = cmd.target;
                if let Some((_, mut old)) = reader.take() {
                    old.close().await;
                }
                self.restarts.fetch_add(1, Ordering::SeqCst);
                self.produced.store(position, Ordering::Release);
            }

            if position >= self.total {
                if self
                    .status_tx
                    .send(Status::Eof { generation })
                    .await
                    .is_err()
                {
                    return;
                }
                match self.park().await {
                    Some(cmd) => {
                        pending_seek = Some(cmd);
                        continue;
                    }
                    None => return,
                }
            }

            let Some(part_idx) = locate_part(&self.parts, position) else {
                let error = StreamError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("no part covers offset {position}"),
                ));
                match self.fail(generation, error).await {
                    Some(cmd) => {
                        pending_seek = Some(cmd);
                        continue;
                    }
                    None => return,
                }
            };

            // (Re-)open the source reader when the active part changed; it
            // is held across successive chunk reads within one part.
            if reader.as_ref().map(|(idx, _)| *idx) != Some(part_idx) {
                if let Some((_, mut old)) = reader.take() {
                    old.close().await;
                }
                let part = &self.parts[part_idx];
                let open = part
                    .source
                    .open_reader_at(&self.token, part.source_offset + (position - part.start))
                    .await;
                match open {
                    Ok(r) => reader = Some((part_idx, r)),
                    Err(error) => {
                        match self.fail(generation, error).await {
                            Some(cmd) => pending_seek = Some(cmd),
                            None => return,
                        }
                        continue;
                    }
                }
            }

            let part_end = self.parts[part_idx].end.min(self.total);
            let want = self.chunk_size.min((part_end - position) as usize);
            let mut buf = vec![0u8; want];
            let Some((_, active)) = reader.as_mut() else {
                continue;
            };
            let read = tokio::select! {
                r = active.read(&mut buf) => r,
                () = self.token.cancelled() => return,
            };

            match read {
                Ok(0) => {
                    let error = StreamError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("source ended early at offset {position}"),
                    ));
                    reader = None;
                    match self.fail(generation, error).await {
                        Some(cmd) => pending_seek = Some(cmd),
                        None => return,
                    }
                }
                Ok(n) => {
                    buf.truncate(n);
                    let chunk = Chunk {
                        generation,
                        data: Bytes::from(buf),
                    };
                    tokio::select! {
                        sent = self.data_tx.send(chunk) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                        () = self.token.cancelled() => return,
                    }
                    position += n as u64;
                    self.produced.store(position, Ordering::Release);
                    if position >= part_end {
                        if let Some((_, mut old)) = reader.take() {
                            old.close().await;
                        }
                    }
                }
                Err(error) => {
                    reader = None;
                    match self.fail(generation, error).await {
                        Some(cmd) => pending_seek = Some(cmd),
                        None => return,
                    }
                }
            }
        }
    }

    /// Report a failure, then park awaiting a seek. Returns the relocation
    /// to apply, or `None` when the stream is being torn down.
    async fn fail(&mut self, generation: u64, error: StreamError) -> Option<SeekCommand> {
        debug!(%error, "virtual stream producer error");
        if self
            .status_tx
            .send(Status::Error { generation, error })
            .await
            .is_err()
        {
            return None;
        }
        // Stay alive: the consumer may seek elsewhere (or close).
        self.park().await
    }

    async fn park(&mut self) -> Option<SeekCommand> {
        tokio::select! {
            cmd = self.seek_rx.recv() => cmd,
            () = self.token.cancelled() => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testutil::MemoryFile;
    use pretty_assertions::assert_eq;

    fn three_part_stream(config: &StreamConfig) -> (VirtualStream, Vec<u8>) {
        // Logical stream 0..5000 over three memory-backed parts, matching
        // the classic {0..1000, 1000..3000, 3000..5000} shape.
        let expected: Vec<u8> = (0..5000u64).map(|i| (i % 251) as u8).collect();
        let parts = vec![
            part(&expected[..1000], 0),
            part(&expected[1000..3000], 1000),
            part(&expected[3000..], 3000),
        ];
        let token = CancellationToken::new();
        (VirtualStream::open(parts, 5000, &token, config), expected)
    }

    fn part(data: &[u8], start: u64) -> VirtualPart {
        VirtualPart {
            start,
            end: start + data.len() as u64,
            source: Arc::new(MemoryFile::new(format!("part@{start}"), data.to_vec())),
            source_offset: 0,
        }
    }

    async fn read_exact(stream: &mut VirtualStream, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = stream
                .read(&mut out[filled..])
                .await
                .expect("Operation should succeed");
            assert!(n > 0, "unexpected EOF at {filled}");
            filled += n;
        }
        out
    }

    #[tokio::test]
    async fn end_to_end_matches_part_concatenation() {
        let config = StreamConfig::default();
        let (mut stream, expected) = three_part_stream(&config);

        let mut out = Vec::new();
        let mut buf = [0u8; 700];
        loop {
            let n = stream.read(&mut buf).await.expect("Operation should succeed");
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out.len(), 5000);
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn forward_seek_within_buffer_avoids_restart() {
        // Small chunks so several sit buffered in the channel.
        let config = StreamConfig {
            chunk_size: 250,
            ..StreamConfig::default()
        };
        let (mut stream, expected) = three_part_stream(&config);

        let head = read_exact(&mut stream, 500).await;
        assert_eq!(head, &expected[..500]);

        // Wait until the producer has pushed past the target.
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
        while stream.produced.load(Ordering::Acquire) < 1500 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::task::yield_now().await;
        }

        stream.seek(1500).await.expect("Operation should succeed");
        let after = read_exact(&mut stream, 100).await;
        assert_eq!(after, &expected[1500..1600]);
        assert_eq!(stream.producer_restarts(), 0, "no relocation expected");
    }

    #[tokio::test]
    async fn backward_seek_relocates_producer() {
        let config = StreamConfig::default();
        let (mut stream, expected) = three_part_stream(&config);

        let _ = read_exact(&mut stream, 4000).await;
        stream.seek(100).await.expect("Operation should succeed");

        let out = read_exact(&mut stream, 200).await;
        assert_eq!(out, &expected[100..300]);
        assert!(stream.producer_restarts() >= 1);
    }

    #[tokio::test]
    async fn seek_to_current_is_noop() {
        let config = StreamConfig::default();
        let (mut stream, _) = three_part_stream(&config);
        let _ = read_exact(&mut stream, 100).await;

        stream.seek(100).await.expect("Operation should succeed");
        assert_eq!(stream.position(), 100);
        assert_eq!(stream.producer_restarts(), 0);
    }

    #[tokio::test]
    async fn seek_past_end_is_out_of_bounds() {
        let config = StreamConfig::default();
        let (mut stream, _) = three_part_stream(&config);

        let err = stream.seek(5001).await.expect_err("Test operation should fail");
        assert!(matches!(
            err,
            StreamError::OutOfBounds {
                offset: 5001,
                size: 5000
            }
        ));
    }

    #[tokio::test]
    async fn read_past_eof_returns_zero_and_seek_revives() {
        let config = StreamConfig::default();
        let (mut stream, expected) = three_part_stream(&config);

        let _ = read_exact(&mut stream, 5000).await;
        let mut buf = [0u8; 16];
        assert_eq!(
            stream.read(&mut buf).await.expect("Operation should succeed"),
            0
        );

        // The producer stays alive after EOF and serves a later seek.
        stream.seek(4990).await.expect("Operation should succeed");
        let tail = read_exact(&mut stream, 10).await;
        assert_eq!(tail, &expected[4990..]);
    }

    #[tokio::test]
    async fn reader_held_across_chunks_within_part() {
        let data: Vec<u8> = vec![7u8; 4000];
        let file = Arc::new(MemoryFile::new("solo", data));
        let parts = vec![VirtualPart {
            start: 0,
            end: 4000,
            source: file.clone(),
            source_offset: 0,
        }];
        let token = CancellationToken::new();
        let config = StreamConfig {
            chunk_size: 500,
            ..StreamConfig::default()
        };
        let mut stream = VirtualStream::open(parts, 4000, &token, &config);

        let _ = read_exact(&mut stream, 4000).await;
        // Eight chunks, one reader.
        assert_eq!(file.readers_opened(), 1);
    }
}
