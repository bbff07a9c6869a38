//! The segment loader: one manifest file as a byte-addressable stream.
//!
//! An [`NzbFile`] owns the segment layout of one file in a release and turns
//! segment indexes into decoded bytes: shared cache, in-flight deduplication,
//! provider spillover, and the zero-fill fault policy. Sizing is lazy; the
//! first operation that needs exact offsets probes segment 0 (or adopts an
//! estimator hit) and re-lays the spans out.

use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::estimator::SizeEstimator;
use crate::reader::SegmentReader;
use crate::segment::{Segment, apply_decoded_size, initial_layout};
use crate::traits::{SourceReader, StreamableFile};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet, mapref::entry::Entry};
use newsreel_formats::nzb::FileSpec;
use newsreel_formats::yenc;
use newsreel_nntp::PoolSet;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{OnceCell, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

type SegmentResult = std::result::Result<Bytes, Arc<StreamError>>;

/// Shared budget for the zero-fill fault policy.
///
/// A session wires one instance across all of its files; once the budget is
/// spent, further unrecoverable segments fail with
/// [`StreamError::TooManyFailedSegments`] instead of degrading silently.
#[derive(Debug)]
pub struct ZeroFillBudget {
    cap: usize,
    used: AtomicUsize,
}

impl ZeroFillBudget {
    pub fn new(cap: usize) -> Arc<Self> {
        Arc::new(Self {
            cap,
            used: AtomicUsize::new(0),
        })
    }

    /// Zero-filled segments so far.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    /// Account one zero-fill. Returns false once the cap is exceeded.
    fn register(&self) -> bool {
        self.used.fetch_add(1, Ordering::SeqCst) + 1 <= self.cap
    }
}

/// Completion of one shared segment download.
///
/// Clonable; every waiter observes the same published result. Dropping or
/// cancelling a wait never aborts the underlying download.
#[derive(Clone)]
pub struct CompletionHandle {
    rx: watch::Receiver<Option<SegmentResult>>,
}

impl CompletionHandle {
    fn ready(result: SegmentResult) -> Self {
        let (_tx, rx) = watch::channel(Some(result));
        Self { rx }
    }

    /// Await the download's outcome, honoring `token` for the wait only.
    pub async fn wait(&mut self, token: &CancellationToken) -> Result<Bytes> {
        loop {
            if let Some(result) = self.rx.borrow_and_update().clone() {
                return result.map_err(StreamError::Shared);
            }
            tokio::select! {
                changed = self.rx.changed() => {
                    if changed.is_err() {
                        return Err(StreamError::Cancelled);
                    }
                }
                () = token.cancelled() => return Err(StreamError::Cancelled),
            }
        }
    }
}

struct FileInner {
    name: String,
    group: Option<String>,
    segments: RwLock<Vec<Segment>>,
    /// Total logical size; set exactly once by the decoded-size probe.
    total_size: OnceCell<u64>,
    pools: Arc<PoolSet>,
    estimator: Arc<SizeEstimator>,
    budget: Arc<ZeroFillBudget>,
    cache: DashMap<usize, Bytes>,
    inflight: DashMap<usize, CompletionHandle>,
    zero_filled: DashSet<usize>,
    /// Long-lived file context; bounds downloads, outlives any reader.
    token: CancellationToken,
    config: Arc<StreamConfig>,
}

/// One file of a release, loaded lazily from its article segments.
#[derive(Clone)]
pub struct NzbFile {
    inner: Arc<FileInner>,
}

impl NzbFile {
    pub fn new(
        spec: &FileSpec,
        pools: Arc<PoolSet>,
        estimator: Arc<SizeEstimator>,
        budget: Arc<ZeroFillBudget>,
        config: Arc<StreamConfig>,
    ) -> Self {
        Self {
            inner: Arc::new(FileInner {
                name: spec.file_name(),
                group: spec.groups.first().cloned(),
                segments: RwLock::new(initial_layout(&spec.segments)),
                total_size: OnceCell::new(),
                pools,
                estimator,
                budget,
                cache: DashMap::new(),
                inflight: DashMap::new(),
                zero_filled: DashSet::new(),
                token: CancellationToken::new(),
                config,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn segment_count(&self) -> usize {
        self.inner.segments.read().len()
    }

    /// The file's long-lived context. Reader-scoped tokens derive from it.
    pub fn file_token(&self) -> &CancellationToken {
        &self.inner.token
    }

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    /// Aggregate provider connection budget; drives prefetch width.
    pub fn total_connections(&self) -> usize {
        self.inner.pools.total_connections()
    }

    /// Abort all in-flight work for this file.
    pub fn shutdown(&self) {
        self.inner.token.cancel();
    }

    /// Segments this file served as zeros.
    pub fn zero_filled_count(&self) -> usize {
        self.inner.zero_filled.len()
    }

    /// Total logical decoded size, probing lazily on first use.
    pub async fn size(&self, token: &CancellationToken) -> Result<u64> {
        self.ensure_sized(token).await
    }

    async fn ensure_sized(&self, token: &CancellationToken) -> Result<u64> {
        self.inner
            .total_size
            .get_or_try_init(|| async {
                let encoded0 = self
                    .inner
                    .segments
                    .read()
                    .first()
                    .map_or(0, |s| s.encoded_size);
                if encoded0 == 0 {
                    return Ok(0);
                }

                let decoded = match self.inner.estimator.get(encoded0) {
                    Some(decoded) => {
                        trace!(file = %self.inner.name, decoded, "estimator hit, probe skipped");
                        decoded
                    }
                    None => {
                        let bytes = self.download_segment(token, 0).await?;
                        let decoded = bytes.len() as u64;
                        if self.inner.zero_filled.contains(&0) {
                            // A zero-filled probe carries no layout signal;
                            // keep the encoded span and leave the estimator
                            // untouched.
                            decoded
                        } else {
                            self.inner.estimator.set(encoded0, decoded);
                            decoded
                        }
                    }
                };

                let total = {
                    let mut segments = self.inner.segments.write();
                    apply_decoded_size(&mut segments, decoded);
                    segments.last().map_or(0, |s| s.end)
                };
                debug!(file = %self.inner.name, total, "decoded size detected");
                Ok(total)
            })
            .await
            .copied()
    }

    /// Positional read. Fetches successive segments until `buf` is full or
    /// EOF; never evicts (random access composes its own cache policy).
    pub async fn read_at(
        &self,
        token: &CancellationToken,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize> {
        let total = self.ensure_sized(token).await?;
        if offset >= total || buf.is_empty() {
            return Ok(0);
        }

        let (mut idx, _) = self.locate_segment(offset);
        let mut pos = offset;
        let mut filled = 0usize;
        while filled < buf.len() && pos < total {
            let Some((seg_start, seg_end)) = self.segment_span(idx) else {
                break;
            };
            let data = self.download_segment(token, idx).await?;
            let local = (pos - seg_start) as usize;
            if local >= data.len() {
                // The laid-out span over-estimates the trailing segment;
                // treat the gap as end of stream.
                break;
            }
            let n = (buf.len() - filled).min(data.len() - local);
            buf[filled..filled + n].copy_from_slice(&data[local..local + n]);
            filled += n;
            pos += n as u64;
            if pos >= seg_end {
                idx += 1;
            }
        }
        Ok(filled)
    }

    /// Await one segment's decoded bytes: cache hit, attach to an in-flight
    /// download, or start one.
    pub async fn download_segment(&self, token: &CancellationToken, idx: usize) -> Result<Bytes> {
        let mut handle = self.start_download_segment(idx)?;
        handle.wait(token).await
    }

    /// Fire-and-forget registration used by prefetchers. The download runs
    /// on the file context regardless of who waits.
    pub fn start_download_segment(&self, idx: usize) -> Result<CompletionHandle> {
        let count = self.segment_count();
        if idx >= count {
            return Err(StreamError::OutOfBounds {
                offset: idx as u64,
                size: count as u64,
            });
        }
        if let Some(cached) = self.inner.cache.get(&idx) {
            return Ok(CompletionHandle::ready(Ok(cached.clone())));
        }

        match self.inner.inflight.entry(idx) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                // The publish path inserts into the cache while holding this
                // entry, so a re-check here cannot race with completion.
                if let Some(cached) = self.inner.cache.get(&idx) {
                    return Ok(CompletionHandle::ready(Ok(cached.clone())));
                }
                let (tx, rx) = watch::channel(None);
                let handle = CompletionHandle { rx };
                entry.insert(handle.clone());
                self.spawn_worker(idx, tx);
                Ok(handle)
            }
        }
    }

    fn spawn_worker(&self, idx: usize, tx: watch::Sender<Option<SegmentResult>>) {
        let file = self.clone();
        let file_token = self.inner.token.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                result = file.fetch_with_deadline(idx) => result,
                () = file_token.cancelled() => Err(StreamError::Cancelled),
            };
            match result {
                Ok(bytes) => {
                    // Cache before releasing the in-flight entry so late
                    // callers observe one or the other, never neither.
                    match file.inner.inflight.entry(idx) {
                        Entry::Occupied(entry) => {
                            file.inner.cache.insert(idx, bytes.clone());
                            entry.remove();
                        }
                        Entry::Vacant(_) => {
                            file.inner.cache.insert(idx, bytes.clone());
                        }
                    }
                    let _ = tx.send(Some(Ok(bytes)));
                }
                Err(error) => {
                    file.inner.inflight.remove(&idx);
                    let _ = tx.send(Some(Err(Arc::new(error))));
                }
            }
        });
    }

    async fn fetch_with_deadline(&self, idx: usize) -> Result<Bytes> {
        let deadline = self.inner.config.segment_deadline;
        match tokio::time::timeout(deadline, self.fetch_segment(idx)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    file = %self.inner.name,
                    segment = idx,
                    ?deadline,
                    "segment download deadline expired"
                );
                Err(StreamError::Deadline)
            }
        }
    }

    /// One download attempt sequence: spill across the pool set, decode,
    /// and fall back to zeros when every provider failed.
    async fn fetch_segment(&self, idx: usize) -> Result<Bytes> {
        let (message_id, span) = {
            let segments = self.inner.segments.read();
            let segment = &segments[idx];
            (segment.message_id.clone(), segment.len())
        };

        let pools = &self.inner.pools;
        if pools.is_empty() {
            return Err(StreamError::Nntp(newsreel_nntp::NntpError::PoolClosed));
        }
        let mut tried = vec![false; pools.len()];
        let mut last_error = StreamError::Nntp(newsreel_nntp::NntpError::PoolClosed);

        loop {
            let acquired = match pools.acquire(&mut tried, &self.inner.token).await {
                Ok(acquired) => acquired,
                Err(newsreel_nntp::NntpError::Cancelled) => return Err(StreamError::Cancelled),
                Err(error) => {
                    // Dial or authentication failures exhausted the set.
                    last_error = error.into();
                    break;
                }
            };
            let Some((pool_idx, mut client, guard)) = acquired else {
                break;
            };
            let pool = &pools.pools()[pool_idx];

            if let Some(group) = &self.inner.group {
                if let Err(error) = client.select_group(group).await {
                    trace!(%group, %error, "group selection failed, continuing");
                }
            }

            match client.body(&message_id).await {
                Ok(raw) => match yenc::decode(&raw) {
                    Ok(decoded) => {
                        pool.put(client, guard);
                        trace!(
                            file = %self.inner.name,
                            segment = idx,
                            bytes = decoded.data.len(),
                            "segment downloaded"
                        );
                        return Ok(decoded.data);
                    }
                    Err(error) => {
                        pool.put(client, guard);
                        warn!(
                            file = %self.inner.name,
                            segment = idx,
                            pool = pool_idx,
                            %error,
                            "segment decode failed"
                        );
                        tried[pool_idx] = true;
                        last_error = error.into();
                    }
                },
                Err(error) => {
                    if error.is_transport() {
                        pool.discard(client, guard);
                    } else {
                        pool.put(client, guard);
                    }
                    debug!(
                        file = %self.inner.name,
                        segment = idx,
                        pool = pool_idx,
                        %error,
                        "segment fetch failed on provider"
                    );
                    tried[pool_idx] = true;
                    last_error = error.into();
                }
            }
        }

        self.zero_fill(idx, span, last_error)
    }

    fn zero_fill(&self, idx: usize, span: u64, cause: StreamError) -> Result<Bytes> {
        if !self.inner.budget.register() {
            warn!(
                file = %self.inner.name,
                segment = idx,
                "zero-fill budget exhausted"
            );
            return Err(StreamError::TooManyFailedSegments {
                source: Box::new(cause),
            });
        }
        warn!(
            file = %self.inner.name,
            segment = idx,
            bytes = span,
            %cause,
            "zero-filling unrecoverable segment"
        );
        self.inner.zero_filled.insert(idx);
        Ok(Bytes::from(vec![0u8; span as usize]))
    }

    /// Open a seekable reader over the whole file.
    pub fn open_stream(&self, token: &CancellationToken) -> SegmentReader {
        SegmentReader::new(self.clone(), token)
    }

    /// Open a linear reader positioned at `offset`.
    pub async fn open_reader_at(
        &self,
        token: &CancellationToken,
        offset: u64,
    ) -> Result<SegmentReader> {
        SegmentReader::at(self.clone(), token, offset).await
    }

    /// Drop cached segments below `idx`; linear readers call this as they
    /// advance to bound memory.
    pub fn evict_before(&self, idx: usize) {
        self.inner.cache.retain(|&key, _| key >= idx);
    }

    pub(crate) fn is_cached(&self, idx: usize) -> bool {
        self.inner.cache.contains_key(&idx)
    }

    pub(crate) fn is_inflight(&self, idx: usize) -> bool {
        self.inner.inflight.contains_key(&idx)
    }

    /// `(start, end)` span of a segment, `None` past the last one.
    pub(crate) fn segment_span(&self, idx: usize) -> Option<(u64, u64)> {
        self.inner
            .segments
            .read()
            .get(idx)
            .map(|s| (s.start, s.end))
    }

    /// Locate the segment containing `offset`: `(index, local offset)`.
    pub(crate) fn locate_segment(&self, offset: u64) -> (usize, u64) {
        let segments = self.inner.segments.read();
        let idx = segments.partition_point(|s| s.end <= offset);
        let local = segments.get(idx).map_or(0, |s| offset - s.start);
        (idx, local)
    }
}

#[async_trait]
impl StreamableFile for NzbFile {
    fn name(&self) -> &str {
        self.name()
    }

    async fn size(&self, token: &CancellationToken) -> Result<u64> {
        self.ensure_sized(token).await
    }

    async fn read_at(
        &self,
        token: &CancellationToken,
        buf: &mut [u8],
        offset: u64,
    ) -> Result<usize> {
        NzbFile::read_at(self, token, buf, offset).await
    }

    async fn open_reader_at(
        &self,
        token: &CancellationToken,
        offset: u64,
    ) -> Result<Box<dyn SourceReader>> {
        let reader = NzbFile::open_reader_at(self, token, offset).await?;
        Ok(Box::new(reader))
    }
}
