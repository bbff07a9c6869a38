//! Configuration for the streaming core
//!
//! Defaults are tuned for media playback over HTTP range requests: enough
//! prefetch to keep a player's buffer ahead of the read position without
//! queueing more downloads than the providers have connections.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning knobs for segment loading, prefetch and stream composition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Hard cap on zero-filled segments before downloads fail terminally.
    ///
    /// A handful of corrupt or expired articles inside a large release
    /// should not kill playback; past this budget the release is considered
    /// unusable.
    pub max_zero_fills: usize,

    /// Upper bound on the prefetch window of a reader.
    ///
    /// The effective window is `min(total provider connections,
    /// prefetch_limit)` so background fetches never queue on a saturated
    /// pool.
    pub prefetch_limit: usize,

    /// Chunk size emitted by the virtual stream producer.
    pub chunk_size: usize,

    /// Depth of the producer-to-consumer chunk channel; this bounds
    /// producer read-ahead within the active part.
    pub channel_depth: usize,

    /// Linear readers evict cached segments more than this many positions
    /// behind the read position.
    pub evict_behind: usize,

    /// Deadline for one segment's whole download attempt sequence.
    ///
    /// Runs on the file context, so an abandoned HTTP request does not
    /// abort a nearly-finished download.
    pub segment_deadline: Duration,

    /// How long closing a reader waits for outstanding prefetches.
    pub close_grace: Duration,

    /// Concurrent volume header scans during blueprint construction.
    pub scan_concurrency: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_zero_fills: 10,
            prefetch_limit: 15,
            chunk_size: 1024 * 1024,
            channel_depth: 50,
            evict_behind: 2,
            segment_deadline: Duration::from_secs(300),
            close_grace: Duration::from_secs(3),
            scan_concurrency: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_streaming_contract() {
        let config = StreamConfig::default();
        assert_eq!(config.max_zero_fills, 10);
        assert_eq!(config.prefetch_limit, 15);
        assert_eq!(config.chunk_size, 1024 * 1024);
        assert_eq!(config.channel_depth, 50);
        assert_eq!(config.segment_deadline, Duration::from_secs(300));
    }
}
