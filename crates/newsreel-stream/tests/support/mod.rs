//! Shared helpers for end-to-end tests: posting releases to the mock NNTP
//! server and wiring files over it.

#![allow(dead_code)]

use newsreel_formats::nzb::{FileSpec, SegmentSpec};
use newsreel_nntp::testing::{ArticleBehavior, TestServer};
use newsreel_nntp::{PoolSet, ProviderConfig};
use newsreel_stream::{NzbFile, SizeEstimator, StreamConfig, ZeroFillBudget};
use std::sync::Arc;

/// Minimal yEnc encoder for article fixtures.
pub fn yenc_encode(payload: &[u8], name: &str, part: u32, begin: u64) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(
        format!(
            "=ybegin part={part} line=128 size={} name={name}\r\n",
            payload.len()
        )
        .as_bytes(),
    );
    out.extend_from_slice(
        format!("=ypart begin={begin} end={}\r\n", begin + payload.len() as u64 - 1).as_bytes(),
    );

    let mut col = 0usize;
    for &b in payload {
        let enc = b.wrapping_add(42);
        if matches!(enc, 0x00 | 0x0A | 0x0D | b'=') || (col == 0 && enc == b'.') {
            out.push(b'=');
            out.push(enc.wrapping_add(64));
            col += 2;
        } else {
            out.push(enc);
            col += 1;
        }
        if col >= 128 {
            out.extend_from_slice(b"\r\n");
            col = 0;
        }
    }
    if col > 0 {
        out.extend_from_slice(b"\r\n");
    }

    let crc = crc32_of(payload);
    out.extend_from_slice(
        format!(
            "=yend size={} part={part} pcrc32={crc:08x}\r\n",
            payload.len()
        )
        .as_bytes(),
    );
    out
}

/// CRC32 (IEEE) without pulling the codec crate into the test tree.
fn crc32_of(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &b in data {
        crc ^= u32::from(b);
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

/// Post one file to the server with explicit per-segment payload sizes and
/// declared encoded sizes, returning its manifest entry.
///
/// Declared sizes drive the initial layout and the estimator; they do not
/// need to match the wire bodies.
pub fn post_file_with_layout(
    server: &TestServer,
    file_name: &str,
    payload: &[u8],
    chunk_sizes: &[usize],
    declared: &[u64],
) -> FileSpec {
    assert_eq!(chunk_sizes.len(), declared.len());
    let mut segments = Vec::new();
    let mut offset = 0usize;
    for (i, (&chunk, &encoded_size)) in chunk_sizes.iter().zip(declared).enumerate() {
        let end = (offset + chunk).min(payload.len());
        let data = &payload[offset..end];
        let message_id = format!("{file_name}.{i}@mock");
        let body = yenc_encode(data, file_name, i as u32 + 1, offset as u64 + 1);
        server.add_article(&message_id, ArticleBehavior::Body(body));
        segments.push(SegmentSpec {
            message_id,
            number: i as u32 + 1,
            encoded_size,
        });
        offset = end;
    }
    FileSpec {
        subject: format!("\"{file_name}\" yEnc (1/{})", segments.len()),
        groups: vec!["alt.binaries.test".to_string()],
        segments,
    }
}

/// Post a file split into equal chunks, declaring a constant encoded size so
/// the probe re-layout lands exactly on the payload length.
pub fn post_file(
    server: &TestServer,
    file_name: &str,
    payload: &[u8],
    segment_payload: usize,
    declared: u64,
) -> FileSpec {
    assert_eq!(
        payload.len() % segment_payload,
        0,
        "equal-chunk posting needs a multiple of the segment size"
    );
    let count = payload.len() / segment_payload;
    post_file_with_layout(
        server,
        file_name,
        payload,
        &vec![segment_payload; count],
        &vec![declared; count],
    )
}

/// Everything a file needs around it, wired to one or more servers.
pub struct Session {
    pub pools: Arc<PoolSet>,
    pub estimator: Arc<SizeEstimator>,
    pub budget: Arc<ZeroFillBudget>,
    pub config: Arc<StreamConfig>,
}

impl Session {
    pub fn new(configs: Vec<ProviderConfig>) -> Self {
        Self::with_budget(configs, 10)
    }

    pub fn with_budget(configs: Vec<ProviderConfig>, zero_fill_cap: usize) -> Self {
        Self {
            pools: Arc::new(PoolSet::from_configs(configs)),
            estimator: Arc::new(SizeEstimator::new()),
            budget: ZeroFillBudget::new(zero_fill_cap),
            config: Arc::new(StreamConfig::default()),
        }
    }

    pub fn file(&self, spec: &FileSpec) -> NzbFile {
        NzbFile::new(
            spec,
            self.pools.clone(),
            self.estimator.clone(),
            self.budget.clone(),
            self.config.clone(),
        )
    }
}

/// Deterministic pseudo-random payload.
pub fn payload(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).max(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state & 0xFF) as u8
        })
        .collect()
}
