//! # newsreel-formats - Codec and archive structure parsing
//!
//! Format-level building blocks for streaming newsgroup-hosted releases:
//!
//! - [`yenc`]: decoder for yEnc-encoded article bodies, including multi-part
//!   (`=ypart`) segments and CRC32 trailer verification
//! - [`nzb`]: the manifest data model (files, groups, segment descriptors)
//!   and best-effort file naming from subject lines
//! - [`rar`]: RAR4/RAR5 volume header scanner that walks block headers by
//!   seeking, without ever reading archive payload data
//! - [`sevenzip`]: 7z listing for store (uncompressed) archives, yielding
//!   absolute payload offsets for Copy-coded members
//! - [`source`]: the [`ByteSource`](source::ByteSource) positional-read seam
//!   that lets the scanners operate over remote, lazily-fetched volumes
//!
//! The parsers here only describe structure. Decompression, download
//! scheduling, and stream assembly live in `newsreel-stream`.

pub mod nzb;
pub mod rar;
pub mod sevenzip;
pub mod source;
pub mod yenc;

pub use nzb::{FileSpec, Manifest, SegmentSpec};
pub use rar::{RarEntry, RarError, RarFormat, VolumeScan};
pub use sevenzip::{SevenZipEntry, SevenZipError, SevenZipListing};
pub use source::{ByteSource, MemorySource};
pub use yenc::{DecodedSegment, YencError};
