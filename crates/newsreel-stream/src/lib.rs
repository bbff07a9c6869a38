//! # newsreel-stream - Seekable byte streams over newsgroup releases
//!
//! Turns a sparse catalog of unordered, variably-sized, yEnc-encoded remote
//! articles, possibly wrapped in uncompressed RAR/7z volumes, into a
//! low-latency seekable byte stream a video player can consume through HTTP
//! range requests.
//!
//! ## Layers
//!
//! - [`SizeEstimator`]: process-wide fuzzy memory of encoded→decoded segment
//!   sizes, so one probe sizes a whole release
//! - [`NzbFile`]: the segment loader with lazy size detection, a shared
//!   cache, in-flight deduplication, provider spillover, and the zero-fill
//!   fault policy
//! - [`SegmentReader`]: per-opener reader/seeker with a bounded prefetch
//!   window matched to the providers' connection budget
//! - [`VirtualStream`] and [`VirtualFile`]: concatenated byte-range
//!   composition over heterogeneous sources, recursively
//! - [`blueprint`]: the archive scan that turns RAR/7z volume sets into a
//!   byte-range plan, including archive-in-archive recursion and the
//!   compression gate
//!
//! ## Cancellation model
//!
//! Two context layers, deliberately distinct. Each file owns a long-lived
//! token bounding actual network work (five minutes per segment attempt);
//! each reader owns a short-lived scope tied to one HTTP range request.
//! Cancelling a reader aborts its waits and prefetch tracking but never the
//! downloads themselves; their results land in the shared cache for the
//! next reader, which is what makes a player's seek storm cheap.
//!
//! ## Example
//!
//! ```rust,no_run
//! use newsreel_formats::nzb::Manifest;
//! use newsreel_nntp::PoolSet;
//! use newsreel_stream::{
//!     ArchiveBlueprint, NzbFile, SizeEstimator, StreamConfig, ZeroFillBudget, blueprint,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! async fn open(manifest: Manifest, pools: Arc<PoolSet>) -> newsreel_stream::Result<()> {
//!     let estimator = Arc::new(SizeEstimator::new());
//!     let config = Arc::new(StreamConfig::default());
//!     let budget = ZeroFillBudget::new(config.max_zero_fills);
//!
//!     let files: Vec<Arc<dyn newsreel_stream::StreamableFile>> = manifest
//!         .files
//!         .iter()
//!         .map(|spec| {
//!             Arc::new(NzbFile::new(
//!                 spec,
//!                 pools.clone(),
//!                 estimator.clone(),
//!                 budget.clone(),
//!                 config.clone(),
//!             )) as Arc<dyn newsreel_stream::StreamableFile>
//!         })
//!         .collect();
//!
//!     let session = CancellationToken::new();
//!     let plan = match blueprint::scan(&files, &session, &config).await {
//!         Ok(plan) => plan,
//!         // Not archived: stream the largest file directly.
//!         Err(newsreel_stream::StreamError::NoMedia) => {
//!             ArchiveBlueprint::passthrough(files[0].clone(), &session).await?
//!         }
//!         Err(e) => return Err(e),
//!     };
//!
//!     let mut stream = plan.open_stream(&session, &config);
//!     let mut buf = vec![0u8; 64 * 1024];
//!     let n = stream.read(&mut buf).await?;
//!     println!("first {n} bytes of {}", plan.file_name);
//!     Ok(())
//! }
//! ```

pub mod blueprint;
pub mod config;
pub mod error;
pub mod estimator;
pub mod file;
pub mod reader;
pub mod segment;
pub mod traits;
pub mod virtual_file;
pub mod virtual_stream;

#[cfg(test)]
pub(crate) mod testutil;

pub use blueprint::{ArchiveBlueprint, scan};
pub use config::StreamConfig;
pub use error::{Result, StreamError};
pub use estimator::SizeEstimator;
pub use file::{CompletionHandle, NzbFile, ZeroFillBudget};
pub use reader::SegmentReader;
pub use segment::Segment;
pub use traits::{SourceReader, StreamableFile};
pub use virtual_file::{VirtualFile, VirtualPart};
pub use virtual_stream::VirtualStream;
