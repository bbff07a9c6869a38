//! Error types for the streaming core

use newsreel_formats::rar::RarError;
use newsreel_formats::sevenzip::SevenZipError;
use newsreel_formats::yenc::YencError;
use newsreel_nntp::NntpError;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Nntp(#[from] NntpError),

    #[error("segment decode failed: {0}")]
    Decode(#[from] YencError),

    #[error(transparent)]
    Archive(#[from] RarError),

    #[error(transparent)]
    SevenZip(#[from] SevenZipError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("segment download deadline expired")]
    Deadline,

    #[error("too many failed segments")]
    TooManyFailedSegments {
        #[source]
        source: Box<StreamError>,
    },

    #[error("compressed archives cannot be streamed: {0}")]
    CompressedArchiveUnsupported(String),

    #[error("no streamable media found")]
    NoMedia,

    #[error("position {offset} out of bounds for stream of {size} bytes")]
    OutOfBounds { offset: u64, size: u64 },

    /// A failure published to every waiter of one shared download.
    #[error("{0}")]
    Shared(Arc<StreamError>),
}

impl StreamError {
    /// Unwrap [`StreamError::Shared`] layers down to the original failure.
    pub fn root(&self) -> &StreamError {
        match self {
            Self::Shared(inner) => inner.root(),
            other => other,
        }
    }

    /// Whether the per-segment attempt loop consumes this error and moves to
    /// the next provider: transport, deadline, not-found, decode and
    /// auth-required failures all qualify.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Self::Nntp(e) => e.is_retryable(),
            Self::Decode(_) | Self::Deadline => true,
            _ => false,
        }
    }

    /// Whether the failure is the terminal zero-fill budget error.
    pub fn is_budget_exhausted(&self) -> bool {
        matches!(self.root(), Self::TooManyFailedSegments { .. })
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
