//! Error types for NNTP operations

use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NntpError {
    #[error("connection error: {0}")]
    Io(#[from] io::Error),

    #[error("tls setup failed: {0}")]
    Tls(String),

    #[error("invalid server name {0:?}")]
    InvalidServerName(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("server requires authentication")]
    AuthRequired,

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("article <{0}> not found")]
    NotFound(String),

    #[error("unexpected reply: {code} {text}")]
    UnexpectedReply { code: u16, text: String },

    #[error("malformed reply line: {0:?}")]
    MalformedReply(String),

    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("operation cancelled")]
    Cancelled,

    #[error("connection pool is closed")]
    PoolClosed,
}

impl NntpError {
    /// Whether the connection carrying this error is unusable and should be
    /// torn down rather than returned to its pool.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Tls(_) | Self::Timeout(_) | Self::MalformedReply(_)
        )
    }

    /// Whether a fresh attempt against another provider may succeed.
    pub fn is_retryable(&self) -> bool {
        self.is_transport()
            || matches!(
                self,
                Self::AuthRequired | Self::NotFound(_) | Self::UnexpectedReply { .. }
            )
    }
}

pub type Result<T> = std::result::Result<T, NntpError>;
