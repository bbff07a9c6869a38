//! NNTP reply grammar.
//!
//! Replies are a three-digit status code, a space, and human-readable text.
//! Multi-line payloads (article bodies) follow separately and are terminated
//! by a lone dot line; see the client for body framing.

use crate::error::NntpError;

/// Service ready, posting allowed.
pub const READY: u16 = 200;
/// Service ready, posting prohibited.
pub const READY_NO_POSTING: u16 = 201;
/// Group selected.
pub const GROUP_SELECTED: u16 = 211;
/// Body follows.
pub const BODY_FOLLOWS: u16 = 222;
/// Article exists.
pub const ARTICLE_EXISTS: u16 = 223;
/// Authentication accepted.
pub const AUTH_ACCEPTED: u16 = 281;
/// Password required.
pub const PASSWORD_REQUIRED: u16 = 381;
/// Article not found.
pub const NOT_FOUND: u16 = 430;
/// Authentication required.
pub const AUTH_REQUIRED: u16 = 480;

/// A parsed single-line reply.
#[derive(Debug, Clone)]
pub struct Response {
    pub code: u16,
    pub text: String,
}

impl Response {
    /// Parse a status line with its terminator already stripped.
    pub fn parse(line: &str) -> Result<Self, NntpError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (code, text) = line.split_at_checked(3).unwrap_or((line, ""));
        let code: u16 = code
            .parse()
            .map_err(|_| NntpError::MalformedReply(line.to_string()))?;
        Ok(Self {
            code,
            text: text.trim_start().to_string(),
        })
    }

    /// Service greeting codes.
    pub fn is_ready(&self) -> bool {
        matches!(self.code, READY | READY_NO_POSTING)
    }

    /// The server wants (re-)authentication before serving this command.
    pub fn needs_auth(&self) -> bool {
        self.code == AUTH_REQUIRED
    }

    /// Convert an unexpected reply into an error.
    pub fn into_unexpected(self) -> NntpError {
        NntpError::UnexpectedReply {
            code: self.code,
            text: self.text,
        }
    }
}
