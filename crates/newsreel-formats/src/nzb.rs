//! NZB manifest data model.
//!
//! The manifest is supplied by an external parser; this module only defines
//! the shapes the streaming core consumes, plus the best-effort file naming
//! derived from subject lines.

/// An ordered release manifest.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub files: Vec<FileSpec>,
}

/// One file within a release: a subject line, the newsgroups carrying it,
/// and its ordered segment descriptors.
#[derive(Debug, Clone)]
pub struct FileSpec {
    pub subject: String,
    pub groups: Vec<String>,
    pub segments: Vec<SegmentSpec>,
}

/// One article segment descriptor.
#[derive(Debug, Clone)]
pub struct SegmentSpec {
    /// Globally unique article identifier, without angle brackets.
    pub message_id: String,
    /// 1-based segment number within the file.
    pub number: u32,
    /// Encoded (on-wire) byte count declared by the manifest.
    pub encoded_size: u64,
}

impl FileSpec {
    /// Derive a file name from the subject line.
    ///
    /// Subjects typically look like
    /// `release [01/42] - "movie.part01.rar" yEnc (1/137)`. A quoted
    /// substring wins outright; otherwise trailing ` yEnc` markers and
    /// `(n/m)` counters are stripped.
    pub fn file_name(&self) -> String {
        let subject = self.subject.trim();

        if let Some(open) = subject.find('"') {
            if let Some(len) = subject[open + 1..].find('"') {
                let quoted = subject[open + 1..open + 1 + len].trim();
                if !quoted.is_empty() {
                    return quoted.to_string();
                }
            }
        }

        let mut rest = subject;
        loop {
            let trimmed = rest.trim_end();
            let stripped = strip_counter(trimmed)
                .or_else(|| trimmed.strip_suffix("yEnc"))
                .or_else(|| trimmed.strip_suffix("yenc"));
            match stripped {
                Some(s) => rest = s,
                None => break,
            }
        }
        rest.trim().to_string()
    }
}

/// Strip a trailing `(n/m)` segment counter.
fn strip_counter(s: &str) -> Option<&str> {
    let s = s.strip_suffix(')')?;
    let open = s.rfind('(')?;
    let inner = &s[open + 1..];
    let (a, b) = inner.split_once('/')?;
    if a.chars().all(|c| c.is_ascii_digit()) && b.chars().all(|c| c.is_ascii_digit()) {
        Some(&s[..open])
    } else {
        None
    }
}
