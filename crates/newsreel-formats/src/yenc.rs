//! yEnc article body decoder.
//!
//! Decodes a dot-unstuffed NNTP body into raw payload bytes. The encoding is
//! line-oriented: a `=ybegin` header, an optional `=ypart` header for
//! multi-part posts, escaped payload lines, and a `=yend` trailer carrying
//! the payload size and a CRC32 checksum.

use bytes::Bytes;
use thiserror::Error;

/// Offset added to every payload byte by the encoder.
const YENC_OFFSET: u8 = 42;
/// Additional offset applied to escaped bytes.
const YENC_ESCAPE_OFFSET: u8 = 64;

#[derive(Debug, Error)]
pub enum YencError {
    #[error("missing =ybegin header")]
    MissingHeader,

    #[error("missing =yend trailer")]
    MissingTrailer,

    #[error("malformed header: {0}")]
    BadHeader(String),

    #[error("decoded size mismatch: trailer declares {expected}, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("crc32 mismatch: trailer declares {expected:08x}, got {actual:08x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("escape character at end of payload")]
    TrailingEscape,
}

/// A decoded article segment.
#[derive(Debug, Clone)]
pub struct DecodedSegment {
    /// Raw payload bytes.
    pub data: Bytes,
    /// File name declared by the `=ybegin` header.
    pub file_name: String,
    /// 1-based inclusive byte range from `=ypart`, when present.
    pub part: Option<(u64, u64)>,
}

/// Decode a yEnc article body.
///
/// `body` is the dot-unstuffed body exactly as read off the wire, with line
/// terminators intact. Trailer checksums are verified when present:
/// `pcrc32` for multi-part segments, `crc32` otherwise.
pub fn decode(body: &[u8]) -> Result<DecodedSegment, YencError> {
    let mut lines = Lines::new(body);

    let header = loop {
        let line = lines.next().ok_or(YencError::MissingHeader)?;
        if line.starts_with(b"=ybegin ") {
            break parse_attrs(&line[8..]);
        }
    };

    let file_name = header
        .name
        .clone()
        .ok_or_else(|| YencError::BadHeader("=ybegin carries no name".into()))?;
    let is_part = header.get("part").is_some();

    let mut part = None;
    let mut data = Vec::with_capacity(header.get("size").unwrap_or(0) as usize);
    let mut trailer = None;

    while let Some(line) = lines.next() {
        if line.starts_with(b"=ypart ") {
            let attrs = parse_attrs(&line[7..]);
            let begin = attrs
                .get("begin")
                .ok_or_else(|| YencError::BadHeader("=ypart carries no begin".into()))?;
            let end = attrs
                .get("end")
                .ok_or_else(|| YencError::BadHeader("=ypart carries no end".into()))?;
            part = Some((begin, end));
            continue;
        }
        if line.starts_with(b"=yend ") {
            trailer = Some(parse_attrs(&line[6..]));
            break;
        }
        decode_line(line, &mut data)?;
    }

    let trailer = trailer.ok_or(YencError::MissingTrailer)?;

    if let Some(expected) = trailer.get("size") {
        if expected != data.len() as u64 {
            return Err(YencError::SizeMismatch {
                expected,
                actual: data.len() as u64,
            });
        }
    }

    // pcrc32 covers the part payload; crc32 covers the whole file and is
    // only authoritative for single-part posts.
    let declared_crc = match trailer.get_hex("pcrc32") {
        Some(crc) => Some(crc),
        None if !is_part => trailer.get_hex("crc32"),
        None => None,
    };
    if let Some(expected) = declared_crc {
        let actual = crc32fast::hash(&data);
        if expected != actual {
            return Err(YencError::CrcMismatch { expected, actual });
        }
    }

    Ok(DecodedSegment {
        data: Bytes::from(data),
        file_name,
        part,
    })
}

fn decode_line(line: &[u8], out: &mut Vec<u8>) -> Result<(), YencError> {
    let mut i = 0;
    while i < line.len() {
        let b = line[i];
        if b == b'=' {
            let next = *line.get(i + 1).ok_or(YencError::TrailingEscape)?;
            out.push(
                next.wrapping_sub(YENC_ESCAPE_OFFSET)
                    .wrapping_sub(YENC_OFFSET),
            );
            i += 2;
        } else {
            out.push(b.wrapping_sub(YENC_OFFSET));
            i += 1;
        }
    }
    Ok(())
}

/// Iterator over body lines with terminators stripped.
struct Lines<'a> {
    rest: &'a [u8],
}

impl<'a> Lines<'a> {
    fn new(body: &'a [u8]) -> Self {
        Self { rest: body }
    }
}

impl<'a> Iterator for Lines<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.rest.is_empty() {
            return None;
        }
        let (line, rest) = match self.rest.iter().position(|&b| b == b'\n') {
            Some(pos) => (&self.rest[..pos], &self.rest[pos + 1..]),
            None => (self.rest, &self.rest[self.rest.len()..]),
        };
        self.rest = rest;
        Some(line.strip_suffix(b"\r").unwrap_or(line))
    }
}

/// Parsed `key=value` attributes from a yEnc control line.
struct Attrs {
    pairs: Vec<(String, String)>,
    /// `name=` consumes the rest of the line and may contain spaces.
    name: Option<String>,
}

impl Attrs {
    fn get(&self, key: &str) -> Option<u64> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.parse().ok())
    }

    fn get_hex(&self, key: &str) -> Option<u32> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| u32::from_str_radix(v, 16).ok())
    }
}

fn parse_attrs(raw: &[u8]) -> Attrs {
    let text = String::from_utf8_lossy(raw);
    let mut pairs = Vec::new();
    let mut name = None;

    let mut rest = text.trim();
    while !rest.is_empty() {
        if let Some(value) = rest.strip_prefix("name=") {
            name = Some(value.trim().to_string());
            break;
        }
        let token = rest.split_whitespace().next().unwrap_or(rest);
        if let Some((k, v)) = token.split_once('=') {
            pairs.push((k.to_string(), v.to_string()));
        }
        rest = rest[token.len()..].trim_start();
    }

    Attrs { pairs, name }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Reference encoder used to build test bodies.
    fn encode(payload: &[u8], name: &str, part: Option<(u64, u64, u64)>) -> Vec<u8> {
        let mut out = Vec::new();
        match part {
            Some((idx, begin, end)) => {
                out.extend_from_slice(
                    format!(
                        "=ybegin part={idx} line=128 size={} name={name}\r\n",
                        payload.len()
                    )
                    .as_bytes(),
                );
                out.extend_from_slice(format!("=ypart begin={begin} end={end}\r\n").as_bytes());
            }
            None => {
                out.extend_from_slice(
                    format!("=ybegin line=128 size={} name={name}\r\n", payload.len()).as_bytes(),
                );
            }
        }

        let mut col = 0;
        for &b in payload {
            let enc = b.wrapping_add(YENC_OFFSET);
            if matches!(enc, 0x00 | 0x0A | 0x0D | b'=') || (col == 0 && enc == b'.') {
                out.push(b'=');
                out.push(enc.wrapping_add(YENC_ESCAPE_OFFSET));
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

        let crc = crc32fast::hash(payload);
        match part {
            Some((idx, _, _)) => out.extend_from_slice(
                format!(
                    "=yend size={} part={idx} pcrc32={crc:08x}\r\n",
                    payload.len()
                )
                .as_bytes(),
            ),
            None => out.extend_from_slice(
                format!("=yend size={} crc32={crc:08x}\r\n", payload.len()).as_bytes(),
            ),
        }
        out
    }

    #[test]
    fn round_trip_single_part() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let body = encode(&payload, "movie.mkv", None);

        let decoded = decode(&body).expect("Operation should succeed");
        assert_eq!(decoded.data.as_ref(), payload.as_slice());
        assert_eq!(decoded.file_name, "movie.mkv");
        assert_eq!(decoded.part, None);
    }

    #[test]
    fn round_trip_multi_part() {
        let payload = vec![0x2A; 512];
        let body = encode(&payload, "a file with spaces.mkv", Some((2, 513, 1024)));

        let decoded = decode(&body).expect("Operation should succeed");
        assert_eq!(decoded.data.len(), 512);
        assert_eq!(decoded.file_name, "a file with spaces.mkv");
        assert_eq!(decoded.part, Some((513, 1024)));
    }

    #[test]
    fn escape_sequences_cover_critical_bytes() {
        // Bytes that encode to NUL, CR, LF and '=' all require escaping.
        let payload = vec![214, 224, 227, 19, 0, 255, 61];
        let body = encode(&payload, "x", None);

        let decoded = decode(&body).expect("Operation should succeed");
        assert_eq!(decoded.data.as_ref(), payload.as_slice());
    }

    #[test]
    fn missing_header_rejected() {
        let err = decode(b"random garbage\r\n").expect_err("Test operation should fail");
        assert!(matches!(err, YencError::MissingHeader));
    }

    #[test]
    fn missing_trailer_rejected() {
        let body = b"=ybegin line=128 size=3 name=x\r\nabc\r\n";
        let err = decode(body).expect_err("Test operation should fail");
        assert!(matches!(err, YencError::MissingTrailer));
    }

    #[test]
    fn size_mismatch_rejected() {
        let mut body = encode(b"hello", "x", None);
        // Corrupt the trailer size.
        let text = String::from_utf8(body.clone()).expect("Operation should succeed");
        let corrupted = text.replace("size=5", "size=6");
        body = corrupted.into_bytes();

        let err = decode(&body).expect_err("Test operation should fail");
        assert!(matches!(
            err,
            YencError::SizeMismatch {
                expected: 6,
                actual: 5
            }
        ));
    }

    #[test]
    fn crc_mismatch_rejected() {
        let body = encode(b"hello", "x", None);
        let text = String::from_utf8(body).expect("Operation should succeed");
        let crc = crc32fast::hash(b"hello");
        let corrupted = text.replace(&format!("{crc:08x}"), "deadbeef");

        let err = decode(corrupted.as_bytes()).expect_err("Test operation should fail");
        assert!(matches!(err, YencError::CrcMismatch { .. }));
    }

    #[test]
    fn crc32_not_enforced_for_parts() {
        // Multi-part trailers may carry a whole-file crc32 that cannot match
        // the part payload; only pcrc32 is authoritative there.
        let payload = vec![7u8; 64];
        let body = format!(
            "=ybegin part=1 line=128 size=64 name=x\r\n=ypart begin=1 end=64\r\n{}\r\n=yend size=64 part=1 crc32=deadbeef\r\n",
            String::from_utf8(payload.iter().map(|b| b.wrapping_add(42)).collect())
                .expect("Operation should succeed")
        );

        let decoded = decode(body.as_bytes()).expect("Operation should succeed");
        assert_eq!(decoded.data.len(), 64);
    }
}
