//! RAR volume header scanner.
//!
//! Walks RAR4 and RAR5 block headers over a [`ByteSource`], seeking past
//! payload data instead of reading it. This keeps a scan of a multi-gigabyte
//! remote volume down to a handful of small positional reads, which is what
//! makes header scanning viable over lazily-fetched articles.
//!
//! Only structure is extracted; nothing here decompresses.

use crate::source::ByteSource;
use std::io;
use thiserror::Error;
use tracing::trace;

/// RAR 4.x signature.
const RAR4_SIG: [u8; 7] = [0x52, 0x61, 0x72, 0x21, 0x1A, 0x07, 0x00];
/// RAR 5.x signature.
const RAR5_SIG: [u8; 8] = [0x52, 0x61, 0x72, 0x21, 0x1A, 0x07, 0x01, 0x00];

/// Upper bound on a single block header. Headers past this are corrupt.
const MAX_HEADER_SIZE: usize = 1 << 20;

// RAR4 block types.
const RAR4_MAIN: u8 = 0x73;
const RAR4_FILE: u8 = 0x74;
const RAR4_ENDARC: u8 = 0x7B;

// RAR4 flags.
const RAR4_MHD_PASSWORD: u16 = 0x0080;
const RAR4_LHD_SPLIT_BEFORE: u16 = 0x0001;
const RAR4_LHD_SPLIT_AFTER: u16 = 0x0002;
const RAR4_LHD_PASSWORD: u16 = 0x0004;
const RAR4_LHD_LARGE: u16 = 0x0100;
const RAR4_LHD_DIR_MASK: u16 = 0x00E0;
const RAR4_LONG_BLOCK: u16 = 0x8000;

// RAR5 header types.
const RAR5_MAIN: u64 = 1;
const RAR5_FILE: u64 = 2;
const RAR5_ENCRYPTION: u64 = 4;
const RAR5_ENDARC: u64 = 5;

// RAR5 header flags.
const RAR5_HFL_EXTRA: u64 = 0x0001;
const RAR5_HFL_DATA: u64 = 0x0002;
const RAR5_HFL_SPLIT_BEFORE: u64 = 0x0008;
const RAR5_HFL_SPLIT_AFTER: u64 = 0x0010;

// RAR5 file flags.
const RAR5_FFL_DIRECTORY: u64 = 0x0001;
const RAR5_FFL_UTIME: u64 = 0x0002;
const RAR5_FFL_CRC32: u64 = 0x0004;

#[derive(Debug, Error)]
pub enum RarError {
    #[error("not a RAR archive")]
    NotRar,

    #[error("archive headers are encrypted")]
    Encrypted,

    #[error("header truncated at offset {0}")]
    Truncated(u64),

    #[error("corrupt archive: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Host archive format of a scanned volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RarFormat {
    Rar4,
    Rar5,
}

/// One file entry found in a volume's headers.
#[derive(Debug, Clone)]
pub struct RarEntry {
    /// Stored file name, forward-slash separated.
    pub name: String,
    /// Absolute offset of the entry's packed data within this volume.
    pub data_offset: u64,
    /// Packed byte count stored in this volume.
    pub packed_size: u64,
    /// Full unpacked size declared by the header.
    pub unpacked_size: u64,
    /// Raw compression method; `0x30` (RAR4) and `0` (RAR5) mean store.
    pub method: u8,
    /// Entry continues from the previous volume.
    pub split_before: bool,
    /// Entry continues into the next volume.
    pub split_after: bool,
}

impl RarEntry {
    /// Whether the entry is stored without compression.
    pub fn is_stored(&self) -> bool {
        self.method == 0x30 || self.method == 0
    }
}

/// Result of scanning one volume.
#[derive(Debug, Clone)]
pub struct VolumeScan {
    pub format: RarFormat,
    pub entries: Vec<RarEntry>,
}

/// Scan the block headers of a single volume.
pub async fn scan_volume(source: &dyn ByteSource) -> Result<VolumeScan, RarError> {
    let mut sig = [0u8; 8];
    let n = source.read_at(0, &mut sig).await?;
    if n >= 8 && sig == RAR5_SIG {
        return scan_rar5(source).await;
    }
    if n >= 7 && sig[..7] == RAR4_SIG {
        return scan_rar4(source).await;
    }
    Err(RarError::NotRar)
}

async fn scan_rar4(source: &dyn ByteSource) -> Result<VolumeScan, RarError> {
    let size = source.size();
    let mut entries = Vec::new();
    let mut off = RAR4_SIG.len() as u64;

    while off + 7 <= size {
        let mut base = [0u8; 7];
        source.read_exact_at(off, &mut base).await?;
        let head_type = base[2];
        let flags = u16::from_le_bytes([base[3], base[4]]);
        let head_size = u64::from(u16::from_le_bytes([base[5], base[6]]));
        if head_size < 7 {
            return Err(RarError::Corrupt(format!(
                "block header of {head_size} bytes at {off}"
            )));
        }

        match head_type {
            RAR4_MAIN => {
                if flags & RAR4_MHD_PASSWORD != 0 {
                    return Err(RarError::Encrypted);
                }
                off += head_size;
            }
            RAR4_FILE => {
                let header_len = usize::try_from(head_size)
                    .ok()
                    .filter(|&l| l <= MAX_HEADER_SIZE)
                    .ok_or_else(|| RarError::Corrupt(format!("file header of {head_size} bytes")))?;
                let mut header = vec![0u8; header_len];
                source.read_exact_at(off, &mut header).await?;
                let mut r = SliceReader::new(&header, off);
                r.skip(7)?;

                let pack_low = u64::from(r.u32()?);
                let unp_low = u64::from(r.u32()?);
                r.skip(9)?; // host os, file crc, mtime
                r.skip(1)?; // unpack version
                let method = r.u8()?;
                let name_size = usize::from(r.u16()?);
                r.skip(4)?; // attributes

                let (packed_size, unpacked_size) = if flags & RAR4_LHD_LARGE != 0 {
                    let pack_high = u64::from(r.u32()?);
                    let unp_high = u64::from(r.u32()?);
                    (pack_low | pack_high << 32, unp_low | unp_high << 32)
                } else {
                    (pack_low, unp_low)
                };

                if flags & RAR4_LHD_PASSWORD != 0 {
                    return Err(RarError::Encrypted);
                }

                let name = decode_rar4_name(r.bytes(name_size)?, flags);
                let data_offset = off + head_size;

                let is_dir = flags & RAR4_LHD_DIR_MASK == RAR4_LHD_DIR_MASK;
                if !is_dir {
                    trace!(%name, data_offset, packed_size, "rar4 file header");
                    entries.push(RarEntry {
                        name,
                        data_offset,
                        packed_size,
                        unpacked_size,
                        method,
                        split_before: flags & RAR4_LHD_SPLIT_BEFORE != 0,
                        split_after: flags & RAR4_LHD_SPLIT_AFTER != 0,
                    });
                }

                off = data_offset + packed_size;
            }
            RAR4_ENDARC => break,
            _ => {
                // Comment, sub and service blocks: skip header plus any
                // attached data area.
                let add_size = if flags & RAR4_LONG_BLOCK != 0 {
                    let mut add = [0u8; 4];
                    source.read_exact_at(off + 7, &mut add).await?;
                    u64::from(u32::from_le_bytes(add))
                } else {
                    0
                };
                off += head_size + add_size;
            }
        }
    }

    Ok(VolumeScan {
        format: RarFormat::Rar4,
        entries,
    })
}

/// RAR4 names are OEM/UTF-8 bytes; unicode variants prefix the 8-bit name,
/// terminated by NUL, before an encoded section this scanner does not need.
fn decode_rar4_name(raw: &[u8], flags: u16) -> String {
    const LHD_UNICODE: u16 = 0x0200;
    let raw = if flags & LHD_UNICODE != 0 {
        raw.split(|&b| b == 0).next().unwrap_or(raw)
    } else {
        raw
    };
    String::from_utf8_lossy(raw).replace('\\', "/")
}

async fn scan_rar5(source: &dyn ByteSource) -> Result<VolumeScan, RarError> {
    let size = source.size();
    let mut entries = Vec::new();
    let mut off = RAR5_SIG.len() as u64;

    while off + 7 <= size {
        // CRC32 plus the header-size vint; the vint is at most 3 bytes for
        // any sane header.
        let mut prefix = [0u8; 8];
        let got = source.read_at(off, &mut prefix).await?;
        if got < 6 {
            break;
        }
        let mut pr = SliceReader::new(&prefix[..got], off);
        pr.skip(4)?;
        let header_size = pr.vint()?;
        let header_start = off + pr.position() as u64;
        let header_len = usize::try_from(header_size)
            .ok()
            .filter(|&l| l > 0 && l <= MAX_HEADER_SIZE)
            .ok_or_else(|| RarError::Corrupt(format!("block header of {header_size} bytes")))?;

        let mut header = vec![0u8; header_len];
        source.read_exact_at(header_start, &mut header).await?;
        let mut r = SliceReader::new(&header, header_start);

        let header_type = r.vint()?;
        let header_flags = r.vint()?;
        let _extra_size = if header_flags & RAR5_HFL_EXTRA != 0 {
            r.vint()?
        } else {
            0
        };
        let data_size = if header_flags & RAR5_HFL_DATA != 0 {
            r.vint()?
        } else {
            0
        };

        let data_offset = header_start + header_size;

        match header_type {
            RAR5_ENCRYPTION => return Err(RarError::Encrypted),
            RAR5_ENDARC => break,
            RAR5_FILE => {
                let file_flags = r.vint()?;
                let unpacked_size = r.vint()?;
                r.vint()?; // attributes
                if file_flags & RAR5_FFL_UTIME != 0 {
                    r.skip(4)?;
                }
                if file_flags & RAR5_FFL_CRC32 != 0 {
                    r.skip(4)?;
                }
                let compression_info = r.vint()?;
                r.vint()?; // host os
                let name_len = usize::try_from(r.vint()?)
                    .ok()
                    .filter(|&l| l <= 0xFFFF)
                    .ok_or_else(|| RarError::Corrupt("oversized file name".into()))?;
                let name = String::from_utf8_lossy(r.bytes(name_len)?).replace('\\', "/");

                let method = ((compression_info >> 7) & 0x7) as u8;
                let is_dir = file_flags & RAR5_FFL_DIRECTORY != 0;
                if !is_dir {
                    trace!(%name, data_offset, data_size, "rar5 file header");
                    entries.push(RarEntry {
                        name,
                        data_offset,
                        packed_size: data_size,
                        unpacked_size,
                        method,
                        split_before: header_flags & RAR5_HFL_SPLIT_BEFORE != 0,
                        split_after: header_flags & RAR5_HFL_SPLIT_AFTER != 0,
                    });
                }
            }
            // Main and service headers carry nothing the scan needs; their
            // data areas (if any) are skipped below.
            RAR5_MAIN => {}
            _ => {}
        }

        off = data_offset + data_size;
    }

    Ok(VolumeScan {
        format: RarFormat::Rar5,
        entries,
    })
}

/// Bounds-checked little-endian reader over a fetched header buffer.
struct SliceReader<'a> {
    buf: &'a [u8],
    pos: usize,
    base: u64,
}

impl<'a> SliceReader<'a> {
    fn new(buf: &'a [u8], base: u64) -> Self {
        Self { buf, pos: 0, base }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn truncated(&self) -> RarError {
        RarError::Truncated(self.base + self.pos as u64)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], RarError> {
        let end = self.pos.checked_add(n).ok_or_else(|| self.truncated())?;
        if end > self.buf.len() {
            return Err(self.truncated());
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<(), RarError> {
        self.bytes(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, RarError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, RarError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, RarError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// RAR5 variable-length integer: 7 data bits per byte, high bit set on
    /// continuation, little-endian, at most 10 bytes.
    fn vint(&mut self) -> Result<u64, RarError> {
        let mut value = 0u64;
        for shift in 0..10 {
            let b = self.u8()?;
            value |= u64::from(b & 0x7F) << (shift * 7);
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(RarError::Corrupt("unterminated vint".into()))
    }
}

#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixtures {
    //! Synthetic volume builders, shared with downstream crates' tests via
    //! the `test-fixtures` feature.

    /// Encode a RAR5 vint.
    pub fn vint(mut v: u64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let b = (v & 0x7F) as u8;
            v >>= 7;
            if v == 0 {
                out.push(b);
                return out;
            }
            out.push(b | 0x80);
        }
    }

    /// A file to place in a synthetic volume.
    pub struct FileFixture<'a> {
        pub name: &'a str,
        pub data: &'a [u8],
        pub unpacked_size: u64,
        pub method: u8,
        pub split_before: bool,
        pub split_after: bool,
    }

    impl<'a> FileFixture<'a> {
        pub fn stored(name: &'a str, data: &'a [u8]) -> Self {
            Self {
                name,
                data,
                unpacked_size: data.len() as u64,
                method: 0x30,
                split_before: false,
                split_after: false,
            }
        }
    }

    /// Build a RAR4 volume containing the given entries.
    pub fn rar4_volume(files: &[FileFixture<'_>]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&super::RAR4_SIG);

        // MAIN_HEAD: 7-byte base plus 6 reserved bytes.
        out.extend_from_slice(&0u16.to_le_bytes());
        out.push(super::RAR4_MAIN);
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&13u16.to_le_bytes());
        out.extend_from_slice(&[0u8; 6]);

        for f in files {
            let name = f.name.as_bytes();
            let head_size = 32 + name.len() as u16;
            let mut flags: u16 = super::RAR4_LONG_BLOCK;
            if f.split_before {
                flags |= super::RAR4_LHD_SPLIT_BEFORE;
            }
            if f.split_after {
                flags |= super::RAR4_LHD_SPLIT_AFTER;
            }

            out.extend_from_slice(&0u16.to_le_bytes());
            out.push(super::RAR4_FILE);
            out.extend_from_slice(&flags.to_le_bytes());
            out.extend_from_slice(&head_size.to_le_bytes());
            out.extend_from_slice(&(f.data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(f.unpacked_size as u32).to_le_bytes());
            out.push(0); // host os
            out.extend_from_slice(&crc32fast::hash(f.data).to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes()); // mtime
            out.push(29); // unpack version
            out.push(f.method);
            out.extend_from_slice(&(name.len() as u16).to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes()); // attributes
            out.extend_from_slice(name);
            out.extend_from_slice(f.data);
        }

        // ENDARC
        out.extend_from_slice(&0u16.to_le_bytes());
        out.push(super::RAR4_ENDARC);
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&7u16.to_le_bytes());
        out
    }

    /// Build a RAR5 volume containing the given entries.
    pub fn rar5_volume(files: &[FileFixture<'_>]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&super::RAR5_SIG);

        // Main archive header: type 1, no flags, archive flags 0.
        let main = [vint(1), vint(0), vint(0)].concat();
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&vint(main.len() as u64));
        out.extend_from_slice(&main);

        for f in files {
            let name = f.name.as_bytes();
            let mut header_flags = super::RAR5_HFL_DATA;
            if f.split_before {
                header_flags |= super::RAR5_HFL_SPLIT_BEFORE;
            }
            if f.split_after {
                header_flags |= super::RAR5_HFL_SPLIT_AFTER;
            }
            // method lives in bits 7..10 of compression info
            let compression_info = u64::from(f.method) << 7;

            let header = [
                vint(super::RAR5_FILE),
                vint(header_flags),
                vint(f.data.len() as u64),
                vint(0), // file flags
                vint(f.unpacked_size),
                vint(0), // attributes
                vint(compression_info),
                vint(0), // host os
                vint(name.len() as u64),
                name.to_vec(),
            ]
            .concat();

            out.extend_from_slice(&0u32.to_le_bytes());
            out.extend_from_slice(&vint(header.len() as u64));
            out.extend_from_slice(&header);
            out.extend_from_slice(f.data);
        }

        // End of archive: type 5, no flags, endarc flags 0.
        let end = [vint(super::RAR5_ENDARC), vint(0), vint(0)].concat();
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&vint(end.len() as u64));
        out.extend_from_slice(&end);
        out
    }
}
