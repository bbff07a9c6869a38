//! 7z listing for store (uncompressed) archives.
//!
//! Parses the signature header and the plain header tree (PackInfo,
//! UnpackInfo with folders and coders, SubStreamsInfo, FilesInfo) far
//! enough to place every member inside the archive's byte space. Members in
//! single-coder Copy folders get an absolute `pack_offset`; anything else is
//! listed without one so callers can reject or skip it.
//!
//! Compressed headers (`kEncodedHeader`) are refused outright: reading them
//! would require decompression, which this crate never does.

use crate::source::ByteSource;
use std::io;
use thiserror::Error;

/// 7z signature, `'7' 'z' BC AF 27 1C`.
const SIGNATURE: [u8; 6] = [0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C];

/// Size of the fixed signature header.
const SIGNATURE_HEADER_LEN: u64 = 32;

/// Upper bound on the next-header blob.
const MAX_HEADER_SIZE: u64 = 16 << 20;

// Header tree property ids.
const K_END: u8 = 0x00;
const K_HEADER: u8 = 0x01;
const K_ARCHIVE_PROPERTIES: u8 = 0x02;
const K_ADDITIONAL_STREAMS: u8 = 0x03;
const K_MAIN_STREAMS: u8 = 0x04;
const K_FILES_INFO: u8 = 0x05;
const K_PACK_INFO: u8 = 0x06;
const K_UNPACK_INFO: u8 = 0x07;
const K_SUBSTREAMS_INFO: u8 = 0x08;
const K_SIZE: u8 = 0x09;
const K_CRC: u8 = 0x0A;
const K_FOLDER: u8 = 0x0B;
const K_CODERS_UNPACK_SIZE: u8 = 0x0C;
const K_NUM_UNPACK_STREAM: u8 = 0x0D;
const K_EMPTY_STREAM: u8 = 0x0E;
const K_NAME: u8 = 0x11;
const K_ENCODED_HEADER: u8 = 0x17;

/// The Copy (store) coder id.
const COPY_CODER: [u8; 1] = [0x00];

#[derive(Debug, Error)]
pub enum SevenZipError {
    #[error("not a 7z archive")]
    NotSevenZip,

    #[error("archive header is compressed")]
    EncodedHeader,

    #[error("header truncated")]
    Truncated,

    #[error("corrupt archive: {0}")]
    Corrupt(String),

    #[error("unsupported archive feature: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One archive member.
#[derive(Debug, Clone)]
pub struct SevenZipEntry {
    pub name: String,
    /// Uncompressed size.
    pub size: u64,
    /// Absolute payload offset within the archive byte space, present only
    /// for members stored without compression.
    pub pack_offset: Option<u64>,
    /// Whether the member sits in a single-coder Copy folder.
    pub is_stored: bool,
}

/// Listing of a 7z archive.
#[derive(Debug, Clone)]
pub struct SevenZipListing {
    pub entries: Vec<SevenZipEntry>,
}

/// List the members of a 7z archive without decompressing anything.
pub async fn list_archive(source: &dyn ByteSource) -> Result<SevenZipListing, SevenZipError> {
    let mut start = [0u8; 32];
    source
        .read_exact_at(0, &mut start)
        .await
        .map_err(|_| SevenZipError::NotSevenZip)?;
    if start[..6] != SIGNATURE {
        return Err(SevenZipError::NotSevenZip);
    }

    let next_offset = u64::from_le_bytes(start[12..20].try_into().unwrap_or_default());
    let next_size = u64::from_le_bytes(start[20..28].try_into().unwrap_or_default());
    if next_size == 0 {
        return Err(SevenZipError::Corrupt("archive has no header".into()));
    }
    if next_size > MAX_HEADER_SIZE {
        return Err(SevenZipError::Corrupt(format!(
            "header of {next_size} bytes"
        )));
    }

    let mut header = vec![0u8; next_size as usize];
    source
        .read_exact_at(SIGNATURE_HEADER_LEN + next_offset, &mut header)
        .await?;

    parse_header(&header)
}

fn parse_header(buf: &[u8]) -> Result<SevenZipListing, SevenZipError> {
    let mut r = NumReader::new(buf);

    match r.u8()? {
        K_HEADER => {}
        K_ENCODED_HEADER => return Err(SevenZipError::EncodedHeader),
        other => {
            return Err(SevenZipError::Corrupt(format!(
                "unexpected root property {other:#04x}"
            )));
        }
    }

    let mut streams = None;
    let mut files = None;
    loop {
        match r.u8()? {
            K_END => break,
            K_ARCHIVE_PROPERTIES => skip_archive_properties(&mut r)?,
            K_MAIN_STREAMS => streams = Some(parse_streams_info(&mut r)?),
            K_FILES_INFO => files = Some(parse_files_info(&mut r)?),
            K_ADDITIONAL_STREAMS => {
                return Err(SevenZipError::Unsupported("additional streams".into()));
            }
            other => {
                return Err(SevenZipError::Corrupt(format!(
                    "unexpected header property {other:#04x}"
                )));
            }
        }
    }

    let files = files.ok_or_else(|| SevenZipError::Corrupt("missing files info".into()))?;
    assemble(streams, files)
}

fn assemble(
    streams: Option<StreamsInfo>,
    files: FilesInfo,
) -> Result<SevenZipListing, SevenZipError> {
    let mut substreams = Vec::new();
    if let Some(info) = &streams {
        // Pack streams are consumed by folders in order; a folder's payload
        // begins where its first pack stream sits.
        let mut pack_cursor = 0usize;
        let mut pack_offset = SIGNATURE_HEADER_LEN + info.pack_pos;

        for (folder_idx, folder) in info.folders.iter().enumerate() {
            let folder_base = pack_offset;
            for _ in 0..folder.num_pack_streams {
                let size = info
                    .pack_sizes
                    .get(pack_cursor)
                    .ok_or_else(|| SevenZipError::Corrupt("missing pack size".into()))?;
                pack_offset += size;
                pack_cursor += 1;
            }

            let stored = folder.is_simple_copy();
            let mut local = 0u64;
            for size in info.substream_sizes(folder_idx)? {
                substreams.push(Substream {
                    size,
                    pack_offset: stored.then_some(folder_base + local),
                    is_stored: stored,
                });
                local += size;
            }
        }
    }

    let mut next = substreams.into_iter();
    let mut entries = Vec::with_capacity(files.names.len());
    for (name, empty) in files.names.into_iter().zip(files.empty_stream) {
        if empty {
            entries.push(SevenZipEntry {
                name,
                size: 0,
                pack_offset: None,
                is_stored: false,
            });
            continue;
        }
        let sub = next
            .next()
            .ok_or_else(|| SevenZipError::Corrupt("more files than substreams".into()))?;
        entries.push(SevenZipEntry {
            name,
            size: sub.size,
            pack_offset: sub.pack_offset,
            is_stored: sub.is_stored,
        });
    }

    Ok(SevenZipListing { entries })
}

struct Substream {
    size: u64,
    pack_offset: Option<u64>,
    is_stored: bool,
}

struct Coder {
    id: Vec<u8>,
    num_in: usize,
    num_out: usize,
}

struct Folder {
    coders: Vec<Coder>,
    /// Out-stream indices consumed by bind pairs.
    bound_out: Vec<bool>,
    num_pack_streams: usize,
    unpack_sizes: Vec<u64>,
}

impl Folder {
    fn is_simple_copy(&self) -> bool {
        self.coders.len() == 1
            && self.coders[0].id == COPY_CODER
            && self.coders[0].num_in == 1
            && self.coders[0].num_out == 1
    }

    /// Output size of the folder: the unpack size of the unbound out-stream.
    fn output_size(&self) -> Result<u64, SevenZipError> {
        self.bound_out
            .iter()
            .position(|&bound| !bound)
            .and_then(|i| self.unpack_sizes.get(i).copied())
            .ok_or_else(|| SevenZipError::Corrupt("folder has no output stream".into()))
    }
}

struct StreamsInfo {
    pack_pos: u64,
    pack_sizes: Vec<u64>,
    folders: Vec<Folder>,
    /// Substream counts per folder; `None` means one stream per folder.
    substream_counts: Option<Vec<usize>>,
    /// Explicit substream sizes, folder-major, excluding each folder's last.
    substream_sizes: Vec<u64>,
}

impl StreamsInfo {
    /// Resolve the substream sizes for one folder.
    fn substream_sizes(&self, folder_idx: usize) -> Result<Vec<u64>, SevenZipError> {
        let folder = &self.folders[folder_idx];
        let count = self
            .substream_counts
            .as_ref()
            .map_or(1, |c| c[folder_idx]);
        if count == 0 {
            return Ok(Vec::new());
        }
        if count == 1 {
            return Ok(vec![folder.output_size()?]);
        }

        // Explicit sizes are stored for all but the last substream of each
        // folder; reconstruct this folder's slice of them.
        let mut skip = 0usize;
        for idx in 0..folder_idx {
            let c = self.substream_counts.as_ref().map_or(1, |v| v[idx]);
            skip += c.saturating_sub(1);
        }
        let mut sizes = Vec::with_capacity(count);
        let mut used = 0u64;
        for i in 0..count - 1 {
            let size = *self
                .substream_sizes
                .get(skip + i)
                .ok_or_else(|| SevenZipError::Corrupt("missing substream size".into()))?;
            used += size;
            sizes.push(size);
        }
        let total = folder.output_size()?;
        sizes.push(total.checked_sub(used).ok_or_else(|| {
            SevenZipError::Corrupt("substream sizes exceed folder output".into())
        })?);
        Ok(sizes)
    }

    fn total_substreams(&self) -> usize {
        self.substream_counts
            .as_ref()
            .map_or(self.folders.len(), |c| c.iter().sum())
    }
}

fn parse_streams_info(r: &mut NumReader<'_>) -> Result<StreamsInfo, SevenZipError> {
    let mut info = StreamsInfo {
        pack_pos: 0,
        pack_sizes: Vec::new(),
        folders: Vec::new(),
        substream_counts: None,
        substream_sizes: Vec::new(),
    };

    loop {
        match r.u8()? {
            K_END => break,
            K_PACK_INFO => parse_pack_info(r, &mut info)?,
            K_UNPACK_INFO => parse_unpack_info(r, &mut info)?,
            K_SUBSTREAMS_INFO => parse_substreams_info(r, &mut info)?,
            other => {
                return Err(SevenZipError::Corrupt(format!(
                    "unexpected streams property {other:#04x}"
                )));
            }
        }
    }
    Ok(info)
}

fn parse_pack_info(r: &mut NumReader<'_>, info: &mut StreamsInfo) -> Result<(), SevenZipError> {
    info.pack_pos = r.num()?;
    let count = r.count()?;
    loop {
        match r.u8()? {
            K_END => break,
            K_SIZE => {
                for _ in 0..count {
                    info.pack_sizes.push(r.num()?);
                }
            }
            K_CRC => {
                skip_digests(r, count)?;
            }
            other => {
                return Err(SevenZipError::Corrupt(format!(
                    "unexpected pack property {other:#04x}"
                )));
            }
        }
    }
    Ok(())
}

fn parse_unpack_info(r: &mut NumReader<'_>, info: &mut StreamsInfo) -> Result<(), SevenZipError> {
    if r.u8()? != K_FOLDER {
        return Err(SevenZipError::Corrupt("unpack info without folders".into()));
    }
    let num_folders = r.count()?;
    if r.u8()? != 0 {
        return Err(SevenZipError::Unsupported("external folder data".into()));
    }
    for _ in 0..num_folders {
        info.folders.push(parse_folder(r)?);
    }

    if r.u8()? != K_CODERS_UNPACK_SIZE {
        return Err(SevenZipError::Corrupt("missing coder unpack sizes".into()));
    }
    for folder in &mut info.folders {
        for _ in 0..folder.bound_out.len() {
            folder.unpack_sizes.push(r.num()?);
        }
    }

    loop {
        match r.u8()? {
            K_END => break,
            K_CRC => skip_digests(r, num_folders)?,
            other => {
                return Err(SevenZipError::Corrupt(format!(
                    "unexpected unpack property {other:#04x}"
                )));
            }
        }
    }
    Ok(())
}

fn parse_folder(r: &mut NumReader<'_>) -> Result<Folder, SevenZipError> {
    let num_coders = r.count()?;
    if num_coders == 0 || num_coders > 64 {
        return Err(SevenZipError::Corrupt(format!("{num_coders} coders")));
    }

    let mut coders = Vec::with_capacity(num_coders);
    let mut total_in = 0usize;
    let mut total_out = 0usize;
    for _ in 0..num_coders {
        let flags = r.u8()?;
        let id = r.bytes(usize::from(flags & 0x0F))?.to_vec();
        let (num_in, num_out) = if flags & 0x10 != 0 {
            (r.count()?, r.count()?)
        } else {
            (1, 1)
        };
        if flags & 0x20 != 0 {
            let props = r.count()?;
            r.bytes(props)?;
        }
        total_in += num_in;
        total_out += num_out;
        coders.push(Coder {
            id,
            num_in,
            num_out,
        });
    }

    let num_bind_pairs = total_out - 1;
    let mut bound_out = vec![false; total_out];
    for _ in 0..num_bind_pairs {
        let _in_index = r.num()?;
        let out_index = r.count()?;
        *bound_out
            .get_mut(out_index)
            .ok_or_else(|| SevenZipError::Corrupt("bind pair out of range".into()))? = true;
    }

    let num_pack_streams = total_in - num_bind_pairs;
    if num_pack_streams > 1 {
        for _ in 0..num_pack_streams {
            r.num()?;
        }
    }

    Ok(Folder {
        coders,
        bound_out,
        num_pack_streams,
        unpack_sizes: Vec::new(),
    })
}

fn parse_substreams_info(
    r: &mut NumReader<'_>,
    info: &mut StreamsInfo,
) -> Result<(), SevenZipError> {
    loop {
        match r.u8()? {
            K_END => break,
            K_NUM_UNPACK_STREAM => {
                let mut counts = Vec::with_capacity(info.folders.len());
                for _ in 0..info.folders.len() {
                    counts.push(r.count()?);
                }
                info.substream_counts = Some(counts);
            }
            K_SIZE => {
                // Sizes for all but the last substream of every folder.
                let total: usize = (0..info.folders.len())
                    .map(|i| {
                        info.substream_counts
                            .as_ref()
                            .map_or(1, |c| c[i])
                            .saturating_sub(1)
                    })
                    .sum();
                for _ in 0..total {
                    info.substream_sizes.push(r.num()?);
                }
            }
            K_CRC => {
                // Digest count assumes no folder-level CRCs were recorded;
                // archives that mix both layouts are not produced by the
                // reference implementation for the store case.
                skip_digests(r, info.total_substreams())?;
            }
            other => {
                return Err(SevenZipError::Corrupt(format!(
                    "unexpected substream property {other:#04x}"
                )));
            }
        }
    }
    Ok(())
}

fn parse_files_info(r: &mut NumReader<'_>) -> Result<FilesInfo, SevenZipError> {
    let num_files = r.count()?;
    if num_files > 1 << 20 {
        return Err(SevenZipError::Corrupt(format!("{num_files} files")));
    }

    let mut names = None;
    let mut empty_stream = vec![false; num_files];
    loop {
        let id = r.u8()?;
        if id == K_END {
            break;
        }
        let size = r.count()?;
        let block = r.bytes(size)?;
        match id {
            K_EMPTY_STREAM => empty_stream = read_bit_vector(block, num_files)?,
            K_NAME => names = Some(parse_names(block, num_files)?),
            // Attributes, timestamps, anti flags and padding carry nothing
            // the scan needs.
            _ => {}
        }
    }

    Ok(FilesInfo {
        names: names.ok_or_else(|| SevenZipError::Corrupt("missing file names".into()))?,
        empty_stream,
    })
}

struct FilesInfo {
    names: Vec<String>,
    empty_stream: Vec<bool>,
}

fn parse_names(block: &[u8], num_files: usize) -> Result<Vec<String>, SevenZipError> {
    let (&external, rest) = block
        .split_first()
        .ok_or(SevenZipError::Truncated)?;
    if external != 0 {
        return Err(SevenZipError::Unsupported("external file names".into()));
    }
    if rest.len() % 2 != 0 {
        return Err(SevenZipError::Corrupt("odd-length name table".into()));
    }

    let mut names = Vec::with_capacity(num_files);
    let mut current = Vec::new();
    for chunk in rest.chunks_exact(2) {
        let unit = u16::from_le_bytes([chunk[0], chunk[1]]);
        if unit == 0 {
            names.push(String::from_utf16_lossy(&current).replace('\\', "/"));
            current.clear();
        } else {
            current.push(unit);
        }
    }
    if names.len() != num_files {
        return Err(SevenZipError::Corrupt(format!(
            "{} names for {num_files} files",
            names.len()
        )));
    }
    Ok(names)
}

fn read_bit_vector(block: &[u8], bits: usize) -> Result<Vec<bool>, SevenZipError> {
    if block.len() < bits.div_ceil(8) {
        return Err(SevenZipError::Truncated);
    }
    Ok((0..bits)
        .map(|i| block[i / 8] & (0x80 >> (i % 8)) != 0)
        .collect())
}

fn skip_archive_properties(r: &mut NumReader<'_>) -> Result<(), SevenZipError> {
    loop {
        let id = r.u8()?;
        if id == K_END {
            return Ok(());
        }
        let size = r.count()?;
        r.bytes(size)?;
    }
}

fn skip_digests(r: &mut NumReader<'_>, count: usize) -> Result<(), SevenZipError> {
    let all_defined = r.u8()?;
    let defined = if all_defined == 0 {
        read_bit_vector(r.bytes(count.div_ceil(8))?, count)?
    } else {
        vec![true; count]
    };
    let present = defined.iter().filter(|&&d| d).count();
    r.bytes(present * 4)?;
    Ok(())
}

/// Reader over the header blob with the 7z variable-width number encoding.
struct NumReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> NumReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self) -> Result<u8, SevenZipError> {
        let b = *self.buf.get(self.pos).ok_or(SevenZipError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], SevenZipError> {
        let end = self.pos.checked_add(n).ok_or(SevenZipError::Truncated)?;
        if end > self.buf.len() {
            return Err(SevenZipError::Truncated);
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    /// 7z number: the count of leading set bits in the first byte gives the
    /// number of little-endian extra bytes; the remaining low bits form the
    /// most significant part.
    fn num(&mut self) -> Result<u64, SevenZipError> {
        let first = self.u8()?;
        let mut mask = 0x80u8;
        let mut value = 0u64;
        for i in 0..8 {
            if first & mask == 0 {
                let high = u64::from(first & mask.wrapping_sub(1));
                value |= high << (8 * i);
                return Ok(value);
            }
            value |= u64::from(self.u8()?) << (8 * i);
            mask >>= 1;
        }
        Ok(value)
    }

    /// A number used as an in-memory count; bounded to keep allocations sane.
    fn count(&mut self) -> Result<usize, SevenZipError> {
        let v = self.num()?;
        usize::try_from(v)
            .ok()
            .filter(|&v| v <= 1 << 27)
            .ok_or_else(|| SevenZipError::Corrupt(format!("count {v} out of range")))
    }
}

#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixtures {
    //! Synthetic store-archive builder, shared with downstream crates' tests
    //! via the `test-fixtures` feature.

    use super::{
        K_CODERS_UNPACK_SIZE, K_END, K_FILES_INFO, K_FOLDER, K_HEADER, K_MAIN_STREAMS, K_NAME,
        K_PACK_INFO, K_SIZE, K_UNPACK_INFO, SIGNATURE,
    };

    /// Encode a 7z variable-width number.
    pub fn num(v: u64) -> Vec<u8> {
        for extra in 0..8u32 {
            if v < 1u64 << (7 * (extra + 1)) {
                let mut out = Vec::with_capacity(1 + extra as usize);
                let prefix = if extra == 0 {
                    0
                } else {
                    (0xFFu32 << (8 - extra)) as u8
                };
                out.push(prefix | (v >> (8 * extra)) as u8);
                for j in 0..extra {
                    out.push((v >> (8 * j)) as u8);
                }
                return out;
            }
        }
        let mut out = vec![0xFF];
        out.extend_from_slice(&v.to_le_bytes());
        out
    }

    /// A member to place in a synthetic archive.
    pub struct MemberFixture<'a> {
        pub name: &'a str,
        pub data: &'a [u8],
        /// Coder id; `[0x00]` is Copy. Anything else marks the folder as
        /// compressed (the payload is then stored verbatim anyway, which is
        /// fine for listing tests).
        pub coder_id: &'a [u8],
    }

    impl<'a> MemberFixture<'a> {
        pub fn stored(name: &'a str, data: &'a [u8]) -> Self {
            Self {
                name,
                data,
                coder_id: &[0x00],
            }
        }
    }

    /// Build a non-solid archive: one single-coder folder per member.
    pub fn store_archive(members: &[MemberFixture<'_>]) -> Vec<u8> {
        let payload: Vec<u8> = members.iter().flat_map(|m| m.data.iter().copied()).collect();

        let mut header = vec![K_HEADER];

        header.push(K_MAIN_STREAMS);
        header.push(K_PACK_INFO);
        header.extend_from_slice(&num(0)); // pack position
        header.extend_from_slice(&num(members.len() as u64));
        header.push(K_SIZE);
        for m in members {
            header.extend_from_slice(&num(m.data.len() as u64));
        }
        header.push(K_END);

        header.push(K_UNPACK_INFO);
        header.push(K_FOLDER);
        header.extend_from_slice(&num(members.len() as u64));
        header.push(0); // not external
        for m in members {
            header.extend_from_slice(&num(1)); // one coder
            header.push(m.coder_id.len() as u8); // simple coder, id size
            header.extend_from_slice(m.coder_id);
        }
        header.push(K_CODERS_UNPACK_SIZE);
        for m in members {
            header.extend_from_slice(&num(m.data.len() as u64));
        }
        header.push(K_END);
        header.push(K_END);

        header.push(K_FILES_INFO);
        header.extend_from_slice(&num(members.len() as u64));
        let mut name_table = vec![0u8]; // not external
        for m in members {
            for unit in m.name.encode_utf16() {
                name_table.extend_from_slice(&unit.to_le_bytes());
            }
            name_table.extend_from_slice(&[0, 0]);
        }
        header.push(K_NAME);
        header.extend_from_slice(&num(name_table.len() as u64));
        header.extend_from_slice(&name_table);
        header.push(K_END);
        header.push(K_END);

        assemble(&payload, &header)
    }

    /// Wrap a payload and header blob in a signature header.
    pub fn assemble(payload: &[u8], header: &[u8]) -> Vec<u8> {
        let mut start_header = Vec::with_capacity(20);
        start_header.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        start_header.extend_from_slice(&(header.len() as u64).to_le_bytes());
        start_header.extend_from_slice(&crc32fast::hash(header).to_le_bytes());

        let mut out = Vec::new();
        out.extend_from_slice(&SIGNATURE);
        out.extend_from_slice(&[0, 4]); // format version
        out.extend_from_slice(&crc32fast::hash(&start_header).to_le_bytes());
        out.extend_from_slice(&start_header);
        out.extend_from_slice(payload);
        out.extend_from_slice(header);
        out
    }
}
