//! Archive blueprints: from a pile of volume files to a byte-range plan.
//!
//! The scan never reads archive payload data. It classifies volumes by
//! name, header-scans first volumes in parallel, gates on compression,
//! picks the main inner file, and reconstructs mid-volume ranges blindly:
//! many scanners reject out-of-order volume access, and uncompressed
//! multi-volume RAR continues header-free, so trailing volumes are mapped
//! whole.
//!
//! When a scan finds archives *inside* the archive, the inner volumes are
//! materialized as [`VirtualFile`]s over the outer ones and the scan
//! recurses.

use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::traits::{ConcatSource, FileByteSource, StreamableFile};
use crate::virtual_file::{VirtualFile, VirtualPart, slice_parts};
use crate::virtual_stream::VirtualStream;
use futures::StreamExt;
use newsreel_formats::rar::{self, RarError};
use newsreel_formats::sevenzip::{self, SevenZipError};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Inner files larger than this are main-candidates even without a video
/// extension.
const MAIN_SIZE_FLOOR: u64 = 50 * 1024 * 1024;

/// Packed/unpacked ratio below which a part counts as compressed.
const STORE_RATIO: f64 = 0.95;

/// Archive-in-archive recursion bound.
const MAX_NESTING: usize = 3;

const VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "m2ts", "ts", "mov", "wmv", "mpg", "mpeg", "vob", "webm", "flv",
];

/// An immutable byte-range plan for streaming one inner file out of a set
/// of archive volumes. Cacheable per session; opening a stream is cheap.
#[derive(Clone, Debug)]
pub struct ArchiveBlueprint {
    pub file_name: String,
    pub total_size: u64,
    pub parts: Vec<VirtualPart>,
}

impl ArchiveBlueprint {
    /// Plan for a bare, unarchived file: one part covering everything.
    pub async fn passthrough(
        file: Arc<dyn StreamableFile>,
        token: &CancellationToken,
    ) -> Result<Self> {
        let total_size = file.size(token).await?;
        let file_name = file.name().to_string();
        Ok(Self {
            file_name,
            total_size,
            parts: vec![VirtualPart {
                start: 0,
                end: total_size,
                source: file,
                source_offset: 0,
            }],
        })
    }

    /// Open a seekable stream over the plan.
    pub fn open_stream(&self, parent: &CancellationToken, config: &StreamConfig) -> VirtualStream {
        VirtualStream::open(self.parts.clone(), self.total_size, parent, config)
    }
}

/// Build a blueprint for a release's files.
pub async fn scan(
    files: &[Arc<dyn StreamableFile>],
    token: &CancellationToken,
    config: &StreamConfig,
) -> Result<ArchiveBlueprint> {
    scan_nested(files, token, config, 0).await
}

async fn scan_nested(
    files: &[Arc<dyn StreamableFile>],
    token: &CancellationToken,
    config: &StreamConfig,
    depth: usize,
) -> Result<ArchiveBlueprint> {
    if depth > MAX_NESTING {
        return Err(StreamError::NoMedia);
    }

    let candidates = gather_candidates(files, token).await?;
    if candidates.is_empty() {
        return Err(StreamError::NoMedia);
    }

    let has_rar = candidates.iter().any(|c| c.kind.is_rar_family());
    if !has_rar {
        return scan_7z(&candidates, config).await;
    }
    scan_rar(&candidates, token, config, depth).await
}

async fn scan_rar(
    candidates: &[Candidate],
    token: &CancellationToken,
    config: &StreamConfig,
    depth: usize,
) -> Result<ArchiveBlueprint> {
    let first_volumes: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.kind.is_first_volume())
        .map(|(idx, _)| idx)
        .collect();

    // Parallel header scan, bounded. Volumes that turn out not to be RAR
    // (stray split parts, zip spans) are skipped; real failures surface.
    let scans: Vec<(usize, std::result::Result<rar::VolumeScan, RarError>)> =
        futures::stream::iter(first_volumes.into_iter().map(|idx| {
            let source = candidates[idx].source.clone();
            async move { (idx, rar::scan_volume(source.as_ref()).await) }
        }))
        .buffer_unordered(config.scan_concurrency.max(1))
        .collect()
        .await;

    let mut records: Vec<PartRecord> = Vec::new();
    for (vol_idx, outcome) in scans {
        match outcome {
            Ok(scan) => {
                for entry in scan.entries {
                    records.push(PartRecord::new(vol_idx, &candidates[vol_idx], entry));
                }
            }
            Err(RarError::NotRar) => {
                trace!(volume = %candidates[vol_idx].name, "not a RAR volume, skipped");
            }
            Err(error) => return Err(error.into()),
        }
    }
    if records.is_empty() {
        return Err(StreamError::NoMedia);
    }

    // Compression gate. Split parts report the file's full unpacked size
    // against one volume's packed span, so the ratio only means something
    // for whole parts.
    for record in &records {
        if record.is_whole() && record.is_compressed() {
            return Err(StreamError::CompressedArchiveUnsupported(
                record.inner_name.clone(),
            ));
        }
    }

    if let Some(main_name) = select_main(&records) {
        debug!(main = %main_name, depth, "archive main selected");
        return assemble_main(candidates, &records, &main_name);
    }

    // No direct main: look for nested archive volumes.
    let nested = nested_virtual_files(candidates, &records)?;
    if nested.is_empty() {
        return Err(StreamError::NoMedia);
    }
    debug!(volumes = nested.len(), depth, "recursing into nested archive");
    let inner: Vec<Arc<dyn StreamableFile>> = nested
        .into_iter()
        .map(|vf| Arc::new(vf) as Arc<dyn StreamableFile>)
        .collect();
    Box::pin(scan_nested(&inner, token, config, depth + 1)).await
}

/// Aggregate main-candidate packed sizes per inner name; largest total wins.
fn select_main(records: &[PartRecord]) -> Option<String> {
    let mut totals: BTreeMap<&str, u64> = BTreeMap::new();
    for record in records {
        if record.is_main_candidate() {
            *totals.entry(record.inner_name.as_str()).or_default() += record.packed_size;
        }
    }
    totals
        .into_iter()
        .max_by_key(|&(_, total)| total)
        .map(|(name, _)| name.to_string())
}

fn assemble_main(
    candidates: &[Candidate],
    records: &[PartRecord],
    main_name: &str,
) -> Result<ArchiveBlueprint> {
    let mut main_records: Vec<&PartRecord> = records
        .iter()
        .filter(|r| r.inner_name == main_name)
        .collect();
    main_records.sort_by(|a, b| a.vol_name.cmp(&b.vol_name));

    let unpacked = main_records
        .first()
        .map(|r| r.unpacked_size)
        .unwrap_or_default();

    let mut parts = Vec::new();
    let mut offset = 0u64;
    let mut scanned_volumes = HashSet::new();
    for record in &main_records {
        scanned_volumes.insert(record.vol_idx);
        parts.push(VirtualPart {
            start: offset,
            end: offset + record.packed_size,
            source: candidates[record.vol_idx].file.clone(),
            source_offset: record.data_offset,
        });
        offset += record.packed_size;
    }

    // Blind continuation: volumes of the set beyond the scanned first
    // volume carry raw payload from offset zero.
    let set_stem = main_records
        .first()
        .map(|r| candidates[r.vol_idx].stem.clone())
        .unwrap_or_default();
    let mut set_volumes: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| c.stem == set_stem && c.kind.is_rar_family())
        .collect();
    set_volumes.sort_by_key(|c| c.order);
    for volume in set_volumes {
        if scanned_volumes.contains(&volume.index) {
            continue;
        }
        trace!(volume = %volume.name, "appending blind continuation part");
        parts.push(VirtualPart {
            start: offset,
            end: offset + volume.size,
            source: volume.file.clone(),
            source_offset: 0,
        });
        offset += volume.size;
    }

    // The first header's unpacked size is authoritative, clamped by what
    // the volumes can actually supply.
    let total_size = unpacked.min(offset);
    let parts = clamp_parts(parts, total_size);

    Ok(ArchiveBlueprint {
        file_name: base_name(main_name).to_string(),
        total_size,
        parts,
    })
}

/// Group nested archive entries into volume sets, pick the largest set, and
/// materialize one virtual file per inner volume.
fn nested_virtual_files(
    candidates: &[Candidate],
    records: &[PartRecord],
) -> Result<Vec<VirtualFile>> {
    let mut sets: BTreeMap<String, Vec<&PartRecord>> = BTreeMap::new();
    for record in records {
        if let Some((stem, _)) = classify(&record.inner_name) {
            sets.entry(stem).or_default().push(record);
        }
    }
    let Some((_, set_records)) = sets
        .into_iter()
        .max_by_key(|(_, records)| records.iter().map(|r| r.packed_size).sum::<u64>())
    else {
        return Ok(Vec::new());
    };

    let mut names: Vec<&str> = set_records
        .iter()
        .map(|r| r.inner_name.as_str())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    names.sort_unstable();

    let mut virtual_files = Vec::with_capacity(names.len());
    for name in names {
        let mut offset = 0u64;
        let mut parts = Vec::new();
        for record in set_records.iter().filter(|r| r.inner_name == name) {
            parts.push(VirtualPart {
                start: offset,
                end: offset + record.packed_size,
                source: candidates[record.vol_idx].file.clone(),
                source_offset: record.data_offset,
            });
            offset += record.packed_size;
        }
        virtual_files.push(VirtualFile::new(base_name(name), parts)?);
    }
    Ok(virtual_files)
}

/// 7z path: a concatenated view across all volumes of the largest set, the
/// store listing, and a byte-range slice for the chosen member.
async fn scan_7z(candidates: &[Candidate], _config: &StreamConfig) -> Result<ArchiveBlueprint> {
    let mut sets: BTreeMap<&str, Vec<&Candidate>> = BTreeMap::new();
    for candidate in candidates {
        if candidate.kind.is_seven_zip_family() {
            sets.entry(candidate.stem.as_str()).or_default().push(candidate);
        }
    }
    let Some((set_name, mut volumes)) = sets
        .into_iter()
        .max_by_key(|(_, volumes)| volumes.iter().map(|v| v.size).sum::<u64>())
    else {
        return Err(StreamError::NoMedia);
    };
    volumes.sort_by_key(|v| v.order);

    let concat = ConcatSource::new(
        set_name,
        volumes.iter().map(|v| v.source.clone()).collect(),
    );
    let listing = match sevenzip::list_archive(&concat).await {
        Ok(listing) => listing,
        Err(SevenZipError::EncodedHeader) => {
            return Err(StreamError::CompressedArchiveUnsupported(
                set_name.to_string(),
            ));
        }
        Err(error) => return Err(error.into()),
    };

    let mut best: Option<&sevenzip::SevenZipEntry> = None;
    let mut compressed_video_seen = false;
    for entry in &listing.entries {
        if !is_video(&entry.name) {
            continue;
        }
        if !entry.is_stored || entry.pack_offset.is_none() {
            compressed_video_seen = true;
            continue;
        }
        let better = match best {
            None => true,
            Some(current) => match (is_sample(&current.name), is_sample(&entry.name)) {
                (true, false) => true,
                (false, true) => false,
                _ => entry.size > current.size,
            },
        };
        if better {
            best = Some(entry);
        }
    }
    let Some(member) = best else {
        if compressed_video_seen {
            return Err(StreamError::CompressedArchiveUnsupported(
                set_name.to_string(),
            ));
        }
        return Err(StreamError::NoMedia);
    };

    // Map the member's range in the concatenated address space back onto
    // the volumes with the part-mapping primitive.
    let mut offset = 0u64;
    let mut volume_parts = Vec::with_capacity(volumes.len());
    for volume in &volumes {
        volume_parts.push(VirtualPart {
            start: offset,
            end: offset + volume.size,
            source: volume.file.clone(),
            source_offset: 0,
        });
        offset += volume.size;
    }
    let member_offset = member.pack_offset.unwrap_or_default();
    let parts = slice_parts(&volume_parts, member_offset, member.size);

    debug!(member = %member.name, size = member.size, "7z member selected");
    Ok(ArchiveBlueprint {
        file_name: base_name(&member.name).to_string(),
        total_size: member.size,
        parts,
    })
}

fn clamp_parts(parts: Vec<VirtualPart>, total: u64) -> Vec<VirtualPart> {
    let mut out = Vec::with_capacity(parts.len());
    for mut part in parts {
        if part.start >= total {
            break;
        }
        if part.end > total {
            part.end = total;
        }
        out.push(part);
    }
    out
}

// --- volume classification ---------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VolumeKind {
    /// `name.rar`
    PlainRar,
    /// `name.partNN.rar`
    PartRar { part: u32 },
    /// `name.rNN`
    RarSequence { seq: u32 },
    /// `name.NNN`
    NumericSplit { seq: u32 },
    /// `name.zNN`
    ZipSequence { seq: u32 },
    /// `name.7z`
    SevenZip,
    /// `name.7z.NNN`
    SevenZipSplit { seq: u32 },
    /// Matched the filter (`*.part*`) but no recognized volume extension.
    Other,
}

impl VolumeKind {
    fn is_rar_family(self) -> bool {
        matches!(
            self,
            Self::PlainRar
                | Self::PartRar { .. }
                | Self::RarSequence { .. }
                | Self::NumericSplit { .. }
                | Self::Other
        )
    }

    fn is_seven_zip_family(self) -> bool {
        matches!(self, Self::SevenZip | Self::SevenZipSplit { .. })
    }

    /// Middle volumes are excluded from header scanning: `.partK.rar` with
    /// `K != 1` and `.rNN` with `NN != 00`.
    fn is_first_volume(self) -> bool {
        match self {
            Self::PartRar { part } => part == 1,
            Self::RarSequence { seq } => seq == 0,
            Self::ZipSequence { .. } => false,
            _ => true,
        }
    }

    /// Ordering rank within a volume set.
    fn order(self) -> (u8, u32) {
        match self {
            Self::PlainRar | Self::SevenZip => (0, 0),
            Self::PartRar { part } => (1, part),
            Self::RarSequence { seq } => (2, seq),
            Self::ZipSequence { seq } => (2, seq),
            Self::NumericSplit { seq } | Self::SevenZipSplit { seq } => (3, seq),
            Self::Other => (4, 0),
        }
    }
}

struct Candidate {
    index: usize,
    file: Arc<dyn StreamableFile>,
    source: Arc<FileByteSource>,
    name: String,
    stem: String,
    kind: VolumeKind,
    order: (u8, u32),
    size: u64,
}

async fn gather_candidates(
    files: &[Arc<dyn StreamableFile>],
    token: &CancellationToken,
) -> Result<Vec<Candidate>> {
    let mut candidates = Vec::new();
    for file in files {
        let name = file.name().to_string();
        let Some((stem, kind)) = classify(&name) else {
            continue;
        };
        // Sizing may probe segment 0 of a remote volume.
        let source = Arc::new(FileByteSource::new(file.clone(), token).await?);
        let size = newsreel_formats::source::ByteSource::size(source.as_ref());
        candidates.push(Candidate {
            index: candidates.len(),
            file: file.clone(),
            source,
            name,
            stem,
            kind,
            order: kind.order(),
            size,
        });
    }
    Ok(candidates)
}

/// Classify a file name as an archive volume: `(set stem, kind)`.
///
/// Filter policy: RAR volumes, `.part*` names, `.rNN`/`.zNN`/`.NNN` split
/// extensions and the 7z family are in; `.par2` is out.
fn classify(name: &str) -> Option<(String, VolumeKind)> {
    let lower = base_name(name).to_ascii_lowercase();
    if lower.ends_with(".par2") {
        return None;
    }

    if let Some(stem) = lower.strip_suffix(".rar") {
        if let Some((set, part)) = split_part_suffix(stem) {
            return Some((set, VolumeKind::PartRar { part }));
        }
        return Some((stem.to_string(), VolumeKind::PlainRar));
    }
    if lower.ends_with(".7z") {
        return Some((lower.clone(), VolumeKind::SevenZip));
    }
    if let Some((stem, ext)) = lower.rsplit_once('.') {
        if let Some(seq) = parse_seq(ext, 'r') {
            return Some((stem.to_string(), VolumeKind::RarSequence { seq }));
        }
        if let Some(seq) = parse_seq(ext, 'z') {
            return Some((stem.to_string(), VolumeKind::ZipSequence { seq }));
        }
        if ext.len() == 3 && ext.chars().all(|c| c.is_ascii_digit()) {
            let seq = ext.parse().unwrap_or(0);
            if stem.ends_with(".7z") {
                return Some((stem.to_string(), VolumeKind::SevenZipSplit { seq }));
            }
            return Some((stem.to_string(), VolumeKind::NumericSplit { seq }));
        }
    }
    if lower.contains(".part") {
        return Some((lower.clone(), VolumeKind::Other));
    }
    None
}

/// `movie.part02` -> `("movie", 2)`.
fn split_part_suffix(stem: &str) -> Option<(String, u32)> {
    let at = stem.rfind(".part")?;
    let digits = &stem[at + 5..];
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((stem[..at].to_string(), digits.parse().ok()?))
}

/// `r42` -> 42 for prefix 'r'.
fn parse_seq(ext: &str, prefix: char) -> Option<u32> {
    let rest = ext.strip_prefix(prefix)?;
    if rest.len() == 2 && rest.chars().all(|c| c.is_ascii_digit()) {
        rest.parse().ok()
    } else {
        None
    }
}

fn base_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

fn extension(name: &str) -> Option<String> {
    base_name(name)
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
}

fn is_video(name: &str) -> bool {
    extension(name).is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
}

fn is_sample(name: &str) -> bool {
    base_name(name).to_ascii_lowercase().contains("sample")
}

/// Extensions that can never be the main media file.
fn is_archive_or_parity(name: &str) -> bool {
    if classify(name).is_some() {
        return true;
    }
    let lower = base_name(name).to_ascii_lowercase();
    lower.ends_with(".par2")
        || lower.ends_with(".zip")
        || lower.ends_with(".sfv")
        || lower.ends_with(".nzb")
}

// --- scan records -------------------------------------------------------

struct PartRecord {
    inner_name: String,
    vol_idx: usize,
    vol_name: String,
    packed_size: u64,
    unpacked_size: u64,
    data_offset: u64,
    split_before: bool,
    split_after: bool,
}

impl PartRecord {
    fn new(vol_idx: usize, candidate: &Candidate, entry: rar::RarEntry) -> Self {
        Self {
            inner_name: entry.name,
            vol_idx,
            vol_name: candidate.name.clone(),
            packed_size: entry.packed_size,
            unpacked_size: entry.unpacked_size,
            data_offset: entry.data_offset,
            split_before: entry.split_before,
            split_after: entry.split_after,
        }
    }

    fn is_whole(&self) -> bool {
        !self.split_before && !self.split_after
    }

    fn is_compressed(&self) -> bool {
        (self.packed_size as f64) < (self.unpacked_size as f64) * STORE_RATIO
    }

    fn is_main_candidate(&self) -> bool {
        is_video(&self.inner_name)
            || (self.unpacked_size > MAIN_SIZE_FLOOR && !is_archive_or_parity(&self.inner_name))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testutil::MemoryFile;
    use newsreel_formats::rar::fixtures::{FileFixture, rar4_volume};
    use newsreel_formats::sevenzip::fixtures::{MemberFixture, store_archive};
    use pretty_assertions::assert_eq;

    fn mem(name: &str, data: Vec<u8>) -> Arc<dyn StreamableFile> {
        Arc::new(MemoryFile::new(name, data))
    }

    async fn read_all(blueprint: &ArchiveBlueprint) -> Vec<u8> {
        let token = CancellationToken::new();
        let config = StreamConfig {
            chunk_size: 1024,
            ..StreamConfig::default()
        };
        let mut stream = blueprint.open_stream(&token, &config);
        let mut out = Vec::new();
        let mut buf = [0u8; 1500];
        loop {
            let n = stream.read(&mut buf).await.expect("Operation should succeed");
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn classification_covers_volume_families() {
        assert_eq!(
            classify("Movie.PART01.rar"),
            Some(("movie".to_string(), VolumeKind::PartRar { part: 1 }))
        );
        assert_eq!(
            classify("movie.part12.rar"),
            Some(("movie".to_string(), VolumeKind::PartRar { part: 12 }))
        );
        assert_eq!(
            classify("movie.rar"),
            Some(("movie".to_string(), VolumeKind::PlainRar))
        );
        assert_eq!(
            classify("movie.r07"),
            Some(("movie".to_string(), VolumeKind::RarSequence { seq: 7 }))
        );
        assert_eq!(
            classify("movie.7z.002"),
            Some(("movie.7z".to_string(), VolumeKind::SevenZipSplit { seq: 2 }))
        );
        assert_eq!(classify("movie.par2"), None);
        assert_eq!(classify("movie.mkv"), None);
    }

    #[test]
    fn middle_volumes_are_not_scanned() {
        assert!(VolumeKind::PartRar { part: 1 }.is_first_volume());
        assert!(!VolumeKind::PartRar { part: 2 }.is_first_volume());
        assert!(VolumeKind::RarSequence { seq: 0 }.is_first_volume());
        assert!(!VolumeKind::RarSequence { seq: 1 }.is_first_volume());
        assert!(VolumeKind::PlainRar.is_first_volume());
    }

    #[tokio::test]
    async fn single_volume_store_archive() {
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 256) as u8).collect();
        let volume = rar4_volume(&[FileFixture::stored("movie.mkv", &payload)]);
        let files = vec![mem("release.rar", volume)];

        let token = CancellationToken::new();
        let blueprint = scan(&files, &token, &StreamConfig::default())
            .await
            .expect("Operation should succeed");

        assert_eq!(blueprint.file_name, "movie.mkv");
        assert_eq!(blueprint.total_size, 4096);
        assert_eq!(read_all(&blueprint).await, payload);
    }

    #[tokio::test]
    async fn multi_volume_appends_blind_parts() {
        let full: Vec<u8> = (0..9000u32).map(|i| (i % 251) as u8).collect();
        let mut first = FileFixture::stored("movie.mkv", &full[..3000]);
        first.unpacked_size = 9000;
        first.split_after = true;
        let volume0 = rar4_volume(&[first]);
        // Continuation volumes are mapped raw from offset zero.
        let files = vec![
            mem("movie.rar", volume0),
            mem("movie.r00", full[3000..6000].to_vec()),
            mem("movie.r01", full[6000..9000].to_vec()),
        ];

        let token = CancellationToken::new();
        let blueprint = scan(&files, &token, &StreamConfig::default())
            .await
            .expect("Operation should succeed");

        assert_eq!(blueprint.total_size, 9000);
        assert_eq!(blueprint.parts.len(), 3);
        assert_eq!(read_all(&blueprint).await, full);
    }

    #[tokio::test]
    async fn compressed_part_is_rejected() {
        let payload = vec![0u8; 1000];
        let mut fixture = FileFixture::stored("movie.mkv", &payload);
        fixture.unpacked_size = 60 * 1024 * 1024; // looks heavily compressed
        fixture.method = 0x33;
        let volume = rar4_volume(&[fixture]);
        let files = vec![mem("release.rar", volume)];

        let token = CancellationToken::new();
        let err = scan(&files, &token, &StreamConfig::default())
            .await
            .expect_err("Test operation should fail");
        assert!(matches!(
            err,
            StreamError::CompressedArchiveUnsupported(name) if name == "movie.mkv"
        ));
    }

    #[tokio::test]
    async fn par2_files_are_ignored() {
        let files = vec![mem("release.par2", vec![0u8; 128])];
        let token = CancellationToken::new();
        let err = scan(&files, &token, &StreamConfig::default())
            .await
            .expect_err("Test operation should fail");
        assert!(matches!(err, StreamError::NoMedia));
    }

    #[tokio::test]
    async fn nested_archive_recurses_through_virtual_files() {
        // movie.mkv inside nested.rar+nested.r00, themselves inside an
        // outer single-volume RAR.
        let movie: Vec<u8> = (0..6000u32).map(|i| (i % 249) as u8).collect();
        let mut inner_first = FileFixture::stored("movie.mkv", &movie[..2500]);
        inner_first.unpacked_size = 6000;
        inner_first.split_after = true;
        let nested_rar = rar4_volume(&[inner_first]);
        let nested_r00 = movie[2500..].to_vec();

        let outer = rar4_volume(&[
            FileFixture::stored("nested.rar", &nested_rar),
            FileFixture::stored("nested.r00", &nested_r00),
        ]);
        let files = vec![mem("outer.rar", outer)];

        let token = CancellationToken::new();
        let blueprint = scan(&files, &token, &StreamConfig::default())
            .await
            .expect("Operation should succeed");

        assert_eq!(blueprint.file_name, "movie.mkv");
        assert_eq!(blueprint.total_size, 6000);
        assert_eq!(read_all(&blueprint).await, movie);
    }

    #[tokio::test]
    async fn seven_zip_store_member_is_sliced_across_volumes() {
        let clip: Vec<u8> = (0..5000u32).map(|i| (i % 241) as u8).collect();
        let archive = store_archive(&[
            MemberFixture::stored("sample/clip.mkv", &clip[..100]),
            MemberFixture::stored("movie.mkv", &clip),
        ]);
        // Split the archive bytes across two volumes.
        let cut = archive.len() / 2;
        let files = vec![
            mem("release.7z.001", archive[..cut].to_vec()),
            mem("release.7z.002", archive[cut..].to_vec()),
        ];

        let token = CancellationToken::new();
        let blueprint = scan(&files, &token, &StreamConfig::default())
            .await
            .expect("Operation should succeed");

        assert_eq!(blueprint.file_name, "movie.mkv");
        assert_eq!(blueprint.total_size, 5000);
        assert_eq!(read_all(&blueprint).await, clip);
    }

    #[tokio::test]
    async fn passthrough_covers_bare_files() {
        let data = vec![3u8; 2048];
        let file = mem("movie.mkv", data.clone());
        let token = CancellationToken::new();

        let blueprint = ArchiveBlueprint::passthrough(file, &token)
            .await
            .expect("Operation should succeed");
        assert_eq!(blueprint.total_size, 2048);
        assert_eq!(read_all(&blueprint).await, data);
    }
}
