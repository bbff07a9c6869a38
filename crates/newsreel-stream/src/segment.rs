//! Segment spans within a file's logical decoded stream.

use newsreel_formats::nzb::SegmentSpec;

/// One article segment with its span in the logical decoded byte stream.
///
/// Spans start out derived from encoded sizes and are replaced once the
/// decoded-size probe has run.
#[derive(Debug, Clone)]
pub struct Segment {
    pub message_id: String,
    pub number: u32,
    pub encoded_size: u64,
    /// Inclusive start offset in the logical stream.
    pub start: u64,
    /// Exclusive end offset in the logical stream.
    pub end: u64,
}

impl Segment {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Initial layout straight from the manifest's encoded byte counts.
pub(crate) fn initial_layout(specs: &[SegmentSpec]) -> Vec<Segment> {
    let mut offset = 0u64;
    specs
        .iter()
        .map(|spec| {
            let start = offset;
            offset += spec.encoded_size;
            Segment {
                message_id: spec.message_id.clone(),
                number: spec.number,
                encoded_size: spec.encoded_size,
                start,
                end: offset,
            }
        })
        .collect()
}

/// Re-layout after the decoded-size probe of segment 0.
///
/// All segments but the last adopt the probed decoded size; the last is
/// scaled by the encoded ratio so an over-declared trailing segment cannot
/// inflate the total.
pub(crate) fn apply_decoded_size(segments: &mut [Segment], decoded: u64) {
    let Some(encoded0) = segments.first().map(|s| s.encoded_size.max(1)) else {
        return;
    };
    let count = segments.len();
    let mut offset = 0u64;
    for (idx, segment) in segments.iter_mut().enumerate() {
        let len = if idx + 1 == count && count > 1 {
            scale(segment.encoded_size, decoded, encoded0)
        } else {
            decoded
        };
        segment.start = offset;
        segment.end = offset + len;
        offset = segment.end;
    }
}

/// `ceil(value * decoded / encoded0)` without intermediate overflow.
fn scale(value: u64, decoded: u64, encoded0: u64) -> u64 {
    let numerator = u128::from(value) * u128::from(decoded);
    let denominator = u128::from(encoded0);
    numerator.div_ceil(denominator) as u64
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn specs(sizes: &[u64]) -> Vec<SegmentSpec> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, &encoded_size)| SegmentSpec {
                message_id: format!("seg{i}@test"),
                number: i as u32 + 1,
                encoded_size,
            })
            .collect()
    }

    #[test]
    fn initial_layout_uses_encoded_sizes() {
        let segments = initial_layout(&specs(&[400_000, 400_000, 200_000]));
        assert_eq!(segments[0].start, 0);
        assert_eq!(segments[0].end, 400_000);
        assert_eq!(segments[2].start, 800_000);
        assert_eq!(segments[2].end, 1_000_000);
    }

    #[test]
    fn probe_relayout_scales_trailing_segment() {
        let mut segments = initial_layout(&specs(&[400_000, 400_000, 200_000]));
        apply_decoded_size(&mut segments, 384_000);

        assert_eq!(segments[0].len(), 384_000);
        assert_eq!(segments[1].len(), 384_000);
        assert_eq!(segments[2].len(), 192_000);
        assert_eq!(segments[2].end, 960_000);
    }

    #[test]
    fn single_segment_adopts_probe_directly() {
        let mut segments = initial_layout(&specs(&[200_000]));
        apply_decoded_size(&mut segments, 190_500);
        assert_eq!(segments[0].len(), 190_500);
    }

    #[test]
    fn trailing_scale_rounds_up() {
        let mut segments = initial_layout(&specs(&[3, 2]));
        apply_decoded_size(&mut segments, 2);
        // ceil(2 * 2 / 3) = 2
        assert_eq!(segments[1].len(), 2);
        assert_eq!(segments[1].end, 4);
    }

    #[test]
    fn relayout_is_idempotent() {
        let mut segments = initial_layout(&specs(&[400_000, 200_000]));
        apply_decoded_size(&mut segments, 384_000);
        let first = segments.clone();
        apply_decoded_size(&mut segments, 384_000);
        assert_eq!(segments[1].end, first[1].end);
    }
}
